//! Change records on mutated workloads.
//!
//! Every mutation the controller installs is tagged on the workload
//! itself: the `koney/changes-annotation` annotation carries a JSON
//! array of records describing what was deployed, by which policy and
//! strategy, into which containers, and when. The records are the
//! ground truth for decoy deduplication (at most one decoy per
//! container and file path), for rollout observation, and for
//! uninstall, which must work even when the policy spec has drifted
//! since creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::{DecoyStrategy, CHANGES_ANNOTATION_KEY};
use crate::cluster::ObjectMeta;

/// Errors reading or writing the changes annotation.
#[derive(Debug, Error)]
pub enum ChangesError {
    /// The stored annotation is not valid JSON.
    #[error("malformed {CHANGES_ANNOTATION_KEY} annotation: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One deployed change on a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Name of the policy the change belongs to.
    pub deception_policy_name: String,

    /// Full identity token of the trap.
    pub trap_id: String,

    /// Decoy path inside the containers.
    pub file_path: String,

    /// Strategy that installed the decoy.
    pub strategy: DecoyStrategy,

    /// Containers the decoy reaches.
    pub containers: Vec<String>,

    /// Pods already covered; runtime-injection strategies consult this
    /// to reach only replicas that appeared since the last pass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<String>,

    /// Secret backing the decoy content, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    /// When the change was applied.
    pub deployed_at: DateTime<Utc>,

    /// When every replica carried the change; null until the rollout
    /// completes (spec-patching strategies only).
    #[serde(default)]
    pub rolled_out_at: Option<DateTime<Utc>>,
}

/// Read the change records from a workload's annotations.
///
/// # Errors
///
/// Returns [`ChangesError::Malformed`] when the annotation exists but
/// does not parse.
pub fn read_records(meta: &ObjectMeta) -> Result<Vec<ChangeRecord>, ChangesError> {
    match meta.annotations.get(CHANGES_ANNOTATION_KEY) {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(Vec::new()),
    }
}

/// Write the change records onto a workload's annotations. An empty
/// list removes the annotation entirely.
///
/// # Errors
///
/// Returns [`ChangesError::Malformed`] when serialization fails.
pub fn write_records(meta: &mut ObjectMeta, records: &[ChangeRecord]) -> Result<(), ChangesError> {
    if records.is_empty() {
        meta.annotations.remove(CHANGES_ANNOTATION_KEY);
    } else {
        meta.annotations
            .insert(CHANGES_ANNOTATION_KEY.to_string(), serde_json::to_string(records)?);
    }
    Ok(())
}

/// Whether any record already covers the given file path, regardless of
/// policy or strategy. Guards the one-decoy-per-path invariant.
#[must_use]
pub fn path_is_occupied(records: &[ChangeRecord], file_path: &str) -> bool {
    records.iter().any(|r| r.file_path == file_path)
}

/// The record a policy deployed for a trap, if present.
#[must_use]
pub fn find_record<'a>(
    records: &'a [ChangeRecord],
    policy_name: &str,
    trap_id: &str,
) -> Option<&'a ChangeRecord> {
    records
        .iter()
        .find(|r| r.deception_policy_name == policy_name && r.trap_id == trap_id)
}

/// How many records across all given workloads reference a secret.
/// Secrets are deleted only when this count drops to zero.
#[must_use]
pub fn secret_reference_count(all_records: &[Vec<ChangeRecord>], secret_name: &str) -> usize {
    all_records
        .iter()
        .flatten()
        .filter(|r| r.secret_name.as_deref() == Some(secret_name))
        .count()
}
