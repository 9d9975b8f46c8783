//! Content-addressed identities for traps and derived resources.
//!
//! A trap has no stored identity; its identity is a hash of its
//! canonical form. Two representations exist: the *full* identity
//! (workload annotations, decoy dedup) and the *monitoring* identity
//! (tracing-policy names), which strips the fields the probe does not
//! observe - decoy strategy, file content, read-only - so identical
//! traps across policies share one tracing policy.
//!
//! Canonicalization goes through `serde_json::Value`, whose object
//! representation orders keys, making the digest invariant to field
//! reordering in the source document.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::api::{DecoyDeployment, Trap};

/// Name prefix of tracing-policy objects.
pub const TRACING_POLICY_NAME_PREFIX: &str = "koney-tracing-policy-";

/// Name prefix of decoy-content secrets.
pub const SECRET_NAME_PREFIX: &str = "koney-secret-";

/// Name prefix of injected volumes.
pub const VOLUME_NAME_PREFIX: &str = "koney-volume-";

/// Name prefix of admission mutation rules.
pub const ADMISSION_RULE_NAME_PREFIX: &str = "koney-admission-";

/// Domain-separation prefix for trap identity hashing.
///
/// Keeps trap identity tokens from colliding with hashes derived in
/// other contexts (secret names, volume names).
const TRAP_ID_DOMAIN_PREFIX: &[u8] = b"koney.trap_id:";

/// Domain-separation prefix for derived resource names.
const RESOURCE_NAME_DOMAIN_PREFIX: &[u8] = b"koney.resource_name:";

/// Identity errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The trap could not be canonicalized to JSON.
    #[error("failed to canonicalize trap: {0}")]
    Canonicalize(#[from] serde_json::Error),
}

/// Hex digest truncated to 16 characters (64 bits of hash width).
fn short_digest(domain: &[u8], input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in &digest[..8] {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Canonical textual encoding of a trap: JSON with ordered object keys.
fn canonical_json(trap: &Trap) -> Result<String, IdentityError> {
    let value = serde_json::to_value(trap)?;
    Ok(value.to_string())
}

/// Full identity token of a trap.
///
/// # Errors
///
/// Returns [`IdentityError::Canonicalize`] when the trap cannot be
/// serialized.
pub fn trap_id(trap: &Trap) -> Result<String, IdentityError> {
    Ok(short_digest(TRAP_ID_DOMAIN_PREFIX, &canonical_json(trap)?))
}

/// Monitoring identity token of a trap.
///
/// Fields irrelevant to detection are cleared before hashing, so that
/// the same file watched the same way yields the same token no matter
/// how the decoy got there or what it contains.
///
/// # Errors
///
/// Returns [`IdentityError::Canonicalize`] when the trap cannot be
/// serialized.
pub fn monitoring_id(trap: &Trap) -> Result<String, IdentityError> {
    let mut stripped = trap.clone();
    stripped.decoy_deployment = DecoyDeployment::default();
    if let Some(token) = &mut stripped.filesystem_honeytoken {
        token.file_content = String::new();
        token.read_only = false;
    }
    Ok(short_digest(
        TRAP_ID_DOMAIN_PREFIX,
        &canonical_json(&stripped)?,
    ))
}

/// Name of the tracing-policy object derived from a trap.
///
/// # Errors
///
/// Returns [`IdentityError::Canonicalize`] when the trap cannot be
/// serialized.
pub fn tracing_policy_name(trap: &Trap) -> Result<String, IdentityError> {
    Ok(format!(
        "{TRACING_POLICY_NAME_PREFIX}{}",
        monitoring_id(trap)?
    ))
}

/// Name of the secret backing a honeytoken's content.
///
/// The digest covers path and content, so traps that plant the same
/// file with the same content share one secret per namespace.
#[must_use]
pub fn secret_name(file_path: &str, file_content: &str) -> String {
    let input = format!("{file_path}:{file_content}");
    format!(
        "{SECRET_NAME_PREFIX}{}",
        short_digest(RESOURCE_NAME_DOMAIN_PREFIX, &input)
    )
}

/// Name of the volume injected for a honeytoken path.
#[must_use]
pub fn volume_name(file_path: &str) -> String {
    format!(
        "{VOLUME_NAME_PREFIX}{}",
        short_digest(RESOURCE_NAME_DOMAIN_PREFIX, file_path)
    )
}

/// Name of the admission mutation rule derived from a trap.
///
/// # Errors
///
/// Returns [`IdentityError::Canonicalize`] when the trap cannot be
/// serialized.
pub fn admission_rule_name(trap: &Trap) -> Result<String, IdentityError> {
    Ok(format!("{ADMISSION_RULE_NAME_PREFIX}{}", trap_id(trap)?))
}
