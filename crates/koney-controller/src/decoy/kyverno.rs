//! The external-policy-engine strategy.
//!
//! Instead of mutating workloads itself, the controller emits a
//! declarative mutation rule; the admission engine injects the secret
//! volume and mount into matching pods as they are created. Existing
//! replicas are untouched by construction, so there is nothing to
//! observe and no change record to write on the workload.

use async_trait::async_trait;
use koney_core::api::{DeceptionPolicy, DecoyStrategy, Trap, POLICY_LABEL_KEY};
use koney_core::changes::ChangeRecord;
use koney_core::cluster::{
    AdmissionRule, AdmissionRuleSpec, ClusterClient, ObjectMeta, OwnerReference, Volume,
    VolumeMount, Workload,
};
use koney_core::identity;

use super::{ensure_secret, DecoyDeployer, DeployError, DeployReport};
use crate::plan::TrapTarget;

/// Installs decoys by registering an admission-time mutation rule.
pub struct KyvernoPolicyDeployer;

/// Build the mutation rule for a trap.
///
/// # Errors
///
/// Returns [`DeployError::UnsupportedTrap`] for traps without a
/// filesystem honeytoken.
pub fn build_admission_rule(
    policy: &DeceptionPolicy,
    trap: &Trap,
) -> Result<AdmissionRule, DeployError> {
    let token = trap
        .filesystem_honeytoken
        .as_ref()
        .ok_or(DeployError::UnsupportedTrap)?;
    let volume_name = identity::volume_name(&token.file_path);
    let secret_name = identity::secret_name(&token.file_path, &token.file_content);
    let mount_path = match token.file_path.rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((dir, _)) => dir.to_string(),
    };

    let mut meta = ObjectMeta::cluster_scoped(identity::admission_rule_name(trap)?);
    meta.labels.insert(
        POLICY_LABEL_KEY.to_string(),
        policy.metadata.name.clone(),
    );
    meta.owner_references
        .push(OwnerReference::controller_of(policy));

    Ok(AdmissionRule {
        meta,
        spec: AdmissionRuleSpec {
            any: trap.match_resources.any.clone(),
            volume: Volume {
                name: volume_name.clone(),
                secret_name,
            },
            mount: VolumeMount {
                name: volume_name,
                mount_path,
                read_only: token.read_only,
            },
        },
    })
}

#[async_trait]
impl DecoyDeployer for KyvernoPolicyDeployer {
    fn strategy(&self) -> DecoyStrategy {
        DecoyStrategy::KyvernoPolicy
    }

    fn supports_runtime_injection(&self) -> bool {
        false
    }

    fn supports_spec_patch(&self) -> bool {
        false
    }

    async fn install(
        &self,
        client: &dyn ClusterClient,
        policy: &DeceptionPolicy,
        trap: &Trap,
        _trap_id: &str,
        target: &TrapTarget,
    ) -> Result<DeployReport, DeployError> {
        let token = trap
            .filesystem_honeytoken
            .as_ref()
            .ok_or(DeployError::UnsupportedTrap)?;

        // The admission engine resolves the secret in the pod's own
        // namespace, so the content must exist wherever targets live.
        let (_, secret_created) = ensure_secret(
            client,
            &target.workload.meta.namespace,
            &token.file_path,
            &token.file_content,
        )
        .await?;

        let rule = build_admission_rule(policy, trap)?;
        client.apply_admission_rule(&rule).await?;

        Ok(DeployReport {
            satisfied: true,
            changed: secret_created,
            containers: target.containers.clone(),
            failures: Vec::new(),
        })
    }

    async fn uninstall(
        &self,
        _client: &dyn ClusterClient,
        _record: &ChangeRecord,
        _workload: &Workload,
    ) -> Result<(), DeployError> {
        // Nothing is recorded on workloads in this mode; the engine
        // retracts the admission rule itself during cleanup.
        Ok(())
    }
}
