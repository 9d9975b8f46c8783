//! Decoy deployers.
//!
//! Three interchangeable strategies install a honeytoken file into
//! target containers, each with its own rollback story. The trait
//! models the capability set the planner selects on: whether a strategy
//! reaches running replicas directly and whether it patches the pod
//! template (and therefore needs rollout observation).
//!
//! Every install and uninstall is safe to call twice: the workload's
//! change records are consulted first, and a path already covered by
//! any record is left alone.

mod container_exec;
mod kyverno;
mod volume_mount;

use async_trait::async_trait;
pub use container_exec::ContainerExecDeployer;
use koney_core::api::{DeceptionPolicy, DecoyStrategy, Trap};
use koney_core::changes::{ChangeRecord, ChangesError};
use koney_core::cluster::{ClusterClient, ClusterError, Workload};
use koney_core::identity::IdentityError;
pub use kyverno::KyvernoPolicyDeployer;
use thiserror::Error;
pub use volume_mount::VolumeMountDeployer;

use crate::plan::TrapTarget;

/// Deployment errors.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The workload patch kept conflicting past the retry budget.
    #[error("failed to patch workload {workload}: {source}")]
    WorkloadPatch {
        /// Namespaced workload name.
        workload: String,
        /// Underlying error.
        #[source]
        source: ClusterError,
    },

    /// The trap has no filesystem honeytoken; the deployer was handed
    /// a trap kind it does not implement.
    #[error("trap carries no filesystem honeytoken")]
    UnsupportedTrap,

    /// The trap could not be identified.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// The change annotation is malformed.
    #[error(transparent)]
    Changes(#[from] ChangesError),

    /// Any other cluster API failure.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// One per-container failure inside an otherwise continuing install.
#[derive(Debug)]
pub struct DeployFailure {
    /// Namespaced pod the failure occurred in, when applicable.
    pub pod: Option<String>,

    /// Container name.
    pub container: String,

    /// What went wrong.
    pub error: ClusterError,
}

/// Result of installing one trap into one workload.
#[derive(Debug, Default)]
pub struct DeployReport {
    /// The decoy is present for this (trap, workload) after the call,
    /// whether installed now, earlier, or by another policy occupying
    /// the same path.
    pub satisfied: bool,

    /// Whether the call mutated cluster state.
    pub changed: bool,

    /// Containers covered by the decoy.
    pub containers: Vec<String>,

    /// Per-container failures; partial success is recorded, not
    /// escalated.
    pub failures: Vec<DeployFailure>,
}

/// A decoy installation strategy.
#[async_trait]
pub trait DecoyDeployer: Send + Sync {
    /// The strategy tag this deployer implements.
    fn strategy(&self) -> DecoyStrategy;

    /// Whether the strategy reaches already-running replicas.
    fn supports_runtime_injection(&self) -> bool;

    /// Whether the strategy mutates the pod template (and therefore
    /// needs rollout observation before the decoy is live everywhere).
    fn supports_spec_patch(&self) -> bool;

    /// Install the trap's decoy into one target workload.
    async fn install(
        &self,
        client: &dyn ClusterClient,
        policy: &DeceptionPolicy,
        trap: &Trap,
        trap_id: &str,
        target: &TrapTarget,
    ) -> Result<DeployReport, DeployError>;

    /// Remove a previously recorded change from a workload. Best-effort
    /// where the underlying containers may already be gone.
    async fn uninstall(
        &self,
        client: &dyn ClusterClient,
        record: &ChangeRecord,
        workload: &Workload,
    ) -> Result<(), DeployError>;
}

/// Select the deployer for a strategy tag.
#[must_use]
pub fn deployer_for(strategy: DecoyStrategy) -> &'static dyn DecoyDeployer {
    static VOLUME_MOUNT: VolumeMountDeployer = VolumeMountDeployer;
    static CONTAINER_EXEC: ContainerExecDeployer = ContainerExecDeployer;
    static KYVERNO: KyvernoPolicyDeployer = KyvernoPolicyDeployer;

    match strategy {
        DecoyStrategy::VolumeMount => &VOLUME_MOUNT,
        DecoyStrategy::ContainerExec => &CONTAINER_EXEC,
        DecoyStrategy::KyvernoPolicy => &KYVERNO,
    }
}

/// Ensure the content secret for a honeytoken exists in a namespace.
/// Returns the secret name and whether this call created it. Losing a
/// create race to a concurrent pass is fine; the content is identical
/// by construction.
pub(crate) async fn ensure_secret(
    client: &dyn ClusterClient,
    namespace: &str,
    file_path: &str,
    file_content: &str,
) -> Result<(String, bool), ClusterError> {
    use koney_core::cluster::{ObjectMeta, Secret};

    let name = koney_core::identity::secret_name(file_path, file_content);
    if client.get_secret(namespace, &name).await?.is_some() {
        return Ok((name, false));
    }

    let data_key = file_path.rsplit('/').next().unwrap_or("token").to_string();
    let secret = Secret {
        meta: ObjectMeta::namespaced(namespace, &name),
        data: [(data_key, file_content.as_bytes().to_vec())].into(),
    };
    match client.create_secret(&secret).await {
        Ok(()) => Ok((name, true)),
        Err(ClusterError::AlreadyExists { .. }) => Ok((name, false)),
        Err(err) => Err(err),
    }
}

/// Delete a honeytoken secret unless another change record still
/// references it. Reference counting spans every workload's records,
/// so secrets shared between traps survive single-trap removal.
pub(crate) async fn release_secret(
    client: &dyn ClusterClient,
    namespace: &str,
    secret_name: &str,
) -> Result<(), DeployError> {
    let workloads = client.list_workloads().await?;
    let all_records: Vec<Vec<ChangeRecord>> = workloads
        .iter()
        .map(|w| koney_core::changes::read_records(&w.meta))
        .collect::<Result<_, _>>()?;
    if koney_core::changes::secret_reference_count(&all_records, secret_name) > 0 {
        return Ok(());
    }

    let rules = client.list_admission_rules(None).await?;
    if rules
        .iter()
        .any(|rule| rule.spec.volume.secret_name == secret_name)
    {
        return Ok(());
    }

    match client.delete_secret(namespace, secret_name).await {
        Ok(()) | Err(ClusterError::NotFound { .. }) => Ok(()),
        Err(err) => Err(err.into()),
    }
}
