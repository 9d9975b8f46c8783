//! The cluster API boundary.
//!
//! The real cluster machinery (schema registration, admission, RBAC,
//! transports) is an external collaborator; this module specifies only
//! the interface the controller and forwarder need, as a typed object
//! model plus the [`ClusterClient`] trait. The in-memory implementation
//! in [`memory`] backs every test and the daemons' standalone mode.

pub mod memory;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::api::{DeceptionPolicy, LabelSelector, PolicyStatus, ResourceFilter};

pub use memory::InMemoryCluster;

/// Object metadata shared by every cluster object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name, unique within its namespace (or cluster-wide for
    /// cluster-scoped objects).
    pub name: String,

    /// Namespace; empty for cluster-scoped objects.
    #[serde(default)]
    pub namespace: String,

    /// Server-assigned unique id.
    #[serde(default)]
    pub uid: String,

    /// Optimistic-concurrency token; increments on every write.
    #[serde(default)]
    pub resource_version: u64,

    /// Labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Owner references for cascading cleanup.
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,

    /// Finalizers gating deletion.
    #[serde(default)]
    pub finalizers: Vec<String>,

    /// When the object was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    /// Set when deletion has been requested but finalizers remain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Metadata for a cluster-scoped object.
    #[must_use]
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Metadata for a namespaced object.
    #[must_use]
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Whether a label is present with the given value.
    #[must_use]
    pub fn has_label(&self, key: &str, value: &str) -> bool {
        self.labels.get(key).is_some_and(|v| v == value)
    }
}

/// Reference from a derived object to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    /// Owner kind (e.g. `DeceptionPolicy`).
    pub kind: String,

    /// Owner name.
    pub name: String,

    /// Owner uid.
    pub uid: String,

    /// Whether this owner manages the object.
    #[serde(default)]
    pub controller: bool,

    /// Whether the owner must not be deleted while this object exists.
    #[serde(default)]
    pub block_owner_deletion: bool,
}

impl OwnerReference {
    /// An owning, deletion-blocking reference to a deception policy.
    #[must_use]
    pub fn controller_of(policy: &DeceptionPolicy) -> Self {
        Self {
            kind: "DeceptionPolicy".to_string(),
            name: policy.metadata.name.clone(),
            uid: policy.metadata.uid.clone(),
            controller: true,
            block_owner_deletion: true,
        }
    }
}

/// Kind of a targetable workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadKind {
    /// A replicated stateless workload.
    Deployment,
    /// A replicated stateful workload.
    StatefulSet,
    /// A per-node workload.
    DaemonSet,
}

/// A workload whose pod template can be mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    /// Object metadata.
    pub meta: ObjectMeta,

    /// Workload kind.
    pub kind: WorkloadKind,

    /// Desired replica count.
    pub replicas: u32,

    /// The pod template stamped onto every replica.
    pub template: PodTemplate,
}

/// Pod template: the subset the decoy deployers touch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    /// Labels stamped onto pods.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Containers in the pod.
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,

    /// Volumes available to the containers.
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

impl PodTemplate {
    /// Content hash of the template, used to observe rollouts: a pod is
    /// up to date when its recorded hash equals its workload's current
    /// template hash.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let encoded = serde_json::to_value(self)
            .map(|v| v.to_string())
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(b"koney.pod_template:");
        hasher.update(encoded.as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(16);
        for byte in &digest[..8] {
            use std::fmt::Write;
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

/// One container in a pod template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,

    /// Volume mounts.
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

impl ContainerSpec {
    /// A container with no mounts.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            volume_mounts: Vec::new(),
        }
    }
}

/// A secret-backed volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name.
    pub name: String,

    /// Name of the backing secret.
    pub secret_name: String,
}

/// A mount of a volume into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// Volume name.
    pub name: String,

    /// Directory the volume is mounted at.
    pub mount_path: String,

    /// Whether the mount is read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// A running pod, as far as the controller observes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    /// Object metadata (labels inherited from the template).
    pub meta: ObjectMeta,

    /// Hash of the template revision this pod was created from.
    pub template_hash: String,

    /// Whether the pod is running.
    pub running: bool,

    /// Running containers.
    pub containers: Vec<ContainerStatus>,
}

/// Status of one container in a pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    /// Runtime container id.
    pub id: String,

    /// Container name.
    pub name: String,
}

/// A namespaced secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    /// Object metadata.
    pub meta: ObjectMeta,

    /// Opaque data keyed by file name.
    #[serde(default)]
    pub data: BTreeMap<String, Vec<u8>>,
}

/// A tracing policy registered with a kernel-probe engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracingPolicy {
    /// Object metadata.
    pub meta: ObjectMeta,

    /// Engine-specific policy document.
    pub spec: TracingPolicySpec,
}

/// The engine-specific document of a tracing policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TracingPolicySpec {
    /// A Tetragon kprobe policy.
    Tetragon(TetragonSpec),
    /// A Kive trap policy.
    Kive(KiveSpec),
}

/// Tetragon tracing-policy document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TetragonSpec {
    /// Pods the probes attach to.
    pub pod_selector: LabelSelector,

    /// Containers within those pods; `None` matches all containers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_selector: Option<LabelSelector>,

    /// Kernel probes.
    #[serde(default)]
    pub kprobes: Vec<KprobeSpec>,
}

/// One kernel probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KprobeSpec {
    /// Hooked kernel function.
    pub call: String,

    /// Whether `call` names a syscall rather than a kernel function.
    #[serde(default)]
    pub syscall: bool,

    /// Collect the return value.
    #[serde(default, rename = "return")]
    pub return_value: bool,

    /// Probed arguments.
    #[serde(default)]
    pub args: Vec<KprobeArg>,

    /// Return argument description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_arg: Option<KprobeArg>,

    /// Action applied to the return argument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_arg_action: Option<String>,

    /// Match selectors with their actions.
    #[serde(default)]
    pub selectors: Vec<KprobeSelector>,
}

/// One probed argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KprobeArg {
    /// Argument index.
    pub index: u32,

    /// Argument type as the engine understands it.
    #[serde(rename = "type")]
    pub arg_type: String,
}

/// Probe selector: argument matches plus triggered actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KprobeSelector {
    /// Argument match terms.
    #[serde(default)]
    pub match_args: Vec<ArgSelector>,

    /// Actions on match.
    #[serde(default)]
    pub match_actions: Vec<ActionSelector>,
}

/// One argument match term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgSelector {
    /// Argument index.
    pub index: u32,

    /// Match operator (e.g. `Equal`).
    pub operator: String,

    /// Values compared against the argument.
    pub values: Vec<String>,
}

/// One action triggered on match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSelector {
    /// Action kind (e.g. `GetUrl`).
    pub action: String,

    /// URL for `GetUrl` actions.
    pub arg_url: String,
}

/// Kive tracing-policy document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiveSpec {
    /// Watched traps.
    #[serde(default)]
    pub traps: Vec<KiveTrap>,
}

/// One watched path in a Kive policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiveTrap {
    /// Watched file path.
    pub path: String,

    /// Callback URL hit on access.
    pub callback: String,

    /// Disjunction of match terms.
    #[serde(default)]
    pub match_any: Vec<KiveTrapMatch>,
}

/// One Kive match term.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiveTrapMatch {
    /// Namespace; empty matches all.
    #[serde(default)]
    pub namespace: String,

    /// Container-selector pattern.
    #[serde(default)]
    pub container_name: String,

    /// Pod label requirements.
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

/// A declarative admission-time mutation rule for an external policy
/// engine: inject the volume and mount into matching pods at admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRule {
    /// Object metadata.
    pub meta: ObjectMeta,

    /// The mutation to apply.
    pub spec: AdmissionRuleSpec,
}

/// Spec of an [`AdmissionRule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRuleSpec {
    /// Pods the rule applies to.
    #[serde(default)]
    pub any: Vec<ResourceFilter>,

    /// Volume to inject.
    pub volume: Volume,

    /// Mount to inject into matching containers.
    pub mount: VolumeMount,
}

/// Change notifications emitted by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A deception policy was created, updated, or marked for deletion.
    PolicyChanged {
        /// Policy name.
        name: String,
    },
    /// A workload was created, updated, or deleted.
    WorkloadChanged {
        /// Workload namespace.
        namespace: String,
        /// Workload name.
        name: String,
    },
    /// A tracing policy owned by the controller changed.
    TracingPolicyChanged {
        /// Tracing-policy name.
        name: String,
    },
}

/// Cluster API errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The object does not exist.
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// Object kind.
        kind: &'static str,
        /// Object name.
        name: String,
    },

    /// The object already exists.
    #[error("{kind} {name:?} already exists")]
    AlreadyExists {
        /// Object kind.
        kind: &'static str,
        /// Object name.
        name: String,
    },

    /// A write lost an optimistic-concurrency race.
    #[error("conflict writing {kind} {name:?}: resource version {submitted} is stale (current {current})")]
    Conflict {
        /// Object kind.
        kind: &'static str,
        /// Object name.
        name: String,
        /// Resource version the caller submitted.
        submitted: u64,
        /// Resource version currently stored.
        current: u64,
    },

    /// An exec channel into a container failed.
    #[error("exec in {namespace}/{pod}/{container} failed: {reason}")]
    ExecFailed {
        /// Pod namespace.
        namespace: String,
        /// Pod name.
        pod: String,
        /// Container name.
        container: String,
        /// Failure detail.
        reason: String,
    },

    /// The cluster API cannot be reached.
    #[error("cluster API unreachable: {0}")]
    Unreachable(String),
}

impl ClusterError {
    /// Whether retrying the same write can succeed after a re-read.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// The cluster API surface the controller and forwarder depend on.
///
/// Implementations must be safe to share across tasks. All operations
/// are demand-driven; the only push channel is [`watch`].
///
/// [`watch`]: ClusterClient::watch
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Cheap reachability probe for health endpoints.
    async fn ping(&self) -> Result<(), ClusterError>;

    // --- deception policies -------------------------------------------------

    /// List all deception policies.
    async fn list_policies(&self) -> Result<Vec<DeceptionPolicy>, ClusterError>;

    /// Get a policy by name.
    async fn get_policy(&self, name: &str) -> Result<DeceptionPolicy, ClusterError>;

    /// Write a policy's metadata and spec (not its status). The
    /// submitted resource version must match the stored one.
    async fn update_policy(&self, policy: &DeceptionPolicy) -> Result<DeceptionPolicy, ClusterError>;

    /// Write a policy's status subresource under optimistic concurrency.
    async fn update_policy_status(
        &self,
        name: &str,
        resource_version: u64,
        status: &PolicyStatus,
    ) -> Result<(), ClusterError>;

    // --- workloads ----------------------------------------------------------

    /// List all workloads in the cluster.
    async fn list_workloads(&self) -> Result<Vec<Workload>, ClusterError>;

    /// Get a workload.
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Workload, ClusterError>;

    /// Write a workload. The submitted resource version must match.
    async fn update_workload(&self, workload: &Workload) -> Result<Workload, ClusterError>;

    /// List running pods in a namespace whose labels contain `selector`.
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, ClusterError>;

    /// Run a command inside a running container.
    async fn exec_in_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<(), ClusterError>;

    // --- secrets ------------------------------------------------------------

    /// Get a secret if it exists.
    async fn get_secret(&self, namespace: &str, name: &str)
        -> Result<Option<Secret>, ClusterError>;

    /// Create a secret.
    async fn create_secret(&self, secret: &Secret) -> Result<(), ClusterError>;

    /// Delete a secret; not-found is an error the caller may ignore.
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    // --- tracing policies ---------------------------------------------------

    /// List tracing policies, optionally filtered by one label.
    async fn list_tracing_policies(
        &self,
        label: Option<(&str, &str)>,
    ) -> Result<Vec<TracingPolicy>, ClusterError>;

    /// Get a tracing policy by name.
    async fn get_tracing_policy(&self, name: &str) -> Result<TracingPolicy, ClusterError>;

    /// Create or update a tracing policy. On update, owner references
    /// are merged (union by owner uid) and labels overwritten, so two
    /// policies sharing a monitoring identity share one object.
    async fn apply_tracing_policy(&self, policy: &TracingPolicy) -> Result<(), ClusterError>;

    /// Replace a tracing policy's metadata (owner-reference pruning).
    async fn update_tracing_policy(&self, policy: &TracingPolicy) -> Result<(), ClusterError>;

    /// Delete a tracing policy.
    async fn delete_tracing_policy(&self, name: &str) -> Result<(), ClusterError>;

    // --- admission rules ----------------------------------------------------

    /// List admission rules, optionally filtered by one label.
    async fn list_admission_rules(
        &self,
        label: Option<(&str, &str)>,
    ) -> Result<Vec<AdmissionRule>, ClusterError>;

    /// Create or update an admission rule.
    async fn apply_admission_rule(&self, rule: &AdmissionRule) -> Result<(), ClusterError>;

    /// Delete an admission rule.
    async fn delete_admission_rule(&self, name: &str) -> Result<(), ClusterError>;

    // --- coordination and observation ---------------------------------------

    /// Try to acquire or renew a leader lease. Returns true when the
    /// caller holds the lease after the call.
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, ClusterError>;

    /// Read the kernel-probe host's log lines from the last `since`.
    async fn read_probe_logs(&self, since: Duration) -> Result<Vec<String>, ClusterError>;

    /// Subscribe to change notifications.
    fn watch(&self) -> broadcast::Receiver<ClusterEvent>;
}
