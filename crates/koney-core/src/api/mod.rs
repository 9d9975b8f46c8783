//! The `DeceptionPolicy` resource schema.
//!
//! Policies are authored as camelCase documents (the wire form of the
//! cluster API), so every struct here carries serde renames. Defaults
//! mirror what the API server would apply: strict validation on,
//! mutation of existing workloads on, tetragon captors.

mod conditions;
mod validation;

use std::collections::BTreeMap;

pub use conditions::{Condition, ConditionStatus, ConditionType, PolicyStatus};
use serde::{Deserialize, Serialize};
pub use validation::{validate_policy, validate_trap, TrapRejection, ValidationError};

use crate::cluster::ObjectMeta;

/// Finalizer placed on policies while derived artifacts exist.
pub const POLICY_FINALIZER: &str = "koney/cleanup";

/// Label key that ties every derived artifact back to its policy.
pub const POLICY_LABEL_KEY: &str = "koney/deception-policy";

/// Annotation key carrying the JSON change records on mutated workloads.
pub const CHANGES_ANNOTATION_KEY: &str = "koney/changes-annotation";

/// A cluster-scoped deception policy: the user-authored document that
/// describes a set of traps and where to place them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeceptionPolicy {
    /// Object metadata (name, labels, finalizers, deletion timestamp).
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// Desired state.
    pub spec: DeceptionPolicySpec,

    /// Observed state, written by the controller.
    #[serde(default)]
    pub status: PolicyStatus,
}

impl DeceptionPolicy {
    /// Create a policy with the given name and traps, defaults applied.
    #[must_use]
    pub fn new(name: impl Into<String>, traps: Vec<Trap>) -> Self {
        Self {
            metadata: ObjectMeta::cluster_scoped(name),
            spec: DeceptionPolicySpec {
                strict_validation: default_true(),
                mutate_existing: default_true(),
                traps,
            },
            status: PolicyStatus::default(),
        }
    }

    /// Whether the policy has been marked for deletion.
    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

/// Desired state of a [`DeceptionPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeceptionPolicySpec {
    /// Reject the whole policy when any trap fails validation. When
    /// false, invalid traps are skipped and the rest deploy.
    #[serde(default = "default_true")]
    pub strict_validation: bool,

    /// Mutate workloads that already exist. When false, decoys reach
    /// only workloads and pods created after the policy.
    #[serde(default = "default_true")]
    pub mutate_existing: bool,

    /// The traps to deploy, in order.
    #[serde(default)]
    pub traps: Vec<Trap>,
}

const fn default_true() -> bool {
    true
}

/// One deception technique. Exactly one of the kind fields must be set;
/// the reserved kinds deserialize but do not deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trap {
    /// A decoy file placed into matching containers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem_honeytoken: Option<FilesystemHoneytoken>,

    /// Reserved for a future HTTP endpoint trap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_endpoint: Option<HttpEndpoint>,

    /// Reserved for a future HTTP payload trap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_payload: Option<HttpPayload>,

    /// Which workloads and containers receive the trap.
    #[serde(default)]
    pub match_resources: ResourceFilters,

    /// How the decoy is installed.
    #[serde(default)]
    pub decoy_deployment: DecoyDeployment,

    /// How access to the decoy is captured.
    #[serde(default)]
    pub captor_deployment: CaptorDeployment,
}

impl Trap {
    /// Create a filesystem honeytoken trap with default deployments and
    /// an empty resource filter (matches nothing until filters are set).
    #[must_use]
    pub fn filesystem_honeytoken(
        file_path: impl Into<String>,
        file_content: impl Into<String>,
        read_only: bool,
    ) -> Self {
        Self {
            filesystem_honeytoken: Some(FilesystemHoneytoken {
                file_path: file_path.into(),
                file_content: file_content.into(),
                read_only,
            }),
            http_endpoint: None,
            http_payload: None,
            match_resources: ResourceFilters::default(),
            decoy_deployment: DecoyDeployment::default(),
            captor_deployment: CaptorDeployment::default(),
        }
    }

    /// The discriminant of this trap.
    #[must_use]
    pub fn kind(&self) -> TrapKind {
        if self.filesystem_honeytoken.is_some() {
            TrapKind::FilesystemHoneytoken
        } else if self.http_endpoint.is_some() {
            TrapKind::HttpEndpoint
        } else if self.http_payload.is_some() {
            TrapKind::HttpPayload
        } else {
            TrapKind::Unknown
        }
    }
}

/// Discriminant over the trap kind fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrapKind {
    /// No kind field was set.
    Unknown,
    /// [`FilesystemHoneytoken`].
    FilesystemHoneytoken,
    /// Reserved.
    HttpEndpoint,
    /// Reserved.
    HttpPayload,
}

impl std::fmt::Display for TrapKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::FilesystemHoneytoken => write!(f, "filesystem_honeytoken"),
            Self::HttpEndpoint => write!(f, "http_endpoint"),
            Self::HttpPayload => write!(f, "http_payload"),
        }
    }
}

/// A decoy file to be written into matching containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemHoneytoken {
    /// Absolute path of the decoy inside the container.
    pub file_path: String,

    /// Contents of the decoy file.
    #[serde(default)]
    pub file_content: String,

    /// Install the decoy read-only.
    #[serde(default = "default_true")]
    pub read_only: bool,
}

/// Reserved trap kind; the schema accommodates it without migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpEndpoint {}

/// Reserved trap kind; the schema accommodates it without migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpPayload {}

/// How a decoy is installed into targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecoyDeployment {
    /// The installation strategy.
    #[serde(default)]
    pub strategy: DecoyStrategy,
}

/// Decoy installation strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DecoyStrategy {
    /// Mount a secret-backed volume into the pod template.
    #[default]
    VolumeMount,
    /// Write the file into running containers over an exec channel.
    ContainerExec,
    /// Delegate the injection to an external admission-time engine.
    KyvernoPolicy,
}

impl std::fmt::Display for DecoyStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VolumeMount => write!(f, "volumeMount"),
            Self::ContainerExec => write!(f, "containerExec"),
            Self::KyvernoPolicy => write!(f, "kyvernoPolicy"),
        }
    }
}

/// How access to a decoy is captured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptorDeployment {
    /// The kernel-probe engine that hosts the tracing policy.
    #[serde(default)]
    pub strategy: CaptorStrategy,
}

/// Captor engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptorStrategy {
    /// Tetragon tracing policies.
    #[default]
    Tetragon,
    /// Kive policies.
    Kive,
}

impl CaptorStrategy {
    /// The engine name as it appears in webhook paths.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tetragon => "tetragon",
            Self::Kive => "kive",
        }
    }
}

impl std::fmt::Display for CaptorStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CaptorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tetragon" => Ok(Self::Tetragon),
            "kive" => Ok(Self::Kive),
            other => Err(format!("unknown captor engine: {other}")),
        }
    }
}

/// Disjunction of resource filters: a workload is targeted when any
/// filter matches it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFilters {
    /// The filters; each one AND-s its own fields.
    #[serde(default)]
    pub any: Vec<ResourceFilter>,
}

impl ResourceFilters {
    /// A single-filter disjunction selecting by labels only.
    #[must_use]
    pub fn with_labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            any: vec![ResourceFilter {
                namespaces: Vec::new(),
                selector: Some(LabelSelector {
                    match_labels: labels
                        .into_iter()
                        .map(|(k, v)| (k.into(), v.into()))
                        .collect(),
                    match_expressions: Vec::new(),
                }),
                container_selector: String::new(),
            }],
        }
    }
}

/// One conjunction of resource constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFilter {
    /// Literal namespace names; empty means all namespaces.
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Label selector over workload labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Container name pattern: empty or `*` match all, `glob:<p>` a
    /// shell glob, `regex:<p>` a full regex, anything else a literal.
    #[serde(default)]
    pub container_selector: String,
}

/// Label selector with equality terms and set expressions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Exact-match label requirements.
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,

    /// Set-based label requirements.
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    /// Whether the selector places no constraints at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }
}

/// One set-based label requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    /// The label key.
    pub key: String,

    /// The relation between the key and the values.
    pub operator: LabelSelectorOperator,

    /// Values for `In` and `NotIn`.
    #[serde(default)]
    pub values: Vec<String>,
}

/// Set-based selector operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelSelectorOperator {
    /// The label value must be one of the listed values.
    In,
    /// The label value must not be one of the listed values.
    NotIn,
    /// The label key must be present.
    Exists,
    /// The label key must be absent.
    DoesNotExist,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults_apply() {
        let policy: DeceptionPolicy = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "p1" },
            "spec": { "traps": [] }
        }))
        .unwrap();

        assert!(policy.spec.strict_validation);
        assert!(policy.spec.mutate_existing);
        assert!(policy.status.conditions.is_empty());
    }

    #[test]
    fn test_trap_wire_form_is_camel_case() {
        let trap: Trap = serde_json::from_value(serde_json::json!({
            "filesystemHoneytoken": {
                "filePath": "/tmp/auth_token.json",
                "fileContent": "{\"token\":\"x\"}"
            },
            "decoyDeployment": { "strategy": "containerExec" },
            "captorDeployment": { "strategy": "tetragon" }
        }))
        .unwrap();

        assert_eq!(trap.kind(), TrapKind::FilesystemHoneytoken);
        assert_eq!(trap.decoy_deployment.strategy, DecoyStrategy::ContainerExec);
        let token = trap.filesystem_honeytoken.unwrap();
        assert_eq!(token.file_path, "/tmp/auth_token.json");
        assert!(token.read_only, "readOnly defaults to true");
    }

    #[test]
    fn test_reserved_kinds_deserialize() {
        let trap: Trap = serde_json::from_value(serde_json::json!({
            "httpEndpoint": {}
        }))
        .unwrap();
        assert_eq!(trap.kind(), TrapKind::HttpEndpoint);
    }
}
