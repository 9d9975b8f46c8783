//! The canonical alert record.
//!
//! The ingestion pipeline turns raw probe events into these records and
//! writes them line-delimited to its sink. Field names are the wire
//! contract consumed downstream, hence the snake_case renames.

use serde::{Deserialize, Serialize};

use crate::api::TrapKind;

/// One canonical alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Event timestamp as reported by the probe (RFC 3339).
    pub timestamp: String,

    /// Source policy, when resolution succeeded.
    pub deception_policy_name: Option<String>,

    /// The classified trap kind.
    pub trap_type: TrapKind,

    /// Trap-kind-specific metadata; for filesystem traps the accessed
    /// `file_path`.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// Pod the access happened in.
    pub pod: Option<PodInfo>,

    /// Process that performed the access.
    pub process: Option<ProcessInfo>,
}

/// Pod identity attached to an alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodInfo {
    /// Pod name.
    pub name: String,

    /// Pod namespace.
    pub namespace: String,

    /// The container the access came from.
    pub container: ContainerInfo,
}

/// Container identity attached to an alert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Runtime container id.
    pub id: String,

    /// Container name.
    pub name: String,
}

/// Process metadata attached to an alert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Process id.
    pub pid: i64,

    /// Working directory.
    pub cwd: String,

    /// Executable path.
    pub binary: String,

    /// Argument string as reported by the probe.
    pub arguments: String,
}
