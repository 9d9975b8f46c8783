//! The alert ingestion pipeline.
//!
//! One scan runs the probe host's recent log lines through the stages:
//! normalize timestamps, parse JSON, attribute (policy name, process
//! and pod metadata), deduplicate, resolve the source deception
//! policy, classify the trap kind, drop self-induced events by
//! fingerprint, and emit the canonical alert. Malformed lines are
//! dropped with a warning; a failed policy resolution still emits the
//! alert with a null policy name.

use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use koney_core::alert::{Alert, ContainerInfo, PodInfo, ProcessInfo};
use koney_core::api::{TrapKind, POLICY_LABEL_KEY};
use koney_core::cluster::{ClusterClient, ClusterError};
use koney_core::fingerprint;
use koney_core::identity::TRACING_POLICY_NAME_PREFIX;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::dedup::DedupCache;
use crate::sink::AlertSink;

/// Kernel functions whose events classify as filesystem honeytoken
/// accesses.
const FILE_ACCESS_FUNCTIONS: [&str; 2] = ["security_file_permission", "security_mmap_file"];

/// Matches RFC 3339 timestamps with nanosecond precision; the
/// sub-second part destabilizes deduplication and is truncated.
static TIME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"("time":"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})\.\d{9}(Z")"#)
        .expect("timestamp pattern is valid")
});

/// Pipeline errors. Per-line problems never surface here; only a
/// failed log read aborts a scan.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Reading the probe host's logs failed.
    #[error("failed to read probe logs: {0}")]
    LogRead(#[from] ClusterError),
}

/// Counters from one scan.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Alerts written to the sink.
    pub emitted: usize,

    /// Events dropped as self-induced.
    pub filtered: usize,

    /// Events dropped as duplicates.
    pub duplicates: usize,

    /// Lines dropped as malformed.
    pub malformed: usize,
}

/// The ingestion pipeline.
pub struct Pipeline {
    client: Arc<dyn ClusterClient>,
    sink: Arc<dyn AlertSink>,
    dedup: Mutex<DedupCache>,
    fingerprint_code: u32,
}

impl Pipeline {
    /// Create a pipeline with the default fingerprint code.
    #[must_use]
    pub fn new(client: Arc<dyn ClusterClient>, sink: Arc<dyn AlertSink>) -> Self {
        Self::with_fingerprint_code(client, sink, fingerprint::DEFAULT_FINGERPRINT_CODE)
    }

    /// Create a pipeline filtering on a specific fingerprint code.
    #[must_use]
    pub fn with_fingerprint_code(
        client: Arc<dyn ClusterClient>,
        sink: Arc<dyn AlertSink>,
        fingerprint_code: u32,
    ) -> Self {
        Self {
            client,
            sink,
            dedup: Mutex::new(DedupCache::default()),
            fingerprint_code,
        }
    }

    /// Run one scan over the trailing `window` of probe logs.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::LogRead`] when the log source is
    /// unreachable.
    pub async fn scan(&self, window: Duration) -> Result<ScanSummary, PipelineError> {
        let lines = self.client.read_probe_logs(window).await?;
        let mut summary = ScanSummary::default();

        for line in &lines {
            if !line.contains(TRACING_POLICY_NAME_PREFIX) {
                continue;
            }

            // Normalize before hashing so replayed lines with jittered
            // sub-second timestamps deduplicate.
            let line = TIME_PATTERN.replace_all(line, "$1$2").into_owned();

            let Ok(event) = serde_json::from_str::<Value>(&line) else {
                warn!("dropping malformed probe event");
                summary.malformed += 1;
                continue;
            };

            let Some(tracing_policy_name) = extract_tracing_policy_name(&event) else {
                debug!("skipping event without a tracing-policy name");
                continue;
            };
            if !tracing_policy_name.starts_with(TRACING_POLICY_NAME_PREFIX) {
                continue;
            }

            if self
                .dedup
                .lock()
                .expect("dedup lock poisoned")
                .check_and_insert(&line)
            {
                summary.duplicates += 1;
                continue;
            }

            let deception_policy_name = self.resolve(&tracing_policy_name).await;
            let (trap_type, metadata) = classify(&event);
            let process = extract_process(&event);

            if let Some(process) = &process {
                if fingerprint::arguments_carry_fingerprint(
                    &process.arguments,
                    self.fingerprint_code,
                ) {
                    debug!("dropping self-induced event");
                    summary.filtered += 1;
                    continue;
                }
            }

            let alert = Alert {
                timestamp: event
                    .get("time")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                deception_policy_name,
                trap_type,
                metadata,
                pod: extract_pod(&event),
                process,
            };
            match self.sink.emit(&alert) {
                Ok(()) => summary.emitted += 1,
                Err(err) => warn!(error = %err, "failed to emit alert"),
            }
        }

        debug!(
            emitted = summary.emitted,
            filtered = summary.filtered,
            duplicates = summary.duplicates,
            malformed = summary.malformed,
            "scan complete"
        );
        Ok(summary)
    }

    /// Resolve the source deception policy from the tracing policy's
    /// ownership label. Failure is not fatal; the alert still goes out
    /// with a null policy name.
    async fn resolve(&self, tracing_policy_name: &str) -> Option<String> {
        match self.client.get_tracing_policy(tracing_policy_name).await {
            Ok(tracing_policy) => {
                let label = tracing_policy.meta.labels.get(POLICY_LABEL_KEY).cloned();
                if label.is_none() {
                    warn!(
                        tracing_policy = %tracing_policy_name,
                        "tracing policy carries no deception-policy label"
                    );
                }
                label
            }
            Err(err) => {
                warn!(
                    tracing_policy = %tracing_policy_name,
                    error = %err,
                    "failed to resolve deception policy"
                );
                None
            }
        }
    }
}

/// Find `policy_name` under any top-level event key (`process_kprobe`,
/// `process_uprobe`, ...).
fn extract_tracing_policy_name(event: &Value) -> Option<String> {
    let object = event.as_object()?;
    for value in object.values() {
        if let Some(name) = value.get("policy_name").and_then(Value::as_str) {
            return Some(name.to_string());
        }
    }
    None
}

/// Decide the trap kind from the probed function and argument shape.
fn classify(event: &Value) -> (TrapKind, serde_json::Map<String, Value>) {
    let Some(kprobe) = event.get("process_kprobe") else {
        return (TrapKind::Unknown, serde_json::Map::new());
    };
    let function_name = kprobe
        .get("function_name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !FILE_ACCESS_FUNCTIONS.contains(&function_name) {
        return (TrapKind::Unknown, serde_json::Map::new());
    }

    let file_path = kprobe
        .get("args")
        .and_then(Value::as_array)
        .and_then(|args| args.first())
        .and_then(|arg| arg.get("file_arg"))
        .and_then(|file_arg| file_arg.get("path"))
        .and_then(Value::as_str);

    let mut metadata = serde_json::Map::new();
    metadata.insert(
        "file_path".to_string(),
        file_path.map_or(Value::Null, |p| Value::String(p.to_string())),
    );
    (TrapKind::FilesystemHoneytoken, metadata)
}

/// Pod identity from the process metadata under any top-level key.
fn extract_pod(event: &Value) -> Option<PodInfo> {
    let object = event.as_object()?;
    for value in object.values() {
        let Some(pod) = value.get("process").and_then(|p| p.get("pod")) else {
            continue;
        };
        let container = pod.get("container");
        return Some(PodInfo {
            name: string_field(pod, "name"),
            namespace: string_field(pod, "namespace"),
            container: ContainerInfo {
                id: container.map(|c| string_field(c, "id")).unwrap_or_default(),
                name: container
                    .map(|c| string_field(c, "name"))
                    .unwrap_or_default(),
            },
        });
    }
    None
}

/// Process metadata under any top-level key.
fn extract_process(event: &Value) -> Option<ProcessInfo> {
    let object = event.as_object()?;
    for value in object.values() {
        let Some(process) = value.get("process") else {
            continue;
        };
        return Some(ProcessInfo {
            pid: process.get("pid").and_then(Value::as_i64).unwrap_or(0),
            cwd: string_field(process, "cwd"),
            binary: string_field(process, "binary"),
            arguments: string_field(process, "arguments"),
        });
    }
    None
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_normalization() {
        let line = r#"{"time":"2025-06-01T12:00:00.123456789Z","process_kprobe":{}}"#;
        let normalized = TIME_PATTERN.replace_all(line, "$1$2");
        assert!(normalized.contains(r#""time":"2025-06-01T12:00:00Z""#));
    }

    #[test]
    fn test_extract_tracing_policy_name_walks_keys() {
        let event: Value = serde_json::json!({
            "node_name": "worker-1",
            "process_kprobe": { "policy_name": "koney-tracing-policy-abc" }
        });
        assert_eq!(
            extract_tracing_policy_name(&event).unwrap(),
            "koney-tracing-policy-abc"
        );
    }

    #[test]
    fn test_classify_file_access() {
        let event: Value = serde_json::json!({
            "process_kprobe": {
                "function_name": "security_file_permission",
                "args": [ { "file_arg": { "path": "/tmp/auth_token.json" } } ]
            }
        });
        let (kind, metadata) = classify(&event);
        assert_eq!(kind, TrapKind::FilesystemHoneytoken);
        assert_eq!(metadata.get("file_path").unwrap(), "/tmp/auth_token.json");
    }

    #[test]
    fn test_classify_unknown_function() {
        let event: Value = serde_json::json!({
            "process_kprobe": { "function_name": "security_bprm_check" }
        });
        let (kind, metadata) = classify(&event);
        assert_eq!(kind, TrapKind::Unknown);
        assert!(metadata.is_empty());
    }

    #[test]
    fn test_missing_args_yield_null_path() {
        let event: Value = serde_json::json!({
            "process_kprobe": { "function_name": "security_mmap_file" }
        });
        let (kind, metadata) = classify(&event);
        assert_eq!(kind, TrapKind::FilesystemHoneytoken);
        assert_eq!(metadata.get("file_path").unwrap(), &Value::Null);
    }
}
