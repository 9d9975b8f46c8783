//! End-to-end ingestion scenarios against the in-memory cluster.

use std::sync::Arc;
use std::time::Duration;

use koney_core::api::{TrapKind, POLICY_LABEL_KEY};
use koney_core::cluster::{
    ClusterClient, InMemoryCluster, ObjectMeta, TetragonSpec, TracingPolicy, TracingPolicySpec,
};
use koney_core::fingerprint;
use koney_forwarder::sink::MemorySink;
use koney_forwarder::Pipeline;

const TRACING_POLICY: &str = "koney-tracing-policy-1234567890abcdef";
const WINDOW: Duration = Duration::from_secs(60);

async fn cluster_with_tracing_policy() -> Arc<InMemoryCluster> {
    let cluster = Arc::new(InMemoryCluster::new());
    let mut meta = ObjectMeta::cluster_scoped(TRACING_POLICY);
    meta.labels
        .insert(POLICY_LABEL_KEY.to_string(), "demo-policy".to_string());
    cluster
        .apply_tracing_policy(&TracingPolicy {
            meta,
            spec: TracingPolicySpec::Tetragon(TetragonSpec::default()),
        })
        .await
        .unwrap();
    cluster
}

fn event_line(policy_name: &str, arguments: &str, nanos: &str) -> String {
    serde_json::json!({
        "time": format!("2025-06-01T12:00:00.{nanos}Z"),
        "process_kprobe": {
            "policy_name": policy_name,
            "function_name": "security_file_permission",
            "args": [ { "file_arg": { "path": "/tmp/auth_token.json" } } ],
            "process": {
                "pid": 4242,
                "cwd": "/",
                "binary": "/usr/bin/cat",
                "arguments": arguments,
                "pod": {
                    "name": "nginx-1",
                    "namespace": "default",
                    "container": { "id": "containerd://abc", "name": "nginx" }
                }
            }
        }
    })
    .to_string()
}

fn pipeline_over(cluster: &Arc<InMemoryCluster>, sink: &Arc<MemorySink>) -> Pipeline {
    let client: Arc<dyn ClusterClient> = cluster.clone();
    let sink: Arc<dyn koney_forwarder::sink::AlertSink> = sink.clone();
    Pipeline::new(client, sink)
}

// E5: the self-induced access is dropped, the attacker access emitted.
#[tokio::test]
async fn fingerprinted_events_are_dropped_and_others_emitted() {
    let cluster = cluster_with_tracing_policy().await;
    let sink = Arc::new(MemorySink::new());
    let pipeline = pipeline_over(&cluster, &sink);

    // The controller's own write: cat-form encoding of 1337.
    let cat_form = fingerprint::encode_in_cat(1337);
    assert_eq!(cat_form, "-uu -u -uu -u -u -uu -uu -uu -u -u -uu");
    cluster
        .push_probe_log(event_line(TRACING_POLICY, &cat_form, "111111111"))
        .await;

    // A real access.
    cluster
        .push_probe_log(event_line(TRACING_POLICY, "/tmp/auth_token.json", "222222222"))
        .await;

    let summary = pipeline.scan(WINDOW).await.unwrap();
    assert_eq!(summary.filtered, 1);
    assert_eq!(summary.emitted, 1);

    let alerts = sink.alerts();
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.trap_type, TrapKind::FilesystemHoneytoken);
    assert_eq!(
        alert.metadata.get("file_path").unwrap(),
        "/tmp/auth_token.json"
    );
    assert_eq!(alert.deception_policy_name.as_deref(), Some("demo-policy"));
    assert_eq!(alert.timestamp, "2025-06-01T12:00:00Z");

    let pod = alert.pod.as_ref().unwrap();
    assert_eq!(pod.name, "nginx-1");
    assert_eq!(pod.namespace, "default");
    assert_eq!(pod.container.name, "nginx");

    let process = alert.process.as_ref().unwrap();
    assert_eq!(process.pid, 4242);
    assert_eq!(process.binary, "/usr/bin/cat");
}

// The echo form is filtered too.
#[tokio::test]
async fn echo_fingerprint_is_filtered() {
    let cluster = cluster_with_tracing_policy().await;
    let sink = Arc::new(MemorySink::new());
    let pipeline = pipeline_over(&cluster, &sink);

    let arguments = format!("-c echo x > /tmp/t {}", fingerprint::encode_in_echo(1337));
    cluster
        .push_probe_log(event_line(TRACING_POLICY, &arguments, "000000001"))
        .await;

    let summary = pipeline.scan(WINDOW).await.unwrap();
    assert_eq!(summary.filtered, 1);
    assert!(sink.alerts().is_empty());
}

// Replayed lines deduplicate, including across scans and across
// sub-second timestamp jitter.
#[tokio::test]
async fn replayed_events_deduplicate() {
    let cluster = cluster_with_tracing_policy().await;
    let sink = Arc::new(MemorySink::new());
    let pipeline = pipeline_over(&cluster, &sink);

    cluster
        .push_probe_log(event_line(TRACING_POLICY, "/tmp/auth_token.json", "111111111"))
        .await;
    // Same event, different nanosecond stamp.
    cluster
        .push_probe_log(event_line(TRACING_POLICY, "/tmp/auth_token.json", "999999999"))
        .await;

    let summary = pipeline.scan(WINDOW).await.unwrap();
    assert_eq!(summary.emitted, 1);
    assert_eq!(summary.duplicates, 1);

    // The next scan replays the same window; nothing new is emitted.
    let summary = pipeline.scan(WINDOW).await.unwrap();
    assert_eq!(summary.emitted, 0);
    assert_eq!(summary.duplicates, 2);
    assert_eq!(sink.alerts().len(), 1);
}

// A failed resolution still emits the alert, with a null policy name.
#[tokio::test]
async fn unresolvable_policies_emit_with_null_name() {
    let cluster = Arc::new(InMemoryCluster::new());
    let sink = Arc::new(MemorySink::new());
    let pipeline = pipeline_over(&cluster, &sink);

    cluster
        .push_probe_log(event_line(
            "koney-tracing-policy-feedfacefeedface",
            "/tmp/auth_token.json",
            "111111111",
        ))
        .await;

    let summary = pipeline.scan(WINDOW).await.unwrap();
    assert_eq!(summary.emitted, 1);
    assert_eq!(sink.alerts()[0].deception_policy_name, None);
}

// Lines without the tracing-policy prefix or without valid JSON never
// become alerts.
#[tokio::test]
async fn irrelevant_and_malformed_lines_are_dropped() {
    let cluster = cluster_with_tracing_policy().await;
    let sink = Arc::new(MemorySink::new());
    let pipeline = pipeline_over(&cluster, &sink);

    cluster
        .push_probe_log("some unrelated log chatter".to_string())
        .await;
    cluster
        .push_probe_log(format!("not json but mentions {TRACING_POLICY}"))
        .await;

    let summary = pipeline.scan(WINDOW).await.unwrap();
    assert_eq!(summary.emitted, 0);
    assert_eq!(summary.malformed, 1);
    assert!(sink.alerts().is_empty());
}

// Events from foreign tetragon policies are ignored even when the line
// mentions a koney policy elsewhere.
#[tokio::test]
async fn foreign_policy_events_are_skipped() {
    let cluster = cluster_with_tracing_policy().await;
    let sink = Arc::new(MemorySink::new());
    let pipeline = pipeline_over(&cluster, &sink);

    let line = serde_json::json!({
        "time": "2025-06-01T12:00:00.000000000Z",
        // Mentions the prefix in an unrelated field, but the policy
        // name itself is foreign.
        "note": "seen near koney-tracing-policy-1234567890abcdef",
        "process_kprobe": { "policy_name": "cluster-baseline-policy" }
    })
    .to_string();
    cluster.push_probe_log(line).await;

    let summary = pipeline.scan(WINDOW).await.unwrap();
    assert_eq!(summary.emitted, 0);
    assert!(sink.alerts().is_empty());
}
