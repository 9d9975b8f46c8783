//! Captor artifact generation.
//!
//! For each unique monitoring identity among a policy's traps, one
//! tracing-policy object is built and registered with the kernel-probe
//! host. Names derive from content, so identical traps across policies
//! collapse onto one object; apply uses create-or-update semantics and
//! merges owner references, never duplicating.
//!
//! The tetragon document hooks `security_file_permission` (the common
//! execution point of read/write syscalls) and `security_mmap_file`
//! (memory-mapped access); `security_path_truncate` is deliberately not
//! hooked, it fails BPF compilation on some kernels.

use koney_core::api::{CaptorStrategy, DeceptionPolicy, Trap, POLICY_LABEL_KEY};
use koney_core::cluster::{
    ActionSelector, ArgSelector, KiveSpec, KiveTrap, KiveTrapMatch, KprobeArg, KprobeSelector,
    KprobeSpec, ObjectMeta, OwnerReference, TetragonSpec, TracingPolicy, TracingPolicySpec,
};
use koney_core::identity::{self, IdentityError};
use koney_core::matching;

/// Webhook URL the probe host calls when a captor fires.
#[must_use]
pub fn webhook_url(engine: CaptorStrategy, namespace: &str) -> String {
    format!(
        "http://koney-alert-forwarder-webhook.{namespace}.svc:8000/handlers/{}",
        engine.as_str()
    )
}

/// Build the tracing policy for one trap.
///
/// # Errors
///
/// Returns [`IdentityError`] when the trap cannot be canonicalized.
pub fn build_tracing_policy(
    policy: &DeceptionPolicy,
    trap: &Trap,
    operator_namespace: &str,
) -> Result<Option<TracingPolicy>, IdentityError> {
    let Some(token) = &trap.filesystem_honeytoken else {
        return Ok(None);
    };

    let name = identity::tracing_policy_name(trap)?;
    let mut meta = ObjectMeta::cluster_scoped(&name);
    meta.labels.insert(
        POLICY_LABEL_KEY.to_string(),
        policy.metadata.name.clone(),
    );
    meta.owner_references
        .push(OwnerReference::controller_of(policy));

    let engine = trap.captor_deployment.strategy;
    let url = webhook_url(engine, operator_namespace);
    let spec = match engine {
        CaptorStrategy::Tetragon => {
            TracingPolicySpec::Tetragon(tetragon_spec(trap, &token.file_path, &url))
        }
        CaptorStrategy::Kive => TracingPolicySpec::Kive(kive_spec(trap, &token.file_path, &url)),
    };

    Ok(Some(TracingPolicy { meta, spec }))
}

/// One kprobe watching `call` for the decoy path, posting to the
/// webhook on match.
fn file_access_probe(call: &str, file_path: &str, url: &str) -> KprobeSpec {
    KprobeSpec {
        call: call.to_string(),
        syscall: false,
        return_value: true,
        args: vec![KprobeArg {
            index: 0,
            // The kernel file struct carries the resolved path.
            arg_type: "file".to_string(),
        }],
        return_arg: Some(KprobeArg {
            index: 0,
            arg_type: "int".to_string(),
        }),
        return_arg_action: Some("Post".to_string()),
        selectors: vec![KprobeSelector {
            match_args: vec![ArgSelector {
                index: 0,
                operator: "Equal".to_string(),
                values: vec![file_path.to_string()],
            }],
            match_actions: vec![ActionSelector {
                action: "GetUrl".to_string(),
                arg_url: url.to_string(),
            }],
        }],
    }
}

fn tetragon_spec(trap: &Trap, file_path: &str, url: &str) -> TetragonSpec {
    let mut spec = TetragonSpec {
        pod_selector: koney_core::api::LabelSelector::default(),
        container_selector: None,
        kprobes: vec![
            file_access_probe("security_file_permission", file_path, url),
            file_access_probe("security_mmap_file", file_path, url),
        ],
    };

    // Union of every filter's matchLabels.
    for filter in &trap.match_resources.any {
        if let Some(selector) = &filter.selector {
            for (key, value) in &selector.match_labels {
                spec.pod_selector
                    .match_labels
                    .insert(key.clone(), value.clone());
            }
        }
    }

    // Container filtering: any match-all selector wins and removes the
    // filter entirely; otherwise the literal names concatenate into one
    // `In` expression on the container name attribute.
    let mut names: Vec<String> = Vec::new();
    let mut match_all = false;
    for filter in &trap.match_resources.any {
        if matching::selects_all_containers(&filter.container_selector) {
            match_all = true;
            break;
        }
        if !names.contains(&filter.container_selector) {
            names.push(filter.container_selector.clone());
        }
    }
    if !match_all && !names.is_empty() {
        spec.container_selector = Some(koney_core::api::LabelSelector {
            match_labels: std::collections::BTreeMap::new(),
            match_expressions: vec![koney_core::api::LabelSelectorRequirement {
                key: "name".to_string(),
                operator: koney_core::api::LabelSelectorOperator::In,
                values: names,
            }],
        });
    }

    spec
}

fn kive_spec(trap: &Trap, file_path: &str, url: &str) -> KiveSpec {
    let mut kive_trap = KiveTrap {
        path: file_path.to_string(),
        callback: url.to_string(),
        match_any: Vec::new(),
    };

    // All filters' matchLabels union into each match term, mirroring
    // the pod-selector composition of the tetragon document.
    let mut union_labels = std::collections::BTreeMap::new();
    for filter in &trap.match_resources.any {
        if let Some(selector) = &filter.selector {
            for (key, value) in &selector.match_labels {
                union_labels.insert(key.clone(), value.clone());
            }
        }
    }

    for filter in &trap.match_resources.any {
        if filter.namespaces.is_empty() {
            kive_trap.match_any.push(KiveTrapMatch {
                namespace: String::new(),
                container_name: filter.container_selector.clone(),
                match_labels: union_labels.clone(),
            });
        } else {
            for namespace in &filter.namespaces {
                kive_trap.match_any.push(KiveTrapMatch {
                    namespace: namespace.clone(),
                    container_name: filter.container_selector.clone(),
                    match_labels: union_labels.clone(),
                });
            }
        }
    }

    KiveSpec {
        traps: vec![kive_trap],
    }
}
