//! The policy-to-artifact planner.
//!
//! For one policy revision, the planner computes the set of target
//! workloads per trap and, within each workload, the set of matching
//! containers. It holds no state of its own; plans are recomputed from
//! cluster state on every pass, so a restarted controller picks up
//! exactly where the cluster is.

use koney_core::api::{DeceptionPolicy, Trap};
use koney_core::cluster::{ClusterClient, ClusterError, Workload};
use koney_core::matching::{self, MatchError};
use koney_core::identity::{self, IdentityError};
use thiserror::Error;

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Listing workloads failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// A trap could not be canonicalized.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// A container selector failed to compile. Validation runs before
    /// planning, so this indicates a validation gap.
    #[error(transparent)]
    Match(#[from] MatchError),
}

/// The plan for one trap: where its decoy goes.
#[derive(Debug, Clone)]
pub struct TrapPlan {
    /// Index of the trap in the policy spec.
    pub index: usize,

    /// The trap itself.
    pub trap: Trap,

    /// Full identity token.
    pub trap_id: String,

    /// Target workloads with their matching containers.
    pub targets: Vec<TrapTarget>,
}

/// One target workload of a trap.
#[derive(Debug, Clone)]
pub struct TrapTarget {
    /// Snapshot of the workload at planning time.
    pub workload: Workload,

    /// Names of the template containers the trap selects.
    pub containers: Vec<String>,
}

/// Compute plans for the given traps of a policy.
///
/// Workloads with no matching containers are dropped from the target
/// set. When `mutateExisting` is false, workloads older than the policy
/// are excluded: only resources created after the policy receive
/// spec-level decoys, and runtime injection covers only pods that
/// appear from then on.
///
/// # Errors
///
/// Returns [`PlanError`] when the cluster cannot be listed or a trap
/// cannot be identified.
pub async fn plan_policy(
    client: &dyn ClusterClient,
    policy: &DeceptionPolicy,
    traps: &[(usize, Trap)],
) -> Result<Vec<TrapPlan>, PlanError> {
    let workloads = client.list_workloads().await?;
    let mut plans = Vec::with_capacity(traps.len());

    for (index, trap) in traps {
        let trap_id = identity::trap_id(trap)?;
        let mut targets = Vec::new();

        for workload in &workloads {
            if !matching::workload_matches(workload, &trap.match_resources) {
                continue;
            }
            if !policy.spec.mutate_existing && predates(workload, policy) {
                continue;
            }
            let containers = matching_containers(workload, trap)?;
            if containers.is_empty() {
                continue;
            }
            targets.push(TrapTarget {
                workload: workload.clone(),
                containers,
            });
        }

        plans.push(TrapPlan {
            index: *index,
            trap: trap.clone(),
            trap_id,
            targets,
        });
    }

    Ok(plans)
}

/// Whether the workload was created before the policy.
fn predates(workload: &Workload, policy: &DeceptionPolicy) -> bool {
    match (
        workload.meta.creation_timestamp,
        policy.metadata.creation_timestamp,
    ) {
        (Some(workload_created), Some(policy_created)) => workload_created < policy_created,
        // Without timestamps there is nothing to compare; treat the
        // workload as pre-existing, the conservative reading.
        _ => true,
    }
}

/// The template containers selected by any filter that also selects the
/// workload.
fn matching_containers(workload: &Workload, trap: &Trap) -> Result<Vec<String>, MatchError> {
    let mut names = Vec::new();
    for container in &workload.template.containers {
        for filter in &trap.match_resources.any {
            if !matching::filter_matches(workload, filter)
                || !matching::container_matches(&filter.container_selector, &container.name)?
            {
                continue;
            }
            names.push(container.name.clone());
            break;
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use koney_core::api::{ResourceFilter, ResourceFilters};
    use koney_core::cluster::{
        ContainerSpec, InMemoryCluster, ObjectMeta, PodTemplate, WorkloadKind,
    };

    use super::*;

    fn labeled_workload(name: &str, labels: &[(&str, &str)], containers: &[&str]) -> Workload {
        let mut template = PodTemplate::default();
        for (k, v) in labels {
            template.labels.insert((*k).to_string(), (*v).to_string());
        }
        for container in containers {
            template.containers.push(ContainerSpec::named(*container));
        }
        let mut meta = ObjectMeta::namespaced("default", name);
        meta.labels = template.labels.clone();
        Workload {
            meta,
            kind: WorkloadKind::Deployment,
            replicas: 2,
            template,
        }
    }

    fn honeytoken_trap(labels: &[(&str, &str)], container_selector: &str) -> Trap {
        let mut trap = Trap::filesystem_honeytoken("/tmp/auth_token.json", "{}", true);
        trap.match_resources = ResourceFilters {
            any: vec![ResourceFilter {
                namespaces: Vec::new(),
                selector: Some(koney_core::api::LabelSelector {
                    match_labels: labels
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect::<BTreeMap<_, _>>(),
                    match_expressions: Vec::new(),
                }),
                container_selector: container_selector.to_string(),
            }],
        };
        trap
    }

    #[tokio::test]
    async fn test_plan_selects_matching_workloads_and_containers() {
        let cluster = InMemoryCluster::new();
        cluster
            .seed_workload(labeled_workload(
                "nginx",
                &[("demo.koney/honeytoken", "true")],
                &["nginx", "sidecar"],
            ))
            .await;
        cluster
            .seed_workload(labeled_workload("redis", &[("app", "redis")], &["redis"]))
            .await;

        let trap = honeytoken_trap(&[("demo.koney/honeytoken", "true")], "glob:ng*");
        let policy = DeceptionPolicy::new("p1", vec![trap.clone()]);

        let plans = plan_policy(&cluster, &policy, &[(0, trap)]).await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].targets.len(), 1);
        assert_eq!(plans[0].targets[0].workload.meta.name, "nginx");
        assert_eq!(plans[0].targets[0].containers, vec!["nginx".to_string()]);
    }

    #[tokio::test]
    async fn test_mutate_existing_false_skips_preexisting_workloads() {
        let cluster = InMemoryCluster::new();
        cluster
            .seed_workload(labeled_workload(
                "nginx",
                &[("demo.koney/honeytoken", "true")],
                &["nginx"],
            ))
            .await;

        let trap = honeytoken_trap(&[("demo.koney/honeytoken", "true")], "");
        let mut policy = DeceptionPolicy::new("p1", vec![trap.clone()]);
        policy.spec.mutate_existing = false;
        // The policy appears after the workload.
        policy.metadata.creation_timestamp = Some(chrono::Utc::now() + chrono::Duration::hours(1));

        let plans = plan_policy(&cluster, &policy, &[(0, trap)]).await.unwrap();
        assert!(plans[0].targets.is_empty());
    }

    #[tokio::test]
    async fn test_workloads_without_matching_containers_are_dropped() {
        let cluster = InMemoryCluster::new();
        cluster
            .seed_workload(labeled_workload(
                "redis",
                &[("demo.koney/honeytoken", "true")],
                &["redis"],
            ))
            .await;

        let trap = honeytoken_trap(&[("demo.koney/honeytoken", "true")], "regex:^db[0-9]+$");
        let policy = DeceptionPolicy::new("p1", vec![trap.clone()]);

        let plans = plan_policy(&cluster, &policy, &[(0, trap)]).await.unwrap();
        assert!(plans[0].targets.is_empty());
    }
}
