//! In-memory cluster.
//!
//! A faithful stand-in for the cluster API used by every test and by
//! the daemons' standalone mode: optimistic concurrency on writes,
//! finalizer-gated deletion, owner-reference merging on apply, and a
//! watch stream. It also counts mutating calls so tests can assert
//! idempotence (a second reconcile of an unchanged policy must not
//! write anything).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{
    AdmissionRule, ClusterClient, ClusterError, ClusterEvent, Pod, Secret, TracingPolicy, Workload,
};
use crate::api::{DeceptionPolicy, PolicyStatus};

/// Capacity of the watch channel.
const WATCH_CAPACITY: usize = 256;

/// One recorded exec call, for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecInvocation {
    /// Pod namespace.
    pub namespace: String,
    /// Pod name.
    pub pod: String,
    /// Container name.
    pub container: String,
    /// The executed command.
    pub command: Vec<String>,
}

#[derive(Default)]
struct ClusterState {
    policies: BTreeMap<String, DeceptionPolicy>,
    workloads: BTreeMap<(String, String), Workload>,
    pods: BTreeMap<(String, String), Pod>,
    secrets: BTreeMap<(String, String), Secret>,
    tracing_policies: BTreeMap<String, TracingPolicy>,
    admission_rules: BTreeMap<String, AdmissionRule>,
    leases: BTreeMap<String, LeaseRecord>,
    probe_log: Vec<(DateTime<Utc>, String)>,
    execs: Vec<ExecInvocation>,
    /// Number of conflicts to inject into upcoming workload writes.
    workload_conflicts_to_inject: u32,
    /// Count of mutating API calls that changed stored state.
    mutations: u64,
    next_uid: u64,
}

struct LeaseRecord {
    holder: String,
    expires_at: Instant,
}

impl ClusterState {
    fn fresh_uid(&mut self) -> String {
        self.next_uid += 1;
        format!("uid-{:08x}", self.next_uid)
    }
}

/// The in-memory [`ClusterClient`] implementation.
pub struct InMemoryCluster {
    state: RwLock<ClusterState>,
    events: broadcast::Sender<ClusterEvent>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    /// Create an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: RwLock::new(ClusterState::default()),
            events,
        }
    }

    fn emit(&self, event: ClusterEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Number of mutating API calls that changed stored state.
    pub async fn mutation_count(&self) -> u64 {
        self.state.read().await.mutations
    }

    /// All exec calls performed so far.
    pub async fn exec_invocations(&self) -> Vec<ExecInvocation> {
        self.state.read().await.execs.clone()
    }

    /// Inject `count` conflicts into upcoming workload writes.
    pub async fn inject_workload_conflicts(&self, count: u32) {
        self.state.write().await.workload_conflicts_to_inject = count;
    }

    /// Append a probe-host log line stamped now.
    pub async fn push_probe_log(&self, line: impl Into<String>) {
        self.state
            .write()
            .await
            .probe_log
            .push((Utc::now(), line.into()));
    }

    /// Seed a policy as the user would create it.
    pub async fn create_policy(&self, mut policy: DeceptionPolicy) {
        let mut state = self.state.write().await;
        policy.metadata.uid = state.fresh_uid();
        policy.metadata.resource_version = 1;
        if policy.metadata.creation_timestamp.is_none() {
            policy.metadata.creation_timestamp = Some(Utc::now());
        }
        let name = policy.metadata.name.clone();
        state.policies.insert(name.clone(), policy);
        drop(state);
        self.emit(ClusterEvent::PolicyChanged { name });
    }

    /// Request deletion of a policy, as the user would. With finalizers
    /// present this only stamps the deletion timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::NotFound`] when the policy is absent.
    pub async fn delete_policy(&self, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.write().await;
        let Some(policy) = state.policies.get_mut(name) else {
            return Err(ClusterError::NotFound {
                kind: "DeceptionPolicy",
                name: name.to_string(),
            });
        };
        if policy.metadata.finalizers.is_empty() {
            state.policies.remove(name);
        } else if policy.metadata.deletion_timestamp.is_none() {
            policy.metadata.deletion_timestamp = Some(Utc::now());
            policy.metadata.resource_version += 1;
        }
        drop(state);
        self.emit(ClusterEvent::PolicyChanged {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Whether a policy object still exists.
    pub async fn policy_exists(&self, name: &str) -> bool {
        self.state.read().await.policies.contains_key(name)
    }

    /// Seed a workload and one running pod per replica.
    pub async fn seed_workload(&self, mut workload: Workload) {
        let mut state = self.state.write().await;
        workload.meta.uid = state.fresh_uid();
        workload.meta.resource_version = 1;
        if workload.meta.creation_timestamp.is_none() {
            workload.meta.creation_timestamp = Some(Utc::now());
        }
        let key = (workload.meta.namespace.clone(), workload.meta.name.clone());
        spawn_pods(&mut state, &workload);
        state.workloads.insert(key.clone(), workload);
        drop(state);
        self.emit(ClusterEvent::WorkloadChanged {
            namespace: key.0,
            name: key.1,
        });
    }

    /// Replace a workload's pods with fresh ones stamped from the
    /// current template, simulating a completed rollout.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::NotFound`] when the workload is absent.
    pub async fn complete_rollout(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.write().await;
        let Some(workload) = state
            .workloads
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
        else {
            return Err(ClusterError::NotFound {
                kind: "Workload",
                name: format!("{namespace}/{name}"),
            });
        };
        state
            .pods
            .retain(|_, pod| !pod_belongs_to(pod, &workload));
        spawn_pods(&mut state, &workload);
        drop(state);
        self.emit(ClusterEvent::WorkloadChanged {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    /// All secrets currently stored, for test assertions.
    pub async fn secret_names(&self, namespace: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .secrets
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

fn pod_belongs_to(pod: &Pod, workload: &Workload) -> bool {
    pod.meta.namespace == workload.meta.namespace
        && pod
            .meta
            .name
            .starts_with(&format!("{}-", workload.meta.name))
}

fn spawn_pods(state: &mut ClusterState, workload: &Workload) {
    let template_hash = workload.template.content_hash();
    for _ in 0..workload.replicas {
        state.next_uid += 1;
        let pod_name = format!("{}-{:05x}", workload.meta.name, state.next_uid);
        let mut meta = super::ObjectMeta::namespaced(&workload.meta.namespace, &pod_name);
        meta.uid = state.fresh_uid();
        meta.labels = workload.template.labels.clone();
        let containers = workload
            .template
            .containers
            .iter()
            .map(|c| super::ContainerStatus {
                id: format!("containerd://{}-{}", pod_name, c.name),
                name: c.name.clone(),
            })
            .collect();
        state.pods.insert(
            (workload.meta.namespace.clone(), pod_name),
            Pod {
                meta,
                template_hash: template_hash.clone(),
                running: true,
                containers,
            },
        );
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn ping(&self) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn list_policies(&self) -> Result<Vec<DeceptionPolicy>, ClusterError> {
        Ok(self.state.read().await.policies.values().cloned().collect())
    }

    async fn get_policy(&self, name: &str) -> Result<DeceptionPolicy, ClusterError> {
        self.state
            .read()
            .await
            .policies
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "DeceptionPolicy",
                name: name.to_string(),
            })
    }

    async fn update_policy(
        &self,
        policy: &DeceptionPolicy,
    ) -> Result<DeceptionPolicy, ClusterError> {
        let mut state = self.state.write().await;
        let name = policy.metadata.name.clone();
        let Some(stored) = state.policies.get(&name) else {
            return Err(ClusterError::NotFound {
                kind: "DeceptionPolicy",
                name,
            });
        };
        if stored.metadata.resource_version != policy.metadata.resource_version {
            return Err(ClusterError::Conflict {
                kind: "DeceptionPolicy",
                name,
                submitted: policy.metadata.resource_version,
                current: stored.metadata.resource_version,
            });
        }

        let mut updated = policy.clone();
        updated.status = stored.status.clone();
        updated.metadata.resource_version += 1;

        // Finalizer-gated deletion: dropping the last finalizer on a
        // deleting object removes it.
        if updated.metadata.deletion_timestamp.is_some() && updated.metadata.finalizers.is_empty() {
            state.policies.remove(&name);
        } else {
            state.policies.insert(name.clone(), updated.clone());
        }
        state.mutations += 1;
        drop(state);
        self.emit(ClusterEvent::PolicyChanged { name });
        Ok(updated)
    }

    async fn update_policy_status(
        &self,
        name: &str,
        resource_version: u64,
        status: &PolicyStatus,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.write().await;
        let Some(stored) = state.policies.get_mut(name) else {
            return Err(ClusterError::NotFound {
                kind: "DeceptionPolicy",
                name: name.to_string(),
            });
        };
        if stored.metadata.resource_version != resource_version {
            return Err(ClusterError::Conflict {
                kind: "DeceptionPolicy",
                name: name.to_string(),
                submitted: resource_version,
                current: stored.metadata.resource_version,
            });
        }
        stored.status = status.clone();
        stored.metadata.resource_version += 1;
        state.mutations += 1;
        // Status writes do not re-trigger reconciliation.
        Ok(())
    }

    async fn list_workloads(&self) -> Result<Vec<Workload>, ClusterError> {
        Ok(self
            .state
            .read()
            .await
            .workloads
            .values()
            .cloned()
            .collect())
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Workload, ClusterError> {
        self.state
            .read()
            .await
            .workloads
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "Workload",
                name: format!("{namespace}/{name}"),
            })
    }

    async fn update_workload(&self, workload: &Workload) -> Result<Workload, ClusterError> {
        let mut state = self.state.write().await;
        let key = (workload.meta.namespace.clone(), workload.meta.name.clone());
        if state.workload_conflicts_to_inject > 0 {
            state.workload_conflicts_to_inject -= 1;
            let current = state
                .workloads
                .get(&key)
                .map_or(0, |w| w.meta.resource_version);
            return Err(ClusterError::Conflict {
                kind: "Workload",
                name: format!("{}/{}", key.0, key.1),
                submitted: workload.meta.resource_version,
                current,
            });
        }
        let Some(stored) = state.workloads.get_mut(&key) else {
            return Err(ClusterError::NotFound {
                kind: "Workload",
                name: format!("{}/{}", key.0, key.1),
            });
        };
        if stored.meta.resource_version != workload.meta.resource_version {
            return Err(ClusterError::Conflict {
                kind: "Workload",
                name: format!("{}/{}", key.0, key.1),
                submitted: workload.meta.resource_version,
                current: stored.meta.resource_version,
            });
        }
        let mut updated = workload.clone();
        updated.meta.resource_version += 1;
        *stored = updated.clone();
        state.mutations += 1;
        drop(state);
        self.emit(ClusterEvent::WorkloadChanged {
            namespace: key.0,
            name: key.1,
        });
        Ok(updated)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, ClusterError> {
        Ok(self
            .state
            .read()
            .await
            .pods
            .values()
            .filter(|pod| {
                pod.running
                    && pod.meta.namespace == namespace
                    && selector
                        .iter()
                        .all(|(k, v)| pod.meta.labels.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }

    async fn exec_in_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<(), ClusterError> {
        let mut state = self.state.write().await;
        let Some(stored) = state
            .pods
            .get(&(namespace.to_string(), pod.to_string()))
        else {
            return Err(ClusterError::ExecFailed {
                namespace: namespace.to_string(),
                pod: pod.to_string(),
                container: container.to_string(),
                reason: "pod not found".to_string(),
            });
        };
        if !stored.running {
            return Err(ClusterError::ExecFailed {
                namespace: namespace.to_string(),
                pod: pod.to_string(),
                container: container.to_string(),
                reason: "pod not running".to_string(),
            });
        }
        if !stored.containers.iter().any(|c| c.name == container) {
            return Err(ClusterError::ExecFailed {
                namespace: namespace.to_string(),
                pod: pod.to_string(),
                container: container.to_string(),
                reason: "container not found".to_string(),
            });
        }
        state.execs.push(ExecInvocation {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container: container.to_string(),
            command: command.to_vec(),
        });
        Ok(())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError> {
        Ok(self
            .state
            .read()
            .await
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), ClusterError> {
        let mut state = self.state.write().await;
        let key = (secret.meta.namespace.clone(), secret.meta.name.clone());
        if state.secrets.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind: "Secret",
                name: format!("{}/{}", key.0, key.1),
            });
        }
        let mut stored = secret.clone();
        stored.meta.uid = state.fresh_uid();
        stored.meta.resource_version = 1;
        state.secrets.insert(key, stored);
        state.mutations += 1;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.write().await;
        let key = (namespace.to_string(), name.to_string());
        if state.secrets.remove(&key).is_none() {
            return Err(ClusterError::NotFound {
                kind: "Secret",
                name: format!("{namespace}/{name}"),
            });
        }
        state.mutations += 1;
        Ok(())
    }

    async fn list_tracing_policies(
        &self,
        label: Option<(&str, &str)>,
    ) -> Result<Vec<TracingPolicy>, ClusterError> {
        Ok(self
            .state
            .read()
            .await
            .tracing_policies
            .values()
            .filter(|tp| label.is_none_or(|(k, v)| tp.meta.has_label(k, v)))
            .cloned()
            .collect())
    }

    async fn get_tracing_policy(&self, name: &str) -> Result<TracingPolicy, ClusterError> {
        self.state
            .read()
            .await
            .tracing_policies
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "TracingPolicy",
                name: name.to_string(),
            })
    }

    async fn apply_tracing_policy(&self, policy: &TracingPolicy) -> Result<(), ClusterError> {
        let mut state = self.state.write().await;
        let name = policy.meta.name.clone();
        if let Some(stored) = state.tracing_policies.get(&name).cloned() {
            // Union owner references by uid, keep the newest labels/spec.
            let mut merged = policy.clone();
            merged.meta.uid = stored.meta.uid.clone();
            merged.meta.resource_version = stored.meta.resource_version;
            for owner in &stored.meta.owner_references {
                if !merged
                    .meta
                    .owner_references
                    .iter()
                    .any(|o| o.uid == owner.uid)
                {
                    merged.meta.owner_references.push(owner.clone());
                }
            }
            if stored == merged {
                return Ok(());
            }
            merged.meta.resource_version += 1;
            state.tracing_policies.insert(name.clone(), merged);
        } else {
            let mut stored = policy.clone();
            stored.meta.uid = state.fresh_uid();
            stored.meta.resource_version = 1;
            state.tracing_policies.insert(name.clone(), stored);
        }
        state.mutations += 1;
        drop(state);
        self.emit(ClusterEvent::TracingPolicyChanged { name });
        Ok(())
    }

    async fn update_tracing_policy(&self, policy: &TracingPolicy) -> Result<(), ClusterError> {
        let mut state = self.state.write().await;
        let name = policy.meta.name.clone();
        let Some(stored) = state.tracing_policies.get_mut(&name) else {
            return Err(ClusterError::NotFound {
                kind: "TracingPolicy",
                name,
            });
        };
        if stored.meta.resource_version != policy.meta.resource_version {
            return Err(ClusterError::Conflict {
                kind: "TracingPolicy",
                name,
                submitted: policy.meta.resource_version,
                current: stored.meta.resource_version,
            });
        }
        let mut updated = policy.clone();
        updated.meta.resource_version += 1;
        *stored = updated;
        state.mutations += 1;
        drop(state);
        self.emit(ClusterEvent::TracingPolicyChanged { name });
        Ok(())
    }

    async fn delete_tracing_policy(&self, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.write().await;
        if state.tracing_policies.remove(name).is_none() {
            return Err(ClusterError::NotFound {
                kind: "TracingPolicy",
                name: name.to_string(),
            });
        }
        state.mutations += 1;
        drop(state);
        self.emit(ClusterEvent::TracingPolicyChanged {
            name: name.to_string(),
        });
        Ok(())
    }

    async fn list_admission_rules(
        &self,
        label: Option<(&str, &str)>,
    ) -> Result<Vec<AdmissionRule>, ClusterError> {
        Ok(self
            .state
            .read()
            .await
            .admission_rules
            .values()
            .filter(|rule| label.is_none_or(|(k, v)| rule.meta.has_label(k, v)))
            .cloned()
            .collect())
    }

    async fn apply_admission_rule(&self, rule: &AdmissionRule) -> Result<(), ClusterError> {
        let mut state = self.state.write().await;
        let name = rule.meta.name.clone();
        if let Some(stored) = state.admission_rules.get(&name).cloned() {
            let mut merged = rule.clone();
            merged.meta.uid = stored.meta.uid.clone();
            merged.meta.resource_version = stored.meta.resource_version;
            if stored == merged {
                return Ok(());
            }
            merged.meta.resource_version += 1;
            state.admission_rules.insert(name, merged);
        } else {
            let mut stored = rule.clone();
            stored.meta.uid = state.fresh_uid();
            stored.meta.resource_version = 1;
            state.admission_rules.insert(name, stored);
        }
        state.mutations += 1;
        Ok(())
    }

    async fn delete_admission_rule(&self, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.write().await;
        if state.admission_rules.remove(name).is_none() {
            return Err(ClusterError::NotFound {
                kind: "AdmissionRule",
                name: name.to_string(),
            });
        }
        state.mutations += 1;
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, ClusterError> {
        let mut state = self.state.write().await;
        let now = Instant::now();
        if let Some(lease) = state.leases.get_mut(name) {
            if lease.holder != holder && lease.expires_at > now {
                return Ok(false);
            }
            lease.holder = holder.to_string();
            lease.expires_at = now + ttl;
            return Ok(true);
        }
        state.leases.insert(
            name.to_string(),
            LeaseRecord {
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn read_probe_logs(&self, since: Duration) -> Result<Vec<String>, ClusterError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(since).unwrap_or_else(|_| chrono::Duration::zero());
        Ok(self
            .state
            .read()
            .await
            .probe_log
            .iter()
            .filter(|(stamp, _)| *stamp >= cutoff)
            .map(|(_, line)| line.clone())
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Trap;
    use crate::cluster::{ContainerSpec, ObjectMeta, PodTemplate, WorkloadKind};

    fn nginx() -> Workload {
        let mut template = PodTemplate::default();
        template
            .labels
            .insert("app".to_string(), "nginx".to_string());
        template.containers.push(ContainerSpec::named("nginx"));
        Workload {
            meta: ObjectMeta::namespaced("default", "nginx"),
            kind: WorkloadKind::Deployment,
            replicas: 2,
            template,
        }
    }

    #[tokio::test]
    async fn test_workload_update_conflicts_on_stale_version() {
        let cluster = InMemoryCluster::new();
        cluster.seed_workload(nginx()).await;

        let workload = cluster.get_workload("default", "nginx").await.unwrap();
        cluster.update_workload(&workload).await.unwrap();

        // Second write with the stale version loses the race.
        let err = cluster.update_workload(&workload).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_finalizer_gates_policy_deletion() {
        let cluster = InMemoryCluster::new();
        let mut policy = DeceptionPolicy::new("p1", vec![Trap::filesystem_honeytoken("/t", "", true)]);
        policy.metadata.finalizers.push("koney/cleanup".to_string());
        cluster.create_policy(policy).await;

        cluster.delete_policy("p1").await.unwrap();
        assert!(cluster.policy_exists("p1").await);

        let mut stored = cluster.get_policy("p1").await.unwrap();
        assert!(stored.is_deleting());
        stored.metadata.finalizers.clear();
        cluster.update_policy(&stored).await.unwrap();
        assert!(!cluster.policy_exists("p1").await);
    }

    #[tokio::test]
    async fn test_apply_tracing_policy_merges_owners_and_is_idempotent() {
        use crate::cluster::{TetragonSpec, TracingPolicySpec};

        let cluster = InMemoryCluster::new();
        let mut tp = TracingPolicy {
            meta: ObjectMeta::cluster_scoped("koney-tracing-policy-abc"),
            spec: TracingPolicySpec::Tetragon(TetragonSpec::default()),
        };
        tp.meta.owner_references.push(crate::cluster::OwnerReference {
            kind: "DeceptionPolicy".to_string(),
            name: "p1".to_string(),
            uid: "uid-1".to_string(),
            controller: true,
            block_owner_deletion: true,
        });
        cluster.apply_tracing_policy(&tp).await.unwrap();
        let first_mutations = cluster.mutation_count().await;

        // Identical apply is a no-op.
        cluster.apply_tracing_policy(&tp).await.unwrap();
        assert_eq!(cluster.mutation_count().await, first_mutations);

        // A second owner is merged in.
        let mut second = tp.clone();
        second.meta.owner_references[0].name = "p2".to_string();
        second.meta.owner_references[0].uid = "uid-2".to_string();
        cluster.apply_tracing_policy(&second).await.unwrap();
        let stored = cluster
            .get_tracing_policy("koney-tracing-policy-abc")
            .await
            .unwrap();
        assert_eq!(stored.meta.owner_references.len(), 2);
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_expiry() {
        let cluster = InMemoryCluster::new();
        let ttl = Duration::from_secs(30);
        assert!(cluster.try_acquire_lease("koney", "a", ttl).await.unwrap());
        assert!(!cluster.try_acquire_lease("koney", "b", ttl).await.unwrap());
        // The holder renews freely.
        assert!(cluster.try_acquire_lease("koney", "a", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_rollout_restamps_pods() {
        let cluster = InMemoryCluster::new();
        cluster.seed_workload(nginx()).await;

        let mut workload = cluster.get_workload("default", "nginx").await.unwrap();
        let old_hash = workload.template.content_hash();
        workload.template.volumes.push(crate::cluster::Volume {
            name: "koney-volume-x".to_string(),
            secret_name: "koney-secret-x".to_string(),
        });
        cluster.update_workload(&workload).await.unwrap();

        let selector = workload.template.labels.clone();
        let pods = cluster.list_pods("default", &selector).await.unwrap();
        assert!(pods.iter().all(|p| p.template_hash == old_hash));

        cluster.complete_rollout("default", "nginx").await.unwrap();
        let new_hash = workload.template.content_hash();
        let pods = cluster.list_pods("default", &selector).await.unwrap();
        assert_eq!(pods.len(), 2);
        assert!(pods.iter().all(|p| p.template_hash == new_hash));
    }
}
