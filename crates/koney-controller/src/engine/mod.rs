//! The reconciliation engine.
//!
//! One pass per policy: validate, plan, apply decoys and captors,
//! observe rollouts, prune drifted artifacts, write status. A policy
//! with a deletion timestamp is finalized instead: every artifact
//! carrying its identity is retracted, then the finalizer is stripped.
//!
//! The engine keeps no state between passes; the cluster is the ground
//! truth, so a restarted controller resumes exactly where the cluster
//! is. Every install and uninstall is safe to repeat.

mod leader;
mod queue;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use koney_core::api::{
    validate_policy, DeceptionPolicy, DecoyStrategy, Trap, POLICY_FINALIZER, POLICY_LABEL_KEY,
};
use koney_core::changes::{self, ChangesError};
use koney_core::cluster::{ClusterClient, ClusterError, ClusterEvent, TracingPolicy};
use koney_core::identity::{self, IdentityError};
use koney_core::matching;
pub use leader::{LeaderElector, DEFAULT_LEASE_TTL, LEASE_NAME};
pub use queue::KeyedQueue;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::decoy::{deployer_for, DeployError};
use crate::metrics::ControllerMetrics;
use crate::plan::{self, PlanError, TrapPlan};
use crate::retry;
use crate::status::{self, PassOutcome, TrapOutcome};

/// Engine errors. A failed pass is requeued with backoff; nothing here
/// panics the controller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Cluster API failure.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Planning failure.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// Deployment failure that could not be recorded as partial.
    #[error(transparent)]
    Deploy(#[from] DeployError),

    /// A workload carries a malformed changes annotation.
    #[error(transparent)]
    Changes(#[from] ChangesError),

    /// A trap could not be canonicalized.
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Namespace the forwarder webhook lives in.
    pub operator_namespace: String,

    /// Worker count; distinct policies reconcile in parallel.
    pub workers: usize,

    /// Periodic resync interval.
    pub resync_interval: Duration,

    /// Base delay for requeueing failed passes.
    pub requeue_base_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            operator_namespace: koney_core::config::DEFAULT_NAMESPACE.to_string(),
            workers: 2,
            resync_interval: Duration::from_secs(300),
            requeue_base_delay: Duration::from_millis(500),
        }
    }
}

/// The reconciliation engine.
pub struct Engine {
    client: Arc<dyn ClusterClient>,
    config: EngineConfig,
    queue: Arc<KeyedQueue>,
    metrics: Option<Arc<ControllerMetrics>>,
    /// Consecutive failures per key, for requeue backoff.
    failures: Mutex<HashMap<String, u32>>,
}

impl Engine {
    /// Create an engine over a cluster client.
    #[must_use]
    pub fn new(client: Arc<dyn ClusterClient>, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            client,
            config,
            queue: Arc::new(KeyedQueue::new()),
            metrics: None,
            failures: Mutex::new(HashMap::new()),
        })
    }

    /// Create an engine that reports to the given metrics registry.
    #[must_use]
    pub fn with_metrics(
        client: Arc<dyn ClusterClient>,
        config: EngineConfig,
        metrics: Arc<ControllerMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            config,
            queue: Arc::new(KeyedQueue::new()),
            metrics: Some(metrics),
            failures: Mutex::new(HashMap::new()),
        })
    }

    /// The engine's work queue, for tests and for external triggers.
    #[must_use]
    pub fn queue(&self) -> Arc<KeyedQueue> {
        Arc::clone(&self.queue)
    }

    /// Run watcher, resync ticker, and workers until shutdown flips.
    pub async fn run(
        self: Arc<Self>,
        is_leader: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // Watcher: map cluster events to policy keys.
        {
            let engine = Arc::clone(&self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut events = engine.client.watch();
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        event = events.recv() => match event {
                            Ok(event) => engine.route_event(event).await,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                                debug!(missed, "watch stream lagged; resyncing all policies");
                                engine.enqueue_all().await;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            });
        }

        // Periodic resync.
        {
            let engine = Arc::clone(&self);
            let is_leader = is_leader.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(engine.config.resync_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = ticker.tick() => {
                            if *is_leader.borrow() {
                                engine.enqueue_all().await;
                            }
                        }
                    }
                }
            });
        }

        // Workers.
        for worker in 0..self.config.workers.max(1) {
            let engine = Arc::clone(&self);
            let is_leader = is_leader.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        key = engine.queue.next() => {
                            if *is_leader.borrow() {
                                engine.work(&key).await;
                            }
                            engine.queue.done(&key);
                        }
                    }
                }
            });
            debug!(worker, "reconcile worker started");
        }

        let _ = shutdown.changed().await;
    }

    /// Enqueue every policy in the cluster.
    pub async fn enqueue_all(&self) {
        match self.client.list_policies().await {
            Ok(policies) => {
                if let Some(metrics) = &self.metrics {
                    metrics.set_active_policies(policies.len());
                }
                for policy in policies {
                    self.queue.enqueue(policy.metadata.name);
                }
            }
            Err(err) => warn!(error = %err, "failed to list policies for resync"),
        }
    }

    /// Map one cluster event to the policies it affects.
    async fn route_event(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::PolicyChanged { name } => self.queue.enqueue(name),
            ClusterEvent::WorkloadChanged { namespace, name } => {
                match self.client.get_workload(&namespace, &name).await {
                    Ok(workload) => {
                        if let Ok(policies) = self.client.list_policies().await {
                            for policy in policies {
                                let interested = policy.spec.traps.iter().any(|trap| {
                                    matching::workload_matches(&workload, &trap.match_resources)
                                });
                                if interested {
                                    self.queue.enqueue(policy.metadata.name);
                                }
                            }
                        }
                    }
                    // Deleted workload: any policy might hold records on it.
                    Err(_) => self.enqueue_all().await,
                }
            }
            ClusterEvent::TracingPolicyChanged { name } => {
                match self.client.get_tracing_policy(&name).await {
                    Ok(tracing_policy) => {
                        if let Some(owner) =
                            tracing_policy.meta.labels.get(POLICY_LABEL_KEY)
                        {
                            self.queue.enqueue(owner.clone());
                        }
                    }
                    // Deleted out from under us: owners must recreate it.
                    Err(_) => self.enqueue_all().await,
                }
            }
        }
    }

    /// One worker step: reconcile, record the result, schedule backoff.
    async fn work(&self, key: &str) {
        let started = std::time::Instant::now();
        match self.reconcile(key).await {
            Ok(()) => {
                self.failures.lock().expect("failure map poisoned").remove(key);
                if let Some(metrics) = &self.metrics {
                    metrics.observe_reconcile("ok", started.elapsed());
                }
            }
            Err(err) => {
                warn!(policy = %key, error = %err, "reconcile failed; requeueing");
                if let Some(metrics) = &self.metrics {
                    metrics.observe_reconcile("error", started.elapsed());
                }
                let attempt = {
                    let mut failures = self.failures.lock().expect("failure map poisoned");
                    let entry = failures.entry(key.to_string()).or_insert(0);
                    *entry = entry.saturating_add(1);
                    *entry
                };
                let delay = self.config.requeue_base_delay
                    * 2u32.saturating_pow(attempt.saturating_sub(1).min(6));
                let queue = Arc::clone(&self.queue);
                let key = key.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.enqueue(key);
                });
            }
        }
    }

    /// One reconcile pass for a policy name.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the pass must be retried; partial
    /// per-container failures are recorded in status instead.
    pub async fn reconcile(&self, name: &str) -> Result<(), EngineError> {
        let policy = match self.client.get_policy(name).await {
            Ok(policy) => policy,
            Err(ClusterError::NotFound { .. }) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        if policy.is_deleting() {
            return self.finalize(policy).await;
        }

        let policy = self.ensure_finalizer(policy).await?;

        // Validating.
        let rejections = validate_policy(&policy.spec);
        let invalid_indices: HashSet<usize> = rejections.iter().map(|r| r.index).collect();
        let blocked = policy.spec.strict_validation && !rejections.is_empty();
        let mut outcome = PassOutcome {
            rejections,
            blocked_by_validation: blocked,
            ..PassOutcome::default()
        };

        if !blocked {
            // Planning.
            let valid_traps: Vec<(usize, Trap)> = policy
                .spec
                .traps
                .iter()
                .enumerate()
                .filter(|(index, _)| !invalid_indices.contains(index))
                .map(|(index, trap)| (index, trap.clone()))
                .collect();
            let plans = plan::plan_policy(self.client.as_ref(), &policy, &valid_traps).await?;

            // Applying: decoys per (trap, workload); errors accumulate.
            self.apply_decoys(&policy, &plans, &mut outcome).await;

            // Applying: captors per unique monitoring identity.
            self.apply_captors(&policy, &plans, &mut outcome).await;

            // Observing: fill in rolledOutAt once replicas caught up.
            self.observe_rollouts(&policy, &plans).await?;

            // Retract artifacts whose trap left the spec.
            self.prune_drift(&policy, &plans).await?;
        }

        self.write_status(name, &outcome).await?;
        Ok(())
    }

    /// Add the cleanup finalizer if missing.
    async fn ensure_finalizer(
        &self,
        policy: DeceptionPolicy,
    ) -> Result<DeceptionPolicy, EngineError> {
        if policy
            .metadata
            .finalizers
            .iter()
            .any(|f| f == POLICY_FINALIZER)
        {
            return Ok(policy);
        }
        let name = policy.metadata.name.clone();
        let updated = retry::on_conflict(retry::DEFAULT_PATCH_ATTEMPTS, || {
            let name = name.clone();
            async move {
                let mut fresh = self.client.get_policy(&name).await?;
                if !fresh.metadata.finalizers.iter().any(|f| f == POLICY_FINALIZER) {
                    fresh
                        .metadata
                        .finalizers
                        .push(POLICY_FINALIZER.to_string());
                    return self.client.update_policy(&fresh).await;
                }
                Ok(fresh)
            }
        })
        .await?;
        Ok(updated)
    }

    /// Install decoys for every (trap, workload) pair in the plan.
    async fn apply_decoys(
        &self,
        policy: &DeceptionPolicy,
        plans: &[TrapPlan],
        outcome: &mut PassOutcome,
    ) {
        for plan in plans {
            let deployer = deployer_for(plan.trap.decoy_deployment.strategy);
            let mut summary = TrapOutcome {
                index: plan.index,
                total_targets: plan.targets.len(),
                ..TrapOutcome::default()
            };
            for target in &plan.targets {
                match deployer
                    .install(
                        self.client.as_ref(),
                        policy,
                        &plan.trap,
                        &plan.trap_id,
                        target,
                    )
                    .await
                {
                    Ok(report) => {
                        if report.satisfied {
                            summary.satisfied_targets += 1;
                        }
                        summary.failure_count += report.failures.len();
                    }
                    Err(err) => {
                        warn!(
                            policy = %policy.metadata.name,
                            trap = plan.index,
                            workload = %target.workload.meta.name,
                            error = %err,
                            "decoy install failed"
                        );
                        summary.failure_count += 1;
                    }
                }
            }
            outcome.traps.push(summary);
        }
    }

    /// Create or update one tracing policy per unique monitoring id.
    async fn apply_captors(
        &self,
        policy: &DeceptionPolicy,
        plans: &[TrapPlan],
        outcome: &mut PassOutcome,
    ) {
        let mut applied: HashSet<String> = HashSet::new();
        for plan in plans {
            let document = match crate::captor::build_tracing_policy(
                policy,
                &plan.trap,
                &self.config.operator_namespace,
            ) {
                Ok(Some(document)) => document,
                Ok(None) => continue,
                Err(err) => {
                    outcome
                        .captor_failures
                        .push(format!("trap[{}]: {err}", plan.index));
                    continue;
                }
            };
            if !applied.insert(document.meta.name.clone()) {
                continue;
            }
            match self.client.apply_tracing_policy(&document).await {
                Ok(()) => outcome.captors_present += 1,
                Err(err) => {
                    warn!(
                        policy = %policy.metadata.name,
                        trap = plan.index,
                        error = %err,
                        "captor install failed"
                    );
                    outcome
                        .captor_failures
                        .push(format!("trap[{}]: {err}", plan.index));
                }
            }
        }
    }

    /// For template-patching strategies, stamp `rolledOutAt` once every
    /// replica runs the patched template.
    async fn observe_rollouts(
        &self,
        policy: &DeceptionPolicy,
        plans: &[TrapPlan],
    ) -> Result<(), EngineError> {
        let mut seen: HashSet<(String, String)> = HashSet::new();
        for plan in plans {
            if !deployer_for(plan.trap.decoy_deployment.strategy).supports_spec_patch() {
                continue;
            }
            for target in &plan.targets {
                let key = (
                    target.workload.meta.namespace.clone(),
                    target.workload.meta.name.clone(),
                );
                if !seen.insert(key.clone()) {
                    continue;
                }
                self.observe_workload_rollout(&policy.metadata.name, &key.0, &key.1)
                    .await?;
            }
        }
        Ok(())
    }

    async fn observe_workload_rollout(
        &self,
        policy_name: &str,
        namespace: &str,
        workload_name: &str,
    ) -> Result<(), EngineError> {
        retry::on_conflict(retry::DEFAULT_PATCH_ATTEMPTS, || async move {
            let mut workload = match self.client.get_workload(namespace, workload_name).await {
                Ok(workload) => workload,
                Err(ClusterError::NotFound { .. }) => return Ok(()),
                Err(err) => return Err(EngineError::from(err)),
            };
            let mut records = changes::read_records(&workload.meta)?;
            let has_pending = records.iter().any(|r| {
                r.deception_policy_name == policy_name
                    && r.strategy == DecoyStrategy::VolumeMount
                    && r.rolled_out_at.is_none()
            });
            if !has_pending {
                return Ok(());
            }

            let template_hash = workload.template.content_hash();
            let pods = self
                .client
                .list_pods(namespace, &workload.template.labels)
                .await?;
            let all_replaced = pods.len() >= workload.replicas as usize
                && pods.iter().all(|p| p.template_hash == template_hash);
            if !all_replaced {
                return Ok(());
            }

            let now = Utc::now();
            for record in &mut records {
                if record.deception_policy_name == policy_name
                    && record.strategy == DecoyStrategy::VolumeMount
                    && record.rolled_out_at.is_none()
                {
                    record.rolled_out_at = Some(now);
                }
            }
            changes::write_records(&mut workload.meta, &records)?;
            self.client.update_workload(&workload).await?;
            info!(
                workload = %format!("{namespace}/{workload_name}"),
                "rollout complete; decoy live on every replica"
            );
            Ok(())
        })
        .await
    }

    /// Retract artifacts belonging to this policy whose trap no longer
    /// exists in the spec.
    async fn prune_drift(
        &self,
        policy: &DeceptionPolicy,
        plans: &[TrapPlan],
    ) -> Result<(), EngineError> {
        let live_trap_ids: HashSet<&str> = plans.iter().map(|p| p.trap_id.as_str()).collect();
        let live_tracing: HashSet<String> = plans
            .iter()
            .filter_map(|p| identity::tracing_policy_name(&p.trap).ok())
            .collect();
        let live_admission: HashSet<String> = plans
            .iter()
            .filter(|p| p.trap.decoy_deployment.strategy == DecoyStrategy::KyvernoPolicy)
            .filter_map(|p| identity::admission_rule_name(&p.trap).ok())
            .collect();

        // Workload records.
        for workload in self.client.list_workloads().await? {
            let records = changes::read_records(&workload.meta)?;
            for record in &records {
                if record.deception_policy_name != policy.metadata.name
                    || live_trap_ids.contains(record.trap_id.as_str())
                {
                    continue;
                }
                debug!(
                    workload = %workload.meta.name,
                    trap_id = %record.trap_id,
                    "retracting drifted decoy"
                );
                deployer_for(record.strategy)
                    .uninstall(self.client.as_ref(), record, &workload)
                    .await?;
            }
        }

        // Owned tracing policies.
        for tracing_policy in self.client.list_tracing_policies(None).await? {
            let owned = tracing_policy
                .meta
                .owner_references
                .iter()
                .any(|o| o.uid == policy.metadata.uid);
            if owned && !live_tracing.contains(&tracing_policy.meta.name) {
                self.release_tracing_policy(tracing_policy, policy).await?;
            }
        }

        // Owned admission rules.
        for rule in self.client.list_admission_rules(None).await? {
            let owned = rule
                .meta
                .owner_references
                .iter()
                .any(|o| o.uid == policy.metadata.uid);
            if owned && !live_admission.contains(&rule.meta.name) {
                self.release_admission_rule(&rule.meta.name, policy).await?;
            }
        }

        Ok(())
    }

    /// Drop this policy's ownership of a tracing policy, deleting the
    /// object once no owner remains.
    async fn release_tracing_policy(
        &self,
        tracing_policy: TracingPolicy,
        policy: &DeceptionPolicy,
    ) -> Result<(), EngineError> {
        let name = tracing_policy.meta.name.clone();
        retry::on_conflict(retry::DEFAULT_PATCH_ATTEMPTS, || {
            let name = name.clone();
            async move {
                let mut fresh = match self.client.get_tracing_policy(&name).await {
                    Ok(fresh) => fresh,
                    Err(ClusterError::NotFound { .. }) => return Ok(()),
                    Err(err) => return Err(EngineError::from(err)),
                };
                fresh
                    .meta
                    .owner_references
                    .retain(|o| o.uid != policy.metadata.uid);
                if fresh.meta.owner_references.is_empty() {
                    match self.client.delete_tracing_policy(&name).await {
                        Ok(()) | Err(ClusterError::NotFound { .. }) => Ok(()),
                        Err(err) => Err(err.into()),
                    }
                } else {
                    // The label keeps pointing at a live owner.
                    if let Some(remaining) = fresh.meta.owner_references.first() {
                        fresh
                            .meta
                            .labels
                            .insert(POLICY_LABEL_KEY.to_string(), remaining.name.clone());
                    }
                    self.client.update_tracing_policy(&fresh).await?;
                    Ok(())
                }
            }
        })
        .await
    }

    /// Drop this policy's ownership of an admission rule, deleting it
    /// once no owner remains.
    async fn release_admission_rule(
        &self,
        name: &str,
        policy: &DeceptionPolicy,
    ) -> Result<(), EngineError> {
        let rules = self.client.list_admission_rules(None).await?;
        let Some(rule) = rules.iter().find(|r| r.meta.name == name) else {
            return Ok(());
        };
        let mut fresh = rule.clone();
        let secret_name = fresh.spec.volume.secret_name.clone();
        fresh
            .meta
            .owner_references
            .retain(|o| o.uid != policy.metadata.uid);
        if fresh.meta.owner_references.is_empty() {
            match self.client.delete_admission_rule(name).await {
                Ok(()) | Err(ClusterError::NotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
            // The rule was the last reason the content secret existed.
            for workload in self.client.list_workloads().await? {
                crate::decoy::release_secret(
                    self.client.as_ref(),
                    &workload.meta.namespace,
                    &secret_name,
                )
                .await?;
            }
        } else {
            if let Some(remaining) = fresh.meta.owner_references.first() {
                fresh
                    .meta
                    .labels
                    .insert(POLICY_LABEL_KEY.to_string(), remaining.name.clone());
            }
            self.client.apply_admission_rule(&fresh).await?;
        }
        Ok(())
    }

    /// Finalizing: retract every artifact carrying this policy's
    /// identity, then strip the finalizer so deletion completes.
    async fn finalize(&self, policy: DeceptionPolicy) -> Result<(), EngineError> {
        let policy_name = policy.metadata.name.clone();
        info!(policy = %policy_name, "finalizing deleted policy");

        // Decoys, in reverse record order per workload.
        for workload in self.client.list_workloads().await? {
            let records = changes::read_records(&workload.meta)?;
            for record in records
                .iter()
                .rev()
                .filter(|r| r.deception_policy_name == policy_name)
            {
                deployer_for(record.strategy)
                    .uninstall(self.client.as_ref(), record, &workload)
                    .await?;
            }
        }

        // Tracing policies: owned or labeled, in case the spec drifted.
        for tracing_policy in self.client.list_tracing_policies(None).await? {
            let involved = tracing_policy
                .meta
                .owner_references
                .iter()
                .any(|o| o.uid == policy.metadata.uid)
                || tracing_policy
                    .meta
                    .has_label(POLICY_LABEL_KEY, &policy_name);
            if involved {
                self.release_tracing_policy(tracing_policy, &policy).await?;
            }
        }

        // Admission rules.
        for rule in self.client.list_admission_rules(None).await? {
            let involved = rule
                .meta
                .owner_references
                .iter()
                .any(|o| o.uid == policy.metadata.uid)
                || rule.meta.has_label(POLICY_LABEL_KEY, &policy_name);
            if involved {
                let name = rule.meta.name.clone();
                self.release_admission_rule(&name, &policy).await?;
            }
        }

        // Strip the finalizer; the object disappears with it.
        retry::on_conflict(retry::DEFAULT_PATCH_ATTEMPTS, || {
            let policy_name = policy_name.clone();
            async move {
                let mut fresh = match self.client.get_policy(&policy_name).await {
                    Ok(fresh) => fresh,
                    Err(ClusterError::NotFound { .. }) => return Ok(()),
                    Err(err) => return Err(EngineError::from(err)),
                };
                fresh.metadata.finalizers.retain(|f| f != POLICY_FINALIZER);
                match self.client.update_policy(&fresh).await {
                    Ok(_) => Ok(()),
                    Err(ClusterError::NotFound { .. }) => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
        })
        .await?;

        info!(policy = %policy_name, "finalization complete");
        Ok(())
    }

    /// Diff-minimized status write under optimistic concurrency.
    async fn write_status(&self, name: &str, outcome: &PassOutcome) -> Result<(), EngineError> {
        retry::on_conflict(retry::DEFAULT_PATCH_ATTEMPTS, || async move {
            let policy = match self.client.get_policy(name).await {
                Ok(policy) => policy,
                Err(ClusterError::NotFound { .. }) => return Ok(()),
                Err(err) => return Err(EngineError::from(err)),
            };
            let mut status = policy.status.clone();
            if !status::apply_conditions(&mut status, outcome, Utc::now()) {
                return Ok(());
            }
            self.client
                .update_policy_status(name, policy.metadata.resource_version, &status)
                .await?;
            Ok(())
        })
        .await
    }
}

impl retry::ConflictError for EngineError {
    fn is_conflict(&self) -> bool {
        match self {
            Self::Cluster(err) => err.is_conflict(),
            Self::Deploy(err) => retry::ConflictError::is_conflict(err),
            _ => false,
        }
    }
}
