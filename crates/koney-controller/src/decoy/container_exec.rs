//! The container-exec strategy.
//!
//! Writes the decoy straight into running containers over an exec
//! channel, leaving the workload spec untouched. New replicas do not
//! inherit the file; the change record tracks which pods are covered so
//! the next reconcile pass reaches only pods that appeared since. The
//! injected command embeds the fingerprint so the probe's view of the
//! write is recognized as self-induced and never alerts.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use koney_core::api::{DeceptionPolicy, DecoyStrategy, Trap};
use koney_core::changes::{self, ChangeRecord};
use koney_core::cluster::{ClusterClient, ClusterError, Workload};
use koney_core::fingerprint;

use super::{DecoyDeployer, DeployError, DeployFailure, DeployReport};
use crate::plan::TrapTarget;
use crate::retry;

/// Installs decoys by streaming writes into running containers.
pub struct ContainerExecDeployer;

/// Escape a string for single-quoted shell interpolation.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// The command streamed into each container. The trailing fingerprint
/// argument is inert (`sh -c` takes it as `$0`) but shows up in the
/// probe's process arguments, which is exactly what the ingestion
/// pipeline filters on.
fn build_write_command(file_path: &str, file_content: &str, read_only: bool) -> Vec<String> {
    let mut script = format!(
        "echo {} > {}",
        shell_quote(file_content),
        shell_quote(file_path)
    );
    if read_only {
        script.push_str(&format!(" && chmod 0444 {}", shell_quote(file_path)));
    }
    vec![
        "sh".to_string(),
        "-c".to_string(),
        script,
        fingerprint::encode_in_echo(fingerprint::DEFAULT_FINGERPRINT_CODE),
    ]
}

/// The best-effort removal command used on uninstall.
fn build_remove_command(file_path: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("rm -f {}", shell_quote(file_path)),
        fingerprint::encode_in_echo(fingerprint::DEFAULT_FINGERPRINT_CODE),
    ]
}

#[async_trait]
impl DecoyDeployer for ContainerExecDeployer {
    fn strategy(&self) -> DecoyStrategy {
        DecoyStrategy::ContainerExec
    }

    fn supports_runtime_injection(&self) -> bool {
        true
    }

    fn supports_spec_patch(&self) -> bool {
        false
    }

    async fn install(
        &self,
        client: &dyn ClusterClient,
        policy: &DeceptionPolicy,
        trap: &Trap,
        trap_id: &str,
        target: &TrapTarget,
    ) -> Result<DeployReport, DeployError> {
        let token = trap
            .filesystem_honeytoken
            .as_ref()
            .ok_or(DeployError::UnsupportedTrap)?;
        let namespace = target.workload.meta.namespace.clone();
        let workload_name = target.workload.meta.name.clone();
        let policy_name = policy.metadata.name.clone();

        let workload = client.get_workload(&namespace, &workload_name).await?;
        let records = changes::read_records(&workload.meta)?;

        let covered: BTreeSet<String> =
            match changes::find_record(&records, &policy_name, trap_id) {
                Some(record) => record.pods.iter().cloned().collect(),
                None => {
                    if changes::path_is_occupied(&records, &token.file_path) {
                        return Ok(DeployReport {
                            satisfied: true,
                            changed: false,
                            containers: Vec::new(),
                            failures: Vec::new(),
                        });
                    }
                    BTreeSet::new()
                }
            };
        let had_record = changes::find_record(&records, &policy_name, trap_id).is_some();

        let pods = client
            .list_pods(&namespace, &workload.template.labels)
            .await?;

        let mut failures = Vec::new();
        let mut newly_covered = BTreeSet::new();

        if policy.spec.mutate_existing || had_record {
            let command =
                build_write_command(&token.file_path, &token.file_content, token.read_only);
            for pod in pods.iter().filter(|p| !covered.contains(&p.meta.name)) {
                let mut pod_ok = true;
                for container in &target.containers {
                    if !pod.containers.iter().any(|c| c.name == *container) {
                        continue;
                    }
                    match client
                        .exec_in_container(&namespace, &pod.meta.name, container, &command)
                        .await
                    {
                        Ok(()) => {}
                        Err(err) => {
                            pod_ok = false;
                            tracing::warn!(
                                pod = %pod.meta.name,
                                container = %container,
                                error = %err,
                                "decoy exec write failed"
                            );
                            failures.push(DeployFailure {
                                pod: Some(format!("{namespace}/{}", pod.meta.name)),
                                container: container.clone(),
                                error: err,
                            });
                        }
                    }
                }
                if pod_ok {
                    newly_covered.insert(pod.meta.name.clone());
                }
            }
        } else {
            // mutateExisting=false and nothing recorded yet: mark the
            // replicas running today as out of scope; only pods created
            // from now on are injected.
            newly_covered.extend(pods.iter().map(|p| p.meta.name.clone()));
        }

        let changed = !newly_covered.is_empty() || !had_record;
        if changed {
            let trap_id = trap_id.to_string();
            let policy_name = policy_name.clone();
            let containers = target.containers.clone();
            let file_path = token.file_path.clone();
            retry::on_conflict(retry::DEFAULT_PATCH_ATTEMPTS, || {
                let namespace = namespace.clone();
                let workload_name = workload_name.clone();
                let policy_name = policy_name.clone();
                let trap_id = trap_id.clone();
                let containers = containers.clone();
                let file_path = file_path.clone();
                let newly_covered = newly_covered.clone();
                async move {
                    let mut workload = client.get_workload(&namespace, &workload_name).await?;
                    let mut records = changes::read_records(&workload.meta)?;
                    let position = records.iter().position(|r| {
                        r.deception_policy_name == policy_name && r.trap_id == trap_id
                    });
                    if let Some(index) = position {
                        let mut pods: BTreeSet<String> =
                            records[index].pods.iter().cloned().collect();
                        pods.extend(newly_covered);
                        records[index].pods = pods.into_iter().collect();
                    } else {
                        let now = Utc::now();
                        records.push(ChangeRecord {
                            deception_policy_name: policy_name,
                            trap_id,
                            file_path,
                            strategy: DecoyStrategy::ContainerExec,
                            containers,
                            pods: newly_covered.into_iter().collect(),
                            secret_name: None,
                            deployed_at: now,
                            // Runtime injection is live immediately.
                            rolled_out_at: Some(now),
                        });
                    }
                    changes::write_records(&mut workload.meta, &records)?;
                    client.update_workload(&workload).await?;
                    Ok::<(), DeployError>(())
                }
            })
            .await?;
        }

        Ok(DeployReport {
            satisfied: failures.is_empty(),
            changed,
            containers: target.containers.clone(),
            failures,
        })
    }

    async fn uninstall(
        &self,
        client: &dyn ClusterClient,
        record: &ChangeRecord,
        workload: &Workload,
    ) -> Result<(), DeployError> {
        let namespace = workload.meta.namespace.clone();
        let command = build_remove_command(&record.file_path);

        // Best-effort: containers may be long gone.
        if let Ok(pods) = client
            .list_pods(&namespace, &workload.template.labels)
            .await
        {
            for pod in &pods {
                for container in &record.containers {
                    if !pod.containers.iter().any(|c| c.name == *container) {
                        continue;
                    }
                    if let Err(err) = client
                        .exec_in_container(&namespace, &pod.meta.name, container, &command)
                        .await
                    {
                        tracing::debug!(
                            pod = %pod.meta.name,
                            container = %container,
                            error = %err,
                            "decoy removal skipped"
                        );
                    }
                }
            }
        }

        let workload_name = workload.meta.name.clone();
        retry::on_conflict(retry::DEFAULT_PATCH_ATTEMPTS, || {
            let namespace = namespace.clone();
            let workload_name = workload_name.clone();
            async move {
                let mut workload = match client.get_workload(&namespace, &workload_name).await {
                    Ok(workload) => workload,
                    Err(ClusterError::NotFound { .. }) => return Ok(()),
                    Err(err) => return Err(DeployError::from(err)),
                };
                let mut records = changes::read_records(&workload.meta)?;
                let before = records.len();
                records.retain(|r| {
                    !(r.deception_policy_name == record.deception_policy_name
                        && r.trap_id == record.trap_id)
                });
                if before == records.len() {
                    return Ok(());
                }
                changes::write_records(&mut workload.meta, &records)?;
                client.update_workload(&workload).await?;
                Ok(())
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_command_embeds_fingerprint() {
        let command = build_write_command("/tmp/auth_token.json", "{\"token\":\"x\"}", false);
        assert_eq!(command[0], "sh");
        assert_eq!(command[1], "-c");
        assert!(command[2].contains("> '/tmp/auth_token.json'"));
        assert_eq!(command[3], "KONEY_FINGERPRINT_1337");
    }

    #[test]
    fn test_read_only_adds_chmod() {
        let command = build_write_command("/tmp/t", "x", true);
        assert!(command[2].contains("chmod 0444 '/tmp/t'"));
    }

    #[test]
    fn test_shell_quote_survives_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
