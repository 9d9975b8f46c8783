//! The volume-mount strategy.
//!
//! The decoy content lives in a namespaced secret named after its path
//! and content; the workload's pod template gains a volume referencing
//! that secret and a read-only-as-configured mount at the directory of
//! the decoy path in every matching container. Template changes only
//! reach pods on recreation, so the change record's `rolledOutAt`
//! starts null and is filled in by the engine once every replica
//! carries the new template.

use async_trait::async_trait;
use chrono::Utc;
use koney_core::api::{DeceptionPolicy, DecoyStrategy, Trap};
use koney_core::changes::{self, ChangeRecord};
use koney_core::cluster::{ClusterClient, ClusterError, Volume, VolumeMount, Workload};
use koney_core::identity;

use super::{ensure_secret, release_secret, DecoyDeployer, DeployError, DeployReport};
use crate::plan::TrapTarget;
use crate::retry;

/// Installs decoys by patching the pod template with a secret mount.
pub struct VolumeMountDeployer;

/// Directory a decoy path is mounted at.
fn mount_dir(file_path: &str) -> String {
    match file_path.rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((dir, _)) => dir.to_string(),
    }
}

#[async_trait]
impl DecoyDeployer for VolumeMountDeployer {
    fn strategy(&self) -> DecoyStrategy {
        DecoyStrategy::VolumeMount
    }

    fn supports_runtime_injection(&self) -> bool {
        false
    }

    fn supports_spec_patch(&self) -> bool {
        true
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

        let (secret_name, secret_created) = ensure_secret(
            client,
            &namespace,
            &token.file_path,
            &token.file_content,
        )
        .await?;

        let policy_name = policy.metadata.name.clone();
        let volume_name = identity::volume_name(&token.file_path);
        let containers = target.containers.clone();

        let report = retry::on_conflict(retry::DEFAULT_PATCH_ATTEMPTS, || {
            let namespace = namespace.clone();
            let workload_name = workload_name.clone();
            let policy_name = policy_name.clone();
            let volume_name = volume_name.clone();
            let secret_name = secret_name.clone();
            let containers = containers.clone();
            async move {
                let mut workload = client.get_workload(&namespace, &workload_name).await?;
                let mut records = changes::read_records(&workload.meta)?;

                if changes::find_record(&records, &policy_name, trap_id).is_some() {
                    return Ok(DeployReport {
                        satisfied: true,
                        changed: false,
                        containers,
                        failures: Vec::new(),
                    });
                }
                if changes::path_is_occupied(&records, &token.file_path) {
                    // Another trap already planted this path; second
                    // attempts are no-ops.
                    return Ok(DeployReport {
                        satisfied: true,
                        changed: false,
                        containers: Vec::new(),
                        failures: Vec::new(),
                    });
                }

                if !workload
                    .template
                    .volumes
                    .iter()
                    .any(|v| v.name == volume_name)
                {
                    workload.template.volumes.push(Volume {
                        name: volume_name.clone(),
                        secret_name: secret_name.clone(),
                    });
                }
                let mount = VolumeMount {
                    name: volume_name.clone(),
                    mount_path: mount_dir(&token.file_path),
                    read_only: token.read_only,
                };
                for container in &mut workload.template.containers {
                    if containers.contains(&container.name)
                        && !container.volume_mounts.iter().any(|m| m.name == mount.name)
                    {
                        container.volume_mounts.push(mount.clone());
                    }
                }

                records.push(ChangeRecord {
                    deception_policy_name: policy_name.clone(),
                    trap_id: trap_id.to_string(),
                    file_path: token.file_path.clone(),
                    strategy: DecoyStrategy::VolumeMount,
                    containers: containers.clone(),
                    pods: Vec::new(),
                    secret_name: Some(secret_name.clone()),
                    deployed_at: Utc::now(),
                    rolled_out_at: None,
                });
                changes::write_records(&mut workload.meta, &records)?;

                client.update_workload(&workload).await?;
                Ok(DeployReport {
                    satisfied: true,
                    changed: true,
                    containers,
                    failures: Vec::new(),
                })
            }
        })
        .await
        .map_err(|err| match err {
            DeployError::Cluster(source) if source.is_conflict() => DeployError::WorkloadPatch {
                workload: format!("{namespace}/{workload_name}"),
                source,
            },
            other => other,
        })?;

        Ok(DeployReport {
            changed: report.changed || secret_created,
            ..report
        })
    }

    async fn uninstall(
        &self,
        client: &dyn ClusterClient,
        record: &ChangeRecord,
        workload: &Workload,
    ) -> Result<(), DeployError> {
        let namespace = workload.meta.namespace.clone();
        let workload_name = workload.meta.name.clone();
        let volume_name = identity::volume_name(&record.file_path);

        retry::on_conflict(retry::DEFAULT_PATCH_ATTEMPTS, || {
            let namespace = namespace.clone();
            let workload_name = workload_name.clone();
            let volume_name = volume_name.clone();
            async move {
                let mut workload = match client.get_workload(&namespace, &workload_name).await {
                    Ok(workload) => workload,
                    // Workload already gone; nothing to unpatch.
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

                workload.template.volumes.retain(|v| v.name != volume_name);
                for container in &mut workload.template.containers {
                    container.volume_mounts.retain(|m| m.name != volume_name);
                }
                changes::write_records(&mut workload.meta, &records)?;
                client.update_workload(&workload).await?;
                Ok(())
            }
        })
        .await?;

        if let Some(secret_name) = &record.secret_name {
            release_secret(client, &namespace, secret_name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_dir() {
        assert_eq!(mount_dir("/tmp/auth_token.json"), "/tmp");
        assert_eq!(mount_dir("/run/secrets/aws/token"), "/run/secrets/aws");
        assert_eq!(mount_dir("/token"), "/");
    }
}
