//! Reconciler
//!
//! Brings the substrate back in line with the registry:
//! - expired instances are deprovisioned and marked `expired`
//! - resources with no live record are deleted
//! - live records whose resources disappeared are marked `error`
//! - `running` instances whose workload reports healthy become `ready`
//!
//! Every duty is idempotent and safe to run concurrently with the controller.

use crate::config::ManagerConfig;
use crate::error::{InstanceError, InstanceResult};
use crate::models::{Instance, InstanceStatus};
use crate::naming::{
    managed_selector, Labels, COMPONENT_EXPOSURE, COMPONENT_WORKLOAD, LABEL_INSTANCE_ID,
};
use crate::provisioner::{DeprovisionReport, Provisioner};
use crate::registry::Registry;
use crate::substrate::{Deletion, ResourceMeta, WorkloadHealth};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Instances marked `expired` with their resources removed
    pub expired: usize,
    /// Expired instances whose cleanup was incomplete (marked `error`)
    pub expiry_failures: usize,
    pub orphan_workloads_removed: usize,
    pub orphan_exposures_removed: usize,
    /// Live records whose resources were gone (marked `error`)
    pub lost_instances: usize,
    /// Instances promoted from `running` to `ready`
    pub promoted: usize,
    /// Duties that could not run
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirySummary {
    pub expired: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrphanSummary {
    pub workloads_removed: usize,
    pub exposures_removed: usize,
    pub lost_instances: usize,
}

pub struct Reconciler {
    registry: Arc<dyn Registry>,
    provisioner: Arc<Provisioner>,
    config: Arc<ManagerConfig>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<dyn Registry>,
        provisioner: Arc<Provisioner>,
        config: Arc<ManagerConfig>,
    ) -> Self {
        Self {
            registry,
            provisioner,
            config,
        }
    }

    /// Remove the instance's exposure and workload
    ///
    /// Resources already gone count as removed. Returns `Deprovisioning` if
    /// either deletion failed; callers decide what that means for the record.
    pub async fn cleanup(&self, instance: &Instance) -> InstanceResult<DeprovisionReport> {
        let report = self.provisioner.deprovision(instance).await;
        if report.is_complete() {
            debug!(
                "Cleaned up instance {} ({} resource(s) removed)",
                instance.id,
                report.removed()
            );
            Ok(report)
        } else {
            for failure in &report.failures {
                warn!("Cleanup of instance {} incomplete: {}", instance.id, failure);
            }
            Err(InstanceError::Deprovisioning(report.failures.join("; ")))
        }
    }

    /// Reclaim every live instance whose lifetime ended before `now`
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> InstanceResult<ExpirySummary> {
        let mut summary = ExpirySummary::default();

        for instance in self.registry.list_non_terminal_instances().await? {
            if !instance.is_expired(now) {
                continue;
            }
            match self.reclaim_expired(&instance).await? {
                Some(InstanceStatus::Expired) => summary.expired += 1,
                Some(_) => summary.failed += 1,
                None => {}
            }
        }

        Ok(summary)
    }

    /// Tear down one expired instance and close its record
    ///
    /// Returns the status written (`expired`, or `error` when cleanup was
    /// incomplete), or `None` when the record had already left the live
    /// statuses.
    pub async fn reclaim_expired(
        &self,
        instance: &Instance,
    ) -> InstanceResult<Option<InstanceStatus>> {
        let target = match self.cleanup(instance).await {
            Ok(_) => InstanceStatus::Expired,
            Err(_) => InstanceStatus::Error,
        };
        let changed = self
            .registry
            .transition_status(&instance.id, &InstanceStatus::NON_TERMINAL, target)
            .await?;
        if !changed {
            // deleted or expired by someone else meanwhile
            return Ok(None);
        }

        if target == InstanceStatus::Expired {
            info!(
                "Instance {} expired (user {}, challenge {})",
                instance.id, instance.user_id, instance.challenge_id
            );
        }
        Ok(Some(target))
    }

    /// Delete unowned resources and flag records whose resources are gone
    ///
    /// The substrate is listed before the registry: a resource is only
    /// created after its record exists, so any resource seen here whose
    /// record is absent from the later registry read is truly orphaned.
    pub async fn reap_orphans(&self) -> InstanceResult<OrphanSummary> {
        let substrate = self.provisioner.substrate();
        let namespace = &self.config.namespace;

        let workloads = substrate
            .list_workloads(namespace, &managed_selector(COMPONENT_WORKLOAD))
            .await
            .map_err(|e| InstanceError::Deprovisioning(e.to_string()))?;
        let exposures = substrate
            .list_exposures(namespace, &managed_selector(COMPONENT_EXPOSURE))
            .await
            .map_err(|e| InstanceError::Deprovisioning(e.to_string()))?;

        let live: HashMap<String, Instance> = self
            .registry
            .list_non_terminal_instances()
            .await?
            .into_iter()
            .map(|i| (i.id.to_string(), i))
            .collect();

        let mut summary = OrphanSummary::default();

        for meta in orphans(&workloads, &live) {
            match substrate.delete_workload(namespace, &meta.name).await {
                Ok(Deletion::Removed) => {
                    info!("Removed orphaned workload {}", meta.name);
                    summary.workloads_removed += 1;
                }
                Ok(Deletion::AlreadyAbsent) => {}
                Err(e) => warn!("Failed to remove orphaned workload {}: {}", meta.name, e),
            }
        }
        for meta in orphans(&exposures, &live) {
            match substrate.delete_exposure(namespace, &meta.name).await {
                Ok(Deletion::Removed) => {
                    info!("Removed orphaned exposure {}", meta.name);
                    summary.exposures_removed += 1;
                }
                Ok(Deletion::AlreadyAbsent) => {}
                Err(e) => warn!("Failed to remove orphaned exposure {}: {}", meta.name, e),
            }
        }

        let workload_names: HashSet<&str> = workloads.iter().map(|m| m.name.as_str()).collect();
        let exposure_names: HashSet<&str> = exposures.iter().map(|m| m.name.as_str()).collect();

        for instance in live.values() {
            // creating records may still be provisioning
            if !matches!(
                instance.status,
                InstanceStatus::Running | InstanceStatus::Ready
            ) || &instance.namespace != namespace
            {
                continue;
            }
            if workload_names.contains(instance.workload_name.as_str())
                && exposure_names.contains(instance.exposure_name.as_str())
            {
                continue;
            }
            if self.resources_present(instance).await? {
                continue;
            }

            let changed = self
                .registry
                .transition_status(
                    &instance.id,
                    &[InstanceStatus::Running, InstanceStatus::Ready],
                    InstanceStatus::Error,
                )
                .await?;
            if changed {
                error!(
                    "Resources of instance {} disappeared, marked as error",
                    instance.id
                );
                summary.lost_instances += 1;
                // remove whichever half is left
                if let Err(e) = self.cleanup(instance).await {
                    error!(
                        "Leftover resources of lost instance {} not removed: {}",
                        instance.id, e
                    );
                }
            }
        }

        Ok(summary)
    }

    /// Re-list one instance's resources by its own labels
    async fn resources_present(&self, instance: &Instance) -> InstanceResult<bool> {
        let substrate = self.provisioner.substrate();
        let mut selector: Labels = managed_selector(COMPONENT_WORKLOAD);
        selector.insert(LABEL_INSTANCE_ID.to_string(), instance.id.to_string());
        let workloads = substrate
            .list_workloads(&instance.namespace, &selector)
            .await
            .map_err(|e| InstanceError::Deprovisioning(e.to_string()))?;

        let mut selector: Labels = managed_selector(COMPONENT_EXPOSURE);
        selector.insert(LABEL_INSTANCE_ID.to_string(), instance.id.to_string());
        let exposures = substrate
            .list_exposures(&instance.namespace, &selector)
            .await
            .map_err(|e| InstanceError::Deprovisioning(e.to_string()))?;

        Ok(!workloads.is_empty() && !exposures.is_empty())
    }

    /// Promote `running` instances whose workload reports healthy
    pub async fn refresh_readiness(&self) -> InstanceResult<usize> {
        if !self.config.readiness_probe {
            return Ok(0);
        }

        let substrate = self.provisioner.substrate();
        let mut promoted = 0;
        for instance in self.registry.list_non_terminal_instances().await? {
            if instance.status != InstanceStatus::Running {
                continue;
            }
            let health = match substrate
                .workload_health(&instance.namespace, &instance.workload_name)
                .await
            {
                Ok(health) => health,
                Err(e) => {
                    debug!("Health check for {} failed: {}", instance.workload_name, e);
                    continue;
                }
            };
            match health {
                WorkloadHealth::Ready => {
                    if self
                        .registry
                        .transition_status(
                            &instance.id,
                            &[InstanceStatus::Running],
                            InstanceStatus::Ready,
                        )
                        .await?
                    {
                        debug!("Instance {} is ready", instance.id);
                        promoted += 1;
                    }
                }
                WorkloadHealth::Failed => {
                    warn!(
                        "Workload {} of instance {} reports failure",
                        instance.workload_name, instance.id
                    );
                }
                WorkloadHealth::Starting | WorkloadHealth::Missing => {}
            }
        }
        Ok(promoted)
    }

    /// Run every duty once; a failing duty does not stop the others
    pub async fn run_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        match self.sweep_expired(now).await {
            Ok(summary) => {
                report.expired = summary.expired;
                report.expiry_failures = summary.failed;
            }
            Err(e) => report.errors.push(format!("expiry sweep: {}", e)),
        }

        match self.reap_orphans().await {
            Ok(summary) => {
                report.orphan_workloads_removed = summary.workloads_removed;
                report.orphan_exposures_removed = summary.exposures_removed;
                report.lost_instances = summary.lost_instances;
            }
            Err(e) => report.errors.push(format!("orphan reaping: {}", e)),
        }

        match self.refresh_readiness().await {
            Ok(promoted) => report.promoted = promoted,
            Err(e) => report.errors.push(format!("readiness refresh: {}", e)),
        }

        report
    }
}

/// Resources whose instance label does not name a live record
fn orphans<'a>(
    resources: &'a [ResourceMeta],
    live: &'a HashMap<String, Instance>,
) -> impl Iterator<Item = &'a ResourceMeta> + 'a {
    resources.iter().filter(move |meta| {
        meta.labels
            .get(LABEL_INSTANCE_ID)
            .map(|id| !live.contains_key(id))
            .unwrap_or(true)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Challenge, InstanceId};
    use crate::naming::{exposure_name, instance_labels, workload_name};
    use crate::provisioner::access_url;
    use crate::registry::SqliteRegistry;
    use crate::substrate::{FaultPlan, MemorySubstrate, Substrate};
    use chrono::Duration;

    struct Fixture {
        registry: Arc<SqliteRegistry>,
        substrate: Arc<MemorySubstrate>,
        provisioner: Arc<Provisioner>,
        reconciler: Reconciler,
        challenge: Challenge,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(ManagerConfig::default());
        let registry = Arc::new(SqliteRegistry::in_memory().unwrap());
        let substrate = Arc::new(MemorySubstrate::new());
        let provisioner = Arc::new(Provisioner::new(substrate.clone(), config.clone()));
        let reconciler = Reconciler::new(registry.clone(), provisioner.clone(), config);
        Fixture {
            registry,
            substrate,
            provisioner,
            reconciler,
            challenge: Challenge::new(5, "xss", "xss-vuln", 80),
        }
    }

    /// Insert and provision an instance in the given status
    async fn live_instance(
        f: &Fixture,
        user_id: i64,
        port: u16,
        status: InstanceStatus,
        expires_at: DateTime<Utc>,
    ) -> Instance {
        let id = InstanceId::new();
        let workload = workload_name(user_id, f.challenge.id, &id);
        let mut instance = Instance {
            id,
            user_id,
            challenge_id: f.challenge.id,
            exposure_name: exposure_name(&workload),
            workload_name: workload,
            namespace: "ctf-instances".to_string(),
            external_port: port,
            internal_port: 80,
            access_url: access_url("127.0.0.1", port),
            status: InstanceStatus::Creating,
            started_at: expires_at - Duration::hours(2),
            expires_at,
            last_accessed: None,
        };
        f.registry.insert_instance(&instance).await.unwrap();
        f.provisioner.provision(&instance, &f.challenge).await.unwrap();
        let path: &[InstanceStatus] = match status {
            InstanceStatus::Creating => &[],
            InstanceStatus::Ready => &[InstanceStatus::Running, InstanceStatus::Ready],
            _ => std::slice::from_ref(&status),
        };
        let mut current = InstanceStatus::Creating;
        for next in path {
            assert!(f
                .registry
                .transition_status(&instance.id, &[current], *next)
                .await
                .unwrap());
            current = *next;
        }
        instance.status = status;
        instance
    }

    #[tokio::test]
    async fn test_sweep_expires_once() {
        let f = fixture();
        let now = Utc::now();
        let expired =
            live_instance(&f, 7, 30001, InstanceStatus::Running, now - Duration::minutes(1)).await;
        let fresh =
            live_instance(&f, 8, 30002, InstanceStatus::Running, now + Duration::hours(1)).await;

        let summary = f.reconciler.sweep_expired(now).await.unwrap();
        assert_eq!(summary, ExpirySummary { expired: 1, failed: 0 });

        let again = f.reconciler.sweep_expired(now).await.unwrap();
        assert_eq!(again, ExpirySummary::default());

        let record = f.registry.get_instance(&expired.id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Expired);
        let record = f.registry.get_instance(&fresh.id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Running);

        assert_eq!(f.substrate.workload_deletes(), 1);
        assert_eq!(f.substrate.exposure_deletes(), 1);
        assert_eq!(f.substrate.workload_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_marks_error_when_cleanup_fails() {
        let f = fixture();
        let now = Utc::now();
        let expired =
            live_instance(&f, 7, 30001, InstanceStatus::Ready, now - Duration::minutes(1)).await;
        f.substrate.set_faults(FaultPlan {
            fail_workload_delete: true,
            ..Default::default()
        });

        let summary = f.reconciler.sweep_expired(now).await.unwrap();
        assert_eq!(summary, ExpirySummary { expired: 0, failed: 1 });
        let record = f.registry.get_instance(&expired.id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Error);

        // the leftover workload is picked up as an orphan once the substrate recovers
        f.substrate.clear_faults();
        let orphans = f.reconciler.reap_orphans().await.unwrap();
        assert_eq!(orphans.workloads_removed, 1);
        assert_eq!(f.substrate.workload_count(), 0);
    }

    #[tokio::test]
    async fn test_reap_removes_unowned_resources() {
        let f = fixture();
        let now = Utc::now();
        let kept =
            live_instance(&f, 7, 30001, InstanceStatus::Running, now + Duration::hours(1)).await;

        let stray = InstanceId::new();
        let mut spec = f.provisioner.workload_spec(&kept, &f.challenge);
        spec.name = workload_name(9, 5, &stray);
        spec.labels = instance_labels(9, 5, &stray, COMPONENT_WORKLOAD);
        f.substrate.inject_workload(spec);

        let summary = f.reconciler.reap_orphans().await.unwrap();
        assert_eq!(summary.workloads_removed, 1);
        assert_eq!(summary.exposures_removed, 0);
        assert_eq!(summary.lost_instances, 0);
        assert!(f
            .substrate
            .workload("ctf-instances", &kept.workload_name)
            .is_some());
    }

    #[tokio::test]
    async fn test_reap_ignores_foreign_resources() {
        let f = fixture();
        f.substrate.ensure_namespace("ctf-instances").await.unwrap();
        let kept = live_instance(
            &f,
            7,
            30001,
            InstanceStatus::Running,
            Utc::now() + Duration::hours(1),
        )
        .await;
        let mut foreign = f.provisioner.workload_spec(&kept, &f.challenge);
        foreign.name = "unrelated".to_string();
        foreign.labels = Labels::new();
        f.substrate.inject_workload(foreign);

        let summary = f.reconciler.reap_orphans().await.unwrap();
        assert_eq!(summary, OrphanSummary::default());
        assert_eq!(f.substrate.workload_count(), 2);
    }

    #[tokio::test]
    async fn test_reap_marks_lost_instance() {
        let f = fixture();
        let lost = live_instance(
            &f,
            7,
            30001,
            InstanceStatus::Running,
            Utc::now() + Duration::hours(1),
        )
        .await;
        f.substrate
            .remove_workload_silently("ctf-instances", &lost.workload_name);

        let summary = f.reconciler.reap_orphans().await.unwrap();
        assert_eq!(summary.lost_instances, 1);
        let record = f.registry.get_instance(&lost.id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Error);
        // the remaining exposure went with it
        assert_eq!(f.substrate.exposure_count(), 0);
    }

    #[tokio::test]
    async fn test_reap_lost_instance_with_stuck_exposure() {
        let f = fixture();
        let lost = live_instance(
            &f,
            7,
            30001,
            InstanceStatus::Ready,
            Utc::now() + Duration::hours(1),
        )
        .await;
        f.substrate
            .remove_workload_silently("ctf-instances", &lost.workload_name);
        f.substrate.set_faults(FaultPlan {
            fail_exposure_delete: true,
            ..Default::default()
        });

        let summary = f.reconciler.reap_orphans().await.unwrap();
        assert_eq!(summary.lost_instances, 1);
        let record = f.registry.get_instance(&lost.id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Error);
        assert_eq!(f.substrate.exposure_count(), 1);

        f.substrate.clear_faults();
        let summary = f.reconciler.reap_orphans().await.unwrap();
        assert_eq!(summary.exposures_removed, 1);
        assert_eq!(summary.lost_instances, 0);
        assert_eq!(f.substrate.exposure_count(), 0);
    }

    #[tokio::test]
    async fn test_reclaim_expired_is_single_shot() {
        let f = fixture();
        let expired = live_instance(
            &f,
            7,
            30001,
            InstanceStatus::Running,
            Utc::now() - Duration::minutes(1),
        )
        .await;

        let first = f.reconciler.reclaim_expired(&expired).await.unwrap();
        assert_eq!(first, Some(InstanceStatus::Expired));
        assert_eq!(f.substrate.workload_count(), 0);
        assert_eq!(f.substrate.exposure_count(), 0);

        let second = f.reconciler.reclaim_expired(&expired).await.unwrap();
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn test_reap_leaves_creating_records() {
        let f = fixture();
        let creating = live_instance(
            &f,
            7,
            30001,
            InstanceStatus::Creating,
            Utc::now() + Duration::hours(1),
        )
        .await;
        f.substrate
            .remove_workload_silently("ctf-instances", &creating.workload_name);

        let summary = f.reconciler.reap_orphans().await.unwrap();
        assert_eq!(summary.lost_instances, 0);
        let record = f.registry.get_instance(&creating.id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Creating);
    }

    #[tokio::test]
    async fn test_refresh_readiness_promotes_healthy() {
        let f = fixture();
        let inst = live_instance(
            &f,
            7,
            30001,
            InstanceStatus::Running,
            Utc::now() + Duration::hours(1),
        )
        .await;

        assert_eq!(f.reconciler.refresh_readiness().await.unwrap(), 0);

        f.substrate
            .set_health("ctf-instances", &inst.workload_name, WorkloadHealth::Ready);
        assert_eq!(f.reconciler.refresh_readiness().await.unwrap(), 1);
        let record = f.registry.get_instance(&inst.id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Ready);
    }

    #[tokio::test]
    async fn test_run_once_reports_list_failure() {
        let f = fixture();
        f.substrate.set_faults(FaultPlan {
            fail_list: true,
            ..Default::default()
        });

        let report = f.reconciler.run_once(Utc::now()).await;
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("orphan reaping"));
    }
}
