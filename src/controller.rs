//! Lifecycle Controller
//!
//! Entry point for the boundary layer. Creates, deletes, lists and fetches
//! instances while keeping the registry and the substrate consistent:
//!
//! create: validate -> reserve (exclusivity + port) -> provision -> running
//! delete: authorize -> deprovision -> deleted (or error, for the sweeper)
//!
//! Failures after the reservation unwind through a saga in reverse order.

use crate::allocator::PortAllocator;
use crate::config::ManagerConfig;
use crate::error::{InstanceError, InstanceResult};
use crate::models::{Challenge, ChallengeId, Instance, InstanceId, InstanceStatus, UserId};
use crate::naming::{exposure_name, workload_name};
use crate::provisioner::{access_url, Provisioner};
use crate::reconciler::Reconciler;
use crate::registry::{Registry, RegistryExt};
use crate::saga::Saga;
use crate::substrate::Substrate;
use chrono::{Duration as ChronoDuration, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Upper bound on an instance lifetime
const MAX_TTL_SECS: u64 = 365 * 24 * 3600; // 1 year

/// Result of a delete request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// Resources removed and record marked deleted
    Deleted,
    /// The record was already deleted; nothing was touched
    AlreadyDeleted,
    /// Resource removal failed; the record is marked error and the sweeper
    /// will retry
    CleanupPending,
}

pub struct LifecycleController {
    registry: Arc<dyn Registry>,
    provisioner: Arc<Provisioner>,
    reconciler: Arc<Reconciler>,
    allocator: PortAllocator,
    config: Arc<ManagerConfig>,
}

fn validate_id(kind: &str, id: i64) -> InstanceResult<()> {
    if id <= 0 {
        return Err(InstanceError::Validation(format!(
            "{} id must be positive, got {}",
            kind, id
        )));
    }
    Ok(())
}

fn parse_instance_id(raw: &str) -> InstanceResult<InstanceId> {
    raw.parse()
        .map_err(|e| InstanceError::Validation(format!("invalid instance id {:?}: {}", raw, e)))
}

impl LifecycleController {
    pub fn new(
        registry: Arc<dyn Registry>,
        provisioner: Arc<Provisioner>,
        reconciler: Arc<Reconciler>,
        allocator: PortAllocator,
        config: Arc<ManagerConfig>,
    ) -> Self {
        Self {
            registry,
            provisioner,
            reconciler,
            allocator,
            config,
        }
    }

    /// Wire up the default components around a registry and a substrate
    pub fn assemble(
        registry: Arc<dyn Registry>,
        substrate: Arc<dyn Substrate>,
        config: ManagerConfig,
    ) -> Self {
        let config = Arc::new(config);
        let provisioner = Arc::new(Provisioner::new(substrate, config.clone()));
        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            provisioner.clone(),
            config.clone(),
        ));
        let allocator = PortAllocator::new(config.ports, config.allocation_attempts);
        Self::new(registry, provisioner, reconciler, allocator, config)
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    async fn active_challenge(&self, challenge_id: ChallengeId) -> InstanceResult<Challenge> {
        match self.registry.get_challenge(challenge_id).await? {
            Some(challenge) if challenge.active => Ok(challenge),
            Some(_) => Err(InstanceError::NotFound(format!(
                "challenge {} is not active",
                challenge_id
            ))),
            None => Err(InstanceError::NotFound(format!(
                "challenge {}",
                challenge_id
            ))),
        }
    }

    /// Start a new instance of a challenge for a user
    pub async fn create_instance(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
    ) -> InstanceResult<Instance> {
        validate_id("user", user_id)?;
        validate_id("challenge", challenge_id)?;
        let challenge = self.active_challenge(challenge_id).await?;

        if let Some(existing) = self
            .registry
            .find_active_instance(user_id, challenge_id)
            .await?
        {
            if !existing.is_expired(Utc::now()) {
                return Err(InstanceError::conflict(existing));
            }
            // lifetime is over but the sweeper has not run yet
            info!(
                "Reclaiming expired instance {} before creating a new one",
                existing.id
            );
            self.reconciler.reclaim_expired(&existing).await?;
        }

        let id = InstanceId::new();
        let workload = workload_name(user_id, challenge_id, &id);
        let exposure = exposure_name(&workload);
        let started_at = Utc::now();
        let ttl_secs = challenge
            .time_limit_secs
            .filter(|secs| *secs > 0)
            .unwrap_or(self.config.instance_ttl_secs);
        let expires_at = started_at + ChronoDuration::seconds(ttl_secs.min(MAX_TTL_SECS) as i64);
        let namespace = self.config.namespace.clone();
        let public_host = self.config.public_host.clone();
        let internal_port = challenge.port;

        let instance = self
            .allocator
            .reserve(self.registry.as_ref(), |port| Instance {
                id,
                user_id,
                challenge_id,
                workload_name: workload.clone(),
                exposure_name: exposure.clone(),
                namespace: namespace.clone(),
                external_port: port,
                internal_port,
                access_url: access_url(&public_host, port),
                status: InstanceStatus::Creating,
                started_at,
                expires_at,
                last_accessed: None,
            })
            .await?;

        let mut saga = Saga::new(format!("create {}", instance.id));
        {
            let registry = self.registry.clone();
            let id = instance.id;
            saga.register("reserve", move || {
                async move {
                    registry
                        .transition_status(&id, &[InstanceStatus::Creating], InstanceStatus::Error)
                        .await?;
                    Ok(())
                }
                .boxed()
            });
        }

        if let Err(e) = self.provisioner.provision(&instance, &challenge).await {
            error!("Provisioning instance {} failed: {}", instance.id, e);
            saga.compensate().await;
            return Err(e.into());
        }
        {
            let reconciler = self.reconciler.clone();
            let provisioned = instance.clone();
            saga.register("provision", move || {
                async move {
                    reconciler.cleanup(&provisioned).await?;
                    Ok(())
                }
                .boxed()
            });
        }

        let persisted = self
            .registry
            .transition_status(
                &instance.id,
                &[InstanceStatus::Creating],
                InstanceStatus::Running,
            )
            .await;
        match persisted {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    "Instance {} left creating before it could be marked running",
                    instance.id
                );
                saga.compensate().await;
                return Err(InstanceError::Persistence(format!(
                    "instance {} is no longer creating",
                    instance.id
                )));
            }
            Err(e) => {
                error!("Persisting instance {} failed: {}", instance.id, e);
                saga.compensate().await;
                return Err(e.into());
            }
        }
        saga.commit();

        info!(
            "Created instance {} for user {} on challenge {} at {}",
            instance.id, user_id, challenge_id, instance.access_url
        );
        Ok(Instance {
            status: InstanceStatus::Running,
            ..instance
        })
    }

    async fn authorized_instance(
        &self,
        instance_id: &str,
        requester_id: UserId,
        is_admin: bool,
    ) -> InstanceResult<Instance> {
        let id = parse_instance_id(instance_id)?;
        let instance = self
            .registry
            .get_instance(&id)
            .await?
            .ok_or_else(|| InstanceError::NotFound(format!("instance {}", id)))?;
        if !is_admin && !instance.is_owned_by(requester_id) {
            return Err(InstanceError::Permission(format!(
                "user {} does not own instance {}",
                requester_id, id
            )));
        }
        Ok(instance)
    }

    /// Stop an instance and release its resources
    pub async fn delete_instance(
        &self,
        instance_id: &str,
        requester_id: UserId,
        is_admin: bool,
    ) -> InstanceResult<DeleteOutcome> {
        let instance = self
            .authorized_instance(instance_id, requester_id, is_admin)
            .await?;
        if instance.status == InstanceStatus::Deleted {
            return Ok(DeleteOutcome::AlreadyDeleted);
        }

        match self.reconciler.cleanup(&instance).await {
            Ok(_) => {
                if !self.registry.soft_delete_instance(&instance.id).await? {
                    // a concurrent delete won
                    return Ok(DeleteOutcome::AlreadyDeleted);
                }
                info!("Deleted instance {}", instance.id);
                Ok(DeleteOutcome::Deleted)
            }
            Err(e) => {
                warn!(
                    "Instance {} could not be fully removed, leaving it for the sweeper: {}",
                    instance.id, e
                );
                self.registry
                    .transition_status(
                        &instance.id,
                        &InstanceStatus::NON_TERMINAL,
                        InstanceStatus::Error,
                    )
                    .await?;
                Ok(DeleteOutcome::CleanupPending)
            }
        }
    }

    /// Every non-deleted instance of a user, newest first
    pub async fn list_user_instances(&self, user_id: UserId) -> InstanceResult<Vec<Instance>> {
        validate_id("user", user_id)?;
        Ok(self.registry.list_instances_by_user(user_id).await?)
    }

    /// Fetch one instance and record the access
    pub async fn get_instance(
        &self,
        instance_id: &str,
        requester_id: UserId,
        is_admin: bool,
    ) -> InstanceResult<Instance> {
        let mut instance = self
            .authorized_instance(instance_id, requester_id, is_admin)
            .await?;
        if instance.is_owned_by(requester_id) && instance.status != InstanceStatus::Deleted {
            let now = Utc::now();
            self.registry.touch_instance(&instance.id, now).await?;
            instance.last_accessed = Some(now);
        }
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use crate::error::ErrorKind;
    use crate::registry::SqliteRegistry;
    use crate::substrate::MemorySubstrate;

    async fn controller() -> (LifecycleController, Arc<MemorySubstrate>) {
        let registry = Arc::new(SqliteRegistry::in_memory().unwrap());
        registry
            .put_challenge(&Challenge::new(5, "XSS Basic", "xss-vuln", 80))
            .await
            .unwrap();
        registry
            .put_challenge(&Challenge::new(6, "Retired", "old", 80).inactive())
            .await
            .unwrap();
        registry
            .put_challenge(&Challenge::new(9, "Quick", "quick", 8080).with_time_limit(600))
            .await
            .unwrap();
        let substrate = Arc::new(MemorySubstrate::new());
        let config = ManagerConfig {
            ports: PortRange::new(30000, 30099),
            ..Default::default()
        };
        (
            LifecycleController::assemble(registry, substrate.clone(), config),
            substrate,
        )
    }

    #[tokio::test]
    async fn test_rejects_non_positive_ids() {
        let (controller, _) = controller().await;
        let err = controller.create_instance(0, 5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = controller.create_instance(7, -1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_unknown_and_inactive_challenges() {
        let (controller, substrate) = controller().await;
        let err = controller.create_instance(7, 404).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = controller.create_instance(7, 6).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(substrate.workload_count(), 0);
    }

    #[tokio::test]
    async fn test_challenge_time_limit_sets_expiry() {
        let (controller, _) = controller().await;
        let instance = controller.create_instance(7, 9).await.unwrap();
        assert_eq!(
            instance.expires_at - instance.started_at,
            ChronoDuration::seconds(600)
        );
        let instance = controller.create_instance(7, 5).await.unwrap();
        assert_eq!(
            instance.expires_at - instance.started_at,
            ChronoDuration::hours(2)
        );
    }

    #[tokio::test]
    async fn test_create_reclaims_unswept_expired_instance() {
        let (controller, substrate) = controller().await;
        controller
            .registry()
            .put_challenge(&Challenge::new(10, "Blink", "blink", 80).with_time_limit(1))
            .await
            .unwrap();

        let stale = controller.create_instance(7, 10).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        let fresh = controller.create_instance(7, 10).await.unwrap();
        assert_ne!(fresh.id, stale.id);
        let record = controller.registry().get_instance(&stale.id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Expired);
        assert_eq!(substrate.workload_count(), 1);
        assert_eq!(substrate.exposure_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_instance_id() {
        let (controller, _) = controller().await;
        let err = controller
            .delete_instance("not-a-uuid", 7, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = controller
            .delete_instance(&InstanceId::new().to_string(), 7, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_delete_requires_owner_or_admin() {
        let (controller, substrate) = controller().await;
        let instance = controller.create_instance(7, 5).await.unwrap();
        let id = instance.id.to_string();

        let err = controller.delete_instance(&id, 8, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
        assert_eq!(substrate.workload_count(), 1);

        assert_eq!(
            controller.delete_instance(&id, 8, true).await.unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(substrate.workload_count(), 0);
    }

    #[tokio::test]
    async fn test_get_instance_records_access() {
        let (controller, _) = controller().await;
        let created = controller.create_instance(7, 5).await.unwrap();
        let id = created.id.to_string();

        let fetched = controller.get_instance(&id, 7, false).await.unwrap();
        assert!(fetched.last_accessed.is_some());
        assert_eq!(fetched.external_port, created.external_port);

        let err = controller.get_instance(&id, 8, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
    }
}
