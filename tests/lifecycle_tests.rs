//! End-to-end lifecycle tests against the SQLite registry and the in-memory
//! substrate.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ctf_instances::{
    Challenge, ChallengeId, DeleteOutcome, ErrorKind, FaultPlan, Instance, InstanceId,
    InstanceStatus, LifecycleController, ManagerConfig, MemorySubstrate, PortRange, Registry,
    RegistryError, RegistryResult, SqliteRegistry, UserId,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const NAMESPACE: &str = "ctf-instances";

fn xss_challenge() -> Challenge {
    Challenge::new(5, "XSS Basic", "xss-vuln", 80).with_limits("0.5", "512Mi")
}

fn config(low: u16, high: u16) -> ManagerConfig {
    ManagerConfig {
        public_host: "192.168.1.34".to_string(),
        ports: PortRange::new(low, high),
        ..Default::default()
    }
}

async fn setup(
    ports: (u16, u16),
) -> (
    Arc<LifecycleController>,
    Arc<SqliteRegistry>,
    Arc<MemorySubstrate>,
) {
    let registry = Arc::new(SqliteRegistry::in_memory().unwrap());
    registry.put_challenge(&xss_challenge()).await.unwrap();
    let substrate = Arc::new(MemorySubstrate::new());
    let controller = Arc::new(LifecycleController::assemble(
        registry.clone(),
        substrate.clone(),
        config(ports.0, ports.1),
    ));
    (controller, registry, substrate)
}

#[tokio::test]
async fn test_create_conflict_delete_scenario() {
    let (controller, _, substrate) = setup((30000, 32000)).await;

    let first = controller.create_instance(7, 5).await.unwrap();
    assert_eq!(first.status, InstanceStatus::Running);
    assert_eq!(first.internal_port, 80);
    assert!((30000..=32000).contains(&first.external_port));
    assert_eq!(
        first.access_url,
        format!("http://192.168.1.34:{}", first.external_port)
    );
    assert!(first.expires_at > first.started_at);

    let err = controller.create_instance(7, 5).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.existing_instance().map(|i| i.id), Some(first.id));

    let outcome = controller
        .delete_instance(&first.id.to_string(), 7, false)
        .await
        .unwrap();
    assert_eq!(outcome, DeleteOutcome::Deleted);
    assert_eq!(substrate.workload_count(), 0);
    assert_eq!(substrate.exposure_count(), 0);

    let second = controller.create_instance(7, 5).await.unwrap();
    assert_ne!(second.id, first.id);
    assert_ne!(second.workload_name, first.workload_name);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_single_winner() {
    let (controller, registry, substrate) = setup((30000, 31999)).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let controller = controller.clone();
        handles.push(tokio::spawn(
            async move { controller.create_instance(7, 5).await },
        ));
    }

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(instance) => winners.push(instance),
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::Conflict, "unexpected error: {}", e);
                conflicts += 1;
            }
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, 15);
    assert_eq!(substrate.workload_count(), 1);
    assert_eq!(substrate.exposure_count(), 1);
    assert_eq!(registry.list_non_terminal_instances().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_users_get_distinct_ports() {
    let (controller, registry, _) = setup((30000, 30011)).await;

    let mut handles = Vec::new();
    for user in 1..=12 {
        let controller = controller.clone();
        handles.push(tokio::spawn(
            async move { controller.create_instance(user, 5).await },
        ));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let live = registry.list_non_terminal_instances().await.unwrap();
    let ports: HashSet<u16> = live.iter().map(|i| i.external_port).collect();
    assert_eq!(live.len(), 12);
    assert_eq!(ports.len(), 12);

    let err = controller.create_instance(13, 5).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AllocationExhausted);
}

#[tokio::test]
async fn test_delete_twice_is_noop() {
    let (controller, _, substrate) = setup((30000, 32000)).await;
    let keep = controller.create_instance(8, 5).await.unwrap();
    let instance = controller.create_instance(7, 5).await.unwrap();
    let id = instance.id.to_string();

    assert_eq!(
        controller.delete_instance(&id, 7, false).await.unwrap(),
        DeleteOutcome::Deleted
    );
    assert_eq!(
        controller.delete_instance(&id, 7, false).await.unwrap(),
        DeleteOutcome::AlreadyDeleted
    );

    assert_eq!(substrate.workload_deletes(), 1);
    assert_eq!(substrate.exposure_deletes(), 1);
    assert!(substrate
        .workload(NAMESPACE, &keep.workload_name)
        .is_some());
}

#[tokio::test]
async fn test_exposure_failure_leaves_no_orphan() {
    let (controller, registry, substrate) = setup((30000, 32000)).await;
    substrate.set_faults(FaultPlan {
        fail_exposure_create: true,
        ..Default::default()
    });

    let err = controller.create_instance(7, 5).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Provisioning);
    assert_eq!(substrate.workload_count(), 0);
    assert_eq!(substrate.exposure_count(), 0);

    // the failed attempt is recorded as error and does not block a retry
    let listed = registry.list_instances_by_user(7).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, InstanceStatus::Error);

    substrate.clear_faults();
    let instance = controller.create_instance(7, 5).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
}

/// Registry whose `creating -> running` transition can be made to fail
struct FlakyRegistry {
    inner: SqliteRegistry,
    fail_running: AtomicBool,
}

#[async_trait]
impl Registry for FlakyRegistry {
    async fn get_challenge(&self, id: ChallengeId) -> RegistryResult<Option<Challenge>> {
        self.inner.get_challenge(id).await
    }

    async fn put_challenge(&self, challenge: &Challenge) -> RegistryResult<()> {
        self.inner.put_challenge(challenge).await
    }

    async fn find_active_instance(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
    ) -> RegistryResult<Option<Instance>> {
        self.inner.find_active_instance(user_id, challenge_id).await
    }

    async fn insert_instance(&self, instance: &Instance) -> RegistryResult<()> {
        self.inner.insert_instance(instance).await
    }

    async fn get_instance(&self, id: &InstanceId) -> RegistryResult<Option<Instance>> {
        self.inner.get_instance(id).await
    }

    async fn transition_status(
        &self,
        id: &InstanceId,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> RegistryResult<bool> {
        if to == InstanceStatus::Running && self.fail_running.load(Ordering::SeqCst) {
            return Err(RegistryError::Database("connection reset".to_string()));
        }
        self.inner.transition_status(id, from, to).await
    }

    async fn touch_instance(&self, id: &InstanceId, at: DateTime<Utc>) -> RegistryResult<()> {
        self.inner.touch_instance(id, at).await
    }

    async fn list_instances_by_user(&self, user_id: UserId) -> RegistryResult<Vec<Instance>> {
        self.inner.list_instances_by_user(user_id).await
    }

    async fn list_non_terminal_instances(&self) -> RegistryResult<Vec<Instance>> {
        self.inner.list_non_terminal_instances().await
    }

    async fn occupied_ports(&self) -> RegistryResult<HashSet<u16>> {
        self.inner.occupied_ports().await
    }
}

#[tokio::test]
async fn test_persistence_failure_rolls_back() {
    let registry = Arc::new(FlakyRegistry {
        inner: SqliteRegistry::in_memory().unwrap(),
        fail_running: AtomicBool::new(true),
    });
    registry.put_challenge(&xss_challenge()).await.unwrap();
    let substrate = Arc::new(MemorySubstrate::new());
    let controller =
        LifecycleController::assemble(registry.clone(), substrate.clone(), config(30000, 32000));

    let err = controller.create_instance(7, 5).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Persistence);
    assert_eq!(substrate.workload_count(), 0);
    assert_eq!(substrate.exposure_count(), 0);

    let listed = registry.list_instances_by_user(7).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, InstanceStatus::Error);

    registry.fail_running.store(false, Ordering::SeqCst);
    controller.create_instance(7, 5).await.unwrap();
}

#[tokio::test]
async fn test_expired_instance_swept_once() {
    let (controller, registry, substrate) = setup((30000, 32000)).await;
    let instance = controller.create_instance(7, 5).await.unwrap();

    let later = instance.expires_at + Duration::seconds(1);
    let report = controller.reconciler().run_once(later).await;
    assert_eq!(report.expired, 1);
    assert!(report.errors.is_empty());

    let report = controller.reconciler().run_once(later).await;
    assert_eq!(report.expired, 0);

    let record = registry.get_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(record.status, InstanceStatus::Expired);
    assert_eq!(substrate.workload_deletes(), 1);
    assert_eq!(substrate.exposure_deletes(), 1);

    // expired instances still show up in the user's list
    let listed = controller.list_user_instances(7).await.unwrap();
    assert_eq!(listed.len(), 1);
    controller.create_instance(7, 5).await.unwrap();
}

#[tokio::test]
async fn test_cleanup_failure_is_left_for_sweeper() {
    let (controller, registry, substrate) = setup((30000, 32000)).await;
    let instance = controller.create_instance(7, 5).await.unwrap();
    substrate.set_faults(FaultPlan {
        fail_workload_delete: true,
        ..Default::default()
    });

    let outcome = controller
        .delete_instance(&instance.id.to_string(), 7, false)
        .await
        .unwrap();
    assert_eq!(outcome, DeleteOutcome::CleanupPending);
    let record = registry.get_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(record.status, InstanceStatus::Error);
    assert_eq!(substrate.workload_count(), 1);

    substrate.clear_faults();
    let report = controller.reconciler().run_once(Utc::now()).await;
    assert_eq!(report.orphan_workloads_removed, 1);
    assert_eq!(substrate.workload_count(), 0);

    // the error record can still be deleted by its owner
    assert_eq!(
        controller
            .delete_instance(&instance.id.to_string(), 7, false)
            .await
            .unwrap(),
        DeleteOutcome::Deleted
    );
}

#[tokio::test]
async fn test_round_trip_by_id() {
    let (controller, _, _) = setup((30000, 32000)).await;
    let created = controller.create_instance(7, 5).await.unwrap();

    let fetched = controller
        .get_instance(&created.id.to_string(), 7, false)
        .await
        .unwrap();
    assert_eq!(fetched.namespace, created.namespace);
    assert_eq!(fetched.external_port, created.external_port);
    assert_eq!(fetched.internal_port, xss_challenge().port);
    assert!(fetched
        .access_url
        .contains(&created.external_port.to_string()));
    assert_eq!(fetched.status, InstanceStatus::Running);
}

#[tokio::test]
async fn test_list_newest_first() {
    let (controller, registry, _) = setup((30000, 32000)).await;
    registry
        .put_challenge(&Challenge::new(6, "SQLi", "sqli-vuln", 8080))
        .await
        .unwrap();

    let older = controller.create_instance(7, 5).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let newer = controller.create_instance(7, 6).await.unwrap();
    controller.create_instance(8, 5).await.unwrap();

    let listed = controller.list_user_instances(7).await.unwrap();
    let ids: Vec<_> = listed.iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![newer.id, older.id]);
}
