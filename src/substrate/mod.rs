//! Container orchestration substrate
//!
//! A namespace groups the resources of all instances. Each instance owns one
//! workload (the challenge container) and one exposure (publishing the
//! workload's port on an external port).

pub mod docker;
pub mod memory;

use crate::error::SubstrateResult;
use crate::naming::Labels;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use docker::DockerSubstrate;
pub use memory::{FaultPlan, MemorySubstrate};

/// CPU in millicores, memory in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceList {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub limits: ResourceList,
    pub requests: ResourceList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub run_as_user: u32,
    pub run_as_non_root: bool,
    pub allow_privilege_escalation: bool,
    pub read_only_root_filesystem: bool,
}

/// Desired state of a challenge workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub replicas: u32,
    pub container_port: u16,
    pub resources: ResourceRequirements,
    pub security: SecurityContext,
    pub labels: Labels,
    /// Stable address the exposure targets
    pub selector: String,
}

/// Desired state of a network exposure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureSpec {
    pub name: String,
    pub namespace: String,
    pub external_port: u16,
    pub target_port: u16,
    pub selector: String,
    pub labels: Labels,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureRef {
    pub namespace: String,
    pub name: String,
}

/// Outcome of an idempotent delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    Removed,
    AlreadyAbsent,
}

/// A resource observed in the substrate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMeta {
    pub name: String,
    pub labels: Labels,
}

/// Readiness of a workload as reported by the substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadHealth {
    Ready,
    Starting,
    Failed,
    Missing,
}

#[async_trait]
pub trait Substrate: Send + Sync {
    /// Create the namespace if it does not exist
    async fn ensure_namespace(&self, name: &str) -> SubstrateResult<()>;

    async fn create_workload(&self, spec: &WorkloadSpec) -> SubstrateResult<WorkloadRef>;

    /// Delete a workload; a missing workload is not an error
    async fn delete_workload(&self, namespace: &str, name: &str) -> SubstrateResult<Deletion>;

    async fn create_exposure(&self, spec: &ExposureSpec) -> SubstrateResult<ExposureRef>;

    /// Delete an exposure; a missing exposure is not an error
    async fn delete_exposure(&self, namespace: &str, name: &str) -> SubstrateResult<Deletion>;

    async fn list_workloads(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> SubstrateResult<Vec<ResourceMeta>>;

    async fn list_exposures(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> SubstrateResult<Vec<ResourceMeta>>;

    async fn workload_health(&self, namespace: &str, name: &str) -> SubstrateResult<WorkloadHealth>;
}
