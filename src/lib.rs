//! CTF Challenge Instance Manager
//!
//! Provisions, tracks and tears down per-user challenge instances on a
//! container substrate while keeping a durable registry consistent with the
//! resources that actually exist.
//!
//! ## Module Structure
//!
//! - `models`: Challenge and instance records, instance status machine
//! - `registry`: Durable store (SQLite, PostgreSQL)
//! - `substrate`: Orchestration backends (Docker, in-memory)
//! - `allocator`: External port reservation
//! - `provisioner`: Workload and exposure creation
//! - `reconciler`: Expiry, orphan and readiness duties
//! - `sweeper`: Background worker driving the reconciler
//! - `controller`: Create/delete/list/get entry points

pub mod allocator;
pub mod config;
pub mod controller;
pub mod error;
pub mod models;
pub mod naming;
pub mod provisioner;
pub mod quantity;
pub mod reconciler;
pub mod registry;
pub mod saga;
pub mod substrate;
pub mod sweeper;

pub use allocator::PortAllocator;
pub use config::{ManagerConfig, PortRange};
pub use controller::{DeleteOutcome, LifecycleController};
pub use error::{
    ErrorKind, InstanceError, InstanceResult, RegistryError, RegistryResult, SubstrateError,
    SubstrateResult,
};
pub use models::{Challenge, ChallengeId, Instance, InstanceId, InstanceStatus, UserId};
pub use provisioner::{access_url, DeprovisionReport, ProvisionError, Provisioned, Provisioner};
pub use reconciler::{Reconciler, SweepReport};
pub use registry::{PgRegistry, Registry, RegistryExt, SqliteRegistry};
pub use saga::Saga;
pub use substrate::{DockerSubstrate, FaultPlan, MemorySubstrate, Substrate};
pub use sweeper::{spawn_sweeper, SweeperHandle};
