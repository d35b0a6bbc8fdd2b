//! Durable registry of challenges and instances
//!
//! The registry is the source of truth for what should exist. Exclusivity
//! per (user, challenge) and external port uniqueness are enforced by partial
//! unique indexes over non-terminal statuses, so a losing concurrent insert
//! fails at write time instead of racing an earlier read.

pub mod postgres;
pub mod sqlite;

use crate::error::{RegistryError, RegistryResult};
use crate::models::{Challenge, ChallengeId, Instance, InstanceId, InstanceStatus, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

pub use postgres::PgRegistry;
pub use sqlite::SqliteRegistry;

/// Name of the partial unique index guarding (user, challenge) exclusivity
pub const ACTIVE_PAIR_INDEX: &str = "uq_instances_active_pair";

/// Name of the partial unique index guarding external port uniqueness
pub const ACTIVE_PORT_INDEX: &str = "uq_instances_active_port";

#[async_trait]
pub trait Registry: Send + Sync {
    async fn get_challenge(&self, id: ChallengeId) -> RegistryResult<Option<Challenge>>;

    /// Insert or replace a challenge definition
    async fn put_challenge(&self, challenge: &Challenge) -> RegistryResult<()>;

    /// The non-terminal instance for (user, challenge), if any
    async fn find_active_instance(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
    ) -> RegistryResult<Option<Instance>>;

    /// Insert a new instance record
    ///
    /// Fails with `PairConflict` or `PortTaken` when a uniqueness constraint
    /// over non-terminal instances would be violated.
    async fn insert_instance(&self, instance: &Instance) -> RegistryResult<()>;

    async fn get_instance(&self, id: &InstanceId) -> RegistryResult<Option<Instance>>;

    /// Set `to` if the current status is one of `from`
    ///
    /// Sources that may not move to `to` are ignored. Returns false when the
    /// record is missing or in another status.
    async fn transition_status(
        &self,
        id: &InstanceId,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> RegistryResult<bool>;

    /// Record the last time the instance was looked at by its owner
    async fn touch_instance(&self, id: &InstanceId, at: DateTime<Utc>) -> RegistryResult<()>;

    /// All non-deleted instances of a user, newest first
    async fn list_instances_by_user(&self, user_id: UserId) -> RegistryResult<Vec<Instance>>;

    async fn list_non_terminal_instances(&self) -> RegistryResult<Vec<Instance>>;

    /// External ports currently held by non-terminal instances
    async fn occupied_ports(&self) -> RegistryResult<HashSet<u16>>;
}

#[async_trait]
pub trait RegistryExt: Registry {
    /// Soft delete: the record is kept with status `deleted`
    async fn soft_delete_instance(&self, id: &InstanceId) -> RegistryResult<bool> {
        self.transition_status(id, &InstanceStatus::NOT_DELETED, InstanceStatus::Deleted)
            .await
    }
}

impl<R: Registry + ?Sized> RegistryExt for R {}

/// Open a registry from a connection string
///
/// `postgres://` and `postgresql://` URLs use PostgreSQL, `sqlite::memory:`
/// an in-memory SQLite database, anything else (optionally prefixed with
/// `sqlite://`) a SQLite file path.
pub async fn open(url: &str) -> RegistryResult<Arc<dyn Registry>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        return Ok(Arc::new(PgRegistry::new(url).await?));
    }
    if url == "sqlite::memory:" {
        return Ok(Arc::new(SqliteRegistry::in_memory()?));
    }
    let path = url.strip_prefix("sqlite://").unwrap_or(url);
    Ok(Arc::new(SqliteRegistry::new(path.into())?))
}

/// Classify a unique-violation message by the index or columns it names
pub(crate) fn classify_unique_violation(
    message: &str,
    instance: &Instance,
) -> Option<RegistryError> {
    if message.contains(ACTIVE_PORT_INDEX) || message.contains("external_port") {
        Some(RegistryError::PortTaken(instance.external_port))
    } else if message.contains(ACTIVE_PAIR_INDEX) || message.contains("challenge_id") {
        Some(RegistryError::PairConflict {
            user_id: instance.user_id,
            challenge_id: instance.challenge_id,
        })
    } else {
        None
    }
}

/// The members of `from` allowed to move to `to`
pub(crate) fn permitted_sources(
    from: &[InstanceStatus],
    to: InstanceStatus,
) -> Vec<InstanceStatus> {
    from.iter()
        .copied()
        .filter(|status| status.can_transition_to(to))
        .collect()
}

/// SQL list literal of the non-terminal statuses
pub(crate) fn non_terminal_sql_list() -> String {
    InstanceStatus::NON_TERMINAL
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}
