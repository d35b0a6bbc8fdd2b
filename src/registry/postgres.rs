//! PostgreSQL registry
//!
//! Shared registry for multi-node deployments. Several managers may run
//! against the same database; the partial unique indexes arbitrate their
//! concurrent reservations.

use super::{
    classify_unique_violation, non_terminal_sql_list, permitted_sources, Registry,
    ACTIVE_PAIR_INDEX, ACTIVE_PORT_INDEX,
};
use crate::error::{RegistryError, RegistryResult};
use crate::models::{Challenge, ChallengeId, Instance, InstanceId, InstanceStatus, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use std::collections::HashSet;
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS challenges (
    id BIGINT PRIMARY KEY,
    name TEXT NOT NULL,
    image TEXT NOT NULL,
    port INTEGER NOT NULL,
    cpu_limit TEXT NOT NULL DEFAULT '0.5',
    memory_limit TEXT NOT NULL DEFAULT '512Mi',
    active BOOLEAN NOT NULL DEFAULT TRUE,
    time_limit_secs BIGINT
);

CREATE TABLE IF NOT EXISTS instances (
    id UUID PRIMARY KEY,
    user_id BIGINT NOT NULL,
    challenge_id BIGINT NOT NULL,
    workload_name TEXT NOT NULL,
    exposure_name TEXT NOT NULL,
    namespace TEXT NOT NULL,
    external_port INTEGER NOT NULL,
    internal_port INTEGER NOT NULL,
    access_url TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    last_accessed TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_instances_user ON instances(user_id);
CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status);
"#;

const INSTANCE_COLUMNS: &str = "id, user_id, challenge_id, workload_name, exposure_name, namespace, \
     external_port, internal_port, access_url, status, started_at, expires_at, last_accessed";

fn active_indexes() -> String {
    let statuses = non_terminal_sql_list();
    format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {pair} ON instances(user_id, challenge_id) WHERE status IN ({s});
         CREATE UNIQUE INDEX IF NOT EXISTS {port} ON instances(external_port) WHERE status IN ({s});",
        pair = ACTIVE_PAIR_INDEX,
        port = ACTIVE_PORT_INDEX,
        s = statuses
    )
}

pub struct PgRegistry {
    pool: Pool,
}

impl PgRegistry {
    /// Connect and run migrations
    pub async fn new(database_url: &str) -> RegistryResult<Self> {
        let mut config = Config::new();
        config.url = Some(database_url.to_string());
        let pool = config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| RegistryError::Database(e.to_string()))?;

        let client = pool.get().await?;
        info!("Connected to PostgreSQL registry");

        client.batch_execute(SCHEMA).await?;
        client.batch_execute(&active_indexes()).await?;
        info!("Registry schema initialized");

        Ok(Self { pool })
    }
}

fn port_from_column(value: i32) -> RegistryResult<u16> {
    u16::try_from(value).map_err(|_| RegistryError::Corrupt(format!("port out of range: {}", value)))
}

fn row_to_instance(r: &Row) -> RegistryResult<Instance> {
    let status: String = r.get(9);
    Ok(Instance {
        id: InstanceId::from_uuid(r.get::<_, Uuid>(0)),
        user_id: r.get(1),
        challenge_id: r.get(2),
        workload_name: r.get(3),
        exposure_name: r.get(4),
        namespace: r.get(5),
        external_port: port_from_column(r.get(6))?,
        internal_port: port_from_column(r.get(7))?,
        access_url: r.get(8),
        status: status.parse().map_err(RegistryError::Corrupt)?,
        started_at: r.get(10),
        expires_at: r.get(11),
        last_accessed: r.get(12),
    })
}

fn status_strings(statuses: &[InstanceStatus]) -> Vec<&'static str> {
    statuses.iter().map(InstanceStatus::as_str).collect()
}

fn map_insert_error(err: tokio_postgres::Error, instance: &Instance) -> RegistryError {
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        let constraint = err
            .as_db_error()
            .and_then(|db| db.constraint())
            .unwrap_or_default();
        if let Some(mapped) = classify_unique_violation(constraint, instance) {
            return mapped;
        }
    }
    RegistryError::from(err)
}

#[async_trait]
impl Registry for PgRegistry {
    async fn get_challenge(&self, id: ChallengeId) -> RegistryResult<Option<Challenge>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, name, image, port, cpu_limit, memory_limit, active, time_limit_secs
                 FROM challenges WHERE id = $1",
                &[&id],
            )
            .await?;

        let Some(r) = row else {
            return Ok(None);
        };
        Ok(Some(Challenge {
            id: r.get(0),
            name: r.get(1),
            image: r.get(2),
            port: port_from_column(r.get(3))?,
            cpu_limit: r.get(4),
            memory_limit: r.get(5),
            active: r.get(6),
            time_limit_secs: r
                .get::<_, Option<i64>>(7)
                .and_then(|t| u64::try_from(t).ok()),
        }))
    }

    async fn put_challenge(&self, challenge: &Challenge) -> RegistryResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO challenges (id, name, image, port, cpu_limit, memory_limit, active, time_limit_secs)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT(id) DO UPDATE SET
                    name = EXCLUDED.name,
                    image = EXCLUDED.image,
                    port = EXCLUDED.port,
                    cpu_limit = EXCLUDED.cpu_limit,
                    memory_limit = EXCLUDED.memory_limit,
                    active = EXCLUDED.active,
                    time_limit_secs = EXCLUDED.time_limit_secs",
                &[
                    &challenge.id,
                    &challenge.name,
                    &challenge.image,
                    &(challenge.port as i32),
                    &challenge.cpu_limit,
                    &challenge.memory_limit,
                    &challenge.active,
                    &challenge.time_limit_secs.map(|t| t as i64),
                ],
            )
            .await?;
        Ok(())
    }

    async fn find_active_instance(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
    ) -> RegistryResult<Option<Instance>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {} FROM instances WHERE user_id = $1 AND challenge_id = $2 AND status IN ({})",
            INSTANCE_COLUMNS,
            non_terminal_sql_list()
        );
        let row = client.query_opt(&sql, &[&user_id, &challenge_id]).await?;
        row.as_ref().map(row_to_instance).transpose()
    }

    async fn insert_instance(&self, instance: &Instance) -> RegistryResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                &format!(
                    "INSERT INTO instances ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
                    INSTANCE_COLUMNS
                ),
                &[
                    instance.id.as_uuid(),
                    &instance.user_id,
                    &instance.challenge_id,
                    &instance.workload_name,
                    &instance.exposure_name,
                    &instance.namespace,
                    &(instance.external_port as i32),
                    &(instance.internal_port as i32),
                    &instance.access_url,
                    &instance.status.as_str(),
                    &instance.started_at,
                    &instance.expires_at,
                    &instance.last_accessed,
                ],
            )
            .await
            .map_err(|e| map_insert_error(e, instance))?;
        debug!(
            "Reserved port {} for instance {}",
            instance.external_port, instance.id
        );
        Ok(())
    }

    async fn get_instance(&self, id: &InstanceId) -> RegistryResult<Option<Instance>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {} FROM instances WHERE id = $1", INSTANCE_COLUMNS),
                &[id.as_uuid()],
            )
            .await?;
        row.as_ref().map(row_to_instance).transpose()
    }

    async fn transition_status(
        &self,
        id: &InstanceId,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> RegistryResult<bool> {
        let from = permitted_sources(from, to);
        if from.is_empty() {
            return Ok(false);
        }
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                "UPDATE instances SET status = $1 WHERE id = $2 AND status = ANY($3)",
                &[&to.as_str(), id.as_uuid(), &status_strings(&from)],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn touch_instance(&self, id: &InstanceId, at: DateTime<Utc>) -> RegistryResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE instances SET last_accessed = $1 WHERE id = $2",
                &[&at, id.as_uuid()],
            )
            .await?;
        Ok(())
    }

    async fn list_instances_by_user(&self, user_id: UserId) -> RegistryResult<Vec<Instance>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM instances WHERE user_id = $1 AND status != 'deleted'
                     ORDER BY started_at DESC",
                    INSTANCE_COLUMNS
                ),
                &[&user_id],
            )
            .await?;
        rows.iter().map(row_to_instance).collect()
    }

    async fn list_non_terminal_instances(&self) -> RegistryResult<Vec<Instance>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM instances WHERE status IN ({}) ORDER BY started_at",
                    INSTANCE_COLUMNS,
                    non_terminal_sql_list()
                ),
                &[],
            )
            .await?;
        rows.iter().map(row_to_instance).collect()
    }

    async fn occupied_ports(&self) -> RegistryResult<HashSet<u16>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT external_port FROM instances WHERE status IN ({})",
                    non_terminal_sql_list()
                ),
                &[],
            )
            .await?;
        rows.iter().map(|r| port_from_column(r.get(0))).collect()
    }
}
