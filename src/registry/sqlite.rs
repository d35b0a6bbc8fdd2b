//! SQLite registry
//!
//! Used for single-node deployments and tests. All access goes through one
//! connection, so statements are serialized; the partial unique indexes still
//! decide which of two competing reservations wins.

use super::{
    classify_unique_violation, non_terminal_sql_list, permitted_sources, Registry,
    ACTIVE_PAIR_INDEX, ACTIVE_PORT_INDEX,
};
use crate::error::{RegistryError, RegistryResult};
use crate::models::{Challenge, ChallengeId, Instance, InstanceId, InstanceStatus, UserId};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS challenges (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    image TEXT NOT NULL,
    port INTEGER NOT NULL,
    cpu_limit TEXT NOT NULL DEFAULT '0.5',
    memory_limit TEXT NOT NULL DEFAULT '512Mi',
    active INTEGER NOT NULL DEFAULT 1,
    time_limit_secs INTEGER
);

CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    challenge_id INTEGER NOT NULL,
    workload_name TEXT NOT NULL,
    exposure_name TEXT NOT NULL,
    namespace TEXT NOT NULL,
    external_port INTEGER NOT NULL,
    internal_port INTEGER NOT NULL,
    access_url TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    last_accessed INTEGER
);

CREATE INDEX IF NOT EXISTS idx_instances_user ON instances(user_id);
CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status);
"#;

const INSTANCE_COLUMNS: &str = "id, user_id, challenge_id, workload_name, exposure_name, namespace, \
     external_port, internal_port, access_url, status, started_at, expires_at, last_accessed";

/// Partial unique indexes, built from the non-terminal status set
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

pub struct SqliteRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRegistry {
    /// Open (or create) the registry at the specified path
    pub fn new(path: PathBuf) -> RegistryResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| RegistryError::Database(format!("{}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(&path)?;
        let registry = Self::init(conn)?;
        info!("SQLite registry initialized at {:?}", path);
        Ok(registry)
    }

    /// Create an in-memory registry (for testing)
    pub fn in_memory() -> RegistryResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> RegistryResult<Self> {
        conn.execute_batch(SCHEMA)?;
        conn.execute_batch(&active_indexes())?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

/// Raw column values of an instance row
struct InstanceRow {
    id: String,
    user_id: i64,
    challenge_id: i64,
    workload_name: String,
    exposure_name: String,
    namespace: String,
    external_port: i64,
    internal_port: i64,
    access_url: String,
    status: String,
    started_at: i64,
    expires_at: i64,
    last_accessed: Option<i64>,
}

impl InstanceRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            challenge_id: row.get(2)?,
            workload_name: row.get(3)?,
            exposure_name: row.get(4)?,
            namespace: row.get(5)?,
            external_port: row.get(6)?,
            internal_port: row.get(7)?,
            access_url: row.get(8)?,
            status: row.get(9)?,
            started_at: row.get(10)?,
            expires_at: row.get(11)?,
            last_accessed: row.get(12)?,
        })
    }

    fn into_instance(self) -> RegistryResult<Instance> {
        let id = self
            .id
            .parse::<InstanceId>()
            .map_err(|e| RegistryError::Corrupt(format!("instance id {}: {}", self.id, e)))?;
        let status = self
            .status
            .parse::<InstanceStatus>()
            .map_err(RegistryError::Corrupt)?;
        Ok(Instance {
            id,
            user_id: self.user_id,
            challenge_id: self.challenge_id,
            workload_name: self.workload_name,
            exposure_name: self.exposure_name,
            namespace: self.namespace,
            external_port: port_from_column(self.external_port)?,
            internal_port: port_from_column(self.internal_port)?,
            access_url: self.access_url,
            status,
            started_at: millis_to_datetime(self.started_at)?,
            expires_at: millis_to_datetime(self.expires_at)?,
            last_accessed: self.last_accessed.map(millis_to_datetime).transpose()?,
        })
    }
}

fn port_from_column(value: i64) -> RegistryResult<u16> {
    u16::try_from(value).map_err(|_| RegistryError::Corrupt(format!("port out of range: {}", value)))
}

fn millis_to_datetime(ms: i64) -> RegistryResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| RegistryError::Corrupt(format!("timestamp out of range: {}", ms)))
}

fn status_list(statuses: &[InstanceStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn map_insert_error(err: rusqlite::Error, instance: &Instance) -> RegistryError {
    if let rusqlite::Error::SqliteFailure(ffi, Some(message)) = &err {
        if ffi.code == ErrorCode::ConstraintViolation {
            if let Some(mapped) = classify_unique_violation(message, instance) {
                return mapped;
            }
        }
    }
    RegistryError::from(err)
}

#[async_trait]
impl Registry for SqliteRegistry {
    async fn get_challenge(&self, id: ChallengeId) -> RegistryResult<Option<Challenge>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, name, image, port, cpu_limit, memory_limit, active, time_limit_secs
                 FROM challenges WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, bool>(6)?,
                        row.get::<_, Option<i64>>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, name, image, port, cpu_limit, memory_limit, active, time_limit)) = row else {
            return Ok(None);
        };
        Ok(Some(Challenge {
            id,
            name,
            image,
            port: port_from_column(port)?,
            cpu_limit,
            memory_limit,
            active,
            time_limit_secs: time_limit.and_then(|t| u64::try_from(t).ok()),
        }))
    }

    async fn put_challenge(&self, challenge: &Challenge) -> RegistryResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO challenges (id, name, image, port, cpu_limit, memory_limit, active, time_limit_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                challenge.id,
                challenge.name,
                challenge.image,
                challenge.port as i64,
                challenge.cpu_limit,
                challenge.memory_limit,
                challenge.active,
                challenge.time_limit_secs.map(|t| t as i64),
            ],
        )?;
        Ok(())
    }

    async fn find_active_instance(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
    ) -> RegistryResult<Option<Instance>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM instances WHERE user_id = ?1 AND challenge_id = ?2 AND status IN ({})",
            INSTANCE_COLUMNS,
            non_terminal_sql_list()
        );
        let row = conn
            .query_row(&sql, params![user_id, challenge_id], InstanceRow::read)
            .optional()?;
        row.map(InstanceRow::into_instance).transpose()
    }

    async fn insert_instance(&self, instance: &Instance) -> RegistryResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO instances ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                INSTANCE_COLUMNS
            ),
            params![
                instance.id.to_string(),
                instance.user_id,
                instance.challenge_id,
                instance.workload_name,
                instance.exposure_name,
                instance.namespace,
                instance.external_port as i64,
                instance.internal_port as i64,
                instance.access_url,
                instance.status.as_str(),
                instance.started_at.timestamp_millis(),
                instance.expires_at.timestamp_millis(),
                instance.last_accessed.map(|t| t.timestamp_millis()),
            ],
        )
        .map_err(|e| map_insert_error(e, instance))?;
        debug!(
            "Reserved port {} for instance {}",
            instance.external_port, instance.id
        );
        Ok(())
    }

    async fn get_instance(&self, id: &InstanceId) -> RegistryResult<Option<Instance>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM instances WHERE id = ?1", INSTANCE_COLUMNS),
                params![id.to_string()],
                InstanceRow::read,
            )
            .optional()?;
        row.map(InstanceRow::into_instance).transpose()
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
        let conn = self.conn.lock();
        let changed = conn.execute(
            &format!(
                "UPDATE instances SET status = ?1 WHERE id = ?2 AND status IN ({})",
                status_list(&from)
            ),
            params![to.as_str(), id.to_string()],
        )?;
        Ok(changed > 0)
    }

    async fn touch_instance(&self, id: &InstanceId, at: DateTime<Utc>) -> RegistryResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE instances SET last_accessed = ?1 WHERE id = ?2",
            params![at.timestamp_millis(), id.to_string()],
        )?;
        Ok(())
    }

    async fn list_instances_by_user(&self, user_id: UserId) -> RegistryResult<Vec<Instance>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM instances WHERE user_id = ?1 AND status != 'deleted'
             ORDER BY started_at DESC, rowid DESC",
            INSTANCE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![user_id], InstanceRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(InstanceRow::into_instance).collect()
    }

    async fn list_non_terminal_instances(&self) -> RegistryResult<Vec<Instance>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM instances WHERE status IN ({}) ORDER BY started_at",
            INSTANCE_COLUMNS,
            non_terminal_sql_list()
        ))?;
        let rows = stmt
            .query_map([], InstanceRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(InstanceRow::into_instance).collect()
    }

    async fn occupied_ports(&self) -> RegistryResult<HashSet<u16>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT external_port FROM instances WHERE status IN ({})",
            non_terminal_sql_list()
        ))?;
        let ports = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ports.into_iter().map(port_from_column).collect()
    }
}
