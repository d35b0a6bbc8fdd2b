//! Challenge and instance records
//!
//! `Challenge` is owned by the catalog and only read here. `Instance` is owned
//! by this crate: one row per attempt, never physically deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// User identifier (assigned by the account subsystem)
pub type UserId = i64;

/// Challenge identifier (assigned by the catalog subsystem)
pub type ChallengeId = i64;

/// Challenge definition as consumed by the provisioner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: ChallengeId,
    pub name: String,
    /// Container image reference (e.g. "xss-vuln" or "registry/app:tag")
    pub image: String,
    /// Port the challenge container listens on
    pub port: u16,
    /// CPU limit, e.g. "0.5" or "500m"
    pub cpu_limit: String,
    /// Memory limit, e.g. "512Mi"
    pub memory_limit: String,
    /// Only active challenges may be instantiated
    pub active: bool,
    /// Per-challenge instance lifetime; falls back to the manager default
    #[serde(default)]
    pub time_limit_secs: Option<u64>,
}

impl Challenge {
    pub fn new(id: ChallengeId, name: impl Into<String>, image: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            name: name.into(),
            image: image.into(),
            port,
            cpu_limit: "0.5".to_string(),
            memory_limit: "512Mi".to_string(),
            active: true,
            time_limit_secs: None,
        }
    }

    pub fn with_limits(mut self, cpu: impl Into<String>, memory: impl Into<String>) -> Self {
        self.cpu_limit = cpu.into();
        self.memory_limit = memory.into();
        self
    }

    pub fn with_time_limit(mut self, secs: u64) -> Self {
        self.time_limit_secs = Some(secs);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Unique instance identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First 12 hex digits, used as the collision-resistant suffix of resource names
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..12].to_string()
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Status of an instance
///
/// `creating`, `running` and `ready` are non-terminal and count towards the
/// exclusivity and port-uniqueness invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Creating,
    Running,
    Ready,
    Error,
    Expired,
    Deleted,
}

impl InstanceStatus {
    pub const NON_TERMINAL: [InstanceStatus; 3] = [
        InstanceStatus::Creating,
        InstanceStatus::Running,
        InstanceStatus::Ready,
    ];

    /// Every status from which a soft delete is permitted
    pub const NOT_DELETED: [InstanceStatus; 5] = [
        InstanceStatus::Creating,
        InstanceStatus::Running,
        InstanceStatus::Ready,
        InstanceStatus::Error,
        InstanceStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Creating => "creating",
            InstanceStatus::Running => "running",
            InstanceStatus::Ready => "ready",
            InstanceStatus::Error => "error",
            InstanceStatus::Expired => "expired",
            InstanceStatus::Deleted => "deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !Self::NON_TERMINAL.contains(self)
    }

    /// Check if a status transition is valid
    pub fn can_transition_to(&self, to: InstanceStatus) -> bool {
        use InstanceStatus::*;
        match (self, to) {
            (Creating, Running | Error | Expired | Deleted) => true,
            (Running, Ready | Error | Expired | Deleted) => true,
            (Ready, Error | Expired | Deleted) => true,
            (Error, Deleted) => true,
            (Expired, Deleted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(InstanceStatus::Creating),
            "running" => Ok(InstanceStatus::Running),
            "ready" => Ok(InstanceStatus::Ready),
            "error" => Ok(InstanceStatus::Error),
            "expired" => Ok(InstanceStatus::Expired),
            "deleted" => Ok(InstanceStatus::Deleted),
            other => Err(format!("unknown instance status: {}", other)),
        }
    }
}

/// One ephemeral, per-user attempt at a challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub user_id: UserId,
    pub challenge_id: ChallengeId,
    /// Substrate name of the workload running the challenge image
    pub workload_name: String,
    /// Substrate name of the exposure publishing `external_port`
    pub exposure_name: String,
    pub namespace: String,
    pub external_port: u16,
    /// Copy of the challenge's container port
    pub internal_port: u16,
    pub access_url: String,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_owned_by(&self, user_id: UserId) -> bool {
        self.user_id == user_id
    }
}
