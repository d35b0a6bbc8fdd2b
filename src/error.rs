//! Error types for the instance lifecycle

use crate::models::Instance;
use thiserror::Error;

/// Result type for controller operations
pub type InstanceResult<T> = Result<T, InstanceError>;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Result type for substrate operations
pub type SubstrateResult<T> = Result<T, SubstrateError>;

/// Errors surfaced to the boundary layer
#[derive(Error, Debug)]
pub enum InstanceError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("An active instance already exists for this challenge: {}", existing.id)]
    Conflict { existing: Box<Instance> },

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("No port available in range {low}-{high}")]
    AllocationExhausted { low: u16, high: u16 },

    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Deprovisioning incomplete: {0}")]
    Deprovisioning(String),
}

/// Tag for mapping errors to transport responses without inspecting them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Permission,
    AllocationExhausted,
    Provisioning,
    Persistence,
    Deprovisioning,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Permission => "permission",
            ErrorKind::AllocationExhausted => "allocation_exhausted",
            ErrorKind::Provisioning => "provisioning",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Deprovisioning => "deprovisioning",
        }
    }
}

impl InstanceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InstanceError::Validation(_) => ErrorKind::Validation,
            InstanceError::NotFound(_) => ErrorKind::NotFound,
            InstanceError::Conflict { .. } => ErrorKind::Conflict,
            InstanceError::Permission(_) => ErrorKind::Permission,
            InstanceError::AllocationExhausted { .. } => ErrorKind::AllocationExhausted,
            InstanceError::Provisioning(_) => ErrorKind::Provisioning,
            InstanceError::Persistence(_) => ErrorKind::Persistence,
            InstanceError::Deprovisioning(_) => ErrorKind::Deprovisioning,
        }
    }

    /// The instance that won the exclusivity race, if this is a conflict
    pub fn existing_instance(&self) -> Option<&Instance> {
        match self {
            InstanceError::Conflict { existing } => Some(existing),
            _ => None,
        }
    }

    pub(crate) fn conflict(existing: Instance) -> Self {
        InstanceError::Conflict {
            existing: Box::new(existing),
        }
    }
}

/// Errors from the durable registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Non-terminal instance already exists for user {user_id} and challenge {challenge_id}")]
    PairConflict { user_id: i64, challenge_id: i64 },

    #[error("Port {0} is already held by a non-terminal instance")]
    PortTaken(u16),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for RegistryError {
    fn from(err: rusqlite::Error) -> Self {
        RegistryError::Database(err.to_string())
    }
}

impl From<tokio_postgres::Error> for RegistryError {
    fn from(err: tokio_postgres::Error) -> Self {
        RegistryError::Database(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for RegistryError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        RegistryError::Database(err.to_string())
    }
}

/// Errors from the orchestration substrate
#[derive(Error, Debug)]
pub enum SubstrateError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Substrate API error: {0}")]
    Api(String),
}

impl SubstrateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SubstrateError::NotFound(_))
    }
}

impl From<bollard::errors::Error> for SubstrateError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => SubstrateError::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            } => SubstrateError::AlreadyExists(message),
            other => SubstrateError::Api(other.to_string()),
        }
    }
}

impl From<RegistryError> for InstanceError {
    fn from(err: RegistryError) -> Self {
        InstanceError::Persistence(err.to_string())
    }
}
