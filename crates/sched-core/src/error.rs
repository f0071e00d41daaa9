//! Error handling for the GPU scheduler
//!
//! Provides a unified error type and result type for use across all scheduler
//! components.

use crate::types::{JobId, TenantId};

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, Error>;

/// Entity kinds referenced by not-found errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Job,
    Tenant,
    Gpu,
    Node,
    Allocation,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Job => write!(f, "job"),
            Entity::Tenant => write!(f, "tenant"),
            Entity::Gpu => write!(f, "GPU"),
            Entity::Node => write!(f, "node"),
            Entity::Allocation => write!(f, "allocation"),
        }
    }
}

/// Unified error type for the scheduler
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An entity was not found in the repository
    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: String },

    /// A tenant quota dimension would be exceeded
    #[error("quota exceeded for tenant {tenant_id}: {resource} requested={requested}, ceiling={ceiling}, current={current}")]
    QuotaExceeded {
        tenant_id: TenantId,
        resource: &'static str,
        requested: u64,
        ceiling: u64,
        current: u64,
    },

    /// A submitted job failed validation
    #[error("invalid job: {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// A lifecycle transition that the state machine forbids
    #[error("invalid {entity} transition for {id}: {current} -> {target}")]
    InvalidTransition {
        entity: Entity,
        id: String,
        current: String,
        target: String,
    },

    /// The scheduling queue is at capacity
    #[error("queue is full (capacity: {capacity})")]
    QueueFull { capacity: usize },

    /// The job is already present in the queue
    #[error("job {job_id} is already in queue")]
    DuplicateJob { job_id: JobId },

    /// No node can currently satisfy the request; the cycle retries
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    /// Gang scheduling requested but no single node can hold the whole gang
    #[error("gang scheduling failed: {0}")]
    GangImpossible(String),

    /// Node counters drifted between selection and commit
    #[error("stale node state: {0}")]
    StaleNode(String),

    /// An error from the underlying repository
    #[error("repository error: {0}")]
    Repository(String),

    /// Internal engine error
    #[error("internal error: {0}")]
    Internal(String),

    /// Configuration-related errors
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Serialization errors from persisted payloads
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration parsing errors
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Create a not-found error
    pub fn not_found(entity: Entity, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Create a validation error
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Create an invalid-transition error
    pub fn invalid_transition(
        entity: Entity,
        id: impl std::fmt::Display,
        current: impl std::fmt::Display,
        target: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            id: id.to_string(),
            current: current.to_string(),
            target: target.to_string(),
        }
    }

    /// Create an insufficient-resources error
    pub fn insufficient_resources(msg: impl Into<String>) -> Self {
        Self::InsufficientResources(msg.into())
    }

    /// Create a gang-impossible error
    pub fn gang_impossible(msg: impl Into<String>) -> Self {
        Self::GangImpossible(msg.into())
    }

    /// Create a stale-node error
    pub fn stale_node(msg: impl Into<String>) -> Self {
        Self::StaleNode(msg.into())
    }

    /// Create a repository error
    pub fn repository(msg: impl Into<String>) -> Self {
        Self::Repository(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Whether this error means the cluster lacked capacity
    ///
    /// Only these failures make the scheduling cycle consider preemption.
    pub fn is_resource_error(&self) -> bool {
        matches!(self, Error::InsufficientResources(_))
    }

    /// Whether a later scheduling cycle may succeed without intervention
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::InsufficientResources(_) | Error::GangImpossible(_) | Error::StaleNode(_)
        )
    }

    /// Whether this error is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::Validation { .. } => "validation",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::QueueFull { .. } => "queue_full",
            Error::DuplicateJob { .. } => "duplicate_job",
            Error::InsufficientResources(_) => "insufficient_resources",
            Error::GangImpossible(_) => "gang_impossible",
            Error::StaleNode(_) => "stale_node",
            Error::Repository(_) => "repository",
            Error::Internal(_) => "internal",
            Error::InvalidConfiguration(_) => "configuration",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
        }
    }
}
