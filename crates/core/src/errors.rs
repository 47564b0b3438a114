use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::models::TaskStatus;

/// Courier error type
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("routing failure: {0}")]
    RoutingFailure(String),

    #[error("transient external error: {message}")]
    TransientExternal {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("task execution failed: {0}")]
    TaskExecution(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("stale transition rejected for task {id}: {from} -> {to}")]
    StaleTransitionRejected {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task record not found: {id}")]
    TaskNotFound { id: Uuid },

    #[error("concurrent modification of task {id} after {attempts} attempts")]
    ConcurrentModification { id: Uuid, attempts: u32 },

    #[error("invalid cron expression: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("scheduler is shut down, rejecting job {0}")]
    SchedulerClosed(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CourierError {
    /// Stable class name recorded on FAILED task records.
    pub fn error_tag(&self) -> &'static str {
        match self {
            CourierError::UnknownTaskType(_) => "unknown_task_type",
            CourierError::RoutingFailure(_) => "routing_failure",
            CourierError::TransientExternal { .. } => "transient_external",
            CourierError::TaskExecution(_) => "task_execution",
            CourierError::BrokerUnavailable(_) => "broker_unavailable",
            CourierError::StaleTransitionRejected { .. } => "stale_transition",
            CourierError::TaskNotFound { .. } => "task_not_found",
            CourierError::ConcurrentModification { .. } => "concurrent_modification",
            CourierError::InvalidCron { .. } => "invalid_cron",
            CourierError::SchedulerClosed(_) => "scheduler_closed",
            CourierError::Database(_) => "database",
            CourierError::Serialization(_) => "serialization",
            CourierError::Configuration(_) => "configuration",
            CourierError::Internal(_) => "internal",
        }
    }

    /// Whether a bounded retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CourierError::TransientExternal { .. } | CourierError::BrokerUnavailable(_)
        )
    }

    pub fn transient(message: impl Into<String>) -> Self {
        CourierError::TransientExternal {
            message: message.into(),
            retry_after: None,
        }
    }

    /// A rate-limit style signal: the callee asked us to come back after `retry_after`.
    pub fn retry_after(message: impl Into<String>, retry_after: Duration) -> Self {
        CourierError::TransientExternal {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(e: serde_json::Error) -> Self {
        CourierError::Serialization(e.to_string())
    }
}

/// Unified result type
pub type CourierResult<T> = std::result::Result<T, CourierError>;
