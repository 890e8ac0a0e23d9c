//! Coordination Errors
//! Error taxonomy shared by the scheduler, the state coordinator and the resilience primitives

use std::time::Duration;
use thiserror::Error;

pub type CoordinationResult<T> = Result<T, CoordinationError>;

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Operation {operation_id} conflicts with {conflicting:?} on account {account_id}")]
    Conflict {
        operation_id: String,
        account_id: String,
        conflicting: Vec<String>,
    },
    #[error("Circuit breaker [{name}] is open, retry in {retry_in:?}")]
    CircuitOpen { name: String, retry_in: Duration },
    #[error("Rate limited by {service}")]
    RateLimited {
        service: String,
        retry_after: Option<Duration>,
    },
    #[error("Task {task_id} timed out after {timeout:?}")]
    TaskTimeout { task_id: String, timeout: Duration },
    #[error("Task {task_id} failed after {attempts} attempts: {last_error}")]
    TaskExhausted {
        task_id: String,
        attempts: u32,
        last_error: String,
    },
    #[error("Bulkhead [{name}] is full ({max_concurrent} concurrent)")]
    BulkheadFull { name: String, max_concurrent: usize },
    #[error("Insufficient resources to run task now")]
    ResourceExhausted,
    #[error("Task coordinator is not running")]
    NotRunning,
    #[error("Invalid task: {0}")]
    InvalidTask(String),
    #[error("Task not found: {0}")]
    TaskNotFound(String),
    #[error("Task {0} was cancelled")]
    Cancelled(String),
    #[error("Timed out waiting for {0}")]
    WaitTimeout(String),
    #[error("Exchange API error: {0}")]
    Api(String),
    #[error(transparent)]
    Operation(#[from] anyhow::Error),
}

/// Closed classification of failures, used by retry and circuit breaker policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Conflict,
    CircuitOpen,
    RateLimited,
    Timeout,
    Exhausted,
    BulkheadFull,
    ResourceExhausted,
    Validation,
    NotFound,
    Cancelled,
    Api,
    Other,
}

impl FailureKind {
    pub const ALL: [FailureKind; 12] = [
        FailureKind::Conflict,
        FailureKind::CircuitOpen,
        FailureKind::RateLimited,
        FailureKind::Timeout,
        FailureKind::Exhausted,
        FailureKind::BulkheadFull,
        FailureKind::ResourceExhausted,
        FailureKind::Validation,
        FailureKind::NotFound,
        FailureKind::Cancelled,
        FailureKind::Api,
        FailureKind::Other,
    ];
}

/// Maps an error onto a [`FailureKind`] for policy decisions.
pub trait Classify {
    fn failure_kind(&self) -> FailureKind;

    /// Server-suggested delay before the next attempt, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Classify for CoordinationError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            CoordinationError::Conflict { .. } => FailureKind::Conflict,
            CoordinationError::CircuitOpen { .. } => FailureKind::CircuitOpen,
            CoordinationError::RateLimited { .. } => FailureKind::RateLimited,
            CoordinationError::TaskTimeout { .. } | CoordinationError::WaitTimeout(_) => {
                FailureKind::Timeout
            }
            CoordinationError::TaskExhausted { .. } => FailureKind::Exhausted,
            CoordinationError::BulkheadFull { .. } => FailureKind::BulkheadFull,
            CoordinationError::ResourceExhausted => FailureKind::ResourceExhausted,
            CoordinationError::InvalidTask(_) | CoordinationError::NotRunning => {
                FailureKind::Validation
            }
            CoordinationError::TaskNotFound(_) => FailureKind::NotFound,
            CoordinationError::Cancelled(_) => FailureKind::Cancelled,
            CoordinationError::Api(_) => FailureKind::Api,
            CoordinationError::Operation(err) => err
                .downcast_ref::<CoordinationError>()
                .map(Classify::failure_kind)
                .unwrap_or(FailureKind::Other),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            CoordinationError::RateLimited { retry_after, .. } => *retry_after,
            CoordinationError::Operation(err) => err
                .downcast_ref::<CoordinationError>()
                .and_then(Classify::retry_after),
            _ => None,
        }
    }
}
