//! Coordination Core - Multi-Account Task Coordination
//! Priority scheduling, per-asset conflict prevention and resilience primitives
//! for automated operations across trading accounts

pub mod config;
pub mod coordination;
pub mod error;
pub mod observability;
pub mod resilience;
pub mod scheduler;

pub use config::Config;
pub use coordination::{
    AlertDeduplicator, AssetLockManager, OperationSpec, OperationType, SystemStateCoordinator,
};
pub use error::{Classify, CoordinationError, CoordinationResult, FailureKind};
pub use resilience::{
    BackoffStrategy, Bulkhead, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState,
    RateLimiter, RetryConfig, RetryPolicy,
};
pub use scheduler::{
    work_fn, ResourceLimits, SchedulerConfig, TaskCoordinator, TaskPriority, TaskRequest,
    TaskState, TaskWork,
};
