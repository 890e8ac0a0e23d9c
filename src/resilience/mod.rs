//! Resilience Module - Circuit Breakers, Retries, Rate Limiting, Bulkheads
//! Fault tolerance building blocks shared by every coordinated operation

mod bulkhead;
mod circuit_breaker;
mod rate_limiter;
mod retry;

pub use bulkhead::{Bulkhead, BulkheadPermit};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitBreakerState,
};
pub use rate_limiter::RateLimiter;
pub use retry::{BackoffStrategy, RetryConfig, RetryPolicy};
