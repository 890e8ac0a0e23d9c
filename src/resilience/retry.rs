//! Retry with Backoff
//! Handles transient failures with configurable backoff strategies

use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::error::{Classify, FailureKind};
use crate::observability::metrics::get_metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
    Fibonacci,
    Random,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_strategy: BackoffStrategy,
    pub multiplier: f64,
    pub jitter: bool,
    pub retryable: HashSet<FailureKind>,
    pub non_retryable: HashSet<FailureKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let non_retryable = HashSet::from([
            FailureKind::Conflict,
            FailureKind::Validation,
            FailureKind::NotFound,
            FailureKind::Cancelled,
        ]);
        let retryable = FailureKind::ALL
            .into_iter()
            .filter(|kind| !non_retryable.contains(kind))
            .collect();

        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_strategy: BackoffStrategy::Exponential,
            multiplier: 2.0,
            jitter: true,
            retryable,
            non_retryable,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether a failure of this kind earns another attempt.
    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        !self.config.non_retryable.contains(&kind) && self.config.retryable.contains(&kind)
    }

    /// Delay before the attempt following `attempt` (1-based), capped, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_delay.as_secs_f64();
        let max = self.config.max_delay.as_secs_f64();
        let attempt = attempt.max(1);

        let secs = match self.config.backoff_strategy {
            BackoffStrategy::Fixed => initial,
            BackoffStrategy::Linear => initial * f64::from(attempt),
            BackoffStrategy::Exponential => {
                initial * self.config.multiplier.powi(attempt as i32 - 1)
            }
            BackoffStrategy::Fibonacci => initial * fibonacci(attempt) as f64,
            BackoffStrategy::Random => {
                if max > initial {
                    rand::thread_rng().gen_range(initial..=max)
                } else {
                    initial
                }
            }
        };

        Duration::from_secs_f64(secs.clamp(0.0, max))
    }

    /// Delay with up to 10% jitter added (random backoff is already jittered).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.config.jitter && self.config.backoff_strategy != BackoffStrategy::Random {
            let extra = rand::thread_rng().gen_range(0.0..=0.1);
            delay + delay.mul_f64(extra)
        } else {
            delay
        }
    }

    /// Execute an async operation, retrying retryable failures with backoff.
    pub async fn execute<F, Fut, T, E>(&self, operation: &str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match f().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(
                            operation = operation,
                            attempt = attempt,
                            "Operation succeeded after retry"
                        );
                        record_attempt(operation, "recovered");
                    }
                    return Ok(result);
                }
                Err(e) => {
                    let kind = e.failure_kind();

                    if !self.is_retryable(kind) {
                        error!(
                            operation = operation,
                            attempt = attempt,
                            kind = ?kind,
                            error = %e,
                            "Non-retryable failure"
                        );
                        record_attempt(operation, "non_retryable");
                        return Err(e);
                    }

                    if attempt >= max_attempts {
                        warn!(
                            operation = operation,
                            attempt = attempt,
                            error = %e,
                            "Operation failed after all retries"
                        );
                        record_attempt(operation, "exhausted");
                        return Err(e);
                    }

                    let mut delay = self.delay_for(attempt);
                    if let Some(retry_after) = e.retry_after() {
                        delay = delay.max(retry_after);
                    }

                    warn!(
                        operation = operation,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Operation failed, retrying"
                    );
                    record_attempt(operation, "retry");

                    sleep(delay).await;
                }
            }
        }
    }
}

/// fib(1) = 1, fib(2) = 2, fib(3) = 3, fib(4) = 5, ...
fn fibonacci(n: u32) -> u64 {
    let (mut prev, mut curr) = (1u64, 1u64);
    for _ in 0..n {
        let next = prev.saturating_add(curr);
        prev = curr;
        curr = next;
    }
    prev
}

fn record_attempt(operation: &str, outcome: &str) {
    if let Some(metrics) = get_metrics() {
        metrics
            .retry_attempts_total
            .with_label_values(&[operation, outcome])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            backoff_strategy: strategy,
            jitter: false,
            ..Default::default()
        })
    }

    #[test]
    fn fibonacci_sequence() {
        let seq: Vec<u64> = (1..=6).map(fibonacci).collect();
        assert_eq!(seq, vec![1, 2, 3, 5, 8, 13]);
    }

    #[test]
    fn fixed_and_linear_delays() {
        let fixed = policy(BackoffStrategy::Fixed);
        assert_eq!(fixed.base_delay(4), Duration::from_secs(1));

        let linear = policy(BackoffStrategy::Linear);
        assert_eq!(linear.base_delay(3), Duration::from_secs(3));
    }

    #[test]
    fn random_delay_stays_in_range() {
        let random = policy(BackoffStrategy::Random);
        for attempt in 1..20 {
            let delay = random.base_delay(attempt);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(60));
        }
    }

    #[test]
    fn jitter_adds_at_most_ten_percent() {
        let jittered = RetryPolicy::new(RetryConfig::default());
        for _ in 0..50 {
            let delay = jittered.delay_for(3);
            assert!(delay >= Duration::from_secs(4));
            assert!(delay <= Duration::from_millis(4400));
        }
    }

    #[test]
    fn conflicts_are_not_retried_by_default() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_retryable(FailureKind::Conflict));
        assert!(policy.is_retryable(FailureKind::Timeout));
        assert!(policy.is_retryable(FailureKind::RateLimited));
    }
}
