//! Circuit Breaker Implementation
//! Prevents cascading failures by failing fast when a dependency is unhealthy

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Classify, CoordinationError, CoordinationResult, FailureKind};
use crate::observability::metrics::get_metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreakerState {
    fn gauge_value(self) -> f64 {
        match self {
            CircuitBreakerState::Closed => 0.0,
            CircuitBreakerState::HalfOpen => 0.5,
            CircuitBreakerState::Open => 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub name: String,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    /// Probes allowed in flight while half-open.
    pub half_open_max_calls: u32,
    /// Failure kinds that never count against the breaker (caller-side mistakes).
    pub excluded: HashSet<FailureKind>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            excluded: HashSet::from([FailureKind::Validation]),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitBreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitBreakerState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy)]
enum Admission {
    Closed,
    Probe,
}

/// An admitted call whose outcome has not been recorded yet. A probe dropped
/// before recording (timeout, abort) reopens the breaker.
struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
    admission: Option<Admission>,
}

impl InFlight<'_> {
    fn finish(mut self) -> Admission {
        self.admission.take().unwrap_or(Admission::Closed)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(Admission::Probe) = self.admission.take() {
            self.breaker.abandon_probe();
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitBreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_calls: 0,
                last_failure: None,
                last_failure_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    /// Run `operation` through the breaker.
    ///
    /// While open the operation is never invoked and `CircuitOpen` is returned.
    pub async fn call<F, Fut, T>(&self, operation: F) -> CoordinationResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoordinationResult<T>>,
    {
        let in_flight = InFlight {
            breaker: self,
            admission: Some(self.admit()?),
        };
        let result = operation().await;
        let admission = in_flight.finish();

        match &result {
            Ok(_) => self.record_success(admission),
            Err(e) if self.config.excluded.contains(&e.failure_kind()) => {
                self.record_neutral(admission)
            }
            Err(e) => self.record_failure(admission, e),
        }

        result
    }

    fn admit(&self) -> CoordinationResult<Admission> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitBreakerState::Open {
            let elapsed = inner
                .last_failure
                .map(|at| at.elapsed())
                .unwrap_or(self.config.timeout);

            if elapsed < self.config.timeout {
                return Err(CoordinationError::CircuitOpen {
                    name: self.config.name.clone(),
                    retry_in: self.config.timeout - elapsed,
                });
            }

            self.transition(&mut inner, CircuitBreakerState::HalfOpen);
            inner.half_open_calls = 0;
            inner.success_count = 0;
            info!(name = %self.config.name, "Circuit breaker transitioning to half-open");
        }

        match inner.state {
            CircuitBreakerState::Closed => Ok(Admission::Closed),
            _ => {
                if inner.half_open_calls >= self.config.half_open_max_calls {
                    debug!(name = %self.config.name, "Half-open probe already in flight");
                    return Err(CoordinationError::CircuitOpen {
                        name: self.config.name.clone(),
                        retry_in: Duration::ZERO,
                    });
                }
                inner.half_open_calls += 1;
                Ok(Admission::Probe)
            }
        }
    }

    fn record_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();

        match (admission, inner.state) {
            (Admission::Probe, CircuitBreakerState::HalfOpen) => {
                inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
                inner.success_count += 1;

                if inner.success_count >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitBreakerState::Closed);
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    info!(name = %self.config.name, "Circuit breaker closed after recovery");
                }
            }
            (_, CircuitBreakerState::Closed) => {
                inner.failure_count = 0;
            }
            _ => {}
        }
    }

    fn record_failure(&self, admission: Admission, error: &CoordinationError) {
        let mut inner = self.inner.lock();

        match (admission, inner.state) {
            (Admission::Probe, CircuitBreakerState::HalfOpen) => {
                Self::stamp_failure(&mut inner);
                inner.half_open_calls = 0;
                inner.success_count = 0;
                self.transition(&mut inner, CircuitBreakerState::Open);
                warn!(name = %self.config.name, error = %error, "Circuit breaker re-opened from half-open");
            }
            (Admission::Closed, CircuitBreakerState::Closed) => {
                Self::stamp_failure(&mut inner);
                inner.failure_count += 1;

                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitBreakerState::Open);
                    warn!(
                        name = %self.config.name,
                        failures = inner.failure_count,
                        error = %error,
                        "Circuit breaker opened"
                    );
                }
            }
            // A call admitted while closed finished after the breaker tripped.
            _ => {}
        }
    }

    fn stamp_failure(inner: &mut BreakerState) {
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
    }

    fn record_neutral(&self, admission: Admission) {
        if let Admission::Probe = admission {
            let mut inner = self.inner.lock();
            inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
        }
    }

    /// A probe went away without an outcome; treat it as a failed probe.
    fn abandon_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitBreakerState::HalfOpen {
            return;
        }
        Self::stamp_failure(&mut inner);
        inner.half_open_calls = 0;
        inner.success_count = 0;
        self.transition(&mut inner, CircuitBreakerState::Open);
        warn!(name = %self.config.name, "Half-open probe abandoned, circuit breaker re-opened");
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitBreakerState) {
        inner.state = to;
        if let Some(metrics) = get_metrics() {
            metrics
                .circuit_breaker_state
                .with_label_values(&[self.config.name.as_str()])
                .set(to.gauge_value());
        }
    }

    /// Force the breaker closed and clear its counters.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitBreakerState::Closed);
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_calls = 0;
        inner.last_failure = None;
        inner.last_failure_at = None;
        info!(name = %self.config.name, "Circuit breaker manually reset");
    }

    pub async fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            name: self.config.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
        }
    }
}
