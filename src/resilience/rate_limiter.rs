//! Sliding-Window Rate Limiter
//! Fail-fast admission (`is_allowed` / `check`) and a smoothing gate (`acquire`)

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::{CoordinationError, CoordinationResult};

#[derive(Debug, Default)]
struct WindowState {
    calls: VecDeque<Instant>,
    last_call: Option<Instant>,
}

impl WindowState {
    fn purge(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.calls.front() {
            if now.duration_since(*oldest) >= window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    max_calls: usize,
    window: Duration,
    min_interval: Option<Duration>,
    state: Mutex<WindowState>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, max_calls: usize, window: Duration) -> Self {
        Self {
            name: name.into(),
            max_calls: max_calls.max(1),
            window,
            min_interval: None,
            state: Mutex::new(WindowState::default()),
        }
    }

    /// Limiter for an exchange budget expressed in calls per second, with even spacing.
    pub fn per_second(name: impl Into<String>, calls_per_second: u32) -> Self {
        let calls = calls_per_second.max(1);
        Self::new(name, calls as usize, Duration::from_secs(1))
            .with_min_interval(Duration::from_secs(1) / calls)
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = Some(min_interval);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit the call if the window (and spacing) allow it, recording it atomically.
    pub fn is_allowed(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge(now, self.window);

        if self.delay_locked(&state, now) > Duration::ZERO {
            return false;
        }

        state.calls.push_back(now);
        state.last_call = Some(now);
        true
    }

    /// Time until the oldest in-window call expires.
    pub fn wait_time(&self) -> Duration {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge(now, self.window);

        state
            .calls
            .front()
            .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(Duration::ZERO)
    }

    /// Fail-fast admission: `RateLimited` carrying the wait time when refused.
    pub fn check(&self) -> CoordinationResult<()> {
        if self.is_allowed() {
            return Ok(());
        }

        let retry_after = self.wait_time();
        debug!(limiter = %self.name, retry_after_ms = retry_after.as_millis() as u64, "Rate limit reached");
        Err(CoordinationError::RateLimited {
            service: self.name.clone(),
            retry_after: Some(retry_after),
        })
    }

    /// Wait until the call is admitted. Returns how long the caller was held back.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();

        loop {
            let delay = {
                let now = Instant::now();
                let mut state = self.state.lock();
                state.purge(now, self.window);

                let delay = self.delay_locked(&state, now);
                if delay == Duration::ZERO {
                    state.calls.push_back(now);
                    state.last_call = Some(now);
                    return started.elapsed();
                }
                delay
            };

            debug!(limiter = %self.name, wait_ms = delay.as_millis() as u64, "Throttling call");
            sleep(delay).await;
        }
    }

    /// Calls currently inside the window.
    pub fn recent_calls(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge(now, self.window);
        state.calls.len()
    }

    fn delay_locked(&self, state: &WindowState, now: Instant) -> Duration {
        let window_delay = if state.calls.len() >= self.max_calls {
            state
                .calls
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        };

        let spacing_delay = match (self.min_interval, state.last_call) {
            (Some(min), Some(last)) => min.saturating_sub(now.duration_since(last)),
            _ => Duration::ZERO,
        };

        window_delay.max(spacing_delay)
    }
}
