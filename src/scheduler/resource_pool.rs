//! Resource Pool
//! Global and per-account concurrency ceilings plus the API call window

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use super::task::AccountId;

#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub max_concurrent_tasks: usize,
    pub max_concurrent_per_account: usize,
    pub max_api_calls_per_window: u32,
    pub api_window: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            max_concurrent_per_account: 3,
            max_api_calls_per_window: 60,
            api_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct PoolState {
    active_tasks: usize,
    active_by_account: HashMap<AccountId, usize>,
    api_calls_this_window: u32,
    window_started: Instant,
}

impl PoolState {
    fn roll_window(&mut self, window: Duration) {
        let now = Instant::now();
        if now.duration_since(self.window_started) >= window {
            self.api_calls_this_window = 0;
            self.window_started = now;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    pub active_tasks: usize,
    pub max_concurrent_tasks: usize,
    pub active_by_account: BTreeMap<AccountId, usize>,
    pub max_concurrent_per_account: usize,
    pub api_calls_this_window: u32,
    pub max_api_calls_per_window: u32,
}

/// Shared handle; clones see the same counters.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    limits: Arc<ResourceLimits>,
    state: Arc<Mutex<PoolState>>,
}

/// Admission held by a running task. Dropping it gives the capacity back.
#[derive(Debug)]
pub struct TaskSlot {
    state: Arc<Mutex<PoolState>>,
    accounts: Vec<AccountId>,
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.active_tasks = state.active_tasks.saturating_sub(1);
        for account in &self.accounts {
            if let Some(count) = state.active_by_account.get_mut(account) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.active_by_account.remove(account);
                }
            }
        }
    }
}

impl ResourcePool {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits: Arc::new(limits),
            state: Arc::new(Mutex::new(PoolState {
                active_tasks: 0,
                active_by_account: HashMap::new(),
                api_calls_this_window: 0,
                window_started: Instant::now(),
            })),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Admission check without taking capacity.
    pub fn can_admit(&self, accounts: Option<&[AccountId]>) -> bool {
        let mut state = self.state.lock();
        state.roll_window(self.limits.api_window);
        self.admits(&state, &distinct(accounts))
    }

    /// Check every ceiling and take a slot in one step.
    pub fn try_acquire(&self, accounts: Option<&[AccountId]>) -> Option<TaskSlot> {
        let accounts = distinct(accounts);
        let mut state = self.state.lock();
        state.roll_window(self.limits.api_window);

        if !self.admits(&state, &accounts) {
            debug!(
                active_tasks = state.active_tasks,
                api_calls = state.api_calls_this_window,
                "Task not admitted"
            );
            return None;
        }

        state.active_tasks += 1;
        for account in &accounts {
            *state.active_by_account.entry(account.clone()).or_insert(0) += 1;
        }

        Some(TaskSlot {
            state: Arc::clone(&self.state),
            accounts,
        })
    }

    pub fn record_api_call(&self) {
        let mut state = self.state.lock();
        state.roll_window(self.limits.api_window);
        state.api_calls_this_window = state.api_calls_this_window.saturating_add(1);
    }

    pub fn active_tasks(&self) -> usize {
        self.state.lock().active_tasks
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        let mut state = self.state.lock();
        state.roll_window(self.limits.api_window);
        ResourceSnapshot {
            active_tasks: state.active_tasks,
            max_concurrent_tasks: self.limits.max_concurrent_tasks,
            active_by_account: state
                .active_by_account
                .iter()
                .map(|(account, count)| (account.clone(), *count))
                .collect(),
            max_concurrent_per_account: self.limits.max_concurrent_per_account,
            api_calls_this_window: state.api_calls_this_window,
            max_api_calls_per_window: self.limits.max_api_calls_per_window,
        }
    }

    fn admits(&self, state: &PoolState, accounts: &[AccountId]) -> bool {
        if state.active_tasks >= self.limits.max_concurrent_tasks {
            return false;
        }
        if state.api_calls_this_window >= self.limits.max_api_calls_per_window {
            return false;
        }
        accounts.iter().all(|account| {
            state.active_by_account.get(account).copied().unwrap_or(0)
                < self.limits.max_concurrent_per_account
        })
    }
}

fn distinct(accounts: Option<&[AccountId]>) -> Vec<AccountId> {
    accounts
        .unwrap_or_default()
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
