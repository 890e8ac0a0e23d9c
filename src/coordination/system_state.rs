//! System State Coordinator
//! Registry of in-flight account operations, conflict detection, and the single
//! choke point for exchange API traffic

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::alert_dedup::AlertDeduplicator;
use super::asset_locks::{AssetLockGuard, AssetLockManager};
use crate::error::{CoordinationError, CoordinationResult};
use crate::observability::metrics::get_metrics;
use crate::resilience::RateLimiter;
use crate::scheduler::ResourcePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    TwapExecution,
    Rebalancing,
    OrderManagement,
    PortfolioSync,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::TwapExecution => "twap_execution",
            OperationType::Rebalancing => "rebalancing",
            OperationType::OrderManagement => "order_management",
            OperationType::PortfolioSync => "portfolio_sync",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an operation touches: one account and a set of assets on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub operation_type: OperationType,
    pub account_id: String,
    pub assets: BTreeSet<String>,
}

impl OperationSpec {
    pub fn new(operation_type: OperationType, account_id: impl Into<String>) -> Self {
        Self {
            operation_type,
            account_id: account_id.into(),
            assets: BTreeSet::new(),
        }
    }

    pub fn with_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.assets.extend(assets.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveOperation {
    pub operation_id: String,
    pub operation_type: OperationType,
    pub account_id: String,
    pub assets: BTreeSet<String>,
    pub started_at: DateTime<Utc>,
    /// Lower is more urgent.
    pub priority: u8,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CoordinatorStats {
    pub total_operations: u64,
    pub conflicts_prevented: u64,
    pub api_calls_throttled: u64,
    pub alerts_deduplicated: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStateSnapshot {
    pub active_operations: Vec<ActiveOperation>,
    pub operations_by_type: BTreeMap<OperationType, usize>,
    pub locked_assets: Vec<String>,
    pub api_calls_in_window: usize,
    pub api_call_limit: usize,
    pub stats: CoordinatorStats,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SystemStateConfig {
    pub max_api_calls_per_second: u32,
    pub alert_dedup_window: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for SystemStateConfig {
    fn default() -> Self {
        Self {
            max_api_calls_per_second: 8,
            alert_dedup_window: Duration::from_secs(5 * 60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct Registry {
    active: HashMap<String, ActiveOperation>,
    completions: HashMap<String, watch::Sender<bool>>,
    stats: CoordinatorStats,
}

pub struct SystemStateCoordinator {
    config: SystemStateConfig,
    registry: Mutex<Registry>,
    asset_locks: AssetLockManager,
    api_limiter: RateLimiter,
    alerts: AlertDeduplicator,
    active_count: watch::Sender<usize>,
    resource_pool: Option<ResourcePool>,
}

/// Scoped hold on a registered operation and its asset locks.
///
/// Dropping it releases the locks and completes the operation, whatever the exit path.
pub struct OperationPermit {
    coordinator: Arc<SystemStateCoordinator>,
    operation_id: String,
    locks: Option<AssetLockGuard>,
}

impl OperationPermit {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }
}

impl Drop for OperationPermit {
    fn drop(&mut self) {
        drop(self.locks.take());
        self.coordinator.complete_operation(&self.operation_id);
    }
}

impl Default for SystemStateCoordinator {
    fn default() -> Self {
        Self::new(SystemStateConfig::default())
    }
}

impl SystemStateCoordinator {
    pub fn new(config: SystemStateConfig) -> Self {
        let (active_count, _) = watch::channel(0);
        Self {
            api_limiter: RateLimiter::per_second("exchange_api", config.max_api_calls_per_second),
            alerts: AlertDeduplicator::new(config.alert_dedup_window),
            asset_locks: AssetLockManager::new(),
            registry: Mutex::new(Registry::default()),
            active_count,
            resource_pool: None,
            config,
        }
    }

    /// Count every limited API call against the scheduler's resource pool as well.
    pub fn with_resource_pool(mut self, pool: ResourcePool) -> Self {
        self.resource_pool = Some(pool);
        self
    }

    pub fn asset_locks(&self) -> &AssetLockManager {
        &self.asset_locks
    }

    /// Register an operation, failing with `Conflict` when an equal-or-more-urgent
    /// operation on the same account already holds any of the assets.
    pub fn register_operation(
        &self,
        operation_id: impl Into<String>,
        spec: &OperationSpec,
        priority: u8,
    ) -> CoordinationResult<()> {
        let operation_id = operation_id.into();
        let mut registry = self.registry.lock();

        if registry.active.contains_key(&operation_id) {
            return Err(CoordinationError::InvalidTask(format!(
                "operation {operation_id} is already active"
            )));
        }

        let mut conflicting: Vec<String> = registry
            .active
            .values()
            .filter(|op| op.account_id == spec.account_id)
            .filter(|op| !op.assets.is_disjoint(&spec.assets))
            .filter(|op| op.priority <= priority)
            .map(|op| op.operation_id.clone())
            .collect();

        if !conflicting.is_empty() {
            conflicting.sort();
            registry.stats.conflicts_prevented += 1;
            if let Some(metrics) = get_metrics() {
                metrics.operation_conflicts_total.inc();
            }
            warn!(
                operation_id = %operation_id,
                account_id = %spec.account_id,
                conflicting = ?conflicting,
                "Operation conflict detected"
            );
            return Err(CoordinationError::Conflict {
                operation_id,
                account_id: spec.account_id.clone(),
                conflicting,
            });
        }

        let (done_tx, _) = watch::channel(false);
        registry.completions.insert(operation_id.clone(), done_tx);
        registry.active.insert(
            operation_id.clone(),
            ActiveOperation {
                operation_id: operation_id.clone(),
                operation_type: spec.operation_type,
                account_id: spec.account_id.clone(),
                assets: spec.assets.clone(),
                started_at: Utc::now(),
                priority,
            },
        );
        registry.stats.total_operations += 1;
        self.active_count.send_replace(registry.active.len());

        info!(
            operation_id = %operation_id,
            operation_type = %spec.operation_type,
            account_id = %spec.account_id,
            priority = priority,
            "Operation registered"
        );
        Ok(())
    }

    /// Deregister an operation and wake anyone waiting on it. Returns `false` for unknown ids.
    pub fn complete_operation(&self, operation_id: &str) -> bool {
        let mut registry = self.registry.lock();

        let Some(operation) = registry.active.remove(operation_id) else {
            warn!(operation_id = operation_id, "Completing unknown operation");
            return false;
        };
        if let Some(done) = registry.completions.remove(operation_id) {
            done.send_replace(true);
        }
        self.active_count.send_replace(registry.active.len());

        let elapsed = Utc::now() - operation.started_at;
        info!(
            operation_id = operation_id,
            operation_type = %operation.operation_type,
            duration_ms = elapsed.num_milliseconds(),
            "Operation completed"
        );
        true
    }

    /// Register the operation, then take its asset locks in sorted order.
    pub async fn coordinate_operation(
        self: &Arc<Self>,
        operation_id: impl Into<String>,
        spec: &OperationSpec,
        priority: u8,
    ) -> CoordinationResult<OperationPermit> {
        let operation_id = operation_id.into();
        self.register_operation(operation_id.clone(), spec, priority)?;

        // Built before locking so a dropped future still deregisters.
        let mut permit = OperationPermit {
            coordinator: Arc::clone(self),
            operation_id: operation_id.clone(),
            locks: None,
        };
        permit.locks = Some(
            self.asset_locks
                .lock_assets(spec.assets.iter().cloned(), &operation_id)
                .await,
        );
        Ok(permit)
    }

    /// Wait until `operation_id` is no longer active.
    pub async fn wait_for_operation(
        &self,
        operation_id: &str,
        timeout: Duration,
    ) -> CoordinationResult<()> {
        let receiver = {
            let registry = self.registry.lock();
            match registry.completions.get(operation_id) {
                Some(done) => done.subscribe(),
                None => return Ok(()),
            }
        };

        wait_until(receiver, |done| *done, timeout)
            .await
            .map_err(|_| CoordinationError::WaitTimeout(format!("operation {operation_id}")))
    }

    pub fn is_active(&self, operation_id: &str) -> bool {
        self.registry.lock().active.contains_key(operation_id)
    }

    pub fn active_operations(&self) -> Vec<ActiveOperation> {
        let mut operations: Vec<ActiveOperation> =
            self.registry.lock().active.values().cloned().collect();
        operations.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        operations
    }

    /// Run an exchange call behind the shared API limiter, waiting for budget.
    pub async fn api_call_with_limit<F, Fut, T>(&self, call: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let waited = self.api_limiter.acquire().await;
        let outcome = if waited > Duration::ZERO {
            self.registry.lock().stats.api_calls_throttled += 1;
            debug!(wait_ms = waited.as_millis() as u64, "API call throttled");
            "throttled"
        } else {
            "admitted"
        };
        if let Some(metrics) = get_metrics() {
            metrics.api_calls_total.with_label_values(&[outcome]).inc();
        }
        if let Some(pool) = &self.resource_pool {
            pool.record_api_call();
        }

        call().await
    }

    pub fn should_send_alert(&self, alert_key: &str, content: &str) -> bool {
        let send = self.alerts.should_send(alert_key, content);
        if !send {
            self.registry.lock().stats.alerts_deduplicated += 1;
        }
        send
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.registry.lock().stats
    }

    pub fn get_system_status(&self) -> SystemStateSnapshot {
        let (mut active_operations, stats) = {
            let registry = self.registry.lock();
            (
                registry.active.values().cloned().collect::<Vec<_>>(),
                registry.stats,
            )
        };
        active_operations.sort_by(|a, b| a.started_at.cmp(&b.started_at));

        let mut operations_by_type = BTreeMap::new();
        for operation in &active_operations {
            *operations_by_type.entry(operation.operation_type).or_insert(0) += 1;
        }

        SystemStateSnapshot {
            active_operations,
            operations_by_type,
            locked_assets: self.asset_locks.locked_assets(),
            api_calls_in_window: self.api_limiter.recent_calls(),
            api_call_limit: self.api_limiter.max_calls(),
            stats,
            timestamp: Utc::now(),
        }
    }

    /// Wait for active operations to drain. Returns `false` if some were still
    /// running when `timeout` (or the configured default) ran out.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(self.config.shutdown_timeout);
        info!(
            active = *self.active_count.borrow(),
            timeout_secs = timeout.as_secs(),
            "Waiting for active operations to finish"
        );

        match wait_until(self.active_count.subscribe(), |count| *count == 0, timeout).await {
            Ok(()) => {
                info!("System state coordinator shut down cleanly");
                true
            }
            Err(()) => {
                let remaining: Vec<String> = self
                    .active_operations()
                    .into_iter()
                    .map(|op| op.operation_id)
                    .collect();
                warn!(remaining = ?remaining, "Shutdown timed out with operations still active");
                false
            }
        }
    }
}

/// A closed channel counts as satisfied: the sender only goes away once the
/// watched operation is gone.
async fn wait_until<T>(
    mut receiver: watch::Receiver<T>,
    condition: impl FnMut(&T) -> bool,
    timeout: Duration,
) -> Result<(), ()> {
    match tokio::time::timeout(timeout, receiver.wait_for(condition)).await {
        Ok(_) => Ok(()),
        Err(_) => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(account: &str, assets: &[&str]) -> OperationSpec {
        OperationSpec::new(OperationType::Rebalancing, account).with_assets(assets.iter().copied())
    }

    #[test]
    fn duplicate_operation_id_is_rejected() {
        let coordinator = SystemStateCoordinator::default();
        coordinator
            .register_operation("op-1", &spec("acct", &["BTC"]), 3)
            .unwrap();
        let err = coordinator
            .register_operation("op-1", &spec("acct", &["ETH"]), 3)
            .unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidTask(_)));
    }

    #[test]
    fn complete_unknown_operation_is_harmless() {
        let coordinator = SystemStateCoordinator::default();
        assert!(!coordinator.complete_operation("ghost"));
    }
}
