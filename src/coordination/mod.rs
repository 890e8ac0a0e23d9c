//! Coordination Module - Asset Locks, Alert Deduplication, System State
//! Keeps concurrent account operations from stepping on each other

mod alert_dedup;
mod asset_locks;
mod system_state;

pub use alert_dedup::AlertDeduplicator;
pub use asset_locks::{AssetLockGuard, AssetLockManager};
pub use system_state::{
    ActiveOperation, CoordinatorStats, OperationPermit, OperationSpec, OperationType,
    SystemStateConfig, SystemStateCoordinator, SystemStateSnapshot,
};
