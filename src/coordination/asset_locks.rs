//! Per-Asset Lock Manager
//! Multi-asset exclusive locking with sorted acquisition to rule out lock-order deadlocks

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

type Holders = Arc<Mutex<HashMap<String, String>>>;

#[derive(Default)]
pub struct AssetLockManager {
    // Entries are created on first use and never removed.
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    holders: Holders,
}

/// Locks held by one operation. Dropping it releases them in reverse acquisition order.
#[derive(Debug)]
pub struct AssetLockGuard {
    operation_id: String,
    held: Vec<(String, OwnedMutexGuard<()>)>,
    holders: Holders,
}

impl AssetLockGuard {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn assets(&self) -> Vec<&str> {
        self.held.iter().map(|(asset, _)| asset.as_str()).collect()
    }
}

impl Drop for AssetLockGuard {
    fn drop(&mut self) {
        while let Some((asset, guard)) = self.held.pop() {
            {
                let mut holders = self.holders.lock();
                match holders.get(&asset) {
                    Some(holder) if *holder == self.operation_id => {
                        holders.remove(&asset);
                        debug!(asset = %asset, operation_id = %self.operation_id, "Asset lock released");
                    }
                    other => warn!(
                        asset = %asset,
                        operation_id = %self.operation_id,
                        recorded_holder = ?other,
                        "Releasing asset lock not recorded for this operation"
                    ),
                }
            }
            drop(guard);
        }
    }
}

impl AssetLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, asset: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(asset.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Acquire every named asset, in lexicographic order, for `operation_id`.
    ///
    /// Duplicate names are collapsed. If the returned future is dropped part-way,
    /// the locks taken so far are released.
    pub async fn lock_assets<I, S>(&self, assets: I, operation_id: &str) -> AssetLockGuard
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sorted: BTreeSet<String> = assets.into_iter().map(Into::into).collect();

        let mut guard = AssetLockGuard {
            operation_id: operation_id.to_string(),
            held: Vec::with_capacity(sorted.len()),
            holders: self.holders.clone(),
        };

        for asset in sorted {
            let lock = self.lock_for(&asset);
            let held = lock.lock_owned().await;
            self.holders
                .lock()
                .insert(asset.clone(), operation_id.to_string());
            debug!(asset = %asset, operation_id = %operation_id, "Asset lock acquired");
            guard.held.push((asset, held));
        }

        guard
    }

    pub fn holder_of(&self, asset: &str) -> Option<String> {
        self.holders.lock().get(asset).cloned()
    }

    /// Assets currently held, sorted.
    pub fn locked_assets(&self) -> Vec<String> {
        let mut assets: Vec<String> = self.holders.lock().keys().cloned().collect();
        assets.sort();
        assets
    }

    pub fn known_assets(&self) -> usize {
        self.locks.lock().len()
    }
}
