//! Bulkhead Isolation
//! Caps concurrency per named resource so one overloaded dependency cannot starve the rest

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::{CoordinationError, CoordinationResult};
use crate::observability::metrics::get_metrics;

#[derive(Debug, Clone)]
pub struct Bulkhead {
    name: Arc<str>,
    max_concurrent: usize,
    permits: Arc<Semaphore>,
}

/// Slot held inside a bulkhead; released when dropped.
#[derive(Debug)]
pub struct BulkheadPermit {
    name: Arc<str>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        debug!(bulkhead = %self.name, "Bulkhead slot released");
    }
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            name: Arc::from(name.into()),
            max_concurrent,
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn active(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Take a slot or fail immediately with `BulkheadFull`.
    pub fn try_acquire(&self) -> CoordinationResult<BulkheadPermit> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(self.wrap(permit)),
            Err(_) => {
                warn!(bulkhead = %self.name, max = self.max_concurrent, "Bulkhead full, rejecting");
                if let Some(metrics) = get_metrics() {
                    metrics
                        .bulkhead_rejections_total
                        .with_label_values(&[&*self.name])
                        .inc();
                }
                Err(CoordinationError::BulkheadFull {
                    name: self.name.to_string(),
                    max_concurrent: self.max_concurrent,
                })
            }
        }
    }

    /// Wait for a slot.
    pub async fn acquire(&self) -> CoordinationResult<BulkheadPermit> {
        let permit = self.permits.clone().acquire_owned().await.map_err(|_| {
            CoordinationError::BulkheadFull {
                name: self.name.to_string(),
                max_concurrent: self.max_concurrent,
            }
        })?;
        Ok(self.wrap(permit))
    }

    /// Run `work` inside a slot; the slot is returned on every exit path.
    pub async fn run<Fut, T>(&self, work: Fut) -> CoordinationResult<T>
    where
        Fut: Future<Output = CoordinationResult<T>>,
    {
        let _permit = self.try_acquire()?;
        work.await
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> BulkheadPermit {
        debug!(bulkhead = %self.name, "Bulkhead slot acquired");
        BulkheadPermit {
            name: self.name.clone(),
            _permit: permit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_when_full_and_recovers_on_drop() {
        let bulkhead = Bulkhead::new("orders", 2);
        let a = bulkhead.try_acquire().unwrap();
        let _b = bulkhead.try_acquire().unwrap();
        assert_eq!(bulkhead.active(), 2);
        assert!(matches!(
            bulkhead.try_acquire(),
            Err(CoordinationError::BulkheadFull { max_concurrent: 2, .. })
        ));

        drop(a);
        assert_eq!(bulkhead.available(), 1);
        assert!(bulkhead.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn run_releases_on_failure() {
        let bulkhead = Bulkhead::new("sync", 1);
        let result: CoordinationResult<()> = bulkhead
            .run(async { Err(CoordinationError::Api("timeout".into())) })
            .await;

        assert!(result.is_err());
        assert_eq!(bulkhead.active(), 0);
    }
}
