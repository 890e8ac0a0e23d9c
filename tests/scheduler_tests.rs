//! Task Coordinator Tests
//! Priority ordering, recurring republishing, retry/timeout/cancel semantics and
//! resource ceilings, driven end to end through the scheduler loop

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coordination_core::coordination::{OperationSpec, OperationType, SystemStateCoordinator};
use coordination_core::error::CoordinationError;
use coordination_core::scheduler::{
    work_fn, ResourceLimits, ResourcePool, SchedulerConfig, TaskCoordinator, TaskPriority,
    TaskRequest, TaskState, TaskWork,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

const WAIT: Duration = Duration::from_secs(600);

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval: Duration::from_millis(50),
        retry_backoff_base: Duration::from_millis(100),
        ..Default::default()
    }
}

fn coordinator(max_concurrent_tasks: usize, max_concurrent_per_account: usize) -> TaskCoordinator {
    TaskCoordinator::new(
        fast_config(),
        ResourceLimits {
            max_concurrent_tasks,
            max_concurrent_per_account,
            ..Default::default()
        },
    )
}

/// Work that appends `label` to `log` and succeeds.
fn recording(label: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<dyn TaskWork> {
    let log = Arc::clone(log);
    work_fn(move |_| {
        let log = Arc::clone(&log);
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            log.lock().push(label);
            Ok(json!({ "ran": label }))
        }
    })
}

/// Work that fails `failures` times before succeeding.
fn flaky(failures: u32, calls: &Arc<AtomicU32>) -> Arc<dyn TaskWork> {
    let calls = Arc::clone(calls);
    work_fn(move |_| {
        let calls = Arc::clone(&calls);
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < failures {
                anyhow::bail!("exchange returned 502 on call {n}");
            }
            Ok(json!(n))
        }
    })
}

#[cfg(test)]
mod scheduling_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_priority_order_with_single_slot() {
        let coordinator = coordinator(1, 3);
        let log = Arc::new(Mutex::new(Vec::new()));

        let ids = [
            coordinator
                .schedule_task(
                    TaskRequest::new("low", recording("low", &log)).priority(TaskPriority::Low),
                )
                .unwrap(),
            coordinator
                .schedule_task(
                    TaskRequest::new("critical", recording("critical", &log))
                        .priority(TaskPriority::Critical),
                )
                .unwrap(),
            coordinator
                .schedule_task(
                    TaskRequest::new("medium", recording("medium", &log))
                        .priority(TaskPriority::Medium),
                )
                .unwrap(),
        ];

        coordinator.start();
        for id in ids {
            let snapshot = coordinator.wait_for_task(id, WAIT).await.unwrap();
            assert_eq!(snapshot.state, TaskState::Completed);
        }
        coordinator.stop().await;

        assert_eq!(*log.lock(), vec!["critical", "medium", "low"]);
        assert_eq!(coordinator.stats().successful, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_tasks_wait_for_their_time() {
        let coordinator = coordinator(4, 3);
        let log = Arc::new(Mutex::new(Vec::new()));
        let later = coordinator
            .schedule_task(
                TaskRequest::new("later", recording("later", &log))
                    .at(chrono::Utc::now() + chrono::Duration::hours(1)),
            )
            .unwrap();
        let now = coordinator
            .schedule_task(TaskRequest::new("now", recording("now", &log)))
            .unwrap();

        coordinator.start();
        coordinator.wait_for_task(now, WAIT).await.unwrap();
        assert_eq!(
            coordinator.get_task_status(later).map(|t| t.state),
            Some(TaskState::Pending)
        );
        assert_eq!(coordinator.get_system_status().queue_size, 1);
        coordinator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_task_republishes_once() {
        let coordinator = coordinator(4, 3);
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = coordinator
            .schedule_recurring_task(
                TaskRequest::new("status_report", recording("report", &log)),
                Duration::from_secs(5 * 60),
            )
            .unwrap();

        coordinator.start();
        let done = coordinator.wait_for_task(first, WAIT).await.unwrap();
        coordinator.stop().await;

        assert_eq!(done.state, TaskState::Completed);
        let completed_at = done.completed_at.unwrap();

        let pending = coordinator.list_tasks(Some(TaskState::Pending));
        assert_eq!(pending.len(), 1);
        let next = &pending[0];
        assert_ne!(next.task_id, first);
        assert!(next.recurring);
        assert_eq!(next.name, "status_report");
        assert_eq!(next.scheduled_at - completed_at, chrono::Duration::minutes(5));
        assert_eq!(coordinator.list_tasks(None).len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected() {
        let coordinator = coordinator(1, 1);
        let log = Arc::new(Mutex::new(Vec::new()));

        let zero_interval = coordinator.schedule_recurring_task(
            TaskRequest::new("sync", recording("sync", &log)),
            Duration::ZERO,
        );
        assert!(matches!(zero_interval, Err(CoordinationError::InvalidTask(_))));

        let zero_timeout = coordinator.schedule_task(
            TaskRequest::new("sync", recording("sync", &log)).timeout(Duration::ZERO),
        );
        assert!(matches!(zero_timeout, Err(CoordinationError::InvalidTask(_))));
        assert!(coordinator.list_tasks(None).is_empty());
    }
}

#[cfg(test)]
mod execution_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let coordinator = coordinator(2, 2);
        let calls = Arc::new(AtomicU32::new(0));
        let id = coordinator
            .schedule_task(TaskRequest::new("rebalance", flaky(2, &calls)).max_retries(3))
            .unwrap();

        coordinator.start();
        let snapshot = coordinator.wait_for_task(id, WAIT).await.unwrap();
        coordinator.stop().await;

        assert_eq!(snapshot.state, TaskState::Completed);
        assert_eq!(snapshot.retry_count, 2);
        assert_eq!(snapshot.result, Some(json!(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.stats().total_retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_settle_failed() {
        let coordinator = coordinator(2, 2);
        let calls = Arc::new(AtomicU32::new(0));
        let id = coordinator
            .schedule_task(TaskRequest::new("dca", flaky(u32::MAX, &calls)).max_retries(2))
            .unwrap();

        coordinator.start();
        let snapshot = coordinator.wait_for_task(id, WAIT).await.unwrap();
        coordinator.stop().await;

        assert_eq!(snapshot.state, TaskState::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(snapshot
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("call 2")));
        assert_eq!(coordinator.stats().failed, 1);
        assert_eq!(coordinator.resource_pool().active_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_gets_its_own_timeout() {
        let coordinator = coordinator(2, 2);
        let calls = Arc::new(AtomicU32::new(0));
        let work = {
            let calls = Arc::clone(&calls);
            work_fn(move |_| {
                let calls = Arc::clone(&calls);
                async move {
                    // First attempt hangs, the retry is quick.
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                    Ok(Value::Null)
                }
            })
        };
        let id = coordinator
            .schedule_task(
                TaskRequest::new("analysis", work)
                    .timeout(Duration::from_secs(5))
                    .max_retries(1),
            )
            .unwrap();

        coordinator.start();
        let snapshot = coordinator.wait_for_task(id, WAIT).await.unwrap();
        coordinator.stop().await;

        assert_eq!(snapshot.state, TaskState::Completed);
        assert_eq!(snapshot.retry_count, 1);
        assert!(snapshot
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("timed out")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_account_ceiling_is_respected() {
        let coordinator = coordinator(10, 1);
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let work = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            work_fn(move |accounts| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    assert_eq!(accounts, Some(vec!["acct-1".to_string()]));
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
        };

        let ids: Vec<_> = (0..3)
            .map(|i| {
                coordinator
                    .schedule_task(
                        TaskRequest::new(format!("rebalance-{i}"), Arc::clone(&work))
                            .accounts(["acct-1"]),
                    )
                    .unwrap()
            })
            .collect();

        coordinator.start();
        for id in ids {
            let snapshot = coordinator.wait_for_task(id, WAIT).await.unwrap();
            assert_eq!(snapshot.state, TaskState::Completed);
        }
        coordinator.stop().await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(coordinator.resource_pool().snapshot().active_by_account.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_immediate_task() {
        let coordinator = coordinator(2, 2);
        coordinator.start();

        let result = coordinator
            .execute_immediate_task(
                TaskRequest::new("price_check", work_fn(|_| async { Ok(json!({ "btc": 1 })) }))
                    .priority(TaskPriority::High),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({ "btc": 1 }));

        let calls = Arc::new(AtomicU32::new(0));
        let err = coordinator
            .execute_immediate_task(TaskRequest::new("broken", flaky(u32::MAX, &calls)).max_retries(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::TaskExhausted { attempts: 2, .. }));

        let names: Vec<String> = coordinator
            .list_tasks(None)
            .into_iter()
            .map(|task| task.name)
            .collect();
        assert!(names.contains(&"immediate_price_check".to_string()));
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_execute_immediate_rejects_without_capacity() {
        let coordinator = coordinator(0, 1);
        coordinator.start();
        let result = coordinator
            .execute_immediate_task(TaskRequest::new(
                "noop",
                work_fn(|_| async { Ok(Value::Null) }),
            ))
            .await;
        assert!(matches!(result, Err(CoordinationError::ResourceExhausted)));
        assert!(coordinator.list_tasks(None).is_empty());
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_execute_immediate_requires_running_scheduler() {
        let coordinator = coordinator(2, 2);
        let result = coordinator
            .execute_immediate_task(TaskRequest::new(
                "noop",
                work_fn(|_| async { Ok(Value::Null) }),
            ))
            .await;
        assert!(matches!(result, Err(CoordinationError::NotRunning)));
        assert!(coordinator.list_tasks(None).is_empty());
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    fn blocking_work(started: &Arc<Notify>) -> Arc<dyn TaskWork> {
        let started = Arc::clone(started);
        work_fn(move |_| {
            let started = Arc::clone(&started);
            async move {
                started.notify_one();
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_task() {
        let coordinator = coordinator(2, 2);
        let started = Arc::new(Notify::new());
        let id = coordinator
            .schedule_task(
                TaskRequest::new("long_backtest", blocking_work(&started))
                    .timeout(Duration::from_secs(7200)),
            )
            .unwrap();

        coordinator.start();
        started.notified().await;
        assert_eq!(coordinator.resource_pool().active_tasks(), 1);

        assert!(coordinator.cancel_task(id).await);
        let snapshot = coordinator.get_task_status(id).unwrap();
        assert_eq!(snapshot.state, TaskState::Cancelled);
        assert!(snapshot.completed_at.is_some());
        assert_eq!(coordinator.resource_pool().active_tasks(), 0);

        // Terminal and unknown tasks are left alone.
        assert!(!coordinator.cancel_task(id).await);
        assert!(!coordinator.cancel_task(uuid::Uuid::new_v4()).await);
        assert_eq!(coordinator.stats().cancelled, 1);
        coordinator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry_backoff() {
        let coordinator = TaskCoordinator::new(
            SchedulerConfig {
                retry_backoff_base: Duration::from_secs(60),
                ..fast_config()
            },
            ResourceLimits::default(),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let id = coordinator
            .schedule_task(TaskRequest::new("dca", flaky(u32::MAX, &calls)).max_retries(5))
            .unwrap();

        coordinator.start();
        loop {
            let snapshot = coordinator.get_task_status(id).unwrap();
            if snapshot.state == TaskState::Pending && snapshot.retry_count == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(coordinator.resource_pool().active_tasks(), 1);

        assert!(coordinator.cancel_task(id).await);
        let snapshot = coordinator.get_task_status(id).unwrap();
        assert_eq!(snapshot.state, TaskState::Cancelled);
        assert_eq!(coordinator.resource_pool().active_tasks(), 0);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            coordinator.get_task_status(id).map(|t| t.state),
            Some(TaskState::Cancelled)
        );
        let stats = coordinator.stats();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.failed, 0);
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_pending_task_drops_it_from_queue() {
        let coordinator = coordinator(1, 1);
        let id = coordinator
            .schedule_task(TaskRequest::new("sync", work_fn(|_| async { Ok(Value::Null) })))
            .unwrap();
        assert_eq!(coordinator.get_system_status().queue_size, 1);

        assert!(coordinator.cancel_task(id).await);
        let status = coordinator.get_system_status();
        assert_eq!(status.queue_size, 0);
        assert_eq!(status.task_counts.cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_running_tasks_and_health_degrades() {
        let coordinator = coordinator(2, 2);
        assert_eq!(coordinator.health_check().status, "degraded");

        let started = Arc::new(Notify::new());
        let id = coordinator
            .schedule_task(
                TaskRequest::new("long_backtest", blocking_work(&started))
                    .timeout(Duration::from_secs(7200)),
            )
            .unwrap();
        coordinator.start();
        started.notified().await;

        let health = coordinator.health_check();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.system_status.coordinator_status, "active");
        assert_eq!(health.system_status.task_counts.running, 1);

        coordinator.stop().await;
        assert_eq!(coordinator.health_check().status, "degraded");
        assert_eq!(
            coordinator.get_task_status(id).map(|t| t.state),
            Some(TaskState::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_evicts_settled_tasks() {
        let coordinator = TaskCoordinator::new(
            SchedulerConfig {
                retention: Duration::ZERO,
                cleanup_interval: Duration::from_secs(3600),
                ..fast_config()
            },
            ResourceLimits::default(),
        );
        let id = coordinator
            .schedule_task(TaskRequest::new("sync", work_fn(|_| async { Ok(Value::Null) })))
            .unwrap();
        let pending = coordinator
            .schedule_task(
                TaskRequest::new("later", work_fn(|_| async { Ok(Value::Null) }))
                    .at(chrono::Utc::now() + chrono::Duration::hours(1)),
            )
            .unwrap();

        coordinator.start();
        coordinator.wait_for_task(id, WAIT).await.unwrap();
        coordinator.stop().await;

        assert_eq!(coordinator.cleanup_completed_tasks(), 1);
        assert!(coordinator.get_task_status(id).is_none());
        assert!(coordinator.get_task_status(pending).is_some());
        assert!(matches!(
            coordinator.wait_for_task(id, Duration::from_secs(1)).await,
            Err(CoordinationError::TaskNotFound(_))
        ));
    }
}

#[cfg(test)]
mod operation_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_conflicting_operation_is_retried_until_clear() {
        let pool = ResourcePool::new(ResourceLimits::default());
        let system_state = Arc::new(SystemStateCoordinator::default().with_resource_pool(pool.clone()));
        let coordinator =
            TaskCoordinator::with_pool(fast_config(), pool, Some(Arc::clone(&system_state)));

        let spec = OperationSpec::new(OperationType::Rebalancing, "acct-1").with_assets(["BTC"]);
        let twap = OperationSpec::new(OperationType::TwapExecution, "acct-1").with_assets(["BTC"]);
        system_state
            .register_operation("twap-manual", &twap, TaskPriority::Critical.ordinal())
            .unwrap();

        let seen_lock = Arc::new(Mutex::new(None));
        let work = {
            let system_state = Arc::clone(&system_state);
            let seen_lock = Arc::clone(&seen_lock);
            work_fn(move |_| {
                let system_state = Arc::clone(&system_state);
                let seen_lock = Arc::clone(&seen_lock);
                async move {
                    *seen_lock.lock() = system_state.asset_locks().holder_of("BTC");
                    Ok(Value::Null)
                }
            })
        };
        let id = coordinator
            .schedule_task(
                TaskRequest::new("rebalance", work)
                    .priority(TaskPriority::Medium)
                    .max_retries(5)
                    .operation(spec),
            )
            .unwrap();

        coordinator.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(system_state.complete_operation("twap-manual"));

        let snapshot = coordinator.wait_for_task(id, WAIT).await.unwrap();
        coordinator.stop().await;

        assert_eq!(snapshot.state, TaskState::Completed);
        assert!(snapshot.retry_count >= 1);
        assert!(snapshot
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("conflicts")));
        assert_eq!(seen_lock.lock().as_deref(), Some(id.to_string().as_str()));
        assert!(system_state.active_operations().is_empty());
        assert!(system_state.stats().conflicts_prevented >= 1);
    }
}
