//! Multi-Account Task Coordinator
//! Priority scheduling against a bounded resource pool, per-attempt timeouts,
//! retry with capped exponential backoff, recurring republishing and retention

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::queue::{QueueEntry, TaskQueue};
use super::resource_pool::{ResourceLimits, ResourcePool, ResourceSnapshot, TaskSlot};
use super::task::{ScheduledTask, TaskId, TaskRequest, TaskSnapshot, TaskState};
use crate::coordination::SystemStateCoordinator;
use crate::error::{CoordinationError, CoordinationResult};
use crate::observability::metrics::get_metrics;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Pause after a scheduler pass blows up.
    pub error_backoff: Duration,
    pub retry_backoff_base: Duration,
    pub retry_backoff_cap: Duration,
    /// How long terminal tasks stay queryable.
    pub retention: Duration,
    pub cleanup_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_cap: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl SchedulerConfig {
    /// `min(base * 2^retry_count, cap)`
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        self.retry_backoff_base
            .saturating_mul(2u32.saturating_pow(retry_count))
            .min(self.retry_backoff_cap)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionStats {
    pub total_executed: u64,
    pub successful: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total_retries: u64,
    pub average_execution_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub coordinator_status: &'static str,
    pub resource_pool: ResourceSnapshot,
    pub task_counts: TaskCounts,
    pub execution_stats: ExecutionStats,
    pub queue_size: usize,
    pub last_tick: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub service: &'static str,
    pub status: &'static str,
    pub system_status: SystemStatus,
    pub last_check: DateTime<Utc>,
}

struct TaskEntry {
    task: ScheduledTask,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    config: SchedulerConfig,
    pool: ResourcePool,
    system_state: Option<Arc<SystemStateCoordinator>>,
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
    queue: Mutex<TaskQueue>,
    stats: Mutex<ExecutionStats>,
    last_tick: Mutex<Option<DateTime<Utc>>>,
    // Bumped every time a task settles.
    settled: watch::Sender<u64>,
    wake: Notify,
}

pub struct TaskCoordinator {
    inner: Arc<Inner>,
    running: AtomicBool,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    retention: Mutex<Option<JoinHandle<()>>>,
}

/// Entries that must go back on the queue, even if the pass unwinds.
struct Deferred<'a> {
    queue: &'a Mutex<TaskQueue>,
    entries: Vec<QueueEntry>,
}

impl Drop for Deferred<'_> {
    fn drop(&mut self) {
        let mut queue = self.queue.lock();
        for entry in self.entries.drain(..) {
            queue.requeue(entry);
        }
    }
}

impl TaskCoordinator {
    pub fn new(config: SchedulerConfig, limits: ResourceLimits) -> Self {
        Self::with_pool(config, ResourcePool::new(limits), None)
    }

    /// Build around an existing pool, optionally running operation-scoped tasks
    /// through `system_state`.
    pub fn with_pool(
        config: SchedulerConfig,
        pool: ResourcePool,
        system_state: Option<Arc<SystemStateCoordinator>>,
    ) -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                config,
                pool,
                system_state,
                tasks: Mutex::new(HashMap::new()),
                queue: Mutex::new(TaskQueue::new()),
                stats: Mutex::new(ExecutionStats::default()),
                last_tick: Mutex::new(None),
                settled,
                wake: Notify::new(),
            }),
            running: AtomicBool::new(false),
            scheduler: Mutex::new(None),
            retention: Mutex::new(None),
        }
    }

    pub fn resource_pool(&self) -> &ResourcePool {
        &self.inner.pool
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn schedule_task(&self, request: TaskRequest) -> CoordinationResult<TaskId> {
        request.validate()?;
        Ok(self.inner.enqueue(ScheduledTask::from_request(request, None)))
    }

    pub fn schedule_recurring_task(
        &self,
        request: TaskRequest,
        interval: Duration,
    ) -> CoordinationResult<TaskId> {
        request.validate()?;
        if interval.is_zero() {
            return Err(CoordinationError::InvalidTask(format!(
                "recurring task '{}' needs a positive interval",
                request.name
            )));
        }
        Ok(self
            .inner
            .enqueue(ScheduledTask::from_request(request, Some(interval))))
    }

    /// Cancel a pending or running task. Returns `false` for unknown or already settled tasks.
    #[instrument(skip(self))]
    pub async fn cancel_task(&self, task_id: TaskId) -> bool {
        let handle = {
            let mut tasks = self.inner.tasks.lock();
            match tasks.get_mut(&task_id) {
                Some(entry) if !entry.task.state.is_terminal() => entry.handle.take(),
                _ => return false,
            }
        };

        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        {
            let mut tasks = self.inner.tasks.lock();
            match tasks.get_mut(&task_id) {
                Some(entry) if !entry.task.state.is_terminal() => {
                    entry.task.state = TaskState::Cancelled;
                    entry.task.completed_at = Some(Utc::now());
                    info!(task_id = %task_id, name = %entry.task.name, "Task cancelled");
                }
                _ => return false,
            }
        }

        self.inner.queue.lock().remove(task_id);
        self.inner.stats.lock().cancelled += 1;
        self.inner.record_settled(TaskState::Cancelled);
        true
    }

    /// Schedule a task for right now and wait for it to settle.
    ///
    /// Fails fast with `NotRunning` before `start()` and with `ResourceExhausted`
    /// when the pool would not admit it.
    pub async fn execute_immediate_task(
        &self,
        request: TaskRequest,
    ) -> CoordinationResult<serde_json::Value> {
        if !self.is_running() {
            return Err(CoordinationError::NotRunning);
        }
        if !self.inner.pool.can_admit(request.target_accounts.as_deref()) {
            return Err(CoordinationError::ResourceExhausted);
        }

        let name = format!("immediate_{}", request.name);
        let request = TaskRequest { name, ..request }.at(Utc::now());
        let task_id = self.schedule_task(request)?;
        let snapshot = self.inner.wait_settled(task_id).await?;

        match snapshot.state {
            TaskState::Completed => Ok(snapshot.result.unwrap_or(serde_json::Value::Null)),
            TaskState::Cancelled => Err(CoordinationError::Cancelled(task_id.to_string())),
            _ => Err(CoordinationError::TaskExhausted {
                task_id: task_id.to_string(),
                attempts: snapshot.retry_count + 1,
                last_error: snapshot.last_error.unwrap_or_default(),
            }),
        }
    }

    /// Wait until the task reaches a terminal state.
    pub async fn wait_for_task(
        &self,
        task_id: TaskId,
        timeout: Duration,
    ) -> CoordinationResult<TaskSnapshot> {
        tokio::time::timeout(timeout, self.inner.wait_settled(task_id))
            .await
            .map_err(|_| CoordinationError::WaitTimeout(format!("task {task_id}")))?
    }

    pub fn get_task_status(&self, task_id: TaskId) -> Option<TaskSnapshot> {
        self.inner
            .tasks
            .lock()
            .get(&task_id)
            .map(|entry| entry.task.snapshot())
    }

    /// Snapshots of every retained task, optionally filtered by state, oldest first.
    pub fn list_tasks(&self, state: Option<TaskState>) -> Vec<TaskSnapshot> {
        let mut snapshots: Vec<TaskSnapshot> = self
            .inner
            .tasks
            .lock()
            .values()
            .filter(|entry| state.map_or(true, |wanted| entry.task.state == wanted))
            .map(|entry| entry.task.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    pub fn stats(&self) -> ExecutionStats {
        self.inner.stats.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn get_system_status(&self) -> SystemStatus {
        let mut counts = TaskCounts::default();
        for entry in self.inner.tasks.lock().values() {
            counts.total += 1;
            match entry.task.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Completed => counts.completed += 1,
                TaskState::Failed => counts.failed += 1,
                TaskState::Cancelled => counts.cancelled += 1,
            }
        }

        SystemStatus {
            coordinator_status: if self.is_running() { "active" } else { "stopped" },
            resource_pool: self.inner.pool.snapshot(),
            task_counts: counts,
            execution_stats: self.stats(),
            queue_size: self.inner.queue.lock().len(),
            last_tick: *self.inner.last_tick.lock(),
            last_update: Utc::now(),
        }
    }

    pub fn health_check(&self) -> HealthReport {
        let scheduler_alive = self
            .scheduler
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());

        HealthReport {
            service: "multi_account_coordinator",
            status: if scheduler_alive { "healthy" } else { "degraded" },
            system_status: self.get_system_status(),
            last_check: Utc::now(),
        }
    }

    /// Evict terminal tasks that settled longer ago than the retention window.
    pub fn cleanup_completed_tasks(&self) -> usize {
        self.inner.evict_expired()
    }

    /// Start the scheduler and retention loops. A second call is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Task coordinator already running");
            return;
        }

        *self.scheduler.lock() = Some(tokio::spawn(scheduler_loop(Arc::clone(&self.inner))));
        *self.retention.lock() = Some(tokio::spawn(retention_loop(Arc::clone(&self.inner))));

        info!(
            max_concurrent_tasks = self.inner.pool.limits().max_concurrent_tasks,
            max_concurrent_per_account = self.inner.pool.limits().max_concurrent_per_account,
            tick_ms = self.inner.config.tick_interval.as_millis() as u64,
            "Task coordinator started"
        );
    }

    /// Stop the background loops and cancel every unsettled task that has an executor.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping task coordinator");

        let loops = [self.scheduler.lock().take(), self.retention.lock().take()];
        for handle in loops.into_iter().flatten() {
            handle.abort();
            let _ = handle.await;
        }

        let in_flight: Vec<TaskId> = self
            .inner
            .tasks
            .lock()
            .iter()
            .filter(|(_, entry)| entry.handle.is_some())
            .map(|(id, _)| *id)
            .collect();
        for task_id in in_flight {
            self.cancel_task(task_id).await;
        }

        info!("Task coordinator stopped");
    }
}

impl Inner {
    fn enqueue(&self, task: ScheduledTask) -> TaskId {
        let (task_id, priority, scheduled_at) = (task.id, task.priority, task.scheduled_at);
        info!(
            task_id = %task_id,
            name = %task.name,
            priority = %priority,
            scheduled_at = %scheduled_at,
            recurring = task.is_recurring(),
            "Task scheduled"
        );

        self.tasks
            .lock()
            .insert(task_id, TaskEntry { task, handle: None });
        let depth = {
            let mut queue = self.queue.lock();
            queue.push(task_id, priority, scheduled_at);
            queue.len()
        };

        if let Some(metrics) = get_metrics() {
            metrics
                .tasks_scheduled_total
                .with_label_values(&[priority.as_str()])
                .inc();
            metrics.queue_depth.set(depth as f64);
        }
        self.wake.notify_one();
        task_id
    }

    /// One scheduler pass: launch every eligible, admitted task in queue order.
    fn dispatch_ready(self: &Arc<Self>) -> usize {
        let now = Utc::now();
        let mut deferred = Deferred {
            queue: &self.queue,
            entries: Vec::new(),
        };
        let mut launched = 0;

        loop {
            let Some(entry) = self.queue.lock().pop() else {
                break;
            };

            let mut tasks = self.tasks.lock();
            let Some(record) = tasks.get_mut(&entry.task_id) else {
                continue;
            };
            if record.task.state != TaskState::Pending || record.handle.is_some() {
                continue;
            }
            if record.task.scheduled_at > now {
                deferred.entries.push(entry);
                continue;
            }
            let Some(slot) = self.pool.try_acquire(record.task.target_accounts.as_deref()) else {
                deferred.entries.push(entry);
                continue;
            };

            record.task.state = TaskState::Running;
            record.task.started_at = Some(Utc::now());
            debug!(task_id = %entry.task_id, name = %record.task.name, "Launching task");
            record.handle = Some(tokio::spawn(run_task(
                Arc::clone(self),
                record.task.clone(),
                slot,
            )));
            launched += 1;
        }

        drop(deferred);
        self.refresh_gauges();
        launched
    }

    async fn attempt(&self, task: &ScheduledTask) -> CoordinationResult<serde_json::Value> {
        let work = async {
            let _permit = match (&task.operation, &self.system_state) {
                (Some(spec), Some(system_state)) => Some(
                    system_state
                        .coordinate_operation(task.id.to_string(), spec, task.priority.ordinal())
                        .await?,
                ),
                _ => None,
            };
            task.work
                .invoke(task.target_accounts.as_deref())
                .await
                .map_err(CoordinationError::from)
        };

        match tokio::time::timeout(task.timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(CoordinationError::TaskTimeout {
                task_id: task.id.to_string(),
                timeout: task.timeout,
            }),
        }
    }

    fn with_task<R>(&self, task_id: TaskId, f: impl FnOnce(&mut TaskEntry) -> R) -> Option<R> {
        self.tasks.lock().get_mut(&task_id).map(f)
    }

    fn settle_completed(&self, task: &ScheduledTask, result: serde_json::Value, elapsed: Duration) {
        let completed_at = Utc::now();
        let next = self.with_task(task.id, |entry| {
            entry.handle = None;
            if entry.task.state.is_terminal() {
                return None;
            }
            entry.task.state = TaskState::Completed;
            entry.task.completed_at = Some(completed_at);
            entry.task.result = Some(result);
            entry
                .task
                .interval
                .map(|interval| entry.task.next_occurrence(offset(completed_at, interval)))
        });

        {
            let mut stats = self.stats.lock();
            stats.total_executed += 1;
            stats.successful += 1;
            let secs = elapsed.as_secs_f64();
            stats.average_execution_secs +=
                (secs - stats.average_execution_secs) / stats.successful as f64;
        }

        info!(
            task_id = %task.id,
            name = %task.name,
            duration_ms = elapsed.as_millis() as u64,
            "Task completed"
        );
        if let Some(metrics) = get_metrics() {
            metrics
                .task_duration
                .with_label_values(&[task.priority.as_str()])
                .observe(elapsed.as_secs_f64());
        }

        if let Some(next) = next.flatten() {
            self.enqueue(next);
        }
        self.record_settled(TaskState::Completed);
    }

    fn settle_failed(
        &self,
        task: &ScheduledTask,
        retries: u32,
        failure: CoordinationError,
        elapsed: Duration,
    ) {
        let message = failure.to_string();
        self.with_task(task.id, |entry| {
            entry.handle = None;
            if entry.task.state.is_terminal() {
                return;
            }
            entry.task.state = TaskState::Failed;
            entry.task.retry_count = retries;
            entry.task.last_error = Some(message.clone());
            entry.task.completed_at = Some(Utc::now());
        });

        {
            let mut stats = self.stats.lock();
            stats.total_executed += 1;
            stats.failed += 1;
        }

        error!(
            task_id = %task.id,
            name = %task.name,
            attempts = retries + 1,
            duration_ms = elapsed.as_millis() as u64,
            error = %message,
            "Task failed after all retries"
        );
        self.record_settled(TaskState::Failed);
    }

    fn record_settled(&self, state: TaskState) {
        if let Some(metrics) = get_metrics() {
            metrics
                .tasks_settled_total
                .with_label_values(&[state.as_str()])
                .inc();
        }
        self.refresh_gauges();
        self.settled.send_modify(|generation| *generation += 1);
        // Freed capacity may admit queued work.
        self.wake.notify_one();
    }

    fn refresh_gauges(&self) {
        if let Some(metrics) = get_metrics() {
            metrics.active_tasks.set(self.pool.active_tasks() as f64);
            metrics.queue_depth.set(self.queue.lock().len() as f64);
        }
    }

    async fn wait_settled(&self, task_id: TaskId) -> CoordinationResult<TaskSnapshot> {
        let mut settled = self.settled.subscribe();
        loop {
            match self.tasks.lock().get(&task_id) {
                Some(entry) if entry.task.state.is_terminal() => return Ok(entry.task.snapshot()),
                Some(_) => {}
                None => return Err(CoordinationError::TaskNotFound(task_id.to_string())),
            }
            if settled.changed().await.is_err() {
                return Err(CoordinationError::TaskNotFound(task_id.to_string()));
            }
        }
    }

    fn evict_expired(&self) -> usize {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - retention;

        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, entry| {
            !(entry.task.state.is_terminal()
                && entry.task.completed_at.is_some_and(|at| at <= cutoff))
        });
        let removed = before - tasks.len();

        if removed > 0 {
            info!(removed = removed, remaining = tasks.len(), "Evicted settled tasks");
        }
        removed
    }
}

async fn run_task(inner: Arc<Inner>, task: ScheduledTask, slot: TaskSlot) {
    let started = Instant::now();
    let mut retries = 0u32;
    info!(task_id = %task.id, name = %task.name, priority = %task.priority, "Task started");

    let outcome = loop {
        match inner.attempt(&task).await {
            Ok(result) => break Ok(result),
            Err(failure) if retries < task.max_retries => {
                let delay = inner.config.retry_delay(retries);
                retries += 1;
                let message = failure.to_string();
                warn!(
                    task_id = %task.id,
                    name = %task.name,
                    attempt = retries,
                    max_attempts = task.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Task attempt failed, retrying"
                );

                inner.with_task(task.id, |entry| {
                    entry.task.retry_count = retries;
                    entry.task.last_error = Some(message);
                    entry.task.state = TaskState::Pending;
                });
                inner.stats.lock().total_retries += 1;
                if let Some(metrics) = get_metrics() {
                    metrics.task_retries_total.inc();
                }

                sleep(delay).await;
                inner.with_task(task.id, |entry| entry.task.state = TaskState::Running);
            }
            Err(failure) => break Err(failure),
        }
    };

    drop(slot);
    let elapsed = started.elapsed();
    match outcome {
        Ok(result) => inner.settle_completed(&task, result, elapsed),
        Err(failure) => inner.settle_failed(&task, retries, failure, elapsed),
    }
}

async fn scheduler_loop(inner: Arc<Inner>) {
    info!("Scheduler loop started");
    let mut ticker = tokio::time::interval(inner.config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = inner.wake.notified() => {}
        }

        // A pass runs as its own task so a panic in it is contained.
        let pass = Arc::clone(&inner);
        match tokio::spawn(async move { pass.dispatch_ready() }).await {
            Ok(launched) if launched > 0 => debug!(launched = launched, "Scheduler pass"),
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Scheduler pass failed");
                sleep(inner.config.error_backoff).await;
            }
        }
        *inner.last_tick.lock() = Some(Utc::now());
    }
}

async fn retention_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.cleanup_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        inner.evict_expired();
    }
}

fn offset(at: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
