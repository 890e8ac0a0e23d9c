//! Task Data Model
//! Scheduled tasks, their lifecycle, and the work payload trait

use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coordination::OperationSpec;
use crate::error::{CoordinationError, CoordinationResult};

pub type TaskId = Uuid;
pub type AccountId = String;

/// Urgency tier. `Critical` compares greatest; queue order uses [`TaskPriority::ordinal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl TaskPriority {
    /// Lower is more urgent.
    pub const fn ordinal(self) -> u8 {
        match self {
            TaskPriority::Critical => 1,
            TaskPriority::High => 2,
            TaskPriority::Medium => 3,
            TaskPriority::Low => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Critical => "critical",
            TaskPriority::High => "high",
            TaskPriority::Medium => "medium",
            TaskPriority::Low => "low",
        }
    }
}

impl Ord for TaskPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        other.ordinal().cmp(&self.ordinal())
    }
}

impl PartialOrd for TaskPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

/// Work payload supplied by feature code. `accounts` is `None` for system-wide tasks.
#[async_trait]
pub trait TaskWork: Send + Sync {
    async fn invoke(&self, accounts: Option<&[AccountId]>) -> anyhow::Result<serde_json::Value>;
}

/// Adapter turning an async closure into a [`TaskWork`].
pub struct FnWork<F>(F);

#[async_trait]
impl<F, Fut> TaskWork for FnWork<F>
where
    F: Fn(Option<Vec<AccountId>>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    async fn invoke(&self, accounts: Option<&[AccountId]>) -> anyhow::Result<serde_json::Value> {
        (self.0)(accounts.map(<[AccountId]>::to_vec)).await
    }
}

pub fn work_fn<F, Fut>(f: F) -> Arc<dyn TaskWork>
where
    F: Fn(Option<Vec<AccountId>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    Arc::new(FnWork(f))
}

/// Submission parameters for a task.
#[derive(Clone)]
pub struct TaskRequest {
    pub(crate) name: String,
    pub(crate) work: Arc<dyn TaskWork>,
    pub(crate) priority: TaskPriority,
    pub(crate) target_accounts: Option<Vec<AccountId>>,
    pub(crate) scheduled_at: Option<DateTime<Utc>>,
    pub(crate) max_retries: u32,
    pub(crate) timeout: Duration,
    pub(crate) operation: Option<OperationSpec>,
}

impl TaskRequest {
    pub fn new(name: impl Into<String>, work: Arc<dyn TaskWork>) -> Self {
        Self {
            name: name.into(),
            work,
            priority: TaskPriority::Medium,
            target_accounts: None,
            scheduled_at: None,
            max_retries: 3,
            timeout: Duration::from_secs(300),
            operation: None,
        }
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn accounts<I, S>(mut self, accounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AccountId>,
    {
        self.target_accounts = Some(accounts.into_iter().map(Into::into).collect());
        self
    }

    /// Earliest wall-clock time the task may run. Defaults to submission time.
    pub fn at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Budget for each attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run each attempt inside a registered, asset-locked operation.
    pub fn operation(mut self, spec: OperationSpec) -> Self {
        self.operation = Some(spec);
        self
    }

    pub(crate) fn validate(&self) -> CoordinationResult<()> {
        if self.name.trim().is_empty() {
            return Err(CoordinationError::InvalidTask("task name is empty".into()));
        }
        if self.timeout.is_zero() {
            return Err(CoordinationError::InvalidTask(format!(
                "task '{}' has a zero timeout",
                self.name
            )));
        }
        if let Some(accounts) = &self.target_accounts {
            if accounts.iter().any(|account| account.trim().is_empty()) {
                return Err(CoordinationError::InvalidTask(format!(
                    "task '{}' names an empty account id",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRequest")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("target_accounts", &self.target_accounts)
            .field("scheduled_at", &self.scheduled_at)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// One unit of work owned by the coordinator. Bookkeeping fields are written
/// only by the executor running it.
#[derive(Clone)]
pub struct ScheduledTask {
    pub id: TaskId,
    pub name: String,
    pub work: Arc<dyn TaskWork>,
    pub target_accounts: Option<Vec<AccountId>>,
    pub priority: TaskPriority,
    pub scheduled_at: DateTime<Utc>,
    pub interval: Option<Duration>,
    pub max_retries: u32,
    pub timeout: Duration,
    pub operation: Option<OperationSpec>,
    pub state: TaskState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
}

impl ScheduledTask {
    pub(crate) fn from_request(request: TaskRequest, interval: Option<Duration>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: request.name,
            work: request.work,
            target_accounts: request.target_accounts.filter(|accounts| !accounts.is_empty()),
            priority: request.priority,
            scheduled_at: request.scheduled_at.unwrap_or(now),
            interval,
            max_retries: request.max_retries,
            timeout: request.timeout,
            operation: request.operation,
            state: TaskState::Pending,
            retry_count: 0,
            last_error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            result: None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.interval.is_some()
    }

    /// Fresh pending copy for the next occurrence of a recurring task.
    pub(crate) fn next_occurrence(&self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: TaskState::Pending,
            scheduled_at,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            ..self.clone()
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id,
            name: self.name.clone(),
            state: self.state,
            priority: self.priority,
            target_accounts: self.target_accounts.clone(),
            scheduled_at: self.scheduled_at,
            recurring: self.is_recurring(),
            interval_minutes: self.interval.map(|interval| interval.as_secs() / 60),
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            result: self.result.clone(),
        }
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("scheduled_at", &self.scheduled_at)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub priority: TaskPriority,
    pub target_accounts: Option<Vec<AccountId>>,
    pub scheduled_at: DateTime<Utc>,
    pub recurring: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_minutes: Option<u64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
}
