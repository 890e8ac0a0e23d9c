//! Scheduler Module - Priority Task Scheduling for Multiple Accounts
//! Tasks, the priority queue, the resource pool and the coordinator driving them

mod coordinator;
mod queue;
mod resource_pool;
mod task;

pub use coordinator::{
    ExecutionStats, HealthReport, SchedulerConfig, SystemStatus, TaskCoordinator, TaskCounts,
};
pub use queue::{QueueEntry, TaskQueue};
pub use resource_pool::{ResourceLimits, ResourcePool, ResourceSnapshot, TaskSlot};
pub use task::{
    work_fn, AccountId, FnWork, ScheduledTask, TaskId, TaskPriority, TaskRequest, TaskSnapshot,
    TaskState, TaskWork,
};
