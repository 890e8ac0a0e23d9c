//! Priority Task Queue
//! Min-heap keyed by (priority ordinal, scheduled time, submission sequence)

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};

use super::task::{TaskId, TaskPriority};

/// Field order is the sort order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueEntry {
    pub ordinal: u8,
    pub scheduled_at: DateTime<Utc>,
    pub seq: u64,
    pub task_id: TaskId,
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task_id: TaskId, priority: TaskPriority, scheduled_at: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(QueueEntry {
            ordinal: priority.ordinal(),
            scheduled_at,
            seq,
            task_id,
        }));
    }

    /// Put an entry back unchanged; it keeps its original place among equals.
    pub fn requeue(&mut self, entry: QueueEntry) {
        self.heap.push(Reverse(entry));
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.heap.pop().map(|Reverse(entry)| entry)
    }

    pub fn remove(&mut self, task_id: TaskId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|Reverse(entry)| entry.task_id != task_id);
        self.heap.len() != before
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    #[test]
    fn priority_then_time_then_submission() {
        let now = Utc::now();
        let mut queue = TaskQueue::new();
        let low = Uuid::new_v4();
        let critical_late = Uuid::new_v4();
        let critical_early = Uuid::new_v4();
        let medium_a = Uuid::new_v4();
        let medium_b = Uuid::new_v4();

        queue.push(low, TaskPriority::Low, now - Duration::minutes(10));
        queue.push(critical_late, TaskPriority::Critical, now);
        queue.push(medium_a, TaskPriority::Medium, now);
        queue.push(critical_early, TaskPriority::Critical, now - Duration::seconds(5));
        queue.push(medium_b, TaskPriority::Medium, now);

        let order: Vec<TaskId> = std::iter::from_fn(|| queue.pop().map(|e| e.task_id)).collect();
        assert_eq!(order, vec![critical_early, critical_late, medium_a, medium_b, low]);
    }

    #[test]
    fn requeue_keeps_fifo_position() {
        let now = Utc::now();
        let mut queue = TaskQueue::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        queue.push(first, TaskPriority::High, now);
        queue.push(second, TaskPriority::High, now);

        let entry = queue.pop().unwrap();
        assert_eq!(entry.task_id, first);
        queue.requeue(entry);
        assert_eq!(queue.pop().map(|e| e.task_id), Some(first));
    }

    #[test]
    fn remove_by_id() {
        let now = Utc::now();
        let mut queue = TaskQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        queue.push(a, TaskPriority::Low, now);
        queue.push(b, TaskPriority::High, now);

        assert!(queue.remove(a));
        assert!(!queue.remove(a));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().map(|e| e.task_id), Some(b));
        assert!(queue.is_empty());
    }
}
