//! Benchmarks for Scheduling Hot Paths
//! Queue ordering, slot admission, backoff math and alert fingerprinting

use std::time::Duration;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use coordination_core::coordination::AlertDeduplicator;
use coordination_core::resilience::RateLimiter;
use coordination_core::scheduler::{
    ResourceLimits, ResourcePool, SchedulerConfig, TaskPriority, TaskQueue,
};
use uuid::Uuid;

const PRIORITIES: [TaskPriority; 4] = [
    TaskPriority::Critical,
    TaskPriority::High,
    TaskPriority::Medium,
    TaskPriority::Low,
];

fn benchmark_queue_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_push_pop");

    for size in [10, 100, 1000, 10000].iter() {
        let now = Utc::now();
        let ids: Vec<Uuid> = (0..*size).map(|_| Uuid::new_v4()).collect();

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut queue = TaskQueue::new();
                for (i, id) in ids.iter().enumerate() {
                    queue.push(*id, PRIORITIES[i % 4], now);
                }
                while let Some(entry) = queue.pop() {
                    black_box(entry);
                }
            })
        });
    }

    group.finish();
}

fn benchmark_slot_admission(c: &mut Criterion) {
    let pool = ResourcePool::new(ResourceLimits {
        max_concurrent_tasks: 64,
        max_concurrent_per_account: 8,
        ..Default::default()
    });
    let accounts = vec!["acct-1".to_string(), "acct-2".to_string()];

    c.bench_function("slot_acquire_release", |b| {
        b.iter(|| {
            let slot = pool.try_acquire(Some(accounts.as_slice()));
            black_box(&slot);
        })
    });
}

fn benchmark_retry_delay(c: &mut Criterion) {
    let config = SchedulerConfig::default();

    c.bench_function("retry_delay_0_to_32", |b| {
        b.iter(|| {
            for n in 0..32 {
                black_box(config.retry_delay(black_box(n)));
            }
        })
    });
}

fn benchmark_limiter_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("limiter_is_allowed");

    for max_calls in [8, 64, 512].iter() {
        let limiter = RateLimiter::new("bench", *max_calls, Duration::from_millis(1));

        group.bench_with_input(BenchmarkId::from_parameter(max_calls), max_calls, |b, _| {
            b.iter(|| black_box(limiter.is_allowed()))
        });
    }

    group.finish();
}

fn benchmark_alert_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("alert_should_send");

    for keys in [1, 100, 1000].iter() {
        let dedup = AlertDeduplicator::default();
        let names: Vec<String> = (0..*keys).map(|i| format!("drawdown:acct-{i}")).collect();

        group.bench_with_input(BenchmarkId::from_parameter(keys), keys, |b, _| {
            let mut i = 0usize;
            b.iter(|| {
                let key = &names[i % names.len()];
                i += 1;
                black_box(dedup.should_send(key, "Drawdown exceeded 10% on BTC-USD"))
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_queue_push_pop,
    benchmark_slot_admission,
    benchmark_retry_delay,
    benchmark_limiter_admission,
    benchmark_alert_fingerprint,
);

criterion_main!(benches);
