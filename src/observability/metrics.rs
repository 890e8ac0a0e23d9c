//! Prometheus Metrics for the Coordination Core
//! Scheduler throughput, resource occupancy and resilience state

use once_cell::sync::{Lazy, OnceCell};
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};

/// Global metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Application metrics
pub struct Metrics {
    pub tasks_scheduled_total: IntCounterVec,
    pub tasks_settled_total: IntCounterVec,
    pub task_duration: HistogramVec,
    pub task_retries_total: IntCounter,
    pub active_tasks: Gauge,
    pub queue_depth: Gauge,
    pub circuit_breaker_state: GaugeVec,
    pub retry_attempts_total: CounterVec,
    pub operation_conflicts_total: IntCounter,
    pub api_calls_total: IntCounterVec,
    pub alerts_suppressed_total: IntCounter,
    pub bulkhead_rejections_total: IntCounterVec,
}

static METRICS: OnceCell<Metrics> = OnceCell::new();

/// Initialize metrics. Calling it twice is a no-op.
pub fn init_metrics(service_name: &str) -> anyhow::Result<()> {
    METRICS.get_or_try_init(|| build_metrics(service_name))?;
    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

fn build_metrics(service_name: &str) -> anyhow::Result<Metrics> {
    let tasks_scheduled_total = IntCounterVec::new(
        Opts::new("tasks_scheduled_total", "Tasks submitted to the scheduler")
            .namespace("coordination")
            .const_label("service", service_name),
        &["priority"],
    )?;

    let tasks_settled_total = IntCounterVec::new(
        Opts::new("tasks_settled_total", "Tasks that reached a terminal state")
            .namespace("coordination")
            .const_label("service", service_name),
        &["state"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "task_duration_seconds",
            "Task execution time in seconds, retries included",
        )
        .namespace("coordination")
        .const_label("service", service_name)
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["priority"],
    )?;

    let task_retries_total = IntCounter::new(
        "coordination_task_retries_total",
        "Task attempts retried after a failure or timeout",
    )?;

    let active_tasks = Gauge::new("coordination_active_tasks", "Tasks currently running")?;

    let queue_depth = Gauge::new("coordination_queue_depth", "Entries waiting in the task queue")?;

    let circuit_breaker_state = GaugeVec::new(
        Opts::new(
            "coordination_circuit_breaker_state",
            "Circuit breaker state (0=closed, 0.5=half-open, 1=open)",
        ),
        &["name"],
    )?;

    let retry_attempts_total = CounterVec::new(
        Opts::new("coordination_retry_attempts_total", "Total retry attempts"),
        &["operation", "outcome"],
    )?;

    let operation_conflicts_total = IntCounter::new(
        "coordination_operation_conflicts_total",
        "Operation registrations rejected by a conflicting holder",
    )?;

    let api_calls_total = IntCounterVec::new(
        Opts::new("coordination_api_calls_total", "Exchange API calls through the limiter"),
        &["outcome"], // admitted, throttled
    )?;

    let alerts_suppressed_total = IntCounter::new(
        "coordination_alerts_suppressed_total",
        "Duplicate alerts suppressed",
    )?;

    let bulkhead_rejections_total = IntCounterVec::new(
        Opts::new("coordination_bulkhead_rejections_total", "Bulkhead admission rejections"),
        &["name"],
    )?;

    REGISTRY.register(Box::new(tasks_scheduled_total.clone()))?;
    REGISTRY.register(Box::new(tasks_settled_total.clone()))?;
    REGISTRY.register(Box::new(task_duration.clone()))?;
    REGISTRY.register(Box::new(task_retries_total.clone()))?;
    REGISTRY.register(Box::new(active_tasks.clone()))?;
    REGISTRY.register(Box::new(queue_depth.clone()))?;
    REGISTRY.register(Box::new(circuit_breaker_state.clone()))?;
    REGISTRY.register(Box::new(retry_attempts_total.clone()))?;
    REGISTRY.register(Box::new(operation_conflicts_total.clone()))?;
    REGISTRY.register(Box::new(api_calls_total.clone()))?;
    REGISTRY.register(Box::new(alerts_suppressed_total.clone()))?;
    REGISTRY.register(Box::new(bulkhead_rejections_total.clone()))?;

    Ok(Metrics {
        tasks_scheduled_total,
        tasks_settled_total,
        task_duration,
        task_retries_total,
        active_tasks,
        queue_depth,
        circuit_breaker_state,
        retry_attempts_total,
        operation_conflicts_total,
        api_calls_total,
        alerts_suppressed_total,
        bulkhead_rejections_total,
    })
}

/// Get metrics instance, `None` until [`init_metrics`] has run
pub fn get_metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Encode metrics to Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}
