//! Coordination Core - Multi-Account Task Coordinator Service
//! Boots the scheduler, the system state coordinator and the status server

use std::sync::{Arc, Weak};
use std::time::Duration;

use coordination_core::config::Config;
use coordination_core::coordination::SystemStateCoordinator;
use coordination_core::observability::{
    self,
    health::{start_health_server, HealthState},
};
use coordination_core::scheduler::{
    work_fn, ResourcePool, TaskCoordinator, TaskPriority, TaskRequest,
};
use coordination_core::{CoordinationError, RetryPolicy};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

const STATUS_REPORT_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    observability::init_observability("coordination-core", &config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        "Starting Coordination Core..."
    );

    let pool = ResourcePool::new(config.resource_limits());
    let system_state = Arc::new(
        SystemStateCoordinator::new(config.system_state()).with_resource_pool(pool.clone()),
    );
    let coordinator = Arc::new(TaskCoordinator::with_pool(
        config.scheduler(),
        pool,
        Some(Arc::clone(&system_state)),
    ));

    schedule_status_report(&coordinator, &system_state)?;
    coordinator.start();

    // Bind the status server with retry; the port may still be held by a previous instance
    let addr = format!("0.0.0.0:{}", config.metrics_port);
    let listener = RetryPolicy::default()
        .execute("status_server_bind", || async {
            TcpListener::bind(&addr)
                .await
                .map_err(|e| CoordinationError::Operation(e.into()))
        })
        .await?;

    let health_state = HealthState {
        coordinator: Arc::clone(&coordinator),
        system_state: Arc::clone(&system_state),
    };
    let mut server = tokio::spawn(start_health_server(listener, health_state));

    tokio::select! {
        result = &mut server => {
            match result {
                Ok(Err(e)) => error!(error = %e, "Status server failed"),
                Err(e) => error!(error = %e, "Status server task aborted"),
                Ok(Ok(())) => warn!("Status server exited"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    // Graceful shutdown
    coordinator.stop().await;
    if !system_state.shutdown(None).await {
        warn!("Exiting with operations still active");
    }
    server.abort();

    observability::shutdown_observability();
    info!("Coordination Core stopped");
    Ok(())
}

/// Recurring low-priority snapshot of the whole system, logged for external collectors.
fn schedule_status_report(
    coordinator: &Arc<TaskCoordinator>,
    system_state: &Arc<SystemStateCoordinator>,
) -> anyhow::Result<()> {
    let weak_coordinator: Weak<TaskCoordinator> = Arc::downgrade(coordinator);
    let weak_state: Weak<SystemStateCoordinator> = Arc::downgrade(system_state);

    let work = work_fn(move |_| {
        let coordinator = weak_coordinator.upgrade();
        let system_state = weak_state.upgrade();
        async move {
            let (Some(coordinator), Some(system_state)) = (coordinator, system_state) else {
                anyhow::bail!("coordinator is shutting down");
            };

            let status = coordinator.get_system_status();
            let state = system_state.get_system_status();
            info!(
                active_tasks = status.resource_pool.active_tasks,
                queue_size = status.queue_size,
                completed = status.task_counts.completed,
                failed = status.task_counts.failed,
                active_operations = state.active_operations.len(),
                api_calls_in_window = state.api_calls_in_window,
                "System status report"
            );

            if status.task_counts.failed > 0 {
                let content = format!("{} tasks failed", status.task_counts.failed);
                if system_state.should_send_alert("failed_tasks", &content) {
                    warn!(failed = status.task_counts.failed, "Failed tasks need attention");
                }
            }

            Ok(serde_json::json!({ "coordinator": status, "system_state": state }))
        }
    });

    coordinator.schedule_recurring_task(
        TaskRequest::new("status_report", work)
            .priority(TaskPriority::Low)
            .max_retries(0)
            .timeout(Duration::from_secs(30)),
        STATUS_REPORT_INTERVAL,
    )?;
    Ok(())
}
