//! Health, Status & Metrics HTTP Server
//! Provides /health, /health/live, /status, /tasks/:id, /metrics endpoints

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, instrument};
use uuid::Uuid;

use super::metrics::encode_metrics;
use crate::coordination::{SystemStateCoordinator, SystemStateSnapshot};
use crate::scheduler::{SystemStatus, TaskCoordinator, TaskSnapshot};

#[derive(Clone)]
pub struct HealthState {
    pub coordinator: Arc<TaskCoordinator>,
    pub system_state: Arc<SystemStateCoordinator>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    version: &'static str,
    uptime_seconds: u64,
    coordinator: SystemStatus,
    system_state: SystemStateSnapshot,
}

static START_TIME: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();

pub fn router(state: HealthState) -> Router {
    START_TIME.get_or_init(std::time::Instant::now);

    Router::new()
        .route("/health", get(health_check))
        .route("/health/live", get(liveness))
        .route("/status", get(status))
        .route("/tasks/:id", get(task_status))
        .route("/metrics", get(prometheus_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the status and metrics endpoints on an already bound listener
#[instrument(skip(listener, state))]
pub async fn start_health_server(listener: TcpListener, state: HealthState) -> anyhow::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "Status/metrics server started");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[instrument(skip(state))]
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    let report = state.coordinator.health_check();
    let status_code = if report.status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(report))
}

async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "alive" })))
}

async fn status(State(state): State<HealthState>) -> impl IntoResponse {
    let uptime = START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0);

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: uptime,
        coordinator: state.coordinator.get_system_status(),
        system_state: state.system_state.get_system_status(),
    })
}

async fn task_status(
    State(state): State<HealthState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskSnapshot>, (StatusCode, Json<serde_json::Value>)> {
    state.coordinator.get_task_status(task_id).map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "task not found", "task_id": task_id })),
        )
    })
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        encode_metrics(),
    )
}
