//! Configuration Module
//! Loads settings from environment variables

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::coordination::SystemStateConfig;
use crate::scheduler::{ResourceLimits, SchedulerConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub max_concurrent_tasks: usize,
    pub max_concurrent_per_account: usize,
    pub max_api_calls_per_window: u32,
    pub api_window_secs: u64,
    pub scheduler_tick_ms: u64,
    pub scheduler_error_backoff_secs: u64,
    pub task_retention_hours: u64,
    pub task_cleanup_interval_secs: u64,
    pub exchange_max_calls_per_second: u32,
    pub alert_dedup_window_minutes: u64,
    pub metrics_port: u16,
    pub otlp_endpoint: Option<String>,
    pub environment: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            max_concurrent_tasks: parse_or("COORDINATOR_MAX_CONCURRENT_TASKS", 10),
            max_concurrent_per_account: parse_or("COORDINATOR_MAX_CONCURRENT_PER_ACCOUNT", 3),
            max_api_calls_per_window: parse_or("COORDINATOR_MAX_API_CALLS_PER_WINDOW", 60),
            api_window_secs: parse_or("COORDINATOR_API_WINDOW_SECS", 60),
            scheduler_tick_ms: parse_or("SCHEDULER_TICK_MS", 1000),
            scheduler_error_backoff_secs: parse_or("SCHEDULER_ERROR_BACKOFF_SECS", 5),
            task_retention_hours: parse_or("TASK_RETENTION_HOURS", 24),
            task_cleanup_interval_secs: parse_or("TASK_CLEANUP_INTERVAL_SECS", 3600),
            exchange_max_calls_per_second: parse_or("EXCHANGE_MAX_CALLS_PER_SECOND", 8),
            alert_dedup_window_minutes: parse_or("ALERT_DEDUP_WINDOW_MINUTES", 5),
            metrics_port: parse_or("METRICS_PORT", 9100),
            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|endpoint| !endpoint.trim().is_empty()),
            environment: env::var("ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(self.scheduler_tick_ms.max(1)),
            error_backoff: Duration::from_secs(self.scheduler_error_backoff_secs),
            retention: Duration::from_secs(self.task_retention_hours.saturating_mul(60 * 60)),
            cleanup_interval: Duration::from_secs(self.task_cleanup_interval_secs.max(1)),
            ..SchedulerConfig::default()
        }
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_concurrent_tasks: self.max_concurrent_tasks,
            max_concurrent_per_account: self.max_concurrent_per_account,
            max_api_calls_per_window: self.max_api_calls_per_window,
            api_window: Duration::from_secs(self.api_window_secs),
        }
    }

    pub fn system_state(&self) -> SystemStateConfig {
        SystemStateConfig {
            max_api_calls_per_second: self.exchange_max_calls_per_second,
            alert_dedup_window: Duration::from_secs(
                self.alert_dedup_window_minutes.saturating_mul(60),
            ),
            ..SystemStateConfig::default()
        }
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}
