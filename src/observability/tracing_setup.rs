//! OpenTelemetry Tracing Configuration
//! Distributed tracing with OTLP export, enabled when an endpoint is configured

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};

use crate::config::Config;

/// Share of root traces kept in production.
const PRODUCTION_SAMPLE_RATIO: f64 = 0.1;

/// Build the OTLP batch tracer for `otlp_endpoint`.
pub fn init_tracer(
    service_name: &str,
    otlp_endpoint: &str,
    config: &Config,
) -> anyhow::Result<sdktrace::Tracer> {
    let sampler = if config.is_production() {
        sdktrace::Sampler::ParentBased(Box::new(sdktrace::Sampler::TraceIdRatioBased(
            PRODUCTION_SAMPLE_RATIO,
        )))
    } else {
        sdktrace::Sampler::AlwaysOn
    };

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(otlp_endpoint);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            sdktrace::Config::default()
                .with_sampler(sampler)
                .with_id_generator(sdktrace::RandomIdGenerator::default())
                .with_max_events_per_span(64)
                .with_max_attributes_per_span(32)
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", service_name.to_string()),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    KeyValue::new("service.namespace", "account-coordination"),
                    KeyValue::new("deployment.environment", config.environment.clone()),
                ])),
        )
        .install_batch(runtime::Tokio)?;

    tracing::info!(
        service = service_name,
        otlp_endpoint = otlp_endpoint,
        production = config.is_production(),
        "Trace export enabled"
    );

    Ok(tracer)
}
