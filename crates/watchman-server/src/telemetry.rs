//! OpenTelemetry instrumentation for the Watchman server.
//!
//! Provides unified observability across the HTTP API and the messaging
//! channel, including traces, metrics, and structured logs.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    trace::SdkTracerProvider,
    Resource,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// The global tracer provider, stored for shutdown.
static TRACER_PROVIDER: std::sync::OnceLock<SdkTracerProvider> = std::sync::OnceLock::new();

/// The global meter provider, stored for shutdown.
static METER_PROVIDER: std::sync::OnceLock<SdkMeterProvider> = std::sync::OnceLock::new();

/// Build the OpenTelemetry resource with service information.
fn build_resource() -> Resource {
    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "watchman-server".to_string());
    let service_version = std::env::var("OTEL_SERVICE_VERSION")
        .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());

    Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", service_name),
            KeyValue::new("service.version", service_version),
        ])
        .build()
}

fn default_filter() -> EnvFilter {
    EnvFilter::new("info,watchman_server=debug,watchman_channel=debug")
}

fn build_log_filter() -> EnvFilter {
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| default_filter());
    }

    if let Ok(level_or_filter) = std::env::var("WATCHMAN_LOG_LEVEL") {
        let level_or_filter = level_or_filter.trim();
        if !level_or_filter.is_empty() {
            let filter = if level_or_filter.contains('=') || level_or_filter.contains(',') {
                level_or_filter.to_string()
            } else {
                format!(
                    "{level},watchman_server={level},watchman_channel={level}",
                    level = level_or_filter
                )
            };
            return EnvFilter::try_new(filter).unwrap_or_else(|_| default_filter());
        }
    }

    default_filter()
}

/// Initialize OpenTelemetry tracing with OTLP export.
///
/// # Configuration
///
/// Environment variables:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME`: Service name (default: watchman-server)
/// - `OTEL_SERVICE_VERSION`: Service version (default: crate version)
/// - `RUST_LOG` / `WATCHMAN_LOG_LEVEL`: Log filter
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let resource = build_resource();

    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(trace_exporter)
        .with_resource(resource.clone())
        .build();

    let _ = TRACER_PROVIDER.set(tracer_provider.clone());

    let tracer = tracer_provider.tracer("watchman-server");

    let metrics_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()?;

    let meter_provider = SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(metrics_exporter).build())
        .with_resource(resource)
        .build();

    let _ = METER_PROVIDER.set(meter_provider.clone());
    opentelemetry::global::set_meter_provider(meter_provider);

    let filter = build_log_filter();

    // Structured JSON logs for production and local observability pipelines.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(telemetry_layer)
        .init();

    tracing::info!(
        endpoint = %otlp_endpoint,
        "OpenTelemetry initialized with OTLP export"
    );

    Ok(())
}

/// Initialize telemetry for local development (without OTLP export).
pub fn init_local() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = build_log_filter();

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    tracing::info!("Local telemetry initialized with JSON logging (no OTLP export)");

    Ok(())
}

/// Shutdown telemetry, flushing any pending spans and metrics.
pub fn shutdown() {
    tracing::info!("Shutting down telemetry...");

    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::error!(error = %e, "Error shutting down tracer provider");
        }
    }

    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::error!(error = %e, "Error shutting down meter provider");
        }
    }

    tracing::info!("Telemetry shutdown complete");
}

/// Relay metrics for observability.
pub mod metrics {
    use opentelemetry::metrics::{Counter, Meter};
    use std::sync::OnceLock;

    static METER: OnceLock<Meter> = OnceLock::new();

    fn meter() -> &'static Meter {
        METER.get_or_init(|| opentelemetry::global::meter("watchman-server"))
    }

    /// Counter for webhook deliveries received.
    pub fn webhooks_received() -> Counter<u64> {
        meter()
            .u64_counter("watchman.webhooks.received")
            .with_description("Total webhook deliveries received")
            .with_unit("delivery")
            .build()
    }

    /// Counter for notifications delivered to the channel.
    pub fn notifications_delivered() -> Counter<u64> {
        meter()
            .u64_counter("watchman.notifications.delivered")
            .with_description("Total notifications delivered to the channel")
            .with_unit("message")
            .build()
    }

    /// Counter for notifications dropped (no rule, inactive, channel not
    /// ready, or delivery failure).
    pub fn notifications_dropped() -> Counter<u64> {
        meter()
            .u64_counter("watchman.notifications.dropped")
            .with_description("Total notifications dropped before or during delivery")
            .with_unit("message")
            .build()
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_build_resource() {
        // Test that resource building doesn't panic
        let _resource = super::build_resource();
    }
}
