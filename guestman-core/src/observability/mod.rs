//! Observability infrastructure: tracing and metrics.
//!
//! The daemon calls [`init`] once at startup. Library code only emits
//! `tracing` events and `metrics` samples and never installs subscribers.

use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self, RandomIdGenerator, Sampler};
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Check if OTLP tracing is enabled via environment variable.
/// Set GUESTMAN_OTLP_ENABLED=1 or OTEL_EXPORTER_OTLP_ENDPOINT to enable.
fn otlp_enabled() -> bool {
    std::env::var("GUESTMAN_OTLP_ENABLED").is_ok()
        || std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
}

fn otlp_endpoint() -> String {
    std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string())
}

/// Initialize the global observability infrastructure.
///
/// `log_level` is the default directive when `RUST_LOG` is unset.
/// `metrics_port` enables the Prometheus listener when set.
pub fn init(log_level: &str, metrics_port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true));

    if otlp_enabled() {
        let endpoint = otlp_endpoint();

        let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(&endpoint);

        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(
                trace::config()
                    .with_sampler(Sampler::AlwaysOn)
                    .with_id_generator(RandomIdGenerator::default())
                    .with_resource(Resource::new(vec![
                        opentelemetry::KeyValue::new("service.name", "guestmand"),
                        opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    ])),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;

        let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
        subscriber.with(telemetry).init();
        tracing::info!(endpoint = %endpoint, "Observability initialized with OTLP tracing");
    } else {
        subscriber.init();
        tracing::info!("Observability initialized (set GUESTMAN_OTLP_ENABLED=1 for OTLP)");
    }

    if let Some(port) = metrics_port {
        PrometheusBuilder::new().with_http_listener(([0, 0, 0, 0], port)).install()?;
        tracing::info!(port, "Prometheus exporter listening");
    }

    metrics::register_core_metrics();

    Ok(())
}

/// Flush pending spans.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}
