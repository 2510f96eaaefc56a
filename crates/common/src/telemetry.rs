//! Logging, tracing and metrics exporter setup shared by the binaries

use crate::config::ObservabilityConfig;
use crate::errors::{AppError, Result};
use crate::metrics::{register_metrics, LATENCY_BUCKETS, METRICS_PREFIX, STAGE_BUCKETS};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace::TracerProvider, Resource};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Keeps the OTLP pipeline alive; flushes pending spans when dropped
pub struct TelemetryGuard {
    provider: Option<TracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Failed to shut down tracer provider: {}", e);
            }
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init(config: &ObservabilityConfig) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| AppError::Configuration {
            message: format!("Invalid log level '{}': {}", config.log_level, e),
        })?;

    let fmt_layer = if config.json_logging {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    let provider = match config.otel_endpoint {
        Some(ref endpoint) => Some(otlp_provider(endpoint, &config.service_name)?),
        None => None,
    };

    let otel_layer = provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| AppError::Configuration {
            message: format!("Failed to install tracing subscriber: {}", e),
        })?;

    if let Some(ref endpoint) = config.otel_endpoint {
        info!(endpoint = %endpoint, "OpenTelemetry export enabled");
    }

    Ok(TelemetryGuard { provider })
}

fn otlp_provider(endpoint: &str, service_name: &str) -> Result<TracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| AppError::Configuration {
            message: format!("Failed to build OTLP exporter: {}", e),
        })?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(Resource::new(vec![KeyValue::new(
            "service.name",
            service_name.to_string(),
        )]))
        .build())
}

/// Start the Prometheus scrape endpoint and describe all metrics.
///
/// A port of 0 disables the exporter.
pub fn install_metrics_exporter(host: &str, port: u16) -> Result<()> {
    if port == 0 {
        info!("Metrics exporter disabled");
        return Ok(());
    }

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| AppError::Configuration {
            message: format!("Invalid metrics address: {}", e),
        })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Suffix("request_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )
        .and_then(|b| {
            b.set_buckets_for_metric(
                Matcher::Prefix(format!("{}_stage", METRICS_PREFIX)),
                STAGE_BUCKETS,
            )
        })
        .and_then(|b| {
            b.set_buckets_for_metric(
                Matcher::Full(format!("{}_generation_duration_seconds", METRICS_PREFIX)),
                STAGE_BUCKETS,
            )
        })
        .map_err(|e| AppError::Configuration {
            message: format!("Invalid metrics buckets: {}", e),
        })?
        .install()
        .map_err(|e| AppError::Configuration {
            message: format!("Failed to install metrics exporter: {}", e),
        })?;

    register_metrics();
    info!(addr = %addr, "Prometheus metrics exporter listening");
    Ok(())
}
