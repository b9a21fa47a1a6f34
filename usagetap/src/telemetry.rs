//! OpenTelemetry metrics export module
//!
//! Mirrors every reported usage event into OTLP metrics, attributed by
//! provider, model and method.
//!
//! ## OTLP Endpoint Priority
//! 1. Explicit endpoint passed to [`init_metrics_with_endpoint`]
//! 2. `OTEL_EXPORTER_OTLP_ENDPOINT` environment variable
//! 3. If neither is set, metrics are disabled (no default fallback)

use anyhow::Result;
use log::info;
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use std::sync::OnceLock;
use usagetap_common::UsageEvent;

/// Metric export interval in seconds
#[cfg_attr(not(feature = "otlp"), allow(dead_code))]
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

/// Global metrics handle
static METRICS: OnceLock<UsageMetrics> = OnceLock::new();

/// Global MeterProvider for graceful shutdown
static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// usagetap metrics collection
///
/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct UsageMetrics {
    pub llm_calls: Counter<u64>,
    pub llm_call_errors: Counter<u64>,
    pub llm_input_tokens: Counter<u64>,
    pub llm_output_tokens: Counter<u64>,
    pub llm_total_tokens: Counter<u64>,
    pub llm_call_latency_ms: Histogram<u64>,
}

impl UsageMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            llm_calls: meter
                .u64_counter("llm_calls")
                .with_description("Number of intercepted provider calls")
                .with_unit("calls")
                .build(),
            llm_call_errors: meter
                .u64_counter("llm_call_errors")
                .with_description("Number of intercepted provider calls that failed")
                .with_unit("calls")
                .build(),
            llm_input_tokens: meter
                .u64_counter("llm_input_tokens")
                .with_description("Input (prompt) tokens reported by providers")
                .with_unit("tokens")
                .build(),
            llm_output_tokens: meter
                .u64_counter("llm_output_tokens")
                .with_description("Output (completion) tokens reported by providers")
                .with_unit("tokens")
                .build(),
            llm_total_tokens: meter
                .u64_counter("llm_total_tokens")
                .with_description("Total tokens reported by providers")
                .with_unit("tokens")
                .build(),
            llm_call_latency_ms: meter
                .u64_histogram("llm_call_latency_ms")
                .with_description("Latency of intercepted provider calls")
                .with_unit("ms")
                .build(),
        }
    }
}

fn normalize_endpoint(endpoint: &str) -> Option<String> {
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint.to_string())
    }
}

fn get_otlp_endpoint() -> Option<String> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    normalize_endpoint(&endpoint)
}

/// Initialize metrics from `OTEL_EXPORTER_OTLP_ENDPOINT`.
pub fn init_metrics() -> Result<()> {
    init_metrics_with_endpoint(None)
}

/// Initialize the OpenTelemetry metrics provider
///
/// Configures metrics export to an OTLP Collector via gRPC. Must be called
/// from within a tokio runtime. Skips initialization if no endpoint is known.
pub fn init_metrics_with_endpoint(endpoint: Option<&str>) -> Result<()> {
    let endpoint = match endpoint.and_then(normalize_endpoint).or_else(get_otlp_endpoint) {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(());
        }
    };

    if METER_PROVIDER.get().is_some() {
        return Ok(());
    }

    install_exporter(&endpoint)
}

#[cfg(feature = "otlp")]
fn install_exporter(endpoint: &str) -> Result<()> {
    use anyhow::Context;
    use opentelemetry::global;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::metrics::PeriodicReader;
    use std::time::Duration;

    info!("Initializing OpenTelemetry metrics exporter");
    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "usagetap"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    // Meter name is used as prefix only
    let meter = global::meter("usagetap");
    let _ = METRICS.set(UsageMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

#[cfg(not(feature = "otlp"))]
fn install_exporter(endpoint: &str) -> Result<()> {
    log::warn!(
        "OTLP endpoint {} configured but usagetap was built without the `otlp` feature",
        endpoint
    );
    Ok(())
}

pub fn metrics() -> Option<&'static UsageMetrics> {
    METRICS.get()
}

/// Record one reported usage event
pub fn record_usage_event(event: &UsageEvent) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("provider", event.provider.clone()),
            KeyValue::new("model", event.model.clone().unwrap_or_default()),
            KeyValue::new("method", event.method.clone()),
        ];

        m.llm_calls.add(1, &attrs);
        if event.error_occurred {
            m.llm_call_errors.add(
                1,
                &[
                    KeyValue::new("provider", event.provider.clone()),
                    KeyValue::new("error_type", event.error_type.clone().unwrap_or_default()),
                ],
            );
        }
        m.llm_input_tokens.add(event.input_tokens, &attrs);
        m.llm_output_tokens.add(event.output_tokens, &attrs);
        m.llm_total_tokens.add(event.total_tokens, &attrs);
        m.llm_call_latency_ms.record(event.latency_ms, &attrs);
    }
}

/// Flush pending metrics and shut the provider down
pub fn shutdown_metrics() {
    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown meter provider: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_otlp_endpoint_not_set() {
        unsafe {
            std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT");
        }
        assert!(get_otlp_endpoint().is_none());
    }

    #[test]
    #[serial]
    fn test_otlp_endpoint_adds_scheme() {
        unsafe {
            std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "collector:4317");
        }
        assert_eq!(get_otlp_endpoint().as_deref(), Some("http://collector:4317"));
        unsafe {
            std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT");
        }
    }

    #[test]
    fn test_explicit_endpoint_kept() {
        assert_eq!(
            normalize_endpoint("https://otel.example.com:4317").as_deref(),
            Some("https://otel.example.com:4317")
        );
        assert!(normalize_endpoint("").is_none());
    }

    #[test]
    #[serial]
    fn test_disabled_metrics_are_noop() {
        unsafe {
            std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT");
        }
        init_metrics().unwrap();
        assert!(metrics().is_none());

        let event = UsageEvent {
            customer_id: None,
            provider: "openai".to_string(),
            model: None,
            method: "chat.completions.create".to_string(),
            input_tokens: 1,
            output_tokens: 2,
            total_tokens: 3,
            metadata: Default::default(),
            error_occurred: false,
            error_type: None,
            error_message: None,
            latency_ms: 5,
            timestamp: chrono::Utc::now(),
        };
        record_usage_event(&event);
        shutdown_metrics();
    }
}
