//! OpenTelemetry metrics export module
//!
//! Exports metrics about the probe framework itself (probe creation,
//! events received, metadata lookups) to an OpenTelemetry Collector.
//!
//! ## OTLP Endpoint Priority
//! 1. `otel_exporter_otlp_endpoint` from settings
//! 2. `OTEL_EXPORTER_OTLP_ENDPOINT` environment variable
//! 3. Otherwise metrics are disabled and every `record_*` call is a no-op

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

/// Global metrics handle
static METRICS: OnceLock<NetProbeMetrics> = OnceLock::new();

/// Global MeterProvider for graceful shutdown
static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Global active probes count (for ObservableGauge callback)
static ACTIVE_PROBES: OnceLock<RwLock<HashMap<String, u64>>> = OnceLock::new();

fn active_probes_map() -> &'static RwLock<HashMap<String, u64>> {
    ACTIVE_PROBES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct NetProbeMetrics {
    pub probe_created: Counter<u64>,
    pub probe_create_failures: Counter<u64>,
    pub events_received: Counter<u64>,
    pub metadata_lookup_failures: Counter<u64>,
}

impl NetProbeMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            probe_created: meter
                .u64_counter("probe_created")
                .with_description("Number of event probes created")
                .with_unit("probes")
                .build(),
            probe_create_failures: meter
                .u64_counter("probe_create_failures")
                .with_description("Number of failed event probe creations")
                .with_unit("probes")
                .build(),
            events_received: meter
                .u64_counter("events_received")
                .with_description("Number of events drained from the probe sink")
                .with_unit("events")
                .build(),
            metadata_lookup_failures: meter
                .u64_counter("metadata_lookup_failures")
                .with_description("Number of netns to workload lookups that failed")
                .with_unit("lookups")
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

fn get_otlp_endpoint(configured: Option<&str>) -> Option<String> {
    match configured {
        Some(endpoint) => normalize_endpoint(endpoint),
        None => normalize_endpoint(&std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?),
    }
}

/// Initialize OpenTelemetry metrics provider
///
/// Configures metrics export to OTLP Collector via gRPC.
/// Skips initialization if no endpoint is configured.
pub fn init_metrics(configured_endpoint: Option<&str>) -> Result<()> {
    let endpoint = match get_otlp_endpoint(configured_endpoint) {
        Some(ep) => ep,
        None => {
            info!("OTLP endpoint not set. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("Initializing OpenTelemetry metrics exporter");
    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "netprobe"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("netprobe");

    let _active_probes_gauge = meter
        .u64_observable_gauge("active_probes")
        .with_description("Number of currently running event probes")
        .with_unit("probes")
        .with_callback(|observer| {
            if let Ok(probes) = active_probes_map().read() {
                for (probe_name, count) in probes.iter() {
                    observer.observe(*count, &[KeyValue::new("probe", probe_name.clone())]);
                }
            }
        })
        .build();

    let _ = METRICS.set(NetProbeMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static NetProbeMetrics> {
    METRICS.get()
}

pub fn record_probe_created(probe_name: &str) {
    if let Some(m) = metrics() {
        m.probe_created
            .add(1, &[KeyValue::new("probe", probe_name.to_string())]);
    }
}

pub fn record_probe_create_failure(probe_name: &str, reason: &str) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("probe", probe_name.to_string()),
            KeyValue::new("reason", reason.to_string()),
        ];
        m.probe_create_failures.add(1, &attrs);
    }
}

pub fn record_event(event_type: &str) {
    if let Some(m) = metrics() {
        m.events_received
            .add(1, &[KeyValue::new("event_type", event_type.to_string())]);
    }
}

pub fn record_metadata_lookup_failure() {
    if let Some(m) = metrics() {
        m.metadata_lookup_failures.add(1, &[]);
    }
}

/// One more running instance of `probe_name`, for the ObservableGauge callback
pub fn inc_active_probe(probe_name: &str) {
    if let Ok(mut probes) = active_probes_map().write() {
        *probes.entry(probe_name.to_string()).or_insert(0) += 1;
    }
}

/// One instance of `probe_name` fewer; never goes below zero
pub fn dec_active_probe(probe_name: &str) {
    if let Ok(mut probes) = active_probes_map().write()
        && let Some(count) = probes.get_mut(probe_name)
    {
        *count = count.saturating_sub(1);
    }
}

pub fn active_probe_count(probe_name: &str) -> u64 {
    active_probes_map()
        .read()
        .ok()
        .and_then(|probes| probes.get(probe_name).copied())
        .unwrap_or(0)
}

/// Shutdown OpenTelemetry (graceful shutdown)
/// Flushes pending metrics and shuts down the MeterProvider
pub fn shutdown_metrics() {
    if let Some(provider) = METER_PROVIDER.get() {
        info!("Shutting down OpenTelemetry metrics...");
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}
