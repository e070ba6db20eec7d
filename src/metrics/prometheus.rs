//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by evalset and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all evalset metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Terminal sample records, labeled by state and model.
pub static SAMPLES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Sample execution duration in seconds, labeled by model.
pub static SAMPLE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Concurrency leases currently held, labeled by model.
pub static LEASES_IN_USE: OnceLock<GaugeVec> = OnceLock::new();

/// Task run retries scheduled, labeled by model.
pub static RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task runs that reached a final status, labeled by status.
pub static TASK_RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling it again after a successful initialization is harmless: the first
/// registry stays in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let samples_total = CounterVec::new(
        Opts::new("evalset_samples_total", "Terminal sample records"),
        &["state", "model"],
    )?;

    let sample_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "evalset_sample_duration_seconds",
            "Sample execution duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0]),
        &["model"],
    )?;

    let leases_in_use = GaugeVec::new(
        Opts::new("evalset_leases_in_use", "Concurrency leases currently held"),
        &["model"],
    )?;

    let retries_total = CounterVec::new(
        Opts::new("evalset_retries_total", "Task run retries scheduled"),
        &["model"],
    )?;

    let task_runs_total = CounterVec::new(
        Opts::new("evalset_task_runs_total", "Task runs by final status"),
        &["status"],
    )?;

    registry.register(Box::new(samples_total.clone()))?;
    registry.register(Box::new(sample_duration.clone()))?;
    registry.register(Box::new(leases_in_use.clone()))?;
    registry.register(Box::new(retries_total.clone()))?;
    registry.register(Box::new(task_runs_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = SAMPLES_TOTAL.set(samples_total);
    let _ = SAMPLE_DURATION.set(sample_duration);
    let _ = LEASES_IN_USE.set(leases_in_use);
    let _ = RETRIES_TOTAL.set(retries_total);
    let _ = TASK_RUNS_TOTAL.set(task_runs_total);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line instead when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
