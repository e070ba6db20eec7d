//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library users that never export metrics pay nothing.

use super::prometheus::{
    LEASES_IN_USE, RETRIES_TOTAL, SAMPLES_TOTAL, SAMPLE_DURATION, TASK_RUNS_TOTAL,
};

/// Metrics collector for recording eval-set operational metrics.
///
/// ```ignore
/// use evalset::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_sample("succeeded", "openai/gpt-4o", 12.5);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Records a sample reaching a terminal state.
    pub fn record_sample(&self, state: &str, model: &str, duration_secs: f64) {
        if let Some(samples_total) = SAMPLES_TOTAL.get() {
            samples_total.with_label_values(&[state, model]).inc();
        }

        if let Some(sample_duration) = SAMPLE_DURATION.get() {
            sample_duration
                .with_label_values(&[model])
                .observe(duration_secs);
        }

        tracing::trace!(state, model, duration_secs, "Recorded sample metric");
    }

    /// Sets the number of leases currently held for `model`.
    pub fn update_leases(&self, model: &str, in_use: usize) {
        if let Some(leases) = LEASES_IN_USE.get() {
            leases.with_label_values(&[model]).set(in_use as f64);
        }
    }

    pub fn record_retry(&self, model: &str) {
        if let Some(retries) = RETRIES_TOTAL.get() {
            retries.with_label_values(&[model]).inc();
        }
    }

    /// Records a task run's final status (`success`, `failed`, `abandoned`...).
    pub fn record_task_run(&self, status: &str) {
        if let Some(task_runs) = TASK_RUNS_TOTAL.get() {
            task_runs.with_label_values(&[status]).inc();
        }
    }
}
