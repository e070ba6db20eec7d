//! Prometheus metrics for eval-set runs.
//!
//! ```ignore
//! use evalset::metrics::{export_metrics, init_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! MetricsCollector::new().record_task_run("success");
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{
    LEASES_IN_USE, REGISTRY, RETRIES_TOTAL, SAMPLES_TOTAL, SAMPLE_DURATION, TASK_RUNS_TOTAL,
};
