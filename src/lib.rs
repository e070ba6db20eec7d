//! evalset: resumable scheduler for task x model x sample evaluations.
//!
//! This library runs eval sets under global and per-model concurrency caps,
//! retries failing task runs with backoff and connection shedding, and keeps
//! a durable log of every sample so repeated invocations only do the work
//! that is still missing.

// Core modules
pub mod cli;
pub mod error;
pub mod logstore;
pub mod metrics;
pub mod runner;
pub mod scheduler;
pub mod task;
pub mod work;

// Re-export commonly used types
pub use error::{ConfigError, LogStoreError, TaskError};
pub use logstore::{FileLogStore, LogStore, MemoryLogStore};
pub use scheduler::{EvalSetConfig, EvalSetOutcome, Scheduler, SchedulerError};
