//! Eval-set scheduling: admission control, retries and the control loop.
//!
//! - **ConcurrencyBalancer**: global and per-model caps, fair slot allocation
//! - **RetryController**: per task run backoff, connection shedding, abandonment
//! - **Scheduler**: loads prior state, dispatches outstanding work, finalizes
//!
//! # Architecture
//!
//! ```text
//!   tasks x models ──► Scheduler ──load──► LogStore
//!                          │
//!          ┌───────────────┼───────────────┐
//!          ▼               ▼               ▼
//!     ┌─────────┐     ┌─────────┐     ┌─────────┐
//!     │ worker  │     │ worker  │     │ worker  │   acquire lease
//!     └────┬────┘     └────┬────┘     └────┬────┘   run one sample
//!          └───────────────┼───────────────┘
//!                          ▼
//!              completion ──► append / finalize / retry
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use evalset::logstore::FileLogStore;
//! use evalset::runner::NoSandbox;
//! use evalset::scheduler::{EvalSetConfig, Scheduler};
//! use std::sync::Arc;
//!
//! let config = EvalSetConfig::new().with_model("openai/gpt-4o", 10);
//! let store = Arc::new(FileLogStore::new(&config.log_dir));
//! let scheduler = Scheduler::new(config, store, pipeline, Arc::new(NoSandbox));
//!
//! let outcome = scheduler.run(&tasks).await?;
//! if !outcome.success {
//!     // Safe to invoke again: finished samples are reused.
//! }
//! ```

pub mod balancer;
pub mod config;
pub mod engine;
pub mod outcome;
pub mod progress;
pub mod retry;

pub use balancer::{BalancerError, BalancerSnapshot, ConcurrencyBalancer, Lease, ModelUsage};
pub use config::{
    EvalSetConfig, EvalSetFile, FairnessPolicy, ModelConfig, TaskEntry, DEFAULT_MAX_CONNECTIONS,
};
pub use engine::{RunPlan, Scheduler, SchedulerError};
pub use outcome::{AbandonedRun, EvalSetOutcome, EvalSetStats, IncompleteRun, ModelStats};
pub use progress::{ProgressCounters, ProgressMonitor, ProgressSnapshot};
pub use retry::{
    AbandonReason, RetryController, RetryDecision, RetryPhase, RetryPolicy, RetryState,
};
