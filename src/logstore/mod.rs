//! Durable per-run sample records.
//!
//! A log store keeps one record set per (task signature, model) pair,
//! keyed by work unit. It answers "is this unit already done, for this
//! exact configuration?" so repeated invocations skip finished work.
//!
//! Backends:
//! - [`FileLogStore`]: local filesystem, safe across processes
//! - [`MemoryLogStore`]: in-process, for tests and dry runs

pub mod fs;
pub mod memory;

pub use fs::{FileLogStore, RunDirSummary};
pub use memory::MemoryLogStore;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::LogStoreError;
use crate::task::TaskSignature;
use crate::work::{SampleRecord, TaskRun, TaskRunStatus, WorkUnitKey};

/// Base delay between log write attempts.
pub const WRITE_RETRY_BASE: Duration = Duration::from_millis(100);

/// Backoff stops doubling after this many retries.
const WRITE_RETRY_MAX_SHIFT: u32 = 10;

/// Lightweight summary of a finalized task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunHeader {
    pub task: String,
    pub model: String,
    pub signature_digest: String,
    /// Digest of the required work unit keys. A header only covers the
    /// work set it was finalized for.
    #[serde(default)]
    pub units_digest: String,
    pub status: TaskRunStatus,
    pub samples_total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub limit_exceeded: usize,
    /// Dispatch rounds the finalizing invocation needed.
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Where the run's artifacts live.
    pub location: String,
}

/// What a previous invocation left behind for one signature.
#[derive(Debug, Clone, Default)]
pub struct PriorRun {
    pub records: HashMap<WorkUnitKey, SampleRecord>,
    /// Present once the run has been finalized.
    pub header: Option<TaskRunHeader>,
}

impl PriorRun {
    pub fn is_finalized(&self) -> bool {
        self.header.is_some()
    }
}

/// Result of [`LogStore::finalize`].
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    /// This call published the header.
    Finalized(TaskRunHeader),
    /// Another invocation published first; carries its header.
    AlreadyFinalized(TaskRunHeader),
}

impl FinalizeOutcome {
    pub fn header(&self) -> &TaskRunHeader {
        match self {
            FinalizeOutcome::Finalized(h) | FinalizeOutcome::AlreadyFinalized(h) => h,
        }
    }

    pub fn into_header(self) -> TaskRunHeader {
        match self {
            FinalizeOutcome::Finalized(h) | FinalizeOutcome::AlreadyFinalized(h) => h,
        }
    }
}

/// Result of [`LogStore::cleanup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Removed,
    /// Cleanup disabled; artifacts kept for inspection.
    Retained { location: String },
}

/// Storage backend for sample records.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Loads prior records. Anything stored under a signature whose canonical
    /// bytes differ from `signature` is treated as absent.
    async fn load(&self, signature: &TaskSignature) -> Result<PriorRun, LogStoreError>;

    /// Durably records the latest state of one unit. Appends for the same
    /// run are serialized.
    async fn append(
        &self,
        signature: &TaskSignature,
        key: &WorkUnitKey,
        record: &SampleRecord,
    ) -> Result<(), LogStoreError>;

    /// Publishes the run header. Exactly one of several concurrent callers,
    /// possibly in different processes, observes `Finalized`.
    async fn finalize(&self, run: &TaskRun) -> Result<FinalizeOutcome, LogStoreError>;

    /// Disposes of the artifacts of an abandoned run, or keeps them when
    /// `remove` is false and reports where they are.
    async fn cleanup(&self, run: &TaskRun, remove: bool) -> Result<CleanupOutcome, LogStoreError>;

    /// Human-readable location of a run's artifacts.
    fn location(&self, signature: &TaskSignature) -> String;
}

/// One line of a run journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub key: WorkUnitKey,
    pub signature_digest: String,
    pub record: SampleRecord,
}

/// Collapses journal entries into one record per unit.
///
/// Entries for another digest are dropped. Later entries win, except that a
/// complete record is never displaced by an incomplete one.
pub fn reduce_journal<I>(entries: I, digest: &str) -> HashMap<WorkUnitKey, SampleRecord>
where
    I: IntoIterator<Item = JournalEntry>,
{
    let mut records: HashMap<WorkUnitKey, SampleRecord> = HashMap::new();
    for entry in entries {
        if entry.signature_digest != digest {
            continue;
        }
        match records.get(&entry.key) {
            Some(existing)
                if existing.state.is_complete() && !entry.record.state.is_complete() => {}
            _ => {
                records.insert(entry.key, entry.record);
            }
        }
    }
    records
}

/// Runs a log store write up to `attempts` times, backing off exponentially
/// from [`WRITE_RETRY_BASE`] between transient failures.
pub async fn with_write_retry<T, F, Fut>(
    attempts: u32,
    operation: &str,
    mut f: F,
) -> Result<T, LogStoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LogStoreError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = WRITE_RETRY_BASE * (1u32 << (attempt - 1).min(WRITE_RETRY_MAX_SHIFT));
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Log store write failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
