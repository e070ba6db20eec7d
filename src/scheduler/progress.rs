//! Background progress monitor for eval-set runs.
//!
//! Periodically logs sample counters (dispatched, succeeded, failed, limit
//! exceeded, cancelled, retries) so operators can follow long eval sets
//! without parsing individual sample log lines.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::work::SampleState;

/// Snapshot of progress counters at a point in time.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// Samples handed to a sample runner, counting every attempt.
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub limit_exceeded: usize,
    pub cancelled: usize,
    /// Task run retries scheduled.
    pub retries: usize,
    /// Samples reused from earlier invocations.
    pub reused: usize,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// Samples that reached a terminal state in this invocation.
    pub fn finished(&self) -> usize {
        self.succeeded + self.failed + self.limit_exceeded + self.cancelled
    }
}

/// Shared atomic counters for eval-set progress.
///
/// Cloned into the scheduler and incremented via `fetch_add`; the monitor
/// reads them periodically.
#[derive(Debug, Clone)]
pub struct ProgressCounters {
    pub dispatched: Arc<AtomicUsize>,
    pub succeeded: Arc<AtomicUsize>,
    pub failed: Arc<AtomicUsize>,
    pub limit_exceeded: Arc<AtomicUsize>,
    pub cancelled: Arc<AtomicUsize>,
    pub retries: Arc<AtomicUsize>,
    pub reused: Arc<AtomicUsize>,
}

impl Default for ProgressCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCounters {
    /// Create a new set of zeroed progress counters.
    pub fn new() -> Self {
        Self {
            dispatched: Arc::new(AtomicUsize::new(0)),
            succeeded: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
            limit_exceeded: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(AtomicUsize::new(0)),
            retries: Arc::new(AtomicUsize::new(0)),
            reused: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counts one sample reaching `state`. Non-terminal states are ignored.
    pub fn record(&self, state: SampleState) {
        let counter = match state {
            SampleState::Succeeded => &self.succeeded,
            SampleState::Failed => &self.failed,
            SampleState::LimitExceeded => &self.limit_exceeded,
            SampleState::Cancelled => &self.cancelled,
            SampleState::Pending | SampleState::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of the current counter values.
    pub fn snapshot(&self, start: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            limit_exceeded: self.limit_exceeded.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            elapsed: start.elapsed(),
        }
    }
}

/// A background task that periodically logs eval-set progress.
///
/// Call [`ProgressMonitor::stop`] to cancel it.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Start a monitor that logs every `interval`.
    ///
    /// `total_samples` is the number of samples the eval set needs, used for
    /// the completion percentage.
    pub fn start(counters: ProgressCounters, total_samples: usize, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = counters.snapshot(start);
                let done = snap.reused + snap.succeeded + snap.limit_exceeded;
                let pct = if total_samples > 0 {
                    (done as f64 / total_samples as f64 * 100.0).min(100.0)
                } else {
                    0.0
                };
                let elapsed_secs = snap.elapsed.as_secs_f64();
                let samples_per_sec = if elapsed_secs > 0.0 {
                    snap.finished() as f64 / elapsed_secs
                } else {
                    0.0
                };

                tracing::info!(
                    dispatched = snap.dispatched,
                    succeeded = snap.succeeded,
                    failed = snap.failed,
                    limit_exceeded = snap.limit_exceeded,
                    cancelled = snap.cancelled,
                    retries = snap.retries,
                    reused = snap.reused,
                    total_samples,
                    progress_pct = format!("{:.1}%", pct),
                    elapsed_secs = snap.elapsed.as_secs(),
                    samples_per_sec = format!("{:.2}", samples_per_sec),
                    "Eval set progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the background monitor to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
