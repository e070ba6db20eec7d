//! What an eval-set invocation reports back to its caller.

use serde::{Deserialize, Serialize};

use crate::logstore::TaskRunHeader;
use crate::work::{SampleCounts, TaskRunStatus};

/// A task run that gave up for good in this invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbandonedRun {
    pub task: String,
    pub model: String,
    /// Dispatch rounds spent before giving up.
    pub attempts: u32,
    /// `"fatal error"` or `"retry attempts exhausted"`.
    pub reason: String,
    pub last_error: Option<String>,
    /// Where the retained logs are, when cleanup was disabled.
    pub log_location: Option<String>,
}

/// A task run that neither finished nor was abandoned, typically because
/// the invocation was interrupted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncompleteRun {
    pub task: String,
    pub model: String,
    pub counts: SampleCounts,
}

/// Effective concurrency of one model when the invocation ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub model: String,
    pub max_connections: usize,
    pub effective_cap: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalSetStats {
    pub task_runs: usize,
    /// Task runs found already finalized and skipped.
    pub skipped: usize,
    /// Samples reused from earlier invocations.
    pub reused_samples: usize,
    /// Sample runner invocations made by this invocation.
    pub samples_executed: usize,
    pub retries: usize,
    pub models: Vec<ModelStats>,
}

/// Overall result of [`Scheduler::run`](super::Scheduler::run).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalSetOutcome {
    /// True when every task run finalized with a successful status.
    pub success: bool,
    /// One header per finalized task run, including ones finalized earlier.
    pub headers: Vec<TaskRunHeader>,
    pub abandoned: Vec<AbandonedRun>,
    pub incomplete: Vec<IncompleteRun>,
    pub stats: EvalSetStats,
}

impl EvalSetOutcome {
    pub fn header(&self, task: &str, model: &str) -> Option<&TaskRunHeader> {
        self.headers
            .iter()
            .find(|h| h.task == task && h.model == model)
    }

    pub(crate) fn settle(&mut self) {
        self.headers
            .sort_by(|a, b| (&a.task, &a.model).cmp(&(&b.task, &b.model)));
        self.success = self.abandoned.is_empty()
            && self.incomplete.is_empty()
            && self
                .headers
                .iter()
                .all(|h| h.status == TaskRunStatus::Success);
    }
}

impl std::fmt::Display for EvalSetOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "eval set {}: {} finalized, {} abandoned, {} incomplete",
            if self.success { "succeeded" } else { "failed" },
            self.headers.len(),
            self.abandoned.len(),
            self.incomplete.len()
        )?;
        for h in &self.headers {
            writeln!(
                f,
                "  {}/{}: {} ({}/{} succeeded, {} failed, {} limit exceeded)",
                h.task, h.model, h.status, h.succeeded, h.samples_total, h.failed, h.limit_exceeded
            )?;
        }
        for a in &self.abandoned {
            write!(
                f,
                "  {}/{}: abandoned after {} attempt(s), {}",
                a.task, a.model, a.attempts, a.reason
            )?;
            if let Some(err) = &a.last_error {
                write!(f, ", last error: {}", err)?;
            }
            if let Some(location) = &a.log_location {
                write!(f, ", logs kept at {}", location)?;
            }
            writeln!(f)?;
        }
        for i in &self.incomplete {
            writeln!(
                f,
                "  {}/{}: incomplete ({}/{} complete)",
                i.task,
                i.model,
                i.counts.complete(),
                i.counts.total
            )?;
        }
        Ok(())
    }
}
