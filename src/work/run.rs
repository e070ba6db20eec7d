//! Task runs: every sample record of one (task, model) pairing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::logstore::TaskRunHeader;
use crate::task::{TaskDefinition, TaskSignature};

use super::record::{SampleFailure, SampleRecord, SampleState, TransitionError};
use super::unit::{WorkUnit, WorkUnitKey};

/// How many failed samples a run tolerates and still counts as a success.
///
/// Deserializes from `true` (no failures tolerated), `false` (any number
/// tolerated), a fraction in `(0, 1)` of all samples, or a count `>= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FailOnErrorRepr", into = "FailOnErrorRepr")]
pub enum FailOnError {
    Any,
    Never,
    Fraction(f64),
    Count(u64),
}

impl Default for FailOnError {
    fn default() -> Self {
        FailOnError::Any
    }
}

impl FailOnError {
    /// Whether `failed` out of `total` samples is still acceptable.
    pub fn tolerates(&self, failed: usize, total: usize) -> bool {
        match *self {
            FailOnError::Any => failed == 0,
            FailOnError::Never => true,
            FailOnError::Fraction(fraction) => {
                total == 0 || (failed as f64 / total as f64) <= fraction
            }
            FailOnError::Count(count) => failed as u64 <= count,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum FailOnErrorRepr {
    Flag(bool),
    Number(f64),
}

impl TryFrom<FailOnErrorRepr> for FailOnError {
    type Error = String;

    fn try_from(repr: FailOnErrorRepr) -> Result<Self, Self::Error> {
        match repr {
            FailOnErrorRepr::Flag(true) => Ok(FailOnError::Any),
            FailOnErrorRepr::Flag(false) => Ok(FailOnError::Never),
            FailOnErrorRepr::Number(n) if n > 0.0 && n < 1.0 => Ok(FailOnError::Fraction(n)),
            FailOnErrorRepr::Number(n) if n >= 1.0 && n.fract() == 0.0 => {
                Ok(FailOnError::Count(n as u64))
            }
            FailOnErrorRepr::Number(n) => Err(format!(
                "fail_on_error must be a boolean, a fraction in (0, 1) or a whole count >= 1, got {}",
                n
            )),
        }
    }
}

impl From<FailOnError> for FailOnErrorRepr {
    fn from(value: FailOnError) -> Self {
        match value {
            FailOnError::Any => FailOnErrorRepr::Flag(true),
            FailOnError::Never => FailOnErrorRepr::Flag(false),
            FailOnError::Fraction(f) => FailOnErrorRepr::Number(f),
            FailOnError::Count(n) => FailOnErrorRepr::Number(n as f64),
        }
    }
}

/// Scheduler-level lifecycle of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunState {
    NotStarted,
    InProgress,
    Completed,
    Abandoned,
}

impl std::fmt::Display for TaskRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskRunState::NotStarted => write!(f, "not_started"),
            TaskRunState::InProgress => write!(f, "in_progress"),
            TaskRunState::Completed => write!(f, "completed"),
            TaskRunState::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Status derived from the sample records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    /// Every sample complete, or only tolerated failures left.
    Success,
    /// Failures beyond the tolerance, or cancelled samples.
    Failed,
    /// Samples still waiting or running.
    Incomplete,
}

impl std::fmt::Display for TaskRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskRunStatus::Success => write!(f, "success"),
            TaskRunStatus::Failed => write!(f, "failed"),
            TaskRunStatus::Incomplete => write!(f, "incomplete"),
        }
    }
}

/// Record counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub limit_exceeded: usize,
    pub cancelled: usize,
}

impl SampleCounts {
    pub fn complete(&self) -> usize {
        self.succeeded + self.limit_exceeded
    }
}

/// All sample records for one (task, model) pair.
#[derive(Debug, Clone)]
pub struct TaskRun {
    signature: Arc<TaskSignature>,
    units: Vec<WorkUnit>,
    records: HashMap<WorkUnitKey, SampleRecord>,
    state: TaskRunState,
    tolerance: FailOnError,
    attempts: u32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    /// Creates a run with no records; records are created lazily.
    pub fn new(task: &TaskDefinition, model: &str, tolerance: FailOnError) -> Self {
        let units = task.work_units(model);
        let signature = units
            .first()
            .map(|u| Arc::clone(&u.signature))
            .unwrap_or_else(|| Arc::new(task.signature(model)));
        Self {
            signature,
            units,
            records: HashMap::new(),
            state: TaskRunState::NotStarted,
            tolerance,
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }

    /// Adopts records loaded from the log store. Records for units that are
    /// no longer required are ignored. Returns how many complete records
    /// were reused.
    pub fn hydrate(&mut self, prior: HashMap<WorkUnitKey, SampleRecord>) -> usize {
        let mut reused = 0;
        for unit in &self.units {
            let key = unit.key();
            if let Some(record) = prior.get(&key) {
                let record = record.clone().resumed();
                if record.state.is_complete() {
                    reused += 1;
                }
                self.records.insert(key, record);
            }
        }
        reused
    }

    pub fn id(&self) -> String {
        self.signature.run_id()
    }

    pub fn signature(&self) -> &Arc<TaskSignature> {
        &self.signature
    }

    pub fn task(&self) -> &str {
        &self.signature.task
    }

    pub fn model(&self) -> &str {
        &self.signature.model
    }

    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    /// SHA-256 over the sorted keys of every required unit. Changes when
    /// samples or epochs are added or removed.
    pub fn units_digest(&self) -> String {
        let mut keys: Vec<String> = self.units.iter().map(|u| u.key().to_string()).collect();
        keys.sort();
        let mut hasher = Sha256::new();
        for key in &keys {
            hasher.update(key.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    pub fn state(&self) -> TaskRunState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn tolerance(&self) -> FailOnError {
        self.tolerance
    }

    /// `NotStarted -> InProgress`.
    pub fn start(&mut self) {
        if self.state == TaskRunState::NotStarted {
            self.state = TaskRunState::InProgress;
            self.started_at = Some(Utc::now());
        }
    }

    /// `InProgress -> Completed`.
    pub fn complete(&mut self) {
        if matches!(self.state, TaskRunState::NotStarted | TaskRunState::InProgress) {
            self.state = TaskRunState::Completed;
            self.completed_at = Some(Utc::now());
        }
    }

    /// `InProgress -> Abandoned`.
    pub fn abandon(&mut self) {
        if matches!(self.state, TaskRunState::NotStarted | TaskRunState::InProgress) {
            self.state = TaskRunState::Abandoned;
            self.completed_at = Some(Utc::now());
        }
    }

    /// Counts a new dispatch round and returns its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.start();
        self.attempts += 1;
        self.attempts
    }

    pub fn record(&self, key: &WorkUnitKey) -> Option<&SampleRecord> {
        self.records.get(key)
    }

    /// Snapshot of the record for `key`, as handed to a sample runner.
    pub fn record_snapshot(&self, key: &WorkUnitKey) -> SampleRecord {
        self.records.get(key).cloned().unwrap_or_default()
    }

    /// Units whose record is not complete.
    pub fn outstanding(&self) -> Vec<&WorkUnit> {
        self.units
            .iter()
            .filter(|u| {
                self.records
                    .get(&u.key())
                    .map_or(true, |r| !r.state.is_complete())
            })
            .collect()
    }

    /// Outstanding units that are ready to be dispatched.
    pub fn dispatchable(&self) -> Vec<WorkUnit> {
        self.units
            .iter()
            .filter(|u| {
                self.records
                    .get(&u.key())
                    .map_or(true, |r| r.state == SampleState::Pending)
            })
            .cloned()
            .collect()
    }

    /// Marks the stored record as running, creating it on first use.
    pub fn mark_running(&mut self, key: &WorkUnitKey) -> Result<(), TransitionError> {
        self.records.entry(key.clone()).or_default().begin()
    }

    /// Replaces the stored record with the terminal record returned by a
    /// sample runner.
    pub fn apply(&mut self, key: &WorkUnitKey, record: SampleRecord) -> Result<(), TransitionError> {
        let stored = self.records.entry(key.clone()).or_default();
        if stored.state == SampleState::Pending {
            stored.begin()?;
        }
        if stored.state != SampleState::Running || !record.state.is_terminal() {
            return Err(TransitionError {
                from: stored.state,
                to: record.state,
            });
        }
        *stored = record;
        Ok(())
    }

    /// Returns failed and cancelled records to `Pending` for a retry.
    pub fn readmit_failed(&mut self) -> usize {
        self.records
            .values_mut()
            .filter_map(|r| r.readmit().ok())
            .count()
    }

    pub fn counts(&self) -> SampleCounts {
        let mut counts = SampleCounts {
            total: self.units.len(),
            ..Default::default()
        };
        for unit in &self.units {
            match self.records.get(&unit.key()).map(|r| r.state) {
                None | Some(SampleState::Pending) => counts.pending += 1,
                Some(SampleState::Running) => counts.running += 1,
                Some(SampleState::Succeeded) => counts.succeeded += 1,
                Some(SampleState::Failed) => counts.failed += 1,
                Some(SampleState::LimitExceeded) => counts.limit_exceeded += 1,
                Some(SampleState::Cancelled) => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn status(&self) -> TaskRunStatus {
        let counts = self.counts();
        if counts.complete() == counts.total {
            TaskRunStatus::Success
        } else if counts.pending + counts.running > 0 {
            TaskRunStatus::Incomplete
        } else if counts.cancelled == 0 && self.tolerance.tolerates(counts.failed, counts.total) {
            TaskRunStatus::Success
        } else {
            TaskRunStatus::Failed
        }
    }

    /// Whether the failures recorded so far already exceed the tolerance.
    pub fn tolerance_breached(&self) -> bool {
        let counts = self.counts();
        !self.tolerance.tolerates(counts.failed, counts.total)
    }

    /// The most recent failure across all records.
    pub fn last_error(&self) -> Option<&SampleFailure> {
        self.records
            .values()
            .filter(|r| matches!(r.state, SampleState::Failed | SampleState::Cancelled))
            .filter_map(|r| r.last_error.as_ref().map(|e| (r.ended_at, e)))
            .max_by_key(|(ended, _)| *ended)
            .map(|(_, e)| e)
    }

    /// Lightweight summary suitable for downstream analysis.
    pub fn header(&self, location: impl Into<String>) -> TaskRunHeader {
        let counts = self.counts();
        TaskRunHeader {
            task: self.task().to_string(),
            model: self.model().to_string(),
            signature_digest: self.signature.digest(),
            units_digest: self.units_digest(),
            status: self.status(),
            samples_total: counts.total,
            succeeded: counts.succeeded,
            failed: counts.failed,
            limit_exceeded: counts.limit_exceeded,
            attempts: self.attempts,
            started_at: self.started_at,
            completed_at: self.completed_at.or_else(|| Some(Utc::now())),
            location: location.into(),
        }
    }
}
