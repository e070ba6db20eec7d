//! Per-work-unit execution records and their state machine.
//!
//! Records move strictly forward:
//!
//! ```text
//! Pending ──► Running ──► Succeeded
//!                    ├──► Failed ────────┐
//!                    ├──► LimitExceeded  │ readmit (retry only)
//!                    └──► Cancelled ─────┤
//!    ▲                                   │
//!    └───────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::runner::LimitKind;

/// Lifecycle state of a sample record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleState {
    Pending,
    Running,
    Succeeded,
    Failed,
    LimitExceeded,
    Cancelled,
}

impl SampleState {
    /// Whether the state ends an execution attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SampleState::Succeeded
                | SampleState::Failed
                | SampleState::LimitExceeded
                | SampleState::Cancelled
        )
    }

    /// Whether the record holds a final result that is never re-executed.
    ///
    /// Limit violations are design limits hit by the agent, so their result
    /// stands just like a success.
    pub fn is_complete(&self) -> bool {
        matches!(self, SampleState::Succeeded | SampleState::LimitExceeded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SampleState::Pending => "pending",
            SampleState::Running => "running",
            SampleState::Succeeded => "succeeded",
            SampleState::Failed => "failed",
            SampleState::LimitExceeded => "limit_exceeded",
            SampleState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SampleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether retrying a failure can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Infrastructure trouble: timeouts, rate limits, transport errors.
    Retryable,
    /// Configuration or programming errors.
    Fatal,
}

/// Structured cause attached to a non-successful record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleFailure {
    pub class: ErrorClass,
    /// Short machine-readable cause, e.g. `rate_limited`.
    pub cause: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<LimitKind>,
}

impl SampleFailure {
    pub fn retryable(cause: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Retryable,
            cause: cause.into(),
            message: message.into(),
            limit: None,
        }
    }

    pub fn fatal(cause: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Fatal,
            cause: cause.into(),
            message: message.into(),
            limit: None,
        }
    }

    /// A limit violation. Never retried, so the class is irrelevant and kept
    /// as `Fatal` to make accidental retries visible.
    pub fn limit(kind: LimitKind, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Fatal,
            cause: format!("{}_limit", kind),
            message: message.into(),
            limit: Some(kind),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::retryable("cancelled", message)
    }

    pub fn is_fatal(&self) -> bool {
        self.class == ErrorClass::Fatal && self.limit.is_none()
    }
}

impl std::fmt::Display for SampleFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.cause, self.message)
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid sample transition from '{from}' to '{to}'")]
pub struct TransitionError {
    pub from: SampleState,
    pub to: SampleState,
}

/// Mutable execution record for one work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub state: SampleState,
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<SampleFailure>,
    /// Opaque score/output payload.
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Default for SampleRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleRecord {
    /// A fresh record that has never been attempted.
    pub fn new() -> Self {
        Self {
            state: SampleState::Pending,
            attempt_count: 0,
            last_error: None,
            result: None,
            started_at: None,
            ended_at: None,
        }
    }

    /// Turns a record loaded from a previous invocation into one usable in
    /// this invocation. Complete records are kept as they are; anything else
    /// starts over as `Pending` while remembering how often it was tried.
    pub fn resumed(self) -> Self {
        if self.state.is_complete() {
            return self;
        }
        Self {
            state: SampleState::Pending,
            attempt_count: self.attempt_count,
            last_error: self.last_error,
            result: None,
            started_at: None,
            ended_at: None,
        }
    }

    fn transition(&mut self, allowed: &[SampleState], to: SampleState) -> Result<(), TransitionError> {
        if !allowed.contains(&self.state) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// `Pending -> Running`; counts the attempt.
    pub fn begin(&mut self) -> Result<(), TransitionError> {
        self.transition(&[SampleState::Pending], SampleState::Running)?;
        self.attempt_count += 1;
        self.started_at = Some(Utc::now());
        self.ended_at = None;
        Ok(())
    }

    /// `Running -> Succeeded`.
    pub fn succeed(&mut self, result: Value) -> Result<(), TransitionError> {
        self.transition(&[SampleState::Running], SampleState::Succeeded)?;
        self.result = Some(result);
        self.last_error = None;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// `Running -> Failed`.
    pub fn fail(&mut self, failure: SampleFailure) -> Result<(), TransitionError> {
        self.transition(&[SampleState::Running], SampleState::Failed)?;
        self.last_error = Some(failure);
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// `Running -> LimitExceeded`, keeping any partial result.
    pub fn exceed_limit(
        &mut self,
        failure: SampleFailure,
        partial: Option<Value>,
    ) -> Result<(), TransitionError> {
        self.transition(&[SampleState::Running], SampleState::LimitExceeded)?;
        self.last_error = Some(failure);
        self.result = partial;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// `Running -> Cancelled`.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(&[SampleState::Running], SampleState::Cancelled)?;
        self.last_error = Some(SampleFailure::cancelled(reason));
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// `Failed | Cancelled -> Pending`, only on a retry admitted by the
    /// retry controller.
    pub fn readmit(&mut self) -> Result<(), TransitionError> {
        self.transition(
            &[SampleState::Failed, SampleState::Cancelled],
            SampleState::Pending,
        )?;
        self.result = None;
        self.started_at = None;
        self.ended_at = None;
        Ok(())
    }

    /// Wall-clock duration of the last attempt, if it finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
