//! Tagged failures at the sample pipeline boundary.

use thiserror::Error;

use crate::work::{ErrorClass, SampleFailure, SampleState};

use super::limits::LimitKind;
use super::sandbox::SandboxError;

/// Everything a pipeline can report instead of a result.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("{kind} limit exceeded: {message}")]
    LimitExceeded {
        kind: LimitKind,
        message: String,
        /// Partial output produced before the limit was hit.
        partial: Option<serde_json::Value>,
    },

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Pipeline fault: {0}")]
    Fault(String),
}

impl SampleError {
    pub fn limit(kind: LimitKind, message: impl Into<String>) -> Self {
        SampleError::LimitExceeded {
            kind,
            message: message.into(),
            partial: None,
        }
    }

    /// Terminal state a record takes when a pipeline returns this error.
    pub fn state(&self) -> SampleState {
        match self {
            SampleError::LimitExceeded { .. } => SampleState::LimitExceeded,
            SampleError::Transient(_)
            | SampleError::RateLimited(_)
            | SampleError::Timeout(_)
            | SampleError::Sandbox(_)
            | SampleError::Configuration(_)
            | SampleError::Fault(_) => SampleState::Failed,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SampleError::Transient(_)
            | SampleError::RateLimited(_)
            | SampleError::Timeout(_)
            | SampleError::Sandbox(_) => ErrorClass::Retryable,
            SampleError::LimitExceeded { .. }
            | SampleError::Configuration(_)
            | SampleError::Fault(_) => ErrorClass::Fatal,
        }
    }

    /// Short machine-readable cause.
    pub fn cause(&self) -> String {
        match self {
            SampleError::LimitExceeded { kind, .. } => format!("{}_limit", kind),
            SampleError::Transient(_) => "transient".to_string(),
            SampleError::RateLimited(_) => "rate_limited".to_string(),
            SampleError::Timeout(_) => "timeout".to_string(),
            SampleError::Sandbox(_) => "sandbox".to_string(),
            SampleError::Configuration(_) => "configuration".to_string(),
            SampleError::Fault(_) => "fault".to_string(),
        }
    }

    /// Converts into the structured failure stored on the record.
    pub fn to_failure(&self) -> SampleFailure {
        match self {
            SampleError::LimitExceeded { kind, message, .. } => {
                SampleFailure::limit(*kind, message.clone())
            }
            other => SampleFailure {
                class: other.class(),
                cause: other.cause(),
                message: other.to_string(),
                limit: None,
            },
        }
    }
}
