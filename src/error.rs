//! Error types shared across evalset subsystems.
//!
//! Defines error types for:
//! - Eval-set configuration loading and validation
//! - Task construction through the registry
//! - Log store persistence

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that can occur while constructing tasks.
///
/// All of these are configuration problems: retrying cannot fix them.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task '{0}' is not registered")]
    NotRegistered(String),

    #[error("Task '{0}' is already registered")]
    DuplicateRegistration(String),

    #[error("Invalid arguments for task '{task}': {message}")]
    InvalidArgs { task: String, message: String },

    #[error("Task '{0}' has no samples")]
    EmptyDataset(String),

    #[error("Task '{task}' has duplicate sample id '{sample_id}'")]
    DuplicateSample { task: String, sample_id: String },

    #[error("Task '{0}' must run at least one epoch")]
    ZeroEpochs(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur during log store operations.
#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to create log directory {path:?}: {message}")]
    DirectoryCreationFailed { path: PathBuf, message: String },

    #[error("Corrupt journal entry in {path:?} at line {line}: {message}")]
    CorruptEntry {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Task run '{0}' has no log location")]
    UnknownRun(String),
}

impl LogStoreError {
    /// Whether a later attempt of the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LogStoreError::Io(_))
    }
}
