//! Eval-set configuration.
//!
//! Configuration comes from a YAML eval-set file, optionally overridden by
//! `EVALSET_*` environment variables, and is checked by
//! [`EvalSetConfig::validate`] before any work is scheduled.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, TaskError};
use crate::runner::limits::{opt_secs, secs};
use crate::runner::SampleLimits;
use crate::task::{SolverSpec, TaskDefinition, TaskRegistry};
use crate::work::FailOnError;

use super::retry::RetryPolicy;

/// Default per-model connection cap.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Smallest global task budget used when `max_tasks` is not set.
pub const MIN_DEFAULT_MAX_TASKS: usize = 4;

/// How free global slots are shared between models with waiting work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FairnessPolicy {
    /// Rotate through models that have admissible waiters.
    #[default]
    RoundRobin,
    /// Grant to the model using the smallest share of its own cap.
    Weighted,
}

impl FromStr for FairnessPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round_robin" | "round-robin" | "roundrobin" => Ok(FairnessPolicy::RoundRobin),
            "weighted" => Ok(FairnessPolicy::Weighted),
            other => Err(format!("unknown fairness policy '{}'", other)),
        }
    }
}

impl std::fmt::Display for FairnessPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FairnessPolicy::RoundRobin => write!(f, "round_robin"),
            FairnessPolicy::Weighted => write!(f, "weighted"),
        }
    }
}

/// A model and its connection cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, max_connections: usize) -> Self {
        Self {
            name: name.into(),
            max_connections,
        }
    }
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

/// Global options of an eval set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalSetConfig {
    /// Directory holding the log store.
    pub log_dir: PathBuf,
    /// Global cap on concurrently running samples. `None` means
    /// `max(4, number of models)`.
    pub max_tasks: Option<usize>,
    /// Attempts per task run, the first one included. A run whose every
    /// attempt fails is abandoned.
    pub retry_attempts: u32,
    /// Base wait before the first retry; doubles with every retry.
    #[serde(with = "secs")]
    pub retry_wait: Duration,
    /// Factor applied to a model's connection scale on every retry.
    pub retry_connections: f64,
    pub fail_on_error: FailOnError,
    /// Remove logs of abandoned runs instead of keeping them.
    pub cleanup_logs: bool,
    pub fairness: FairnessPolicy,
    /// How long a cancelled sample may take to wind down.
    #[serde(with = "secs")]
    pub cancel_grace: Duration,
    /// Attempts per log store write before the run is abandoned.
    pub log_write_attempts: u32,
    /// Wall-clock bound per sample, treated as an infrastructure timeout.
    #[serde(with = "opt_secs")]
    pub sample_deadline: Option<Duration>,
    /// Interval of progress log lines.
    #[serde(with = "secs")]
    pub progress_interval: Duration,
    pub models: Vec<ModelConfig>,
}

impl Default for EvalSetConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./logs"),
            max_tasks: None,
            retry_attempts: 10,
            retry_wait: Duration::from_secs(30),
            retry_connections: 0.5,
            fail_on_error: FailOnError::Any,
            cleanup_logs: true,
            fairness: FairnessPolicy::RoundRobin,
            cancel_grace: Duration::from_secs(30),
            log_write_attempts: 3,
            sample_deadline: None,
            progress_interval: Duration::from_secs(30),
            models: Vec::new(),
        }
    }
}

impl EvalSetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `EVALSET_LOG_DIR`: Log directory (default: ./logs)
    /// - `EVALSET_MAX_TASKS`: Global sample budget (default: max(4, models))
    /// - `EVALSET_RETRY_ATTEMPTS`: Attempts per task run (default: 10)
    /// - `EVALSET_RETRY_WAIT_SECS`: Base retry wait (default: 30)
    /// - `EVALSET_RETRY_CONNECTIONS`: Connection factor per retry (default: 0.5)
    /// - `EVALSET_FAIL_ON_ERROR`: `true`, `false`, a fraction or a count
    /// - `EVALSET_CLEANUP_LOGS`: Remove logs of abandoned runs (default: true)
    /// - `EVALSET_FAIRNESS`: `round_robin` or `weighted`
    /// - `EVALSET_CANCEL_GRACE_SECS`: Cancellation grace period (default: 30)
    /// - `EVALSET_LOG_WRITE_ATTEMPTS`: Attempts per log write (default: 3)
    /// - `EVALSET_SAMPLE_DEADLINE_SECS`: Per-sample deadline
    /// - `EVALSET_PROGRESS_INTERVAL_SECS`: Progress log interval (default: 30)
    /// - `EVALSET_MODELS`: Comma-separated `name[=max_connections]` list
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::default().apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from `EVALSET_*` environment variables.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var("EVALSET_LOG_DIR") {
            self.log_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("EVALSET_MAX_TASKS") {
            self.max_tasks = Some(parse_env_value(&val, "EVALSET_MAX_TASKS")?);
        }

        if let Ok(val) = std::env::var("EVALSET_RETRY_ATTEMPTS") {
            self.retry_attempts = parse_env_value(&val, "EVALSET_RETRY_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("EVALSET_RETRY_WAIT_SECS") {
            self.retry_wait = parse_env_secs(&val, "EVALSET_RETRY_WAIT_SECS")?;
        }

        if let Ok(val) = std::env::var("EVALSET_RETRY_CONNECTIONS") {
            self.retry_connections = parse_env_value(&val, "EVALSET_RETRY_CONNECTIONS")?;
        }

        if let Ok(val) = std::env::var("EVALSET_FAIL_ON_ERROR") {
            self.fail_on_error = parse_fail_on_error(&val, "EVALSET_FAIL_ON_ERROR")?;
        }

        if let Ok(val) = std::env::var("EVALSET_CLEANUP_LOGS") {
            self.cleanup_logs = parse_env_bool(&val, "EVALSET_CLEANUP_LOGS")?;
        }

        if let Ok(val) = std::env::var("EVALSET_FAIRNESS") {
            self.fairness = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "EVALSET_FAIRNESS".to_string(),
                message,
            })?;
        }

        if let Ok(val) = std::env::var("EVALSET_CANCEL_GRACE_SECS") {
            self.cancel_grace = parse_env_secs(&val, "EVALSET_CANCEL_GRACE_SECS")?;
        }

        if let Ok(val) = std::env::var("EVALSET_LOG_WRITE_ATTEMPTS") {
            self.log_write_attempts = parse_env_value(&val, "EVALSET_LOG_WRITE_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("EVALSET_SAMPLE_DEADLINE_SECS") {
            self.sample_deadline = Some(parse_env_secs(&val, "EVALSET_SAMPLE_DEADLINE_SECS")?);
        }

        if let Ok(val) = std::env::var("EVALSET_PROGRESS_INTERVAL_SECS") {
            self.progress_interval = parse_env_secs(&val, "EVALSET_PROGRESS_INTERVAL_SECS")?;
        }

        if let Ok(val) = std::env::var("EVALSET_MODELS") {
            self.models = parse_models(&val, "EVALSET_MODELS")?;
        }

        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one model must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for model in &self.models {
            if model.name.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "model name cannot be empty".to_string(),
                ));
            }
            if !seen.insert(model.name.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "model '{}' is configured twice",
                    model.name
                )));
            }
            if model.max_connections == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "max_connections for model '{}' must be greater than 0",
                    model.name
                )));
            }
        }

        if self.max_tasks == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "max_tasks must be greater than 0".to_string(),
            ));
        }

        if !(self.retry_connections > 0.0 && self.retry_connections <= 1.0) {
            return Err(ConfigError::ValidationFailed(
                "retry_connections must be in (0, 1]".to_string(),
            ));
        }

        if self.retry_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry_attempts must be greater than 0".to_string(),
            ));
        }

        if self.log_write_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "log_write_attempts must be greater than 0".to_string(),
            ));
        }

        if self.progress_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "progress_interval must be greater than 0".to_string(),
            ));
        }

        if self.sample_deadline.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::ValidationFailed(
                "sample_deadline must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Global sample budget in effect.
    pub fn effective_max_tasks(&self) -> usize {
        self.max_tasks
            .unwrap_or_else(|| MIN_DEFAULT_MAX_TASKS.max(self.models.len()))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_wait: self.retry_wait,
            connection_factor: self.retry_connections,
        }
    }

    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Builder method to add a model.
    pub fn with_model(mut self, name: impl Into<String>, max_connections: usize) -> Self {
        self.models.push(ModelConfig::new(name, max_connections));
        self
    }

    /// Builder method to set the log directory.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Builder method to set the global sample budget.
    pub fn with_max_tasks(mut self, max: usize) -> Self {
        self.max_tasks = Some(max);
        self
    }

    /// Builder method to set retry attempts.
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Builder method to set the base retry wait.
    pub fn with_retry_wait(mut self, wait: Duration) -> Self {
        self.retry_wait = wait;
        self
    }

    /// Builder method to set the per-retry connection factor.
    pub fn with_retry_connections(mut self, factor: f64) -> Self {
        self.retry_connections = factor;
        self
    }

    /// Builder method to set the failure tolerance.
    pub fn with_fail_on_error(mut self, tolerance: FailOnError) -> Self {
        self.fail_on_error = tolerance;
        self
    }

    /// Builder method to enable or disable log cleanup.
    pub fn with_cleanup_logs(mut self, cleanup: bool) -> Self {
        self.cleanup_logs = cleanup;
        self
    }

    /// Builder method to set the fairness policy.
    pub fn with_fairness(mut self, fairness: FairnessPolicy) -> Self {
        self.fairness = fairness;
        self
    }

    /// Builder method to set the cancellation grace period.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Builder method to set log write attempts.
    pub fn with_log_write_attempts(mut self, attempts: u32) -> Self {
        self.log_write_attempts = attempts;
        self
    }

    /// Builder method to set the per-sample deadline.
    pub fn with_sample_deadline(mut self, deadline: Duration) -> Self {
        self.sample_deadline = Some(deadline);
        self
    }
}

/// One task entry of an eval-set file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    /// Registered task name.
    pub task: String,
    /// Name the run is recorded under, if different from `task`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub solver: Option<SolverSpec>,
    #[serde(default)]
    pub generate_config: Option<Value>,
    #[serde(default)]
    pub sandbox: Option<Value>,
    #[serde(default)]
    pub epochs: Option<u32>,
    #[serde(default)]
    pub limits: Option<SampleLimits>,
}

impl TaskEntry {
    /// Builds the task through `registry` and applies the entry's overrides.
    pub fn instantiate(&self, registry: &TaskRegistry) -> Result<TaskDefinition, TaskError> {
        let mut task = registry.create(&self.task, &self.args)?;
        if let Some(name) = &self.name {
            task.name = name.clone();
        }
        if let Some(solver) = &self.solver {
            task.solver = solver.clone();
        }
        if let Some(config) = &self.generate_config {
            task.generate_config = config.clone();
        }
        if let Some(sandbox) = &self.sandbox {
            task.sandbox = Some(sandbox.clone());
        }
        if let Some(epochs) = self.epochs {
            task.epochs = epochs;
        }
        if let Some(limits) = &self.limits {
            task.limits = limits.clone();
        }
        task.validate()?;
        Ok(task)
    }
}

/// An eval-set file: configuration plus the tasks to run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalSetFile {
    #[serde(default)]
    pub config: EvalSetConfig,
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

impl EvalSetFile {
    /// Reads and parses a YAML eval-set file. Environment overrides are
    /// applied on top of the file's configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut file: EvalSetFile = serde_yaml::from_str(content)?;
        file.config = file.config.apply_env()?;
        file.config.validate()?;
        if file.tasks.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "eval set has no tasks".to_string(),
            ));
        }
        Ok(file)
    }

    /// Instantiates every task entry.
    pub fn instantiate(&self, registry: &TaskRegistry) -> Result<Vec<TaskDefinition>, TaskError> {
        self.tasks.iter().map(|e| e.instantiate(registry)).collect()
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

/// Parse fractional seconds.
fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse_env_value(value, key)?;
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// `true`/`false` or a number, as in the YAML form.
fn parse_fail_on_error(value: &str, key: &str) -> Result<FailOnError, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" => return Ok(FailOnError::Any),
        "false" => return Ok(FailOnError::Never),
        _ => {}
    }
    serde_json::from_str(value.trim()).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parse `name[=max_connections]` entries separated by commas.
fn parse_models(value: &str, key: &str) -> Result<Vec<ModelConfig>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| -> Result<ModelConfig, ConfigError> {
            match entry.split_once('=') {
                Some((name, max)) => Ok(ModelConfig::new(name.trim(), parse_env_value(max, key)?)),
                None => Ok(ModelConfig::new(entry, DEFAULT_MAX_CONNECTIONS)),
            }
        })
        .collect()
}
