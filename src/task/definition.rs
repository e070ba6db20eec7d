//! Task definitions: a dataset enumeration plus the configuration that
//! identifies how it is solved.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskError;
use crate::runner::SampleLimits;
use crate::work::WorkUnit;

use super::signature::{SolverSpec, TaskSignature};

/// Identifier of one dataset sample.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleId(String);

impl SampleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SampleId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SampleId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for SampleId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for SampleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A task ready to be scheduled against one or more models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Registered task name.
    pub name: String,
    /// Constructor arguments the task was built from.
    #[serde(default)]
    pub args: Value,
    /// Solver identity.
    #[serde(default)]
    pub solver: SolverSpec,
    /// Generation config passed to the model.
    #[serde(default)]
    pub generate_config: Value,
    /// Sandbox configuration.
    #[serde(default)]
    pub sandbox: Option<Value>,
    /// Number of times every sample is run.
    pub epochs: u32,
    /// Ordered sample enumeration.
    pub samples: Vec<SampleId>,
    /// Per-sample execution limits.
    #[serde(default)]
    pub limits: SampleLimits,
}

impl TaskDefinition {
    /// Creates a single-epoch task over the given samples.
    pub fn new<I, S>(name: impl Into<String>, samples: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SampleId>,
    {
        Self {
            name: name.into(),
            args: Value::Null,
            solver: SolverSpec::default(),
            generate_config: Value::Null,
            sandbox: None,
            epochs: 1,
            samples: samples.into_iter().map(Into::into).collect(),
            limits: SampleLimits::default(),
        }
    }

    /// Sets the constructor arguments.
    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// Sets the solver.
    pub fn with_solver(mut self, solver: SolverSpec) -> Self {
        self.solver = solver;
        self
    }

    /// Sets the generation config.
    pub fn with_generate_config(mut self, config: Value) -> Self {
        self.generate_config = config;
        self
    }

    /// Sets the sandbox configuration.
    pub fn with_sandbox(mut self, sandbox: Value) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Sets the number of epochs.
    pub fn with_epochs(mut self, epochs: u32) -> Self {
        self.epochs = epochs;
        self
    }

    /// Sets the per-sample limits.
    pub fn with_limits(mut self, limits: SampleLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Checks that the task can be expanded into work units.
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.samples.is_empty() {
            return Err(TaskError::EmptyDataset(self.name.clone()));
        }
        if self.epochs == 0 {
            return Err(TaskError::ZeroEpochs(self.name.clone()));
        }
        let mut seen = HashSet::with_capacity(self.samples.len());
        for id in &self.samples {
            if !seen.insert(id) {
                return Err(TaskError::DuplicateSample {
                    task: self.name.clone(),
                    sample_id: id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Signature of this task evaluated against `model`.
    pub fn signature(&self, model: &str) -> TaskSignature {
        TaskSignature {
            task: self.name.clone(),
            task_args: self.args.clone(),
            solver: self.solver.clone(),
            model: model.to_string(),
            generate_config: self.generate_config.clone(),
            sandbox: self.sandbox.clone(),
        }
    }

    /// Every required execution for `model`: samples x epochs, epochs 1-based.
    pub fn work_units(&self, model: &str) -> Vec<WorkUnit> {
        let signature = Arc::new(self.signature(model));
        let mut units = Vec::with_capacity(self.samples.len() * self.epochs as usize);
        for epoch in 1..=self.epochs {
            for sample_id in &self.samples {
                units.push(WorkUnit::new(
                    Arc::clone(&signature),
                    sample_id.clone(),
                    epoch,
                ));
            }
        }
        units
    }
}
