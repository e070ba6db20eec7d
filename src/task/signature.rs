//! Task configuration identity.
//!
//! A [`TaskSignature`] captures everything that makes a stored sample result
//! reusable: the task and its constructor arguments, the solver, the model,
//! the generation config and the sandbox. Stored results are only trusted
//! when the canonical bytes of the signature match exactly.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Identity of the solver (agent) that drives a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverSpec {
    /// Registered solver name.
    pub name: String,
    /// Solver arguments.
    #[serde(default)]
    pub args: Value,
}

impl SolverSpec {
    /// Creates a solver spec with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Value::Null,
        }
    }

    /// Sets the solver arguments.
    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }
}

impl Default for SolverSpec {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Identity of one (task, model) configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSignature {
    /// Registered task name.
    pub task: String,
    /// Serialized constructor arguments.
    pub task_args: Value,
    /// Solver identity and arguments.
    pub solver: SolverSpec,
    /// Model identifier.
    pub model: String,
    /// Generation config passed to the model.
    pub generate_config: Value,
    /// Sandbox configuration, if the task uses one.
    pub sandbox: Option<Value>,
}

impl TaskSignature {
    /// Canonical serialized form.
    ///
    /// Object keys are emitted in sorted order, so two signatures built from
    /// equal values always produce identical bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        json!({
            "task": self.task,
            "task_args": self.task_args,
            "solver": { "name": self.solver.name, "args": self.solver.args },
            "model": self.model,
            "generate_config": self.generate_config,
            "sandbox": self.sandbox,
        })
        .to_string()
        .into_bytes()
    }

    /// Hex-encoded SHA-256 of the canonical bytes.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_bytes()))
    }

    /// Whether previously stored canonical bytes belong to this signature.
    pub fn matches(&self, stored: &[u8]) -> bool {
        self.canonical_bytes() == stored
    }

    /// Human-readable run identifier (`task/model`).
    pub fn run_id(&self) -> String {
        format!("{}/{}", self.task, self.model)
    }
}

impl std::fmt::Display for TaskSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let digest = self.digest();
        write!(f, "{} [{}]", self.run_id(), &digest[..12])
    }
}
