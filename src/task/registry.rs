//! Explicit task registration table.
//!
//! Tasks are registered at startup under a stable name together with a
//! constructor closure. Creating a task through the registry records the
//! serialized constructor arguments, which become part of its signature.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::TaskError;

use super::definition::{SampleId, TaskDefinition};

/// Constructor closure for a registered task.
pub type TaskFactory = Arc<dyn Fn(&Value) -> Result<TaskDefinition, TaskError> + Send + Sync>;

/// Name of the builtin dataset task.
pub const DATASET_TASK: &str = "dataset";

/// Registry mapping task names to constructors.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    factories: BTreeMap<String, TaskFactory>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the builtin `dataset` task registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.factories.insert(
            DATASET_TASK.to_string(),
            Arc::new(|args: &Value| dataset_task(args)),
        );
        registry
    }

    /// Registers a task constructor under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<(), TaskError>
    where
        F: Fn(&Value) -> Result<TaskDefinition, TaskError> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(TaskError::DuplicateRegistration(name));
        }
        debug!(task = %name, "Registered task");
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Instantiates a registered task.
    ///
    /// The returned definition carries `name` and `args` verbatim so that the
    /// signature reflects exactly what was requested.
    pub fn create(&self, name: &str, args: &Value) -> Result<TaskDefinition, TaskError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| TaskError::NotRegistered(name.to_string()))?;
        let mut task = factory(args)?;
        task.name = name.to_string();
        task.args = args.clone();
        task.validate()?;
        Ok(task)
    }

    /// Registered task names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}

/// Builtin task: `{"ids": [..]}` or `{"samples": N}`.
fn dataset_task(args: &Value) -> Result<TaskDefinition, TaskError> {
    let invalid = |message: &str| TaskError::InvalidArgs {
        task: DATASET_TASK.to_string(),
        message: message.to_string(),
    };

    let samples: Vec<SampleId> = if let Some(ids) = args.get("ids") {
        let ids = ids.as_array().ok_or_else(|| invalid("'ids' must be a list"))?;
        ids.iter()
            .map(|id| match id {
                Value::String(s) => Ok(SampleId::from(s.as_str())),
                Value::Number(n) => Ok(SampleId::from(n.to_string())),
                _ => Err(invalid("sample ids must be strings or numbers")),
            })
            .collect::<Result<_, _>>()?
    } else if let Some(count) = args.get("samples") {
        let count = count
            .as_u64()
            .ok_or_else(|| invalid("'samples' must be a non-negative integer"))?;
        (1..=count).map(SampleId::from).collect()
    } else {
        return Err(invalid("expected 'ids' or 'samples'"));
    };

    Ok(TaskDefinition::new(DATASET_TASK, samples))
}
