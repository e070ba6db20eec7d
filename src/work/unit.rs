//! Work units: the smallest schedulable execution.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::task::{SampleId, TaskSignature};

/// Address of a work unit within its task run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkUnitKey {
    pub sample_id: SampleId,
    pub epoch: u32,
}

impl WorkUnitKey {
    pub fn new(sample_id: impl Into<SampleId>, epoch: u32) -> Self {
        Self {
            sample_id: sample_id.into(),
            epoch,
        }
    }
}

impl std::fmt::Display for WorkUnitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.sample_id, self.epoch)
    }
}

/// One required (task, model, epoch, sample) execution. Immutable.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub signature: Arc<TaskSignature>,
    pub sample_id: SampleId,
    pub epoch: u32,
    pub model: String,
}

impl WorkUnit {
    pub fn new(signature: Arc<TaskSignature>, sample_id: SampleId, epoch: u32) -> Self {
        let model = signature.model.clone();
        Self {
            signature,
            sample_id,
            epoch,
            model,
        }
    }

    pub fn key(&self) -> WorkUnitKey {
        WorkUnitKey {
            sample_id: self.sample_id.clone(),
            epoch: self.epoch,
        }
    }

    /// Task name of the owning run.
    pub fn task(&self) -> &str {
        &self.signature.task
    }
}

impl std::fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.signature.run_id(), self.key())
    }
}
