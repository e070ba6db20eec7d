//! The agent/solver/scorer pipeline contract.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::work::WorkUnit;

use super::error::SampleError;
use super::limits::{SampleLimits, SampleUsage};
use super::sandbox::SandboxHandle;

/// Everything a pipeline gets to execute one sample.
#[derive(Debug, Clone)]
pub struct SampleRequest {
    pub unit: WorkUnit,
    pub sandbox: SandboxHandle,
    pub limits: SampleLimits,
    /// 1-based attempt number of this sample.
    pub attempt: u32,
    /// Cancelled when the scheduler wants the sample to stop early.
    pub cancel: CancellationToken,
}

/// Successful pipeline result.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleOutput {
    /// Score/output payload, opaque to the scheduler.
    pub result: Value,
    pub usage: SampleUsage,
}

impl SampleOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            usage: SampleUsage::default(),
        }
    }

    pub fn with_usage(mut self, usage: SampleUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// Solves and scores one sample.
///
/// Implementations report budgets they enforce themselves through
/// [`SampleError::LimitExceeded`]; the runner additionally checks the
/// reported usage against the request's limits.
#[async_trait]
pub trait SamplePipeline: Send + Sync {
    async fn execute(&self, request: SampleRequest) -> Result<SampleOutput, SampleError>;
}
