//! Work unit model: what has to run, and what happened when it did.
//!
//! - `WorkUnit`: one (task, model, epoch, sample) execution
//! - `SampleRecord`: mutable per-unit record, owned by the scheduler
//! - `TaskRun`: all records of one (task, model) pair plus derived status

pub mod record;
pub mod run;
pub mod unit;

pub use record::{ErrorClass, SampleFailure, SampleRecord, SampleState, TransitionError};
pub use run::{FailOnError, SampleCounts, TaskRun, TaskRunState, TaskRunStatus};
pub use unit::{WorkUnit, WorkUnitKey};
