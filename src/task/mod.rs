//! Task definitions, signatures and registration.
//!
//! A task is an ordered dataset enumeration plus the configuration
//! (constructor arguments, solver, generation config, sandbox) that
//! determines how each sample is executed. Evaluating a task against a
//! model yields a [`TaskSignature`] used to validate resumed state.

pub mod definition;
pub mod registry;
pub mod signature;

pub use definition::{SampleId, TaskDefinition};
pub use registry::{TaskFactory, TaskRegistry, DATASET_TASK};
pub use signature::{SolverSpec, TaskSignature};
