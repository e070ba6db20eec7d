//! Sample runner for eval-set work units.
//!
//! # Architecture
//!
//! ```text
//! WorkUnit + Pending record → SampleRunner → sandbox init → SamplePipeline
//!                                          → limit checks → sandbox cleanup
//!                                          → terminal SampleRecord
//! ```
//!
//! The runner:
//! 1. Acquires a sandbox through the [`ResourceRegistry`]
//! 2. Executes the pipeline under time limit, deadline and cancellation
//! 3. Classifies the outcome through [`SampleError`]
//! 4. Releases the sandbox on every exit path
//!
//! # Example
//!
//! ```ignore
//! use evalset::runner::{NoSandbox, ResourceRegistry, SampleRunner};
//!
//! let resources = ResourceRegistry::new(Arc::new(NoSandbox));
//! let runner = SampleRunner::new(pipeline, resources, Duration::from_secs(30));
//! let record = runner.run(&unit, SampleRecord::new(), None, &limits, &cancel).await;
//! ```

pub mod error;
pub mod executor;
pub mod limits;
pub mod pipeline;
pub mod sandbox;

pub use error::SampleError;
pub use executor::SampleRunner;
pub use limits::{LimitKind, SampleLimits, SampleUsage};
pub use pipeline::{SampleOutput, SamplePipeline, SampleRequest};
pub use sandbox::{NoSandbox, ResourceRegistry, SandboxError, SandboxHandle, SandboxProvider};
