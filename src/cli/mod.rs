//! Command-line interface for evalset.
//!
//! Provides commands to plan an eval set, inspect a log directory and run
//! an eval set against a simulated pipeline.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
