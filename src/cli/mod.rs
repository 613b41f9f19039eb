//! Command-line interface for swe-harness.
//!
//! Provides the `run` and `batch` commands.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
