//! Command-line interface.
//!
//! This module provides the argument definitions and output formatting for
//! the `ecs-deploy` binary.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, RunArgs, StateCommands};
pub use output::OutputFormatter;
