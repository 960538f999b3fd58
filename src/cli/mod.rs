//! CLI module for the Terrace provisioning tool.
//!
//! This module provides the command-line interface and its output
//! formatting.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
