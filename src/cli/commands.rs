//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Terrace - declarative infrastructure provisioning.
#[derive(Parser, Debug)]
#[command(name = "terrace")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "TERRACE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Set an input variable (NAME=VALUE, repeatable).
    #[arg(long = "var", global = true, value_name = "NAME=VALUE")]
    pub vars: Vec<String>,

    /// Skip confirmation prompts.
    #[arg(short, long, global = true)]
    pub yes: bool,

    /// Maximum number of concurrent provider calls.
    #[arg(long, global = true)]
    pub parallelism: Option<usize>,

    /// Cancel the run after this many seconds.
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new Terrace project.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the configuration.
    Validate {
        /// Show warnings as well as errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show what apply or destroy would change.
    Plan {
        /// Plan destruction of every resource instead.
        #[arg(long)]
        destroy: bool,

        /// Show changed attributes for each action.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Converge the infrastructure to the configuration.
    Apply,

    /// Destroy every resource recorded in state.
    Destroy,

    /// Show output values from the stored state.
    Output {
        /// Show a single output.
        name: Option<String>,

        /// Print sensitive values instead of hiding them.
        #[arg(long)]
        show_sensitive: bool,
    },

    /// Inspect and manage state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },

    /// Print the dependency graph in creation order.
    Graph,
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show a summary of the state.
    Show,

    /// List recorded resources.
    List,

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Remove the lock whoever holds it.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}
