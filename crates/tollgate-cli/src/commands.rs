//! CLI command definitions.

use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a workflow document
    Validate {
        /// Path to workflow file
        #[arg(default_value = "tollgate.yaml")]
        path: PathBuf,
    },

    /// Show what an event would run, without running anything
    Plan {
        /// Path to workflow file
        #[arg(default_value = "tollgate.yaml")]
        path: PathBuf,

        #[command(flatten)]
        event: EventArgs,
    },

    /// Run a workflow for an event
    Run {
        /// Path to workflow file
        #[arg(default_value = "tollgate.yaml")]
        path: PathBuf,

        #[command(flatten)]
        event: EventArgs,

        /// Approve every environment gate without prompting
        #[arg(long)]
        approve: bool,

        /// Publish into a local directory registry
        #[arg(long, conflicts_with = "registry_url")]
        registry_dir: Option<PathBuf>,

        /// Publish to an HTTP registry
        #[arg(long)]
        registry_url: Option<String>,

        /// JSON file of secret values for the `file` provider
        #[arg(long)]
        secrets_file: Option<PathBuf>,

        /// Maximum job instances running at once
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Directory steps run in
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stamp a base version with a release-candidate suffix
    Stamp {
        /// Base version, e.g. 3.6
        base: String,

        /// Timestamp to stamp with (RFC 3339), defaults to now
        #[arg(long)]
        at: Option<String>,
    },

    /// Print the JSON Schema of the workflow document
    Schema,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// The triggering event.
#[derive(Args, Clone)]
pub struct EventArgs {
    /// Event kind: push, pull_request or manual
    #[arg(short, long, default_value = "push")]
    pub event: String,

    /// Triggering branch (head branch for pull requests)
    #[arg(short, long)]
    pub branch: String,

    /// Target branch of a pull request
    #[arg(long)]
    pub target: Option<String>,

    /// Who triggered the event
    #[arg(long, default_value = "local")]
    pub actor: String,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
