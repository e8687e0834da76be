//! CLI interface using clap
//!
//! Provides the command-line interface for BugSage

mod commands;

pub use commands::*;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// BugSage - Real-time defect severity prediction
#[derive(Parser, Debug)]
#[command(name = "bugsage")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Workspace directory holding `.bugsage/` (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    pub path: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json)
    #[arg(short = 'o', long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Override the database file from the configuration
    #[arg(long, global = true, env = "BUGSAGE_DATABASE")]
    pub database: Option<PathBuf>,

    /// Override the model version from the configuration
    #[arg(long, global = true, env = "BUGSAGE_MODEL_VERSION")]
    pub model_version: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a BugSage workspace
    Init(InitArgs),

    /// Append a raw webhook payload to the Event Store
    Ingest(IngestArgs),

    /// Run the prediction pipeline
    Run(RunArgs),

    /// Append local Git history and GitHub issues as events
    Backfill(BackfillArgs),

    /// Show the prediction for a commit
    Prediction(PredictionArgs),

    /// List predictions for a repository
    Predictions(PredictionsArgs),

    /// Show the feature vector of a commit or issue
    Features(FeaturesArgs),

    /// List events and their pipeline state
    Events(EventsArgs),

    /// Show store counts and events per state
    Status,

    /// Requeue a parked or failed event
    Retry(RetryArgs),

    /// Show configuration
    Config(ConfigArgs),
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Arguments for init command
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Force re-initialization
    #[arg(short, long)]
    pub force: bool,
}

/// Arguments for ingest command
#[derive(Parser, Debug)]
pub struct IngestArgs {
    /// Event type as sent in the webhook header (push, issues, ...)
    pub event_type: String,

    /// JSON payload file
    pub file: PathBuf,

    /// Delivery id from the webhook header
    #[arg(long)]
    pub delivery_id: Option<String>,
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Process everything currently due, then exit
    #[arg(long)]
    pub once: bool,
}

/// Arguments for backfill command
#[derive(Parser, Debug)]
pub struct BackfillArgs {
    /// Path to a local Git repository
    #[arg(long)]
    pub git: Option<PathBuf>,

    /// Repository name the history belongs to (owner/name)
    #[arg(long)]
    pub repo: String,

    /// Only include commits at or after this RFC 3339 timestamp
    #[arg(long)]
    pub since: Option<String>,

    /// Commits per synthetic push event
    #[arg(long, default_value = "100")]
    pub batch_size: usize,

    /// Import the repository's issues from the GitHub API
    #[arg(long)]
    pub issues: bool,

    /// Import issues from a JSON array of GitHub issue objects
    #[arg(long, conflicts_with = "issues")]
    pub issues_file: Option<PathBuf>,

    /// Maximum number of issues fetched from the API
    #[arg(long, default_value = "1000")]
    pub issue_limit: usize,

    /// GitHub API base URL
    #[arg(long, env = "GITHUB_API_URL", default_value = crate::repo::issues::DEFAULT_API_URL)]
    pub github_api: String,

    /// Token for GitHub API requests
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,
}

/// Arguments for prediction command
#[derive(Parser, Debug)]
pub struct PredictionArgs {
    /// Commit SHA
    pub sha: String,
}

/// Arguments for predictions command
#[derive(Parser, Debug)]
pub struct PredictionsArgs {
    /// Repository (owner/name)
    #[arg(short, long)]
    pub repo: String,

    /// Earliest commit timestamp (RFC 3339)
    #[arg(long)]
    pub since: Option<String>,

    /// Latest commit timestamp (RFC 3339)
    #[arg(long)]
    pub until: Option<String>,

    /// Maximum number of rows
    #[arg(short, long, default_value = "100")]
    pub limit: usize,
}

/// Arguments for features command
#[derive(Parser, Debug)]
pub struct FeaturesArgs {
    /// Commit SHA
    #[arg(required_unless_present = "issue")]
    pub sha: Option<String>,

    /// Compute the vector of an issue instead (needs --repo)
    #[arg(long, requires = "repo", conflicts_with = "sha")]
    pub issue: Option<u64>,

    /// Repository of the issue (owner/name)
    #[arg(short, long)]
    pub repo: Option<String>,
}

/// Arguments for events command
#[derive(Parser, Debug)]
pub struct EventsArgs {
    /// Filter by state (received, deferred, failed, parked, skipped, ...)
    #[arg(short, long)]
    pub state: Option<String>,

    /// Maximum number of rows
    #[arg(short, long, default_value = "50")]
    pub limit: usize,
}

/// Arguments for retry command
#[derive(Parser, Debug)]
pub struct RetryArgs {
    /// Event id
    pub event_id: i64,
}

/// Arguments for config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Show current configuration
    #[arg(long)]
    pub show: bool,

    /// Get a configuration value
    #[arg(long)]
    pub get: Option<String>,

    /// Reset to defaults
    #[arg(long)]
    pub reset: bool,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
