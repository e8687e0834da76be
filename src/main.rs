//! BugSage - Real-time defect severity prediction
//!
//! Turns repository webhook events into causally valid feature vectors and
//! versioned severity predictions.

use anyhow::Result;
use bugsage::cli::{self, Cli, Commands};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Setup logging; RUST_LOG wins when set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let workspace = cli::open_workspace(
        &cli.path,
        cli.database.as_deref(),
        cli.model_version.as_deref(),
    )?;

    // Execute command
    match cli.command {
        Commands::Init(args) => {
            cli::init(&workspace, args.force)?;
        }

        Commands::Ingest(args) => {
            cli::ingest(
                &workspace,
                &args.event_type,
                &args.file,
                args.delivery_id.as_deref(),
                cli.format,
            )?;
        }

        Commands::Run(args) => {
            cli::run(&workspace, args.once, cli.format).await?;
        }

        Commands::Backfill(args) => {
            cli::backfill(&workspace, &args, cli.format).await?;
        }

        Commands::Prediction(args) => {
            cli::prediction(&workspace, &args.sha, cli.format)?;
        }

        Commands::Predictions(args) => {
            cli::predictions(&workspace, &args, cli.format)?;
        }

        Commands::Features(args) => {
            cli::features(&workspace, &args, cli.format)?;
        }

        Commands::Events(args) => {
            cli::events(&workspace, args.state.as_deref(), args.limit, cli.format)?;
        }

        Commands::Status => {
            cli::status(&workspace, cli.format)?;
        }

        Commands::Retry(args) => {
            cli::retry(&workspace, args.event_id)?;
        }

        Commands::Config(args) => {
            cli::config(&workspace, &args, cli.format)?;
        }
    }

    Ok(())
}
