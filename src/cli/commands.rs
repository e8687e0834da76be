//! Command implementations

use super::{BackfillArgs, ConfigArgs, FeaturesArgs, OutputFormat, PredictionsArgs};
use crate::config::{PipelineConfig, Workspace};
use crate::events::{EventId, EventState, NewEvent};
use crate::features::CausalFeatureBuilder;
use crate::inference::ArtifactStore;
use crate::model::Prediction;
use crate::pipeline::{Coordinator, RunSummary};
use crate::repo::{self, GitHistory, GitHubClient};
use crate::storage::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Open a workspace and apply command-line overrides
pub fn open_workspace(
    path: &Path,
    database: Option<&Path>,
    model_version: Option<&str>,
) -> Result<Workspace> {
    let mut workspace = Workspace::open(path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))?;

    if let Some(database) = database {
        let database = if database.is_absolute() {
            database.to_path_buf()
        } else {
            std::env::current_dir()?.join(database)
        };
        workspace.config_mut().database = database;
    }
    if let Some(version) = model_version {
        workspace.config_mut().model_version = version.to_string();
    }

    Ok(workspace)
}

fn open_database(workspace: &Workspace) -> Result<Arc<Database>> {
    if !workspace.is_initialized() {
        anyhow::bail!("BugSage not initialized. Run 'bugsage init' first.");
    }

    let db_path = workspace.database_path();
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database {:?}", db_path))?;
    Ok(Arc::new(db))
}

fn coordinator(workspace: &Workspace) -> Result<Coordinator> {
    workspace.config().validate()?;
    let db = open_database(workspace)?;
    let models = Arc::new(ArtifactStore::new(workspace.model_dir()));
    Ok(Coordinator::new(db, models, workspace.config().clone()))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid RFC 3339 timestamp: {}", value))?
        .with_timezone(&Utc))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

/// Initialize a BugSage workspace
pub fn init(workspace: &Workspace, force: bool) -> Result<()> {
    if workspace.is_initialized() && !force {
        anyhow::bail!("BugSage already initialized. Use --force to re-initialize.");
    }

    let data_dir = workspace.init_data_dir()?;
    let db_path = workspace.database_path();
    let _db = Database::open(&db_path)
        .with_context(|| format!("Failed to create database {:?}", db_path))?;

    workspace.config().save(workspace.root())?;

    println!("✓ Initialized BugSage in {:?}", workspace.root());
    println!("  Database: {:?}", db_path);
    println!("  Models: {:?}", workspace.model_dir());
    println!("  Config: {:?}", data_dir.join("config.toml"));

    Ok(())
}

/// Append a payload file to the Event Store
pub fn ingest(
    workspace: &Workspace,
    event_type: &str,
    file: &Path,
    delivery_id: Option<&str>,
    format: OutputFormat,
) -> Result<EventId> {
    let db = open_database(workspace)?;

    let content =
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {:?}", file))?;
    let payload: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("{:?} is not valid JSON", file))?;

    // Hand-fed payloads get a generated delivery id so the audit trail stays complete
    let delivery_id = delivery_id
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let event = NewEvent::new(event_type, payload).with_delivery_id(&delivery_id);
    let id = db.append_event(&event)?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "event_id": id }))?,
        OutputFormat::Text => println!("✓ Stored {} event {}", event_type, id),
    }

    Ok(id)
}

/// Run the pipeline once or until interrupted
pub async fn run(workspace: &Workspace, once: bool, format: OutputFormat) -> Result<()> {
    let coordinator = coordinator(workspace)?;

    if once {
        let summary = coordinator.run_until_idle().await?;
        match format {
            OutputFormat::Json => print_json(&summary)?,
            OutputFormat::Text => print_summary_text(&summary),
        }
        return Ok(());
    }

    println!("Running pipeline. Press Ctrl+C to stop.");
    coordinator
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                // Without a handler the process runs until it is killed
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}

fn print_summary_text(summary: &RunSummary) {
    println!("Pipeline Run");
    println!("============\n");
    println!("Ingested: {}", summary.ingested);
    println!("Claimed: {}", summary.claimed);
    println!("Persisted: {}", summary.persisted);
    println!("Deferred: {}", summary.deferred);
    println!("Failed: {}", summary.failed);
    println!("Parked: {}", summary.parked);
    println!("Skipped: {}", summary.skipped);
    println!("Predictions: {}", summary.predictions);
    println!("Recomputed: {}", summary.recomputed);
}

/// Append local Git history as push events
pub async fn backfill(
    workspace: &Workspace,
    args: &BackfillArgs,
    format: OutputFormat,
) -> Result<()> {
    if args.git.is_none() && !args.issues && args.issues_file.is_none() {
        anyhow::bail!("Nothing to backfill. Pass --git, --issues or --issues-file.");
    }

    let db = open_database(workspace)?;
    let since = args.since.as_deref().map(parse_time).transpose()?;
    let mut report = BackfillReport::default();

    if let Some(git) = &args.git {
        let history = GitHistory::open(git)?;
        report.push_events = repo::backfill(&db, &history, &args.repo, since, args.batch_size)?;
    }

    let issues = match &args.issues_file {
        Some(path) => Some(repo::read_issues_file(path)?),
        None if args.issues => {
            let client = GitHubClient::new(&args.github_api, args.github_token.as_deref());
            Some(client.fetch_issues(&args.repo, args.issue_limit).await?)
        }
        None => None,
    };
    if let Some(items) = issues {
        report.issue_events = repo::backfill_issues(&db, &args.repo, &items)?;
    }

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => {
            println!(
                "✓ Appended {} push event(s) and {} issue event(s) for {}",
                report.push_events.len(),
                report.issue_events.len(),
                args.repo
            );
            println!("  Run 'bugsage run --once' to process them.");
        }
    }

    Ok(())
}

#[derive(Debug, Default, Serialize)]
struct BackfillReport {
    push_events: Vec<EventId>,
    issue_events: Vec<EventId>,
}

/// Show the latest prediction of a commit
pub fn prediction(workspace: &Workspace, sha: &str, format: OutputFormat) -> Result<()> {
    let db = open_database(workspace)?;

    let Some(prediction) = db.get_prediction(sha)? else {
        anyhow::bail!("No prediction for commit {}", sha);
    };

    match format {
        OutputFormat::Json => print_json(&prediction)?,
        OutputFormat::Text => print_prediction_text(&prediction),
    }

    Ok(())
}

/// List predictions of a repository
pub fn predictions(workspace: &Workspace, args: &PredictionsArgs, format: OutputFormat) -> Result<()> {
    let db = open_database(workspace)?;
    let since = args.since.as_deref().map(parse_time).transpose()?;
    let until = args.until.as_deref().map(parse_time).transpose()?;

    let predictions = db.list_predictions(&args.repo, since, until, args.limit)?;

    match format {
        OutputFormat::Json => print_json(&predictions)?,
        OutputFormat::Text => {
            if predictions.is_empty() {
                println!("No predictions for {}.", args.repo);
            }
            for prediction in &predictions {
                print_prediction_text(prediction);
            }
        }
    }

    Ok(())
}

fn print_prediction_text(prediction: &Prediction) {
    let icon = match prediction.predicted_class.as_str() {
        "critical" => "🔴",
        "high" => "🟠",
        "medium" => "🟡",
        _ => "🟢",
    };

    println!(
        "{} [{}] {}",
        icon, prediction.predicted_class, prediction.commit_sha
    );
    println!("   Severity score: {:.3}", prediction.severity_score);
    println!(
        "   Model: {} (revision {})",
        prediction.model_version, prediction.revision
    );
    println!("   Created: {}", prediction.created_at.to_rfc3339());
    for (class, probability) in &prediction.probability_distribution {
        println!("     {:<10} {:.3}", class, probability);
    }
    println!();
}

/// Show a stored commit vector or compute an issue vector
pub fn features(workspace: &Workspace, args: &FeaturesArgs, format: OutputFormat) -> Result<()> {
    let db = open_database(workspace)?;

    let (title, vector) = match (&args.sha, args.issue, &args.repo) {
        (_, Some(number), Some(repo)) => {
            let issue = db
                .find_issue(repo, number)?
                .with_context(|| format!("No issue #{} in {}", number, repo))?;
            let builder = CausalFeatureBuilder::new(workspace.config().windows.clone());
            (
                format!("Issue {}#{}", repo, number),
                builder.build_issue(&db, &issue)?,
            )
        }
        (Some(sha), _, _) => {
            let record = db
                .get_features(sha)?
                .with_context(|| format!("No features recorded for commit {}", sha))?;
            if format == OutputFormat::Json {
                return print_json(&record);
            }
            println!("Vector hash: {}", record.vector_hash);
            println!("Generated: {}", record.generated_at.to_rfc3339());
            (format!("Commit {}", sha), record.feature_vector)
        }
        _ => anyhow::bail!("Pass a commit SHA or --issue with --repo"),
    };

    match format {
        OutputFormat::Json => print_json(&vector)?,
        OutputFormat::Text => {
            println!("{}", title);
            println!("{}\n", "=".repeat(title.chars().count()));
            for (name, value) in &vector {
                println!("  {:<36} {}", name, value);
            }
        }
    }

    Ok(())
}

/// List events with their pipeline state
pub fn events(
    workspace: &Workspace,
    state: Option<&str>,
    limit: usize,
    format: OutputFormat,
) -> Result<()> {
    let db = open_database(workspace)?;
    let state = state
        .map(|s| {
            EventState::parse(s).with_context(|| {
                let known: Vec<&str> = EventState::ALL.iter().map(|s| s.as_str()).collect();
                format!("Unknown state {:?} (expected one of {})", s, known.join(", "))
            })
        })
        .transpose()?;

    let statuses = db.list_event_statuses(state, limit)?;

    match format {
        OutputFormat::Json => print_json(&statuses)?,
        OutputFormat::Text => {
            if statuses.is_empty() {
                println!("No events.");
            }
            for status in &statuses {
                println!(
                    "#{:<6} {:<8} {:<11} {}",
                    status.event_id, status.event_type, status.state.as_str(), status.repo_full_name
                );
                println!(
                    "        at {}  attempts {}  deferrals {}",
                    status.event_ts.to_rfc3339(),
                    status.attempts,
                    status.deferrals
                );
                if let Some(reason) = &status.reason {
                    println!("        {}", reason);
                }
            }
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    stats: crate::storage::DatabaseStats,
    states: std::collections::BTreeMap<EventState, usize>,
}

/// Show store counts and events per state
pub fn status(workspace: &Workspace, format: OutputFormat) -> Result<()> {
    let db = open_database(workspace)?;
    let report = StatusReport {
        stats: db.get_stats()?,
        states: db.count_event_states()?,
    };

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => {
            let stats = &report.stats;
            println!("BugSage Status");
            println!("==============\n");
            println!("Workspace: {:?}", workspace.root());
            println!("Model version: {}", workspace.config().model_version);
            println!("Events: {}", stats.events);
            println!("Commits: {}", stats.commits);
            println!("Issues: {}", stats.issues);
            println!("Links: {} ({} pending)", stats.links, stats.pending_links);
            println!("Feature records: {}", stats.features);
            println!("Predictions: {}", stats.predictions);

            println!("\nEvents by state:");
            for state in EventState::ALL {
                let count = report.states.get(&state).copied().unwrap_or(0);
                if count > 0 {
                    println!("  {:<11} {}", state.as_str(), count);
                }
            }
        }
    }

    Ok(())
}

/// Requeue a parked or failed event
pub fn retry(workspace: &Workspace, event_id: EventId) -> Result<()> {
    let coordinator = coordinator(workspace)?;

    if coordinator.retry(event_id)? {
        println!("✓ Event {} requeued", event_id);
        Ok(())
    } else {
        anyhow::bail!("Event {} is not parked or failed", event_id)
    }
}

/// Show, query or reset configuration
pub fn config(workspace: &Workspace, args: &ConfigArgs, format: OutputFormat) -> Result<()> {
    let config = workspace.config();

    if args.reset {
        PipelineConfig::default().save(workspace.root())?;
        println!("✓ Configuration reset to defaults");
        return Ok(());
    }

    if let Some(key) = &args.get {
        let value = match key.as_str() {
            "database" => workspace.database_path().display().to_string(),
            "model_dir" => workspace.model_dir().display().to_string(),
            "model_version" => config.model_version.clone(),
            "workers" => config.workers.to_string(),
            "batch_size" => config.batch_size.to_string(),
            "poll_interval_ms" => config.poll_interval_ms.to_string(),
            "inference_timeout_ms" => config.inference_timeout_ms.to_string(),
            "lease_ms" => config.lease_ms.to_string(),
            "max_deferrals" => config.max_deferrals.to_string(),
            "retry.max_attempts" => config.retry.max_attempts.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        };
        println!("{}", value);
        return Ok(());
    }

    match format {
        OutputFormat::Json => print_json(config)?,
        OutputFormat::Text => {
            println!("BugSage Configuration");
            println!("=====================\n");
            print!("{}", toml::to_string_pretty(config)?);
        }
    }

    Ok(())
}
