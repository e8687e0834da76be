//! Pipeline coordinator
//!
//! Consumes the Event Store and drives each event through
//! `received -> linked -> featurized -> scored -> persisted`.
//!
//! Each pass of the coordinator:
//! 1. registers events appended since the stored cursor
//! 2. claims due events under a lease, ordered by event timestamp
//! 3. partitions them by repository across the worker pool
//! 4. processes each partition sequentially while partitions run concurrently
//!
//! Events of one repository always land in the same partition, so they are
//! handled in timestamp order. Every step is an idempotent upsert, so an
//! event abandoned mid-way is safe to claim again once its lease expires.

mod processor;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::events::{payload, Event, EventId, EventState, EventStatus, ParsedEvent};
use crate::features::CausalFeatureBuilder;
use crate::inference::{InferenceAdapter, ModelStore};
use crate::links::LinkResolver;
use crate::storage::{ClaimedEvent, Database};
use chrono::{Duration, Utc};
use processor::Processor;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Capacity of the in-process alert channel
const ALERT_CHANNEL_CAPACITY: usize = 64;

/// Operational alert raised when an event is parked
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub event_id: EventId,
    pub repo_full_name: String,
    /// Error kind, e.g. `ModelUnavailable`
    pub code: &'static str,
    pub message: String,
}

/// Counters for one or more coordinator passes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Newly registered events
    pub ingested: usize,
    pub claimed: usize,
    pub persisted: usize,
    pub deferred: usize,
    pub failed: usize,
    pub parked: usize,
    pub skipped: usize,
    /// Predictions written for the events' own commits
    pub predictions: usize,
    /// Predictions rewritten for later commits after a late arrival
    pub recomputed: usize,
}

impl RunSummary {
    fn merge(&mut self, other: RunSummary) {
        self.ingested += other.ingested;
        self.claimed += other.claimed;
        self.persisted += other.persisted;
        self.deferred += other.deferred;
        self.failed += other.failed;
        self.parked += other.parked;
        self.skipped += other.skipped;
        self.predictions += other.predictions;
        self.recomputed += other.recomputed;
    }

    fn is_idle(&self) -> bool {
        self.ingested == 0 && self.claimed == 0
    }
}

/// Drives events from the Event Store to the Prediction Store
pub struct Coordinator {
    processor: Arc<Processor>,
}

impl Coordinator {
    pub fn new(db: Arc<Database>, models: Arc<dyn ModelStore>, config: PipelineConfig) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);

        info!(
            model_version = %config.model_version,
            workers = config.workers,
            windows = config.windows.len(),
            "Creating pipeline coordinator"
        );

        let processor = Processor {
            db,
            resolver: LinkResolver::new(),
            builder: CausalFeatureBuilder::new(config.windows.clone()),
            inference: InferenceAdapter::new(models, config.inference_timeout()),
            config,
            alerts,
        };

        Self {
            processor: Arc::new(processor),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.processor.db
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.processor.config
    }

    /// Receive alerts for parked events
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.processor.alerts.subscribe()
    }

    /// Register events appended since the last pass.
    ///
    /// Unknown event types and malformed payloads are registered directly
    /// as `skipped` with the reason recorded.
    pub fn ingest(&self) -> Result<usize, PipelineError> {
        let db = &self.processor.db;
        let mut reader = db.read_from(db.event_cursor()?)?;

        let mut registered = 0;
        for event in reader.by_ref() {
            let status = self.initial_status(&event?);
            if db.register_event(&status)? {
                registered += 1;
            }
        }
        db.set_event_cursor(reader.cursor())?;

        if registered > 0 {
            debug!(registered, cursor = reader.cursor(), "Registered new events");
        }

        Ok(registered)
    }

    fn initial_status(&self, event: &Event) -> EventStatus {
        let now = Utc::now();
        let fallback_repo = event.repo_full_name().unwrap_or_default().to_string();

        let (state, repo_full_name, event_ts, reason) =
            match payload::parse(event, &self.processor.config.label_mapping) {
                Ok(ParsedEvent::Ignored { reason }) => {
                    debug!(event_id = event.id, %reason, "Ignoring event");
                    (EventState::Skipped, fallback_repo, event.received_at, Some(reason))
                }
                Ok(parsed) => (
                    EventState::Received,
                    parsed
                        .repo_full_name()
                        .map(str::to_string)
                        .unwrap_or(fallback_repo),
                    parsed.ordering_timestamp().unwrap_or(event.received_at),
                    None,
                ),
                Err(e) => {
                    let err = PipelineError::from(e);
                    warn!(event_id = event.id, error = %err, "Skipping malformed event");
                    (
                        EventState::Skipped,
                        fallback_repo,
                        event.received_at,
                        Some(format!("{}: {}", err.reason_code(), err)),
                    )
                }
            };

        EventStatus {
            event_id: event.id,
            event_type: event.event_type.clone(),
            repo_full_name,
            event_ts,
            state,
            attempts: 0,
            deferrals: 0,
            reason,
            next_attempt_at: now,
            lease_until: None,
            updated_at: now,
        }
    }

    /// Run one coordinator pass
    pub async fn run_once(&self) -> Result<RunSummary, PipelineError> {
        let ingested = self.ingest()?;
        let config = &self.processor.config;

        let now = Utc::now();
        let lease_until = now + Duration::milliseconds(config.lease_ms as i64);
        let claimed = self
            .processor
            .db
            .claim_due_events(now, lease_until, config.batch_size)?;

        let mut summary = RunSummary {
            ingested,
            claimed: claimed.len(),
            ..RunSummary::default()
        };
        if claimed.is_empty() {
            return Ok(summary);
        }

        let mut set = JoinSet::new();
        for (partition, batch) in partition_by_repo(claimed, config.workers)
            .into_iter()
            .enumerate()
        {
            if batch.is_empty() {
                continue;
            }
            let processor = Arc::clone(&self.processor);
            set.spawn(async move { processor.run_partition(partition, batch).await });
        }

        while let Some(result) = set.join_next().await {
            match result {
                Ok(partial) => summary.merge(partial),
                // Unclaimed remainder of the partition is reclaimed once its lease expires
                Err(e) => error!(error = %e, "Partition task failed"),
            }
        }

        info!(
            claimed = summary.claimed,
            persisted = summary.persisted,
            deferred = summary.deferred,
            failed = summary.failed,
            parked = summary.parked,
            "Coordinator pass complete"
        );

        Ok(summary)
    }

    /// Run passes until nothing is left to ingest or claim.
    ///
    /// Events waiting out a backoff are left for a later run.
    pub async fn run_until_idle(&self) -> Result<RunSummary, PipelineError> {
        let mut total = RunSummary::default();
        loop {
            let pass = self.run_once().await?;
            total.merge(pass);
            if pass.is_idle() {
                return Ok(total);
            }
        }
    }

    /// Poll the Event Store until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F) -> Result<(), PipelineError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(self.processor.config.poll_interval());

        info!(
            poll_interval_ms = self.processor.config.poll_interval_ms,
            "Pipeline running"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Pipeline shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(_) => {}
                        Err(PipelineError::TransientStorage(e)) => {
                            warn!(error = %e, "Coordinator pass hit a busy database, retrying");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Return a parked or failed event to the queue
    pub fn retry(&self, event_id: EventId) -> Result<bool, PipelineError> {
        let requeued = self.processor.db.requeue_event(event_id, Utc::now())?;
        if requeued {
            info!(event_id, "Requeued event");
        }
        Ok(requeued)
    }
}

/// Split claimed events into `workers` partitions by repository, keeping
/// claim order within each partition
fn partition_by_repo(claimed: Vec<ClaimedEvent>, workers: usize) -> Vec<Vec<ClaimedEvent>> {
    let workers = workers.max(1);
    let mut partitions: Vec<Vec<ClaimedEvent>> = (0..workers).map(|_| Vec::new()).collect();

    for event in claimed {
        let index = partition_index(&event.status.repo_full_name, workers);
        partitions[index].push(event);
    }

    partitions
}

fn partition_index(repo_full_name: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    repo_full_name.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}
