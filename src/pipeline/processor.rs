//! Per-event processing steps

use super::{Alert, RunSummary};
use crate::config::PipelineConfig;
use crate::error::{Disposition, PipelineError};
use crate::events::{payload, EventState, EventStatus, IssueEvent, ParsedEvent, PushEvent};
use crate::features::CausalFeatureBuilder;
use crate::inference::{Classification, InferenceAdapter};
use crate::links::LinkResolver;
use crate::model::{Commit, FeatureRecord, Prediction};
use crate::storage::{ClaimedEvent, Database, StatusUpdate};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

type Result<T> = std::result::Result<T, PipelineError>;

/// Successful end of an event's processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Persisted { predictions: usize, recomputed: usize },
    Skipped,
}

/// Runs the link, feature, inference and persistence steps for one event
pub(crate) struct Processor {
    pub(crate) db: Arc<Database>,
    pub(crate) resolver: LinkResolver,
    pub(crate) builder: CausalFeatureBuilder,
    pub(crate) inference: InferenceAdapter,
    pub(crate) config: PipelineConfig,
    pub(crate) alerts: broadcast::Sender<Alert>,
}

impl Processor {
    /// Process one repository partition sequentially, in claim order.
    ///
    /// Each event runs in its own task so a panic fails that event alone
    /// and the rest of the partition carries on.
    pub(crate) async fn run_partition(
        self: Arc<Self>,
        partition: usize,
        batch: Vec<ClaimedEvent>,
    ) -> RunSummary {
        debug!(partition, events = batch.len(), "Processing partition");

        let mut summary = RunSummary::default();
        for claimed in batch {
            let status = claimed.status.clone();
            let processor = Arc::clone(&self);
            let result = tokio::spawn(async move { processor.process(&claimed).await })
                .await
                .unwrap_or_else(|e| Err(PipelineError::Crashed(crash_message(e))));
            self.record(&status, result, &mut summary);
        }
        summary
    }

    fn record(&self, status: &EventStatus, result: Result<Outcome>, summary: &mut RunSummary) {
        match result {
            Ok(Outcome::Persisted {
                predictions,
                recomputed,
            }) => {
                summary.persisted += 1;
                summary.predictions += predictions;
                summary.recomputed += recomputed;
                self.finish(status, EventState::Persisted, None);
            }
            Ok(Outcome::Skipped) => {
                summary.skipped += 1;
            }
            Err(err) => {
                let state = self.fail(status, &err);
                match state {
                    EventState::Deferred => summary.deferred += 1,
                    EventState::Failed => summary.failed += 1,
                    EventState::Parked => summary.parked += 1,
                    _ => summary.skipped += 1,
                }
            }
        }
    }

    async fn process(&self, claimed: &ClaimedEvent) -> Result<Outcome> {
        let status = &claimed.status;

        match payload::parse(&claimed.event, &self.config.label_mapping)? {
            ParsedEvent::Push(push) => self.process_push(status, push).await,
            ParsedEvent::Issue(issue) => self.process_issue(status, issue).await,
            ParsedEvent::Ignored { reason } => {
                self.finish(status, EventState::Skipped, Some(reason));
                Ok(Outcome::Skipped)
            }
        }
    }

    async fn process_push(&self, status: &EventStatus, push: PushEvent) -> Result<Outcome> {
        for commit in &push.commits {
            self.db.upsert_commit(commit)?;
        }

        let mut pending = BTreeSet::new();
        for commit in &push.commits {
            let links = self.resolver.resolve_commit(&self.db, commit)?;
            pending.extend(
                links
                    .iter()
                    .filter(|l| l.is_pending())
                    .map(|l| l.issue_number),
            );
        }
        self.step(status, EventState::Linked)?;

        if !pending.is_empty() {
            if status.deferrals < self.config.max_deferrals {
                let numbers: Vec<String> = pending.iter().map(|n| format!("#{}", n)).collect();
                return Err(PipelineError::DataIncomplete(format!(
                    "waiting for issues {}",
                    numbers.join(", ")
                )));
            }
            warn!(
                event_id = status.event_id,
                repo = %push.repo_full_name,
                deferrals = status.deferrals,
                "Featurizing with unresolved issue links"
            );
        }

        let mut records = Vec::with_capacity(push.commits.len());
        for commit in &push.commits {
            let record = self.builder.build_commit(&self.db, commit)?;
            self.db.upsert_features(&record)?;
            records.push(record);
        }
        self.step(status, EventState::Featurized)?;

        let mut scored = Vec::new();
        for record in &records {
            if let Some(classification) = self.classify_if_stale(record).await? {
                scored.push((record, classification));
            }
        }
        self.step(status, EventState::Scored)?;

        for (record, classification) in &scored {
            self.persist(record, classification)?;
        }

        let own: BTreeSet<String> = push.commits.iter().map(|c| c.sha.clone()).collect();
        let recomputed = match push.commits.iter().map(|c| c.timestamp).min() {
            Some(since) => self.recompute_since(&push.repo_full_name, since, &own).await?,
            None => 0,
        };

        info!(
            event_id = status.event_id,
            repo = %push.repo_full_name,
            commits = push.commits.len(),
            predictions = scored.len(),
            recomputed,
            "Processed push event"
        );

        Ok(Outcome::Persisted {
            predictions: scored.len(),
            recomputed,
        })
    }

    async fn process_issue(&self, status: &EventStatus, event: IssueEvent) -> Result<Outcome> {
        let IssueEvent {
            action,
            issue,
            observed_at,
            ..
        } = event;

        if !self.db.upsert_issue(&issue, observed_at)? {
            debug!(
                repo = %issue.repo_full_name,
                number = issue.number,
                observed_at = %observed_at,
                "Kept newer issue snapshot"
            );
        }

        let resolved = self.resolver.resolve_issue(&self.db, &issue)?;
        if resolved > 0 {
            let woken = self.db.wake_deferred(&issue.repo_full_name, Utc::now())?;
            debug!(repo = %issue.repo_full_name, woken, "Woke deferred events");
        }
        self.step(status, EventState::Linked)?;

        let recomputed = self
            .recompute_since(&issue.repo_full_name, issue.created_at, &BTreeSet::new())
            .await?;

        info!(
            event_id = status.event_id,
            repo = %issue.repo_full_name,
            number = issue.number,
            action = %action,
            state = issue.state.as_str(),
            resolved,
            recomputed,
            "Processed issue event"
        );

        Ok(Outcome::Persisted {
            predictions: 0,
            recomputed,
        })
    }

    /// Rebuild features of already-featurized commits at or after `since`.
    ///
    /// Predictions are re-scored only for commits whose vector changed or
    /// whose prediction used another model version.
    async fn recompute_since(
        &self,
        repo: &str,
        since: DateTime<Utc>,
        exclude: &BTreeSet<String>,
    ) -> Result<usize> {
        let commits: Vec<Commit> = self
            .db
            .featurized_commits_since(repo, since)?
            .into_iter()
            .filter(|c| !exclude.contains(&c.sha))
            .collect();

        let mut rescored = 0;
        for commit in &commits {
            let record = self.builder.build_commit(&self.db, commit)?;
            let unchanged = self
                .db
                .get_features(&commit.sha)?
                .is_some_and(|existing| existing.vector_hash == record.vector_hash);
            if !unchanged {
                self.db.upsert_features(&record)?;
            }

            if let Some(classification) = self.classify_if_stale(&record).await? {
                self.persist(&record, &classification)?;
                rescored += 1;
            }
        }

        if rescored > 0 {
            debug!(repo, since = %since, checked = commits.len(), rescored, "Recomputed later commits");
        }

        Ok(rescored)
    }

    /// Classify a record unless its current prediction already matches
    async fn classify_if_stale(&self, record: &FeatureRecord) -> Result<Option<Classification>> {
        let model_version = self.config.model_version.as_str();

        if let Some(existing) = self.db.get_prediction(&record.commit_sha)? {
            if existing.model_version == model_version && existing.feature_hash == record.vector_hash
            {
                return Ok(None);
            }
        }

        let classification = self
            .inference
            .classify(&record.feature_vector, model_version)
            .await?;
        Ok(Some(classification))
    }

    fn persist(&self, record: &FeatureRecord, classification: &Classification) -> Result<Prediction> {
        let prediction = self.db.upsert_prediction(
            &record.commit_sha,
            &self.config.model_version,
            &record.vector_hash,
            classification,
        )?;

        debug!(
            sha = %prediction.commit_sha,
            predicted_class = %prediction.predicted_class,
            severity_score = prediction.severity_score,
            revision = prediction.revision,
            "Persisted prediction"
        );

        Ok(prediction)
    }

    fn step(&self, status: &EventStatus, state: EventState) -> Result<()> {
        self.db
            .update_event_status(status.event_id, &StatusUpdate::step(status, state))?;
        Ok(())
    }

    /// Move an event to a terminal state and release its lease
    fn finish(&self, status: &EventStatus, state: EventState, reason: Option<String>) {
        let update = StatusUpdate {
            state,
            attempts: status.attempts,
            deferrals: status.deferrals,
            reason,
            next_attempt_at: Utc::now(),
            release: true,
        };

        if let Err(e) = self.db.update_event_status(status.event_id, &update) {
            // The lease expires and the event is claimed again
            error!(event_id = status.event_id, error = %e, "Failed to record event status");
        }
    }

    /// Record a failure according to its disposition and return the new state
    fn fail(&self, status: &EventStatus, err: &PipelineError) -> EventState {
        let now = Utc::now();
        let reason = format!("{}: {}", err.reason_code(), err);
        let mut attempts = status.attempts;
        let mut deferrals = status.deferrals;

        let (state, next_attempt_at) = match err.disposition() {
            Disposition::Retry => {
                attempts += 1;
                if attempts >= self.config.retry.max_attempts {
                    (EventState::Parked, now)
                } else {
                    (EventState::Failed, now + self.backoff(attempts))
                }
            }
            Disposition::Defer => {
                deferrals += 1;
                (EventState::Deferred, now + self.backoff(deferrals))
            }
            Disposition::Park => (EventState::Parked, now),
            Disposition::Skip => (EventState::Skipped, now),
        };

        match state {
            EventState::Parked => self.alert(status, err.reason_code(), &reason),
            EventState::Skipped => warn!(event_id = status.event_id, %reason, "Skipping event"),
            EventState::Deferred => debug!(
                event_id = status.event_id,
                deferrals,
                %reason,
                "Deferred event"
            ),
            _ => warn!(
                event_id = status.event_id,
                attempts,
                %reason,
                "Event failed, will retry"
            ),
        }

        let update = StatusUpdate {
            state,
            attempts,
            deferrals,
            reason: Some(reason),
            next_attempt_at,
            release: true,
        };
        if let Err(e) = self.db.update_event_status(status.event_id, &update) {
            error!(event_id = status.event_id, error = %e, "Failed to record event status");
        }

        state
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.config.retry.backoff(attempt);
        Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64)
    }

    fn alert(&self, status: &EventStatus, code: &'static str, message: &str) {
        let alert = Alert {
            event_id: status.event_id,
            repo_full_name: status.repo_full_name.clone(),
            code,
            message: message.to_string(),
        };

        error!(
            target: "bugsage::alert",
            event_id = alert.event_id,
            repo = %alert.repo_full_name,
            code,
            message,
            "Event parked"
        );

        // No subscribers is fine; the log line is the durable record
        let _ = self.alerts.send(alert);
    }
}

fn crash_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }

    let panic = err.into_panic();
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}
