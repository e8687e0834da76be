//! Issue import from the GitHub REST API
//!
//! Historic issues become synthetic `issues` events: one `opened` event per
//! issue, plus a `closed` event for issues that are closed now. The events
//! then flow through the pipeline like live deliveries, so commits
//! backfilled from Git resolve their issue references.

use crate::events::{EventId, NewEvent};
use crate::storage::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, LINK, USER_AGENT};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Public GitHub API
pub const DEFAULT_API_URL: &str = "https://api.github.com";

const PAGE_SIZE: usize = 100;

/// Wait when a rate-limited response has no reset time
const RATE_LIMIT_FALLBACK: Duration = Duration::from_secs(60);

const RATE_LIMIT_MIN_WAIT: Duration = Duration::from_secs(5);

/// Rate-limit waits allowed per page before giving up
const MAX_RATE_LIMIT_WAITS: usize = 3;

/// Client for the issue listing endpoint
pub struct GitHubClient {
    api_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl GitHubClient {
    pub fn new(api_url: &str, token: Option<&str>) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()).map(str::to_string),
            client: reqwest::Client::new(),
        }
    }

    /// Fetch up to `limit` issues of a repository in every state, following
    /// the `Link` header across pages. Pull requests are included; callers
    /// filter them out.
    pub async fn fetch_issues(&self, repo_full_name: &str, limit: usize) -> Result<Vec<Value>> {
        let mut url = Some(format!(
            "{}/repos/{}/issues?state=all&per_page={}",
            self.api_url, repo_full_name, PAGE_SIZE
        ));
        let mut items = Vec::new();

        while let Some(page_url) = url.take() {
            if items.len() >= limit {
                break;
            }

            let response = self.get(&page_url).await?;
            url = response
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(next_link);

            let page: Vec<Value> = response
                .json()
                .await
                .context("Failed to parse issues response")?;
            debug!(repo = %repo_full_name, items = page.len(), "Fetched issue page");

            let remaining = limit - items.len();
            items.extend(page.into_iter().take(remaining));
        }

        info!(repo = %repo_full_name, issues = items.len(), "Fetched issues");
        Ok(items)
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let mut waits = 0;

        loop {
            let mut request = self
                .client
                .get(url)
                .header(ACCEPT, "application/vnd.github+json")
                .header(USER_AGENT, concat!("bugsage/", env!("CARGO_PKG_VERSION")));
            if let Some(token) = &self.token {
                request = request.header(AUTHORIZATION, format!("token {}", token));
            }

            let response = request
                .send()
                .await
                .with_context(|| format!("Failed to send request to {}", url))?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let reset = response
                .headers()
                .get("x-ratelimit-reset")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();

            let limited = matches!(status, StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS)
                && body.to_lowercase().contains("rate limit");
            if limited && waits < MAX_RATE_LIMIT_WAITS {
                waits += 1;
                let wait = rate_limit_wait(reset.as_deref(), Utc::now());
                warn!(
                    wait_secs = wait.as_secs(),
                    attempt = waits,
                    "GitHub rate limit reached, waiting"
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            anyhow::bail!("GitHub request failed: {} - {}", status, body);
        }
    }
}

/// Target of the `rel="next"` entry of a `Link` header
pub fn next_link(header: &str) -> Option<String> {
    header
        .split(',')
        .find(|part| part.contains("rel=\"next\""))
        .and_then(|part| {
            let start = part.find('<')? + 1;
            let end = part.find('>')?;
            (start < end).then(|| part[start..end].to_string())
        })
}

/// Time to wait until the rate limit resets, given the epoch seconds of the
/// `X-RateLimit-Reset` header
fn rate_limit_wait(reset: Option<&str>, now: DateTime<Utc>) -> Duration {
    match reset.and_then(|r| r.trim().parse::<i64>().ok()) {
        Some(reset) => {
            let secs = u64::try_from(reset - now.timestamp()).unwrap_or(0);
            Duration::from_secs(secs).max(RATE_LIMIT_MIN_WAIT)
        }
        None => RATE_LIMIT_FALLBACK,
    }
}

/// Read a JSON array of GitHub issue objects
pub fn read_issues_file(path: &Path) -> Result<Vec<Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read issues file {:?}", path))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Issues file {:?} is not a JSON array", path))
}

/// Turn GitHub issue objects into `issues` events.
///
/// The `opened` event carries the issue as it was at creation, open and
/// without a close time. Pull requests are dropped.
pub fn issue_events(repo_full_name: &str, items: &[Value]) -> Vec<NewEvent> {
    let mut events = Vec::new();

    for item in items {
        if item.get("pull_request").is_some() {
            continue;
        }

        let mut opened = item.clone();
        if let Some(issue) = opened.as_object_mut() {
            let created_at = issue.get("created_at").cloned().unwrap_or(Value::Null);
            issue.insert("state".to_string(), json!("open"));
            issue.insert("closed_at".to_string(), Value::Null);
            issue.insert("updated_at".to_string(), created_at);
        }
        events.push(issues_event(repo_full_name, "opened", opened));

        if item.get("state").and_then(Value::as_str) == Some("closed") {
            events.push(issues_event(repo_full_name, "closed", item.clone()));
        }
    }

    events
}

fn issues_event(repo_full_name: &str, action: &str, issue: Value) -> NewEvent {
    let delivery_id = format!("backfill-{}", uuid::Uuid::new_v4());
    NewEvent::new(
        "issues",
        json!({
            "action": action,
            "repository": { "full_name": repo_full_name },
            "issue": issue,
        }),
    )
    .with_delivery_id(&delivery_id)
}

/// Append issue events for `items` to the Event Store.
///
/// Returns the ids of the appended events.
pub fn backfill_issues(
    db: &Database,
    repo_full_name: &str,
    items: &[Value],
) -> Result<Vec<EventId>> {
    let events = issue_events(repo_full_name, items);
    let mut ids = Vec::with_capacity(events.len());
    for event in &events {
        ids.push(
            db.append_event(event)
                .context("Failed to append backfill event")?,
        );
    }

    info!(
        repo = %repo_full_name,
        issues = items.len(),
        events = ids.len(),
        "Backfilled issues"
    );

    Ok(ids)
}
