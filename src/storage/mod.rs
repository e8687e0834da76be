//! SQLite storage layer for BugSage
//!
//! This module handles persistent storage of:
//! - The append-only Event Store and per-event pipeline status
//! - Commits, issues and their cross-links
//! - Feature records and predictions
//!
//! Every write is an upsert keyed by the row's primary key, so concurrent
//! writers from different repository partitions never need row locks. The
//! connection mutex is only held inside these synchronous calls, never
//! across an `.await`.

mod entities;
mod events;
mod results;
mod schema;

pub use entities::{CommitPoint, FileTouch, IssuePoint, LinkedIssue};
pub use events::{ClaimedEvent, EventReader, StatusUpdate};
pub use schema::SCHEMA;

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, ErrorCode};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Errors raised by the storage layer
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

impl StorageError {
    /// Whether retrying the operation later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    fn corrupt(table: &'static str, detail: impl Into<String>) -> Self {
        StorageError::Corrupt {
            table,
            detail: detail.into(),
        }
    }
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Database connection wrapper
pub struct Database {
    conn: Mutex<Connection>,
    /// Last timestamp handed out for prediction rows
    last_issued: Mutex<DateTime<Utc>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        Self::initialize(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn)
    }

    /// Initialize the database schema
    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            last_issued: Mutex::new(DateTime::<Utc>::MIN_UTC),
        })
    }

    /// A panic while the lock was held leaves the connection usable, since
    /// open transactions roll back when dropped
    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        Ok(self.conn.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Issue a timestamp strictly greater than any previously issued one,
    /// at the microsecond precision timestamps are stored with
    fn monotonic_now(&self) -> Result<DateTime<Utc>> {
        let mut last = self.last_issued.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now().trunc_subsecs(6);
        let next = if now > *last {
            now
        } else {
            *last + Duration::microseconds(1)
        };
        *last = next;
        Ok(next)
    }

    // ==================== Statistics ====================

    /// Get database statistics
    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let conn = self.conn()?;
        let count = |table: &str| -> Result<usize> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })?;
            Ok(n as usize)
        };

        let pending_links: i64 = conn.query_row(
            "SELECT COUNT(*) FROM commit_issue_link WHERE issue_id IS NULL",
            [],
            |row| row.get(0),
        )?;

        Ok(DatabaseStats {
            events: count("events")?,
            commits: count("commits")?,
            issues: count("issues")?,
            links: count("commit_issue_link")?,
            pending_links: pending_links as usize,
            features: count("features")?,
            predictions: count("predictions")?,
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseStats {
    pub events: usize,
    pub commits: usize,
    pub issues: usize,
    pub links: usize,
    pub pending_links: usize,
    pub features: usize,
    pub predictions: usize,
}

/// Format a timestamp for storage
pub(crate) fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp
pub(crate) fn parse_ts(table: &'static str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::corrupt(table, format!("bad timestamp {:?}: {}", value, e)))
}

fn parse_opt_ts(table: &'static str, value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(table, &v)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_database_creation() {
        let db = Database::open_in_memory().unwrap();
        let stats = db.get_stats().unwrap();
        assert_eq!(stats.events, 0);
        assert_eq!(stats.commits, 0);
        assert_eq!(stats.predictions, 0);
    }

    #[test]
    fn test_timestamp_format_orders_lexically() {
        let early = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap() + Duration::microseconds(5);
        assert!(ts(&early) < ts(&late));
        assert_eq!(parse_ts("test", &ts(&late)).unwrap(), late);
    }

    #[test]
    fn test_monotonic_clock() {
        let db = Database::open_in_memory().unwrap();
        let mut previous = db.monotonic_now().unwrap();
        for _ in 0..100 {
            let next = db.monotonic_now().unwrap();
            assert!(next > previous);
            previous = next;
        }
    }
}
