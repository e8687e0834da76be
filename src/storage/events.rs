//! Event Store and event status persistence

use super::{parse_opt_ts, parse_ts, ts, Database, Result, StorageError};
use crate::events::{Event, EventId, EventState, EventStatus, NewEvent};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::{BTreeMap, VecDeque};

/// Number of events fetched per page by [`EventReader`]
const PAGE_SIZE: usize = 128;

const STATUS_COLUMNS: &str = "event_id, event_type, repo_full_name, event_ts, state, attempts, \
     deferrals, reason, next_attempt_at, lease_until, updated_at";

/// An event claimed for processing together with its status
#[derive(Debug, Clone)]
pub struct ClaimedEvent {
    pub event: Event,
    pub status: EventStatus,
}

/// New values written by a status transition
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub state: EventState,
    pub attempts: u32,
    pub deferrals: u32,
    pub reason: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    /// Clear the processing lease (the worker is done with the event)
    pub release: bool,
}

impl StatusUpdate {
    /// Intermediate step transition that keeps counters and lease
    pub fn step(status: &EventStatus, state: EventState) -> Self {
        Self {
            state,
            attempts: status.attempts,
            deferrals: status.deferrals,
            reason: None,
            next_attempt_at: status.next_attempt_at,
            release: false,
        }
    }
}

/// Lazy, restartable reader over the Event Store.
///
/// The reader is bounded by the last event id present when it was created,
/// so it is finite even while new events keep arriving.
pub struct EventReader<'a> {
    db: &'a Database,
    cursor: EventId,
    upper: EventId,
    buffer: VecDeque<Event>,
}

impl<'a> EventReader<'a> {
    /// Id of the last event returned; pass to [`Database::read_from`] to resume
    pub fn cursor(&self) -> EventId {
        self.cursor
    }
}

impl<'a> Iterator for EventReader<'a> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if self.cursor >= self.upper {
                return None;
            }
            match self.db.events_page(self.cursor, self.upper, PAGE_SIZE) {
                Ok(page) if page.is_empty() => {
                    self.cursor = self.upper;
                    return None;
                }
                Ok(page) => self.buffer.extend(page),
                Err(e) => return Some(Err(e)),
            }
        }

        let event = self.buffer.pop_front()?;
        self.cursor = event.id;
        Some(Ok(event))
    }
}

impl Database {
    // ==================== Event Store ====================

    /// Append an event to the log, returning its id
    pub fn append_event(&self, event: &NewEvent) -> Result<EventId> {
        let payload = serde_json::to_string(&event.payload)?;
        let conn = self.conn()?;

        conn.execute(
            "INSERT INTO events (event_type, delivery_id, payload, received_at) VALUES (?1, ?2, ?3, ?4)",
            params![event.event_type, event.delivery_id, payload, ts(&Utc::now())],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Get an event by id
    pub fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, event_type, delivery_id, payload, received_at FROM events WHERE id = ?1",
                params![id],
                EventRow::from_row,
            )
            .optional()?;

        row.map(EventRow::into_event).transpose()
    }

    /// Read events inserted after `cursor`, in insertion order
    pub fn read_from(&self, cursor: EventId) -> Result<EventReader<'_>> {
        let upper: i64 = self.conn()?.query_row(
            "SELECT COALESCE(MAX(id), 0) FROM events",
            [],
            |row| row.get(0),
        )?;

        Ok(EventReader {
            db: self,
            cursor,
            upper,
            buffer: VecDeque::new(),
        })
    }

    fn events_page(&self, after: EventId, upper: EventId, limit: usize) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, event_type, delivery_id, payload, received_at
            FROM events WHERE id > ?1 AND id <= ?2
            ORDER BY id LIMIT ?3
            "#,
        )?;

        let rows = stmt.query_map(params![after, upper, limit as i64], EventRow::from_row)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?.into_event()?);
        }

        Ok(events)
    }

    /// Get the coordinator's persisted read position
    pub fn event_cursor(&self) -> Result<EventId> {
        let cursor = self
            .conn()?
            .query_row(
                "SELECT last_event_id FROM pipeline_cursor WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        Ok(cursor.unwrap_or(0))
    }

    /// Persist the coordinator's read position
    pub fn set_event_cursor(&self, cursor: EventId) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO pipeline_cursor (id, last_event_id, updated_at) VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                last_event_id = excluded.last_event_id,
                updated_at = excluded.updated_at
            "#,
            params![cursor, ts(&Utc::now())],
        )?;
        Ok(())
    }

    // ==================== Event Status ====================

    /// Record the initial status of an event. Returns `false` if the event
    /// was already registered.
    pub fn register_event(&self, status: &EventStatus) -> Result<bool> {
        let inserted = self.conn()?.execute(
            r#"
            INSERT OR IGNORE INTO event_status (
                event_id, event_type, repo_full_name, event_ts, state, attempts,
                deferrals, reason, next_attempt_at, lease_until, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                status.event_id,
                status.event_type,
                status.repo_full_name,
                ts(&status.event_ts),
                status.state.as_str(),
                status.attempts,
                status.deferrals,
                status.reason,
                ts(&status.next_attempt_at),
                status.lease_until.as_ref().map(ts),
                ts(&status.updated_at),
            ],
        )?;

        Ok(inserted > 0)
    }

    /// Claim up to `limit` due, non-terminal events whose lease is free.
    ///
    /// Claimed events are ordered by their payload timestamp, then by id.
    /// An event whose worker vanished becomes claimable again once its
    /// lease expires.
    pub fn claim_due_events(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimedEvent>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now_str = ts(&now);

        let claimed = {
            let mut stmt = tx.prepare(
                r#"
                SELECT s.event_id, s.event_type, s.repo_full_name, s.event_ts, s.state,
                       s.attempts, s.deferrals, s.reason, s.next_attempt_at, s.lease_until,
                       s.updated_at, e.delivery_id, e.payload, e.received_at
                FROM event_status s JOIN events e ON e.id = s.event_id
                WHERE s.state NOT IN ('persisted', 'parked', 'skipped')
                  AND s.next_attempt_at <= ?1
                  AND (s.lease_until IS NULL OR s.lease_until <= ?1)
                ORDER BY s.event_ts, s.event_id
                LIMIT ?2
                "#,
            )?;

            let rows = stmt.query_map(params![now_str, limit as i64], |row| {
                let status = StatusRow::from_row(row)?;
                let event = EventRow {
                    id: status.event_id,
                    event_type: status.event_type.clone(),
                    delivery_id: row.get(11)?,
                    payload: row.get(12)?,
                    received_at: row.get(13)?,
                };
                Ok((status, event))
            })?;

            let mut claimed = Vec::new();
            for row in rows {
                let (status, event) = row?;
                let mut status = status.into_status()?;
                status.lease_until = Some(lease_until);
                claimed.push(ClaimedEvent {
                    event: event.into_event()?,
                    status,
                });
            }
            claimed
        };

        let lease_str = ts(&lease_until);
        for item in &claimed {
            tx.execute(
                "UPDATE event_status SET lease_until = ?1, updated_at = ?2 WHERE event_id = ?3",
                params![lease_str, now_str, item.status.event_id],
            )?;
        }

        tx.commit()?;
        Ok(claimed)
    }

    /// Apply a status transition
    pub fn update_event_status(&self, event_id: EventId, update: &StatusUpdate) -> Result<()> {
        let sql = if update.release {
            r#"
            UPDATE event_status SET state = ?1, attempts = ?2, deferrals = ?3, reason = ?4,
                next_attempt_at = ?5, updated_at = ?6, lease_until = NULL
            WHERE event_id = ?7
            "#
        } else {
            r#"
            UPDATE event_status SET state = ?1, attempts = ?2, deferrals = ?3, reason = ?4,
                next_attempt_at = ?5, updated_at = ?6
            WHERE event_id = ?7
            "#
        };

        self.conn()?.execute(
            sql,
            params![
                update.state.as_str(),
                update.attempts,
                update.deferrals,
                update.reason,
                ts(&update.next_attempt_at),
                ts(&Utc::now()),
                event_id,
            ],
        )?;

        Ok(())
    }

    /// Get the status of an event
    pub fn get_event_status(&self, event_id: EventId) -> Result<Option<EventStatus>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM event_status WHERE event_id = ?1", STATUS_COLUMNS),
                params![event_id],
                StatusRow::from_row,
            )
            .optional()?;

        row.map(StatusRow::into_status).transpose()
    }

    /// List event statuses, most recent events first
    pub fn list_event_statuses(
        &self,
        state: Option<EventState>,
        limit: usize,
    ) -> Result<Vec<EventStatus>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM event_status
            WHERE (?1 IS NULL OR state = ?1)
            ORDER BY event_id DESC
            LIMIT ?2
            "#,
            STATUS_COLUMNS
        ))?;

        let rows = stmt.query_map(
            params![state.map(|s| s.as_str()), limit as i64],
            StatusRow::from_row,
        )?;

        let mut statuses = Vec::new();
        for row in rows {
            statuses.push(row?.into_status()?);
        }

        Ok(statuses)
    }

    /// Count events per pipeline state
    pub fn count_event_states(&self) -> Result<BTreeMap<EventState, usize>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM event_status GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (state, count) = row?;
            let state = EventState::parse(&state)
                .ok_or_else(|| StorageError::corrupt("event_status", format!("state {:?}", state)))?;
            counts.insert(state, count as usize);
        }

        Ok(counts)
    }

    /// Make deferred events of a repository due immediately.
    ///
    /// Called when an issue arrives so that commits waiting on it are
    /// retried without sitting out their backoff.
    pub fn wake_deferred(&self, repo_full_name: &str, now: DateTime<Utc>) -> Result<usize> {
        let woken = self.conn()?.execute(
            r#"
            UPDATE event_status SET next_attempt_at = ?1
            WHERE repo_full_name = ?2 AND state = 'deferred' AND next_attempt_at > ?1
            "#,
            params![ts(&now), repo_full_name],
        )?;
        Ok(woken)
    }

    /// Return a parked or failed event to the queue with fresh counters.
    /// Returns `false` if the event is not in a retryable state.
    pub fn requeue_event(&self, event_id: EventId, now: DateTime<Utc>) -> Result<bool> {
        let now_str = ts(&now);
        let updated = self.conn()?.execute(
            r#"
            UPDATE event_status SET state = 'received', attempts = 0, deferrals = 0,
                reason = NULL, next_attempt_at = ?1, lease_until = NULL, updated_at = ?1
            WHERE event_id = ?2 AND state IN ('parked', 'failed')
            "#,
            params![now_str, event_id],
        )?;
        Ok(updated > 0)
    }
}

// Internal row types for database mapping

struct EventRow {
    id: i64,
    event_type: String,
    delivery_id: Option<String>,
    payload: String,
    received_at: String,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_type: row.get(1)?,
            delivery_id: row.get(2)?,
            payload: row.get(3)?,
            received_at: row.get(4)?,
        })
    }

    fn into_event(self) -> Result<Event> {
        Ok(Event {
            id: self.id,
            event_type: self.event_type,
            delivery_id: self.delivery_id,
            payload: serde_json::from_str(&self.payload)?,
            received_at: parse_ts("events", &self.received_at)?,
        })
    }
}

struct StatusRow {
    event_id: i64,
    event_type: String,
    repo_full_name: String,
    event_ts: String,
    state: String,
    attempts: u32,
    deferrals: u32,
    reason: Option<String>,
    next_attempt_at: String,
    lease_until: Option<String>,
    updated_at: String,
}

impl StatusRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            event_id: row.get(0)?,
            event_type: row.get(1)?,
            repo_full_name: row.get(2)?,
            event_ts: row.get(3)?,
            state: row.get(4)?,
            attempts: row.get(5)?,
            deferrals: row.get(6)?,
            reason: row.get(7)?,
            next_attempt_at: row.get(8)?,
            lease_until: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_status(self) -> Result<EventStatus> {
        let state = EventState::parse(&self.state).ok_or_else(|| {
            StorageError::corrupt("event_status", format!("unknown state {:?}", self.state))
        })?;

        Ok(EventStatus {
            event_id: self.event_id,
            event_type: self.event_type,
            repo_full_name: self.repo_full_name,
            event_ts: parse_ts("event_status", &self.event_ts)?,
            state,
            attempts: self.attempts,
            deferrals: self.deferrals,
            reason: self.reason,
            next_attempt_at: parse_ts("event_status", &self.next_attempt_at)?,
            lease_until: parse_opt_ts("event_status", self.lease_until)?,
            updated_at: parse_ts("event_status", &self.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn push(n: u32) -> NewEvent {
        NewEvent::new("push", json!({"repository": {"full_name": "acme/widgets"}, "n": n}))
    }

    fn status_for(id: EventId, ts: DateTime<Utc>) -> EventStatus {
        EventStatus {
            event_id: id,
            event_type: "push".to_string(),
            repo_full_name: "acme/widgets".to_string(),
            event_ts: ts,
            state: EventState::Received,
            attempts: 0,
            deferrals: 0,
            reason: None,
            next_attempt_at: ts,
            lease_until: None,
            updated_at: ts,
        }
    }

    #[test]
    fn test_append_and_read_in_order() {
        let db = Database::open_in_memory().unwrap();
        let ids: Vec<EventId> = (0..300).map(|n| db.append_event(&push(n)).unwrap()).collect();

        let events: Vec<Event> = db.read_from(0).unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(events.len(), 300);
        assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), ids);
    }

    #[test]
    fn test_reader_is_finite_and_restartable() {
        let db = Database::open_in_memory().unwrap();
        for n in 0..5 {
            db.append_event(&push(n)).unwrap();
        }

        let mut reader = db.read_from(0).unwrap();
        let first: Vec<Event> = reader.by_ref().take(2).map(|e| e.unwrap()).collect();
        let cursor = reader.cursor();
        assert_eq!(cursor, first[1].id);

        // Events appended after the reader was created are not part of it
        db.append_event(&push(99)).unwrap();
        assert_eq!(reader.count(), 3);

        // A new reader from the saved cursor sees the rest, including the new event
        let resumed: Vec<Event> = db.read_from(cursor).unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(resumed.len(), 4);
        assert_eq!(resumed[3].payload["n"], 99);
    }

    #[test]
    fn test_cursor_persistence() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.event_cursor().unwrap(), 0);
        db.set_event_cursor(42).unwrap();
        assert_eq!(db.event_cursor().unwrap(), 42);
    }

    #[test]
    fn test_claim_respects_lease_and_order() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        let late = db.append_event(&push(1)).unwrap();
        let early = db.append_event(&push(2)).unwrap();
        db.register_event(&status_for(late, now - Duration::minutes(1))).unwrap();
        db.register_event(&status_for(early, now - Duration::minutes(5))).unwrap();

        let claimed = db
            .claim_due_events(now, now + Duration::seconds(30), 10)
            .unwrap();
        let ids: Vec<EventId> = claimed.iter().map(|c| c.status.event_id).collect();
        assert_eq!(ids, vec![early, late]);

        // Leased events are not claimed again until the lease expires
        assert!(db
            .claim_due_events(now, now + Duration::seconds(30), 10)
            .unwrap()
            .is_empty());
        let reclaimed = db
            .claim_due_events(now + Duration::seconds(31), now + Duration::seconds(60), 10)
            .unwrap();
        assert_eq!(reclaimed.len(), 2);
    }

    #[test]
    fn test_terminal_events_are_not_claimed() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let id = db.append_event(&push(1)).unwrap();
        db.register_event(&status_for(id, now)).unwrap();

        let status = db.get_event_status(id).unwrap().unwrap();
        let mut update = StatusUpdate::step(&status, EventState::Parked);
        update.release = true;
        update.reason = Some("model unavailable".to_string());
        db.update_event_status(id, &update).unwrap();

        assert!(db
            .claim_due_events(now, now + Duration::seconds(30), 10)
            .unwrap()
            .is_empty());

        assert!(db.requeue_event(id, now).unwrap());
        let status = db.get_event_status(id).unwrap().unwrap();
        assert_eq!(status.state, EventState::Received);
        assert!(status.reason.is_none());
        assert!(!db.requeue_event(id, now).unwrap());
    }

    #[test]
    fn test_register_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let id = db.append_event(&push(1)).unwrap();
        assert!(db.register_event(&status_for(id, now)).unwrap());
        assert!(!db.register_event(&status_for(id, now)).unwrap());
        assert_eq!(db.count_event_states().unwrap()[&EventState::Received], 1);
    }
}
