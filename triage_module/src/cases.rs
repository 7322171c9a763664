//! Narrow interface onto the case collaborator.
//!
//! Cases are owned elsewhere; ingestion only needs to know whether a contact
//! has an open case and to append reply events to it.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::util::{format_datetime, parse_datetime};

pub const CASE_EVENT_REPLY: &str = "reply";

const CASES_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id INTEGER NOT NULL,
    contact TEXT NOT NULL,
    opened_on TEXT NOT NULL,
    closed_on TEXT
);
CREATE INDEX IF NOT EXISTS cases_contact_idx ON cases(org_id, contact);

CREATE TABLE IF NOT EXISTS case_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    case_id INTEGER NOT NULL,
    event TEXT NOT NULL,
    created_on TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS case_events_case_idx ON case_events(case_id);
";

#[derive(Debug, Clone)]
pub struct CaseEvent {
    pub id: i64,
    pub case_id: i64,
    pub event: String,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum CaseError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
}

#[derive(Debug, Clone)]
pub struct CaseIndex {
    path: PathBuf,
}

impl CaseIndex {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, CaseError> {
        let index = Self { path: path.into() };
        let _ = index.open()?;
        Ok(index)
    }

    /// Record a case opened by the case collaborator.
    pub fn open_case(
        &self,
        org_id: i64,
        contact: &str,
        opened_on: DateTime<Utc>,
    ) -> Result<i64, CaseError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO cases (org_id, contact, opened_on) VALUES (?1, ?2, ?3)",
            params![org_id, contact, format_datetime(opened_on)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn close_case(&self, case_id: i64, closed_on: DateTime<Utc>) -> Result<(), CaseError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE cases SET closed_on = ?1 WHERE id = ?2",
            params![format_datetime(closed_on), case_id],
        )?;
        Ok(())
    }

    /// The contact's open case, if any.
    pub fn open_case_for_contact(
        &self,
        org_id: i64,
        contact: &str,
    ) -> Result<Option<i64>, CaseError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT id FROM cases
                 WHERE org_id = ?1 AND contact = ?2 AND closed_on IS NULL
                 ORDER BY opened_on DESC
                 LIMIT 1",
                params![org_id, contact],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(row)
    }

    /// Append a reply event, timestamped with the triggering message's
    /// creation time rather than "now".
    pub fn record_reply_event(
        &self,
        case_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), CaseError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO case_events (case_id, event, created_on) VALUES (?1, ?2, ?3)",
            params![case_id, CASE_EVENT_REPLY, format_datetime(at)],
        )?;
        Ok(())
    }

    pub fn events_for_case(&self, case_id: i64) -> Result<Vec<CaseEvent>, CaseError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, case_id, event, created_on FROM case_events
             WHERE case_id = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![case_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, case_id, event, created_on) = row?;
            events.push(CaseEvent {
                id,
                case_id,
                event,
                created_on: parse_datetime(&created_on)?,
            });
        }
        Ok(events)
    }

    fn open(&self) -> Result<Connection, CaseError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(CASES_SCHEMA)?;
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_case_lookup_ignores_closed_cases() {
        let temp = TempDir::new().expect("tempdir");
        let index = CaseIndex::new(temp.path().join("cases.db")).expect("case index");
        let now = Utc::now();

        assert!(index.open_case_for_contact(1, "C-001").expect("lookup").is_none());

        let case_id = index.open_case(1, "C-001", now).expect("open");
        assert_eq!(
            index.open_case_for_contact(1, "C-001").expect("lookup"),
            Some(case_id)
        );
        assert!(index.open_case_for_contact(1, "C-002").expect("lookup").is_none());
        assert!(index.open_case_for_contact(2, "C-001").expect("lookup").is_none());

        index.close_case(case_id, now).expect("close");
        assert!(index.open_case_for_contact(1, "C-001").expect("lookup").is_none());
    }

    #[test]
    fn reply_events_keep_the_supplied_timestamp() {
        let temp = TempDir::new().expect("tempdir");
        let index = CaseIndex::new(temp.path().join("cases.db")).expect("case index");
        let opened = Utc::now() - chrono::Duration::hours(6);
        let message_on = Utc::now() - chrono::Duration::hours(1);

        let case_id = index.open_case(1, "C-001", opened).expect("open");
        index.record_reply_event(case_id, message_on).expect("event");

        let events = index.events_for_case(case_id).expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, CASE_EVENT_REPLY);
        assert_eq!(events[0].created_on, message_on);
    }
}
