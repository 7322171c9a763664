//! Per-organization bookkeeping for scheduled task runs.
//!
//! One row per (org, task name), overwritten on every completed run and
//! expired after a TTL. The pull task reads it to compute the next fetch
//! window.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::util::{format_datetime, parse_datetime};

/// How long a recorded run result stays readable.
pub const TASK_STATE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const TASK_STATES_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS task_states (
    org_id INTEGER NOT NULL,
    task_name TEXT NOT NULL,
    started_on TEXT NOT NULL,
    completed_on TEXT NOT NULL,
    last_results TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    PRIMARY KEY (org_id, task_name)
);
";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub started_on: DateTime<Utc>,
    pub completed_on: DateTime<Utc>,
    pub last_results: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ttl out of range")]
    TtlOutOfRange,
}

#[derive(Debug, Clone)]
pub struct TaskStateStore {
    path: PathBuf,
}

impl TaskStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StateStoreError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    /// Last recorded run for `(org_id, task_name)`; expired rows read as absent.
    pub fn get(&self, org_id: i64, task_name: &str) -> Result<Option<TaskState>, StateStoreError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT started_on, completed_on, last_results, expires_at
                 FROM task_states
                 WHERE org_id = ?1 AND task_name = ?2",
                params![org_id, task_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((started_on, completed_on, last_results, expires_at)) = row else {
            return Ok(None);
        };
        if parse_datetime(&expires_at)? <= Utc::now() {
            return Ok(None);
        }
        Ok(Some(TaskState {
            started_on: parse_datetime(&started_on)?,
            completed_on: parse_datetime(&completed_on)?,
            last_results: serde_json::from_str(&last_results)?,
        }))
    }

    /// Record a run, overwriting any previous value (last-write-wins).
    pub fn set(
        &self,
        org_id: i64,
        task_name: &str,
        state: &TaskState,
        ttl: Duration,
    ) -> Result<(), StateStoreError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|_| StateStoreError::TtlOutOfRange)?;
        let expires_at = Utc::now() + ttl;
        let conn = self.open()?;
        conn.execute(
            "INSERT OR REPLACE INTO task_states
                (org_id, task_name, started_on, completed_on, last_results, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                org_id,
                task_name,
                format_datetime(state.started_on),
                format_datetime(state.completed_on),
                serde_json::to_string(&state.last_results)?,
                format_datetime(expires_at)
            ],
        )?;
        Ok(())
    }

    fn open(&self) -> Result<Connection, StateStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(TASK_STATES_SCHEMA)?;
        Ok(conn)
    }
}
