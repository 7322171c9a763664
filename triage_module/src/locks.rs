//! Org-scoped mutual exclusion leases for labels, messages and task runs.
//!
//! Leases live in a sqlite table so worker processes sharing the store file
//! serialize against each other, not just threads in one process. A lease
//! expires after a fixed TTL, so a crashed holder cannot deadlock an entity;
//! an expired lease is taken over by the next acquirer.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::util::{format_datetime, parse_datetime};

/// How long a lease lives if the holder never releases it.
pub const LEASE_TTL_SECS: i64 = 60;

const ACQUIRE_POLL: Duration = Duration::from_millis(50);

const LOCKS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entity_locks (
    key TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    Label,
    Message,
    Task,
}

impl LockScope {
    fn as_str(self) -> &'static str {
        match self {
            LockScope::Label => "label",
            LockScope::Message => "message",
            LockScope::Task => "task",
        }
    }
}

/// Structured lock key: organization + entity kind + entity identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKey {
    pub org_id: i64,
    pub scope: LockScope,
    pub entity: String,
}

impl LockKey {
    pub fn label(org_id: i64, uuid: &str) -> Self {
        Self {
            org_id,
            scope: LockScope::Label,
            entity: uuid.to_string(),
        }
    }

    pub fn message(org_id: i64, backend_id: i64) -> Self {
        Self {
            org_id,
            scope: LockScope::Message,
            entity: backend_id.to_string(),
        }
    }

    pub fn task(org_id: i64, name: &str) -> Self {
        Self {
            org_id,
            scope: LockScope::Task,
            entity: name.to_string(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock:{}:{}:{}", self.scope.as_str(), self.org_id, self.entity)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("timed out acquiring {0}")]
    Timeout(String),
}

#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let manager = Self { path: path.into() };
        let _ = manager.open()?;
        Ok(manager)
    }

    /// Acquire an exclusive lease on `key`, polling for up to `wait`.
    ///
    /// The lease is non-reentrant and releases when the returned guard drops.
    pub fn acquire(&self, key: &LockKey, wait: Duration) -> Result<LockLease, LockError> {
        let holder = Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait;
        loop {
            if self.try_claim(key, &holder)? {
                debug!("acquired {}", key);
                return Ok(LockLease {
                    path: self.path.clone(),
                    key: key.to_string(),
                    holder,
                });
            }
            if Instant::now() >= deadline {
                return Err(LockError::Timeout(key.to_string()));
            }
            thread::sleep(ACQUIRE_POLL);
        }
    }

    fn try_claim(&self, key: &LockKey, holder: &str) -> Result<bool, LockError> {
        let mut conn = self.open()?;
        let now = Utc::now();
        let tx = conn.transaction()?;
        let existing = tx
            .query_row(
                "SELECT holder, expires_at FROM entity_locks WHERE key = ?1",
                params![key.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        if let Some((prior_holder, expires_at)) = existing {
            if parse_datetime(&expires_at)? > now {
                tx.commit()?;
                return Ok(false);
            }
            warn!("taking over expired lease on {} from {}", key, prior_holder);
            tx.execute(
                "DELETE FROM entity_locks WHERE key = ?1",
                params![key.to_string()],
            )?;
        }

        let expires_at = now + chrono::Duration::seconds(LEASE_TTL_SECS);
        tx.execute(
            "INSERT INTO entity_locks (key, holder, expires_at) VALUES (?1, ?2, ?3)",
            params![key.to_string(), holder, format_datetime(expires_at)],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn open(&self) -> Result<Connection, LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(LOCKS_SCHEMA)?;
        Ok(conn)
    }
}

/// Exclusive lease on an entity. Releases on drop, on every exit path.
#[derive(Debug)]
pub struct LockLease {
    path: PathBuf,
    key: String,
    holder: String,
}

impl Drop for LockLease {
    fn drop(&mut self) {
        let release = |path: &PathBuf, key: &str, holder: &str| -> Result<(), rusqlite::Error> {
            let conn = Connection::open(path)?;
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.execute(
                "DELETE FROM entity_locks WHERE key = ?1 AND holder = ?2",
                params![key, holder],
            )?;
            Ok(())
        };
        if let Err(err) = release(&self.path, &self.key, &self.holder) {
            warn!("failed to release {}: {}", self.key, err);
        }
    }
}
