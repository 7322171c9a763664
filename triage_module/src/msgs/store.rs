use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::normalize::parse_csv;
use crate::util::{bool_to_int, format_datetime, parse_datetime};

use super::types::{Activity, Label, Message, MessageAction, MessageType, Outgoing, TriageError};

/// Longest message text kept locally; remote text is clamped on ingestion.
const MAX_TEXT_CHARS: usize = 640;

const TRIAGE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS labels (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id INTEGER NOT NULL,
    uuid TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    description TEXT,
    keywords TEXT NOT NULL DEFAULT '',
    is_active INTEGER NOT NULL DEFAULT 1,
    UNIQUE (org_id, name)
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id INTEGER NOT NULL,
    backend_id INTEGER NOT NULL UNIQUE,
    contact TEXT NOT NULL,
    kind TEXT NOT NULL,
    text TEXT NOT NULL,
    is_flagged INTEGER NOT NULL DEFAULT 0,
    is_archived INTEGER NOT NULL DEFAULT 0,
    is_handled INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_on TEXT NOT NULL,
    case_id INTEGER
);
CREATE INDEX IF NOT EXISTS messages_unhandled_idx ON messages(org_id, is_handled);

CREATE TABLE IF NOT EXISTS message_labels (
    message_id INTEGER NOT NULL,
    label_id INTEGER NOT NULL,
    UNIQUE (message_id, label_id)
);

CREATE TABLE IF NOT EXISTS message_actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id INTEGER NOT NULL,
    action TEXT NOT NULL,
    created_by INTEGER,
    created_on TEXT NOT NULL,
    label_id INTEGER
);

CREATE TABLE IF NOT EXISTS message_action_messages (
    action_id INTEGER NOT NULL,
    message_id INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS message_action_messages_idx
    ON message_action_messages(message_id);

CREATE TABLE IF NOT EXISTS outgoing (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id INTEGER NOT NULL,
    activity TEXT NOT NULL,
    text TEXT NOT NULL,
    broadcast_id INTEGER NOT NULL,
    recipient_count INTEGER NOT NULL,
    created_by INTEGER NOT NULL,
    created_on TEXT NOT NULL,
    case_id INTEGER
);
";

/// Local mirror of labels, messages, audit actions and outgoing broadcasts.
#[derive(Debug, Clone)]
pub struct TriageStore {
    path: PathBuf,
}

impl TriageStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, TriageError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    // ── labels ──────────────────────────────────────────────────────────

    pub fn insert_label(
        &self,
        org_id: i64,
        uuid: &str,
        name: &str,
        description: Option<&str>,
        keywords: &[String],
    ) -> Result<Label, TriageError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO labels (org_id, uuid, name, description, keywords)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![org_id, uuid, name, description, keywords.join(",")],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Label {
            id,
            org_id,
            uuid: uuid.to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            keywords: keywords.to_vec(),
            is_active: true,
        })
    }

    pub fn get_label(&self, org_id: i64, label_id: i64) -> Result<Option<Label>, TriageError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT id, org_id, uuid, name, description, keywords, is_active
                 FROM labels
                 WHERE org_id = ?1 AND id = ?2",
                params![org_id, label_id],
                row_to_label_tuple,
            )
            .optional()?;
        Ok(row.map(tuple_to_label))
    }

    /// Active labels for the organization, in ascending id order.
    pub fn get_active_labels(&self, org_id: i64) -> Result<Vec<Label>, TriageError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, org_id, uuid, name, description, keywords, is_active
             FROM labels
             WHERE org_id = ?1 AND is_active = 1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![org_id], row_to_label_tuple)?;
        let mut labels = Vec::new();
        for row in rows {
            labels.push(tuple_to_label(row?));
        }
        Ok(labels)
    }

    pub fn set_label_keywords(
        &self,
        label_id: i64,
        keywords: &[String],
    ) -> Result<(), TriageError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE labels SET keywords = ?1 WHERE id = ?2",
            params![keywords.join(","), label_id],
        )?;
        Ok(())
    }

    /// Deactivate a label; rows are never hard-deleted.
    pub fn release_label(&self, label_id: i64) -> Result<(), TriageError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE labels SET is_active = 0 WHERE id = ?1",
            params![label_id],
        )?;
        Ok(())
    }

    // ── messages ────────────────────────────────────────────────────────

    /// Insert a fetched message, or return the existing row for its backend
    /// id. Idempotent on the backend identifier.
    pub fn upsert_message(
        &self,
        org_id: i64,
        backend_id: i64,
        contact: &str,
        kind: MessageType,
        text: &str,
        created_on: DateTime<Utc>,
    ) -> Result<Message, TriageError> {
        let text: String = text.chars().take(MAX_TEXT_CHARS).collect();
        let conn = self.open()?;
        conn.execute(
            "INSERT OR IGNORE INTO messages (org_id, backend_id, contact, kind, text, created_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                org_id,
                backend_id,
                contact,
                kind.as_str(),
                text,
                format_datetime(created_on)
            ],
        )?;
        self.get_message_by_backend_id(org_id, backend_id)?
            .ok_or_else(|| {
                TriageError::Storage(format!("message {} missing after upsert", backend_id))
            })
    }

    pub fn get_message(&self, message_id: i64) -> Result<Option<Message>, TriageError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_MESSAGE),
                params![message_id],
                row_to_message_tuple,
            )
            .optional()?;
        row.map(tuple_to_message).transpose()
    }

    pub fn get_message_by_backend_id(
        &self,
        org_id: i64,
        backend_id: i64,
    ) -> Result<Option<Message>, TriageError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("{} WHERE org_id = ?1 AND backend_id = ?2", SELECT_MESSAGE),
                params![org_id, backend_id],
                row_to_message_tuple,
            )
            .optional()?;
        row.map(tuple_to_message).transpose()
    }

    pub fn get_unhandled(&self, org_id: i64) -> Result<Vec<Message>, TriageError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE org_id = ?1 AND is_handled = 0 AND is_active = 1 ORDER BY id",
            SELECT_MESSAGE
        ))?;
        let rows = stmt.query_map(params![org_id], row_to_message_tuple)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(tuple_to_message(row?)?);
        }
        Ok(messages)
    }

    pub fn set_flagged(
        &self,
        org_id: i64,
        message_ids: &[i64],
        flagged: bool,
    ) -> Result<(), TriageError> {
        self.set_message_flag(org_id, message_ids, "is_flagged", flagged)
    }

    pub fn set_archived(
        &self,
        org_id: i64,
        message_ids: &[i64],
        archived: bool,
    ) -> Result<(), TriageError> {
        self.set_message_flag(org_id, message_ids, "is_archived", archived)
    }

    pub fn mark_handled(&self, message_ids: &[i64]) -> Result<(), TriageError> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE messages SET is_handled = 1 WHERE id = ?1")?;
            for message_id in message_ids {
                stmt.execute(params![message_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Logical deletion: clear label associations and deactivate the row.
    pub fn release_message(&self, message_id: i64) -> Result<(), TriageError> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM message_labels WHERE message_id = ?1",
            params![message_id],
        )?;
        tx.execute(
            "UPDATE messages SET is_active = 0 WHERE id = ?1",
            params![message_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn set_message_flag(
        &self,
        org_id: i64,
        message_ids: &[i64],
        column: &str,
        value: bool,
    ) -> Result<(), TriageError> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "UPDATE messages SET {} = ?1 WHERE org_id = ?2 AND id = ?3",
                column
            ))?;
            for message_id in message_ids {
                stmt.execute(params![bool_to_int(value), org_id, message_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ── label associations ──────────────────────────────────────────────

    pub fn add_label_to_messages(
        &self,
        message_ids: &[i64],
        label_id: i64,
    ) -> Result<(), TriageError> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO message_labels (message_id, label_id) VALUES (?1, ?2)",
            )?;
            for message_id in message_ids {
                stmt.execute(params![message_id, label_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn remove_label_from_messages(
        &self,
        message_ids: &[i64],
        label_id: i64,
    ) -> Result<(), TriageError> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx
                .prepare("DELETE FROM message_labels WHERE message_id = ?1 AND label_id = ?2")?;
            for message_id in message_ids {
                stmt.execute(params![message_id, label_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn label_ids_for_message(&self, message_id: i64) -> Result<Vec<i64>, TriageError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT label_id FROM message_labels WHERE message_id = ?1 ORDER BY label_id",
        )?;
        let rows = stmt.query_map(params![message_id], |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    // ── audit actions ───────────────────────────────────────────────────

    /// Append one immutable audit row covering the whole batch.
    pub fn record_action(
        &self,
        org_id: i64,
        created_by: Option<i64>,
        message_ids: &[i64],
        action: &str,
        label_id: Option<i64>,
    ) -> Result<MessageAction, TriageError> {
        let created_on = Utc::now();
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO message_actions (org_id, action, created_by, created_on, label_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                org_id,
                action,
                created_by,
                format_datetime(created_on),
                label_id
            ],
        )?;
        let action_id = tx.last_insert_rowid();
        insert_action_messages(&tx, action_id, message_ids)?;
        tx.commit()?;
        Ok(MessageAction {
            id: action_id,
            org_id,
            action: action.to_string(),
            created_by,
            created_on,
            label_id,
            message_ids: message_ids.to_vec(),
        })
    }

    /// Audit history for one message, most recent first.
    pub fn actions_for_message(&self, message_id: i64) -> Result<Vec<MessageAction>, TriageError> {
        self.load_actions(
            "SELECT a.id, a.org_id, a.action, a.created_by, a.created_on, a.label_id
             FROM message_actions a
             JOIN message_action_messages am ON am.action_id = a.id
             WHERE am.message_id = ?1
             ORDER BY a.id DESC",
            params![message_id],
        )
    }

    pub fn actions_for_org(&self, org_id: i64) -> Result<Vec<MessageAction>, TriageError> {
        self.load_actions(
            "SELECT id, org_id, action, created_by, created_on, label_id
             FROM message_actions
             WHERE org_id = ?1
             ORDER BY id",
            params![org_id],
        )
    }

    fn load_actions(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<MessageAction>, TriageError> {
        let conn = self.open()?;
        let mut tuples = Vec::new();
        {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(args, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                ))
            })?;
            for row in rows {
                tuples.push(row?);
            }
        }

        let mut actions = Vec::new();
        for (id, org_id, action, created_by, created_on, label_id) in tuples {
            let mut stmt = conn.prepare(
                "SELECT message_id FROM message_action_messages WHERE action_id = ?1 ORDER BY rowid",
            )?;
            let message_rows = stmt.query_map(params![id], |row| row.get::<_, i64>(0))?;
            let mut message_ids = Vec::new();
            for message_row in message_rows {
                message_ids.push(message_row?);
            }
            actions.push(MessageAction {
                id,
                org_id,
                action,
                created_by,
                created_on: parse_datetime(&created_on)?,
                label_id,
                message_ids,
            });
        }
        Ok(actions)
    }

    // ── outgoing ────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn insert_outgoing(
        &self,
        org_id: i64,
        activity: Activity,
        text: &str,
        broadcast_id: i64,
        recipient_count: usize,
        created_by: i64,
        created_on: DateTime<Utc>,
        case_id: Option<i64>,
    ) -> Result<Outgoing, TriageError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO outgoing
                (org_id, activity, text, broadcast_id, recipient_count, created_by, created_on, case_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                org_id,
                activity.as_str(),
                text,
                broadcast_id,
                recipient_count as i64,
                created_by,
                format_datetime(created_on),
                case_id
            ],
        )?;
        Ok(Outgoing {
            id: conn.last_insert_rowid(),
            org_id,
            activity,
            text: text.to_string(),
            broadcast_id,
            recipient_count,
            created_by,
            created_on,
            case_id,
        })
    }

    pub fn outgoing_for_org(&self, org_id: i64) -> Result<Vec<Outgoing>, TriageError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, org_id, activity, text, broadcast_id, recipient_count, created_by, created_on, case_id
             FROM outgoing
             WHERE org_id = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![org_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, Option<i64>>(8)?,
            ))
        })?;

        let mut outgoing = Vec::new();
        for row in rows {
            let (id, org_id, activity, text, broadcast_id, recipient_count, created_by, created_on, case_id) =
                row?;
            outgoing.push(Outgoing {
                id,
                org_id,
                activity: Activity::parse(&activity)?,
                text,
                broadcast_id,
                recipient_count: recipient_count as usize,
                created_by,
                created_on: parse_datetime(&created_on)?,
                case_id,
            });
        }
        Ok(outgoing)
    }

    fn open(&self) -> Result<Connection, TriageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(TRIAGE_SCHEMA)?;
        Ok(conn)
    }
}

const SELECT_MESSAGE: &str =
    "SELECT id, org_id, backend_id, contact, kind, text, is_flagged, is_archived, is_handled,
            is_active, created_on, case_id
     FROM messages";

type LabelTuple = (i64, i64, String, String, Option<String>, String, i64);

fn row_to_label_tuple(row: &rusqlite::Row<'_>) -> rusqlite::Result<LabelTuple> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn tuple_to_label(tuple: LabelTuple) -> Label {
    let (id, org_id, uuid, name, description, keywords, is_active) = tuple;
    Label {
        id,
        org_id,
        uuid,
        name,
        description,
        keywords: parse_csv(&keywords),
        is_active: is_active != 0,
    }
}

type MessageTuple = (
    i64,
    i64,
    i64,
    String,
    String,
    String,
    i64,
    i64,
    i64,
    i64,
    String,
    Option<i64>,
);

fn row_to_message_tuple(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageTuple> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn tuple_to_message(tuple: MessageTuple) -> Result<Message, TriageError> {
    let (
        id,
        org_id,
        backend_id,
        contact,
        kind,
        text,
        is_flagged,
        is_archived,
        is_handled,
        is_active,
        created_on,
        case_id,
    ) = tuple;
    Ok(Message {
        id,
        org_id,
        backend_id,
        contact,
        kind: MessageType::parse(&kind)?,
        text,
        is_flagged: is_flagged != 0,
        is_archived: is_archived != 0,
        is_handled: is_handled != 0,
        is_active: is_active != 0,
        created_on: parse_datetime(&created_on)?,
        case_id,
    })
}

fn insert_action_messages(
    tx: &Transaction<'_>,
    action_id: i64,
    message_ids: &[i64],
) -> Result<(), TriageError> {
    let mut stmt = tx.prepare(
        "INSERT INTO message_action_messages (action_id, message_id) VALUES (?1, ?2)",
    )?;
    for message_id in message_ids {
        stmt.execute(params![action_id, message_id])?;
    }
    Ok(())
}
