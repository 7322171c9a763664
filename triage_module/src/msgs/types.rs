use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use backend_module::BackendError;

use crate::cases::CaseError;
use crate::locks::LockError;
use crate::org_state::StateStoreError;

/// Minimum keyword length, post-normalization.
pub const KEYWORD_MIN_LENGTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Inbox,
    Flow,
}

impl MessageType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            MessageType::Inbox => "inbox",
            MessageType::Flow => "flow",
        }
    }

    pub(crate) fn parse(raw: &str) -> Result<Self, TriageError> {
        match raw {
            "inbox" => Ok(MessageType::Inbox),
            "flow" => Ok(MessageType::Flow),
            other => Err(TriageError::Storage(format!("unknown message type {}", other))),
        }
    }
}

/// A message label mirrored from the remote platform, with the keywords that
/// auto-apply it. Never renamed once created; deactivated instead of deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: i64,
    pub org_id: i64,
    pub uuid: String,
    pub name: String,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub is_active: bool,
}

/// An inbound message mirrored from the remote platform.
///
/// Mutated only through [`super::ActionEngine`] or the ingestion path;
/// `is_handled` transitions false to true exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub org_id: i64,
    pub backend_id: i64,
    pub contact: String,
    pub kind: MessageType,
    pub text: String,
    pub is_flagged: bool,
    pub is_archived: bool,
    pub is_handled: bool,
    pub is_active: bool,
    pub created_on: DateTime<Utc>,
    pub case_id: Option<i64>,
}

/// What a bulk invocation does to its batch. Label-bearing variants carry the
/// label they apply or remove.
#[derive(Debug, Clone)]
pub enum ActionKind {
    Flag,
    Unflag,
    Label(Label),
    Unlabel(Label),
    Archive,
    Restore,
}

impl ActionKind {
    pub fn code(&self) -> &'static str {
        match self {
            ActionKind::Flag => "flag",
            ActionKind::Unflag => "unflag",
            ActionKind::Label(_) => "label",
            ActionKind::Unlabel(_) => "unlabel",
            ActionKind::Archive => "archive",
            ActionKind::Restore => "restore",
        }
    }

    pub(crate) fn label(&self) -> Option<&Label> {
        match self {
            ActionKind::Label(label) | ActionKind::Unlabel(label) => Some(label),
            _ => None,
        }
    }
}

/// Immutable audit record: one row per bulk invocation, referencing every
/// message in the batch. Never updated after creation.
#[derive(Debug, Clone)]
pub struct MessageAction {
    pub id: i64,
    pub org_id: i64,
    pub action: String,
    /// None for actions taken by the sync machinery rather than a user.
    pub created_by: Option<i64>,
    pub created_on: DateTime<Utc>,
    pub label_id: Option<i64>,
    pub message_ids: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    BulkReply,
    CaseReply,
    Forward,
}

impl Activity {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Activity::BulkReply => "bulk_reply",
            Activity::CaseReply => "case_reply",
            Activity::Forward => "forward",
        }
    }

    pub(crate) fn parse(raw: &str) -> Result<Self, TriageError> {
        match raw {
            "bulk_reply" => Ok(Activity::BulkReply),
            "case_reply" => Ok(Activity::CaseReply),
            "forward" => Ok(Activity::Forward),
            other => Err(TriageError::Storage(format!("unknown activity {}", other))),
        }
    }
}

/// An outbound reply or broadcast, created only after the remote platform
/// confirms dispatch.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub id: i64,
    pub org_id: i64,
    pub activity: Activity,
    pub text: String,
    pub broadcast_id: i64,
    pub recipient_count: usize,
    pub created_by: i64,
    pub created_on: DateTime<Utc>,
    pub case_id: Option<i64>,
}

/// The acting user for an operation, with the label visibility their partner
/// affiliation grants.
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: i64,
    pub is_admin: bool,
    /// Label ids reachable through the actor's partner; ignored for admins.
    pub partner_labels: Vec<i64>,
}

impl Actor {
    pub fn admin(user_id: i64) -> Self {
        Self {
            user_id,
            is_admin: true,
            partner_labels: Vec::new(),
        }
    }

    pub fn partner(user_id: i64, partner_labels: Vec<i64>) -> Self {
        Self {
            user_id,
            is_admin: false,
            partner_labels,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TriageError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("case error: {0}")]
    Case(#[from] CaseError),
    #[error("task state error: {0}")]
    State(#[from] StateStoreError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Storage(String),
}
