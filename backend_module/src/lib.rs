//! Contract for the remote messaging platform of record.
//!
//! The triage core never talks to the platform directly; everything goes
//! through the `MessagingBackend` trait. `HttpBackend` implements it against
//! the platform's v2 JSON API.

mod http;

pub use http::HttpBackend;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("backend config error: {0}")]
    Config(String),
    #[error("unexpected backend response: {0}")]
    UnexpectedResponse(String),
}

/// One inbound message as the remote platform reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: i64,
    pub contact: String,
    pub text: String,
    /// "inbox" or "flow"
    #[serde(rename = "type")]
    pub kind: String,
    pub created_on: DateTime<Utc>,
}

/// A page of fetched messages plus the cursor for the next page, if any.
#[derive(Debug, Clone, Default)]
pub struct RemoteMessagePage {
    pub messages: Vec<RemoteMessage>,
    pub next_cursor: Option<String>,
}

/// Operations the triage core requires of the platform, independent of
/// transport. Message arguments are remote (backend) identifiers.
pub trait MessagingBackend: Send + Sync {
    /// Register a label remotely, returning its stable remote uuid.
    fn create_label(&self, org_id: i64, name: &str) -> Result<String, BackendError>;

    /// Fetch inbound messages created within `(after, before]`, one page per
    /// call. Pass the previous page's cursor to continue.
    fn fetch_messages(
        &self,
        org_id: i64,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
        cursor: Option<&str>,
    ) -> Result<RemoteMessagePage, BackendError>;

    fn flag_messages(&self, org_id: i64, messages: &[i64]) -> Result<(), BackendError>;

    fn unflag_messages(&self, org_id: i64, messages: &[i64]) -> Result<(), BackendError>;

    fn archive_messages(&self, org_id: i64, messages: &[i64]) -> Result<(), BackendError>;

    fn restore_messages(&self, org_id: i64, messages: &[i64]) -> Result<(), BackendError>;

    fn label_messages(
        &self,
        org_id: i64,
        messages: &[i64],
        label_uuid: &str,
    ) -> Result<(), BackendError>;

    fn unlabel_messages(
        &self,
        org_id: i64,
        messages: &[i64],
        label_uuid: &str,
    ) -> Result<(), BackendError>;

    /// Dispatch an outbound broadcast. The returned broadcast id and creation
    /// timestamp are authoritative.
    fn create_outgoing(
        &self,
        org_id: i64,
        text: &str,
        contacts: &[String],
        urns: &[String],
    ) -> Result<(i64, DateTime<Utc>), BackendError>;
}
