//! Blocking client for the platform's v2 JSON API.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{BackendError, MessagingBackend, RemoteMessage, RemoteMessagePage};

const API_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP implementation of [`MessagingBackend`].
///
/// Credentials are org-scoped: construct one `HttpBackend` per organization
/// with that organization's API token.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    api_root: String,
    token: String,
    client: Client,
}

impl HttpBackend {
    pub fn new(api_root: impl Into<String>, token: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            api_root: api_root.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        }
    }

    /// Resolve `BACKEND_API_ROOT` and `BACKEND_API_TOKEN` from the
    /// environment, falling back to a `.env` file.
    pub fn from_env() -> Result<Self, BackendError> {
        dotenvy::dotenv().ok();
        let api_root = require_env("BACKEND_API_ROOT")?;
        let token = require_env("BACKEND_API_TOKEN")?;
        Ok(Self::new(api_root, token))
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/api/v2/{}.json", self.api_root, name)
    }

    fn check(&self, response: Response) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(BackendError::Api {
            status: status.as_u16(),
            body,
        })
    }

    fn post_json<T: Serialize>(&self, name: &str, body: &T) -> Result<Response, BackendError> {
        let response = self
            .client
            .post(self.endpoint(name))
            .header("Authorization", format!("Token {}", self.token))
            .json(body)
            .send()?;
        self.check(response)
    }

    fn message_action(
        &self,
        org_id: i64,
        messages: &[i64],
        action: &str,
        label_uuid: Option<&str>,
    ) -> Result<(), BackendError> {
        debug!(
            "{} {} messages for org {}",
            action,
            messages.len(),
            org_id
        );
        let request = MessageActionRequest {
            messages,
            action,
            label: label_uuid,
        };
        self.post_json("message_actions", &request)?;
        Ok(())
    }
}

impl MessagingBackend for HttpBackend {
    fn create_label(&self, org_id: i64, name: &str) -> Result<String, BackendError> {
        debug!("creating label {} for org {}", name, org_id);
        let response = self.post_json("labels", &CreateLabelRequest { name })?;
        let created: CreateLabelResponse = response
            .json()
            .map_err(|err| BackendError::UnexpectedResponse(err.to_string()))?;
        Ok(created.uuid)
    }

    fn fetch_messages(
        &self,
        org_id: i64,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
        cursor: Option<&str>,
    ) -> Result<RemoteMessagePage, BackendError> {
        debug!(
            "fetching messages for org {} in ({}, {}]",
            org_id,
            after.to_rfc3339(),
            before.to_rfc3339()
        );
        let mut query = vec![
            ("folder", "incoming".to_string()),
            ("after", after.to_rfc3339()),
            ("before", before.to_rfc3339()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        let response = self
            .client
            .get(self.endpoint("messages"))
            .header("Authorization", format!("Token {}", self.token))
            .query(&query)
            .send()?;
        let response = self.check(response)?;
        let page: FetchMessagesResponse = response
            .json()
            .map_err(|err| BackendError::UnexpectedResponse(err.to_string()))?;
        Ok(RemoteMessagePage {
            messages: page.results,
            next_cursor: page.next,
        })
    }

    fn flag_messages(&self, org_id: i64, messages: &[i64]) -> Result<(), BackendError> {
        self.message_action(org_id, messages, "flag", None)
    }

    fn unflag_messages(&self, org_id: i64, messages: &[i64]) -> Result<(), BackendError> {
        self.message_action(org_id, messages, "unflag", None)
    }

    fn archive_messages(&self, org_id: i64, messages: &[i64]) -> Result<(), BackendError> {
        self.message_action(org_id, messages, "archive", None)
    }

    fn restore_messages(&self, org_id: i64, messages: &[i64]) -> Result<(), BackendError> {
        self.message_action(org_id, messages, "restore", None)
    }

    fn label_messages(
        &self,
        org_id: i64,
        messages: &[i64],
        label_uuid: &str,
    ) -> Result<(), BackendError> {
        self.message_action(org_id, messages, "label", Some(label_uuid))
    }

    fn unlabel_messages(
        &self,
        org_id: i64,
        messages: &[i64],
        label_uuid: &str,
    ) -> Result<(), BackendError> {
        self.message_action(org_id, messages, "unlabel", Some(label_uuid))
    }

    fn create_outgoing(
        &self,
        org_id: i64,
        text: &str,
        contacts: &[String],
        urns: &[String],
    ) -> Result<(i64, DateTime<Utc>), BackendError> {
        debug!(
            "creating broadcast for org {} to {} contacts, {} urns",
            org_id,
            contacts.len(),
            urns.len()
        );
        let request = CreateBroadcastRequest {
            text,
            contacts,
            urns,
        };
        let response = self.post_json("broadcasts", &request)?;
        let created: CreateBroadcastResponse = response
            .json()
            .map_err(|err| BackendError::UnexpectedResponse(err.to_string()))?;
        Ok((created.id, created.created_on))
    }
}

fn require_env(name: &str) -> Result<String, BackendError> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| BackendError::Config(format!("{} not set", name)))
}


#[derive(Debug, Serialize)]
struct CreateLabelRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateLabelResponse {
    uuid: String,
}

#[derive(Debug, Serialize)]
struct MessageActionRequest<'a> {
    messages: &'a [i64],
    action: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct FetchMessagesResponse {
    results: Vec<RemoteMessage>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateBroadcastRequest<'a> {
    text: &'a str,
    contacts: &'a [String],
    urns: &'a [String],
}

#[derive(Debug, Deserialize)]
struct CreateBroadcastResponse {
    id: i64,
    created_on: DateTime<Utc>,
}
