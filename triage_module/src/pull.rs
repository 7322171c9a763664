//! Scheduled pull of new inbound messages for an organization.
//!
//! One run per org per schedule tick: fetch the window since the last run,
//! persist idempotently, auto-label, archive messages whose contact has an
//! open case, then record run counts for the next window.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use backend_module::{MessagingBackend, RemoteMessage};

use crate::cases::CaseIndex;
use crate::locks::{LockKey, LockManager};
use crate::msgs::{match_labels, ActionEngine, Label, LabelRegistry, Message, MessageType, TriageStore};
use crate::org_state::{TaskState, TaskStateStore, TASK_STATE_TTL};
use crate::TriageError;

pub const PULL_TASK_NAME: &str = "message-pull";

/// A second runner finding the task lock held should fail fast, not queue.
const TASK_LOCK_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResult {
    /// Messages ingested this run.
    pub messages: usize,
    /// Messages that received at least one label.
    pub labelled: usize,
}

/// The periodic ingestion task for one deployment, shared across orgs.
#[derive(Clone)]
pub struct PullTask {
    store: TriageStore,
    backend: Arc<dyn MessagingBackend>,
    locks: LockManager,
    states: TaskStateStore,
    cases: CaseIndex,
    engine: ActionEngine,
    registry: LabelRegistry,
}

impl PullTask {
    pub fn new(
        store: TriageStore,
        backend: Arc<dyn MessagingBackend>,
        locks: LockManager,
        states: TaskStateStore,
        cases: CaseIndex,
    ) -> Self {
        let engine = ActionEngine::new(store.clone(), backend.clone(), locks.clone());
        let registry = LabelRegistry::new(store.clone(), backend.clone(), locks.clone());
        Self {
            store,
            backend,
            locks,
            states,
            cases,
            engine,
            registry,
        }
    }

    /// Run the pull once for `org_id`. Serialized per (org, task name): a
    /// concurrent run fails fast with a retryable lock timeout, so two runs
    /// can never compute overlapping windows.
    pub fn run(
        &self,
        org_id: i64,
        org_created_on: DateTime<Utc>,
    ) -> Result<PullResult, TriageError> {
        let _lease = self
            .locks
            .acquire(&LockKey::task(org_id, PULL_TASK_NAME), TASK_LOCK_WAIT)?;

        let started_on = Utc::now();
        let after = self
            .states
            .get(org_id, PULL_TASK_NAME)?
            .map(|state| state.started_on)
            .unwrap_or(org_created_on);

        let new_messages = self.fetch_window(org_id, after, started_on);
        let labelled = self.process(org_id, &new_messages);

        let completed_on = Utc::now();
        let result = PullResult {
            messages: new_messages.len(),
            labelled,
        };
        self.states.set(
            org_id,
            PULL_TASK_NAME,
            &TaskState {
                started_on,
                completed_on,
                last_results: serde_json::to_value(result)?,
            },
            TASK_STATE_TTL,
        )?;

        info!(
            "pulled {} messages for org {} ({} labelled)",
            result.messages, org_id, result.labelled
        );
        Ok(result)
    }

    /// Fetch and persist every page in the window. A failed page fetch ends
    /// the fetch early; everything already persisted is kept.
    fn fetch_window(
        &self,
        org_id: i64,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Vec<Message> {
        let mut new_messages = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = match self
                .backend
                .fetch_messages(org_id, after, before, cursor.as_deref())
            {
                Ok(page) => page,
                Err(err) => {
                    warn!("fetch failed for org {}, ending pull early: {}", org_id, err);
                    break;
                }
            };
            for remote in &page.messages {
                match self.persist(org_id, remote) {
                    Ok(Some(message)) => new_messages.push(message),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(
                            "skipping message {} for org {}: {}",
                            remote.id, org_id, err
                        );
                    }
                }
            }
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        new_messages
    }

    /// Persist one fetched message. Already-handled backend ids are a no-op;
    /// an unhandled row left by an interrupted run is picked up again.
    fn persist(
        &self,
        org_id: i64,
        remote: &RemoteMessage,
    ) -> Result<Option<Message>, TriageError> {
        let kind = match remote.kind.as_str() {
            "flow" => MessageType::Flow,
            _ => MessageType::Inbox,
        };
        let message = self.store.upsert_message(
            org_id,
            remote.id,
            &remote.contact,
            kind,
            &remote.text,
            remote.created_on,
        )?;
        if message.is_handled {
            return Ok(None);
        }
        Ok(Some(message))
    }

    /// Steps 4-6: auto-label the default queue, archive open-case messages
    /// with a case reply event, mark everything handled. Per-item failures
    /// are logged and skipped. Returns the count of labelled messages.
    fn process(&self, org_id: i64, new_messages: &[Message]) -> usize {
        let keyword_map = match self.registry.keyword_map(org_id) {
            Ok(map) => map,
            Err(err) => {
                // No usable keyword config means zero matches, not a dead run.
                warn!("keyword map unavailable for org {}: {}", org_id, err);
                Default::default()
            }
        };

        let mut case_messages: Vec<(i64, Message)> = Vec::new();
        let mut queue_messages: Vec<&Message> = Vec::new();
        for message in new_messages {
            match self.cases.open_case_for_contact(org_id, &message.contact) {
                Ok(Some(case_id)) => case_messages.push((case_id, message.clone())),
                Ok(None) => queue_messages.push(message),
                Err(err) => {
                    warn!(
                        "case lookup failed for contact {} in org {}: {}",
                        message.contact, org_id, err
                    );
                    queue_messages.push(message);
                }
            }
        }

        // One backend call per label, grouped across the messages that
        // matched it.
        let mut by_label: BTreeMap<i64, (Label, Vec<Message>)> = BTreeMap::new();
        let mut labelled: BTreeSet<i64> = BTreeSet::new();
        for message in &queue_messages {
            for label in match_labels(&message.text, &keyword_map) {
                by_label
                    .entry(label.id)
                    .or_insert_with(|| (label.clone(), Vec::new()))
                    .1
                    .push((*message).clone());
                labelled.insert(message.id);
            }
        }
        for (label, batch) in by_label.values() {
            if let Err(err) = self.engine.label(org_id, None, batch, label) {
                warn!(
                    "auto-label {} failed for {} messages in org {}: {}",
                    label.name,
                    batch.len(),
                    org_id,
                    err
                );
            }
        }

        // A contact with an open case gets the message archived onto the case
        // instead of left in the unhandled queue.
        for (case_id, message) in &case_messages {
            if let Err(err) = self
                .engine
                .archive(org_id, None, std::slice::from_ref(message))
            {
                warn!(
                    "case archival failed for message {} in org {}: {}",
                    message.backend_id, org_id, err
                );
            }
            if let Err(err) = self.cases.record_reply_event(*case_id, message.created_on) {
                warn!(
                    "reply event failed for case {} in org {}: {}",
                    case_id, org_id, err
                );
            }
        }

        let handled_ids: Vec<i64> = new_messages.iter().map(|message| message.id).collect();
        if let Err(err) = self.store.mark_handled(&handled_ids) {
            warn!("failed to mark {} messages handled: {}", handled_ids.len(), err);
        }

        labelled.len()
    }
}
