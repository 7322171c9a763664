use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use backend_module::MessagingBackend;

use crate::locks::{LockKey, LockManager};

use super::store::TriageStore;
use super::types::{ActionKind, Activity, Actor, Label, Message, MessageAction, Outgoing, TriageError};

/// How long a bulk operation waits for an entity lock before failing as
/// retryable.
const LOCK_WAIT: Duration = Duration::from_secs(10);

/// Applies bulk state changes to batches of messages: local mirror first, one
/// remote call per batch, one audit record per invocation.
///
/// A remote failure surfaces to the caller but local writes stay committed;
/// the drift is logged and left to the next reconciliation pass.
#[derive(Clone)]
pub struct ActionEngine {
    store: TriageStore,
    backend: Arc<dyn MessagingBackend>,
    locks: LockManager,
}

impl ActionEngine {
    pub fn new(store: TriageStore, backend: Arc<dyn MessagingBackend>, locks: LockManager) -> Self {
        Self {
            store,
            backend,
            locks,
        }
    }

    pub fn flag(
        &self,
        org_id: i64,
        actor: Option<&Actor>,
        messages: &[Message],
    ) -> Result<Option<MessageAction>, TriageError> {
        self.apply(org_id, actor, messages, ActionKind::Flag)
    }

    pub fn unflag(
        &self,
        org_id: i64,
        actor: Option<&Actor>,
        messages: &[Message],
    ) -> Result<Option<MessageAction>, TriageError> {
        self.apply(org_id, actor, messages, ActionKind::Unflag)
    }

    pub fn archive(
        &self,
        org_id: i64,
        actor: Option<&Actor>,
        messages: &[Message],
    ) -> Result<Option<MessageAction>, TriageError> {
        self.apply(org_id, actor, messages, ActionKind::Archive)
    }

    pub fn restore(
        &self,
        org_id: i64,
        actor: Option<&Actor>,
        messages: &[Message],
    ) -> Result<Option<MessageAction>, TriageError> {
        self.apply(org_id, actor, messages, ActionKind::Restore)
    }

    /// Apply `label` to the batch, serialized under the label's entity lock so
    /// concurrent keyword edits and concurrent labeling of the same label
    /// cannot interleave.
    pub fn label(
        &self,
        org_id: i64,
        actor: Option<&Actor>,
        messages: &[Message],
        label: &Label,
    ) -> Result<Option<MessageAction>, TriageError> {
        if messages.is_empty() {
            return Ok(None);
        }
        let _lease = self
            .locks
            .acquire(&LockKey::label(org_id, &label.uuid), LOCK_WAIT)?;
        self.apply(org_id, actor, messages, ActionKind::Label(label.clone()))
    }

    pub fn unlabel(
        &self,
        org_id: i64,
        actor: Option<&Actor>,
        messages: &[Message],
        label: &Label,
    ) -> Result<Option<MessageAction>, TriageError> {
        if messages.is_empty() {
            return Ok(None);
        }
        let _lease = self
            .locks
            .acquire(&LockKey::label(org_id, &label.uuid), LOCK_WAIT)?;
        self.apply(org_id, actor, messages, ActionKind::Unlabel(label.clone()))
    }

    /// Converge one message's labels onto `desired`, under the message's lock.
    ///
    /// Both the current and desired sets are collected eagerly before any
    /// mutation, then one `label`/`unlabel` call is issued per changed label,
    /// each with its own audit record. Already-converged input issues nothing.
    pub fn update_labels(
        &self,
        message: &Message,
        actor: Option<&Actor>,
        desired: &[Label],
    ) -> Result<Vec<MessageAction>, TriageError> {
        let _lease = self.locks.acquire(
            &LockKey::message(message.org_id, message.backend_id),
            LOCK_WAIT,
        )?;

        let current: BTreeSet<i64> = self
            .store
            .label_ids_for_message(message.id)?
            .into_iter()
            .collect();
        let desired_ids: BTreeSet<i64> = desired.iter().map(|label| label.id).collect();

        let to_add: Vec<&Label> = desired
            .iter()
            .filter(|label| !current.contains(&label.id))
            .collect();
        let mut to_remove = Vec::new();
        for label_id in current.difference(&desired_ids) {
            let label = self
                .store
                .get_label(message.org_id, *label_id)?
                .ok_or_else(|| {
                    TriageError::Storage(format!("label {} missing during diff", label_id))
                })?;
            to_remove.push(label);
        }

        let batch = std::slice::from_ref(message);
        let mut recorded = Vec::new();
        for label in to_add {
            if let Some(action) = self.label(message.org_id, actor, batch, label)? {
                recorded.push(action);
            }
        }
        for label in &to_remove {
            if let Some(action) = self.unlabel(message.org_id, actor, batch, label)? {
                recorded.push(action);
            }
        }
        Ok(recorded)
    }

    /// Logical deletion of a message, only callable by the sync machinery.
    pub fn release(&self, message: &Message) -> Result<(), TriageError> {
        self.store.release_message(message.id)
    }

    /// Create an outbound broadcast. The remote platform is asked first; the
    /// local row exists only once dispatch is confirmed, carrying the remote
    /// id and timestamp.
    #[allow(clippy::too_many_arguments)]
    pub fn create_outgoing(
        &self,
        org_id: i64,
        actor: &Actor,
        activity: Activity,
        text: &str,
        contacts: &[String],
        urns: &[String],
        case_id: Option<i64>,
    ) -> Result<Outgoing, TriageError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TriageError::Validation(
                "message text cannot be empty".to_string(),
            ));
        }
        let (broadcast_id, created_on) = self
            .backend
            .create_outgoing(org_id, text, contacts, urns)?;
        self.store.insert_outgoing(
            org_id,
            activity,
            text,
            broadcast_id,
            contacts.len() + urns.len(),
            actor.user_id,
            created_on,
            case_id,
        )
    }

    fn apply(
        &self,
        org_id: i64,
        actor: Option<&Actor>,
        messages: &[Message],
        kind: ActionKind,
    ) -> Result<Option<MessageAction>, TriageError> {
        if messages.is_empty() {
            return Ok(None);
        }
        let message_ids: Vec<i64> = messages.iter().map(|message| message.id).collect();
        let backend_ids: Vec<i64> = messages.iter().map(|message| message.backend_id).collect();

        match &kind {
            ActionKind::Flag => self.store.set_flagged(org_id, &message_ids, true)?,
            ActionKind::Unflag => self.store.set_flagged(org_id, &message_ids, false)?,
            ActionKind::Label(label) => self.store.add_label_to_messages(&message_ids, label.id)?,
            ActionKind::Unlabel(label) => self
                .store
                .remove_label_from_messages(&message_ids, label.id)?,
            ActionKind::Archive => self.store.set_archived(org_id, &message_ids, true)?,
            ActionKind::Restore => self.store.set_archived(org_id, &message_ids, false)?,
        }

        let remote = match &kind {
            ActionKind::Flag => self.backend.flag_messages(org_id, &backend_ids),
            ActionKind::Unflag => self.backend.unflag_messages(org_id, &backend_ids),
            ActionKind::Label(label) => {
                self.backend.label_messages(org_id, &backend_ids, &label.uuid)
            }
            ActionKind::Unlabel(label) => {
                self.backend
                    .unlabel_messages(org_id, &backend_ids, &label.uuid)
            }
            ActionKind::Archive => self.backend.archive_messages(org_id, &backend_ids),
            ActionKind::Restore => self.backend.restore_messages(org_id, &backend_ids),
        };

        let action = self.store.record_action(
            org_id,
            actor.map(|actor| actor.user_id),
            &message_ids,
            kind.code(),
            kind.label().map(|label| label.id),
        )?;

        match remote {
            Ok(()) => {
                info!(
                    "{} applied to {} messages in org {}",
                    kind.code(),
                    message_ids.len(),
                    org_id
                );
                Ok(Some(action))
            }
            Err(err) => {
                warn!(
                    "{} committed locally for {} messages in org {} but remote call failed: {}",
                    kind.code(),
                    message_ids.len(),
                    org_id,
                    err
                );
                Err(err.into())
            }
        }
    }
}
