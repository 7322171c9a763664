use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tracing::info;

use backend_module::MessagingBackend;

use crate::locks::{LockKey, LockManager};
use crate::normalize::normalize;

use super::store::TriageStore;
use super::types::{Actor, Label, TriageError, KEYWORD_MIN_LENGTH};

/// Reserved by the remote platform for its own flagging mechanism.
const RESERVED_LABEL_NAME: &str = "flagged";

static KEYWORD_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\w[\w\- ]*\w$").unwrap_or_else(|err| panic!("keyword pattern: {err}"))
});

/// True iff the token can serve as a label keyword: at least three normalized
/// characters, starting and ending in a word character.
pub fn is_valid_keyword(keyword: &str) -> bool {
    normalize(keyword).chars().count() >= KEYWORD_MIN_LENGTH && KEYWORD_PATTERN.is_match(keyword)
}

/// Active labels per organization and the keyword lookup built from them.
#[derive(Clone)]
pub struct LabelRegistry {
    store: TriageStore,
    backend: Arc<dyn MessagingBackend>,
    locks: LockManager,
}

impl LabelRegistry {
    pub fn new(store: TriageStore, backend: Arc<dyn MessagingBackend>, locks: LockManager) -> Self {
        Self {
            store,
            backend,
            locks,
        }
    }

    /// Create a label, registering it with the remote platform first. If the
    /// remote call fails no local row is created.
    pub fn create(
        &self,
        org_id: i64,
        name: &str,
        description: Option<&str>,
        keywords: &[String],
    ) -> Result<Label, TriageError> {
        let name = name.trim();
        validate_name(name)?;
        let keywords = validate_keywords(keywords)?;

        let uuid = self.backend.create_label(org_id, name)?;
        let label = self
            .store
            .insert_label(org_id, &uuid, name, description, &keywords)?;
        info!("created label {} ({}) for org {}", label.name, label.uuid, org_id);
        Ok(label)
    }

    /// Active labels visible to `actor`; `None` means an administrative
    /// context with full visibility.
    pub fn get_active(
        &self,
        org_id: i64,
        actor: Option<&Actor>,
    ) -> Result<Vec<Label>, TriageError> {
        let labels = self.store.get_active_labels(org_id)?;
        match actor {
            Some(actor) if !actor.is_admin => Ok(labels
                .into_iter()
                .filter(|label| actor.partner_labels.contains(&label.id))
                .collect()),
            _ => Ok(labels),
        }
    }

    /// Map of normalized keyword to label across all active labels.
    ///
    /// Labels are iterated in ascending id order and the first label to claim
    /// a keyword keeps it, so on collision the lowest label id wins.
    pub fn keyword_map(&self, org_id: i64) -> Result<HashMap<String, Label>, TriageError> {
        let mut map = HashMap::new();
        for label in self.store.get_active_labels(org_id)? {
            for keyword in &label.keywords {
                if let Entry::Vacant(entry) = map.entry(normalize(keyword)) {
                    entry.insert(label.clone());
                }
            }
        }
        Ok(map)
    }

    /// Replace a label's keyword list under the label's entity lock, so edits
    /// serialize against auto-labeling of messages under that label.
    pub fn update_keywords(
        &self,
        label: &Label,
        keywords: &[String],
        wait: Duration,
    ) -> Result<Label, TriageError> {
        let keywords = validate_keywords(keywords)?;
        let _lease = self
            .locks
            .acquire(&LockKey::label(label.org_id, &label.uuid), wait)?;
        self.store.set_label_keywords(label.id, &keywords)?;
        Ok(Label {
            keywords,
            ..label.clone()
        })
    }

    /// Deactivate a label. Rows are never hard-deleted.
    pub fn release(&self, label: &Label) -> Result<(), TriageError> {
        self.store.release_label(label.id)
    }
}

fn validate_name(name: &str) -> Result<(), TriageError> {
    if name.to_lowercase() == RESERVED_LABEL_NAME {
        return Err(TriageError::Validation("reserved label name".to_string()));
    }
    if name.starts_with('+') || name.starts_with('-') {
        return Err(TriageError::Validation(
            "label name cannot start with + or -".to_string(),
        ));
    }
    Ok(())
}

fn validate_keywords(keywords: &[String]) -> Result<Vec<String>, TriageError> {
    let mut clean = Vec::with_capacity(keywords.len());
    for keyword in keywords {
        if !is_valid_keyword(keyword) {
            return Err(TriageError::Validation(format!(
                "invalid keyword: {}",
                keyword
            )));
        }
        clean.push(normalize(keyword));
    }
    Ok(clean)
}
