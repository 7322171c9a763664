#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use backend_module::{BackendError, MessagingBackend, RemoteMessage, RemoteMessagePage};
use triage_module::cases::CaseIndex;
use triage_module::locks::LockManager;
use triage_module::org_state::TaskStateStore;
use triage_module::{ActionEngine, LabelRegistry, PullTask, TriageStore};

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    CreateLabel {
        name: String,
    },
    Fetch {
        after: DateTime<Utc>,
        before: DateTime<Utc>,
        cursor: Option<String>,
    },
    Flag(Vec<i64>),
    Unflag(Vec<i64>),
    Archive(Vec<i64>),
    Restore(Vec<i64>),
    Label {
        messages: Vec<i64>,
        label: String,
    },
    Unlabel {
        messages: Vec<i64>,
        label: String,
    },
    CreateOutgoing {
        text: String,
    },
}

/// Backend double that serves queued pages of remote messages and records
/// every call made against it.
#[derive(Default)]
pub struct ScriptedBackend {
    pages: Mutex<VecDeque<RemoteMessagePage>>,
    calls: Mutex<Vec<BackendCall>>,
    fail_fetch: AtomicBool,
    label_counter: Mutex<u32>,
}

impl ScriptedBackend {
    pub fn queue_page(&self, messages: Vec<RemoteMessage>, next_cursor: Option<&str>) {
        self.pages.lock().expect("pages lock").push_back(RemoteMessagePage {
            messages,
            next_cursor: next_cursor.map(str::to_string),
        });
    }

    pub fn fail_next_fetch(&self) {
        self.fail_fetch.store(true, Ordering::Relaxed);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Calls recorded since index `from`, with fetches filtered out.
    pub fn action_calls_since(&self, from: usize) -> Vec<BackendCall> {
        self.calls()
            .into_iter()
            .skip(from)
            .filter(|call| !matches!(call, BackendCall::Fetch { .. } | BackendCall::CreateLabel { .. }))
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

impl MessagingBackend for ScriptedBackend {
    fn create_label(&self, _org_id: i64, name: &str) -> Result<String, BackendError> {
        self.record(BackendCall::CreateLabel {
            name: name.to_string(),
        });
        let mut counter = self.label_counter.lock().expect("counter lock");
        *counter += 1;
        Ok(format!("L-{:03}", counter))
    }

    fn fetch_messages(
        &self,
        _org_id: i64,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
        cursor: Option<&str>,
    ) -> Result<RemoteMessagePage, BackendError> {
        self.record(BackendCall::Fetch {
            after,
            before,
            cursor: cursor.map(str::to_string),
        });
        if self.fail_fetch.swap(false, Ordering::Relaxed) {
            return Err(BackendError::Api {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(self
            .pages
            .lock()
            .expect("pages lock")
            .pop_front()
            .unwrap_or_default())
    }

    fn flag_messages(&self, _org_id: i64, messages: &[i64]) -> Result<(), BackendError> {
        self.record(BackendCall::Flag(messages.to_vec()));
        Ok(())
    }

    fn unflag_messages(&self, _org_id: i64, messages: &[i64]) -> Result<(), BackendError> {
        self.record(BackendCall::Unflag(messages.to_vec()));
        Ok(())
    }

    fn archive_messages(&self, _org_id: i64, messages: &[i64]) -> Result<(), BackendError> {
        self.record(BackendCall::Archive(messages.to_vec()));
        Ok(())
    }

    fn restore_messages(&self, _org_id: i64, messages: &[i64]) -> Result<(), BackendError> {
        self.record(BackendCall::Restore(messages.to_vec()));
        Ok(())
    }

    fn label_messages(
        &self,
        _org_id: i64,
        messages: &[i64],
        label_uuid: &str,
    ) -> Result<(), BackendError> {
        self.record(BackendCall::Label {
            messages: messages.to_vec(),
            label: label_uuid.to_string(),
        });
        Ok(())
    }

    fn unlabel_messages(
        &self,
        _org_id: i64,
        messages: &[i64],
        label_uuid: &str,
    ) -> Result<(), BackendError> {
        self.record(BackendCall::Unlabel {
            messages: messages.to_vec(),
            label: label_uuid.to_string(),
        });
        Ok(())
    }

    fn create_outgoing(
        &self,
        _org_id: i64,
        text: &str,
        _contacts: &[String],
        _urns: &[String],
    ) -> Result<(i64, DateTime<Utc>), BackendError> {
        self.record(BackendCall::CreateOutgoing {
            text: text.to_string(),
        });
        Ok((201, Utc::now()))
    }
}

pub struct PullHarness {
    pub temp: TempDir,
    pub store: TriageStore,
    pub locks: LockManager,
    pub states: TaskStateStore,
    pub cases: CaseIndex,
    pub backend: Arc<ScriptedBackend>,
    pub registry: LabelRegistry,
    pub engine: ActionEngine,
    pub task: PullTask,
}

pub fn pull_harness() -> PullHarness {
    let temp = TempDir::new().expect("tempdir");
    let store = TriageStore::new(temp.path().join("triage.db")).expect("store");
    let locks = LockManager::new(temp.path().join("locks.db")).expect("locks");
    let states = TaskStateStore::new(temp.path().join("states.db")).expect("states");
    let cases = CaseIndex::new(temp.path().join("cases.db")).expect("cases");
    let backend = Arc::new(ScriptedBackend::default());
    let registry = LabelRegistry::new(store.clone(), backend.clone(), locks.clone());
    let engine = ActionEngine::new(store.clone(), backend.clone(), locks.clone());
    let task = PullTask::new(
        store.clone(),
        backend.clone(),
        locks.clone(),
        states.clone(),
        cases.clone(),
    );
    PullHarness {
        temp,
        store,
        locks,
        states,
        cases,
        backend,
        registry,
        engine,
        task,
    }
}

pub fn remote_message(
    id: i64,
    contact: &str,
    text: &str,
    created_on: DateTime<Utc>,
) -> RemoteMessage {
    RemoteMessage {
        id,
        contact: contact.to_string(),
        text: text.to_string(),
        kind: "inbox".to_string(),
        created_on,
    }
}
