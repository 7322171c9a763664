mod test_support;

use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;

use test_support::{pull_harness, remote_message, BackendCall};
use triage_module::cases::CASE_EVENT_REPLY;
use triage_module::locks::{LockError, LockKey};
use triage_module::{TriageError, PULL_TASK_NAME};

const ORG: i64 = 1;

#[test]
fn pull_labels_archives_and_records_state() {
    let harness = pull_harness();
    let org_created_on = Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap();

    let aids = harness
        .registry
        .create(ORG, "AIDS", None, &["aids".to_string(), "hiv".to_string()])
        .expect("aids label");
    let pregnancy = harness
        .registry
        .create(ORG, "Pregnancy", None, &["pregnant".to_string()])
        .expect("pregnancy label");

    let d1 = Utc.with_ymd_and_hms(2014, 1, 1, 7, 0, 0).unwrap();
    let d2 = Utc.with_ymd_and_hms(2014, 1, 1, 8, 0, 0).unwrap();
    let d3 = Utc.with_ymd_and_hms(2014, 1, 1, 9, 0, 0).unwrap();
    let d4 = Utc.with_ymd_and_hms(2014, 1, 1, 10, 0, 0).unwrap();
    let d5 = Utc.with_ymd_and_hms(2014, 1, 1, 11, 0, 0).unwrap();

    // Two pages, to exercise cursor pagination.
    harness.backend.queue_page(
        vec![
            remote_message(101, "C-001", "What is aids?", d1),
            remote_message(102, "C-002", "Can I catch Hiv?", d2),
            remote_message(103, "C-003", "I think I'm pregnant", d3),
        ],
        Some("page-2"),
    );
    harness.backend.queue_page(
        vec![
            remote_message(104, "C-004", "Php is amaze", d4),
            remote_message(105, "C-005", "Thanks for the pregnancy/HIV info", d5),
        ],
        None,
    );

    // Contact C-005 has an open case when their message arrives.
    let case_id = harness
        .cases
        .open_case(ORG, "C-005", Utc.with_ymd_and_hms(2014, 1, 1, 5, 0, 0).unwrap())
        .expect("open case");

    let calls_before = harness.backend.call_count();
    let result = harness.task.run(ORG, org_created_on).expect("pull run");

    assert_eq!(result.messages, 5);
    assert_eq!(result.labelled, 3);

    // The first run's window starts at org creation.
    let fetches: Vec<BackendCall> = harness
        .backend
        .calls()
        .into_iter()
        .filter(|call| matches!(call, BackendCall::Fetch { .. }))
        .collect();
    assert_eq!(fetches.len(), 2);
    match &fetches[0] {
        BackendCall::Fetch { after, cursor, .. } => {
            assert_eq!(*after, org_created_on);
            assert!(cursor.is_none());
        }
        other => panic!("expected fetch, got {other:?}"),
    }
    match &fetches[1] {
        BackendCall::Fetch { cursor, .. } => assert_eq!(cursor.as_deref(), Some("page-2")),
        other => panic!("expected fetch, got {other:?}"),
    }

    // Label applications are grouped per label; the open-case message is
    // archived instead of labelled.
    assert_eq!(
        harness.backend.action_calls_since(calls_before),
        vec![
            BackendCall::Label {
                messages: vec![101, 102],
                label: aids.uuid.clone(),
            },
            BackendCall::Label {
                messages: vec![103],
                label: pregnancy.uuid.clone(),
            },
            BackendCall::Archive(vec![105]),
        ]
    );

    // Reply event carries the message's own timestamp.
    let events = harness.cases.events_for_case(case_id).expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, CASE_EVENT_REPLY);
    assert_eq!(events[0].created_on, d5);

    // Every pulled message ends up handled, matched or not.
    for backend_id in [101, 102, 103, 104, 105] {
        let message = harness
            .store
            .get_message_by_backend_id(ORG, backend_id)
            .expect("get message")
            .expect("message row");
        assert!(message.is_handled, "message {backend_id} not handled");
    }

    let labelled_message = harness
        .store
        .get_message_by_backend_id(ORG, 101)
        .expect("get")
        .expect("row");
    assert_eq!(
        harness.store.label_ids_for_message(labelled_message.id).expect("labels"),
        vec![aids.id]
    );
    let history = harness
        .store
        .actions_for_message(labelled_message.id)
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, "label");
    assert_eq!(history[0].label_id, Some(aids.id));
    assert_eq!(history[0].created_by, None);

    // The unmatched message gets no labels and no audit trail.
    let unmatched = harness
        .store
        .get_message_by_backend_id(ORG, 104)
        .expect("get")
        .expect("row");
    assert!(harness.store.label_ids_for_message(unmatched.id).expect("labels").is_empty());
    assert!(harness.store.actions_for_message(unmatched.id).expect("history").is_empty());

    // The open-case message is archived, not labelled.
    let cased = harness
        .store
        .get_message_by_backend_id(ORG, 105)
        .expect("get")
        .expect("row");
    assert!(cased.is_archived);
    assert!(harness.store.label_ids_for_message(cased.id).expect("labels").is_empty());

    let state = harness
        .states
        .get(ORG, PULL_TASK_NAME)
        .expect("get state")
        .expect("state present");
    assert_eq!(state.last_results, json!({"messages": 5, "labelled": 3}));
}

#[test]
fn second_run_does_not_reprocess_handled_messages() {
    let harness = pull_harness();
    let org_created_on = Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap();
    harness
        .registry
        .create(ORG, "AIDS", None, &["aids".to_string()])
        .expect("label");

    let d1 = Utc.with_ymd_and_hms(2014, 1, 1, 7, 0, 0).unwrap();
    let page = vec![remote_message(101, "C-001", "What is aids?", d1)];
    harness.backend.queue_page(page.clone(), None);

    let first = harness.task.run(ORG, org_created_on).expect("first run");
    assert_eq!(first.messages, 1);
    assert_eq!(first.labelled, 1);
    let first_state = harness
        .states
        .get(ORG, PULL_TASK_NAME)
        .expect("get")
        .expect("state");

    // The remote backend re-serves the same message; it is already handled.
    let calls_before = harness.backend.call_count();
    harness.backend.queue_page(page, None);
    let second = harness.task.run(ORG, org_created_on).expect("second run");

    assert_eq!(second.messages, 0);
    assert_eq!(second.labelled, 0);
    assert!(harness.backend.action_calls_since(calls_before).is_empty());

    // State is rewritten on every run and the next window starts where the
    // previous run began.
    let second_state = harness
        .states
        .get(ORG, PULL_TASK_NAME)
        .expect("get")
        .expect("state");
    assert_eq!(second_state.last_results, json!({"messages": 0, "labelled": 0}));
    assert!(second_state.started_on >= first_state.started_on);
    let last_fetch = harness
        .backend
        .calls()
        .into_iter()
        .rev()
        .find(|call| matches!(call, BackendCall::Fetch { .. }))
        .expect("fetch call");
    match last_fetch {
        BackendCall::Fetch { after, .. } => assert_eq!(after, first_state.started_on),
        other => panic!("expected fetch, got {other:?}"),
    }
}

#[test]
fn concurrent_run_fails_fast_with_lock_timeout() {
    let harness = pull_harness();
    let _held = harness
        .locks
        .acquire(&LockKey::task(ORG, PULL_TASK_NAME), Duration::from_millis(10))
        .expect("hold task lock");

    let err = harness
        .task
        .run(ORG, Utc::now())
        .expect_err("run should fail while lock is held");
    assert!(matches!(err, TriageError::Lock(LockError::Timeout(_))));

    // Nothing was recorded for the aborted run.
    assert!(harness.states.get(ORG, PULL_TASK_NAME).expect("get").is_none());
}

#[test]
fn fetch_failure_still_records_run_state() {
    let harness = pull_harness();
    harness.backend.fail_next_fetch();

    let result = harness.task.run(ORG, Utc::now()).expect("run");

    assert_eq!(result.messages, 0);
    assert_eq!(result.labelled, 0);
    let state = harness
        .states
        .get(ORG, PULL_TASK_NAME)
        .expect("get")
        .expect("state recorded despite fetch failure");
    assert_eq!(state.last_results, json!({"messages": 0, "labelled": 0}));
}

#[test]
fn open_case_at_ingestion_time_routes_message_onto_the_case() {
    let harness = pull_harness();
    let now = Utc::now();
    let case_id = harness
        .cases
        .open_case(ORG, "C-009", now - chrono::Duration::hours(2))
        .expect("open case");

    let message_on = now - chrono::Duration::minutes(30);
    harness
        .backend
        .queue_page(vec![remote_message(201, "C-009", "hello again", message_on)], None);

    let result = harness
        .task
        .run(ORG, now - chrono::Duration::days(1))
        .expect("run");
    assert_eq!(result.messages, 1);
    assert_eq!(result.labelled, 0);

    let message = harness
        .store
        .get_message_by_backend_id(ORG, 201)
        .expect("get")
        .expect("row");
    assert!(message.is_archived);
    assert!(message.is_handled);

    let events = harness.cases.events_for_case(case_id).expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].created_on, message_on);

    // A closed case no longer captures new messages.
    harness.cases.close_case(case_id, now).expect("close");
    harness
        .backend
        .queue_page(vec![remote_message(202, "C-009", "one more", now)], None);
    harness.task.run(ORG, now - chrono::Duration::days(1)).expect("second run");

    let message = harness
        .store
        .get_message_by_backend_id(ORG, 202)
        .expect("get")
        .expect("row");
    assert!(!message.is_archived);
    assert!(message.is_handled);
}
