//! End-to-end session flow against the stub agent: the new-session happy
//! path and the permission auto-approval round-trip.

use std::sync::Arc;
use std::time::Duration;

use acp_bridge::adapter::ServiceAdapter;
use acp_bridge::models::update::{ActionStatus, BridgeUpdate};

use super::test_helpers::{build_manager, request, stub_config, AdapterEvent, RecordingAdapter};

/// S1: a new session provisions a working directory, handshakes, streams
/// thought and action updates, persists a non-empty agent session id, and
/// delivers exactly one completion.
#[tokio::test]
async fn new_session_happy_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, store) = build_manager(stub_config(dir.path())).await;
    let adapter = RecordingAdapter::new("webhook:default");
    let dyn_adapter: Arc<dyn ServiceAdapter> = Arc::clone(&adapter) as Arc<dyn ServiceAdapter>;

    manager
        .handle_new_session(dyn_adapter, request("svc-a:issue-1", "webhook:default", "fix the typo"))
        .await
        .expect("new session must succeed");

    let events = adapter.events();
    let thoughts = events
        .iter()
        .filter(|e| matches!(e, AdapterEvent::Update(BridgeUpdate::Thought { .. })))
        .count();
    assert!(thoughts >= 1, "at least one thought expected: {events:?}");

    let final_action = events
        .iter()
        .rev()
        .find_map(|e| match e {
            AdapterEvent::Update(BridgeUpdate::Action { status, result, .. }) => {
                Some((*status, result.clone()))
            }
            _ => None,
        })
        .expect("an action update must be observed");
    assert_eq!(final_action.0, ActionStatus::Completed);
    assert!(final_action.1.is_some(), "completed action carries a result");

    let completions = adapter.completions();
    assert_eq!(completions.len(), 1, "exactly one completion: {completions:?}");
    assert_eq!(completions[0], "Done. The change is in place.");
    assert!(adapter.errors().is_empty(), "no errors on the happy path");

    let record = store
        .get("svc-a:issue-1")
        .await
        .expect("session must be persisted");
    assert!(
        record.acp_session_id.starts_with("stub-"),
        "agent session id must be recorded, got '{}'",
        record.acp_session_id
    );
    assert!(!record.cwd.is_empty(), "worktree path must be recorded");
}

/// Two concurrent sessions get distinct working directories.
#[tokio::test]
async fn concurrent_sessions_have_exclusive_cwds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, store) = build_manager(stub_config(dir.path())).await;
    let adapter = RecordingAdapter::new("webhook:default");
    let dyn_adapter: Arc<dyn ServiceAdapter> = Arc::clone(&adapter) as Arc<dyn ServiceAdapter>;

    let first = {
        let manager = Arc::clone(&manager);
        let adapter = Arc::clone(&dyn_adapter);
        tokio::spawn(async move {
            manager
                .handle_new_session(adapter, request("svc:1", "webhook:default", "task one"))
                .await
        })
    };
    let second = {
        let manager = Arc::clone(&manager);
        let adapter = Arc::clone(&dyn_adapter);
        tokio::spawn(async move {
            manager
                .handle_new_session(adapter, request("svc:2", "webhook:default", "task two"))
                .await
        })
    };
    first.await.expect("join").expect("session one");
    second.await.expect("join").expect("session two");

    let one = store.get("svc:1").await.expect("record one");
    let two = store.get("svc:2").await.expect("record two");
    assert_ne!(one.cwd, two.cwd, "worktrees must be exclusively owned");
}

/// The agent's permission request is auto-approved, preferring
/// `allow_always`; the agent reports which option the bridge selected.
#[tokio::test]
async fn permission_prompt_is_auto_approved() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, _store) = build_manager(stub_config(dir.path())).await;
    let adapter = RecordingAdapter::new("webhook:default");
    let dyn_adapter: Arc<dyn ServiceAdapter> = Arc::clone(&adapter) as Arc<dyn ServiceAdapter>;

    manager
        .handle_new_session(
            dyn_adapter,
            request("svc:perm", "webhook:default", "ask permission before writing"),
        )
        .await
        .expect("session must succeed");

    let completions = adapter.completions();
    assert_eq!(
        completions,
        vec!["permission:opt-allow-always".to_owned()],
        "the allow_always option must have been selected"
    );
}

/// A refusal stop reason surfaces as an error, not a completion.
#[tokio::test]
async fn refusal_surfaces_as_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, _store) = build_manager(stub_config(dir.path())).await;
    let adapter = RecordingAdapter::new("webhook:default");
    let dyn_adapter: Arc<dyn ServiceAdapter> = Arc::clone(&adapter) as Arc<dyn ServiceAdapter>;

    manager
        .handle_new_session(dyn_adapter, request("svc:ref", "webhook:default", "refuse this"))
        .await
        .expect("dispatch must succeed");

    assert!(adapter.completions().is_empty(), "no completion on refusal");
    let errors = adapter.errors();
    assert_eq!(errors.len(), 1, "exactly one error: {errors:?}");
    assert!(
        errors[0].contains("refusal"),
        "error must name the stop reason: {}",
        errors[0]
    );
}

/// A request for an unknown agent is reported through `send_error` and
/// leaves no tracked session behind.
#[tokio::test]
async fn unknown_agent_reports_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, store) = build_manager(stub_config(dir.path())).await;
    let adapter = RecordingAdapter::new("webhook:default");
    let dyn_adapter: Arc<dyn ServiceAdapter> = Arc::clone(&adapter) as Arc<dyn ServiceAdapter>;

    let mut bad = request("svc:bad", "webhook:default", "hello");
    bad.agent_name = "missing-agent".into();
    manager
        .handle_new_session(dyn_adapter, bad)
        .await
        .expect("dispatch must succeed");

    let event = adapter.wait_terminal(Duration::from_secs(5)).await;
    assert!(matches!(event, AdapterEvent::Error(_)), "got: {event:?}");
    assert!(store.get("svc:bad").await.is_none(), "no record persisted");
}
