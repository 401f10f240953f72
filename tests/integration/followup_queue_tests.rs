//! Follow-up handling: queue-while-busy semantics and follow-ups on idle
//! sessions.

use std::sync::Arc;
use std::time::Duration;

use acp_bridge::adapter::ServiceAdapter;

use super::test_helpers::{build_manager, request, stub_config, RecordingAdapter};

/// S2: a follow-up arriving while a turn is in flight queues and is issued
/// exactly after the first turn completes; both completions arrive in
/// order.
#[tokio::test]
async fn followup_while_busy_queues_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, _store) = build_manager(stub_config(dir.path())).await;
    let adapter = RecordingAdapter::new("webhook:default");
    let dyn_adapter: Arc<dyn ServiceAdapter> = Arc::clone(&adapter) as Arc<dyn ServiceAdapter>;

    // First turn parks for ~300 ms inside the agent.
    let opening = {
        let manager = Arc::clone(&manager);
        let adapter = Arc::clone(&dyn_adapter);
        tokio::spawn(async move {
            manager
                .handle_new_session(
                    adapter,
                    request("svc-a:issue-1", "webhook:default", "work briefly on this"),
                )
                .await
        })
    };

    // Wait until the first turn is visibly running (the agent's own
    // thoughts only flow mid-turn), then inject.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let thinking = adapter.events().iter().any(|e| {
            matches!(
                e,
                super::test_helpers::AdapterEvent::Update(
                    acp_bridge::models::update::BridgeUpdate::Thought { text }
                ) if text.contains("Reading the request.")
            )
        });
        if thinking {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "first turn never became visible"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    manager
        .handle_followup("svc-a:issue-1", "also lowercase it")
        .await
        .expect("follow-up must queue");

    opening.await.expect("join").expect("opening turn");

    // The queued turn runs to completion after the first.
    adapter.wait_terminal(Duration::from_secs(5)).await;
    let mut completions = adapter.completions();
    if completions.len() < 2 {
        adapter.wait_terminal(Duration::from_secs(5)).await;
        completions = adapter.completions();
    }

    assert_eq!(completions.len(), 2, "both turns must complete: {completions:?}");
    assert_eq!(
        completions[0], "Work completed",
        "first turn emits no message text, so the fixed notice is used"
    );
    assert_eq!(
        completions[1], "Done. The change is in place.",
        "queued follow-up runs the default script"
    );
}

/// A follow-up on an idle live session reuses the running agent.
#[tokio::test]
async fn followup_on_idle_session_reuses_agent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, store) = build_manager(stub_config(dir.path())).await;
    let adapter = RecordingAdapter::new("webhook:default");
    let dyn_adapter: Arc<dyn ServiceAdapter> = Arc::clone(&adapter) as Arc<dyn ServiceAdapter>;

    manager
        .handle_new_session(dyn_adapter, request("svc:idle", "webhook:default", "first task"))
        .await
        .expect("opening session");
    let original_id = store.get("svc:idle").await.expect("record").acp_session_id;

    manager
        .handle_followup("svc:idle", "second task")
        .await
        .expect("follow-up");

    assert_eq!(adapter.completions().len(), 2);
    let after = store.get("svc:idle").await.expect("record").acp_session_id;
    assert_eq!(original_id, after, "agent session id is immutable");
}

/// A follow-up for an unknown session fails with `NoSuchSession`.
#[tokio::test]
async fn followup_unknown_session_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, _store) = build_manager(stub_config(dir.path())).await;

    let result = manager.handle_followup("ghost:1", "hello?").await;
    assert!(
        matches!(result, Err(acp_bridge::AppError::NoSuchSession(_))),
        "got: {result:?}"
    );
}

/// A duplicate "created" event for a live session is treated as a
/// follow-up, never a second session.
#[tokio::test]
async fn duplicate_created_event_becomes_followup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, store) = build_manager(stub_config(dir.path())).await;
    let adapter = RecordingAdapter::new("webhook:default");
    let dyn_adapter: Arc<dyn ServiceAdapter> = Arc::clone(&adapter) as Arc<dyn ServiceAdapter>;

    manager
        .handle_new_session(
            Arc::clone(&dyn_adapter),
            request("svc:dup", "webhook:default", "first"),
        )
        .await
        .expect("opening session");
    let original_cwd = store.get("svc:dup").await.expect("record").cwd;

    manager
        .handle_new_session(dyn_adapter, request("svc:dup", "webhook:default", "again"))
        .await
        .expect("duplicate dispatch");

    let after = store.get("svc:dup").await.expect("record");
    assert_eq!(after.cwd, original_cwd, "no second worktree is provisioned");
    assert_eq!(adapter.completions().len(), 2, "both turns complete");
}
