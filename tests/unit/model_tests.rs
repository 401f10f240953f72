//! Unit tests for domain model serialization.

use serde_json::json;

use acp_bridge::acp::protocol::{SessionUpdate, StopReason};
use acp_bridge::models::update::{ActionStatus, BridgeUpdate, PlanEntryStatus};
use acp_bridge::models::PersistedSession;

/// `BridgeUpdate` serializes with a snake_case `type` tag.
#[test]
fn bridge_update_tagged_serialization() {
    let update = BridgeUpdate::Action {
        id: "T1".into(),
        title: "Run tests".into(),
        kind: "execute".into(),
        status: ActionStatus::InProgress,
        result: None,
    };

    let value = serde_json::to_value(&update).expect("serialize");
    assert_eq!(value["type"], "action");
    assert_eq!(value["status"], "in_progress");
    assert!(
        value.get("result").is_none(),
        "absent result must be omitted"
    );

    let thought = BridgeUpdate::Thought {
        text: "hmm".into(),
    };
    assert_eq!(
        serde_json::to_value(&thought).expect("serialize")["type"],
        "thought"
    );
}

/// Plan entry statuses use the camelCase wire spelling.
#[test]
fn plan_entry_status_spelling() {
    assert_eq!(
        serde_json::to_value(PlanEntryStatus::InProgress).expect("serialize"),
        json!("inProgress")
    );
    assert_eq!(
        serde_json::from_value::<PlanEntryStatus>(json!("canceled")).expect("parse"),
        PlanEntryStatus::Canceled
    );
}

/// Stop reasons parse from their wire spelling.
#[test]
fn stop_reason_parsing() {
    assert_eq!(
        serde_json::from_value::<StopReason>(json!("end_turn")).expect("parse"),
        StopReason::EndTurn
    );
    assert_eq!(
        serde_json::from_value::<StopReason>(json!("max_turn_requests")).expect("parse"),
        StopReason::MaxTurnRequests
    );
    assert_eq!(StopReason::Cancelled.as_str(), "cancelled");
}

/// `session/update` payloads parse by their `sessionUpdate` discriminator,
/// and unknown kinds fail (the client skips them).
#[test]
fn session_update_discriminator() {
    let parsed: SessionUpdate = serde_json::from_value(json!({
        "sessionUpdate": "agent_message_chunk",
        "content": { "type": "text", "text": "hi" },
    }))
    .expect("known kind must parse");
    assert!(matches!(parsed, SessionUpdate::AgentMessageChunk { .. }));

    let unknown = serde_json::from_value::<SessionUpdate>(json!({
        "sessionUpdate": "available_commands_update",
        "availableCommands": [],
    }));
    assert!(unknown.is_err(), "unknown kinds must fail to parse");
}

/// Non-text content blocks are tolerated and read as empty text.
#[test]
fn non_text_content_blocks_are_tolerated() {
    let parsed: SessionUpdate = serde_json::from_value(json!({
        "sessionUpdate": "agent_message_chunk",
        "content": { "type": "image", "data": "...", "mimeType": "image/png" },
    }))
    .expect("non-text block must still parse");
    match parsed {
        SessionUpdate::AgentMessageChunk { content } => assert_eq!(content.text(), ""),
        other => panic!("expected AgentMessageChunk, got: {other:?}"),
    }
}

/// Persisted sessions survive a serde round-trip and keep fields this
/// build does not know about.
#[test]
fn persisted_session_preserves_unknown_fields() {
    let raw = json!({
        "external_session_id": "svc:1",
        "service_name": "webhook:claude",
        "agent_name": "claude",
        "acp_session_id": "sess-9",
        "cwd": "/var/lib/acp-bridge/worktrees/fix-1",
        "branch_name": "acp-agent/fix-1",
        "service_metadata": { "thread_ts": "171234.5678" },
        "future_field": { "added_by": "a newer build" },
    });

    let parsed: PersistedSession = serde_json::from_value(raw).expect("parse");
    assert_eq!(parsed.acp_session_id, "sess-9");
    assert_eq!(parsed.service_type(), "webhook");
    assert!(
        parsed.extra.contains_key("future_field"),
        "unknown fields must be preserved"
    );

    let reserialized = serde_json::to_value(&parsed).expect("serialize");
    assert_eq!(
        reserialized["future_field"]["added_by"], "a newer build",
        "unknown fields must survive the round-trip"
    );
}

/// Missing optional fields default rather than failing the parse.
#[test]
fn persisted_session_missing_fields_default() {
    let raw = json!({
        "external_session_id": "svc:2",
        "service_name": "webhook",
        "cwd": "/tmp/w",
    });

    let parsed: PersistedSession = serde_json::from_value(raw).expect("parse");
    assert_eq!(parsed.agent_name, "");
    assert_eq!(parsed.acp_session_id, "");
    assert_eq!(parsed.branch_name, "");
}
