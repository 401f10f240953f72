//! Unit tests for the atomic JSON session store.

use serde_json::json;

use acp_bridge::models::PersistedSession;
use acp_bridge::persistence::SessionStore;

fn record(external_id: &str, acp_id: &str) -> PersistedSession {
    serde_json::from_value(json!({
        "external_session_id": external_id,
        "service_name": "webhook:claude",
        "agent_name": "claude",
        "acp_session_id": acp_id,
        "cwd": format!("/data/worktrees/{external_id}"),
        "branch_name": format!("acp-agent/{external_id}-1"),
        "service_metadata": { "channel": "C1" },
    }))
    .expect("test record must parse")
}

/// Upserted records survive a reopen with all fields equal.
#[tokio::test]
async fn round_trip_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sessions.json");

    let store = SessionStore::open(&path).await;
    store.upsert(record("svc:1", "sess-a")).await.expect("upsert");
    store.upsert(record("svc:2", "sess-b")).await.expect("upsert");

    let reopened = SessionStore::open(&path).await;
    let loaded = reopened.get("svc:1").await.expect("record must exist");
    assert_eq!(loaded.acp_session_id, "sess-a");
    assert_eq!(loaded.service_name, "webhook:claude");
    assert_eq!(loaded.service_metadata["channel"], "C1");
    assert_eq!(reopened.all().await.len(), 2);
}

/// Removal deletes the record and persists the deletion.
#[tokio::test]
async fn remove_deletes_durably() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sessions.json");

    let store = SessionStore::open(&path).await;
    store.upsert(record("svc:1", "sess-a")).await.expect("upsert");
    store.remove("svc:1").await.expect("remove");
    assert!(store.get("svc:1").await.is_none());

    let reopened = SessionStore::open(&path).await;
    assert!(reopened.get("svc:1").await.is_none());
}

/// Writes go through a temp file that does not linger.
#[tokio::test]
async fn atomic_write_leaves_no_temp_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sessions.json");

    let store = SessionStore::open(&path).await;
    store.upsert(record("svc:1", "sess-a")).await.expect("upsert");

    assert!(path.is_file(), "document must exist");
    assert!(
        !dir.path().join("sessions.json.tmp").exists(),
        "temp file must be renamed away"
    );
}

/// A corrupt document degrades to an empty store instead of failing boot.
#[tokio::test]
async fn corrupt_document_starts_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sessions.json");
    tokio::fs::write(&path, b"{ not json at all").await.expect("write");

    let store = SessionStore::open(&path).await;
    assert!(store.all().await.is_empty());
}

/// Fields written by a newer build survive a read-modify-write cycle.
#[tokio::test]
async fn unknown_fields_survive_rewrite() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sessions.json");

    let doc = json!({
        "sessions": {
            "svc:1": {
                "external_session_id": "svc:1",
                "service_name": "webhook",
                "cwd": "/tmp/w",
                "acp_session_id": "sess-a",
                "planned_feature": "keep me",
            }
        }
    });
    tokio::fs::write(&path, serde_json::to_vec_pretty(&doc).expect("doc"))
        .await
        .expect("seed");

    let store = SessionStore::open(&path).await;
    let mut loaded = store.get("svc:1").await.expect("record");
    loaded.branch_name = "acp-agent/updated-1".into();
    store.upsert(loaded).await.expect("rewrite");

    let raw = tokio::fs::read_to_string(&path).await.expect("read back");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(
        value["sessions"]["svc:1"]["planned_feature"], "keep me",
        "unknown fields must be preserved on rewrite"
    );
    assert_eq!(value["sessions"]["svc:1"]["branch_name"], "acp-agent/updated-1");
}

/// Removing a missing key is a quiet no-op.
#[tokio::test]
async fn remove_missing_is_noop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::open(dir.path().join("sessions.json")).await;
    store.remove("ghost").await.expect("no-op remove");
}
