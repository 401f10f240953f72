//! Webhook adapter: signature verification, ingress parsing, the health
//! endpoint, and the full HTTP round-trip through a live listener.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::mpsc;

use acp_bridge::adapter::webhook::WebhookAdapter;
use acp_bridge::adapter::ServiceAdapter;
use acp_bridge::app::health_body;
use acp_bridge::orchestrator::SessionManager;
use acp_bridge::persistence::SessionStore;
use acp_bridge::repo::RepoProvider;

use super::test_helpers::stub_config_with;

const SECRET: &str = "test-webhook-secret";

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).expect("hmac key");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

async fn build_manager_at(dir: &std::path::Path, extra: &[(&str, &str)]) -> Arc<SessionManager> {
    let config = Arc::new(stub_config_with(dir, extra));
    let store = Arc::new(SessionStore::open(config.persistence_path()).await);
    let provider = Arc::new(RepoProvider::new(Arc::clone(&config)));
    Arc::new(SessionManager::new(config, provider, store, HashMap::new()))
}

/// Spawn a one-route receiver that forwards every posted JSON body into a
/// channel, returning its URL.
async fn spawn_callback_receiver() -> (String, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel::<Value>();
    let app = axum::Router::new()
        .route(
            "/callback",
            post(
                |State(tx): State<mpsc::UnboundedSender<Value>>, body: axum::Json<Value>| async move {
                    let _ = tx.send(body.0);
                    axum::http::StatusCode::OK
                },
            ),
        )
        .with_state(tx);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind receiver");
    let addr = listener.local_addr().expect("receiver addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (format!("http://{addr}/callback"), rx)
}

/// `on_session_created` parses a created event into a session request.
#[tokio::test]
async fn parses_created_event() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = build_manager_at(dir.path(), &[]).await;
    let adapter = WebhookAdapter::new(manager, "default", true, String::new(), String::new());

    let event = json!({
        "action": "created",
        "session_id": "hook:42",
        "prompt": "fix the login flow",
        "title": "Login broken",
        "metadata": { "requester": "u123" },
    });

    let request = adapter
        .on_session_created(&event)
        .await
        .expect("created event must parse");
    assert_eq!(request.external_session_id, "hook:42");
    assert_eq!(request.service_name, "webhook:default");
    assert_eq!(request.agent_name, "default");
    assert_eq!(request.prompt, "fix the login flow");
    assert_eq!(request.descriptive_name, "Login broken");
    assert_eq!(request.service_metadata["requester"], "u123");

    let not_created = json!({ "action": "stopped", "session_id": "hook:42" });
    assert!(adapter.on_session_created(&not_created).await.is_err());
}

/// Health endpoint lists the adapter instances.
#[test]
fn health_body_lists_services() {
    let body = health_body(&["webhook:claude".to_owned(), "webhook:codex".to_owned()]);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["services"][0], "webhook:claude");
    assert_eq!(body["services"][1], "webhook:codex");
}

/// Full loop over HTTP: a signed created event returns 200 within the
/// acknowledgment budget and the session's updates land on the callback
/// receiver, ending with exactly one completion.
#[tokio::test]
async fn signed_event_round_trips_to_callback() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (callback_url, mut callback_rx) = spawn_callback_receiver().await;

    let manager = build_manager_at(dir.path(), &[]).await;
    let adapter = WebhookAdapter::new(
        manager,
        "default",
        true,
        SECRET.to_owned(),
        callback_url,
    );
    adapter.start().await.expect("start egress worker");

    let router = adapter.register_routes(axum::Router::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ingress");
    let addr = listener.local_addr().expect("ingress addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    let body = serde_json::to_vec(&json!({
        "action": "created",
        "session_id": "hook:1",
        "prompt": "fix the typo",
        "title": "typo fix",
    }))
    .expect("body");

    let client = reqwest::Client::new();
    let started = std::time::Instant::now();
    let response = client
        .post(format!("http://{addr}/webhooks/webhook"))
        .header("X-Hub-Signature-256", sign(&body))
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
        .expect("post webhook");
    assert_eq!(response.status(), 200);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "acknowledgment must be fast"
    );

    // Drain callbacks until the completion arrives.
    let mut saw_thought = false;
    let completion = loop {
        let event = tokio::time::timeout(Duration::from_secs(10), callback_rx.recv())
            .await
            .expect("timed out waiting for callbacks")
            .expect("receiver closed");
        match event["event"].as_str() {
            Some("update") => {
                if event["update"]["type"] == "thought" {
                    saw_thought = true;
                }
            }
            Some("completion") => break event,
            other => panic!("unexpected callback event: {other:?}"),
        }
    };

    assert!(saw_thought, "at least one thought update must be delivered");
    assert_eq!(completion["session_id"], "hook:1");
    assert_eq!(completion["message"], "Done. The change is in place.");
}

/// A bad signature is rejected with 401 before any parsing.
#[tokio::test]
async fn bad_signature_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = build_manager_at(dir.path(), &[]).await;
    let adapter = WebhookAdapter::new(
        manager,
        "default",
        true,
        SECRET.to_owned(),
        String::new(),
    );

    let router = adapter.register_routes(axum::Router::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ingress");
    let addr = listener.local_addr().expect("ingress addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/webhooks/webhook"))
        .header("X-Hub-Signature-256", "sha256=deadbeef")
        .body("{\"action\":\"created\",\"session_id\":\"x\"}")
        .send()
        .await
        .expect("post webhook");
    assert_eq!(response.status(), 401);

    let unsigned = client
        .post(format!("http://{addr}/webhooks/webhook"))
        .body("{}")
        .send()
        .await
        .expect("post webhook");
    assert_eq!(unsigned.status(), 401);
}

/// Malformed JSON with a valid signature is a 400.
#[tokio::test]
async fn malformed_body_is_bad_request() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = build_manager_at(dir.path(), &[]).await;
    let adapter = WebhookAdapter::new(
        manager,
        "default",
        true,
        SECRET.to_owned(),
        String::new(),
    );

    let router = adapter.register_routes(axum::Router::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ingress");
    let addr = listener.local_addr().expect("ingress addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    let body = b"{not json".to_vec();
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/webhooks/webhook"))
        .header("X-Hub-Signature-256", sign(&body))
        .body(body)
        .send()
        .await
        .expect("post webhook");
    assert_eq!(response.status(), 400);
}

/// Non-default agents register the suffixed route.
#[tokio::test]
async fn non_default_agent_uses_suffixed_route() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = build_manager_at(dir.path(), &[]).await;
    let adapter = WebhookAdapter::new(manager, "codex", false, String::new(), String::new());
    assert_eq!(adapter.service_name(), "webhook:codex");

    let router = adapter.register_routes(axum::Router::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ingress");
    let addr = listener.local_addr().expect("ingress addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    let client = reqwest::Client::new();
    let body = json!({ "action": "stopped", "session_id": "x" }).to_string();
    let response = client
        .post(format!("http://{addr}/webhooks/webhook/codex"))
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
        .expect("post webhook");
    assert_eq!(response.status(), 200);

    let wrong = client
        .post(format!("http://{addr}/webhooks/webhook"))
        .body("{}")
        .send()
        .await
        .expect("post webhook");
    assert_eq!(wrong.status(), 404, "unqualified route must not exist");
}
