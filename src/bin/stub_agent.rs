#![forbid(unsafe_code)]

//! `stub-agent` — scriptable ACP agent for integration tests and local
//! development.
//!
//! Speaks the bridge-facing subset of the protocol over stdio: `initialize`,
//! `session/new`, `session/load`, `session/prompt`, `session/cancel`,
//! `shutdown`, and `exit`. Prompt turns are scripted by markers in the
//! prompt text:
//!
//! - default: two thought chunks, one tool call driven to completion, two
//!   message chunks, then `end_turn`.
//! - `work slowly`: emits thoughts, then idles until `session/cancel`
//!   arrives (or a 30 s ceiling), resolving the turn with `cancelled`.
//! - `work briefly`: emits thoughts, idles 300 ms, then ends the turn —
//!   long enough for a test to inject a concurrent follow-up.
//! - `ask permission`: issues a `session/request_permission` round-trip
//!   before doing any work.
//! - `refuse`: ends the turn with `refusal` and no output.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// Ceiling for a `work slowly` turn that never gets cancelled.
const SLOW_TURN_CEILING: Duration = Duration::from_secs(30);

struct Agent {
    out_tx: mpsc::Sender<Value>,
    /// Responses to requests this agent sent (permission prompts).
    pending: Mutex<HashMap<i64, oneshot::Sender<Value>>>,
    next_id: AtomicI64,
    /// Cancels the in-flight prompt turn.
    turn_cancel: Mutex<Option<CancellationToken>>,
}

impl Agent {
    async fn send(&self, value: Value) {
        let _ = self.out_tx.send(value).await;
    }

    async fn respond(&self, id: Value, result: Value) {
        self.send(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
            .await;
    }

    async fn notify_update(&self, session_id: &str, update: Value) {
        self.send(json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": { "sessionId": session_id, "update": update },
        }))
        .await;
    }

    async fn request(&self, method: &str, params: Value) -> Option<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        self.send(json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
            .await;
        rx.await.ok()
    }

    async fn run_turn(self: Arc<Self>, id: Value, session_id: String, prompt: String) {
        let cancel = CancellationToken::new();
        *self.turn_cancel.lock().await = Some(cancel.clone());

        let stop_reason = self
            .scripted_turn(&session_id, &prompt, &cancel)
            .await;

        *self.turn_cancel.lock().await = None;
        self.respond(id, json!({ "stopReason": stop_reason })).await;
    }

    async fn scripted_turn(
        &self,
        session_id: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> &'static str {
        if prompt.contains("refuse") {
            return "refusal";
        }

        if prompt.contains("ask permission") {
            let outcome = self
                .request(
                    "session/request_permission",
                    json!({
                        "sessionId": session_id,
                        "toolCall": { "toolCallId": "perm-1", "title": "Write file" },
                        "options": [
                            { "optionId": "opt-reject", "name": "Reject", "kind": "reject_once" },
                            { "optionId": "opt-allow", "name": "Allow", "kind": "allow_once" },
                            { "optionId": "opt-allow-always", "name": "Always allow", "kind": "allow_always" },
                        ],
                    }),
                )
                .await;
            let selected = outcome
                .as_ref()
                .and_then(|v| v.pointer("/outcome/optionId"))
                .and_then(Value::as_str)
                .unwrap_or("");
            self.notify_update(
                session_id,
                json!({
                    "sessionUpdate": "agent_message_chunk",
                    "content": { "type": "text", "text": format!("permission:{selected}") },
                }),
            )
            .await;
            return "end_turn";
        }

        for text in ["Reading the request.", " Planning the change."] {
            self.notify_update(
                session_id,
                json!({
                    "sessionUpdate": "agent_thought_chunk",
                    "content": { "type": "text", "text": text },
                }),
            )
            .await;
        }

        if prompt.contains("work slowly") {
            tokio::select! {
                () = cancel.cancelled() => return "cancelled",
                () = tokio::time::sleep(SLOW_TURN_CEILING) => return "end_turn",
            }
        }

        if prompt.contains("work briefly") {
            // Long enough for a test to inject a follow-up mid-turn.
            tokio::select! {
                () = cancel.cancelled() => return "cancelled",
                () = tokio::time::sleep(Duration::from_millis(300)) => return "end_turn",
            }
        }

        self.notify_update(
            session_id,
            json!({
                "sessionUpdate": "tool_call",
                "toolCallId": "call-1",
                "title": "Read README.md",
                "kind": "read",
                "status": "pending",
            }),
        )
        .await;
        self.notify_update(
            session_id,
            json!({
                "sessionUpdate": "tool_call_update",
                "toolCallId": "call-1",
                "status": "in_progress",
            }),
        )
        .await;
        self.notify_update(
            session_id,
            json!({
                "sessionUpdate": "tool_call_update",
                "toolCallId": "call-1",
                "status": "completed",
                "content": [ { "type": "content", "content": { "type": "text", "text": "12 lines" } } ],
            }),
        )
        .await;

        for text in ["Done. ", "The change is in place."] {
            self.notify_update(
                session_id,
                json!({
                    "sessionUpdate": "agent_message_chunk",
                    "content": { "type": "text", "text": text },
                }),
            )
            .await;
        }

        "end_turn"
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let (out_tx, mut out_rx) = mpsc::channel::<Value>(64);

    // Single writer task owns stdout.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(value) = out_rx.recv().await {
            let mut line = value.to_string().into_bytes();
            line.push(b'\n');
            if stdout.write_all(&line).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let agent = Arc::new(Agent {
        out_tx,
        pending: Mutex::new(HashMap::new()),
        next_id: AtomicI64::new(1),
        turn_cancel: Mutex::new(None),
    });

    let mut session_id = String::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(value) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let method = value.get("method").and_then(Value::as_str);
        let id = value.get("id").cloned();
        let params = value.get("params").cloned().unwrap_or(Value::Null);

        match (method, id) {
            (Some("initialize"), Some(id)) => {
                agent
                    .respond(
                        id,
                        json!({
                            "protocolVersion": 1,
                            "agentCapabilities": { "loadSession": true },
                        }),
                    )
                    .await;
            }

            (Some("session/new"), Some(id)) => {
                session_id = format!("stub-{}", uuid::Uuid::new_v4());
                agent.respond(id, json!({ "sessionId": session_id })).await;
            }

            (Some("session/load"), Some(id)) => {
                session_id = params
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                agent.respond(id, Value::Null).await;
            }

            (Some("session/prompt"), Some(id)) => {
                let prompt = params
                    .get("prompt")
                    .and_then(Value::as_array)
                    .map(|blocks| {
                        blocks
                            .iter()
                            .filter_map(|b| b.get("text").and_then(Value::as_str))
                            .collect::<Vec<_>>()
                            .join("")
                    })
                    .unwrap_or_default();
                tokio::spawn(Arc::clone(&agent).run_turn(id, session_id.clone(), prompt));
            }

            (Some("session/cancel"), None) => {
                if let Some(cancel) = agent.turn_cancel.lock().await.as_ref() {
                    cancel.cancel();
                }
            }

            (Some("shutdown"), Some(id)) => {
                agent.respond(id, Value::Null).await;
            }

            (Some("exit"), None) => break,

            // Response to a request this agent sent.
            (None, Some(id)) => {
                if let Some(id) = id.as_i64() {
                    if let Some(tx) = agent.pending.lock().await.remove(&id) {
                        let _ = tx.send(value.get("result").cloned().unwrap_or(Value::Null));
                    }
                }
            }

            (Some(_), Some(id)) => {
                agent
                    .send(json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": -32601, "message": "method not found" },
                    }))
                    .await;
            }

            _ => {}
        }
    }

    drop(agent);
    let _ = writer.await;
}
