//! Debounced routing of raw agent updates to service adapters.
//!
//! Agents emit `session/update` notifications at token cadence — many per
//! second. External services want a handful of meaningful updates. The
//! router sits between them: text chunks accumulate into per-turn buffers,
//! tool-call events coalesce per call id to their latest state, and a
//! rolling debounce window decides when buffered state becomes a
//! [`BridgeUpdate`].
//!
//! Flush triggers: the window elapsing, a kind change (a tool call or plan
//! arriving after buffered text), and end of turn. Plans and errors flush
//! immediately. Every emission happens under one lock, so updates for a
//! session reach the adapter in strict arrival order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::acp::protocol::{SessionNotification, SessionUpdate, ToolCallStatus};
use crate::adapter::ServiceAdapter;
use crate::models::update::{ActionStatus, BridgeUpdate};

/// Latest known state of one tool call within the current window.
#[derive(Debug, Clone)]
struct PendingAction {
    id: String,
    title: String,
    kind: String,
    status: ActionStatus,
    result: Option<String>,
    dirty: bool,
}

#[derive(Default)]
struct RouterState {
    thought_buf: String,
    message_buf: String,
    /// Message text accumulated across the whole turn, for the completion.
    final_message: String,
    /// Tool calls in first-seen order.
    actions: Vec<PendingAction>,
    /// Invalidates scheduled flush tasks; bumped on every flush.
    generation: u64,
    flush_scheduled: bool,
    /// When the most recent buffered update arrived; the rolling window
    /// measures from here.
    last_activity: Option<tokio::time::Instant>,
}

/// Converts a session's raw update stream into debounced [`BridgeUpdate`]s.
pub struct UpdateRouter {
    adapter: Arc<dyn ServiceAdapter>,
    external_session_id: String,
    debounce: Duration,
    state: Mutex<RouterState>,
    emitted: AtomicBool,
}

impl UpdateRouter {
    /// Create a router for one session.
    #[must_use]
    pub fn new(
        adapter: Arc<dyn ServiceAdapter>,
        external_session_id: String,
        debounce: Duration,
    ) -> Self {
        Self {
            adapter,
            external_session_id,
            debounce,
            state: Mutex::new(RouterState::default()),
            emitted: AtomicBool::new(false),
        }
    }

    /// Whether any update has reached the adapter yet. Used by the session
    /// manager for the slow-start warning.
    #[must_use]
    pub fn has_emitted(&self) -> bool {
        self.emitted.load(Ordering::SeqCst)
    }

    /// Process one raw notification. Unknown update kinds are skipped.
    pub async fn handle_notification(self: &Arc<Self>, notification: SessionNotification) {
        match serde_json::from_value::<SessionUpdate>(notification.update.clone()) {
            Ok(update) => self.handle_update(update).await,
            Err(err) => {
                let kind = notification
                    .update
                    .get("sessionUpdate")
                    .and_then(Value::as_str)
                    .unwrap_or("<missing>");
                debug!(kind, %err, "router: skipping unhandled session update");
            }
        }
    }

    /// Process one parsed update.
    pub async fn handle_update(self: &Arc<Self>, update: SessionUpdate) {
        let mut state = self.state.lock().await;
        match update {
            SessionUpdate::UserMessageChunk { .. } => {}

            SessionUpdate::AgentThoughtChunk { content } => {
                state.thought_buf.push_str(content.text());
                self.schedule_flush(&mut state);
            }

            SessionUpdate::AgentMessageChunk { content } => {
                state.message_buf.push_str(content.text());
                state.final_message.push_str(content.text());
                self.schedule_flush(&mut state);
            }

            SessionUpdate::ToolCall {
                tool_call_id,
                title,
                kind,
                status,
                locations: _,
            } => {
                // Kind change: buffered text and pending action states go
                // out before the new action.
                self.flush_buffers(&mut state).await;
                let action = PendingAction {
                    id: tool_call_id,
                    title: if title.is_empty() {
                        "Tool call".into()
                    } else {
                        title
                    },
                    kind: kind.unwrap_or_else(|| "other".into()),
                    status: status.map_or(ActionStatus::Pending, convert_status),
                    result: None,
                    dirty: false,
                };
                self.emit(&mut state, action_update(&action)).await;
                state.actions.push(action);
            }

            SessionUpdate::ToolCallUpdate {
                tool_call_id,
                title,
                kind,
                status,
                content,
            } => {
                let idx = match state.actions.iter().position(|a| a.id == tool_call_id) {
                    Some(idx) => idx,
                    None => {
                        // Update for a call announced before this router
                        // attached (resumed turn); track it from here.
                        state.actions.push(PendingAction {
                            id: tool_call_id.clone(),
                            title: "Tool call".into(),
                            kind: "other".into(),
                            status: ActionStatus::Pending,
                            result: None,
                            dirty: false,
                        });
                        state.actions.len() - 1
                    }
                };

                {
                    let action = &mut state.actions[idx];
                    if let Some(title) = title {
                        action.title = title;
                    }
                    if let Some(kind) = kind {
                        action.kind = kind;
                    }
                    if let Some(status) = status {
                        action.status = convert_status(status);
                    }
                    if let Some(content) = content {
                        action.result = Some(render_result(&content));
                    }
                    action.dirty = true;
                }

                if state.actions[idx].status.is_terminal() {
                    // Terminal states always go out; intermediates may be
                    // superseded within the window.
                    self.flush_text(&mut state).await;
                    let update = action_update(&state.actions[idx]);
                    state.actions[idx].dirty = false;
                    self.emit(&mut state, update).await;
                } else {
                    self.schedule_flush(&mut state);
                }
            }

            SessionUpdate::Plan { entries } => {
                // Plans are rare and carry meaningful state: flush
                // everything buffered, then emit immediately.
                self.flush_buffers(&mut state).await;
                let entries = entries.into_iter().map(Into::into).collect();
                self.emit(&mut state, BridgeUpdate::Plan { entries }).await;
            }
        }
    }

    /// Emit an error update, bypassing the debounce window. Buffered state
    /// is flushed first so arrival order is preserved.
    pub async fn error(self: &Arc<Self>, message: &str) {
        let mut state = self.state.lock().await;
        self.flush_buffers(&mut state).await;
        self.emit(
            &mut state,
            BridgeUpdate::Error {
                message: message.to_owned(),
            },
        )
        .await;
    }

    /// End-of-turn flush: deliver everything still buffered and return the
    /// turn's accumulated message text for the completion notice.
    pub async fn finish_turn(self: &Arc<Self>) -> String {
        let mut state = self.state.lock().await;
        self.flush_buffers(&mut state).await;
        std::mem::take(&mut state.final_message)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Arrange a flush once the rolling debounce window elapses: the timer
    /// measures from the *last* buffered update, so a steady chunk stream
    /// coalesces into one emission after it goes quiet. A flush from any
    /// other trigger invalidates the timer via the generation counter.
    fn schedule_flush(self: &Arc<Self>, state: &mut RouterState) {
        state.last_activity = Some(tokio::time::Instant::now());
        if state.flush_scheduled {
            return;
        }
        state.flush_scheduled = true;
        let generation = state.generation;

        let router = Arc::clone(self);
        let debounce = self.debounce;
        tokio::spawn(async move {
            loop {
                let wait = {
                    let state = router.state.lock().await;
                    if state.generation != generation {
                        // A flush already happened; this timer is stale.
                        return;
                    }
                    let due = state.last_activity.unwrap_or_else(tokio::time::Instant::now)
                        + debounce;
                    due.checked_duration_since(tokio::time::Instant::now())
                };
                match wait {
                    Some(remaining) if !remaining.is_zero() => {
                        tokio::time::sleep(remaining).await;
                    }
                    _ => {
                        let mut state = router.state.lock().await;
                        if state.generation == generation {
                            router.flush_buffers(&mut state).await;
                        }
                        return;
                    }
                }
            }
        });
    }

    /// Flush buffered text only (thought first, then message).
    async fn flush_text(&self, state: &mut RouterState) {
        state.generation += 1;
        state.flush_scheduled = false;

        if !state.thought_buf.is_empty() {
            let text = std::mem::take(&mut state.thought_buf);
            self.emit(state, BridgeUpdate::Thought { text }).await;
        }
        if !state.message_buf.is_empty() {
            let text = std::mem::take(&mut state.message_buf);
            self.emit(state, BridgeUpdate::MessageChunk { text }).await;
        }
    }

    /// Flush text buffers and any coalesced tool-call states.
    async fn flush_buffers(&self, state: &mut RouterState) {
        self.flush_text(state).await;

        let dirty: Vec<BridgeUpdate> = state
            .actions
            .iter_mut()
            .filter(|a| a.dirty)
            .map(|a| {
                a.dirty = false;
                action_update(a)
            })
            .collect();
        for update in dirty {
            self.emit(state, update).await;
        }
    }

    /// Deliver one update. Adapter rendering failures are logged and
    /// dropped — they must not kill the session.
    async fn emit(&self, _state: &mut RouterState, update: BridgeUpdate) {
        self.emitted.store(true, Ordering::SeqCst);
        if let Err(err) = self
            .adapter
            .send_update(&self.external_session_id, update)
            .await
        {
            warn!(
                session_id = %self.external_session_id,
                %err,
                "adapter failed to render update"
            );
        }
    }
}

fn convert_status(status: ToolCallStatus) -> ActionStatus {
    match status {
        ToolCallStatus::Pending => ActionStatus::Pending,
        ToolCallStatus::InProgress => ActionStatus::InProgress,
        ToolCallStatus::Completed => ActionStatus::Completed,
        ToolCallStatus::Failed => ActionStatus::Failed,
    }
}

fn action_update(action: &PendingAction) -> BridgeUpdate {
    BridgeUpdate::Action {
        id: action.id.clone(),
        title: action.title.clone(),
        kind: action.kind.clone(),
        status: action.status,
        result: action.result.clone(),
    }
}

/// Render a tool-call result payload as display text. Content blocks get
/// their text concatenated; anything else falls back to compact JSON.
fn render_result(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter_map(|b| {
                    b.get("content")
                        .and_then(|c| c.get("text"))
                        .or_else(|| b.get("text"))
                        .and_then(Value::as_str)
                })
                .collect();
            if texts.is_empty() {
                content.to_string()
            } else {
                texts.join("\n")
            }
        }
        other => other.to_string(),
    }
}
