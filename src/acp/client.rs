//! JSON-RPC 2.0 client over an agent's stdio.
//!
//! One background reader drives a [`FramedRead`] over the child's stdout:
//! responses are routed to pending request futures by id, `session/update`
//! notifications are delivered to the update handler — awaited inline, so
//! every notification is fully handled before the next line is read and a
//! prompt response cannot overtake the updates of its own turn — and
//! agent-initiated requests are answered by the built-in client services
//! (permission auto-approval, filesystem, terminals). A writer task
//! serialises outbound messages onto the child's stdin; stderr is drained
//! to the log.
//!
//! When the reader loop exits (EOF, oversize line, stream error) the client
//! transitions to a terminal closed state and every pending request fails
//! with `connection closed`. Reconnection is the session's concern, not the
//! client's.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::codec::AcpCodec;
use crate::acp::protocol::{
    select_permission_option, CreateTerminalParams, ReadTextFileParams, RequestPermissionParams,
    SessionNotification, TerminalIdParams, WriteTextFileParams,
};
use crate::{AppError, Result};

/// JSON-RPC "method not found" error code.
const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC "internal error" code, used for failed client-service calls.
const INTERNAL_ERROR: i64 = -32603;

/// Outbound message queue depth. Writes beyond this apply backpressure.
const OUTBOUND_CAPACITY: usize = 256;

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value>>>>>;

/// Callback invoked for every `session/update` notification. Awaited
/// inline by the reader, so handlers observe updates in receive order and
/// strictly before the response that ends their turn.
pub type UpdateHandler =
    Arc<dyn Fn(SessionNotification) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// JSON-RPC 2.0 client bound to one agent subprocess's stdio.
pub struct AcpClient {
    outbound_tx: mpsc::Sender<Value>,
    pending: PendingMap,
    next_id: AtomicI64,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl AcpClient {
    /// Wire a client onto the stdio pipes of a spawned agent process.
    ///
    /// `on_update` is awaited for every `session/update` notification, in
    /// receive order. Keep it fast — slow handlers stall the read loop.
    /// The reader, writer, and stderr-drain tasks run until the stream
    /// ends or [`AcpClient::close`] is called.
    #[must_use]
    pub fn connect(
        stdin: ChildStdin,
        stdout: ChildStdout,
        stderr: ChildStderr,
        on_update: UpdateHandler,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let pending: PendingMap = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let services = Arc::new(ClientServices::default());

        tokio::spawn(run_writer(stdin, outbound_rx, cancel.clone()));
        tokio::spawn(drain_stderr(stderr, cancel.clone()));
        tokio::spawn(run_reader(
            stdout,
            on_update,
            Arc::clone(&pending),
            Arc::clone(&closed),
            outbound_tx.clone(),
            services,
            cancel.clone(),
        ));

        Self {
            outbound_tx,
            pending,
            next_id: AtomicI64::new(1),
            closed,
            cancel,
        }
    }

    /// Send a request and await its response payload.
    ///
    /// # Errors
    ///
    /// - `AppError::Acp("connection closed")` — the stream ended before a
    ///   response arrived, or the client was already closed.
    /// - `AppError::Rpc` — the agent answered with a JSON-RPC error object.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::Acp("connection closed".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        // The reader may have closed and drained the pending map between the
        // check above and the insert; re-check so the sender cannot leak.
        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().await.remove(&id);
            return Err(AppError::Acp("connection closed".into()));
        }

        let msg = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if self.outbound_tx.send(msg).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(AppError::Acp("connection closed".into()));
        }

        rx.await
            .unwrap_or_else(|_| Err(AppError::Acp("connection closed".into())))
    }

    /// Send a notification (no response expected).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp("connection closed")` if the writer is gone.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let msg = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.outbound_tx
            .send(msg)
            .await
            .map_err(|_| AppError::Acp("connection closed".into()))
    }

    /// Whether the reader loop has terminated.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the background tasks. Pending requests fail with
    /// `connection closed`. Idempotent.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        fail_pending(&self.pending).await;
    }
}

/// Fail every pending request with `connection closed`.
async fn fail_pending(pending: &PendingMap) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(AppError::Acp("connection closed".into())));
    }
}

// ── Writer task ──────────────────────────────────────────────────────────────

/// Serialise outbound JSON values as NDJSON lines onto the agent's stdin.
async fn run_writer(
    stdin: ChildStdin,
    mut outbound_rx: mpsc::Receiver<Value>,
    cancel: CancellationToken,
) {
    let mut framed = FramedWrite::new(stdin, AcpCodec::outbound());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("acp writer: cancellation received, stopping");
                break;
            }

            msg = outbound_rx.recv() => {
                let Some(value) = msg else {
                    debug!("acp writer: outbound channel closed, stopping");
                    break;
                };
                let line = match serde_json::to_string(&value) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(%err, "acp writer: failed to serialise outbound message");
                        continue;
                    }
                };
                if let Err(err) = framed.send(line).await {
                    warn!(%err, "acp writer: stopping");
                    break;
                }
            }
        }
    }
}

/// Drain the agent's stderr line-by-line into the log.
async fn drain_stderr(stderr: ChildStderr, cancel: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(text)) => debug!(target: "acp_bridge::agent_stderr", "{text}"),
                Ok(None) => break,
                Err(err) => {
                    debug!(%err, "agent stderr read failed");
                    break;
                }
            },
        }
    }
}

// ── Reader task ──────────────────────────────────────────────────────────────

/// Read NDJSON lines from the agent's stdout and dispatch them.
async fn run_reader(
    stdout: ChildStdout,
    on_update: UpdateHandler,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    outbound_tx: mpsc::Sender<Value>,
    services: Arc<ClientServices>,
    cancel: CancellationToken,
) {
    let mut framed = FramedRead::new(stdout, AcpCodec::inbound());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("acp reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("acp reader: EOF on agent stdout");
                        break;
                    }
                    Some(Err(err)) => {
                        // Oversize lines and stream errors are both fatal to
                        // the connection; a truncated message must never be
                        // delivered as if it were complete.
                        warn!(%err, "acp reader: stream error, closing connection");
                        break;
                    }
                    Some(Ok(line)) => {
                        let value: Value = match serde_json::from_str(&line) {
                            Ok(v) => v,
                            Err(err) => {
                                warn!(%err, "acp reader: malformed json, closing connection");
                                break;
                            }
                        };
                        dispatch_message(value, &on_update, &pending, &outbound_tx, &services)
                            .await;
                    }
                }
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    fail_pending(&pending).await;
}

/// Route one parsed message: response, notification, or agent request.
async fn dispatch_message(
    value: Value,
    on_update: &UpdateHandler,
    pending: &PendingMap,
    outbound_tx: &mpsc::Sender<Value>,
    services: &Arc<ClientServices>,
) {
    let method = value.get("method").and_then(Value::as_str);
    let id = value.get("id").cloned();

    match (method, id) {
        // Response to one of our requests.
        (None, Some(id)) => {
            let Some(id) = id.as_i64() else {
                warn!(?id, "acp reader: response with non-numeric id, skipping");
                return;
            };
            let Some(tx) = pending.lock().await.remove(&id) else {
                debug!(id, "acp reader: response for unknown request id");
                return;
            };
            let outcome = if let Some(error) = value.get("error") {
                Err(AppError::Rpc {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_owned(),
                })
            } else {
                Ok(value.get("result").cloned().unwrap_or(Value::Null))
            };
            let _ = tx.send(outcome);
        }

        // Notification from the agent, handled before the next line is read.
        (Some("session/update"), None) => {
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            match serde_json::from_value::<SessionNotification>(params) {
                Ok(notification) => on_update(notification).await,
                Err(err) => warn!(%err, "acp reader: bad session/update params, skipping"),
            }
        }
        (Some(other), None) => {
            debug!(method = other, "acp reader: skipping unknown notification");
        }

        // Agent-initiated request. Handled on a separate task so a slow
        // service call (terminal wait) cannot stall the read loop.
        (Some(method), Some(id)) => {
            let method = method.to_owned();
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            let outbound = outbound_tx.clone();
            let services = Arc::clone(services);
            tokio::spawn(async move {
                let reply = match services.handle(&method, params).await {
                    Ok(result) => {
                        json!({ "jsonrpc": "2.0", "id": id, "result": result })
                    }
                    Err(AppError::Acp(msg)) if msg == "method not found" => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": METHOD_NOT_FOUND, "message": format!("method not found: {method}") },
                    }),
                    Err(err) => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": INTERNAL_ERROR, "message": err.to_string() },
                    }),
                };
                if outbound.send(reply).await.is_err() {
                    debug!(method, "acp reader: writer gone, dropping reply");
                }
            });
        }

        (None, None) => {
            warn!("acp reader: message with neither method nor id, skipping");
        }
    }
}

// ── Client services (agent → bridge requests) ────────────────────────────────

/// A terminal started on behalf of the agent via `terminal/create`.
struct Terminal {
    child: Arc<Mutex<Child>>,
    output: Arc<std::sync::Mutex<String>>,
}

/// Handlers for agent-initiated requests.
///
/// Permission prompts are auto-approved (this bridge runs unattended);
/// filesystem and terminal operations delegate to the OS, scoped by nothing
/// more than the agent's own working directory — the worktree is the
/// isolation boundary.
#[derive(Default)]
struct ClientServices {
    terminals: Mutex<HashMap<String, Terminal>>,
}

impl ClientServices {
    async fn handle(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            "session/request_permission" => handle_request_permission(params),
            "fs/read_text_file" => handle_read_text_file(params).await,
            "fs/write_text_file" => handle_write_text_file(params).await,
            "terminal/create" => self.handle_terminal_create(params).await,
            "terminal/output" => self.handle_terminal_output(params).await,
            "terminal/wait_for_exit" => self.handle_terminal_wait(params).await,
            "terminal/kill" => self.handle_terminal_kill(params).await,
            "terminal/release" => self.handle_terminal_release(params).await,
            _ => Err(AppError::Acp("method not found".into())),
        }
    }

    async fn handle_terminal_create(&self, params: Value) -> Result<Value> {
        let params: CreateTerminalParams = serde_json::from_value(params)?;

        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = params.cwd {
            cmd.current_dir(cwd);
        }
        for var in &params.env {
            cmd.env(&var.name, &var.value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Acp(format!("failed to spawn terminal: {err}")))?;

        let output = Arc::new(std::sync::Mutex::new(String::new()));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(append_stream(stdout, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(append_stream(stderr, Arc::clone(&output)));
        }

        let terminal_id = uuid::Uuid::new_v4().to_string();
        self.terminals.lock().await.insert(
            terminal_id.clone(),
            Terminal {
                child: Arc::new(Mutex::new(child)),
                output,
            },
        );

        Ok(json!({ "terminalId": terminal_id }))
    }

    async fn handle_terminal_output(&self, params: Value) -> Result<Value> {
        let params: TerminalIdParams = serde_json::from_value(params)?;
        let terminals = self.terminals.lock().await;
        let terminal = terminals
            .get(&params.terminal_id)
            .ok_or_else(|| AppError::Acp(format!("unknown terminal {}", params.terminal_id)))?;
        let output = terminal
            .output
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        Ok(json!({ "output": output, "exitStatus": Value::Null, "truncated": false }))
    }

    async fn handle_terminal_wait(&self, params: Value) -> Result<Value> {
        let params: TerminalIdParams = serde_json::from_value(params)?;
        let child = {
            let terminals = self.terminals.lock().await;
            let terminal = terminals
                .get(&params.terminal_id)
                .ok_or_else(|| AppError::Acp(format!("unknown terminal {}", params.terminal_id)))?;
            Arc::clone(&terminal.child)
        };

        let status = child
            .lock()
            .await
            .wait()
            .await
            .map_err(|err| AppError::Acp(format!("terminal wait failed: {err}")))?;
        Ok(json!({ "exitCode": status.code(), "signal": Value::Null }))
    }

    async fn handle_terminal_kill(&self, params: Value) -> Result<Value> {
        let params: TerminalIdParams = serde_json::from_value(params)?;
        let terminals = self.terminals.lock().await;
        if let Some(terminal) = terminals.get(&params.terminal_id) {
            terminal.child.lock().await.kill().await.ok();
        }
        Ok(Value::Null)
    }

    async fn handle_terminal_release(&self, params: Value) -> Result<Value> {
        let params: TerminalIdParams = serde_json::from_value(params)?;
        if let Some(terminal) = self.terminals.lock().await.remove(&params.terminal_id) {
            terminal.child.lock().await.kill().await.ok();
        }
        Ok(Value::Null)
    }
}

/// Auto-approve a permission prompt: first `allow_always`, else first
/// `allow_once`, else the first option offered.
fn handle_request_permission(params: Value) -> Result<Value> {
    let params: RequestPermissionParams = serde_json::from_value(params)?;
    let selected = select_permission_option(&params.options)
        .ok_or_else(|| AppError::Acp("permission request offered no options".into()))?;
    debug!(
        option_id = %selected.option_id,
        kind = ?selected.kind,
        "auto-approving permission request"
    );
    Ok(json!({
        "outcome": { "outcome": "selected", "optionId": selected.option_id },
    }))
}

async fn handle_read_text_file(params: Value) -> Result<Value> {
    let params: ReadTextFileParams = serde_json::from_value(params)?;
    let text = tokio::fs::read_to_string(&params.path).await?;

    let text = if let Some(line) = params.line {
        let start = line.saturating_sub(1);
        let selected: Vec<&str> = match params.limit {
            Some(limit) => text.lines().skip(start).take(limit).collect(),
            None => text.lines().skip(start).collect(),
        };
        selected.join("\n")
    } else {
        text
    };

    Ok(json!({ "content": text }))
}

async fn handle_write_text_file(params: Value) -> Result<Value> {
    let params: WriteTextFileParams = serde_json::from_value(params)?;
    if let Some(parent) = std::path::Path::new(&params.path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&params.path, params.content).await?;
    Ok(Value::Null)
}

/// Append a terminal stream into the shared output buffer.
async fn append_stream<R>(stream: R, output: Arc<std::sync::Mutex<String>>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut buf = output
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        buf.push_str(&line);
        buf.push('\n');
    }
}
