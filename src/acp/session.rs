//! One agent subprocess and its protocol session.
//!
//! An [`AcpSession`] owns exactly one spawned agent process and one
//! [`AcpClient`] over its stdio. Lifecycle:
//!
//! ```text
//! idle → spawning → initializing → ready ↔ prompting
//!                                    ↓         ↓
//!                                  closing ← closing
//!                                    ↓
//!                                  closed
//! ```
//!
//! At most one prompt turn is in flight per session; a second `prompt`
//! while one is running is a caller bug and fails fast. Cancellation is a
//! `session/cancel` notification — the in-flight turn then resolves with
//! [`StopReason::Cancelled`].

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::acp::client::{AcpClient, UpdateHandler};
use crate::acp::protocol::{
    client_capabilities, InitializeResult, NewSessionResult, PromptResult, StopReason,
};
use crate::config::AgentConfig;
use crate::{AppError, Result};

/// Maximum time for the `initialize` handshake to complete.
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace given to the `shutdown` request and to process exit before SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// ACP protocol version announced during `initialize`.
const PROTOCOL_VERSION: u32 = 1;

/// A live agent subprocess speaking ACP over stdio.
pub struct AcpSession {
    client: AcpClient,
    child: Mutex<Option<Child>>,
    session_id: String,
    prompting: AtomicBool,
    closed: AtomicBool,
}

impl AcpSession {
    /// Spawn the agent and establish a protocol session.
    ///
    /// The child inherits the parent environment plus `extra_env` (the
    /// per-session tokens from the Repository Provider), starts in `cwd`,
    /// and is `kill_on_drop` so a dropped session cannot leak a process.
    /// After the `initialize` handshake this either creates a new agent
    /// session or loads `resume_session_id` with its stored history.
    ///
    /// `session/update` notifications for the whole session lifetime are
    /// delivered through `on_update` in receive order, each awaited before
    /// the next message is read.
    ///
    /// # Errors
    ///
    /// - `AppError::Acp("failed to spawn agent …")` — binary not found or
    ///   not executable.
    /// - `AppError::Acp("initialize timed out …")` — no handshake response
    ///   within 30 s.
    /// - `AppError::Acp` / `AppError::Rpc` — protocol mismatch or agent
    ///   error during `session/new` / `session/load`.
    pub async fn start(
        agent: &AgentConfig,
        cwd: &Path,
        extra_env: &HashMap<String, String>,
        on_update: UpdateHandler,
        resume_session_id: Option<&str>,
    ) -> Result<Self> {
        let mut cmd = Command::new(&agent.command);
        cmd.args(&agent.args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in extra_env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Acp(format!("failed to spawn agent '{}': {err}", agent.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Acp("failed to capture agent stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Acp("failed to capture agent stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Acp("failed to capture agent stderr".into()))?;

        let client = AcpClient::connect(stdin, stdout, stderr, on_update);

        let init = tokio::time::timeout(
            INITIALIZE_TIMEOUT,
            client.request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "clientCapabilities": client_capabilities(),
                    "clientInfo": {
                        "name": "acp-bridge",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ),
        )
        .await
        .map_err(|_| {
            AppError::Acp(format!(
                "initialize timed out after {INITIALIZE_TIMEOUT:?} for agent '{}'",
                agent.name
            ))
        })??;
        let init: InitializeResult = serde_json::from_value(init)
            .map_err(|err| AppError::Acp(format!("bad initialize result: {err}")))?;

        let session_id = match resume_session_id {
            Some(resume_id) => {
                let supports_load = init
                    .agent_capabilities
                    .as_ref()
                    .is_some_and(|caps| caps.load_session);
                if !supports_load {
                    warn!(
                        agent = %agent.name,
                        "agent did not announce loadSession; attempting session/load anyway"
                    );
                }
                client
                    .request(
                        "session/load",
                        json!({
                            "sessionId": resume_id,
                            "cwd": cwd.to_string_lossy(),
                            "mcpServers": [],
                        }),
                    )
                    .await?;
                info!(session_id = resume_id, cwd = %cwd.display(), "acp session resumed");
                resume_id.to_owned()
            }
            None => {
                let result = client
                    .request(
                        "session/new",
                        json!({ "cwd": cwd.to_string_lossy(), "mcpServers": [] }),
                    )
                    .await?;
                let result: NewSessionResult = serde_json::from_value(result)
                    .map_err(|err| AppError::Acp(format!("bad session/new result: {err}")))?;
                info!(session_id = %result.session_id, cwd = %cwd.display(), "acp session started");
                result.session_id
            }
        };

        Ok(Self {
            client,
            child: Mutex::new(Some(child)),
            session_id,
            prompting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// The agent-issued session id.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether a prompt turn is currently in flight.
    #[must_use]
    pub fn is_prompting(&self) -> bool {
        self.prompting.load(Ordering::SeqCst)
    }

    /// Send a prompt and wait for the turn to complete.
    ///
    /// All `session/update` notifications observed before the response
    /// belong to this turn and have already been forwarded to the
    /// subscriber channel by the time the stop reason is returned.
    ///
    /// # Errors
    ///
    /// - `AppError::Acp("prompt already in flight")` — a turn is running.
    /// - `AppError::Acp` / `AppError::Rpc` — the agent died or errored
    ///   mid-turn.
    pub async fn prompt(&self, text: &str) -> Result<StopReason> {
        if self
            .prompting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::Acp("prompt already in flight".into()));
        }

        let outcome = self
            .client
            .request(
                "session/prompt",
                json!({
                    "sessionId": self.session_id,
                    "prompt": [ { "type": "text", "text": text } ],
                }),
            )
            .await;
        self.prompting.store(false, Ordering::SeqCst);

        let result: PromptResult = serde_json::from_value(outcome?)
            .map_err(|err| AppError::Acp(format!("bad session/prompt result: {err}")))?;
        debug!(session_id = %self.session_id, stop_reason = result.stop_reason.as_str(), "turn ended");
        Ok(result.stop_reason)
    }

    /// Cancel the in-flight turn. The pending [`AcpSession::prompt`] call
    /// resolves with [`StopReason::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp` if the notification cannot be written.
    pub async fn cancel(&self) -> Result<()> {
        self.client
            .notify("session/cancel", json!({ "sessionId": self.session_id }))
            .await
    }

    /// Shut the session down: best-effort `shutdown` request, `exit`
    /// notification, then a graceful wait and force-kill. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if !self.client.is_closed() {
            match tokio::time::timeout(
                SHUTDOWN_GRACE,
                self.client.request("shutdown", json!({})),
            )
            .await
            {
                Ok(Ok(_)) => debug!(session_id = %self.session_id, "agent acknowledged shutdown"),
                Ok(Err(err)) => debug!(session_id = %self.session_id, %err, "shutdown request failed"),
                Err(_) => warn!(session_id = %self.session_id, "shutdown request timed out"),
            }
            let _ = self.client.notify("exit", json!({})).await;
        }
        self.client.close().await;

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                info!(session_id = %self.session_id, ?status, "agent process exited");
            }
            Ok(Err(err)) => {
                warn!(session_id = %self.session_id, %err, "error waiting for agent process");
            }
            Err(_) => {
                warn!(
                    session_id = %self.session_id,
                    "agent did not exit within grace period, forcing kill"
                );
                if let Err(err) = child.kill().await {
                    warn!(session_id = %self.session_id, %err, "failed to kill agent process");
                }
            }
        }
    }
}
