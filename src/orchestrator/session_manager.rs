//! Session lifecycle orchestration.
//!
//! The session manager maps external service conversations onto ACP agent
//! sessions: it provisions a worktree, spawns the agent, wires the update
//! router between them, persists enough metadata to survive a restart, and
//! drives prompt turns to completion. One ActiveSession exists per external
//! session id; within a session turns are strictly sequential (follow-ups
//! arriving mid-turn queue FIFO), across sessions everything runs in
//! parallel.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::acp::client::UpdateHandler;
use crate::acp::{AcpSession, StopReason};
use crate::adapter::ServiceAdapter;
use crate::config::GlobalConfig;
use crate::github::TokenProvider;
use crate::models::update::BridgeUpdate;
use crate::models::{BridgeSessionRequest, PersistedSession};
use crate::orchestrator::update_router::UpdateRouter;
use crate::persistence::SessionStore;
use crate::repo::RepoProvider;
use crate::{AppError, Result};

/// How long a fresh session may stay silent before a warning is logged.
const FIRST_UPDATE_WARN_AFTER: Duration = Duration::from_secs(10);

/// In-memory record of a live or restored session.
pub struct ActiveSession {
    /// External conversation id.
    pub external_session_id: String,
    /// Adapter instance name that owns the session.
    pub service_name: String,
    /// Agent registry name.
    pub agent_name: String,
    /// The owning adapter.
    pub adapter: Arc<dyn ServiceAdapter>,
    /// Live agent session; `None` after restore until the first follow-up.
    pub acp: Option<Arc<AcpSession>>,
    /// Live update router; `None` exactly when `acp` is.
    pub router: Option<Arc<UpdateRouter>>,
    /// Agent-issued session id; immutable once assigned.
    pub acp_session_id: String,
    /// Worktree path, exclusively owned by this session.
    pub cwd: PathBuf,
    /// Session branch; empty for scratch sessions.
    pub branch_name: String,
    /// Opaque adapter state.
    pub service_metadata: Value,
    /// Whether a prompt turn is currently running.
    turn_in_flight: bool,
    /// Whether a restored session is mid-respawn. Claimed under the same
    /// lock acquisition that observes the missing agent, so only one
    /// follow-up ever spawns the replacement subprocess.
    respawning: bool,
    /// Follow-up prompts waiting for the running turn (or respawn) to end.
    queued_prompts: VecDeque<String>,
}

impl ActiveSession {
    fn to_persisted(&self) -> PersistedSession {
        PersistedSession {
            external_session_id: self.external_session_id.clone(),
            service_name: self.service_name.clone(),
            agent_name: self.agent_name.clone(),
            acp_session_id: self.acp_session_id.clone(),
            cwd: self.cwd.to_string_lossy().into_owned(),
            branch_name: self.branch_name.clone(),
            service_metadata: self.service_metadata.clone(),
            updated_at: chrono::Utc::now(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Orchestrates bridge sessions between service adapters and ACP agents.
pub struct SessionManager {
    config: Arc<GlobalConfig>,
    repo_provider: Arc<RepoProvider>,
    store: Arc<SessionStore>,
    /// Token vendors keyed by agent name.
    tokens: HashMap<String, Arc<dyn TokenProvider>>,
    sessions: Mutex<HashMap<String, ActiveSession>>,
}

impl SessionManager {
    /// Create a manager over the shared provider and store.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        repo_provider: Arc<RepoProvider>,
        store: Arc<SessionStore>,
        tokens: HashMap<String, Arc<dyn TokenProvider>>,
    ) -> Self {
        Self {
            config,
            repo_provider,
            store,
            tokens,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Worktree paths of every tracked session (live and restored), for the
    /// stale-worktree sweep.
    pub async fn active_cwds(&self) -> HashSet<PathBuf> {
        self.sessions
            .lock()
            .await
            .values()
            .map(|s| s.cwd.clone())
            .collect()
    }

    /// Handle a new session request from an adapter.
    ///
    /// A request whose external id already has a session is treated as a
    /// follow-up. Failures while starting are reported to the adapter via
    /// `send_error` rather than escalated.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NoSuchSession` only through the follow-up path.
    pub async fn handle_new_session(
        self: &Arc<Self>,
        adapter: Arc<dyn ServiceAdapter>,
        request: BridgeSessionRequest,
    ) -> Result<()> {
        let external_id = request.external_session_id.clone();
        let span =
            info_span!("new_session", session_id = %external_id, service = %request.service_name);

        async {
            // Reserve the slot atomically so a racing duplicate event turns
            // into a follow-up instead of a second session.
            {
                let mut sessions = self.sessions.lock().await;
                if sessions.contains_key(&external_id) {
                    drop(sessions);
                    info!("session exists, treating request as follow-up");
                    return self.handle_followup(&external_id, &request.prompt).await;
                }
                sessions.insert(
                    external_id.clone(),
                    ActiveSession {
                        external_session_id: external_id.clone(),
                        service_name: adapter.service_name().to_owned(),
                        agent_name: request.agent_name.clone(),
                        adapter: Arc::clone(&adapter),
                        acp: None,
                        router: None,
                        acp_session_id: String::new(),
                        cwd: PathBuf::new(),
                        branch_name: String::new(),
                        service_metadata: request.service_metadata.clone(),
                        turn_in_flight: false,
                        respawning: false,
                        queued_prompts: VecDeque::new(),
                    },
                );
            }

            if let Err(err) = self.start_new_session(&adapter, &request).await {
                warn!(%err, "failed to start session");
                // Unrecoverable before the first turn: take the whole
                // session down, worktree and record included.
                self.remove_session(&external_id).await;
                self.notify_error(&adapter, &external_id, &err).await;
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Provision, spawn, persist, and run the opening turn.
    async fn start_new_session(
        self: &Arc<Self>,
        adapter: &Arc<dyn ServiceAdapter>,
        request: &BridgeSessionRequest,
    ) -> Result<()> {
        let external_id = &request.external_session_id;

        // Immediate acknowledgment so the user sees life before the repo
        // clone finishes.
        if let Err(err) = adapter
            .send_update(
                external_id,
                BridgeUpdate::Thought {
                    text: "Starting work...".into(),
                },
            )
            .await
        {
            warn!(%err, "failed to send initial acknowledgment");
        }

        let agent = self.config.agent(&request.agent_name)?.clone();
        let tokens = self.token_provider(&agent.name);

        let slug = if request.descriptive_name.is_empty() {
            external_id.clone()
        } else {
            request.descriptive_name.clone()
        };
        let handle = self
            .repo_provider
            .provision(&self.config.github.repo, &slug, tokens.as_ref())
            .await?;

        // Persist the placeholder before the agent runs: a crash between
        // here and the session id arriving leaves a record whose worktree
        // can at least be swept.
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(active) = sessions.get_mut(external_id) {
                active.agent_name = agent.name.clone();
                active.cwd = handle.cwd.clone();
                active.branch_name = handle.branch_name.clone();
                self.store.upsert(active.to_persisted()).await?;
            }
        }

        let router = Arc::new(UpdateRouter::new(
            Arc::clone(adapter),
            external_id.clone(),
            self.config.debounce_window,
        ));
        let on_update = router_update_handler(&router);

        let acp =
            Arc::new(AcpSession::start(&agent, &handle.cwd, &handle.env, on_update, None).await?);
        let acp_session_id = acp.session_id().to_owned();

        {
            let mut sessions = self.sessions.lock().await;
            let Some(active) = sessions.get_mut(external_id) else {
                // Removed while we were spawning; tear the agent down.
                drop(sessions);
                acp.close().await;
                return Ok(());
            };
            active.acp = Some(Arc::clone(&acp));
            active.router = Some(Arc::clone(&router));
            active.acp_session_id = acp_session_id;
            self.store.upsert(active.to_persisted()).await?;
        }

        self.spawn_slow_start_watch(external_id.clone(), Arc::clone(&router));

        let prompt = compose_opening_prompt(&request.prompt, &handle.branch_name);
        self.run_turns(external_id, prompt, true).await;
        Ok(())
    }

    /// Handle a follow-up message on an existing session.
    ///
    /// Restored sessions (no live agent) are respawned with `session/load`
    /// so the conversation history carries over. If a turn is already
    /// running — or another follow-up is mid-respawn — the prompt queues
    /// and is issued when the session frees up.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NoSuchSession` when nothing is tracked under
    /// `external_session_id`.
    pub async fn handle_followup(
        self: &Arc<Self>,
        external_session_id: &str,
        prompt: &str,
    ) -> Result<()> {
        let span = info_span!("followup", session_id = %external_session_id);

        async {
            let (adapter, needs_respawn) = {
                let mut sessions = self.sessions.lock().await;
                let active = sessions.get_mut(external_session_id).ok_or_else(|| {
                    AppError::NoSuchSession(format!(
                        "no session for '{external_session_id}'; start a new conversation to begin"
                    ))
                })?;

                if active.turn_in_flight || active.respawning {
                    info!("session busy, queueing follow-up");
                    active.queued_prompts.push_back(prompt.to_owned());
                    return Ok(());
                }
                // Claim the respawn while still holding the lock that
                // observed the missing agent; a concurrent follow-up sees
                // `respawning` and queues instead of loading the same
                // history into a second subprocess.
                let needs_respawn = active.acp.is_none();
                if needs_respawn {
                    active.respawning = true;
                }
                (Arc::clone(&active.adapter), needs_respawn)
            };

            if let Err(err) = adapter
                .send_update(
                    external_session_id,
                    BridgeUpdate::Thought {
                        text: "Processing follow-up...".into(),
                    },
                )
                .await
            {
                warn!(%err, "failed to send follow-up acknowledgment");
            }

            if needs_respawn {
                let outcome = self.respawn_session(external_session_id).await;
                {
                    let mut sessions = self.sessions.lock().await;
                    if let Some(active) = sessions.get_mut(external_session_id) {
                        active.respawning = false;
                        if outcome.is_err() {
                            // Prompts queued behind the respawn have no
                            // agent to run on; the next follow-up retries.
                            active.queued_prompts.clear();
                        }
                    }
                }
                if let Err(err) = outcome {
                    warn!(%err, "failed to resume session");
                    self.notify_error(&adapter, external_session_id, &err).await;
                    return Ok(());
                }
            }

            self.run_turns(external_session_id, prompt.to_owned(), false)
                .await;
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Respawn the agent for a restored session, resuming its history.
    async fn respawn_session(self: &Arc<Self>, external_session_id: &str) -> Result<()> {
        let (adapter, agent_name, acp_session_id, cwd, branch_name) = {
            let sessions = self.sessions.lock().await;
            let active = sessions
                .get(external_session_id)
                .ok_or_else(|| AppError::NoSuchSession(external_session_id.to_owned()))?;
            (
                Arc::clone(&active.adapter),
                active.agent_name.clone(),
                active.acp_session_id.clone(),
                active.cwd.clone(),
                active.branch_name.clone(),
            )
        };

        if acp_session_id.is_empty() {
            return Err(AppError::NoSuchSession(format!(
                "session '{external_session_id}' has no resumable history"
            )));
        }

        let agent = self.config.agent(&agent_name)?.clone();
        let tokens = self.token_provider(&agent.name);
        let handle = self
            .repo_provider
            .prepare_resume(
                &self.config.github.repo,
                &branch_name,
                &cwd,
                tokens.as_ref(),
            )
            .await?;

        let router = Arc::new(UpdateRouter::new(
            adapter,
            external_session_id.to_owned(),
            self.config.debounce_window,
        ));
        let on_update = router_update_handler(&router);

        let acp = Arc::new(
            AcpSession::start(
                &agent,
                &handle.cwd,
                &handle.env,
                on_update,
                Some(&acp_session_id),
            )
            .await?,
        );

        let mut sessions = self.sessions.lock().await;
        let Some(active) = sessions.get_mut(external_session_id) else {
            drop(sessions);
            acp.close().await;
            return Err(AppError::NoSuchSession(external_session_id.to_owned()));
        };
        active.acp = Some(acp);
        active.router = Some(router);
        // Re-persist: adapters may have refreshed service_metadata, and the
        // record's timestamp should reflect the resumption.
        if let Err(err) = self.store.upsert(active.to_persisted()).await {
            warn!(session_id = external_session_id, %err, "failed to persist resumed session");
        }
        info!(acp_session_id = %acp_session_id, "resumed agent session");
        Ok(())
    }

    /// Cancel the running turn of a session. Queued follow-ups are
    /// discarded — a stop means stop.
    pub async fn handle_stop(&self, external_session_id: &str) {
        let acp = {
            let mut sessions = self.sessions.lock().await;
            let Some(active) = sessions.get_mut(external_session_id) else {
                return;
            };
            active.queued_prompts.clear();
            active.acp.clone()
        };

        if let Some(acp) = acp {
            if let Err(err) = acp.cancel().await {
                warn!(session_id = external_session_id, %err, "failed to send cancel");
            }
        }
    }

    /// Remove a session: close the agent, clean the worktree (the branch is
    /// kept for review), delete the persisted record.
    pub async fn remove_session(&self, external_session_id: &str) {
        let Some(active) = self.sessions.lock().await.remove(external_session_id) else {
            return;
        };

        if let Some(acp) = active.acp {
            acp.close().await;
        }
        self.repo_provider
            .cleanup_worktree(&self.config.github.repo, &active.cwd)
            .await;
        if let Err(err) = self.store.remove(external_session_id).await {
            warn!(session_id = external_session_id, %err, "failed to delete persisted session");
        }
        info!(session_id = external_session_id, "removed session");
    }

    /// Recreate ActiveSession records for an adapter from persisted
    /// metadata. Runtime handles stay `None` until the first follow-up.
    ///
    /// Records match on exact adapter name; records that predate per-agent
    /// adapter names match on the bare service type when their agent fits.
    pub async fn restore_sessions_for_adapter(&self, adapter: &Arc<dyn ServiceAdapter>) {
        let adapter_name = adapter.service_name().to_owned();
        let (adapter_type, adapter_agent) = adapter_name
            .split_once(':')
            .map_or((adapter_name.as_str(), ""), |(t, a)| (t, a));

        let mut restored = 0usize;
        let mut sessions = self.sessions.lock().await;
        for record in self.store.all().await {
            let exact = record.service_name == adapter_name;
            let legacy = record.service_name == adapter_type
                && (record.agent_name.is_empty() || record.agent_name == adapter_agent);
            if !(exact || legacy) {
                continue;
            }
            if sessions.contains_key(&record.external_session_id) {
                continue;
            }

            sessions.insert(
                record.external_session_id.clone(),
                ActiveSession {
                    external_session_id: record.external_session_id.clone(),
                    service_name: adapter_name.clone(),
                    agent_name: record.agent_name.clone(),
                    adapter: Arc::clone(adapter),
                    acp: None,
                    router: None,
                    acp_session_id: record.acp_session_id.clone(),
                    cwd: PathBuf::from(&record.cwd),
                    branch_name: record.branch_name.clone(),
                    service_metadata: record.service_metadata.clone(),
                    turn_in_flight: false,
                    respawning: false,
                    queued_prompts: VecDeque::new(),
                },
            );
            restored += 1;
        }

        if restored > 0 {
            info!(
                count = restored,
                adapter = %adapter_name,
                "restored persisted sessions"
            );
        }
    }

    /// Close every live agent session. Persisted records are kept so
    /// sessions resume after restart.
    pub async fn shutdown(&self) {
        let drained: Vec<ActiveSession> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, s)| s).collect()
        };

        for active in drained {
            if let Some(acp) = active.acp {
                acp.close().await;
            }
        }
        info!("session manager shut down");
    }

    // ── Turn loop ────────────────────────────────────────────────────────────

    /// Run the given prompt, then keep draining queued follow-ups until the
    /// session is idle.
    async fn run_turns(
        self: &Arc<Self>,
        external_session_id: &str,
        prompt: String,
        mut first: bool,
    ) {
        let mut prompt = prompt;
        loop {
            let Some((acp, router, adapter)) = self.begin_turn(external_session_id, &prompt).await
            else {
                return;
            };

            let outcome = acp.prompt(&prompt).await;
            let final_message = router.finish_turn().await;
            let session_url = self.config.session_url(acp.session_id());

            match outcome {
                Ok(stop_reason) => {
                    self.report_turn(
                        &adapter,
                        external_session_id,
                        stop_reason,
                        &final_message,
                        &session_url,
                        first,
                    )
                    .await;
                }
                Err(err) => {
                    warn!(session_id = external_session_id, %err, "prompt turn failed");
                    // The subprocess may be gone; drop the live handles so a
                    // follow-up respawns and resumes from persisted history.
                    self.detach_runtime(external_session_id).await;
                    self.notify_error(&adapter, external_session_id, &err).await;
                }
            }

            match self.end_turn(external_session_id).await {
                Some(next) => {
                    prompt = next;
                    first = false;
                }
                None => return,
            }
        }
    }

    /// Claim the session for a turn. Returns `None` (after queueing the
    /// prompt) when another turn already holds it, or when the session has
    /// no live agent.
    async fn begin_turn(
        &self,
        external_session_id: &str,
        prompt: &str,
    ) -> Option<(Arc<AcpSession>, Arc<UpdateRouter>, Arc<dyn ServiceAdapter>)> {
        let mut sessions = self.sessions.lock().await;
        let active = sessions.get_mut(external_session_id)?;

        if active.turn_in_flight {
            active.queued_prompts.push_back(prompt.to_owned());
            return None;
        }
        let (Some(acp), Some(router)) = (active.acp.clone(), active.router.clone()) else {
            warn!(
                session_id = external_session_id,
                "turn requested without a live agent"
            );
            return None;
        };
        active.turn_in_flight = true;
        Some((acp, router, Arc::clone(&active.adapter)))
    }

    /// Release the turn flag and pop the next queued prompt, if any.
    async fn end_turn(&self, external_session_id: &str) -> Option<String> {
        let mut sessions = self.sessions.lock().await;
        let active = sessions.get_mut(external_session_id)?;
        active.turn_in_flight = false;
        active.queued_prompts.pop_front()
    }

    /// Drop a session's runtime handles, keeping the record for resumption.
    async fn detach_runtime(&self, external_session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(active) = sessions.get_mut(external_session_id) {
            if let Some(acp) = active.acp.take() {
                let session_id = external_session_id.to_owned();
                tokio::spawn(async move {
                    acp.close().await;
                    info!(session_id, "detached agent closed");
                });
            }
            active.router = None;
        }
    }

    /// Map a stop reason onto the adapter's terminal call.
    async fn report_turn(
        &self,
        adapter: &Arc<dyn ServiceAdapter>,
        external_session_id: &str,
        stop_reason: StopReason,
        final_message: &str,
        session_url: &str,
        first: bool,
    ) {
        let outcome = match stop_reason {
            StopReason::EndTurn => {
                let message = if final_message.trim().is_empty() {
                    if first {
                        "Work completed"
                    } else {
                        "Follow-up completed"
                    }
                } else {
                    final_message
                };
                adapter
                    .send_completion(external_session_id, message, session_url)
                    .await
            }
            StopReason::Cancelled => {
                adapter
                    .send_completion(external_session_id, "Stopped as requested.", session_url)
                    .await
            }
            StopReason::MaxTurnRequests => {
                adapter
                    .send_completion(
                        external_session_id,
                        &format!("Agent stopped (reason: {})", stop_reason.as_str()),
                        session_url,
                    )
                    .await
            }
            StopReason::Refusal | StopReason::MaxTokens => {
                adapter
                    .send_error(
                        external_session_id,
                        &format!("Agent stopped (reason: {})", stop_reason.as_str()),
                    )
                    .await
            }
        };

        if let Err(err) = outcome {
            warn!(session_id = external_session_id, %err, "adapter failed to deliver turn result");
        }
    }

    /// Report an error through the adapter, logging delivery failures.
    async fn notify_error(
        &self,
        adapter: &Arc<dyn ServiceAdapter>,
        external_session_id: &str,
        err: &AppError,
    ) {
        let message = match err {
            AppError::NoSuchSession(msg) => msg.clone(),
            AppError::Repo(_) | AppError::Auth(_) => "Failed to prepare repository".to_owned(),
            AppError::Acp(_) | AppError::Rpc { .. } => {
                "Agent encountered an error during execution".to_owned()
            }
            other => other.to_string(),
        };
        if let Err(send_err) = adapter.send_error(external_session_id, &message).await {
            warn!(session_id = external_session_id, %send_err, "adapter failed to deliver error");
        }
    }

    fn token_provider(&self, agent_name: &str) -> Option<Arc<dyn TokenProvider>> {
        self.tokens
            .get(agent_name)
            .or_else(|| self.tokens.get(self.config.default_agent().name.as_str()))
            .cloned()
    }

    /// Log a warning when a session produced no visible update within the
    /// expected window. The session is not killed; adapters may surface
    /// their own warning.
    fn spawn_slow_start_watch(&self, external_session_id: String, router: Arc<UpdateRouter>) {
        tokio::spawn(async move {
            tokio::time::sleep(FIRST_UPDATE_WARN_AFTER).await;
            if !router.has_emitted() {
                warn!(
                    session_id = %external_session_id,
                    "no update emitted within {FIRST_UPDATE_WARN_AFTER:?} of session start"
                );
            }
        });
    }
}

/// Bind a router to the client's update callback. The reader awaits the
/// handler per notification, so router processing stays in receive order
/// and completes before the turn's response resolves.
fn router_update_handler(router: &Arc<UpdateRouter>) -> UpdateHandler {
    let router = Arc::clone(router);
    Arc::new(move |notification| {
        let router = Arc::clone(&router);
        Box::pin(async move {
            router.handle_notification(notification).await;
        })
    })
}

/// Append branch guidance to the opening prompt of a branch-backed session.
fn compose_opening_prompt(prompt: &str, branch_name: &str) -> String {
    if branch_name.is_empty() {
        return prompt.to_owned();
    }
    format!(
        "{prompt}\n\n---\n\
         You are working on a git branch: `{branch_name}`. This branch has been \
         automatically created with the latest changes from the main branch.\n\
         If the user is asking you to make code changes, commit your changes, push \
         the branch, and create a GitHub pull request using the `gh` CLI. The \
         `GH_TOKEN` env var is already set.\n\
         If the user is just asking questions or requesting information, do not \
         make any changes or create a PR."
    )
}
