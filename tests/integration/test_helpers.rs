//! Shared helpers for integration tests.
//!
//! Provides a recording adapter, configuration pointed at the `stub-agent`
//! binary, and session-manager construction so individual test modules can
//! focus on behaviour rather than boilerplate.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use acp_bridge::adapter::{BoxFuture, ServiceAdapter};
use acp_bridge::config::GlobalConfig;
use acp_bridge::models::update::BridgeUpdate;
use acp_bridge::orchestrator::SessionManager;
use acp_bridge::persistence::SessionStore;
use acp_bridge::repo::RepoProvider;
use acp_bridge::Result;

/// Everything an adapter was asked to render, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Update(BridgeUpdate),
    Completion { message: String, session_url: String },
    Error(String),
}

impl AdapterEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completion { .. } | Self::Error(_))
    }
}

/// Adapter that records every call and signals terminal events.
pub struct RecordingAdapter {
    name: String,
    events: std::sync::Mutex<Vec<AdapterEvent>>,
    terminal_tx: mpsc::UnboundedSender<AdapterEvent>,
    terminal_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<AdapterEvent>>,
}

impl RecordingAdapter {
    pub fn new(name: &str) -> Arc<Self> {
        let (terminal_tx, terminal_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name: name.to_owned(),
            events: std::sync::Mutex::new(Vec::new()),
            terminal_tx,
            terminal_rx: tokio::sync::Mutex::new(terminal_rx),
        })
    }

    pub fn events(&self) -> Vec<AdapterEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn completions(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                AdapterEvent::Completion { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                AdapterEvent::Error(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: AdapterEvent) {
        if event.is_terminal() {
            let _ = self.terminal_tx.send(event.clone());
        }
        self.events.lock().unwrap().push(event);
    }

    /// Await the next completion or error, failing the test on timeout.
    pub async fn wait_terminal(&self, timeout: Duration) -> AdapterEvent {
        let mut rx = self.terminal_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv())
            .await
            .expect("timed out waiting for a terminal adapter event")
            .expect("terminal channel closed")
    }
}

impl ServiceAdapter for RecordingAdapter {
    fn service_name(&self) -> &str {
        &self.name
    }

    fn send_update<'a>(
        &'a self,
        _session_id: &'a str,
        update: BridgeUpdate,
    ) -> BoxFuture<'a, Result<()>> {
        self.record(AdapterEvent::Update(update));
        Box::pin(async { Ok(()) })
    }

    fn send_completion<'a>(
        &'a self,
        _session_id: &'a str,
        message: &'a str,
        session_url: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        self.record(AdapterEvent::Completion {
            message: message.to_owned(),
            session_url: session_url.to_owned(),
        });
        Box::pin(async { Ok(()) })
    }

    fn send_error<'a>(&'a self, _session_id: &'a str, error: &'a str) -> BoxFuture<'a, Result<()>> {
        self.record(AdapterEvent::Error(error.to_owned()));
        Box::pin(async { Ok(()) })
    }
}

/// Config pointed at the stub agent, with a short debounce and no
/// repository (scratch worktrees).
pub fn stub_config(data_dir: &Path) -> GlobalConfig {
    stub_config_with(data_dir, &[])
}

/// Like [`stub_config`], with extra environment entries layered on top.
pub fn stub_config_with(data_dir: &Path, extra: &[(&str, &str)]) -> GlobalConfig {
    let mut vars = HashMap::from([
        (
            "BRIDGE_DATA_DIR".to_owned(),
            data_dir.to_string_lossy().into_owned(),
        ),
        (
            "ACP_AGENT_COMMAND".to_owned(),
            env!("CARGO_BIN_EXE_stub-agent").to_owned(),
        ),
        ("ENABLED_SERVICES".to_owned(), "webhook".to_owned()),
        ("BRIDGE_DEBOUNCE_MS".to_owned(), "50".to_owned()),
    ]);
    for (key, value) in extra {
        vars.insert((*key).to_owned(), (*value).to_owned());
    }
    GlobalConfig::from_map(vars).expect("test config must be valid")
}

/// Build a session manager (and its store handle) over `config`.
pub async fn build_manager(config: GlobalConfig) -> (Arc<SessionManager>, Arc<SessionStore>) {
    let config = Arc::new(config);
    let store = Arc::new(SessionStore::open(config.persistence_path()).await);
    let provider = Arc::new(RepoProvider::new(Arc::clone(&config)));
    let manager = Arc::new(SessionManager::new(
        config,
        provider,
        Arc::clone(&store),
        HashMap::new(),
    ));
    (manager, store)
}

/// A session request against the stub agent.
pub fn request(
    external_id: &str,
    service_name: &str,
    prompt: &str,
) -> acp_bridge::models::BridgeSessionRequest {
    acp_bridge::models::BridgeSessionRequest {
        external_session_id: external_id.to_owned(),
        service_name: service_name.to_owned(),
        agent_name: String::new(),
        prompt: prompt.to_owned(),
        descriptive_name: external_id.replace([':', '/'], " "),
        is_followup: false,
        service_metadata: serde_json::Value::Null,
    }
}
