//! Application assembly: adapters, HTTP surface, background sweeps.
//!
//! Boot order matters: adapters register their routes and have their
//! persisted sessions restored *before* `start()` opens them for traffic,
//! so an early follow-up cannot race the restore pass. Shutdown runs the
//! other way: ingress stops, live agent sessions close (persistence
//! intact), then adapters release their resources.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Json;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapter::webhook::WebhookAdapter;
use crate::adapter::ServiceAdapter;
use crate::config::GlobalConfig;
use crate::github::{GithubAppAuth, StaticTokenProvider, TokenProvider};
use crate::orchestrator::SessionManager;
use crate::persistence::SessionStore;
use crate::repo::RepoProvider;
use crate::Result;

/// How often the stale-worktree sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
/// Worktrees untouched for this long and owned by no session are removed.
const SWEEP_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// The assembled bridge: session manager, adapters, shared config.
pub struct Bridge {
    config: Arc<GlobalConfig>,
    /// Orchestrator shared with every adapter.
    pub session_manager: Arc<SessionManager>,
    /// One adapter per enabled service × configured agent.
    pub adapters: Vec<Arc<dyn ServiceAdapter>>,
    repo_provider: Arc<RepoProvider>,
}

impl Bridge {
    /// Build the full object graph from configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an unusable agent registry.
    pub async fn build(config: GlobalConfig) -> Result<Self> {
        let config = Arc::new(config);
        let repo_provider = Arc::new(RepoProvider::new(Arc::clone(&config)));
        let store = Arc::new(SessionStore::open(config.persistence_path()).await);
        let tokens = build_token_providers(&config);

        let session_manager = Arc::new(SessionManager::new(
            Arc::clone(&config),
            Arc::clone(&repo_provider),
            store,
            tokens,
        ));

        let adapters = build_adapters(&config, &session_manager);
        if adapters.is_empty() {
            warn!("no adapters enabled; the bridge will only answer /health");
        }

        Ok(Self {
            config,
            session_manager,
            adapters,
            repo_provider,
        })
    }

    /// Assemble the HTTP router: health endpoint plus every adapter's
    /// ingress routes.
    #[must_use]
    pub fn router(&self) -> axum::Router {
        let services: Vec<String> = self
            .adapters
            .iter()
            .map(|a| a.service_name().to_owned())
            .collect();

        let mut router = axum::Router::new().route(
            "/health",
            get(move || {
                let services = services.clone();
                async move { Json(health_body(&services)) }
            }),
        );
        for adapter in &self.adapters {
            router = adapter.register_routes(router);
        }
        router
    }

    /// Restore persisted sessions for each adapter, then start them.
    ///
    /// # Errors
    ///
    /// Returns the first adapter `start()` failure.
    pub async fn start_adapters(&self) -> Result<()> {
        for adapter in &self.adapters {
            self.session_manager
                .restore_sessions_for_adapter(adapter)
                .await;
            adapter.start().await?;
            info!(service = adapter.service_name(), "adapter started");
        }
        Ok(())
    }

    /// Periodically prune worktrees that belong to no tracked session.
    /// Runs one pass at startup, then every [`SWEEP_INTERVAL`].
    #[must_use]
    pub fn spawn_worktree_sweeper(&self, ct: CancellationToken) -> JoinHandle<()> {
        let provider = Arc::clone(&self.repo_provider);
        let manager = Arc::clone(&self.session_manager);
        tokio::spawn(async move {
            loop {
                let active = manager.active_cwds().await;
                let removed = provider.sweep_stale_worktrees(SWEEP_MAX_AGE, &active).await;
                if removed > 0 {
                    info!(removed, "stale worktree sweep finished");
                }
                tokio::select! {
                    () = ct.cancelled() => break,
                    () = tokio::time::sleep(SWEEP_INTERVAL) => {}
                }
            }
        })
    }

    /// Serve the HTTP surface until `ct` fires, then run the shutdown
    /// sequence: close live sessions (persistence kept), close adapters.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the listener cannot bind.
    pub async fn serve(&self, ct: CancellationToken) -> Result<()> {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
            crate::AppError::Config(format!("failed to bind http on {addr}: {err}"))
        })?;
        info!(%addr, "http surface listening");

        let shutdown_ct = ct.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown_ct.cancelled().await })
            .await
            .map_err(|err| crate::AppError::Config(format!("http server failed: {err}")))?;

        self.session_manager.shutdown().await;
        for adapter in &self.adapters {
            if let Err(err) = adapter.close().await {
                error!(service = adapter.service_name(), %err, "adapter close failed");
            }
        }
        Ok(())
    }
}

/// One token vendor per agent, from per-agent credentials: a GitHub App
/// when app id + private key are present, a static token fallback when
/// `GITHUB_TOKEN` is.
fn build_token_providers(config: &Arc<GlobalConfig>) -> HashMap<String, Arc<dyn TokenProvider>> {
    let mut providers: HashMap<String, Arc<dyn TokenProvider>> = HashMap::new();

    for agent in config.agents.values() {
        let app_id = config.service_credential("GITHUB_APP_ID", agent);
        let private_key = config.service_credential("GITHUB_PRIVATE_KEY", agent);

        if let (Some(app_id), Some(private_key)) = (app_id, private_key) {
            providers.insert(
                agent.name.clone(),
                Arc::new(GithubAppAuth::new(
                    app_id,
                    private_key.replace("\\n", "\n"),
                    config.github.installation_id,
                )),
            );
        } else if let Some(token) = config.service_credential("GITHUB_TOKEN", agent) {
            providers.insert(agent.name.clone(), Arc::new(StaticTokenProvider::new(token)));
        }
    }

    providers
}

/// Instantiate adapters for every enabled service × configured agent.
fn build_adapters(
    config: &Arc<GlobalConfig>,
    session_manager: &Arc<SessionManager>,
) -> Vec<Arc<dyn ServiceAdapter>> {
    let mut adapters: Vec<Arc<dyn ServiceAdapter>> = Vec::new();

    for agent in config.agents.values() {
        for service in &config.enabled_services {
            match service.as_str() {
                "webhook" => {
                    let secret = config
                        .service_credential("WEBHOOK_SECRET", agent)
                        .unwrap_or_default();
                    let callback_url = config
                        .service_credential("WEBHOOK_CALLBACK_URL", agent)
                        .unwrap_or_default();
                    adapters.push(WebhookAdapter::new(
                        Arc::clone(session_manager),
                        &agent.name,
                        agent.is_default,
                        secret,
                        callback_url,
                    ));
                }
                other => {
                    warn!(service = other, agent = %agent.name, "unknown service, skipping");
                }
            }
        }
    }

    adapters
}

/// Health payload shape, exposed for tests.
#[must_use]
pub fn health_body(services: &[String]) -> Value {
    json!({ "status": "ok", "services": services })
}
