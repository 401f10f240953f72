//! Outbound-webhook reference adapter.
//!
//! Ingress: one HTTP route (`/webhooks/webhook`, or `/webhooks/webhook/<agent>`
//! for non-default agents) accepting JSON events with an HMAC-SHA256
//! signature in `X-Hub-Signature-256` (`sha256=<hex>`). The handler verifies,
//! acknowledges with 200 immediately, and dispatches the actual work to a
//! background task — inbound events must be acknowledged within seconds.
//!
//! Egress: updates, completions, and errors are rendered as JSON and posted
//! to a configured callback URL through a buffered queue with exponential
//! backoff, so a flapping receiver slows delivery down instead of killing
//! sessions. Without a callback URL the egress degrades to log lines, which
//! keeps the adapter usable as a pure ingress endpoint.

use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapter::{BoxFuture, ServiceAdapter};
use crate::models::{BridgeSessionRequest, BridgeUpdate};
use crate::orchestrator::SessionManager;
use crate::{AppError, Result};

const QUEUE_CAPACITY: usize = 256;
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Inbound webhook event body.
#[derive(Debug, Deserialize)]
struct IngressEvent {
    /// `created`, `prompted`, or `stopped`.
    action: String,
    /// External conversation id.
    session_id: String,
    /// User message; required for `created` and `prompted`.
    #[serde(default)]
    prompt: String,
    /// Human title used for branch naming.
    #[serde(default)]
    title: String,
    /// Opaque state persisted with the session.
    #[serde(default)]
    metadata: Value,
}

/// One egress delivery.
#[derive(Debug)]
struct CallbackEvent {
    session_id: String,
    body: Value,
}

/// Webhook-based service adapter for one configured agent.
pub struct WebhookAdapter {
    service_name: String,
    agent_name: String,
    route_path: String,
    secret: String,
    callback_url: String,
    session_manager: Arc<SessionManager>,
    http: reqwest::Client,
    queue_tx: mpsc::Sender<CallbackEvent>,
    queue_rx: Mutex<Option<mpsc::Receiver<CallbackEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<Self>,
}

impl WebhookAdapter {
    /// Build an adapter instance.
    ///
    /// `secret` empty disables signature verification (development only);
    /// `callback_url` empty turns egress into log lines.
    #[must_use]
    pub fn new(
        session_manager: Arc<SessionManager>,
        agent_name: &str,
        is_default_agent: bool,
        secret: String,
        callback_url: String,
    ) -> Arc<Self> {
        let route_path = if is_default_agent {
            "/webhooks/webhook".to_owned()
        } else {
            format!("/webhooks/webhook/{agent_name}")
        };
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);

        Arc::new_cyclic(|self_ref| Self {
            service_name: format!("webhook:{agent_name}"),
            agent_name: agent_name.to_owned(),
            route_path,
            secret,
            callback_url,
            session_manager,
            http: reqwest::Client::new(),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            worker: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    /// Verify `X-Hub-Signature-256` over the raw body.
    fn verify_signature(&self, headers: &HeaderMap, body: &[u8]) -> bool {
        if self.secret.is_empty() {
            return true;
        }
        let Some(header) = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let Some(hex_digest) = header.strip_prefix("sha256=") else {
            return false;
        };
        let Ok(expected) = hex::decode(hex_digest) else {
            return false;
        };

        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes()) else {
            return false;
        };
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    }

    /// Ingress handler: verify, parse, acknowledge, dispatch.
    async fn handle_ingress(self: Arc<Self>, headers: HeaderMap, body: Bytes) -> StatusCode {
        if !self.verify_signature(&headers, &body) {
            warn!(service = %self.service_name, "rejected webhook with bad signature");
            return StatusCode::UNAUTHORIZED;
        }

        let event: IngressEvent = match serde_json::from_slice(&body) {
            Ok(event) => event,
            Err(err) => {
                warn!(service = %self.service_name, %err, "rejected malformed webhook body");
                return StatusCode::BAD_REQUEST;
            }
        };

        info!(
            service = %self.service_name,
            action = %event.action,
            session_id = %event.session_id,
            "webhook received"
        );

        // Acknowledge now; the session work runs in the background.
        let adapter = Arc::clone(&self);
        tokio::spawn(async move {
            adapter.dispatch(event).await;
        });

        StatusCode::OK
    }

    async fn dispatch(self: Arc<Self>, event: IngressEvent) {
        let manager = Arc::clone(&self.session_manager);
        match event.action.as_str() {
            "created" => {
                let request = BridgeSessionRequest {
                    external_session_id: event.session_id,
                    service_name: self.service_name.clone(),
                    agent_name: self.agent_name.clone(),
                    prompt: event.prompt,
                    descriptive_name: event.title,
                    is_followup: false,
                    service_metadata: event.metadata,
                };
                let adapter: Arc<dyn ServiceAdapter> = self;
                if let Err(err) = manager.handle_new_session(adapter, request).await {
                    warn!(%err, "failed to handle webhook session");
                }
            }
            "prompted" => {
                if let Err(err) = manager
                    .handle_followup(&event.session_id, &event.prompt)
                    .await
                {
                    warn!(session_id = %event.session_id, %err, "follow-up failed");
                    let _ = self
                        .send_error(&event.session_id, &err.to_string())
                        .await;
                }
            }
            "stopped" => {
                manager.handle_stop(&event.session_id).await;
            }
            other => {
                warn!(action = other, "ignoring unknown webhook action");
            }
        }
    }

    /// Queue one egress delivery. Without a callback URL it is logged.
    async fn enqueue(&self, session_id: &str, body: Value) -> Result<()> {
        if self.callback_url.is_empty() {
            info!(
                service = %self.service_name,
                session_id,
                payload = %body,
                "egress (no callback url configured)"
            );
            return Ok(());
        }
        self.queue_tx
            .send(CallbackEvent {
                session_id: session_id.to_owned(),
                body,
            })
            .await
            .map_err(|_| AppError::Adapter("egress queue closed".into()))
    }

    /// Deliver queued events, retrying with exponential backoff. Events
    /// that still fail after the attempt budget are dropped with a warning;
    /// egress problems never propagate back into sessions.
    fn spawn_egress_worker(
        http: reqwest::Client,
        callback_url: String,
        mut queue_rx: mpsc::Receiver<CallbackEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = queue_rx.recv().await {
                let mut backoff = INITIAL_RETRY_DELAY;
                let mut attempts = 0u32;
                loop {
                    attempts += 1;
                    let outcome = http.post(&callback_url).json(&event.body).send().await;
                    match outcome {
                        Ok(response) if response.status().is_success() => break,
                        Ok(response) => {
                            warn!(
                                session_id = %event.session_id,
                                status = %response.status(),
                                attempts,
                                "callback rejected"
                            );
                        }
                        Err(err) => {
                            warn!(session_id = %event.session_id, %err, attempts, "callback failed");
                        }
                    }
                    if attempts >= MAX_DELIVERY_ATTEMPTS {
                        warn!(
                            session_id = %event.session_id,
                            "dropping callback after {MAX_DELIVERY_ATTEMPTS} attempts"
                        );
                        break;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_RETRY_DELAY);
                }
            }
            info!("webhook egress worker exiting");
        })
    }
}

impl ServiceAdapter for WebhookAdapter {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn register_routes(&self, router: axum::Router) -> axum::Router {
        let Some(adapter) = self.self_ref.upgrade() else {
            return router;
        };
        info!(route = %self.route_path, service = %self.service_name, "registering webhook route");
        router.route(
            &self.route_path,
            post(move |headers: HeaderMap, body: Bytes| {
                let adapter = Arc::clone(&adapter);
                async move { adapter.handle_ingress(headers, body).await }
            }),
        )
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async {
            let Some(queue_rx) = self.queue_rx.lock().await.take() else {
                return Ok(());
            };
            if self.callback_url.is_empty() {
                return Ok(());
            }
            let worker = Self::spawn_egress_worker(
                self.http.clone(),
                self.callback_url.clone(),
                queue_rx,
            );
            *self.worker.lock().await = Some(worker);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async {
            if let Some(worker) = self.worker.lock().await.take() {
                worker.abort();
            }
            Ok(())
        })
    }

    fn on_session_created<'a>(
        &'a self,
        event: &'a Value,
    ) -> BoxFuture<'a, Result<BridgeSessionRequest>> {
        Box::pin(async move {
            let event: IngressEvent = serde_json::from_value(event.clone())
                .map_err(|err| AppError::Adapter(format!("bad ingress event: {err}")))?;
            if event.action != "created" {
                return Err(AppError::Adapter(format!(
                    "not a session-creation event: {}",
                    event.action
                )));
            }
            Ok(BridgeSessionRequest {
                external_session_id: event.session_id,
                service_name: self.service_name.clone(),
                agent_name: self.agent_name.clone(),
                prompt: event.prompt,
                descriptive_name: event.title,
                is_followup: false,
                service_metadata: event.metadata,
            })
        })
    }

    fn send_update<'a>(
        &'a self,
        session_id: &'a str,
        update: BridgeUpdate,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let body = json!({
                "session_id": session_id,
                "event": "update",
                "update": update,
            });
            self.enqueue(session_id, body).await
        })
    }

    fn send_completion<'a>(
        &'a self,
        session_id: &'a str,
        message: &'a str,
        session_url: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut body = json!({
                "session_id": session_id,
                "event": "completion",
                "message": message,
            });
            if !session_url.is_empty() {
                body["session_url"] = Value::String(session_url.to_owned());
            }
            self.enqueue(session_id, body).await
        })
    }

    fn send_error<'a>(&'a self, session_id: &'a str, error: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let body = json!({
                "session_id": session_id,
                "event": "error",
                "error": error,
            });
            self.enqueue(session_id, body).await
        })
    }
}
