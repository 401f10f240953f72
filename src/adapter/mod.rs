//! Service adapter contract.
//!
//! A service adapter is the bridge's view of one external collaboration
//! service (issue tracker, chat, code hosting) for one configured agent. It
//! owns one ingress channel — HTTP webhook routes or a persistent socket —
//! and one egress channel back to the service. The bridge core depends only
//! on this trait; a new service is added by writing a new adapter, never by
//! modifying the core.
//!
//! Methods return boxed futures so the contract stays object-safe and
//! adapters can be held as `Arc<dyn ServiceAdapter>` throughout the core.

pub mod webhook;

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::models::{BridgeSessionRequest, BridgeUpdate};
use crate::Result;

/// Boxed future used by the adapter contract.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Ingress/egress integration for one external service × agent pair.
pub trait ServiceAdapter: Send + Sync {
    /// Unique adapter instance name, e.g. `webhook:claude`.
    fn service_name(&self) -> &str;

    /// Wire ingress HTTP routes onto the application router.
    ///
    /// No-op for socket-based adapters.
    fn register_routes(&self, router: axum::Router) -> axum::Router {
        router
    }

    /// Start background tasks (socket connections, egress workers).
    ///
    /// No-op for purely webhook-based adapters.
    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Release adapter resources at shutdown.
    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Parse an inbound ingress event into a session request.
    ///
    /// Socket adapters that construct requests inside their own event
    /// handlers may leave the unsupported default in place.
    fn on_session_created<'a>(
        &'a self,
        event: &'a Value,
    ) -> BoxFuture<'a, Result<BridgeSessionRequest>> {
        let _ = event;
        Box::pin(async {
            Err(crate::AppError::Adapter(
                "adapter does not parse ingress events".into(),
            ))
        })
    }

    /// Render one user-visible update on the external service.
    fn send_update<'a>(
        &'a self,
        session_id: &'a str,
        update: BridgeUpdate,
    ) -> BoxFuture<'a, Result<()>>;

    /// Deliver the terminal success message for a turn.
    ///
    /// `session_url` links to the session viewer; empty when none is
    /// configured.
    fn send_completion<'a>(
        &'a self,
        session_id: &'a str,
        message: &'a str,
        session_url: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    /// Deliver a terminal failure message.
    fn send_error<'a>(&'a self, session_id: &'a str, error: &'a str) -> BoxFuture<'a, Result<()>>;
}
