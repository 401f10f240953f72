//! Service-agnostic session requests produced by adapters.

use serde::{Deserialize, Serialize};

/// A request to start (or continue) an agent session, parsed from an inbound
/// service event by an adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeSessionRequest {
    /// Unique id of the logical conversation on the external service.
    pub external_session_id: String,
    /// Adapter instance name (e.g. `webhook:claude`).
    pub service_name: String,
    /// Which configured agent runs the session; empty selects the default.
    #[serde(default)]
    pub agent_name: String,
    /// Opening user message.
    pub prompt: String,
    /// Short human slug used for branch naming.
    #[serde(default)]
    pub descriptive_name: String,
    /// Whether this continues an existing session.
    #[serde(default)]
    pub is_followup: bool,
    /// Opaque adapter state persisted with the session.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub service_metadata: serde_json::Value,
}
