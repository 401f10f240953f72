//! Durable session metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The durable projection of an active session: everything required to
/// resume the conversation after a restart, and nothing that lives only in
/// process memory (no channels, no subprocess handles).
///
/// Unknown fields written by a newer build are preserved across
/// read-modify-write cycles via the flattened `extra` map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedSession {
    /// External conversation id (store key, duplicated for self-description).
    pub external_session_id: String,
    /// Adapter instance that owns the session.
    pub service_name: String,
    /// Agent registry name running the session.
    #[serde(default)]
    pub agent_name: String,
    /// Agent-issued session id; identifies the stored conversation history.
    #[serde(default)]
    pub acp_session_id: String,
    /// Absolute worktree path.
    pub cwd: String,
    /// Git branch the session works on.
    #[serde(default)]
    pub branch_name: String,
    /// Opaque adapter state.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub service_metadata: serde_json::Value,
    /// When this record was last written.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Fields this build does not know about.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PersistedSession {
    /// Base service type of `service_name` (the part before `:`), used for
    /// legacy record matching during restore.
    #[must_use]
    pub fn service_type(&self) -> &str {
        self.service_name
            .split_once(':')
            .map_or(self.service_name.as_str(), |(base, _)| base)
    }
}
