//! User-facing bridge updates derived from raw agent notifications.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a tool-call action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Reported but not yet running.
    Pending,
    /// Currently executing.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl ActionStatus {
    /// Whether this status ends the tool call's lifecycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Status of a single plan entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PlanEntryStatus {
    /// Not started.
    Pending,
    /// Being worked on.
    InProgress,
    /// Done.
    Completed,
    /// Abandoned.
    Canceled,
}

/// One entry of an agent plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanEntry {
    /// What the agent intends to do.
    pub content: String,
    /// Progress state.
    pub status: PlanEntryStatus,
}

/// A debounced, service-agnostic update delivered to adapters.
///
/// Produced by the update router from one or more raw `session/update`
/// notifications; adapters translate each variant into their own API calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeUpdate {
    /// Coalesced agent reasoning text.
    Thought {
        /// Accumulated thought text for the window.
        text: String,
    },
    /// A tool call, reported at its latest known state.
    Action {
        /// Agent-assigned tool-call identifier.
        id: String,
        /// Short human-readable title.
        title: String,
        /// Tool category (`read`, `edit`, `execute`, ...).
        kind: String,
        /// Latest lifecycle status.
        status: ActionStatus,
        /// Result excerpt, present once the call completed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    /// Full replacement of the agent's plan.
    Plan {
        /// Plan entries in agent order.
        entries: Vec<PlanEntry>,
    },
    /// Coalesced response text addressed to the user.
    MessageChunk {
        /// Accumulated message text for the window.
        text: String,
    },
    /// A session-fatal or turn-fatal error.
    Error {
        /// Human-readable description.
        message: String,
    },
}
