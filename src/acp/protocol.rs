//! ACP wire types.
//!
//! Serde models for the agent-facing slice of the Agent Communication
//! Protocol: `session/update` payload kinds, prompt results, permission
//! prompts, and the client-service (fs/terminal) request parameters. Field
//! names follow the protocol's camelCase spelling; enum values stay
//! snake_case as they appear on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::update::{PlanEntry, PlanEntryStatus};

/// Reason a prompt turn ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The agent finished its turn normally.
    EndTurn,
    /// The model hit its token ceiling mid-turn.
    MaxTokens,
    /// The agent exhausted its internal request budget.
    MaxTurnRequests,
    /// The model refused to continue.
    Refusal,
    /// The turn was cancelled via `session/cancel`.
    Cancelled,
}

impl StopReason {
    /// Wire spelling of the reason (matches the serde rename).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::MaxTokens => "max_tokens",
            Self::MaxTurnRequests => "max_turn_requests",
            Self::Refusal => "refusal",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A content block inside chunk updates. Only text is rendered; other block
/// types are tolerated and skipped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text payload.
    Text {
        /// The text itself.
        text: String,
    },
    /// Any non-text block (image, audio, resource, ...).
    #[serde(other)]
    Other,
}

impl ContentBlock {
    /// The text of a `Text` block, empty otherwise.
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Text { text } => text,
            Self::Other => "",
        }
    }
}

/// Lifecycle status of a tool call as reported by the agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Announced, not yet running.
    Pending,
    /// Running.
    InProgress,
    /// Succeeded.
    Completed,
    /// Errored.
    Failed,
}

/// File location attached to a tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallLocation {
    /// Absolute path the call touches.
    #[serde(default)]
    pub path: String,
}

/// Plan entry as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WirePlanEntry {
    /// Step description.
    pub content: String,
    /// Step status.
    pub status: PlanEntryStatus,
}

impl From<WirePlanEntry> for PlanEntry {
    fn from(entry: WirePlanEntry) -> Self {
        Self {
            content: entry.content,
            status: entry.status,
        }
    }
}

/// One `session/update` notification payload, discriminated by the
/// `sessionUpdate` field.
///
/// Unknown kinds fail deserialization; the client logs and skips them
/// rather than treating them as protocol errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    /// Echo of user input; ignored by the router.
    UserMessageChunk {
        /// Echoed content.
        content: ContentBlock,
    },
    /// Incremental agent response text.
    AgentMessageChunk {
        /// Chunk content.
        content: ContentBlock,
    },
    /// Incremental agent reasoning text.
    AgentThoughtChunk {
        /// Chunk content.
        content: ContentBlock,
    },
    /// A new tool call.
    #[serde(rename_all = "camelCase")]
    ToolCall {
        /// Agent-assigned id, stable across updates.
        tool_call_id: String,
        /// Human-readable title.
        #[serde(default)]
        title: String,
        /// Tool category.
        #[serde(default)]
        kind: Option<String>,
        /// Initial status.
        #[serde(default)]
        status: Option<ToolCallStatus>,
        /// Touched file locations.
        #[serde(default)]
        locations: Vec<ToolCallLocation>,
    },
    /// Progress on an existing tool call.
    #[serde(rename_all = "camelCase")]
    ToolCallUpdate {
        /// Id of the call being updated.
        tool_call_id: String,
        /// Updated title, when the agent refines it.
        #[serde(default)]
        title: Option<String>,
        /// Updated category.
        #[serde(default)]
        kind: Option<String>,
        /// Updated status.
        #[serde(default)]
        status: Option<ToolCallStatus>,
        /// Result payload once the call finished.
        #[serde(default)]
        content: Option<Value>,
    },
    /// Full plan replacement.
    Plan {
        /// Plan entries in agent order.
        entries: Vec<WirePlanEntry>,
    },
}

/// Params of an inbound `session/update` notification.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotification {
    /// Session the update belongs to.
    pub session_id: String,
    /// The update payload, kept raw so unknown kinds can be skipped.
    pub update: Value,
}

/// Kind of a permission option offered by the agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOptionKind {
    /// Allow this call and future identical ones.
    AllowAlways,
    /// Allow this call only.
    AllowOnce,
    /// Reject this call and future identical ones.
    RejectAlways,
    /// Reject this call only.
    RejectOnce,
}

/// One selectable option in a `session/request_permission` prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    /// Opaque id echoed back in the response.
    pub option_id: String,
    /// Display label.
    #[serde(default)]
    pub name: String,
    /// Option semantics.
    pub kind: PermissionOptionKind,
}

/// Params of an agent-initiated `session/request_permission` request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPermissionParams {
    /// Session asking for permission.
    #[serde(default)]
    pub session_id: String,
    /// Options offered, in agent preference order.
    pub options: Vec<PermissionOption>,
}

/// Pick the option an unattended bridge should select: the first
/// `allow_always`, else the first `allow_once`, else the first option
/// offered at all (this bridge approves rather than rejects).
#[must_use]
pub fn select_permission_option(options: &[PermissionOption]) -> Option<&PermissionOption> {
    options
        .iter()
        .find(|o| o.kind == PermissionOptionKind::AllowAlways)
        .or_else(|| {
            options
                .iter()
                .find(|o| o.kind == PermissionOptionKind::AllowOnce)
        })
        .or_else(|| options.first())
}

/// Agent capabilities announced in the `initialize` result.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    /// Whether the agent supports `session/load` resumption.
    #[serde(default)]
    pub load_session: bool,
}

/// Result of the `initialize` handshake.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Protocol version the agent speaks.
    #[serde(default)]
    pub protocol_version: Value,
    /// Optional capability set.
    #[serde(default)]
    pub agent_capabilities: Option<AgentCapabilities>,
}

/// Result of `session/new`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResult {
    /// Agent-issued session id.
    pub session_id: String,
}

/// Result of `session/prompt`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResult {
    /// Why the turn ended.
    pub stop_reason: StopReason,
}

/// Capabilities this client announces during `initialize`.
#[must_use]
pub fn client_capabilities() -> Value {
    json!({
        "fs": { "readTextFile": true, "writeTextFile": true },
        "terminal": true,
    })
}

// ── Client-service request params (agent → bridge) ──────────────────────────

/// Params of `fs/read_text_file`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadTextFileParams {
    /// Absolute path to read.
    pub path: String,
    /// 1-indexed first line, when reading a slice.
    #[serde(default)]
    pub line: Option<usize>,
    /// Maximum number of lines to return.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Params of `fs/write_text_file`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteTextFileParams {
    /// Absolute path to write; parent directories are created.
    pub path: String,
    /// Full new file content.
    pub content: String,
}

/// One environment variable for a terminal command.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvVariable {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

/// Params of `terminal/create`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalParams {
    /// Program to run.
    pub command: String,
    /// Program arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; defaults to the bridge process cwd.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Extra environment on top of the inherited one.
    #[serde(default)]
    pub env: Vec<EnvVariable>,
}

/// Params of the id-addressed terminal methods (`output`, `wait_for_exit`,
/// `kill`, `release`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalIdParams {
    /// Terminal to address.
    pub terminal_id: String,
}
