//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// ACP subprocess or protocol failure (spawn, handshake, stream).
    Acp(String),
    /// JSON-RPC error object returned by the agent.
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable error message.
        message: String,
    },
    /// Git or worktree operation failure.
    Repo(String),
    /// Credential or token-exchange failure.
    Auth(String),
    /// Session store read/write failure.
    Store(String),
    /// Adapter ingress/egress failure.
    Adapter(String),
    /// Follow-up targeted a session with no live or persisted record.
    NoSuchSession(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Acp(msg) => write!(f, "acp: {msg}"),
            Self::Rpc { code, message } => write!(f, "rpc error {code}: {message}"),
            Self::Repo(msg) => write!(f, "repo: {msg}"),
            Self::Auth(msg) => write!(f, "auth: {msg}"),
            Self::Store(msg) => write!(f, "store: {msg}"),
            Self::Adapter(msg) => write!(f, "adapter: {msg}"),
            Self::NoSuchSession(msg) => write!(f, "no such session: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Acp(format!("json: {err}"))
    }
}
