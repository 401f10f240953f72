//! Agent Communication Protocol (ACP) transport and sessions.
//!
//! This module owns everything between the bridge and a headless agent
//! subprocess: newline-delimited JSON-RPC 2.0 over the child's stdio, the
//! protocol session lifecycle, and the client-side services the agent may
//! call back into (permission prompts, filesystem, terminals).
//!
//! # Submodules
//!
//! - [`codec`]: [`tokio_util::codec::LinesCodec`]-based NDJSON framing with
//!   a 10 MiB per-line limit.
//! - [`protocol`]: serde models for the wire payloads (`session/update`
//!   kinds, stop reasons, permission prompts, fs/terminal params).
//! - [`client`]: the JSON-RPC client — pending-request routing, the
//!   notification subscriber channel, and auto-approved agent callbacks.
//! - [`session`]: one agent subprocess per session — spawn, `initialize`
//!   handshake, `session/new` / `session/load`, prompt turns, cancellation,
//!   and graceful teardown.

pub mod client;
pub mod codec;
pub mod protocol;
pub mod session;

pub use client::AcpClient;
pub use protocol::StopReason;
pub use session::AcpSession;
