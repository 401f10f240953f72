//! Line framing for ACP agent stdio streams.
//!
//! ACP messages are newline-delimited JSON objects, one per line, with no
//! embedded newlines. Each half of the agent's stdio gets its own codec
//! instance: the inbound side (agent stdout) enforces a hard frame limit,
//! because an oversize line must fail the connection rather than be
//! silently truncated; the outbound side (agent stdin) carries frames this
//! process built itself, so no cap applies. The direction travels into
//! every framing error so the session layer can tell a poisoned agent
//! stream from a write failure on a dead subprocess.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum inbound line length: 10 MiB.
///
/// Agents occasionally emit very large tool results in a single
/// `session/update` notification, so the limit is generous. Inbound lines
/// beyond it fail [`AcpCodec::decode`] with [`AppError::Acp`], which the
/// reader treats as connection-fatal.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Which half of the agent's stdio a codec instance frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Reading the agent's stdout.
    Inbound,
    /// Writing the agent's stdin.
    Outbound,
}

impl StreamDirection {
    fn stream_name(self) -> &'static str {
        match self {
            Self::Inbound => "agent stdout",
            Self::Outbound => "agent stdin",
        }
    }
}

/// Newline-delimited JSON codec for one direction of an agent stream.
///
/// Use [`AcpCodec::inbound`] with [`tokio_util::codec::FramedRead`] over
/// the child's stdout and [`AcpCodec::outbound`] with
/// [`tokio_util::codec::FramedWrite`] over its stdin.
#[derive(Debug)]
pub struct AcpCodec {
    inner: LinesCodec,
    direction: StreamDirection,
}

impl AcpCodec {
    /// Codec for the agent's stdout, capped at [`MAX_LINE_BYTES`] per line.
    #[must_use]
    pub fn inbound() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_LINE_BYTES),
            direction: StreamDirection::Inbound,
        }
    }

    /// Codec for the agent's stdin. No length cap: outbound frames are
    /// serialised by this process and are well-formed by construction.
    #[must_use]
    pub fn outbound() -> Self {
        Self {
            inner: LinesCodec::new(),
            direction: StreamDirection::Outbound,
        }
    }

    /// Name a framing failure after the stream it happened on.
    fn framing_error(&self, e: LinesCodecError) -> AppError {
        match e {
            LinesCodecError::MaxLineLengthExceeded => AppError::Acp(format!(
                "{}: frame exceeds the {MAX_LINE_BYTES}-byte limit",
                self.direction.stream_name()
            )),
            LinesCodecError::Io(io_err) => {
                AppError::Io(format!("{}: {io_err}", self.direction.stream_name()))
            }
        }
    }
}

impl Decoder for AcpCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.inner.decode(src).map_err(|e| self.framing_error(e))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.inner
            .decode_eof(src)
            .map_err(|e| self.framing_error(e))
    }
}

impl Encoder<String> for AcpCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.inner.encode(item, dst).map_err(|e| self.framing_error(e))
    }
}
