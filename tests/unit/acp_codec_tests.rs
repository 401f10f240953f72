//! Unit tests for the direction-aware NDJSON codec on agent streams.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use acp_bridge::acp::codec::{AcpCodec, MAX_LINE_BYTES};
use acp_bridge::AppError;

/// A complete JSON object on a single newline-terminated line is decoded
/// without error and returned without the trailing `\n`.
#[test]
fn single_line_parses_correctly() {
    let mut codec = AcpCodec::inbound();
    let mut buf = BytesMut::from("{\"jsonrpc\":\"2.0\",\"method\":\"session/update\"}\n");

    let result = codec
        .decode(&mut buf)
        .expect("decode must succeed for a valid line");

    assert_eq!(
        result,
        Some("{\"jsonrpc\":\"2.0\",\"method\":\"session/update\"}".to_owned()),
        "codec must return the line content without the newline"
    );
}

/// Two messages delivered in one buffer decode as two items.
#[test]
fn batched_lines_are_each_parsed() {
    let mut codec = AcpCodec::inbound();
    let raw = concat!(
        "{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":null}\n",
        "{\"jsonrpc\":\"2.0\",\"method\":\"session/update\",\"params\":{}}\n",
    );
    let mut buf = BytesMut::from(raw);

    assert!(codec.decode(&mut buf).expect("first decode").is_some());
    assert!(codec.decode(&mut buf).expect("second decode").is_some());
    assert!(
        codec.decode(&mut buf).expect("empty decode").is_none(),
        "no further lines must be present"
    );
}

/// A message without its terminating newline stays buffered until the
/// newline arrives.
#[test]
fn partial_line_is_buffered_until_newline() {
    let mut codec = AcpCodec::inbound();

    let mut buf = BytesMut::from("{\"jsonrpc\":\"2.0\"");
    assert!(
        codec.decode(&mut buf).expect("partial decode").is_none(),
        "partial line must not be emitted before the newline"
    );

    buf.extend_from_slice(b",\"id\":7}\n");
    assert!(
        codec.decode(&mut buf).expect("complete decode").is_some(),
        "complete line must be emitted after the newline"
    );
}

/// An inbound line beyond the 10 MiB cap fails the decode rather than
/// truncating, and the error names the stream it came from.
#[test]
fn oversize_inbound_frame_returns_error() {
    let mut codec = AcpCodec::inbound();
    let big_line = "a".repeat(MAX_LINE_BYTES + 1) + "\n";
    let mut buf = BytesMut::from(big_line.as_str());

    match codec.decode(&mut buf) {
        Err(AppError::Acp(msg)) => {
            assert!(
                msg.contains("frame exceeds"),
                "error must describe the frame limit, got: {msg}"
            );
            assert!(
                msg.contains("agent stdout"),
                "error must name the inbound stream, got: {msg}"
            );
        }
        other => panic!("expected Err(AppError::Acp), got: {other:?}"),
    }
}

/// A line of exactly the cap still decodes.
#[test]
fn line_at_limit_decodes() {
    let mut codec = AcpCodec::inbound();
    let line = "b".repeat(MAX_LINE_BYTES) + "\n";
    let mut buf = BytesMut::from(line.as_str());

    let result = codec.decode(&mut buf).expect("decode at limit");
    assert_eq!(result.map(|s| s.len()), Some(MAX_LINE_BYTES));
}

/// The outbound codec terminates every frame with a newline and applies no
/// length cap — frames larger than the inbound limit still encode.
#[test]
fn outbound_frames_are_newline_terminated_and_uncapped() {
    let mut codec = AcpCodec::outbound();

    let mut buf = BytesMut::new();
    codec
        .encode("{\"jsonrpc\":\"2.0\",\"method\":\"exit\"}".to_owned(), &mut buf)
        .expect("encode must succeed");
    assert_eq!(&buf[..], b"{\"jsonrpc\":\"2.0\",\"method\":\"exit\"}\n");

    let mut buf = BytesMut::new();
    codec
        .encode("c".repeat(MAX_LINE_BYTES + 1), &mut buf)
        .expect("outbound frames carry no length cap");
    assert_eq!(buf.len(), MAX_LINE_BYTES + 2);
}
