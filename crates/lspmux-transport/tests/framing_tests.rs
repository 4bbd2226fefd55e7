//! Framing tests — decode/encode round-trips, chunked feeds, error cases.

use lspmux_protocol::{Message, Notification, Request, RequestId, Response};
use lspmux_transport::{encode, read_message, write_message, FrameCodec, FrameError};
use serde_json::json;

fn request(id: i64) -> Message {
    Message::Request(Request::new(
        id,
        "textDocument/hover",
        Some(json!({"textDocument": {"uri": "file:///a.ts"}, "position": {"line": 1, "character": 2}})),
    ))
}

// ─────────────────────────────────────────────────────────────────────────
// Round-trips
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn decode_of_encode_is_identity() {
    let original = request(7);
    let bytes = encode(&original).unwrap();

    let mut codec = FrameCodec::new();
    codec.feed(&bytes);
    let decoded = codec.decode().unwrap().expect("one full frame");

    assert_eq!(
        serde_json::to_value(&decoded).unwrap(),
        serde_json::to_value(&original).unwrap()
    );
    assert!(!codec.is_mid_frame());
}

#[test]
fn declared_length_is_utf8_byte_length() {
    let msg = Message::Notification(Notification::new(
        "window/showMessage",
        Some(json!({"message": "héllo wörld ✓"})),
    ));
    let bytes = encode(&msg).unwrap();
    let text = String::from_utf8_lossy(&bytes);
    let (header, body) = text.split_once("\r\n\r\n").unwrap();
    let declared: usize = header
        .strip_prefix("Content-Length: ")
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(declared, body.len());
    assert!(declared > body.chars().count(), "must count bytes, not chars");
}

#[test]
fn response_roundtrip_preserves_error_payload() {
    let wire = br#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"nope","data":{"k":1}}}"#;
    let framed = format!("Content-Length: {}\r\n\r\n", wire.len());
    let mut codec = FrameCodec::new();
    codec.feed(framed.as_bytes());
    codec.feed(wire);
    let Message::Response(resp) = codec.decode().unwrap().unwrap() else {
        panic!("expected response");
    };
    assert_eq!(resp.id, Some(RequestId::Number(4)));
    let error = resp.error.unwrap();
    assert_eq!(error.code, -32601);
    assert_eq!(error.data, Some(json!({"k": 1})));
}

// ─────────────────────────────────────────────────────────────────────────
// Partial reads and compaction
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn partial_feeds_accumulate_across_chunk_boundaries() {
    let bytes = encode(&request(1)).unwrap();
    let mut codec = FrameCodec::new();

    // Feed one byte at a time; a frame only appears once complete.
    for (i, byte) in bytes.iter().enumerate() {
        codec.feed(&[*byte]);
        let decoded = codec.decode().unwrap();
        if i < bytes.len() - 1 {
            assert!(decoded.is_none(), "frame complete too early at byte {i}");
        } else {
            assert!(decoded.is_some());
        }
    }
}

#[test]
fn multiple_frames_in_one_chunk() {
    let mut bytes = encode(&request(1)).unwrap();
    bytes.extend(encode(&request(2)).unwrap());
    bytes.extend(encode(&request(3)).unwrap());

    let mut codec = FrameCodec::new();
    codec.feed(&bytes);

    for expected in 1..=3 {
        let Message::Request(req) = codec.decode().unwrap().unwrap() else {
            panic!("expected request");
        };
        assert_eq!(req.id, RequestId::Number(expected));
    }
    assert!(codec.decode().unwrap().is_none());
}

#[test]
fn buffer_compacts_as_frames_are_consumed() {
    let frame = encode(&request(1)).unwrap();
    let mut codec = FrameCodec::new();

    for _ in 0..100 {
        codec.feed(&frame);
        assert!(codec.decode().unwrap().is_some());
        assert_eq!(codec.buffered(), 0, "consumed frames must be drained");
    }
}

#[test]
fn trailing_partial_frame_stays_buffered() {
    let mut bytes = encode(&request(1)).unwrap();
    let second = encode(&request(2)).unwrap();
    bytes.extend_from_slice(&second[..10]);

    let mut codec = FrameCodec::new();
    codec.feed(&bytes);
    assert!(codec.decode().unwrap().is_some());
    assert!(codec.decode().unwrap().is_none());
    assert!(codec.is_mid_frame());

    codec.feed(&second[10..]);
    assert!(codec.decode().unwrap().is_some());
    assert!(!codec.is_mid_frame());
}

// ─────────────────────────────────────────────────────────────────────────
// Header handling
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn extra_headers_are_ignored() {
    let body = br#"{"jsonrpc":"2.0","method":"initialized"}"#;
    let framed = format!(
        "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let mut codec = FrameCodec::new();
    codec.feed(framed.as_bytes());
    codec.feed(body);
    let msg = codec.decode().unwrap().unwrap();
    assert_eq!(msg.method(), Some("initialized"));
}

#[test]
fn header_name_is_case_insensitive() {
    let body = br#"{"jsonrpc":"2.0","method":"initialized"}"#;
    let framed = format!("content-length: {}\r\n\r\n", body.len());
    let mut codec = FrameCodec::new();
    codec.feed(framed.as_bytes());
    codec.feed(body);
    assert!(codec.decode().unwrap().is_some());
}

#[test]
fn missing_content_length_is_an_error() {
    let mut codec = FrameCodec::new();
    codec.feed(b"Content-Type: application/json\r\n\r\n{}");
    assert!(matches!(
        codec.decode(),
        Err(FrameError::MissingContentLength)
    ));
}

#[test]
fn non_numeric_content_length_is_an_error() {
    let mut codec = FrameCodec::new();
    codec.feed(b"Content-Length: banana\r\n\r\n{}");
    assert!(matches!(
        codec.decode(),
        Err(FrameError::InvalidContentLength(_))
    ));
}

#[test]
fn negative_content_length_is_an_error() {
    let mut codec = FrameCodec::new();
    codec.feed(b"Content-Length: -5\r\n\r\n{}");
    assert!(matches!(
        codec.decode(),
        Err(FrameError::InvalidContentLength(_))
    ));
}

#[test]
fn invalid_json_body_is_an_error() {
    let mut codec = FrameCodec::new();
    codec.feed(b"Content-Length: 4\r\n\r\n{{{{");
    assert!(matches!(codec.decode(), Err(FrameError::InvalidBody(_))));
}

// ─────────────────────────────────────────────────────────────────────────
// Async stream helpers
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn read_and_write_over_duplex() {
    let (mut a, mut b) = tokio::io::duplex(4096);

    let sent = Message::Response(Response::success(RequestId::Number(11), json!({"ok": true})));
    write_message(&mut a, &sent).await.unwrap();

    let mut codec = FrameCodec::new();
    let received = read_message(&mut b, &mut codec).await.unwrap().unwrap();
    assert_eq!(
        serde_json::to_value(&received).unwrap(),
        serde_json::to_value(&sent).unwrap()
    );
}

#[tokio::test]
async fn clean_eof_at_frame_boundary_is_none() {
    let (mut a, mut b) = tokio::io::duplex(4096);
    write_message(&mut a, &request(1)).await.unwrap();
    drop(a);

    let mut codec = FrameCodec::new();
    assert!(read_message(&mut b, &mut codec).await.unwrap().is_some());
    assert!(read_message(&mut b, &mut codec).await.unwrap().is_none());
}

#[tokio::test]
async fn eof_mid_body_is_a_framing_error() {
    use tokio::io::AsyncWriteExt;

    let (mut a, mut b) = tokio::io::duplex(4096);
    a.write_all(b"Content-Length: 100\r\n\r\n{\"jsonrpc\":")
        .await
        .unwrap();
    drop(a);

    let mut codec = FrameCodec::new();
    assert!(matches!(
        read_message(&mut b, &mut codec).await,
        Err(FrameError::UnexpectedEof)
    ));
}

#[tokio::test]
async fn eof_mid_header_is_a_framing_error() {
    use tokio::io::AsyncWriteExt;

    let (mut a, mut b) = tokio::io::duplex(4096);
    a.write_all(b"Content-Len").await.unwrap();
    drop(a);

    let mut codec = FrameCodec::new();
    assert!(matches!(
        read_message(&mut b, &mut codec).await,
        Err(FrameError::UnexpectedEof)
    ));
}
