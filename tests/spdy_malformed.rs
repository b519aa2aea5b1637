//! Robustness against malformed input: recoverable skips versus
//! session-fatal decode errors.

use bytes::{BufMut, BytesMut};
use spindle::{CloseOutcome, Error, Request, SessionConfig, StreamStatus};

mod helpers;
use helpers::mock_peer::{control_frame, goaway_fields, ping_id, rst_fields, GOAWAY, PING, RST_STREAM};
use helpers::start;

fn get(path: &str) -> Request {
    Request::get(format!("https://example.com{}", path).parse().unwrap())
}

#[tokio::test]
async fn test_unknown_control_frame_ignored() {
    let mut t = start(SessionConfig::default()).await;
    t.peer.handshake().await;

    // Type 0x0b does not exist; the payload is discarded.
    let frame = control_frame(0x0b, 0, &[0xaa, 0xbb, 0xcc]);
    t.peer.send_raw(&frame).await;

    // The session is still alive and answers pings.
    t.peer.send_ping(2).await;
    let echo = t.peer.expect_control(PING).await;
    assert_eq!(ping_id(&echo), 2);
}

#[tokio::test]
async fn test_malformed_header_block_resets_stream() {
    let mut t = start(SessionConfig::default()).await;
    t.peer.handshake().await;

    let request = t.handle.queue(get("/")).await.unwrap();
    let _ = t.peer.read_syn_stream().await;

    // Valid zlib, invalid plaintext: the block declares two pairs but
    // carries one. The shared compression state stays usable.
    let mut plain = BytesMut::new();
    plain.put_u32(2);
    plain.put_u32(7);
    plain.extend_from_slice(b":status");
    plain.put_u32(6);
    plain.extend_from_slice(b"200 OK");
    let block = t.peer.compress_raw(&plain);
    t.peer.send_syn_reply_block(1, false, &block).await;

    let rst = t.peer.expect_control(RST_STREAM).await;
    assert_eq!(rst_fields(&rst), (1, 1)); // PROTOCOL_ERROR
    assert!(matches!(
        request.response().await,
        Err(Error::Stream {
            status: StreamStatus::ProtocolError,
            ..
        })
    ));

    // A later request on the same session still works.
    let request = t.handle.queue(get("/again")).await.unwrap();
    let (stream_id, ..) = t.peer.read_syn_stream().await;
    assert_eq!(stream_id, 3);
    t.peer
        .send_syn_reply(3, true, &[(":status", "200 OK")])
        .await;
    assert!(request.response().await.unwrap().is_success());
}

#[tokio::test]
async fn test_undecodable_header_block_is_session_fatal() {
    let mut t = start(SessionConfig::default()).await;
    t.peer.handshake().await;

    let request = t.handle.queue(get("/")).await.unwrap();
    let _ = t.peer.read_syn_stream().await;

    // Not zlib at all: the decoder state is unrecoverable.
    t.peer
        .send_syn_reply_block(1, false, &[0x01, 0x02, 0x03, 0x04])
        .await;

    let goaway = t.peer.expect_control(GOAWAY).await;
    let (_, status) = goaway_fields(&goaway);
    assert_eq!(status, 1); // PROTOCOL_ERROR
    assert!(request.response().await.is_err());
    assert!(matches!(t.handle.closed().await, CloseOutcome::Failed(_)));
}

#[tokio::test]
async fn test_oversized_header_block_resets_stream() {
    let config = SessionConfig {
        max_header_size: 256,
        ..Default::default()
    };
    let mut t = start(config).await;
    t.peer.handshake().await;

    let request = t.handle.queue(get("/")).await.unwrap();
    let _ = t.peer.read_syn_stream().await;

    let big = "x".repeat(1024);
    t.peer
        .send_syn_reply(1, false, &[(":status", "200 OK"), ("x-big", &big)])
        .await;

    let rst = t.peer.expect_control(RST_STREAM).await;
    assert_eq!(rst_fields(&rst), (1, 1)); // PROTOCOL_ERROR
    assert!(request.response().await.is_err());

    // The zlib state survived, so the session keeps working.
    t.peer.send_ping(2).await;
    let echo = t.peer.expect_control(PING).await;
    assert_eq!(ping_id(&echo), 2);
}

#[tokio::test]
async fn test_rst_is_never_answered_with_rst() {
    let mut t = start(SessionConfig::default()).await;
    t.peer.handshake().await;

    let request = t.handle.queue(get("/")).await.unwrap();
    let _ = t.peer.read_syn_stream().await;

    t.peer.send_rst(1, 3).await; // REFUSED_STREAM

    assert!(matches!(
        request.response().await,
        Err(Error::Stream {
            status: StreamStatus::RefusedStream,
            ..
        })
    ));

    // No RST (or anything else) comes back.
    t.peer.send_ping(2).await;
    let frame = t.peer.expect_control(PING).await;
    assert_eq!(ping_id(&frame), 2);
}
