//! GOAWAY handling: draining semantics and stream survival rules.

use spindle::{CloseOutcome, Error, GoAwayStatus, Request, SessionConfig};

mod helpers;
use helpers::start;

fn get(path: &str) -> Request {
    Request::get(format!("https://example.com{}", path).parse().unwrap())
}

#[tokio::test]
async fn test_goaway_mid_flight() {
    let mut t = start(SessionConfig::default()).await;
    t.peer.handshake().await;

    let first = t.handle.queue(get("/1")).await.unwrap();
    let second = t.handle.queue(get("/3")).await.unwrap();
    let third = t.handle.queue(get("/5")).await.unwrap();

    for expected in [1u32, 3, 5] {
        let (stream_id, ..) = t.peer.read_syn_stream().await;
        assert_eq!(stream_id, expected);
    }

    // The peer will process streams 1 and 3 but not 5.
    t.peer.send_goaway(3, 0).await;

    match third.response().await {
        Err(Error::Session {
            status: GoAwayStatus::Ok,
            ..
        }) => {}
        other => panic!("expected session error, got {:?}", other.map(|_| ())),
    }
    assert!(t.handle.is_draining());
    assert!(!t.handle.is_open());
    assert!(t.handle.is_connected());

    // In-flight accepted streams keep going while draining.
    t.peer
        .send_syn_reply(1, false, &[(":status", "200 OK")])
        .await;
    t.peer.send_data(1, true, b"one").await;
    t.peer
        .send_syn_reply(3, false, &[(":status", "200 OK")])
        .await;
    t.peer.send_data(3, true, b"three").await;

    assert_eq!(&first.response().await.unwrap().body()[..], b"one");
    assert_eq!(&second.response().await.unwrap().body()[..], b"three");

    // Peer closes the transport once the drain is complete.
    drop(t.peer);
    let outcome = t.handle.closed().await;
    assert!(matches!(outcome, CloseOutcome::Clean(_)));
    assert!(t.handle.is_disconnected());
}

#[tokio::test]
async fn test_queue_refused_while_draining() {
    let mut t = start(SessionConfig::default()).await;
    t.peer.handshake().await;

    t.peer.send_goaway(0, 0).await;

    // The queue may race the GOAWAY: either it is refused outright, or
    // the opened stream (id > lastGood = 0) is torn down by the GOAWAY.
    let request = t.handle.queue(get("/late")).await.unwrap();
    let result = request.response().await;
    match result {
        Err(Error::Closed(_)) | Err(Error::Session { .. }) => {}
        other => panic!("expected refusal, got {:?}", other.map(|_| ())),
    }
    assert!(t.handle.is_closed());
}

#[tokio::test]
async fn test_transport_eof_fails_inflight_requests() {
    let mut t = start(SessionConfig::default()).await;
    t.peer.handshake().await;

    let request = t.handle.queue(get("/never")).await.unwrap();
    let _ = t.peer.read_syn_stream().await;

    drop(t.peer);

    assert!(matches!(request.response().await, Err(Error::Closed(_))));
    assert!(matches!(t.handle.closed().await, CloseOutcome::Failed(_)));
    assert!(t.handle.is_disconnected());
}

#[tokio::test]
async fn test_application_close_sends_goaway() {
    let mut t = start(SessionConfig::default()).await;
    t.peer.handshake().await;

    let request = t.handle.queue(get("/doomed")).await.unwrap();
    let _ = t.peer.read_syn_stream().await;

    t.handle.close(GoAwayStatus::Ok).await.unwrap();

    let goaway = t.peer.expect_control(helpers::mock_peer::GOAWAY).await;
    let (_, status) = helpers::mock_peer::goaway_fields(&goaway);
    assert_eq!(status, 0);

    assert!(matches!(
        request.response().await,
        Err(Error::Session { .. })
    ));
    assert!(matches!(t.handle.closed().await, CloseOutcome::Clean(_)));
}
