//! Backplane websocket tests against a bare tungstenite server.
//!
//! Run with: `cargo test -p podium-backplane --test integration`

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use podium_backplane::{BackplaneOptions, RealtimeBackplane, SocketState, TransportKind};
use podium_core::protocol::{
    Role, SessionSyncStatePayload, SourceId, create_state_update_envelope, validate_text,
};

fn update(seq: u64) -> podium_core::protocol::SessionSyncEnvelope {
    create_state_update_envelope(
        &SourceId::new("host-1").unwrap(),
        Role::Host,
        seq,
        1_000.0 + seq as f64,
        SessionSyncStatePayload {
            global_step: seq,
            ..Default::default()
        },
    )
}

fn backplane_for(endpoint: String) -> RealtimeBackplane {
    RealtimeBackplane::new(BackplaneOptions {
        endpoint: Some(endpoint),
        ..Default::default()
    })
}

async fn wait_for_socket(backplane: &RealtimeBackplane, wanted: SocketState) {
    for _ in 0..100 {
        if backplane.socket_state() == Some(wanted) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("socket never reached {wanted:?}, still {:?}", backplane.socket_state());
}

#[tokio::test]
async fn test_outbox_flushes_in_order_on_open() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let mut seqs = Vec::new();
        while seqs.len() < 3 {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let env = validate_text(text.as_str()).unwrap();
                    seqs.push(env.as_state_update().unwrap().seq());
                }
                Some(Ok(_)) => {}
                _ => break,
            }
        }
        seqs
    });

    let backplane = backplane_for(format!("ws://127.0.0.1:{port}/ws/room"));
    assert_eq!(backplane.connect(), TransportKind::Websocket);
    assert_eq!(backplane.socket_state(), Some(SocketState::Connecting));

    // Nothing has yielded yet, so the socket cannot be open.
    assert!(backplane.publish(&update(1)));
    assert!(backplane.publish(&update(2)));
    assert!(backplane.publish(&update(3)));
    assert_eq!(backplane.outbox_len(), 3);

    let seqs = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server timed out")
        .unwrap();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(backplane.outbox_len(), 0);
    assert_eq!(backplane.socket_state(), Some(SocketState::Open));

    backplane.close();
}

#[tokio::test]
async fn test_inbound_frames_are_validated() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(Message::Text("not json at all".into())).await.unwrap();
        let wrong_protocol = json!({ "protocol": "v0", "kind": "state-update" }).to_string();
        ws.send(Message::Text(wrong_protocol.into())).await.unwrap();
        ws.send(Message::Text(update(7).to_json().unwrap().into()))
            .await
            .unwrap();
        // Keep the socket open until the client goes away.
        while let Some(Ok(_)) = ws.next().await {}
    });

    let backplane = backplane_for(format!("ws://127.0.0.1:{port}/ws/room"));
    let mut sub = backplane.subscribe();
    backplane.connect();

    let received = tokio::time::timeout(Duration::from_secs(5), sub.receiver.recv())
        .await
        .expect("timed out")
        .expect("subscription closed");
    assert_eq!(received, update(7));
    assert!(sub.receiver.try_recv().is_err());

    backplane.close();
}

#[tokio::test]
async fn test_failed_connect_drops_queue_and_publishes() {
    // Grab a free port and release it so nothing is listening.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let backplane = backplane_for(format!("ws://127.0.0.1:{port}/ws/room"));
    assert_eq!(backplane.connect(), TransportKind::Websocket);
    assert!(backplane.publish(&update(1)));

    wait_for_socket(&backplane, SocketState::Closed).await;
    assert_eq!(backplane.outbox_len(), 0);
    assert!(!backplane.publish(&update(2)));
    assert_eq!(backplane.transport(), TransportKind::Websocket);

    backplane.close();
    backplane.close();
    assert_eq!(backplane.transport(), TransportKind::None);
}

#[tokio::test]
async fn test_close_while_connecting_discards_outbox() {
    // Accepts TCP but never completes the websocket handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let backplane = backplane_for(format!("ws://127.0.0.1:{port}/ws/room"));
    backplane.connect();
    assert!(backplane.publish(&update(1)));
    assert_eq!(backplane.outbox_len(), 1);

    backplane.close();
    assert_eq!(backplane.outbox_len(), 0);
    assert_eq!(backplane.socket_state(), None);
    assert!(!backplane.publish(&update(2)));
    drop(listener);
}
