//! The WebSocket signaling client must survive a carrier drop: reconnect on
//! its own, surface `Reconnected`, and pick up the fresh server-assigned id.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use dropsync_core::signaling::{SignalingClient, SignalingEvent};
use dropsync_types::RelayEvent;

async fn expect_ready(client: &mut SignalingClient) -> Uuid {
    loop {
        match client.recv().await.expect("carrier alive") {
            SignalingEvent::Ready { local_id } => return local_id,
            SignalingEvent::Reconnected => {}
            other => panic!("expected ready, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn reconnects_after_carrier_drop() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // A bare-bones carrier: greets with `ready`, hard-drops the first
    // connection, keeps later ones alive.
    tokio::spawn(async move {
        let mut first = true;
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let mut ws = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(_) => continue,
            };
            let ready = RelayEvent::Ready {
                peer_id: Uuid::new_v4(),
            };
            let text = serde_json::to_string(&ready).unwrap();
            if ws.send(Message::Text(text.into())).await.is_err() {
                continue;
            }
            if first {
                first = false;
                drop(ws);
            } else {
                tokio::spawn(async move { while ws.next().await.is_some() {} });
            }
        }
    });

    let mut client = SignalingClient::connect(format!("ws://{addr}/ws"));
    let first_id = expect_ready(&mut client).await;

    // The dropped socket must surface as a reconnect, not an end.
    loop {
        match client.recv().await.expect("carrier alive") {
            SignalingEvent::Reconnected => break,
            other => panic!("expected reconnected, got {other:?}"),
        }
    }

    let second_id = expect_ready(&mut client).await;
    assert_ne!(first_id, second_id, "a fresh connection gets a fresh id");

    // Commands queued across the gap still go out (no panic, no loss).
    client.join("room123");
}
