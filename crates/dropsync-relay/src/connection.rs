use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use dropsync_types::{RelayCommand, RelayEvent};

use crate::rooms::Rooms;

/// Keepalive cadence; defeats 60-second idle timeouts in intermediaries.
const PING_INTERVAL: Duration = Duration::from_secs(10);

/// A connection missing a pong this long past the ping is considered dead.
const PONG_DEADLINE: Duration = Duration::from_secs(5);

/// Handle one endpoint's WebSocket for its whole lifetime.
pub async fn handle_socket(socket: WebSocket, rooms: Rooms) {
    let peer_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    // Step 1: assign the endpoint its id.
    let ready = RelayEvent::Ready { peer_id };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    // Step 2: register the delivery channel.
    let (tx, mut rx) = mpsc::unbounded_channel();
    rooms.register(peer_id, tx).await;
    info!(%peer_id, "endpoint connected");

    let started = Instant::now();
    let last_pong = Arc::new(AtomicU64::new(0));

    // Forward queued events to the socket, pinging on a fixed cadence.
    let pong_seen = last_pong.clone();
    let mut send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    let deadline = PING_INTERVAL + PONG_DEADLINE;
                    let silent = started
                        .elapsed()
                        .saturating_sub(Duration::from_millis(pong_seen.load(Ordering::Relaxed)));
                    if silent > deadline {
                        warn!("peer missed its pong deadline, dropping");
                        break;
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the endpoint.
    let rooms_recv = rooms.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<RelayCommand>(&text) {
                    Ok(cmd) => handle_command(&rooms_recv, peer_id, cmd).await,
                    Err(e) => warn!(%peer_id, "undecodable command: {e}"),
                },
                Message::Pong(_) => {
                    last_pong.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    rooms.unregister(peer_id).await;
    info!(%peer_id, "endpoint disconnected");
}

async fn handle_command(rooms: &Rooms, peer_id: Uuid, cmd: RelayCommand) {
    match cmd {
        RelayCommand::JoinRoom { room_id } => {
            debug!(%peer_id, room_id, "join");
            rooms.join(&room_id, peer_id).await;
        }
        RelayCommand::LeaveRoom { room_id } => {
            debug!(%peer_id, room_id, "leave");
            rooms.leave(&room_id, peer_id).await;
        }
        // The envelope's `from` is replaced with the connection's own id.
        RelayCommand::Signal { to, signal, .. } => {
            rooms.forward(peer_id, to, signal).await;
        }
    }
}
