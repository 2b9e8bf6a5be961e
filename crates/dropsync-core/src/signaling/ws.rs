use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use dropsync_types::{RelayCommand, RelayEvent};

use super::{SignalingClient, SignalingEvent};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub(super) fn spawn(url: String) -> SignalingClient {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(url, cmd_rx, event_tx));
    SignalingClient::from_channels(cmd_tx, event_rx)
}

async fn run(
    url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<RelayCommand>,
    events: mpsc::UnboundedSender<SignalingEvent>,
) {
    let mut first = true;
    loop {
        let stream = match connect_async(url.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                warn!("signaling connect to {url} failed: {e}");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        debug!("signaling connected to {url}");
        if !first && events.send(SignalingEvent::Reconnected).is_err() {
            return;
        }
        first = false;

        let (mut sink, mut source) = stream.split();
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        // Engine dropped its handle; close politely and stop.
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    };
                    let text = serde_json::to_string(&cmd).unwrap();
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                msg = source.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<RelayEvent>(&text) {
                                Ok(event) => {
                                    if forward(&events, event).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => warn!("undecodable relay event: {e}"),
                            }
                        }
                        // Pings are answered by the WebSocket layer itself.
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("signaling socket error: {e}");
                            break;
                        }
                    }
                }
            }
        }
        warn!("signaling connection lost, reconnecting");
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

fn forward(
    events: &mpsc::UnboundedSender<SignalingEvent>,
    event: RelayEvent,
) -> Result<(), ()> {
    let mapped = match event {
        RelayEvent::Ready { peer_id } => SignalingEvent::Ready { local_id: peer_id },
        RelayEvent::PeerJoined { remote_id } => SignalingEvent::PeerJoined { remote_id },
        RelayEvent::PeerLeft { remote_id } => SignalingEvent::PeerLeft { remote_id },
        RelayEvent::Signal { from, signal } => SignalingEvent::Signal { from, signal },
    };
    events.send(mapped).map_err(|_| ())
}
