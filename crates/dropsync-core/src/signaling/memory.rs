//! In-process signaling bus with relay semantics: server-assigned ids,
//! room membership announcements, envelope-only forwarding.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use dropsync_types::RelayCommand;

use super::{SignalingClient, SignalingEvent};

#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<RelayInner>>,
}

#[derive(Default)]
struct RelayInner {
    peers: HashMap<Uuid, mpsc::UnboundedSender<SignalingEvent>>,
    rooms: HashMap<String, Vec<Uuid>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint. The client immediately receives `Ready` with
    /// its assigned id.
    pub fn connect(&self) -> SignalingClient {
        let peer_id = Uuid::new_v4();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();

        self.inner.lock().peers.insert(peer_id, event_tx.clone());
        let _ = event_tx.send(SignalingEvent::Ready { local_id: peer_id });

        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                relay.handle(peer_id, cmd);
            }
            relay.disconnect(peer_id);
        });

        SignalingClient::from_channels(cmd_tx, event_rx)
    }

    fn handle(&self, from: Uuid, cmd: RelayCommand) {
        let mut inner = self.inner.lock();
        match cmd {
            RelayCommand::JoinRoom { room_id } => {
                let members = inner.rooms.entry(room_id).or_default();
                if !members.contains(&from) {
                    members.push(from);
                }
                let others: Vec<Uuid> =
                    members.iter().copied().filter(|id| *id != from).collect();
                for other in others {
                    if let Some(tx) = inner.peers.get(&other) {
                        let _ = tx.send(SignalingEvent::PeerJoined { remote_id: from });
                    }
                }
            }
            RelayCommand::LeaveRoom { room_id } => {
                if let Some(members) = inner.rooms.get_mut(&room_id) {
                    members.retain(|id| *id != from);
                    let remaining = members.clone();
                    for other in remaining {
                        if let Some(tx) = inner.peers.get(&other) {
                            let _ = tx.send(SignalingEvent::PeerLeft { remote_id: from });
                        }
                    }
                }
            }
            RelayCommand::Signal { to, signal, .. } => match inner.peers.get(&to) {
                Some(tx) => {
                    let _ = tx.send(SignalingEvent::Signal { from, signal });
                }
                None => debug!(%to, "dropping signal to unknown peer"),
            },
        }
    }

    fn disconnect(&self, peer_id: Uuid) {
        let mut inner = self.inner.lock();
        inner.peers.remove(&peer_id);
        let mut notify: Vec<Uuid> = Vec::new();
        for members in inner.rooms.values_mut() {
            if members.contains(&peer_id) {
                members.retain(|id| *id != peer_id);
                notify.extend(members.iter().copied());
            }
        }
        for other in notify {
            if let Some(tx) = inner.peers.get(&other) {
                let _ = tx.send(SignalingEvent::PeerLeft { remote_id: peer_id });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dropsync_types::{SignalPayload, SdpType, SessionDescription};

    async fn ready_id(client: &mut SignalingClient) -> Uuid {
        match client.recv().await.unwrap() {
            SignalingEvent::Ready { local_id } => local_id,
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_announces_to_existing_members() {
        let relay = MemoryRelay::new();
        let mut a = relay.connect();
        let mut b = relay.connect();
        let a_id = ready_id(&mut a).await;
        let b_id = ready_id(&mut b).await;

        a.join("room1");
        b.join("room1");

        match a.recv().await.unwrap() {
            SignalingEvent::PeerJoined { remote_id } => assert_eq!(remote_id, b_id),
            other => panic!("expected peer-joined, got {other:?}"),
        }

        // The joiner hears nothing about itself; a signal flows through.
        b.signal(
            a_id,
            b_id,
            SignalPayload::Offer {
                offer: SessionDescription {
                    kind: SdpType::Offer,
                    sdp: "mem-endpoint:1".into(),
                },
            },
        );
        match a.recv().await.unwrap() {
            SignalingEvent::Signal { from, .. } => assert_eq!(from, b_id),
            other => panic!("expected signal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn leave_announces_peer_left() {
        let relay = MemoryRelay::new();
        let mut a = relay.connect();
        let mut b = relay.connect();
        let _a_id = ready_id(&mut a).await;
        let b_id = ready_id(&mut b).await;

        a.join("r");
        b.join("r");
        let _ = a.recv().await; // peer-joined

        b.leave("r");
        match a.recv().await.unwrap() {
            SignalingEvent::PeerLeft { remote_id } => assert_eq!(remote_id, b_id),
            other => panic!("expected peer-left, got {other:?}"),
        }
    }
}
