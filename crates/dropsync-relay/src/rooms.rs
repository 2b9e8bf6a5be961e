use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use dropsync_types::{RelayEvent, SignalPayload};

/// Room membership and per-peer delivery channels.
#[derive(Clone, Default)]
pub struct Rooms {
    inner: Arc<RwLock<RoomsInner>>,
}

#[derive(Default)]
struct RoomsInner {
    peers: HashMap<Uuid, mpsc::UnboundedSender<RelayEvent>>,
    rooms: HashMap<String, Vec<Uuid>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connected peer's delivery channel.
    pub async fn register(&self, peer_id: Uuid, tx: mpsc::UnboundedSender<RelayEvent>) {
        self.inner.write().await.peers.insert(peer_id, tx);
    }

    /// Drop a peer: remove it from every room, announcing `peer-left` to the
    /// rooms it was in.
    pub async fn unregister(&self, peer_id: Uuid) {
        let mut inner = self.inner.write().await;
        inner.peers.remove(&peer_id);
        let mut notify = Vec::new();
        for members in inner.rooms.values_mut() {
            if members.contains(&peer_id) {
                members.retain(|id| *id != peer_id);
                notify.extend(members.iter().copied());
            }
        }
        inner.rooms.retain(|_, members| !members.is_empty());
        for other in notify {
            if let Some(tx) = inner.peers.get(&other) {
                let _ = tx.send(RelayEvent::PeerLeft { remote_id: peer_id });
            }
        }
    }

    /// Add a peer to a room; existing members hear `peer-joined`.
    pub async fn join(&self, room_id: &str, peer_id: Uuid) {
        let mut inner = self.inner.write().await;
        let members = inner.rooms.entry(room_id.to_owned()).or_default();
        if !members.contains(&peer_id) {
            members.push(peer_id);
        }
        let others: Vec<Uuid> = members
            .iter()
            .copied()
            .filter(|id| *id != peer_id)
            .collect();
        for other in others {
            if let Some(tx) = inner.peers.get(&other) {
                let _ = tx.send(RelayEvent::PeerJoined { remote_id: peer_id });
            }
        }
    }

    /// Remove a peer from a room; remaining members hear `peer-left`.
    pub async fn leave(&self, room_id: &str, peer_id: Uuid) {
        let mut inner = self.inner.write().await;
        let Some(members) = inner.rooms.get_mut(room_id) else {
            return;
        };
        members.retain(|id| *id != peer_id);
        let remaining = members.clone();
        if remaining.is_empty() {
            inner.rooms.remove(room_id);
        }
        for other in remaining {
            if let Some(tx) = inner.peers.get(&other) {
                let _ = tx.send(RelayEvent::PeerLeft { remote_id: peer_id });
            }
        }
    }

    /// Forward a signal envelope, stamping the authoritative sender id.
    pub async fn forward(&self, from: Uuid, to: Uuid, signal: SignalPayload) {
        let inner = self.inner.read().await;
        match inner.peers.get(&to) {
            Some(tx) => {
                let _ = tx.send(RelayEvent::Signal { from, signal });
            }
            None => debug!(%to, "dropping signal to unknown peer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_notifies_only_existing_members() {
        let rooms = Rooms::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        rooms.register(a, a_tx).await;
        rooms.register(b, b_tx).await;

        rooms.join("r", a).await;
        rooms.join("r", b).await;

        match a_rx.recv().await.unwrap() {
            RelayEvent::PeerJoined { remote_id } => assert_eq!(remote_id, b),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_announces_to_shared_rooms() {
        let rooms = Rooms::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        rooms.register(a, a_tx).await;
        rooms.register(b, b_tx).await;
        rooms.join("r", a).await;
        rooms.join("r", b).await;
        let _ = a_rx.recv().await; // peer-joined

        rooms.unregister(b).await;
        match a_rx.recv().await.unwrap() {
            RelayEvent::PeerLeft { remote_id } => assert_eq!(remote_id, b),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
