//! Thin client over the room-scoped signaling carrier.
//!
//! The engine talks to a channel pair: [`RelayCommand`]s out,
//! [`SignalingEvent`]s in. [`SignalingClient::connect`] drives a live
//! WebSocket to the relay; [`memory::MemoryRelay`] provides the same
//! semantics in-process for tests and single-process setups.

pub mod memory;
mod ws;

use tokio::sync::mpsc;
use uuid::Uuid;

use dropsync_types::{RelayCommand, SignalPayload};

/// Carrier events as the engine consumes them.
#[derive(Debug)]
pub enum SignalingEvent {
    /// The carrier assigned this endpoint its id.
    Ready { local_id: Uuid },
    PeerJoined { remote_id: Uuid },
    PeerLeft { remote_id: Uuid },
    Signal { from: Uuid, signal: SignalPayload },
    /// The underlying carrier re-established itself; the engine must
    /// re-join the room.
    Reconnected,
}

pub struct SignalingClient {
    commands: mpsc::UnboundedSender<RelayCommand>,
    events: mpsc::UnboundedReceiver<SignalingEvent>,
}

impl SignalingClient {
    /// Connect to a relay over WebSocket. Reconnects with backoff forever;
    /// each re-establishment emits [`SignalingEvent::Reconnected`].
    pub fn connect(url: impl Into<String>) -> Self {
        ws::spawn(url.into())
    }

    pub(crate) fn from_channels(
        commands: mpsc::UnboundedSender<RelayCommand>,
        events: mpsc::UnboundedReceiver<SignalingEvent>,
    ) -> Self {
        Self { commands, events }
    }

    pub fn join(&self, room_id: &str) {
        let _ = self.commands.send(RelayCommand::JoinRoom {
            room_id: room_id.to_owned(),
        });
    }

    pub fn leave(&self, room_id: &str) {
        let _ = self.commands.send(RelayCommand::LeaveRoom {
            room_id: room_id.to_owned(),
        });
    }

    pub fn signal(&self, to: Uuid, from: Uuid, signal: SignalPayload) {
        let _ = self.commands.send(RelayCommand::Signal { to, from, signal });
    }

    /// Next carrier event; `None` when the carrier task has ended.
    pub async fn recv(&mut self) -> Option<SignalingEvent> {
        self.events.recv().await
    }
}
