use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::signal::SignalPayload;

/// Commands sent FROM an endpoint TO the relay over its WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum RelayCommand {
    /// Join a named room. Other members are notified with `peer-joined`.
    JoinRoom { room_id: String },

    /// Leave a named room. Remaining members are notified with `peer-left`.
    LeaveRoom { room_id: String },

    /// Relay an opaque signal to a specific peer. The relay stamps `from`
    /// with the sender's own id before forwarding, so it cannot be spoofed.
    Signal {
        to: Uuid,
        from: Uuid,
        signal: SignalPayload,
    },
}

/// Events sent FROM the relay TO an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum RelayEvent {
    /// Sent once on connect; carries the server-assigned endpoint id.
    Ready { peer_id: Uuid },

    /// Another endpoint joined a room this endpoint is in.
    PeerJoined { remote_id: Uuid },

    /// An endpoint left a room this endpoint is in, or disconnected.
    PeerLeft { remote_id: Uuid },

    /// A signal forwarded unchanged from another endpoint.
    Signal { from: Uuid, signal: SignalPayload },
}
