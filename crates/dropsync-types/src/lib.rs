/// DropSync shared types.
///
/// Everything that crosses a process or channel boundary lives here: the
/// relay envelope, the WebRTC-style signal payloads, the in-channel control
/// and file frames, and the session-facing models (transfers, chat, peer
/// state).

pub mod frames;
pub mod models;
pub mod relay;
pub mod room;
pub mod signal;

pub use frames::{ControlFrame, FileFrame};
pub use models::{
    AuthFailure, AuthState, ChatMessage, ChatOrigin, ConnectionState, FileTransfer, PeerInfo,
    PendingFile, TransferDirection, TransferErrorKind, TransferStatus,
};
pub use relay::{RelayCommand, RelayEvent};
pub use room::generate_room_id;
pub use signal::{IceCandidate, IceServerConfig, SdpType, SessionDescription, SignalPayload};
