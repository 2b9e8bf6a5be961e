/// DropSync connection engine.
///
/// The per-endpoint core of a serverless two-party file-transfer and chat
/// session:
/// - signaling through a room-scoped relay carrier,
/// - password-authenticated admission (HMAC challenge-response),
/// - a multiplexed transport with one control stream plus per-file
///   substreams,
/// - streaming transfers with chunk encryption, backpressure, progress,
///   cancellation and recipient accept/decline,
/// - a lifecycle state machine that survives transient disconnects and
///   peer churn.

pub mod auth;
mod control;
pub mod engine;
pub mod error;
mod receiver;
mod sender;
pub mod signaling;
pub mod sink;
pub mod source;
pub mod transport;

pub use engine::{
    EngineConfig, EngineEvent, EngineHandle, SessionEngine, SessionSnapshot, StreamSnapshot,
};
pub use error::{EngineError, TransportError};
pub use signaling::{SignalingClient, SignalingEvent};
pub use sink::{DirectorySink, MemorySink, OutputSink};
pub use source::FileSource;

/// Fixed transfer chunk size on the wire.
pub const CHUNK_SIZE: usize = sender::CHUNK_SIZE;

// The shared wire types are part of this crate's API surface.
pub use dropsync_types as types;
