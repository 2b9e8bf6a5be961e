//! The peer-transport seam.
//!
//! The engine negotiates and multiplexes over these traits; the bundled
//! [`mem`] implementation provides full data-channel semantics in-process.
//! A production ICE binding implements the same seam and changes no other
//! contract.

pub mod mem;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use dropsync_types::{ConnectionState, IceCandidate, IceServerConfig, SessionDescription};

use crate::error::TransportError;

/// Label of the reliable ordered control stream.
pub const CONTROL_STREAM_LABEL: &str = "signaling";

/// Label prefix of per-file substreams.
pub const FILE_STREAM_PREFIX: &str = "file-";

/// High-water mark and buffered-amount-low threshold for file substreams.
pub const FILE_STREAM_THRESHOLD: u64 = 64 * 1024;

pub fn file_stream_label(id: Uuid) -> String {
    format!("{FILE_STREAM_PREFIX}{id}")
}

pub fn parse_file_stream_label(label: &str) -> Option<Uuid> {
    label
        .strip_prefix(FILE_STREAM_PREFIX)
        .and_then(|rest| Uuid::parse_str(rest).ok())
}

/// Negotiation state of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Candidate-path state, reported in the inspect snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Ready state of one substream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Round-trip and path information for the nominated candidate pair.
#[derive(Debug, Clone)]
pub struct PathStats {
    pub round_trip_ms: f64,
    pub remote_ip: Option<String>,
}

/// Events from the transport to the engine.
#[derive(Debug)]
pub enum TransportEvent {
    /// A trickled local candidate to forward over signaling.
    LocalCandidate(IceCandidate),
    ConnectionChanged(ConnectionState),
    /// The remote side opened a substream towards us.
    IncomingStream(StreamHandle),
}

#[derive(Debug, Clone)]
pub enum StreamMessage {
    Text(String),
    Binary(Bytes),
}

impl StreamMessage {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Events delivered to the owner of one substream, in order.
#[derive(Debug)]
pub enum StreamEvent {
    Open,
    Message(StreamMessage),
    /// `buffered_amount` crossed the threshold from above.
    BufferedAmountLow,
    Closed,
}

/// The peer-transport object consumed by the engine.
///
/// Implementations deliver [`TransportEvent`]s on the channel returned by
/// the factory. All methods are non-blocking; negotiation round trips happen
/// through signaling, not here.
pub trait Transport: Send {
    fn create_offer(&mut self) -> Result<SessionDescription, TransportError>;
    fn set_remote_offer(&mut self, offer: &SessionDescription) -> Result<(), TransportError>;
    fn create_answer(&mut self) -> Result<SessionDescription, TransportError>;
    fn set_remote_answer(&mut self, answer: &SessionDescription) -> Result<(), TransportError>;
    fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError>;

    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> ConnectionState;
    fn ice_state(&self) -> IceState;

    /// Open a substream with the given label and buffered-amount-low
    /// threshold. Allowed before the transport is connected; the stream
    /// opens once the connection is live.
    fn open_stream(
        &mut self,
        label: &str,
        buffered_amount_low_threshold: u64,
    ) -> Result<StreamHandle, TransportError>;

    /// Stats of the nominated candidate pair, if connected.
    fn stats(&self) -> Option<PathStats>;

    /// Close the transport and every substream. Idempotent.
    fn close(&mut self);
}

pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> (Box<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>);
}

// ── Substream plumbing ─────────────────────────────────────────────────

const STATE_CONNECTING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

#[derive(Debug)]
pub(crate) struct StreamShared {
    state: AtomicU8,
    buffered: AtomicU64,
    threshold: u64,
}

impl StreamShared {
    pub(crate) fn state(&self) -> StreamState {
        match self.state.load(Ordering::Acquire) {
            STATE_CONNECTING => StreamState::Connecting,
            STATE_OPEN => StreamState::Open,
            STATE_CLOSING => StreamState::Closing,
            _ => StreamState::Closed,
        }
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        let v = match state {
            StreamState::Connecting => STATE_CONNECTING,
            StreamState::Open => STATE_OPEN,
            StreamState::Closing => STATE_CLOSING,
            StreamState::Closed => STATE_CLOSED,
        };
        self.state.store(v, Ordering::Release);
    }

    pub(crate) fn add_buffered(&self, n: u64) {
        self.buffered.fetch_add(n, Ordering::AcqRel);
    }

    /// Returns (before, after).
    pub(crate) fn sub_buffered(&self, n: u64) -> (u64, u64) {
        let before = self.buffered.fetch_sub(n, Ordering::AcqRel);
        (before, before.saturating_sub(n))
    }

    pub(crate) fn buffered(&self) -> u64 {
        self.buffered.load(Ordering::Acquire)
    }

    pub(crate) fn threshold(&self) -> u64 {
        self.threshold
    }
}

#[derive(Debug)]
pub(crate) enum StreamOp {
    Message(StreamMessage),
    Close,
}

/// Cloneable sending half of a substream.
#[derive(Debug, Clone)]
pub struct StreamSender {
    label: Arc<str>,
    shared: Arc<StreamShared>,
    ops: mpsc::UnboundedSender<StreamOp>,
}

impl StreamSender {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub fn buffered_amount(&self) -> u64 {
        self.shared.buffered()
    }

    pub fn buffered_amount_low_threshold(&self) -> u64 {
        self.shared.threshold()
    }

    /// Queue a message. Fails unless the stream is open.
    pub fn send(&self, message: StreamMessage) -> Result<(), TransportError> {
        if self.state() != StreamState::Open {
            return Err(TransportError::StreamNotOpen);
        }
        self.shared.add_buffered(message.len() as u64);
        self.ops
            .send(StreamOp::Message(message))
            .map_err(|_| TransportError::StreamNotOpen)
    }

    /// Close the substream. Idempotent.
    pub fn close(&self) {
        if matches!(self.state(), StreamState::Closing | StreamState::Closed) {
            return;
        }
        self.shared.set_state(StreamState::Closing);
        let _ = self.ops.send(StreamOp::Close);
    }
}

/// One substream: the sending half plus its ordered event receiver.
#[derive(Debug)]
pub struct StreamHandle {
    sender: StreamSender,
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl StreamHandle {
    pub fn label(&self) -> &str {
        self.sender.label()
    }

    pub fn sender(&self) -> StreamSender {
        self.sender.clone()
    }

    pub fn split(self) -> (StreamSender, mpsc::UnboundedReceiver<StreamEvent>) {
        (self.sender, self.events)
    }
}

/// Internals handed to a transport implementation when a stream is created.
pub(crate) struct StreamWiring {
    pub shared: Arc<StreamShared>,
    pub ops_rx: mpsc::UnboundedReceiver<StreamOp>,
    pub events_tx: mpsc::UnboundedSender<StreamEvent>,
}

pub(crate) fn new_stream(label: &str, threshold: u64) -> (StreamHandle, StreamWiring) {
    let shared = Arc::new(StreamShared {
        state: AtomicU8::new(STATE_CONNECTING),
        buffered: AtomicU64::new(0),
        threshold,
    });
    let (ops_tx, ops_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let handle = StreamHandle {
        sender: StreamSender {
            label: Arc::from(label),
            shared: shared.clone(),
            ops: ops_tx,
        },
        events: events_rx,
    };
    (
        handle,
        StreamWiring {
            shared,
            ops_rx,
            events_tx,
        },
    )
}
