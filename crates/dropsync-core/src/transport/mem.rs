//! In-process peer transport.
//!
//! Endpoints register on a shared [`MemNetwork`]; session descriptions and
//! candidates carry endpoint addresses, and a connection goes live once a
//! remote description and a remote candidate have both been applied, the
//! same gating a trickled ICE negotiation exposes. Per-stream pump tasks
//! move frames between the two endpoints, maintain `buffered_amount` and
//! fire `BufferedAmountLow` on downward threshold crossings.
//!
//! `MemConfig` can emulate a slow path (drain rate) and slow channel
//! establishment (open delay) for flow-control and timeout tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dropsync_types::{
    ConnectionState, IceCandidate, IceServerConfig, SdpType, SessionDescription,
};

use crate::error::TransportError;
use crate::transport::{
    IceState, PathStats, SignalingState, StreamEvent, StreamHandle, StreamOp, StreamState,
    StreamWiring, Transport, TransportEvent, TransportFactory, new_stream,
};

const SDP_PREFIX: &str = "mem-endpoint:";
const CANDIDATE_PREFIX: &str = "mem:";

/// Messages exchanged between the two endpoints of one stream.
#[derive(Debug)]
enum PeerMsg {
    Message(crate::transport::StreamMessage),
    Close,
}

/// Messages exchanged between two transports on the network.
#[derive(Debug)]
enum MemWire {
    OpenStream {
        label: String,
        threshold: u64,
        tx_back: mpsc::UnboundedSender<PeerMsg>,
        rx_in: mpsc::UnboundedReceiver<PeerMsg>,
    },
    Shutdown,
}

/// Registry linking in-process endpoints.
#[derive(Clone, Default)]
pub struct MemNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Default)]
struct NetworkInner {
    next_id: u64,
    endpoints: HashMap<u64, mpsc::UnboundedSender<MemWire>>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, tx: mpsc::UnboundedSender<MemWire>) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.endpoints.insert(id, tx);
        id
    }

    fn unregister(&self, id: u64) {
        self.inner.lock().endpoints.remove(&id);
    }

    fn wire_to(&self, id: u64) -> Option<mpsc::UnboundedSender<MemWire>> {
        self.inner.lock().endpoints.get(&id).cloned()
    }
}

/// Behavior knobs for the emulated path.
#[derive(Clone)]
pub struct MemConfig {
    /// Bytes drained from a stream's send buffer per millisecond.
    /// `None` drains instantly.
    pub drain_bytes_per_ms: Option<u64>,
    /// Delay before a locally opened stream reports `Open`.
    pub open_delay: Duration,
    /// Round-trip time reported by `stats()`.
    pub rtt_ms: f64,
    /// Remote IP reported by `stats()`.
    pub remote_ip: Option<String>,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            drain_bytes_per_ms: None,
            open_delay: Duration::ZERO,
            rtt_ms: 0.3,
            remote_ip: Some("127.0.0.1".to_owned()),
        }
    }
}

pub struct MemTransportFactory {
    net: MemNetwork,
    config: MemConfig,
}

impl MemTransportFactory {
    pub fn new(net: MemNetwork) -> Self {
        Self {
            net,
            config: MemConfig::default(),
        }
    }

    pub fn with_config(net: MemNetwork, config: MemConfig) -> Self {
        Self { net, config }
    }
}

impl TransportFactory for MemTransportFactory {
    fn create(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> (Box<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>) {
        debug!(servers = ice_servers.len(), "mem transport ignores ICE servers");
        let (transport, events) = MemTransport::new(self.net.clone(), self.config.clone());
        (Box::new(transport), events)
    }
}

struct PendingOpen {
    label: String,
    threshold: u64,
    wiring: StreamWiring,
}

pub struct MemTransport {
    endpoint_id: u64,
    net: MemNetwork,
    config: MemConfig,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    token: CancellationToken,
    connection: Arc<Mutex<ConnectionState>>,
    signaling: SignalingState,
    remote: Option<u64>,
    remote_candidate: bool,
    peer_tx: Option<mpsc::UnboundedSender<MemWire>>,
    pending: Vec<PendingOpen>,
}

impl MemTransport {
    fn new(net: MemNetwork, config: MemConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();
        let endpoint_id = net.register(wire_tx);
        let token = CancellationToken::new();
        let connection = Arc::new(Mutex::new(ConnectionState::New));

        tokio::spawn(run_wire_task(
            wire_rx,
            events_tx.clone(),
            token.clone(),
            connection.clone(),
            config.clone(),
        ));

        let transport = Self {
            endpoint_id,
            net,
            config,
            events_tx,
            token,
            connection,
            signaling: SignalingState::Stable,
            remote: None,
            remote_candidate: false,
            peer_tx: None,
            pending: Vec::new(),
        };
        (transport, events_rx)
    }

    fn local_description(&self, kind: SdpType) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: format!("{SDP_PREFIX}{}", self.endpoint_id),
        }
    }

    fn emit_local_candidate(&self) {
        let _ = self
            .events_tx
            .send(TransportEvent::LocalCandidate(IceCandidate {
                candidate: format!("{CANDIDATE_PREFIX}{}", self.endpoint_id),
                sdp_mid: Some("0".to_owned()),
                sdp_m_line_index: Some(0),
            }));
    }

    fn parse_endpoint(sdp: &str) -> Result<u64, TransportError> {
        sdp.strip_prefix(SDP_PREFIX)
            .and_then(|rest| rest.parse().ok())
            .ok_or_else(|| TransportError::BadDescription(sdp.to_owned()))
    }

    fn set_connection(&self, state: ConnectionState) {
        {
            let mut conn = self.connection.lock();
            if *conn == state || conn.is_terminal() {
                return;
            }
            *conn = state;
        }
        let _ = self
            .events_tx
            .send(TransportEvent::ConnectionChanged(state));
    }

    fn try_connect(&mut self) {
        if self.peer_tx.is_some() || self.remote.is_none() || !self.remote_candidate {
            return;
        }
        let remote = self.remote.expect("remote checked above");
        let Some(peer) = self.net.wire_to(remote) else {
            warn!(remote, "remote endpoint is gone");
            return;
        };
        self.peer_tx = Some(peer.clone());
        self.set_connection(ConnectionState::Connecting);
        self.set_connection(ConnectionState::Connected);

        for open in self.pending.drain(..) {
            wire_stream(
                open.label,
                open.threshold,
                open.wiring,
                &peer,
                &self.config,
                &self.token,
            );
        }
    }
}

impl Transport for MemTransport {
    fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        if self.signaling != SignalingState::Stable {
            return Err(TransportError::InvalidState(self.signaling));
        }
        self.signaling = SignalingState::HaveLocalOffer;
        self.emit_local_candidate();
        Ok(self.local_description(SdpType::Offer))
    }

    fn set_remote_offer(&mut self, offer: &SessionDescription) -> Result<(), TransportError> {
        if self.signaling != SignalingState::Stable {
            return Err(TransportError::InvalidState(self.signaling));
        }
        if offer.kind != SdpType::Offer {
            return Err(TransportError::BadDescription(offer.sdp.clone()));
        }
        self.remote = Some(Self::parse_endpoint(&offer.sdp)?);
        self.signaling = SignalingState::HaveRemoteOffer;
        self.try_connect();
        Ok(())
    }

    fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        if self.signaling != SignalingState::HaveRemoteOffer {
            return Err(TransportError::InvalidState(self.signaling));
        }
        self.signaling = SignalingState::Stable;
        self.emit_local_candidate();
        Ok(self.local_description(SdpType::Answer))
    }

    fn set_remote_answer(&mut self, answer: &SessionDescription) -> Result<(), TransportError> {
        if self.signaling != SignalingState::HaveLocalOffer {
            return Err(TransportError::InvalidState(self.signaling));
        }
        if answer.kind != SdpType::Answer {
            return Err(TransportError::BadDescription(answer.sdp.clone()));
        }
        self.remote = Some(Self::parse_endpoint(&answer.sdp)?);
        self.signaling = SignalingState::Stable;
        self.try_connect();
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError> {
        if self.signaling == SignalingState::Closed {
            return Err(TransportError::Closed);
        }
        let id: u64 = candidate
            .candidate
            .strip_prefix(CANDIDATE_PREFIX)
            .and_then(|rest| rest.parse().ok())
            .ok_or_else(|| TransportError::BadDescription(candidate.candidate.clone()))?;
        if let Some(remote) = self.remote {
            if remote != id {
                return Err(TransportError::UnknownEndpoint(candidate.candidate.clone()));
            }
        }
        self.remote_candidate = true;
        self.try_connect();
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.signaling
    }

    fn connection_state(&self) -> ConnectionState {
        *self.connection.lock()
    }

    fn ice_state(&self) -> IceState {
        match self.connection_state() {
            ConnectionState::New => IceState::New,
            ConnectionState::Connecting => IceState::Checking,
            ConnectionState::Connected => IceState::Connected,
            ConnectionState::Disconnected => IceState::Disconnected,
            ConnectionState::Failed => IceState::Failed,
            ConnectionState::Closed => IceState::Closed,
        }
    }

    fn open_stream(
        &mut self,
        label: &str,
        buffered_amount_low_threshold: u64,
    ) -> Result<StreamHandle, TransportError> {
        if self.signaling == SignalingState::Closed {
            return Err(TransportError::Closed);
        }
        let (handle, wiring) = new_stream(label, buffered_amount_low_threshold);
        match &self.peer_tx {
            Some(peer) => wire_stream(
                label.to_owned(),
                buffered_amount_low_threshold,
                wiring,
                peer,
                &self.config,
                &self.token,
            ),
            None => self.pending.push(PendingOpen {
                label: label.to_owned(),
                threshold: buffered_amount_low_threshold,
                wiring,
            }),
        }
        Ok(handle)
    }

    fn stats(&self) -> Option<PathStats> {
        if self.connection_state() != ConnectionState::Connected {
            return None;
        }
        Some(PathStats {
            round_trip_ms: self.config.rtt_ms,
            remote_ip: self.config.remote_ip.clone(),
        })
    }

    fn close(&mut self) {
        if self.signaling == SignalingState::Closed {
            return;
        }
        self.signaling = SignalingState::Closed;
        self.net.unregister(self.endpoint_id);
        if let Some(peer) = self.peer_tx.take() {
            let _ = peer.send(MemWire::Shutdown);
        }
        self.set_connection(ConnectionState::Closed);
        self.token.cancel();
        self.pending.clear();
    }
}

impl Drop for MemTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cross the two per-direction channels and start the local pump.
fn wire_stream(
    label: String,
    threshold: u64,
    wiring: StreamWiring,
    peer: &mpsc::UnboundedSender<MemWire>,
    config: &MemConfig,
    token: &CancellationToken,
) {
    let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();
    let (to_local_tx, to_local_rx) = mpsc::unbounded_channel();
    let _ = peer.send(MemWire::OpenStream {
        label,
        threshold,
        tx_back: to_local_tx,
        rx_in: to_peer_rx,
    });
    spawn_pump(
        wiring,
        to_peer_tx,
        to_local_rx,
        config.clone(),
        token.clone(),
        config.open_delay,
    );
}

async fn run_wire_task(
    mut wire_rx: mpsc::UnboundedReceiver<MemWire>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    token: CancellationToken,
    connection: Arc<Mutex<ConnectionState>>,
    config: MemConfig,
) {
    loop {
        let wire = tokio::select! {
            _ = token.cancelled() => break,
            wire = wire_rx.recv() => wire,
        };
        match wire {
            Some(MemWire::OpenStream {
                label,
                threshold,
                tx_back,
                rx_in,
            }) => {
                // Incoming streams are open the moment the engine sees them;
                // the handler may send on the handle right away.
                let (handle, wiring) = new_stream(&label, threshold);
                wiring.shared.set_state(StreamState::Open);
                let _ = wiring.events_tx.send(StreamEvent::Open);
                spawn_pump(
                    wiring,
                    tx_back,
                    rx_in,
                    config.clone(),
                    token.clone(),
                    Duration::ZERO,
                );
                let _ = events_tx.send(TransportEvent::IncomingStream(handle));
            }
            Some(MemWire::Shutdown) => {
                let changed = {
                    let mut conn = connection.lock();
                    if conn.is_terminal() {
                        false
                    } else {
                        *conn = ConnectionState::Closed;
                        true
                    }
                };
                if changed {
                    let _ = events_tx.send(TransportEvent::ConnectionChanged(
                        ConnectionState::Closed,
                    ));
                }
                token.cancel();
                break;
            }
            None => break,
        }
    }
}

fn spawn_pump(
    wiring: StreamWiring,
    wire_tx: mpsc::UnboundedSender<PeerMsg>,
    mut wire_rx: mpsc::UnboundedReceiver<PeerMsg>,
    config: MemConfig,
    token: CancellationToken,
    open_delay: Duration,
) {
    let StreamWiring {
        shared,
        mut ops_rx,
        events_tx,
    } = wiring;

    tokio::spawn(async move {
        if !open_delay.is_zero() {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(open_delay) => {}
            }
        }
        if !token.is_cancelled() && shared.state() == StreamState::Connecting {
            shared.set_state(StreamState::Open);
            let _ = events_tx.send(StreamEvent::Open);
        }

        loop {
            // Biased so queued frames drain before a shutdown is honored;
            // auth-fail and cancel frames must reach the peer.
            tokio::select! {
                biased;
                op = ops_rx.recv() => match op {
                    Some(StreamOp::Message(msg)) => {
                        let len = msg.len() as u64;
                        if let Some(rate) = config.drain_bytes_per_ms {
                            let ms = len / rate.max(1);
                            if ms > 0 {
                                tokio::time::sleep(Duration::from_millis(ms)).await;
                            }
                        }
                        let delivered = wire_tx.send(PeerMsg::Message(msg)).is_ok();
                        let (before, after) = shared.sub_buffered(len);
                        if before > shared.threshold() && after <= shared.threshold() {
                            let _ = events_tx.send(StreamEvent::BufferedAmountLow);
                        }
                        if !delivered {
                            break;
                        }
                    }
                    Some(StreamOp::Close) | None => {
                        let _ = wire_tx.send(PeerMsg::Close);
                        break;
                    }
                },
                inbound = wire_rx.recv() => match inbound {
                    Some(PeerMsg::Message(msg)) => {
                        let _ = events_tx.send(StreamEvent::Message(msg));
                    }
                    Some(PeerMsg::Close) | None => break,
                },
                _ = token.cancelled() => break,
            }
        }

        shared.set_state(StreamState::Closed);
        let _ = events_tx.send(StreamEvent::Closed);
    });
}
