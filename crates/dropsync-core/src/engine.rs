//! The per-endpoint session engine.
//!
//! One actor task owns the transport session and all collections; per-file
//! pipelines run as independent tasks and report back by id, so substreams
//! never retain the engine. The embedder drives the engine through a
//! cloneable [`EngineHandle`] and consumes [`EngineEvent`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use dropsync_types::{
    AuthState, ChatMessage, ChatOrigin, ConnectionState, ControlFrame, FileTransfer,
    IceServerConfig, PendingFile, SignalPayload, TransferDirection, TransferErrorKind,
    TransferStatus,
};

use crate::auth::{AuthHandshake, AuthOutcome};
use crate::control::{parse_control, send_control};
use crate::error::EngineError;
use crate::receiver::{self, ReceiverTask};
use crate::sender::{self, SenderTask};
use crate::signaling::{SignalingClient, SignalingEvent};
use crate::sink::OutputSink;
use crate::source::FileSource;
use crate::transport::{
    CONTROL_STREAM_LABEL, FILE_STREAM_THRESHOLD, IceState, SignalingState, StreamEvent,
    StreamHandle, StreamMessage, StreamSender, StreamState, Transport, TransportEvent,
    TransportFactory, file_stream_label, parse_file_stream_label,
};

const STATS_INTERVAL: Duration = Duration::from_secs(2);

/// How long rejection frames get to flush before the transport is torn down.
const TEARDOWN_FLUSH_DELAY: Duration = Duration::from_millis(100);

/// The current password, read fresh at every use by long-lived pipelines.
pub(crate) type PasswordCell = Arc<RwLock<Option<String>>>;

pub struct EngineConfig {
    pub room_id: String,
    pub password: Option<String>,
    pub ice_servers: Vec<IceServerConfig>,
}

/// Events fanned out to the embedder.
#[derive(Debug)]
pub enum EngineEvent {
    /// The signaling carrier assigned this endpoint its id.
    Ready { local_id: Uuid },
    PeerJoined { remote_id: Uuid },
    PeerLeft { remote_id: Uuid },
    ConnectionChanged { state: ConnectionState },
    PeerStats {
        latency_ms: Option<f64>,
        remote_ip: Option<String>,
    },
    AuthChanged { state: AuthState },
    AuthFailed { reason: dropsync_types::AuthFailure },
    TransferUpdated { transfer: FileTransfer },
    /// A fully received file awaits accept or decline.
    FilePending { id: Uuid, name: String, size: u64 },
    /// An accepted file was handed to the output sink.
    FileDelivered { id: Uuid, name: String },
    ChatSent { message: ChatMessage },
    ChatReceived { message: ChatMessage },
    LeftRoom,
}

/// Structured state snapshot for diagnostics.
#[derive(Debug)]
pub struct SessionSnapshot {
    pub connection: Option<ConnectionState>,
    pub signaling: Option<SignalingState>,
    pub ice: Option<IceState>,
    pub auth: AuthState,
    pub streams: Vec<StreamSnapshot>,
}

#[derive(Debug)]
pub struct StreamSnapshot {
    pub label: String,
    pub ready_state: StreamState,
    pub buffered_amount: u64,
    pub threshold: u64,
}

/// Status and payload messages from the per-file tasks, keyed by id.
#[derive(Debug)]
pub(crate) enum EngineMsg {
    Progress {
        id: Uuid,
        progress: u8,
    },
    Status {
        id: Uuid,
        status: TransferStatus,
        error: Option<TransferErrorKind>,
    },
    /// The receiver saw `file-start`.
    Incoming {
        id: Uuid,
        name: String,
        size: u64,
    },
    /// The receiver assembled the full payload.
    Pending {
        id: Uuid,
        name: String,
        size: u64,
        payload: bytes::Bytes,
    },
    /// Deferred teardown after rejection frames have flushed.
    ClearPeer,
}

enum Command {
    SendFile {
        id: Uuid,
        name: String,
        source: FileSource,
    },
    SendChat {
        text: String,
    },
    CancelTransfer {
        id: Uuid,
    },
    AcceptFile {
        id: Uuid,
    },
    DeclineFile {
        id: Uuid,
    },
    RetryTransfer {
        id: Uuid,
    },
    SetPassword {
        password: Option<String>,
    },
    Inspect {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Leave,
}

/// Cloneable driver for a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    fn send(&self, cmd: Command) -> Result<(), EngineError> {
        self.commands.send(cmd).map_err(|_| EngineError::Closed)
    }

    /// Queue a file for sending. Returns the transfer id; status flows
    /// through [`EngineEvent::TransferUpdated`].
    pub fn send_file(
        &self,
        name: impl Into<String>,
        source: FileSource,
    ) -> Result<Uuid, EngineError> {
        let id = Uuid::new_v4();
        self.send(Command::SendFile {
            id,
            name: name.into(),
            source,
        })?;
        Ok(id)
    }

    pub fn send_chat(&self, text: impl Into<String>) -> Result<(), EngineError> {
        self.send(Command::SendChat { text: text.into() })
    }

    /// Idempotent; cancelling a finished transfer is a no-op.
    pub fn cancel_transfer(&self, id: Uuid) -> Result<(), EngineError> {
        self.send(Command::CancelTransfer { id })
    }

    pub fn accept_file(&self, id: Uuid) -> Result<(), EngineError> {
        self.send(Command::AcceptFile { id })
    }

    pub fn decline_file(&self, id: Uuid) -> Result<(), EngineError> {
        self.send(Command::DeclineFile { id })
    }

    pub fn retry_transfer(&self, id: Uuid) -> Result<(), EngineError> {
        self.send(Command::RetryTransfer { id })
    }

    pub fn set_password(&self, password: Option<String>) -> Result<(), EngineError> {
        self.send(Command::SetPassword { password })
    }

    pub async fn inspect(&self) -> Result<SessionSnapshot, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Inspect { reply })?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    pub fn leave(&self) -> Result<(), EngineError> {
        self.send(Command::Leave)
    }
}

pub struct SessionEngine;

impl SessionEngine {
    /// Spawn the engine actor. It joins the room immediately.
    pub fn start(
        config: EngineConfig,
        signaling: SignalingClient,
        transports: Arc<dyn TransportFactory>,
        sink: Box<dyn OutputSink>,
    ) -> (EngineHandle, mpsc::UnboundedReceiver<EngineEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (msgs_tx, msgs_rx) = mpsc::unbounded_channel();

        let engine = Engine {
            room_id: config.room_id,
            ice_servers: config.ice_servers,
            local_id: None,
            password: Arc::new(RwLock::new(config.password)),
            signaling,
            transports,
            sink,
            events_tx: event_tx,
            commands: cmd_rx,
            msgs_tx,
            msgs: msgs_rx,
            session: None,
            control_rx: None,
            auth: AuthHandshake::new(),
            transfers: HashMap::new(),
            incoming_tokens: HashMap::new(),
            pending: HashMap::new(),
            chat: Vec::new(),
        };
        tokio::spawn(engine.run());

        (EngineHandle { commands: cmd_tx }, event_rx)
    }
}

struct TransferEntry {
    record: FileTransfer,
    cancel: CancellationToken,
    /// Retained on the send side so `retry` can reopen the same bytes.
    source: Option<FileSource>,
}

struct PeerSession {
    remote_id: Uuid,
    initiator: bool,
    transport: Box<dyn Transport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    connection: ConnectionState,
    control_tx: Option<StreamSender>,
    active_streams: HashMap<String, StreamSender>,
}

enum Step {
    Command(Option<Command>),
    Signaling(Option<SignalingEvent>),
    Transport(Option<TransportEvent>),
    Control(Option<StreamEvent>),
    Task(Option<EngineMsg>),
    Stats,
}

struct Engine {
    room_id: String,
    ice_servers: Vec<IceServerConfig>,
    local_id: Option<Uuid>,
    password: PasswordCell,
    signaling: SignalingClient,
    transports: Arc<dyn TransportFactory>,
    sink: Box<dyn OutputSink>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    msgs_tx: mpsc::UnboundedSender<EngineMsg>,
    msgs: mpsc::UnboundedReceiver<EngineMsg>,
    session: Option<PeerSession>,
    control_rx: Option<mpsc::UnboundedReceiver<StreamEvent>>,
    auth: AuthHandshake,
    transfers: HashMap<Uuid, TransferEntry>,
    /// Cancellation tokens for inbound substreams whose `file-start` has not
    /// arrived yet.
    incoming_tokens: HashMap<Uuid, CancellationToken>,
    pending: HashMap<Uuid, PendingFile>,
    chat: Vec<ChatMessage>,
}

impl Engine {
    async fn run(mut self) {
        self.signaling.join(&self.room_id);
        let mut stats = tokio::time::interval(STATS_INTERVAL);

        loop {
            let step = tokio::select! {
                cmd = self.commands.recv() => Step::Command(cmd),
                ev = self.signaling.recv() => Step::Signaling(ev),
                ev = next_transport(&mut self.session) => Step::Transport(ev),
                ev = next_control(&mut self.control_rx) => Step::Control(ev),
                msg = self.msgs.recv() => Step::Task(msg),
                _ = stats.tick() => Step::Stats,
            };

            match step {
                Step::Command(Some(cmd)) => {
                    if self.handle_command(cmd).await {
                        break;
                    }
                }
                Step::Command(None) => {
                    // Every handle is gone; leave quietly.
                    self.clear_peer();
                    self.signaling.leave(&self.room_id);
                    break;
                }
                Step::Signaling(Some(ev)) => self.on_signaling(ev),
                Step::Signaling(None) => {
                    warn!("signaling carrier ended, shutting the session down");
                    self.clear_peer();
                    break;
                }
                Step::Transport(Some(ev)) => self.on_transport(ev),
                Step::Transport(None) => self.clear_peer(),
                Step::Control(Some(ev)) => self.on_control(ev),
                Step::Control(None) => self.control_rx = None,
                Step::Task(Some(msg)) => self.on_task_msg(msg),
                Step::Task(None) => {}
                Step::Stats => self.on_stats_tick(),
            }
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events_tx.send(event);
    }

    // ── Commands ───────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SendFile { id, name, source } => self.start_send(id, name, source).await,
            Command::SendChat { text } => self.send_chat(text),
            Command::CancelTransfer { id } => self.cancel_transfer(id),
            Command::AcceptFile { id } => self.accept_file(id),
            Command::DeclineFile { id } => self.decline_file(id),
            Command::RetryTransfer { id } => self.retry_transfer(id),
            Command::SetPassword { password } => {
                *self.password.write() = password;
            }
            Command::Inspect { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Leave => {
                self.clear_peer();
                self.signaling.leave(&self.room_id);
                self.emit(EngineEvent::LeftRoom);
                return true;
            }
        }
        false
    }

    fn ready_for_transfers(&self) -> bool {
        self.auth.state().is_admitted()
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.connection == ConnectionState::Connected)
    }

    async fn start_send(&mut self, id: Uuid, name: String, source: FileSource) {
        let size = match source.size().await {
            Ok(size) => size,
            Err(e) => {
                warn!(%id, "cannot size outgoing file: {e}");
                self.insert_failed_send(id, name, 0, source, TransferErrorKind::ConnectionLost);
                return;
            }
        };
        if !self.ready_for_transfers() {
            self.insert_failed_send(id, name, size, source, TransferErrorKind::NotConnected);
            return;
        }

        let label = file_stream_label(id);
        let session = self.session.as_mut().expect("checked by ready_for_transfers");
        match session.transport.open_stream(&label, FILE_STREAM_THRESHOLD) {
            Ok(stream) => {
                session.active_streams.insert(label, stream.sender());
                let cancel = CancellationToken::new();
                let record = FileTransfer {
                    id,
                    direction: TransferDirection::Send,
                    name: name.clone(),
                    size,
                    progress: 0,
                    status: TransferStatus::Sending,
                    error: None,
                };
                self.transfers.insert(
                    id,
                    TransferEntry {
                        record: record.clone(),
                        cancel: cancel.clone(),
                        source: Some(source.clone()),
                    },
                );
                self.emit(EngineEvent::TransferUpdated { transfer: record });
                sender::spawn(SenderTask {
                    id,
                    name,
                    size,
                    source,
                    stream,
                    password: self.password.clone(),
                    cancel,
                    updates: self.msgs_tx.clone(),
                });
            }
            Err(e) => {
                warn!(%id, "substream open failed: {e}");
                self.insert_failed_send(id, name, size, source, TransferErrorKind::NotConnected);
            }
        }
    }

    /// An immediate error record, kept visible for retry.
    fn insert_failed_send(
        &mut self,
        id: Uuid,
        name: String,
        size: u64,
        source: FileSource,
        kind: TransferErrorKind,
    ) {
        let record = FileTransfer {
            id,
            direction: TransferDirection::Send,
            name,
            size,
            progress: 0,
            status: TransferStatus::Error,
            error: Some(kind),
        };
        self.transfers.insert(
            id,
            TransferEntry {
                record: record.clone(),
                cancel: CancellationToken::new(),
                source: Some(source),
            },
        );
        self.emit(EngineEvent::TransferUpdated { transfer: record });
    }

    fn retry_transfer(&mut self, id: Uuid) {
        let (name, size, source) = match self.transfers.get(&id) {
            Some(entry)
                if entry.record.direction == TransferDirection::Send
                    && entry.record.status == TransferStatus::Error =>
            {
                match &entry.source {
                    Some(source) => (
                        entry.record.name.clone(),
                        entry.record.size,
                        source.clone(),
                    ),
                    None => return,
                }
            }
            _ => return,
        };

        if !self.ready_for_transfers() {
            let record = {
                let entry = self.transfers.get_mut(&id).expect("entry checked above");
                entry.record.error = Some(TransferErrorKind::NotConnected);
                entry.record.clone()
            };
            self.emit(EngineEvent::TransferUpdated { transfer: record });
            return;
        }

        let label = file_stream_label(id);
        let session = self.session.as_mut().expect("checked by ready_for_transfers");
        match session.transport.open_stream(&label, FILE_STREAM_THRESHOLD) {
            Ok(stream) => {
                session.active_streams.insert(label, stream.sender());
                let cancel = CancellationToken::new();
                let record = {
                    let entry = self.transfers.get_mut(&id).expect("entry checked above");
                    entry.record.status = TransferStatus::Sending;
                    entry.record.progress = 0;
                    entry.record.error = None;
                    entry.cancel = cancel.clone();
                    entry.record.clone()
                };
                self.emit(EngineEvent::TransferUpdated { transfer: record });
                sender::spawn(SenderTask {
                    id,
                    name,
                    size,
                    source,
                    stream,
                    password: self.password.clone(),
                    cancel,
                    updates: self.msgs_tx.clone(),
                });
            }
            Err(e) => warn!(%id, "retry substream open failed: {e}"),
        }
    }

    fn send_chat(&mut self, text: String) {
        if !self.auth.state().is_admitted() {
            warn!("chat dropped: session not admitted");
            return;
        }
        let Some(control) = self.session.as_ref().and_then(|s| s.control_tx.clone()) else {
            warn!("chat dropped: no control stream");
            return;
        };
        let message = ChatMessage {
            id: Uuid::new_v4(),
            text,
            origin: ChatOrigin::Local,
            timestamp: Utc::now(),
        };
        let frame = ControlFrame::Chat {
            id: message.id,
            text: message.text.clone(),
            timestamp: message.timestamp,
        };
        if let Err(e) = send_control(&control, &frame) {
            warn!("chat send failed: {e}");
            return;
        }
        self.chat.push(message.clone());
        self.emit(EngineEvent::ChatSent { message });
    }

    fn cancel_transfer(&mut self, id: Uuid) {
        if let Some(entry) = self.transfers.get(&id) {
            if entry.record.status.is_terminal()
                || entry.record.status == TransferStatus::PendingAccept
            {
                return;
            }
            entry.cancel.cancel();
        } else if let Some(token) = self.incoming_tokens.get(&id) {
            token.cancel();
        }
    }

    fn accept_file(&mut self, id: Uuid) {
        let Some(pending) = self.pending.remove(&id) else {
            debug!(%id, "accept for unknown pending file");
            return;
        };
        match self.sink.deliver(&pending.name, &pending.payload) {
            Ok(()) => {
                self.update_status(id, TransferStatus::Completed, None);
                self.emit(EngineEvent::FileDelivered {
                    id,
                    name: pending.name,
                });
            }
            Err(e) => {
                warn!(%id, "sink delivery failed: {e}");
                self.update_status(
                    id,
                    TransferStatus::Error,
                    Some(TransferErrorKind::ConnectionLost),
                );
            }
        }
    }

    fn decline_file(&mut self, id: Uuid) {
        if self.pending.remove(&id).is_none() {
            debug!(%id, "decline for unknown pending file");
            return;
        }
        self.update_status(
            id,
            TransferStatus::Cancelled,
            Some(TransferErrorKind::Declined),
        );
    }

    // ── Signaling ──────────────────────────────────────────────────────

    fn on_signaling(&mut self, ev: SignalingEvent) {
        match ev {
            SignalingEvent::Ready { local_id } => {
                self.local_id = Some(local_id);
                self.emit(EngineEvent::Ready { local_id });
            }
            SignalingEvent::PeerJoined { remote_id } => {
                if self.session.is_none() {
                    // First to hear about the peer becomes the initiator.
                    self.create_session(remote_id, true);
                }
                self.emit(EngineEvent::PeerJoined { remote_id });
            }
            SignalingEvent::PeerLeft { remote_id } => {
                if self.session.as_ref().is_some_and(|s| s.remote_id == remote_id) {
                    self.clear_peer();
                }
                self.emit(EngineEvent::PeerLeft { remote_id });
            }
            SignalingEvent::Signal { from, signal } => self.on_signal(from, signal),
            SignalingEvent::Reconnected => {
                info!("signaling reconnected, re-joining {}", self.room_id);
                if self.session.is_some() {
                    self.clear_peer();
                }
                self.signaling.join(&self.room_id);
            }
        }
    }

    fn on_signal(&mut self, from: Uuid, signal: SignalPayload) {
        match signal {
            SignalPayload::Offer { offer } => {
                if self.session.is_some() {
                    debug!(%from, "offer ignored: transport already exists");
                    return;
                }
                self.create_session(from, false);
                let local = self.local_id.unwrap_or(Uuid::nil());
                let session = self.session.as_mut().expect("just created");
                if session.transport.signaling_state() == SignalingState::Closed {
                    debug!("offer dropped: signaling state closed");
                    return;
                }
                if let Err(e) = session.transport.set_remote_offer(&offer) {
                    warn!("remote offer rejected: {e}");
                    return;
                }
                match session.transport.create_answer() {
                    Ok(answer) => {
                        self.signaling
                            .signal(from, local, SignalPayload::Answer { answer });
                    }
                    Err(e) => warn!("answer creation failed: {e}"),
                }
            }
            SignalPayload::Answer { answer } => {
                let Some(session) = self.session.as_mut() else {
                    debug!(%from, "answer without a session ignored");
                    return;
                };
                if session.remote_id != from {
                    debug!(%from, "answer from unexpected peer ignored");
                    return;
                }
                if session.transport.signaling_state() != SignalingState::HaveLocalOffer {
                    debug!("late answer ignored");
                    return;
                }
                if let Err(e) = session.transport.set_remote_answer(&answer) {
                    warn!("remote answer rejected: {e}");
                }
            }
            SignalPayload::Candidate { candidate } => {
                let Some(session) = self.session.as_mut() else {
                    debug!(%from, "candidate without a session dropped");
                    return;
                };
                if session.remote_id != from {
                    debug!(%from, "candidate from unexpected peer dropped");
                    return;
                }
                if session.transport.signaling_state() == SignalingState::Closed {
                    warn!("candidate dropped: signaling state closed");
                    return;
                }
                if let Err(e) = session.transport.add_remote_candidate(&candidate) {
                    warn!("candidate rejected: {e}");
                }
            }
        }
    }

    fn create_session(&mut self, remote_id: Uuid, initiator: bool) {
        let (transport, events) = self.transports.create(&self.ice_servers);
        self.auth = AuthHandshake::new();
        self.control_rx = None;
        let mut session = PeerSession {
            remote_id,
            initiator,
            transport,
            events,
            connection: ConnectionState::New,
            control_tx: None,
            active_streams: HashMap::new(),
        };

        if initiator {
            // The control stream is created in the same step as the offer so
            // the responder sees it as soon as the transport connects.
            match session.transport.open_stream(CONTROL_STREAM_LABEL, 0) {
                Ok(stream) => {
                    let (tx, rx) = stream.split();
                    session.control_tx = Some(tx.clone());
                    session
                        .active_streams
                        .insert(CONTROL_STREAM_LABEL.to_owned(), tx);
                    self.control_rx = Some(rx);
                }
                Err(e) => warn!("control stream open failed: {e}"),
            }
            let local = self.local_id.unwrap_or(Uuid::nil());
            match session.transport.create_offer() {
                Ok(offer) => {
                    self.signaling
                        .signal(remote_id, local, SignalPayload::Offer { offer });
                }
                Err(e) => warn!("offer creation failed: {e}"),
            }
        }

        self.session = Some(session);
    }

    fn clear_peer(&mut self) {
        self.control_rx = None;
        self.incoming_tokens.clear();
        if let Some(mut session) = self.session.take() {
            session.transport.close();
            if !session.connection.is_terminal() {
                self.emit(EngineEvent::ConnectionChanged {
                    state: ConnectionState::Closed,
                });
            }
        }
        self.auth = AuthHandshake::new();
    }

    // ── Transport ──────────────────────────────────────────────────────

    fn on_transport(&mut self, ev: TransportEvent) {
        match ev {
            TransportEvent::LocalCandidate(candidate) => {
                if let Some(session) = &self.session {
                    let local = self.local_id.unwrap_or(Uuid::nil());
                    self.signaling.signal(
                        session.remote_id,
                        local,
                        SignalPayload::Candidate { candidate },
                    );
                }
            }
            TransportEvent::ConnectionChanged(state) => {
                if let Some(session) = &mut self.session {
                    session.connection = state;
                }
                self.emit(EngineEvent::ConnectionChanged { state });
                // Disconnected is transient; only terminal states clear.
                if state.is_terminal() {
                    self.clear_peer();
                }
            }
            TransportEvent::IncomingStream(stream) => self.on_incoming_stream(stream),
        }
    }

    fn on_incoming_stream(&mut self, stream: StreamHandle) {
        let label = stream.label().to_owned();
        if self.session.is_none() {
            stream.sender().close();
            return;
        }

        if label == CONTROL_STREAM_LABEL {
            let (tx, rx) = stream.split();
            let session = self.session.as_mut().expect("checked above");
            session.control_tx = Some(tx.clone());
            session.active_streams.insert(label, tx);
            self.control_rx = Some(rx);
            self.auth_open(false);
        } else if let Some(id) = parse_file_stream_label(&label) {
            if !self.auth.state().is_admitted() {
                warn!(%id, "file substream before admission refused");
                stream.sender().close();
                return;
            }
            let session = self.session.as_mut().expect("checked above");
            session.active_streams.insert(label, stream.sender());
            let cancel = CancellationToken::new();
            self.incoming_tokens.insert(id, cancel.clone());
            receiver::spawn(ReceiverTask {
                id,
                stream,
                password: self.password.clone(),
                cancel,
                updates: self.msgs_tx.clone(),
            });
        } else {
            warn!(label = %label, "unknown substream label refused");
            stream.sender().close();
        }
    }

    // ── Control stream & auth ──────────────────────────────────────────

    fn on_control(&mut self, ev: StreamEvent) {
        match ev {
            StreamEvent::Open => {
                let Some(initiator) = self.session.as_ref().map(|s| s.initiator) else {
                    return;
                };
                self.auth_open(initiator);
            }
            StreamEvent::Message(StreamMessage::Text(text)) => {
                if let Some(frame) = parse_control(&text) {
                    self.on_control_frame(frame);
                }
            }
            StreamEvent::Message(StreamMessage::Binary(_)) => {
                warn!("binary message on control stream discarded");
            }
            StreamEvent::BufferedAmountLow => {}
            StreamEvent::Closed => {
                self.control_rx = None;
                if let Some(session) = &mut self.session {
                    session.control_tx = None;
                    session.active_streams.remove(CONTROL_STREAM_LABEL);
                }
            }
        }
    }

    fn auth_open(&mut self, initiator: bool) {
        let password = self.password.read().clone();
        let frames = self.auth.on_open(initiator, password.as_deref());
        self.send_auth_frames(frames);
    }

    fn send_auth_frames(&mut self, frames: Vec<ControlFrame>) {
        if frames.is_empty() {
            return;
        }
        let Some(control) = self.session.as_ref().and_then(|s| s.control_tx.clone()) else {
            warn!("auth frames dropped: no control stream");
            return;
        };
        for frame in frames {
            if let Err(e) = send_control(&control, &frame) {
                warn!("auth frame send failed: {e}");
            }
        }
    }

    fn on_control_frame(&mut self, frame: ControlFrame) {
        if let ControlFrame::Chat {
            id,
            text,
            timestamp,
        } = frame
        {
            if !self.auth.state().is_admitted() {
                debug!("chat before admission discarded");
                return;
            }
            let message = ChatMessage {
                id,
                text,
                origin: ChatOrigin::Remote,
                timestamp,
            };
            self.chat.push(message.clone());
            self.emit(EngineEvent::ChatReceived { message });
            return;
        }

        let password = self.password.read().clone();
        let (frames, outcome) = self.auth.on_frame(&frame, password.as_deref());
        self.send_auth_frames(frames);
        match outcome {
            AuthOutcome::Continue => {}
            AuthOutcome::Admitted => self.emit(EngineEvent::AuthChanged {
                state: AuthState::Admitted,
            }),
            AuthOutcome::Skipped => self.emit(EngineEvent::AuthChanged {
                state: AuthState::Skipped,
            }),
            AuthOutcome::Rejected(reason) => {
                self.emit(EngineEvent::AuthChanged {
                    state: AuthState::Rejected,
                });
                self.emit(EngineEvent::AuthFailed { reason });
                self.schedule_teardown();
            }
        }
    }

    /// Tear down shortly after rejection so the final frames can flush.
    fn schedule_teardown(&self) {
        let msgs = self.msgs_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TEARDOWN_FLUSH_DELAY).await;
            let _ = msgs.send(EngineMsg::ClearPeer);
        });
    }

    // ── Per-file task messages ─────────────────────────────────────────

    fn on_task_msg(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::Progress { id, progress } => {
                let record = match self.transfers.get_mut(&id) {
                    Some(entry)
                        if !entry.record.status.is_terminal()
                            && progress > entry.record.progress =>
                    {
                        entry.record.progress = progress;
                        Some(entry.record.clone())
                    }
                    _ => None,
                };
                if let Some(record) = record {
                    self.emit(EngineEvent::TransferUpdated { transfer: record });
                }
            }
            EngineMsg::Status { id, status, error } => self.update_status(id, status, error),
            EngineMsg::Incoming { id, name, size } => {
                if self.transfers.contains_key(&id) {
                    return;
                }
                let cancel = self.incoming_tokens.remove(&id).unwrap_or_default();
                let record = FileTransfer {
                    id,
                    direction: TransferDirection::Receive,
                    name,
                    size,
                    progress: 0,
                    status: TransferStatus::Receiving,
                    error: None,
                };
                self.transfers.insert(
                    id,
                    TransferEntry {
                        record: record.clone(),
                        cancel,
                        source: None,
                    },
                );
                self.emit(EngineEvent::TransferUpdated { transfer: record });
            }
            EngineMsg::Pending {
                id,
                name,
                size,
                payload,
            } => {
                if !self.transfers.contains_key(&id) {
                    warn!(%id, "payload for unknown transfer discarded");
                    return;
                }
                self.pending.insert(
                    id,
                    PendingFile {
                        id,
                        name: name.clone(),
                        size,
                        payload,
                    },
                );
                self.update_status(id, TransferStatus::PendingAccept, None);
                self.emit(EngineEvent::FilePending { id, name, size });
            }
            EngineMsg::ClearPeer => self.clear_peer(),
        }
    }

    fn update_status(
        &mut self,
        id: Uuid,
        status: TransferStatus,
        error: Option<TransferErrorKind>,
    ) {
        let record = {
            let Some(entry) = self.transfers.get_mut(&id) else {
                return;
            };
            if entry.record.status.is_terminal() {
                return;
            }
            entry.record.status = status;
            entry.record.error = error;
            if matches!(
                status,
                TransferStatus::Completed | TransferStatus::PendingAccept
            ) {
                entry.record.progress = 100;
            }
            entry.record.clone()
        };
        self.emit(EngineEvent::TransferUpdated { transfer: record });

        if status.is_terminal() || status == TransferStatus::PendingAccept {
            let label = file_stream_label(id);
            if let Some(session) = &mut self.session {
                session.active_streams.remove(&label);
            }
            self.incoming_tokens.remove(&id);
        }
    }

    // ── Stats ──────────────────────────────────────────────────────────

    fn on_stats_tick(&mut self) {
        let Some(session) = &self.session else { return };
        if session.connection != ConnectionState::Connected {
            return;
        }
        if let Some(stats) = session.transport.stats() {
            self.emit(EngineEvent::PeerStats {
                latency_ms: Some(stats.round_trip_ms),
                remote_ip: stats.remote_ip,
            });
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let (connection, signaling, ice, streams) = match &self.session {
            Some(session) => (
                Some(session.connection),
                Some(session.transport.signaling_state()),
                Some(session.transport.ice_state()),
                session
                    .active_streams
                    .values()
                    .map(|sender| StreamSnapshot {
                        label: sender.label().to_owned(),
                        ready_state: sender.state(),
                        buffered_amount: sender.buffered_amount(),
                        threshold: sender.buffered_amount_low_threshold(),
                    })
                    .collect(),
            ),
            None => (None, None, None, Vec::new()),
        };
        SessionSnapshot {
            connection,
            signaling,
            ice,
            auth: self.auth.state(),
            streams,
        }
    }
}

async fn next_transport(session: &mut Option<PeerSession>) -> Option<TransportEvent> {
    match session.as_mut() {
        Some(session) => session.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_control(
    control_rx: &mut Option<mpsc::UnboundedReceiver<StreamEvent>>,
) -> Option<StreamEvent> {
    match control_rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
