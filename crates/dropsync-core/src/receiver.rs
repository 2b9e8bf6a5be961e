//! Per-file receiving pipeline.
//!
//! Bound to one incoming `file-<id>` substream. Chunks accumulate in memory
//! until `file-end`, then the assembled payload is published to the engine
//! as a pending file awaiting accept or decline.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use dropsync_crypto::CipherCache;
use dropsync_types::{FileFrame, TransferErrorKind, TransferStatus};

use crate::control::{parse_file_frame, send_file_frame};
use crate::engine::{EngineMsg, PasswordCell};
use crate::sender::progress_pct;
use crate::transport::{StreamEvent, StreamHandle, StreamMessage, StreamState};

pub(crate) struct ReceiverTask {
    pub id: Uuid,
    pub stream: StreamHandle,
    pub password: PasswordCell,
    pub cancel: CancellationToken,
    pub updates: mpsc::UnboundedSender<EngineMsg>,
}

enum Outcome {
    Pending(Bytes),
    CancelledLocal,
    CancelledRemote,
    Failed(TransferErrorKind),
    /// The substream closed before `file-start`; there is nothing to report.
    Silent,
}

pub(crate) fn spawn(task: ReceiverTask) {
    tokio::spawn(run(task));
}

async fn run(task: ReceiverTask) {
    let ReceiverTask {
        id,
        stream,
        password,
        cancel,
        updates,
    } = task;
    let (sender, mut events) = stream.split();

    let mut cache = CipherCache::new();
    let mut name: Option<String> = None;
    let mut size: u64 = 0;
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut received: u64 = 0;
    let mut last_progress: u8 = 0;

    let outcome = loop {
        let ev = tokio::select! {
            _ = cancel.cancelled() => break Outcome::CancelledLocal,
            ev = events.recv() => ev,
        };
        match ev {
            Some(StreamEvent::Open | StreamEvent::BufferedAmountLow) => {}
            Some(StreamEvent::Message(StreamMessage::Text(text))) => {
                match parse_file_frame(&text) {
                    Some(FileFrame::FileStart { name: n, size: s }) => {
                        debug!(%id, name = %n, size = s, "incoming file");
                        name = Some(n.clone());
                        size = s;
                        let _ = updates.send(EngineMsg::Incoming { id, name: n, size: s });
                    }
                    Some(FileFrame::FileEnd) => {
                        break Outcome::Pending(assemble(&mut chunks));
                    }
                    Some(FileFrame::TransferCancelled) => break Outcome::CancelledRemote,
                    None => {}
                }
            }
            Some(StreamEvent::Message(StreamMessage::Binary(data))) => {
                // Whether to decrypt is decided solely by the local
                // password configuration, read fresh per chunk.
                let current = password.read().clone();
                let plain = match current {
                    Some(pw) => match cache.cipher(&pw).decrypt(&data) {
                        Ok(p) => Bytes::from(p),
                        Err(e) => {
                            warn!(%id, "chunk rejected: {e}");
                            break Outcome::Failed(TransferErrorKind::DecryptionFailed);
                        }
                    },
                    None => data,
                };
                received += plain.len() as u64;
                chunks.push(plain);
                if name.is_some() && size > 0 {
                    let progress = progress_pct(received, size);
                    if progress != last_progress {
                        last_progress = progress;
                        let _ = updates.send(EngineMsg::Progress { id, progress });
                    }
                }
            }
            Some(StreamEvent::Closed) | None => {
                if name.is_some() {
                    break Outcome::Failed(TransferErrorKind::ConnectionLost);
                }
                break Outcome::Silent;
            }
        }
    };

    match outcome {
        Outcome::Pending(payload) => {
            let _ = updates.send(EngineMsg::Pending {
                id,
                name: name.unwrap_or_default(),
                size,
                payload,
            });
            sender.close();
        }
        Outcome::CancelledLocal => {
            if sender.state() == StreamState::Open {
                let _ = send_file_frame(&sender, &FileFrame::TransferCancelled);
            }
            let _ = updates.send(EngineMsg::Status {
                id,
                status: TransferStatus::Cancelled,
                error: Some(TransferErrorKind::Cancelled),
            });
            sender.close();
        }
        Outcome::CancelledRemote => {
            let _ = updates.send(EngineMsg::Status {
                id,
                status: TransferStatus::Cancelled,
                error: Some(TransferErrorKind::Cancelled),
            });
            sender.close();
        }
        Outcome::Failed(kind) => {
            let _ = updates.send(EngineMsg::Status {
                id,
                status: TransferStatus::Error,
                error: Some(kind),
            });
            sender.close();
        }
        Outcome::Silent => sender.close(),
    }
}

/// Concatenate and release the chunk list.
fn assemble(chunks: &mut Vec<Bytes>) -> Bytes {
    let total = chunks.iter().map(|c| c.len()).sum();
    let mut buf = Vec::with_capacity(total);
    for chunk in chunks.drain(..) {
        buf.extend_from_slice(&chunk);
    }
    Bytes::from(buf)
}
