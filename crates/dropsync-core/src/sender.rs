//! Per-file sending pipeline.
//!
//! One spawned task per outgoing file. The task owns the substream and
//! reports progress and terminal status back to the engine by id.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use dropsync_crypto::CipherCache;
use dropsync_types::{FileFrame, TransferErrorKind, TransferStatus};

use crate::control::{parse_file_frame, send_file_frame};
use crate::engine::{EngineMsg, PasswordCell};
use crate::source::FileSource;
use crate::transport::{
    StreamEvent, StreamHandle, StreamMessage, StreamSender, StreamState, FILE_STREAM_THRESHOLD,
};

pub(crate) const CHUNK_SIZE: usize = 16 * 1024;
pub(crate) const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const BUFFER_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_DELAY: Duration = Duration::from_secs(1);

/// Suspend sending while more than this many bytes sit unsent in the
/// substream buffer.
pub(crate) const HIGH_WATER: u64 = FILE_STREAM_THRESHOLD;

pub(crate) struct SenderTask {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub source: FileSource,
    pub stream: StreamHandle,
    pub password: PasswordCell,
    pub cancel: CancellationToken,
    pub updates: mpsc::UnboundedSender<EngineMsg>,
}

enum SendFailure {
    /// Local flag or remote `transfer-cancelled`.
    Cancelled { remote: bool },
    Failed(TransferErrorKind),
}

pub(crate) fn spawn(task: SenderTask) {
    tokio::spawn(run(task));
}

async fn run(task: SenderTask) {
    let SenderTask {
        id,
        name,
        size,
        source,
        stream,
        password,
        cancel,
        updates,
    } = task;
    let (sender, mut events) = stream.split();

    let result = drive(
        id, &name, size, &source, &sender, &mut events, &password, &cancel, &updates,
    )
    .await;

    match result {
        Ok(()) => {
            debug!(%id, size, "file send complete");
            let _ = updates.send(EngineMsg::Status {
                id,
                status: TransferStatus::Completed,
                error: None,
            });
            // Let the receiver drain before the substream goes away.
            tokio::time::sleep(CLOSE_DELAY).await;
            sender.close();
        }
        Err(SendFailure::Cancelled { remote }) => {
            if !remote && sender.state() == StreamState::Open {
                let _ = send_file_frame(&sender, &FileFrame::TransferCancelled);
            }
            let _ = updates.send(EngineMsg::Status {
                id,
                status: TransferStatus::Cancelled,
                error: Some(TransferErrorKind::Cancelled),
            });
            sender.close();
        }
        Err(SendFailure::Failed(kind)) => {
            warn!(%id, %kind, "file send failed");
            let _ = updates.send(EngineMsg::Status {
                id,
                status: TransferStatus::Error,
                error: Some(kind),
            });
            sender.close();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    id: Uuid,
    name: &str,
    size: u64,
    source: &FileSource,
    sender: &StreamSender,
    events: &mut mpsc::UnboundedReceiver<StreamEvent>,
    password: &PasswordCell,
    cancel: &CancellationToken,
    updates: &mpsc::UnboundedSender<EngineMsg>,
) -> Result<(), SendFailure> {
    wait_open(events, cancel).await?;

    send_file_frame(
        sender,
        &FileFrame::FileStart {
            name: name.to_owned(),
            size,
        },
    )
    .map_err(|_| SendFailure::Failed(TransferErrorKind::ConnectionClosed))?;

    let mut reader = source.open().await.map_err(|e| {
        warn!(%id, "source open failed: {e}");
        SendFailure::Failed(TransferErrorKind::ConnectionLost)
    })?;

    let mut cache = CipherCache::new();
    let mut sent: u64 = 0;
    let mut last_progress: u8 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(SendFailure::Cancelled { remote: false });
        }
        drain_events(events)?;

        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(SendFailure::Cancelled { remote: false }),
            chunk = reader.next_chunk(CHUNK_SIZE) => chunk.map_err(|e| {
                warn!(%id, "source read failed: {e}");
                SendFailure::Failed(TransferErrorKind::ConnectionLost)
            })?,
        };
        let Some(chunk) = chunk else { break };

        // The password is read fresh per chunk; the cache skips the KDF
        // until it changes.
        let payload = {
            let current = password.read().clone();
            match current {
                Some(pw) => Bytes::from(
                    cache
                        .cipher(&pw)
                        .encrypt(&chunk)
                        .map_err(|_| SendFailure::Failed(TransferErrorKind::DecryptionFailed))?,
                ),
                None => chunk.clone(),
            }
        };

        wait_for_buffer(sender, events, cancel).await?;
        if sender.state() != StreamState::Open {
            return Err(SendFailure::Failed(TransferErrorKind::ConnectionClosed));
        }
        sender
            .send(StreamMessage::Binary(payload))
            .map_err(|_| SendFailure::Failed(TransferErrorKind::ConnectionClosed))?;

        sent += chunk.len() as u64;
        let progress = progress_pct(sent, size);
        if progress != last_progress {
            last_progress = progress;
            let _ = updates.send(EngineMsg::Progress { id, progress });
        }
    }

    if cancel.is_cancelled() {
        return Err(SendFailure::Cancelled { remote: false });
    }
    if sender.state() != StreamState::Open {
        return Err(SendFailure::Failed(TransferErrorKind::ConnectionClosed));
    }
    send_file_frame(sender, &FileFrame::FileEnd)
        .map_err(|_| SendFailure::Failed(TransferErrorKind::ConnectionClosed))?;
    Ok(())
}

/// Await the substream `Open` event.
async fn wait_open(
    events: &mut mpsc::UnboundedReceiver<StreamEvent>,
    cancel: &CancellationToken,
) -> Result<(), SendFailure> {
    let wait = async {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SendFailure::Cancelled { remote: false });
                }
                ev = events.recv() => match ev {
                    Some(StreamEvent::Open) => return Ok(()),
                    Some(StreamEvent::Closed) | None => {
                        return Err(SendFailure::Failed(TransferErrorKind::ConnectionClosed));
                    }
                    Some(_) => {}
                },
            }
        }
    };
    match timeout(OPEN_TIMEOUT, wait).await {
        Ok(result) => result,
        Err(_) => Err(SendFailure::Failed(TransferErrorKind::ChannelOpenTimeout)),
    }
}

/// Suspend until the buffered amount is back under the high-water mark.
async fn wait_for_buffer(
    sender: &StreamSender,
    events: &mut mpsc::UnboundedReceiver<StreamEvent>,
    cancel: &CancellationToken,
) -> Result<(), SendFailure> {
    while sender.buffered_amount() > HIGH_WATER {
        let wait = async {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(SendFailure::Cancelled { remote: false });
                    }
                    ev = events.recv() => match ev {
                        Some(StreamEvent::BufferedAmountLow) => return Ok(()),
                        Some(StreamEvent::Message(StreamMessage::Text(text))) => {
                            if matches!(parse_file_frame(&text), Some(FileFrame::TransferCancelled)) {
                                return Err(SendFailure::Cancelled { remote: true });
                            }
                        }
                        Some(StreamEvent::Closed) | None => {
                            return Err(SendFailure::Failed(TransferErrorKind::ConnectionClosed));
                        }
                        Some(_) => {}
                    },
                }
            }
        };
        match timeout(BUFFER_TIMEOUT, wait).await {
            Ok(result) => result?,
            Err(_) => return Err(SendFailure::Failed(TransferErrorKind::BufferTimeout)),
        }
    }
    Ok(())
}

/// Non-blocking sweep of stream events between sends: a remote cancel or a
/// close must not wait for the next backpressure pause to be noticed.
fn drain_events(
    events: &mut mpsc::UnboundedReceiver<StreamEvent>,
) -> Result<(), SendFailure> {
    while let Ok(ev) = events.try_recv() {
        match ev {
            StreamEvent::Message(StreamMessage::Text(text)) => {
                if matches!(parse_file_frame(&text), Some(FileFrame::TransferCancelled)) {
                    return Err(SendFailure::Cancelled { remote: true });
                }
            }
            StreamEvent::Closed => {
                return Err(SendFailure::Failed(TransferErrorKind::ConnectionClosed));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Whole-percent progress, floored; a 0-byte file is complete at 100.
pub(crate) fn progress_pct(done: u64, size: u64) -> u8 {
    if size == 0 {
        return 100;
    }
    ((done as u128 * 100) / size as u128).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_floored() {
        assert_eq!(progress_pct(0, 10), 0);
        assert_eq!(progress_pct(1, 3), 33);
        assert_eq!(progress_pct(2, 3), 66);
        assert_eq!(progress_pct(3, 3), 100);
        assert_eq!(progress_pct(999, 1000), 99);
    }

    #[test]
    fn progress_handles_empty_and_overshoot() {
        assert_eq!(progress_pct(0, 0), 100);
        assert_eq!(progress_pct(20, 10), 100);
        assert_eq!(progress_pct(u64::MAX, u64::MAX), 100);
    }
}
