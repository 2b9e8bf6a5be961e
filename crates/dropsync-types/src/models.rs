use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Connection state of the peer transport, mirrored to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    /// Transient. The session is kept; the transport may recover.
    Disconnected,
    /// Terminal. The peer is cleared and a fresh transport may be created.
    Failed,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// Admission state of the control stream. Monotonic until session teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthState {
    Pending,
    Admitted,
    Rejected,
    Skipped,
}

impl AuthState {
    /// Whether user payload (chat, file frames) may flow.
    pub fn is_admitted(self) -> bool {
        matches!(self, Self::Admitted | Self::Skipped)
    }
}

/// Terminal authentication failures. All of these tear down the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthFailure {
    PasswordRequired,
    PasswordMismatchPeerHasNone,
    PasswordMismatchPeerHasPassword,
    WrongPassword,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PasswordRequired => "password-required",
            Self::PasswordMismatchPeerHasNone => "password-mismatch-peer-has-none",
            Self::PasswordMismatchPeerHasPassword => "password-mismatch-peer-has-password",
            Self::WrongPassword => "wrong-password",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferDirection {
    Send,
    Receive,
}

/// Status of a single file transfer. Transitions are monotonic except
/// `Error`, which `retry` may take back to `Sending` on a fresh substream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    Sending,
    Receiving,
    PendingAccept,
    Completed,
    Error,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

/// Short error kinds exposed verbatim on a transfer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferErrorKind {
    DecryptionFailed,
    ConnectionLost,
    ChannelOpenTimeout,
    BufferTimeout,
    ConnectionClosed,
    Cancelled,
    Declined,
    NotConnected,
}

impl fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DecryptionFailed => "decryption-failed",
            Self::ConnectionLost => "connection-lost",
            Self::ChannelOpenTimeout => "channel-open-timeout",
            Self::BufferTimeout => "buffer-timeout",
            Self::ConnectionClosed => "connection-closed",
            Self::Cancelled => "cancelled",
            Self::Declined => "declined",
            Self::NotConnected => "not-connected",
        };
        f.write_str(s)
    }
}

/// One entry in the transfer list. Retained for history; never destroyed
/// during the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransfer {
    pub id: Uuid,
    pub direction: TransferDirection,
    pub name: String,
    /// The sender's declared size in bytes.
    pub size: u64,
    /// 0..=100, monotonic non-decreasing.
    pub progress: u8,
    pub status: TransferStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TransferErrorKind>,
}

/// A fully received payload held in memory awaiting accept or decline.
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChatOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub text: String,
    pub origin: ChatOrigin,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Live peer information, sampled while connected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub remote_id: Uuid,
    pub connection: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_render_kebab() {
        assert_eq!(TransferErrorKind::ChannelOpenTimeout.to_string(), "channel-open-timeout");
        assert_eq!(AuthFailure::WrongPassword.to_string(), "wrong-password");
        assert_eq!(
            AuthFailure::PasswordMismatchPeerHasNone.to_string(),
            "password-mismatch-peer-has-none"
        );
    }

    #[test]
    fn admission_covers_skip() {
        assert!(AuthState::Skipped.is_admitted());
        assert!(AuthState::Admitted.is_admitted());
        assert!(!AuthState::Pending.is_admitted());
        assert!(!AuthState::Rejected.is_admitted());
    }
}
