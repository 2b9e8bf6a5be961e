use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frames carried on the `signaling` control stream, UTF-8 JSON.
///
/// Admission must complete before `chat` traffic is accepted; anything other
/// than the auth kinds arriving on an un-admitted stream is discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    /// Sent at stream-open by a side with no password configured.
    AuthSkip,

    /// Initiator's 32 random bytes, base64.
    AuthChallenge { challenge: String },

    /// Responder echoes the challenge and signs it; both base64.
    AuthResponse { challenge: String, signature: String },

    /// Initiator's verdict: admitted.
    AuthOk,

    /// Either side, immediately before teardown.
    AuthFail,

    /// Post-admission chat message.
    Chat {
        id: Uuid,
        text: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
}

/// JSON framing on a per-file substream. Binary chunk messages interleave
/// between `file-start` and `file-end`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FileFrame {
    FileStart { name: String, size: u64 },
    FileEnd,
    TransferCancelled,
}
