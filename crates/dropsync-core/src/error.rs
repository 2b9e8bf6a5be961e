use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("stream is not open")]
    StreamNotOpen,

    #[error("transport is closed")]
    Closed,

    #[error("operation not valid in signaling state {0:?}")]
    InvalidState(crate::transport::SignalingState),

    #[error("unparseable session description: {0}")]
    BadDescription(String),

    #[error("unknown peer endpoint: {0}")]
    UnknownEndpoint(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session engine is no longer running")]
    Closed,
}
