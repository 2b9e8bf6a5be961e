//! JSON framing for the control stream and the per-file substreams.

use tracing::warn;

use dropsync_types::{ControlFrame, FileFrame};

use crate::error::TransportError;
use crate::transport::{StreamMessage, StreamSender};

pub(crate) fn send_control(
    sender: &StreamSender,
    frame: &ControlFrame,
) -> Result<(), TransportError> {
    let text = serde_json::to_string(frame).unwrap();
    sender.send(StreamMessage::Text(text))
}

pub(crate) fn send_file_frame(
    sender: &StreamSender,
    frame: &FileFrame,
) -> Result<(), TransportError> {
    let text = serde_json::to_string(frame).unwrap();
    sender.send(StreamMessage::Text(text))
}

pub(crate) fn parse_control(text: &str) -> Option<ControlFrame> {
    match serde_json::from_str(text) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("discarding undecodable control frame: {e}");
            None
        }
    }
}

pub(crate) fn parse_file_frame(text: &str) -> Option<FileFrame> {
    match serde_json::from_str(text) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("discarding undecodable file frame: {e}");
            None
        }
    }
}
