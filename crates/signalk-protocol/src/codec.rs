//! WebSocket message codec for the SignalK stream.
//!
//! SignalK uses JSON messages over WebSocket text frames.

use crate::messages::{ClientMessage, ServerMessage};
use thiserror::Error;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Received binary frame instead of text.
    #[error("Expected text frame, received binary")]
    BinaryFrame,

    /// Valid JSON that is neither a hello nor a delta.
    #[error("Unknown message type")]
    UnknownMessage,
}

/// Encode a client message for transmission.
pub fn encode_client_message(msg: &ClientMessage) -> Result<String, CodecError> {
    serde_json::to_string(msg).map_err(CodecError::from)
}

/// Decode a message received from a server.
pub fn decode_server_message(text: &str) -> Result<ServerMessage, CodecError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    serde_json::from_value(value).map_err(|_| CodecError::UnknownMessage)
}

/// Quick check whether a text frame looks like a delta, without full parsing.
pub fn is_delta_message(text: &str) -> bool {
    text.contains("\"updates\"")
}
