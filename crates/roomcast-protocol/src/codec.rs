//! Codec for roomcast frames.
//!
//! Client frames travel as JSON text. Events crossing the shared broker are
//! wrapped in a [`BusEnvelope`] and encoded with MessagePack.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::frames::{client_types, ClientFrame, RoomId, ServerEvent};

/// Maximum inbound client frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {1}")]
    FrameTooLarge(usize, usize),

    /// Frame is not a `{type, data}` object.
    #[error("Malformed frame: {0}")]
    Malformed(&'static str),

    /// Frame type is not one the server accepts.
    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    /// Frame data does not match its type.
    #[error("Invalid payload for {0}: {1}")]
    InvalidPayload(String, String),

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl ProtocolError {
    /// Wire error code reported to clients.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::FrameTooLarge(..) => "FRAME_TOO_LARGE",
            ProtocolError::UnknownType(_) => "UNKNOWN_TYPE",
            _ => "INVALID_INPUT",
        }
    }
}

/// Decode a client frame from JSON text.
///
/// Shape is checked before the payload: `type` must be a string and `data`
/// must be present, otherwise the frame is rejected as malformed.
///
/// # Errors
///
/// Returns an error if the frame is too large, malformed, of an unknown type,
/// or carries data that does not match its type.
pub fn decode_client(text: &str, max_size: usize) -> Result<ClientFrame, ProtocolError> {
    if text.len() > max_size {
        return Err(ProtocolError::FrameTooLarge(text.len(), max_size));
    }

    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| ProtocolError::Malformed("not valid JSON"))?;

    let object = value
        .as_object()
        .ok_or(ProtocolError::Malformed("frame must be an object"))?;

    let kind = object
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::Malformed("type must be a string"))?;

    match object.get("data") {
        None | Some(serde_json::Value::Null) => {
            return Err(ProtocolError::Malformed("data is required"));
        }
        Some(_) => {}
    }

    if !client_types::ALL.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }

    let kind = kind.to_string();
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload(kind, e.to_string()))
}

/// Encode a server event as JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_event(event: &ServerEvent) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

/// An event in transit between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    /// Unique publication id.
    pub id: Uuid,
    /// Node that published the event.
    pub origin: String,
    /// Room channel the event was published on.
    pub room_id: RoomId,
    /// Publication time in milliseconds since the epoch.
    pub published_at: i64,
    /// The event itself.
    pub event: ServerEvent,
}

impl BusEnvelope {
    /// Wrap an event for publication.
    #[must_use]
    pub fn new(origin: impl Into<String>, room_id: RoomId, event: ServerEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin: origin.into(),
            room_id,
            published_at: chrono::Utc::now().timestamp_millis(),
            event,
        }
    }
}

/// Encode an envelope for the broker.
///
/// # Errors
///
/// Returns an error if MessagePack encoding fails.
pub fn encode_envelope(envelope: &BusEnvelope) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(rmp_serde::to_vec_named(envelope)?))
}

/// Decode an envelope received from the broker.
///
/// # Errors
///
/// Returns an error if the bytes are not a valid envelope.
pub fn decode_envelope(data: &[u8]) -> Result<BusEnvelope, ProtocolError> {
    Ok(rmp_serde::from_slice(data)?)
}
