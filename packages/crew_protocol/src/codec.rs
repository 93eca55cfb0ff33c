//! Frame codec: JSON text frames with forward-compatible decoding.
//!
//! Decoding is two-step: peek at the `type` tag, then parse the typed
//! envelope. A frame with an unrecognized tag yields
//! [`ProtocolError::UnknownType`] so the caller can log the tag and drop
//! the frame; a recognized tag with a bad payload yields
//! [`ProtocolError::MalformedPayload`]. Neither is ever a crash.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::envelope::{ClientEnvelope, Envelope, ServerEnvelope};
use crate::error::ProtocolError;

/// Maximum frame size (1 MiB). Larger frames are rejected.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Tags this client understands on inbound (orchestrator → client) frames.
const SERVER_TYPES: &[&str] = &[
    "pong",
    "system_message",
    "tool_start",
    "tool_end",
    "tool_result",
    "agent_finish",
    "edit_ack",
    "crew_message",
    "error",
    "cancelled",
];

/// Tags an orchestrator understands on outbound (client → orchestrator) frames.
const CLIENT_TYPES: &[&str] = &["ping", "user_message", "edit", "cancel"];

/// Serialize an envelope to its wire frame.
pub fn encode<T: Serialize>(envelope: &Envelope<T>) -> Result<String, ProtocolError> {
    let frame = serde_json::to_string(envelope)?;
    if frame.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::Oversized {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(frame)
}

/// Decode an orchestrator → client frame.
pub fn decode_server(frame: &str) -> Result<Envelope<ServerEnvelope>, ProtocolError> {
    decode_with(frame, SERVER_TYPES)
}

/// Decode a client → orchestrator frame (used by orchestrator-side tooling
/// and the test harness).
pub fn decode_client(frame: &str) -> Result<Envelope<ClientEnvelope>, ProtocolError> {
    decode_with(frame, CLIENT_TYPES)
}

fn decode_with<T: DeserializeOwned>(
    frame: &str,
    recognized: &[&str],
) -> Result<Envelope<T>, ProtocolError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::Oversized {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let value: serde_json::Value = serde_json::from_str(frame)?;
    let type_tag = match value.get("type").and_then(|t| t.as_str()) {
        Some(tag) => tag.to_string(),
        None => return Err(ProtocolError::MissingType),
    };

    if !recognized.contains(&type_tag.as_str()) {
        return Err(ProtocolError::UnknownType { type_tag });
    }

    serde_json::from_value(value)
        .map_err(|source| ProtocolError::MalformedPayload { type_tag, source })
}
