//! Protocol error types.

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame's `type` tag is not one this client understands.
    /// Callers log the tag and drop the frame.
    #[error("unrecognized envelope type: {type_tag}")]
    UnknownType { type_tag: String },

    /// The frame carried a recognized `type` tag but a payload that does
    /// not match it.
    #[error("malformed `{type_tag}` payload: {source}")]
    MalformedPayload {
        type_tag: String,
        #[source]
        source: serde_json::Error,
    },

    /// The frame had no `type` tag at all.
    #[error("frame missing `type` tag")]
    MissingType,

    /// The frame is not valid JSON.
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),

    /// The frame exceeds [`crate::codec::MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {max})")]
    Oversized { size: usize, max: usize },
}

impl ProtocolError {
    /// The offending `type` tag, when the frame got far enough to have one.
    pub fn type_tag(&self) -> Option<&str> {
        match self {
            ProtocolError::UnknownType { type_tag }
            | ProtocolError::MalformedPayload { type_tag, .. } => Some(type_tag),
            _ => None,
        }
    }
}
