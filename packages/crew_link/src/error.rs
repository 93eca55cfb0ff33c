//! Error types for the session client.

use crate::conversation::ConversationError;
use crate::transport::outbound_queue::QueueFull;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Dial failed: refused connection, DNS failure, handshake error.
    #[error("connection failed: {0}")]
    Dial(String),

    /// The driver task is gone. The session must be restarted.
    #[error("transport channel closed")]
    ChannelClosed,

    #[error(transparent)]
    QueueFull(#[from] QueueFull),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Input is disabled until the current turn finishes.
    #[error("a turn is already in progress")]
    TurnInProgress,

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("conversation: {0}")]
    Conversation(#[from] ConversationError),
}
