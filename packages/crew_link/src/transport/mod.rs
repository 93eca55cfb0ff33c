//! Transport Channel
//!
//! Owns the connection lifecycle for one session: the explicit state
//! machine, heartbeat/liveness detection, capped-backoff reconnection, and
//! the FIFO queue of envelopes awaiting transmission while disconnected.

pub mod channel;
pub mod outbound_queue;
pub mod state;
pub mod ws;

pub use channel::{ChannelEvent, ChannelHandle, TransportChannel};
pub use outbound_queue::OutboundQueue;
pub use state::{CloseReason, ConnState, Connection, ReconnectPolicy};
pub use ws::{Dialer, WireConn, WireEvent, WsDialer};
