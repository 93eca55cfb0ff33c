//! # Crew Protocol
//!
//! Wire protocol shared by the crew session client and anything that speaks
//! to a crew orchestrator: typed envelopes, the outbound application
//! request, and the usage-accounting payload contract.
//!
//! Every frame on the wire is a JSON object with a mandatory `type`
//! discriminator. Messages are split by direction — [`ClientEnvelope`] for
//! client → orchestrator, [`ServerEnvelope`] for orchestrator → client —
//! and wrapped in an [`Envelope`] carrying the session id and an optional
//! correlation id.
//!
//! Decoding is forward-compatible: an unrecognized `type` or a malformed
//! payload is a typed [`ProtocolError`] the caller can log and drop, never
//! a crash.
//!
//! ```rust
//! use crew_protocol::{codec, ClientEnvelope, Envelope, SessionId};
//!
//! let ping = Envelope::new(SessionId::from("s-1"), ClientEnvelope::Ping);
//! let frame = codec::encode(&ping).unwrap();
//! assert!(frame.contains("\"type\":\"ping\""));
//! ```

pub mod codec;
pub mod envelope;
pub mod error;
pub mod types;

pub use envelope::{ClientEnvelope, Envelope, ServerEnvelope};
pub use error::ProtocolError;
pub use types::{
    AgentRequest, BackendId, ClientId, CorrelationId, LocalId, RequestTarget, Role, SessionId,
    UsageCounter,
};
