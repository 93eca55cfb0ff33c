//! # Crew Link
//!
//! Session client for crew orchestrators: a persistent bidirectional
//! channel with heartbeat and capped-backoff reconnection, ordered
//! effectively-once delivery of outbound envelopes across disconnects, a
//! typed router for streamed tool/agent events, a conversation store with
//! atomic edit/delete truncation, and token-usage aggregation across
//! nested sub-invocations.
//!
//! The entry point is [`Session`]: connect one per conversation, submit
//! with [`Session::send_message`], and pump [`Session::next_event`] to
//! render the stream.
//!
//! ```rust,no_run
//! use crew_link::{ChannelConfig, Session, SessionConfig, WsDialer};
//! use crew_protocol::{ClientId, RequestTarget, SessionId};
//!
//! # async fn run() {
//! let mut session = Session::connect(
//!     SessionConfig {
//!         session_id: SessionId::generate(),
//!         client_id: ClientId::generate(),
//!         target: RequestTarget::Crew("research-crew".into()),
//!         model: None,
//!     },
//!     ChannelConfig::default(),
//!     Box::new(WsDialer::new("ws://127.0.0.1:8700")),
//! );
//!
//! session.send_message("summarize today's findings").await.unwrap();
//! while let Some(event) = session.next_event().await {
//!     println!("{event:?}");
//! }
//! # }
//! ```

pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod session;
pub mod transport;
pub mod usage;

#[cfg(test)]
mod e2e_tests;

pub use config::{ChannelConfig, FileConfig, load_config};
pub use conversation::{ConversationStore, MessageRecord, PersistedRecord, Truncation};
pub use dispatch::{Router, SessionEvent, ToolInvocationFrame, ToolStatus};
pub use error::{SessionError, TransportError};
pub use session::{Session, SessionConfig};
pub use transport::{ChannelEvent, ChannelHandle, Dialer, TransportChannel, WsDialer};
pub use usage::UsageAggregator;
