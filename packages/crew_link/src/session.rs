//! Session facade: one conversation wired to one transport channel.
//!
//! The caller (a UI layer) drives a `Session` from a single logical
//! thread: submit with [`Session::send_message`] / [`Session::edit_message`],
//! pump with [`Session::next_event`]. All state mutation happens inside
//! these calls — there is no locking anywhere in the session.

use tokio::sync::mpsc;
use tracing::warn;

use crew_protocol::{
    AgentRequest, ClientEnvelope, ClientId, Envelope, LocalId, RequestTarget, Role, SessionId,
    UsageCounter,
};

use crate::config::ChannelConfig;
use crate::conversation::{ConversationStore, MessageRecord, PersistedRecord};
use crate::dispatch::{Router, SessionEvent};
use crate::error::SessionError;
use crate::transport::channel::{ChannelEvent, ChannelHandle, TransportChannel};
use crate::transport::ws::Dialer;
use crate::usage::UsageAggregator;

/// Identity and addressing for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_id: SessionId,
    pub client_id: ClientId,
    /// The agent or crew every request is addressed to.
    pub target: RequestTarget,
    /// Optional model override forwarded with every request.
    pub model: Option<String>,
}

pub struct Session {
    session_id: SessionId,
    client_id: ClientId,
    target: RequestTarget,
    model: Option<String>,
    store: ConversationStore,
    usage: UsageAggregator,
    router: Router,
    channel: ChannelHandle,
    events: mpsc::Receiver<ChannelEvent>,
    input_enabled: bool,
    /// Set between a cancel request and its terminal envelope; streamed
    /// turn updates are not rendered in that window.
    cancel_requested: bool,
}

impl Session {
    /// Create the session and spawn its transport driver. The channel
    /// starts connecting immediately.
    pub fn connect(
        config: SessionConfig,
        channel_config: ChannelConfig,
        dialer: Box<dyn Dialer>,
    ) -> Self {
        let (driver, channel, events) =
            TransportChannel::new(config.session_id.clone(), channel_config, dialer);
        tokio::spawn(driver.run());

        Self {
            session_id: config.session_id,
            client_id: config.client_id,
            target: config.target,
            model: config.model,
            store: ConversationStore::new(),
            usage: UsageAggregator::new(),
            router: Router::new(),
            channel,
            events,
            input_enabled: true,
            cancel_requested: false,
        }
    }

    /// Populate the history from persisted storage. Call once, on session
    /// open, before the first send.
    pub fn hydrate(&mut self, records: Vec<PersistedRecord>) {
        self.store.load_history(records);
    }

    /// Submit a user message: appended locally, then sent (or queued while
    /// disconnected). Input stays disabled until the turn finishes.
    pub async fn send_message(&mut self, text: &str) -> Result<LocalId, SessionError> {
        if !self.input_enabled {
            return Err(SessionError::TurnInProgress);
        }

        let local_id = self.store.append(Role::User, text);
        let request = self.request(text, false);
        self.channel
            .send(Envelope::new(
                self.session_id.clone(),
                ClientEnvelope::UserMessage { request },
            ))
            .await?;
        self.input_enabled = false;
        Ok(local_id)
    }

    /// Prior content of a record, for compose-buffer repopulation before an
    /// edit. Mutates nothing.
    pub fn begin_edit(&self, local_id: LocalId) -> Result<&str, SessionError> {
        let record = self
            .store
            .get(local_id)
            .ok_or(crate::conversation::ConversationError::UnknownLocalId(
                local_id,
            ))?;
        Ok(&record.content)
    }

    /// Edit a message: atomically truncate it and everything after it,
    /// append the replacement, and tell the orchestrator to discard the
    /// same suffix before regenerating. Externally this is one atomic
    /// replacement — the store never holds both old and new.
    pub async fn edit_message(
        &mut self,
        local_id: LocalId,
        new_content: &str,
    ) -> Result<LocalId, SessionError> {
        if !self.input_enabled {
            return Err(SessionError::TurnInProgress);
        }

        let truncation = self.store.truncate_from(local_id)?;
        let discarded = truncation.backend_ids();
        let replacement = self.store.append(Role::User, new_content);

        let request = self.request(new_content, true);
        self.channel
            .send(Envelope::new(
                self.session_id.clone(),
                ClientEnvelope::Edit { request, discarded },
            ))
            .await?;
        self.input_enabled = false;
        Ok(replacement)
    }

    /// Ask the orchestrator to cooperatively stop the in-flight turn. The
    /// turn ends when the terminal `cancelled` envelope arrives.
    pub async fn cancel(&mut self) -> Result<(), SessionError> {
        self.channel
            .send(Envelope::new(
                self.session_id.clone(),
                ClientEnvelope::Cancel,
            ))
            .await?;
        self.cancel_requested = true;
        Ok(())
    }

    /// Close the channel. Terminal — no reconnection.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.channel.close().await?;
        Ok(())
    }

    /// Pump the next event. Returns `None` once the channel has shut down
    /// and its event stream is drained.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            let event = match self.events.recv().await? {
                ChannelEvent::Opened => SessionEvent::Connected,
                ChannelEvent::Reconnecting { attempt, .. } => {
                    SessionEvent::Reconnecting { attempt }
                }
                ChannelEvent::Lost => SessionEvent::ConnectionLost,
                ChannelEvent::Closed => SessionEvent::Closed,
                ChannelEvent::SendRejected(e) => SessionEvent::SendRejected {
                    reason: e.to_string(),
                },
                ChannelEvent::Inbound(envelope) => {
                    match self
                        .router
                        .dispatch(envelope, &mut self.store, &mut self.usage)
                    {
                        Some(event) if self.suppressed_by_cancel(&event) => continue,
                        Some(event) => event,
                        // absorbed (anomaly logged); keep pumping
                        None => continue,
                    }
                }
            };
            self.apply_turn_gating(&event);
            return Some(event);
        }
    }

    /// Aggregated usage for the session root.
    pub fn usage(&self) -> UsageCounter {
        self.usage.total()
    }

    pub fn history(&self) -> &[MessageRecord] {
        self.store.records()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Whether a new send would be accepted right now.
    pub fn input_enabled(&self) -> bool {
        self.input_enabled
    }

    /// Between a cancel request and the turn's terminal envelope, streamed
    /// updates for the cancelled turn are dropped. Terminal events
    /// (`cancelled`, or `agent_finish`/`error` when the cancel raced the
    /// turn's end) always pass.
    fn suppressed_by_cancel(&self, event: &SessionEvent) -> bool {
        self.cancel_requested
            && matches!(
                event,
                SessionEvent::System { .. }
                    | SessionEvent::ToolStarted { .. }
                    | SessionEvent::ToolCompleted { .. }
                    | SessionEvent::CrewMessage { .. }
            )
    }

    fn apply_turn_gating(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::AgentFinished { .. }
            | SessionEvent::Cancelled
            | SessionEvent::OrchestratorError { .. } => {
                self.input_enabled = true;
                self.cancel_requested = false;
            }
            SessionEvent::ConnectionLost => {
                // the session is unusable; surface but keep input disabled
                warn!(session = %self.session_id, "session lost its connection permanently");
                self.input_enabled = false;
            }
            _ => {}
        }
    }

    fn request(&self, message: &str, is_edit: bool) -> AgentRequest {
        AgentRequest {
            message: message.to_string(),
            target: self.target.clone(),
            model: self.model.clone(),
            client_id: self.client_id.clone(),
            is_edit,
        }
    }
}
