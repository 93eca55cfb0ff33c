//! Message Router
//!
//! Typed dispatch of decoded orchestrator envelopes into the session's
//! state: the conversation store, the usage aggregator, and the tool
//! invocation frames. Every arm is explicit; anything the router cannot
//! attribute is logged and dropped, never a crash and never a silent
//! overwrite.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use crew_protocol::{CorrelationId, Envelope, LocalId, Role, ServerEnvelope};

use crate::conversation::{ConversationStore, MessageRecord};
use crate::usage::UsageAggregator;

/// Lifecycle record of one tool call, start through result.
#[derive(Debug, Clone)]
pub struct ToolInvocationFrame {
    pub correlation_id: CorrelationId,
    pub name: String,
    pub input: Value,
    pub status: ToolStatus,
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Pending,
    Completed,
}

/// Tool frames keyed by orchestrator-issued correlation id.
///
/// The orchestrator executes tools serially, so at most one frame is
/// Pending at a time. That is an enforced invariant here: a second
/// `tool_start` while one is Pending is logged as a protocol anomaly and
/// tracked alongside the first — never overwritten.
#[derive(Default)]
pub struct ToolFrames {
    frames: HashMap<CorrelationId, ToolInvocationFrame>,
    /// Pending ids in start order. Holds at most one entry when the
    /// orchestrator honors serial execution.
    pending: Vec<CorrelationId>,
}

impl ToolFrames {
    /// Open a frame for a starting tool call. Returns a snapshot for the
    /// caller's event, or `None` when the start had to be dropped.
    pub fn start(
        &mut self,
        correlation_id: Option<CorrelationId>,
        name: String,
        input: Value,
    ) -> Option<ToolInvocationFrame> {
        let correlation_id = correlation_id.unwrap_or_else(|| {
            debug!(tool = %name, "tool_start without correlation id, synthesizing one");
            CorrelationId::generate()
        });

        if self.frames.contains_key(&correlation_id) {
            warn!(
                correlation_id = %correlation_id,
                tool = %name,
                "duplicate tool_start for an existing frame, dropping"
            );
            return None;
        }
        if let Some(open) = self.pending.first() {
            warn!(
                pending = %open,
                starting = %correlation_id,
                "tool_start while another tool is pending (serial execution violated)"
            );
        }

        let frame = ToolInvocationFrame {
            correlation_id: correlation_id.clone(),
            name,
            input,
            status: ToolStatus::Pending,
            output: None,
        };
        self.pending.push(correlation_id.clone());
        self.frames.insert(correlation_id, frame.clone());
        Some(frame)
    }

    /// Finalize the frame a result belongs to: by correlation id when the
    /// envelope carries one, else the sole Pending frame. Returns the
    /// completed snapshot, or `None` when the result could not be
    /// attributed (logged and dropped).
    pub fn complete(
        &mut self,
        correlation_id: Option<&CorrelationId>,
        output: Value,
    ) -> Option<ToolInvocationFrame> {
        let id = match correlation_id {
            Some(id) => id.clone(),
            None => match self.pending.as_slice() {
                [only] => only.clone(),
                [] => {
                    warn!("tool result with no pending frame, dropping");
                    return None;
                }
                _ => {
                    warn!(
                        pending = self.pending.len(),
                        "uncorrelated tool result with several pending frames, dropping"
                    );
                    return None;
                }
            },
        };

        let Some(frame) = self.frames.get_mut(&id) else {
            warn!(correlation_id = %id, "tool result for an unknown frame, dropping");
            return None;
        };
        if frame.status == ToolStatus::Completed {
            warn!(correlation_id = %id, "repeat tool result for a completed frame, dropping");
            return None;
        }

        frame.status = ToolStatus::Completed;
        frame.output = Some(output);
        self.pending.retain(|p| *p != id);
        Some(frame.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn get(&self, correlation_id: &CorrelationId) -> Option<&ToolInvocationFrame> {
        self.frames.get(correlation_id)
    }
}

/// Events surfaced to the caller (the UI layer).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The channel is open (first connect or any reconnect).
    Connected,
    /// Lost the wire; reconnect number `attempt` is scheduled.
    Reconnecting { attempt: u32 },
    /// Reconnect budget exhausted — restart the session.
    ConnectionLost,
    /// Clean channel shutdown.
    Closed,
    /// A send was rejected (outbound queue at capacity).
    SendRejected { reason: String },

    /// Transient orchestrator status line.
    System { content: String },
    /// A tool call began.
    ToolStarted { frame: ToolInvocationFrame },
    /// A tool call finished.
    ToolCompleted { frame: ToolInvocationFrame },
    /// The agent's reply was appended to the history; the turn is over.
    AgentFinished { record: MessageRecord },
    /// A relayed message from another crew member.
    CrewMessage { sender: String, content: String },
    /// The orchestrator confirmed an edit's truncation.
    EditAcknowledged { local_id: Option<LocalId> },
    /// Orchestrator-declared failure: distinct, non-fatal.
    OrchestratorError { message: String },
    /// Terminal acknowledgment of a cancel request.
    Cancelled,
}

/// Dispatches decoded envelopes into session state.
#[derive(Default)]
pub struct Router {
    frames: ToolFrames,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &ToolFrames {
        &self.frames
    }

    /// Dispatch one envelope, mutating the store and aggregator. Returns
    /// the event to surface, or `None` when the envelope was absorbed
    /// (anomalies are logged inside).
    pub fn dispatch(
        &mut self,
        envelope: Envelope<ServerEnvelope>,
        store: &mut ConversationStore,
        usage: &mut UsageAggregator,
    ) -> Option<SessionEvent> {
        let correlation_id = envelope.correlation_id;
        match envelope.payload {
            // the transport consumes pongs; one here means a bug upstream
            ServerEnvelope::Pong => {
                debug!("stray pong reached the router");
                None
            }

            ServerEnvelope::SystemMessage { content } => Some(SessionEvent::System { content }),

            ServerEnvelope::ToolStart { name, input } => self
                .frames
                .start(correlation_id, name, input)
                .map(|frame| SessionEvent::ToolStarted { frame }),

            ServerEnvelope::ToolEnd { output } | ServerEnvelope::ToolResult { output } => {
                let frame = self.frames.complete(correlation_id.as_ref(), output)?;
                // the result payload carries the sub-invocation's usage
                usage.absorb_result(frame.output.as_ref().unwrap_or(&Value::Null));
                Some(SessionEvent::ToolCompleted { frame })
            }

            ServerEnvelope::AgentFinish {
                content,
                backend_id,
                user_backend_id,
                usage: turn_usage,
            } => {
                if let Some(user_backend_id) = user_backend_id {
                    if store.acknowledge_latest(Role::User, user_backend_id).is_none() {
                        warn!("agent_finish acknowledged a user message but none is unacked");
                    }
                }

                let local_id = store.append(Role::Agent, content);
                if let Some(backend_id) = backend_id {
                    if let Err(e) = store.acknowledge(local_id, backend_id) {
                        warn!(error = %e, "could not attach backend id to agent record");
                    }
                }
                if let Some(turn_usage) = turn_usage {
                    usage.absorb_counter(turn_usage);
                }

                store
                    .get(local_id)
                    .cloned()
                    .map(|record| SessionEvent::AgentFinished { record })
            }

            ServerEnvelope::EditAck { backend_id } => {
                let local_id = backend_id
                    .and_then(|backend_id| store.acknowledge_latest(Role::User, backend_id));
                Some(SessionEvent::EditAcknowledged { local_id })
            }

            ServerEnvelope::CrewMessage { sender, content } => {
                Some(SessionEvent::CrewMessage { sender, content })
            }

            // never mutates the conversation store
            ServerEnvelope::Error { message } => {
                Some(SessionEvent::OrchestratorError { message })
            }

            ServerEnvelope::Cancelled => Some(SessionEvent::Cancelled),
        }
    }
}
