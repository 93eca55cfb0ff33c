//! Typed wire envelopes, split by direction.
//!
//! Both enums are internally tagged on `type` with snake_case tags, so the
//! wire form of e.g. a tool start is
//! `{"session_id":…,"correlation_id":…,"type":"tool_start","name":…,"input":…}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{AgentRequest, BackendId, CorrelationId, SessionId, UsageCounter};

/// One typed unit of wire communication. Immutable once sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(flatten)]
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(session_id: SessionId, payload: T) -> Self {
        Self {
            session_id,
            correlation_id: None,
            payload,
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Messages sent FROM the client TO the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    /// Heartbeat probe; the orchestrator answers with `pong`.
    Ping,

    /// A new user message for the addressed agent or crew.
    UserMessage {
        #[serde(flatten)]
        request: AgentRequest,
    },

    /// Replace a truncated conversation suffix. `discarded` lists the
    /// backend ids the orchestrator must forget before regenerating, so
    /// both histories stay in bijection.
    Edit {
        #[serde(flatten)]
        request: AgentRequest,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        discarded: Vec<BackendId>,
    },

    /// Ask the orchestrator to cooperatively stop the in-flight turn.
    /// The terminal answer is a `cancelled` envelope.
    Cancel,
}

/// Messages sent FROM the orchestrator TO the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    /// Heartbeat reply.
    Pong,

    /// Transient status line (e.g. "crew started"). Display-only; never
    /// enters the conversation history.
    SystemMessage { content: String },

    /// A tool invocation began. The envelope's correlation id keys the
    /// frame until the matching result arrives.
    ToolStart {
        name: String,
        #[serde(default)]
        input: Value,
    },

    /// Tool finished; `output` is the structured result payload and
    /// carries the mandatory `usage` side-channel field.
    ToolEnd {
        #[serde(default)]
        output: Value,
    },

    /// Synonym of `tool_end` kept for orchestrators that emit it.
    ToolResult {
        #[serde(default)]
        output: Value,
    },

    /// The turn completed: the orchestrator persisted both the initiating
    /// user message (`user_backend_id`) and the agent reply (`backend_id`).
    AgentFinish {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backend_id: Option<BackendId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_backend_id: Option<BackendId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<UsageCounter>,
    },

    /// The orchestrator discarded its copy of the truncated suffix and
    /// persisted the replacement user message.
    EditAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backend_id: Option<BackendId>,
    },

    /// A message from another crew member, relayed for display.
    CrewMessage { sender: String, content: String },

    /// Orchestrator-declared failure. Non-fatal: rendered as a distinct
    /// message, never mutates history, never closes the connection.
    Error { message: String },

    /// Terminal acknowledgment of a `cancel` request.
    Cancelled,
}

impl ServerEnvelope {
    /// The wire tag for this payload, for logging.
    pub fn type_tag(&self) -> &'static str {
        match self {
            ServerEnvelope::Pong => "pong",
            ServerEnvelope::SystemMessage { .. } => "system_message",
            ServerEnvelope::ToolStart { .. } => "tool_start",
            ServerEnvelope::ToolEnd { .. } => "tool_end",
            ServerEnvelope::ToolResult { .. } => "tool_result",
            ServerEnvelope::AgentFinish { .. } => "agent_finish",
            ServerEnvelope::EditAck { .. } => "edit_ack",
            ServerEnvelope::CrewMessage { .. } => "crew_message",
            ServerEnvelope::Error { .. } => "error",
            ServerEnvelope::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientId, RequestTarget};

    #[test]
    fn ping_envelope_wire_shape() {
        let env = Envelope::new(SessionId::from("s-1"), ClientEnvelope::Ping);
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["session_id"], "s-1");
        assert_eq!(v["type"], "ping");
        assert!(v.get("correlation_id").is_none());
    }

    #[test]
    fn user_message_flattens_request() {
        let env = Envelope::new(
            SessionId::from("s-1"),
            ClientEnvelope::UserMessage {
                request: AgentRequest {
                    message: "hi".into(),
                    target: RequestTarget::Crew("crew-1".into()),
                    model: None,
                    client_id: ClientId::from("c-1"),
                    is_edit: false,
                },
            },
        );
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "user_message");
        assert_eq!(v["message"], "hi");
        assert_eq!(v["crew_id"], "crew-1");
    }

    #[test]
    fn tool_start_decodes_with_correlation_id() {
        let json = r#"{
            "session_id": "s-1",
            "correlation_id": "tool-42",
            "type": "tool_start",
            "name": "web_search",
            "input": {"query": "rust"}
        }"#;
        let env: Envelope<ServerEnvelope> = serde_json::from_str(json).unwrap();
        assert_eq!(env.correlation_id, Some(CorrelationId::from("tool-42")));
        match env.payload {
            ServerEnvelope::ToolStart { name, input } => {
                assert_eq!(name, "web_search");
                assert_eq!(input["query"], "rust");
            }
            other => panic!("expected tool_start, got {other:?}"),
        }
    }

    #[test]
    fn agent_finish_optional_fields_default() {
        let json = r#"{"session_id":"s-1","type":"agent_finish","content":"done"}"#;
        let env: Envelope<ServerEnvelope> = serde_json::from_str(json).unwrap();
        match env.payload {
            ServerEnvelope::AgentFinish {
                content,
                backend_id,
                user_backend_id,
                usage,
            } => {
                assert_eq!(content, "done");
                assert!(backend_id.is_none());
                assert!(user_backend_id.is_none());
                assert!(usage.is_none());
            }
            other => panic!("expected agent_finish, got {other:?}"),
        }
    }

    #[test]
    fn edit_carries_discarded_backend_ids() {
        let env = Envelope::new(
            SessionId::from("s-1"),
            ClientEnvelope::Edit {
                request: AgentRequest {
                    message: "revised".into(),
                    target: RequestTarget::Agent("a-1".into()),
                    model: None,
                    client_id: ClientId::from("c-1"),
                    is_edit: true,
                },
                discarded: vec![BackendId::from("b-3"), BackendId::from("b-4")],
            },
        );
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "edit");
        assert_eq!(v["is_edit"], true);
        assert_eq!(v["discarded"], serde_json::json!(["b-3", "b-4"]));
    }

    #[test]
    fn server_type_tags_match_wire_names() {
        let json = r#"{"session_id":"s","type":"crew_message","sender":"researcher","content":"found it"}"#;
        let env: Envelope<ServerEnvelope> = serde_json::from_str(json).unwrap();
        assert_eq!(env.payload.type_tag(), "crew_message");
    }
}
