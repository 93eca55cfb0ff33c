//! Identifier newtypes, roles, the outbound application request, and the
//! usage-accounting payload contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One logical conversation, scoped to exactly one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

/// Client-side identity attached to every outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

/// Orchestrator-issued id correlating a tool start with its result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

/// Backend-assigned id of a persisted message record. Immutable once set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(SessionId);
string_id!(ClientId);
string_id!(CorrelationId);
string_id!(BackendId);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl ClientId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl CorrelationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Client-assigned ordinal of a message record. Never reused within a
/// session; assignment is owned by the conversation store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Author of a message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
    Tool,
}

/// Which backend entity a request is addressed to. Serializes flat as
/// either `"agent_id": …` or `"crew_id": …` — exactly one is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestTarget {
    #[serde(rename = "agent_id")]
    Agent(String),
    #[serde(rename = "crew_id")]
    Crew(String),
}

/// Client → orchestrator application request.
///
/// The `is_edit` flag tells the orchestrator this request replaces a
/// truncated conversation suffix; it must discard its own memory of that
/// suffix before regenerating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub message: String,
    #[serde(flatten)]
    pub target: RequestTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub client_id: ClientId,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_edit: bool,
}

/// Token counts for one node of the invocation tree.
///
/// A counter is a plain value: [`UsageCounter::merge`] consumes both sides
/// and returns the sum, so a contribution can only enter a total by being
/// merged in — there is no hook to fire twice.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl UsageCounter {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Functional merge: `a.merge(b)` is the per-field sum.
    #[must_use]
    pub fn merge(self, other: UsageCounter) -> UsageCounter {
        UsageCounter {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }

    /// Extract the mandatory `usage` side-channel field from a
    /// sub-invocation's structured result payload.
    ///
    /// Returns `None` when the field is missing or does not parse; the
    /// caller degrades that contribution to zero and logs it.
    pub fn from_result_payload(payload: &Value) -> Option<UsageCounter> {
        let usage = payload.get("usage")?;
        serde_json::from_value(usage.clone()).ok()
    }
}
