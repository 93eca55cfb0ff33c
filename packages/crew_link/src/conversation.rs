//! Conversation State Store
//!
//! Ordered, mutable history of message records with truncation support.
//! Local ids are assigned here and never reused within a session; backend
//! ids attach at most once, on acknowledgment. Truncation removes a record
//! and everything after it in a single operation — no observer ever sees a
//! partially-truncated sequence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crew_protocol::{BackendId, LocalId, Role};

/// Prefix length for the duplicate-content comparison. Matching is
/// prefix-based because long messages are compared cheaply, not exactly.
const DUPLICATE_PREFIX_LEN: usize = 200;

/// One entry in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub local_id: LocalId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<BackendId>,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted record as delivered by the external history source on
/// session open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub backend_id: BackendId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversationError {
    #[error("unknown local id {0}")]
    UnknownLocalId(LocalId),

    #[error("record {0} already acknowledged")]
    AlreadyAcknowledged(LocalId),
}

/// The removed suffix of a truncation, oldest first. Non-empty by
/// construction.
#[derive(Debug)]
pub struct Truncation {
    pub removed: Vec<MessageRecord>,
}

impl Truncation {
    /// Backend ids of the removed records, for the orchestrator to discard
    /// the same suffix.
    pub fn backend_ids(&self) -> Vec<BackendId> {
        self.removed
            .iter()
            .filter_map(|r| r.backend_id.clone())
            .collect()
    }

    /// Content of the record the truncation started at, for compose-buffer
    /// repopulation.
    pub fn prior_content(&self) -> &str {
        &self.removed[0].content
    }
}

/// Ordered history of one session's messages.
pub struct ConversationStore {
    records: Vec<MessageRecord>,
    next_local_id: u64,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            next_local_id: 1,
        }
    }

    /// Append a new record at the tail, assigning the next local id.
    ///
    /// Repeated identical user messages are valid, so a suspected duplicate
    /// is only warned about, never rejected.
    pub fn append(&mut self, role: Role, content: impl Into<String>) -> LocalId {
        let content = content.into();
        if let Some(existing) = self.find_duplicate(&content) {
            warn!(
                existing = %existing,
                "new message content matches an existing record"
            );
        }

        let local_id = LocalId(self.next_local_id);
        self.next_local_id += 1;
        self.records.push(MessageRecord {
            local_id,
            backend_id: None,
            role,
            content,
            created_at: Utc::now(),
        });
        local_id
    }

    /// Attach the backend id to a record. At most once: a second
    /// acknowledgment is an error, the stored id stays immutable.
    pub fn acknowledge(
        &mut self,
        local_id: LocalId,
        backend_id: BackendId,
    ) -> Result<(), ConversationError> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.local_id == local_id)
            .ok_or(ConversationError::UnknownLocalId(local_id))?;
        if record.backend_id.is_some() {
            return Err(ConversationError::AlreadyAcknowledged(local_id));
        }
        record.backend_id = Some(backend_id);
        Ok(())
    }

    /// Attach a backend id to the most recent unacknowledged record with
    /// the given role. Returns the record's local id, or `None` (logged)
    /// when nothing is waiting for an acknowledgment.
    pub fn acknowledge_latest(&mut self, role: Role, backend_id: BackendId) -> Option<LocalId> {
        let record = self
            .records
            .iter_mut()
            .rev()
            .find(|r| r.role == role && r.backend_id.is_none())?;
        record.backend_id = Some(backend_id);
        Some(record.local_id)
    }

    /// Remove the record at `local_id` and every record after it, in one
    /// operation. The remaining sequence is a strict prefix of the old one.
    pub fn truncate_from(&mut self, local_id: LocalId) -> Result<Truncation, ConversationError> {
        let pos = self
            .records
            .iter()
            .position(|r| r.local_id == local_id)
            .ok_or(ConversationError::UnknownLocalId(local_id))?;
        let removed = self.records.split_off(pos);
        Ok(Truncation { removed })
    }

    /// Hydrate from persisted storage on session open. Replaces any
    /// existing contents.
    pub fn load_history(&mut self, persisted: Vec<PersistedRecord>) {
        self.records.clear();
        for p in persisted {
            let local_id = LocalId(self.next_local_id);
            self.next_local_id += 1;
            self.records.push(MessageRecord {
                local_id,
                backend_id: Some(p.backend_id),
                role: p.role,
                content: p.content,
                created_at: p.created_at,
            });
        }
    }

    pub fn get(&self, local_id: LocalId) -> Option<&MessageRecord> {
        self.records.iter().find(|r| r.local_id == local_id)
    }

    pub fn records(&self) -> &[MessageRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&MessageRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn find_duplicate(&self, content: &str) -> Option<LocalId> {
        let normalized = normalize_content(content);
        if normalized.is_empty() {
            return None;
        }
        self.records
            .iter()
            .find(|r| normalize_content(&r.content) == normalized)
            .map(|r| r.local_id)
    }
}

/// Normalize content for duplicate comparison: strip carriage returns,
/// trim, take a bounded prefix.
fn normalize_content(content: &str) -> String {
    content
        .replace('\r', "")
        .trim()
        .chars()
        .take(DUPLICATE_PREFIX_LEN)
        .collect()
}
