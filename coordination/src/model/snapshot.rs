//! Persisted stream snapshot
//!
//! The authoritative record of a round's progress as stored by the
//! persistence layer. Field names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{MessageId, MessageStatus, ParticipantId, ThreadId};

/// A participant message as captured in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMessage {
    pub id: MessageId,
    pub participant_id: ParticipantId,
    pub round: u32,
    #[serde(default)]
    pub content: String,
    pub status: MessageStatus,
}

/// Persisted progress of one streaming round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSnapshot {
    pub stream_id: String,
    pub thread_id: ThreadId,
    /// Signed on the wire so malformed negative rounds can be rejected
    pub round: i64,
    pub current_participant_index: usize,
    #[serde(default)]
    pub completed_participant_ids: Vec<ParticipantId>,
    #[serde(default)]
    pub pending_participant_ids: Vec<ParticipantId>,
    #[serde(default)]
    pub pre_search_complete: bool,
    #[serde(default)]
    pub analysis_complete: bool,
    #[serde(default)]
    pub messages: Vec<SnapshotMessage>,
    pub last_event_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StreamSnapshot {
    pub fn new(stream_id: impl Into<String>, thread_id: impl Into<ThreadId>, round: u32) -> Self {
        Self {
            stream_id: stream_id.into(),
            thread_id: thread_id.into(),
            round: round as i64,
            current_participant_index: 0,
            completed_participant_ids: Vec::new(),
            pending_participant_ids: Vec::new(),
            pre_search_complete: false,
            analysis_complete: false,
            messages: Vec::new(),
            last_event_id: None,
            updated_at: Utc::now(),
        }
    }

    /// Round as an unsigned number, `None` when negative
    pub fn round_number(&self) -> Option<u32> {
        u32::try_from(self.round).ok()
    }

    /// Age relative to `now`
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.updated_at
    }
}
