//! Resumption result types

use serde::{Deserialize, Serialize};

use crate::error::RoundError;
use crate::model::{MessageStatus, ParticipantId, SnapshotMessage, StreamSnapshot};
use crate::store::ConversationStore;

/// How a snapshot was used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Snapshot taken verbatim
    Full,
    /// Snapshot merged with further local progress
    Partial,
    /// Nothing usable; the round starts over
    Restart,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Partial => write!(f, "partial"),
            Self::Restart => write!(f, "restart"),
        }
    }
}

/// What the client still holds for the interrupted round
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRoundState {
    pub completed_participant_ids: Vec<ParticipantId>,
    pub messages: Vec<SnapshotMessage>,
}

impl LocalRoundState {
    /// Capture the participant progress `store` holds for `round`
    ///
    /// A participant counts as completed once its message is final,
    /// errored turns included.
    pub fn from_store(store: &ConversationStore, round: u32) -> Self {
        let mut local = Self::default();
        for message in store.participant_messages(round) {
            let Some(participant_id) = message.participant_id.clone() else {
                continue;
            };
            if message.status.is_final() && !local.completed_participant_ids.contains(&participant_id) {
                local.completed_participant_ids.push(participant_id.clone());
            }
            local.messages.push(SnapshotMessage {
                id: message.id.clone(),
                participant_id,
                round,
                content: message.text(),
                status: message.status,
            });
        }
        local
    }

    pub fn completed_count(&self) -> usize {
        self.completed_participant_ids.len()
    }

    pub fn with_completed(mut self, participant_id: impl Into<ParticipantId>) -> Self {
        self.completed_participant_ids.push(participant_id.into());
        self
    }

    pub fn with_message(
        mut self,
        id: impl Into<String>,
        participant_id: impl Into<ParticipantId>,
        round: u32,
        content: impl Into<String>,
    ) -> Self {
        self.messages.push(SnapshotMessage {
            id: id.into(),
            participant_id: participant_id.into(),
            round,
            content: content.into(),
            status: MessageStatus::Complete,
        });
        self
    }
}

/// Outcome of a resumption attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumptionResult {
    pub success: bool,
    pub recovery_strategy: RecoveryStrategy,
    /// Recovered round state; `None` on failure
    pub state: Option<StreamSnapshot>,
    #[serde(skip)]
    pub error: Option<RoundError>,
}

impl ResumptionResult {
    pub fn full(state: StreamSnapshot) -> Self {
        Self {
            success: true,
            recovery_strategy: RecoveryStrategy::Full,
            state: Some(state),
            error: None,
        }
    }

    pub fn partial(state: StreamSnapshot) -> Self {
        Self {
            success: true,
            recovery_strategy: RecoveryStrategy::Partial,
            state: Some(state),
            error: None,
        }
    }

    /// Failed attempt: the collaborator must restart the round
    pub fn needs_restart(error: RoundError) -> Self {
        Self {
            success: false,
            recovery_strategy: RecoveryStrategy::Restart,
            state: None,
            error: Some(error),
        }
    }

    /// Whether retrying the fetch may still help
    pub fn is_retryable(&self) -> bool {
        !self.success && self.error.as_ref().is_some_and(RoundError::is_retryable)
    }
}
