//! Store change events
//!
//! Every mutation of the conversation store publishes one of these so the
//! sequencer, the renderer and the routing layer can react to specific
//! changes instead of polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{MessageId, MessageRole, MessageStatus, RecordStatus, ThreadId};
use crate::phase::RoundPhase;

/// All conversation store events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// A thread session was opened
    SessionCreated {
        thread_id: ThreadId,
        timestamp: DateTime<Utc>,
    },

    /// The thread session was closed and its state dropped
    SessionDisposed {
        thread_id: ThreadId,
        timestamp: DateTime<Utc>,
    },

    /// Mode, web search or participants changed
    ConfigChanged {
        thread_id: ThreadId,
        web_search_enabled: bool,
        participant_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A message was appended
    MessageAppended {
        message_id: MessageId,
        role: MessageRole,
        round: u32,
        participant_index: Option<usize>,
        status: MessageStatus,
        timestamp: DateTime<Utc>,
    },

    /// Content or status of a message changed in place
    MessageUpdated {
        message_id: MessageId,
        round: u32,
        status: MessageStatus,
        timestamp: DateTime<Utc>,
    },

    /// A message was removed (rollback or regeneration)
    MessageRemoved {
        message_id: MessageId,
        round: u32,
        timestamp: DateTime<Utc>,
    },

    /// The message list was replaced by a server resynchronization
    MessagesSynced {
        count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A pre-search record was created or changed status
    PreSearchChanged {
        round: u32,
        status: RecordStatus,
        timestamp: DateTime<Utc>,
    },

    /// A pre-search record was removed
    PreSearchRemoved {
        round: u32,
        timestamp: DateTime<Utc>,
    },

    /// An analysis record was created or changed status
    AnalysisChanged {
        round: u32,
        status: RecordStatus,
        timestamp: DateTime<Utc>,
    },

    /// An analysis record was removed
    AnalysisRemoved {
        round: u32,
        timestamp: DateTime<Utc>,
    },

    /// Streaming slot acquired or released
    StreamingChanged {
        round: Option<u32>,
        is_streaming: bool,
        timestamp: DateTime<Utc>,
    },

    /// The sequencer moved to another participant
    ParticipantIndexChanged {
        round: u32,
        index: usize,
        timestamp: DateTime<Utc>,
    },

    /// A round reached its structural end
    RoundCompleted {
        round: u32,
        phase: RoundPhase,
        analysis_status: Option<RecordStatus>,
        timestamp: DateTime<Utc>,
    },

    /// A round is being regenerated
    RegenerationStarted {
        round: u32,
        timestamp: DateTime<Utc>,
    },

    /// Regeneration finished and tracking for the round was reset
    RegenerationCompleted {
        round: u32,
        timestamp: DateTime<Utc>,
    },

    /// Local streaming was stopped by the user
    StreamStopped {
        round: Option<u32>,
        participant_index: usize,
        timestamp: DateTime<Utc>,
    },
}

impl StoreEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::SessionCreated { timestamp, .. }
            | Self::SessionDisposed { timestamp, .. }
            | Self::ConfigChanged { timestamp, .. }
            | Self::MessageAppended { timestamp, .. }
            | Self::MessageUpdated { timestamp, .. }
            | Self::MessageRemoved { timestamp, .. }
            | Self::MessagesSynced { timestamp, .. }
            | Self::PreSearchChanged { timestamp, .. }
            | Self::PreSearchRemoved { timestamp, .. }
            | Self::AnalysisChanged { timestamp, .. }
            | Self::AnalysisRemoved { timestamp, .. }
            | Self::StreamingChanged { timestamp, .. }
            | Self::ParticipantIndexChanged { timestamp, .. }
            | Self::RoundCompleted { timestamp, .. }
            | Self::RegenerationStarted { timestamp, .. }
            | Self::RegenerationCompleted { timestamp, .. }
            | Self::StreamStopped { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::SessionDisposed { .. } => "session_disposed",
            Self::ConfigChanged { .. } => "config_changed",
            Self::MessageAppended { .. } => "message_appended",
            Self::MessageUpdated { .. } => "message_updated",
            Self::MessageRemoved { .. } => "message_removed",
            Self::MessagesSynced { .. } => "messages_synced",
            Self::PreSearchChanged { .. } => "pre_search_changed",
            Self::PreSearchRemoved { .. } => "pre_search_removed",
            Self::AnalysisChanged { .. } => "analysis_changed",
            Self::AnalysisRemoved { .. } => "analysis_removed",
            Self::StreamingChanged { .. } => "streaming_changed",
            Self::ParticipantIndexChanged { .. } => "participant_index_changed",
            Self::RoundCompleted { .. } => "round_completed",
            Self::RegenerationStarted { .. } => "regeneration_started",
            Self::RegenerationCompleted { .. } => "regeneration_completed",
            Self::StreamStopped { .. } => "stream_stopped",
        }
    }

    /// Get the round number if the event concerns one round
    pub fn round(&self) -> Option<u32> {
        match self {
            Self::MessageAppended { round, .. }
            | Self::MessageUpdated { round, .. }
            | Self::MessageRemoved { round, .. }
            | Self::PreSearchChanged { round, .. }
            | Self::PreSearchRemoved { round, .. }
            | Self::AnalysisChanged { round, .. }
            | Self::AnalysisRemoved { round, .. }
            | Self::ParticipantIndexChanged { round, .. }
            | Self::RoundCompleted { round, .. }
            | Self::RegenerationStarted { round, .. }
            | Self::RegenerationCompleted { round, .. } => Some(*round),
            Self::StreamingChanged { round, .. } | Self::StreamStopped { round, .. } => *round,
            Self::SessionCreated { .. }
            | Self::SessionDisposed { .. }
            | Self::ConfigChanged { .. }
            | Self::MessagesSynced { .. } => None,
        }
    }
}
