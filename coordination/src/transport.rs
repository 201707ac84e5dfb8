//! Streaming transport boundary
//!
//! The network layer that actually calls models and search providers lives
//! outside this crate. The sequencer only needs "turn started", "delta
//! received" and "turn finished", pushed through a channel while the turn
//! runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::{ChatMode, MessageStatus, Participant};

/// Errors raised by a transport implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Connection lost: {0}")]
    Disconnected(String),

    #[error("Provider rejected the request: {0}")]
    Rejected(String),
}

/// Progress of one streamed turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnEvent {
    Started,
    Delta { text: String },
    Finished {
        status: MessageStatus,
        /// Authoritative full content, when the transport has it
        content: Option<String>,
        error: Option<String>,
        /// Structured result (search results, analysis payload)
        payload: Option<serde_json::Value>,
    },
}

impl TurnEvent {
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta { text: text.into() }
    }

    pub fn complete(content: Option<String>) -> Self {
        Self::Finished {
            status: MessageStatus::Complete,
            content,
            error: None,
            payload: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Finished {
            status: MessageStatus::Error,
            content: None,
            error: Some(error.into()),
            payload: None,
        }
    }
}

/// What the transport is asked to produce
#[derive(Debug, Clone)]
pub enum TurnRequest {
    PreSearch {
        thread_id: String,
        round: u32,
        query: String,
    },
    Participant {
        thread_id: String,
        round: u32,
        index: usize,
        participant: Participant,
        mode: ChatMode,
        /// Pre-search result for the round, if any
        search_context: Option<serde_json::Value>,
    },
    Moderator {
        thread_id: String,
        round: u32,
        participant_message_ids: Vec<String>,
        mode: ChatMode,
    },
}

impl TurnRequest {
    pub fn round(&self) -> u32 {
        match self {
            Self::PreSearch { round, .. }
            | Self::Participant { round, .. }
            | Self::Moderator { round, .. } => *round,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::PreSearch { .. } => "pre_search",
            Self::Participant { .. } => "participant",
            Self::Moderator { .. } => "moderator",
        }
    }
}

/// A streaming transport for pre-search, participant and moderator turns
///
/// Implementations push [`TurnEvent`]s into `events` and return once the
/// turn is over. A returned error without a `Finished` event is treated as
/// a transient failure of that turn.
#[async_trait]
pub trait RoundTransport: Send + Sync {
    async fn stream_turn(
        &self,
        request: TurnRequest,
        events: mpsc::Sender<TurnEvent>,
    ) -> Result<(), TransportError>;
}
