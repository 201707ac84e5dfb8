//! Round phase detection.
//!
//! A pure function from store facts to the logical phase of a round. The
//! sequencer and the recovery engine both consult it instead of
//! remembering a phase, so a reloaded client resumes where the facts say.
//!
//! ```text
//! search active? ──yes──▶ PreSearch
//!      │no
//! responded < enabled? ──yes──▶ Participants
//!      │no
//! moderator record? ──Pending/Streaming/Failed──▶ Moderator
//!      │           └──Complete──▶ Complete
//!      │none
//! enabled ≥ 1? ──yes──▶ Moderator
//!      │no
//!      ▼
//!    Idle
//! ```

use serde::{Deserialize, Serialize};

use crate::model::RecordStatus;

/// Logical stage of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Nothing in flight.
    Idle,
    /// Web search enrichment running.
    PreSearch,
    /// Participants still responding.
    Participants,
    /// Summary pending, streaming, or needing a retry.
    Moderator,
    /// Summary finished.
    Complete,
}

impl RoundPhase {
    /// Whether a round in this phase has work in flight.
    pub fn is_active(self) -> bool {
        matches!(self, Self::PreSearch | Self::Participants | Self::Moderator)
    }
}

impl std::fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::PreSearch => write!(f, "pre_search"),
            Self::Participants => write!(f, "participants"),
            Self::Moderator => write!(f, "moderator"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Pre-search facts for a round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreSearchView {
    pub enabled: bool,
    /// `None` when no record exists for the round.
    pub status: Option<RecordStatus>,
}

/// Participant progress for a round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParticipantProgress {
    /// Enabled participants, `None` when the list is not known yet.
    pub total_enabled: Option<usize>,
    /// Assistant messages for the round, moderator output excluded.
    pub responded: usize,
}

impl ParticipantProgress {
    /// Whether every enabled participant has a message for the round.
    ///
    /// An empty or unknown participant list never counts as complete.
    pub fn all_responded(&self) -> bool {
        matches!(self.total_enabled, Some(total) if total > 0 && self.responded >= total)
    }
}

/// Moderator facts for a round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeratorView {
    /// `None` when no analysis record exists for the round.
    pub status: Option<RecordStatus>,
}

/// Compute the phase of a round.
pub fn detect_phase(
    pre_search: PreSearchView,
    participants: ParticipantProgress,
    moderator: ModeratorView,
) -> RoundPhase {
    // 1. Search still running
    if pre_search.enabled && matches!(pre_search.status, Some(s) if s.is_active()) {
        return RoundPhase::PreSearch;
    }

    // 2. Participants outstanding
    if let Some(total) = participants.total_enabled {
        if participants.responded < total {
            return RoundPhase::Participants;
        }
    }

    // 3. Existing moderator record decides
    if let Some(status) = moderator.status {
        return match status {
            RecordStatus::Pending | RecordStatus::Streaming => RoundPhase::Moderator,
            RecordStatus::Complete => RoundPhase::Complete,
            // Failed summary needs a retry
            RecordStatus::Failed => RoundPhase::Moderator,
        };
    }

    // 4. Summary still needs to start
    if participants.all_responded() {
        return RoundPhase::Moderator;
    }

    // 5. Never default to Moderator: a zero-participant reload would stall there.
    RoundPhase::Idle
}
