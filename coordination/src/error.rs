//! Round orchestration error types
//!
//! One taxonomy shared by the store, the sequencer, the optimistic update
//! manager and the recovery engine. Each variant knows whether it is worth
//! retrying and whether it forces a full restart of the round.

use thiserror::Error;

use crate::model::RecordStatus;

/// Result type alias for round orchestration operations
pub type RoundResult<T> = Result<T, RoundError>;

/// Errors that can occur while orchestrating a round
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoundError {
    /// Malformed snapshot or state violating structural invariants
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// Snapshot older than the staleness threshold
    #[error("Snapshot is stale: last update {age_secs}s ago (threshold {threshold_secs}s)")]
    StaleData { age_secs: i64, threshold_secs: i64 },

    /// Timeout or disconnect during a participant, pre-search or moderator turn
    #[error("Transient network error during {operation}: {message}")]
    TransientNetwork { operation: String, message: String },

    /// Optimistic submission rejected by configuration sync
    #[error("Mutation failed: {message}")]
    MutationFailure { message: String },

    /// An append or update would break a message invariant
    #[error("Invariant violation: {message}")]
    InvariantViolation { message: String },

    /// A record status update tried to move backwards
    #[error("Status regression for round {round}: {from} -> {to}")]
    StatusRegression {
        round: u32,
        from: RecordStatus,
        to: RecordStatus,
    },

    /// Another round already holds the streaming slot
    #[error("Round {active} is still streaming (requested round {requested})")]
    RoundInProgress { active: u32, requested: u32 },

    /// An optimistic message already exists for the round
    #[error("Optimistic message already pending for round {round}")]
    OptimisticPending { round: u32 },

    /// Entity lookup failed
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Local drive loop stopped or its barrier was cleared
    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },
}

impl RoundError {
    /// Build a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Build an invariant violation
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Build a transient network error
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Build a not-found error
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Build a cancellation error
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION",
            Self::StaleData { .. } => "STALE_DATA",
            Self::TransientNetwork { .. } => "TRANSIENT_NETWORK",
            Self::MutationFailure { .. } => "MUTATION_FAILURE",
            Self::InvariantViolation { .. } => "INVARIANT_VIOLATION",
            Self::StatusRegression { .. } => "STATUS_REGRESSION",
            Self::RoundInProgress { .. } => "ROUND_IN_PROGRESS",
            Self::OptimisticPending { .. } => "OPTIMISTIC_PENDING",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Cancelled { .. } => "CANCELLED",
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork { .. } | Self::MutationFailure { .. }
        )
    }

    /// Whether this error forces the resumption engine into a full restart
    pub fn forces_restart(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::StaleData { .. })
    }
}
