//! Roundtable Coordination Library
//!
//! This library provides the round orchestration core for a multi-participant
//! conversation:
//! - Round phase detection from stored facts
//! - An animation barrier letting completion signals wait for the renderer
//! - A per-session conversation state store with a change event bus
//! - The streaming sequencer that decides and drives what happens next
//! - Optimistic user-message bookkeeping with full rollback
//! - Resumption of interrupted rounds from persisted snapshots
//!
//! # Round lifecycle
//!
//! ```text
//! user message ─▶ pre-search? ─▶ participant 0 ─▶ … ─▶ participant N-1 ─▶ moderator
//!                 (optional)        │ barrier(0)           │ barrier(N-1)
//!                                   ▼                      ▼
//!                              next participant       analysis created once
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use coordination::{
//!     AnimationBarrier, ChatMode, ConversationStore, Participant, StreamingSequencer, Thread,
//! };
//!
//! # async fn demo(transport: &dyn coordination::RoundTransport) -> coordination::RoundResult<()> {
//! let store = ConversationStore::new(
//!     Thread::new(ChatMode::Analyzing, true),
//!     vec![Participant::new("p-0", "model-a", 0), Participant::new("p-1", "model-b", 1)],
//! )
//! .shared();
//! let sequencer = StreamingSequencer::new(store, Arc::new(AnimationBarrier::new()));
//! let outcome = sequencer
//!     .run_round(0, transport, tokio_util::sync::CancellationToken::new())
//!     .await?;
//! println!("{}", outcome.summary_line());
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod barrier;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod optimistic;
pub mod phase;
pub mod recovery;
pub mod sequencer;
pub mod store;
pub mod transport;

// Re-export key types
pub use barrier::{AnimationBarrier, AnimationWait, BarrierError};
pub use config::{ConfigError, RoundConfig};
pub use error::{RoundError, RoundResult};
pub use events::{EventBus, EventFilter, FilteredReceiver, SharedEventBus, StoreEvent};
pub use model::{
    AnalysisRecord, ChatMode, Message, MessagePart, MessageRole, MessageStatus, Participant,
    PreSearchRecord, RecordStatus, RoundState, SessionConfig, SnapshotMessage, StreamSnapshot,
    Thread,
};
pub use optimistic::{OptimisticPermit, OptimisticUpdateManager};
pub use phase::{detect_phase, ModeratorView, ParticipantProgress, PreSearchView, RoundPhase};
pub use recovery::{
    validate_snapshot, IntegrityStatus, JsonFileSnapshotSource, LocalRoundState,
    MemorySnapshotSource, RecoveryStrategy, ResumptionEngine, ResumptionResult, SnapshotError,
    SnapshotSource,
};
pub use sequencer::{NextAction, RoundOutcome, StreamingSequencer};
pub use store::{ConversationStore, SessionState, SharedConversationStore};
pub use transport::{RoundTransport, TransportError, TurnEvent, TurnRequest};
