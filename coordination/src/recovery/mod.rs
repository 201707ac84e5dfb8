//! Resumption recovery engine
//!
//! Rebuilds a round's progress after an interruption from the persisted
//! [`StreamSnapshot`](crate::model::StreamSnapshot). The engine never lets an
//! error or panic escape: every failure becomes a [`ResumptionResult`] with
//! the `Restart` strategy.
//!
//! The recovered state feeds the phase detector through
//! [`ResumptionEngine::apply_to_store`], so the sequencer resumes where the
//! facts say rather than where the client remembers.

pub mod engine;
pub mod integrity;
pub mod source;
pub mod types;

pub use engine::ResumptionEngine;
pub use integrity::{validate_snapshot, IntegrityStatus};
pub use source::{JsonFileSnapshotSource, MemorySnapshotSource, SnapshotError, SnapshotSource};
pub use types::{LocalRoundState, RecoveryStrategy, ResumptionResult};
