//! Data model for one conversation session

pub mod ids;
pub mod snapshot;
pub mod types;

pub use snapshot::{SnapshotMessage, StreamSnapshot};
pub use types::{
    AnalysisRecord, ChatMode, Message, MessageId, MessagePart, MessageRole, MessageStatus,
    Participant, ParticipantId, PreSearchRecord, RecordStatus, RoundState, SessionConfig, Thread,
    ThreadId,
};
