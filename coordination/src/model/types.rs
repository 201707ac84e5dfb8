//! Core types for a conversation session
//!
//! Threads, participants, messages and the per-round pre-search and
//! analysis records. All of them are owned by the conversation store for
//! the lifetime of one open thread.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for threads
pub type ThreadId = String;

/// Unique identifier for participants
pub type ParticipantId = String;

/// Unique identifier for messages
pub type MessageId = String;

/// Conversation style of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    #[default]
    Analyzing,
    Brainstorming,
    Debating,
    Solving,
}

impl std::fmt::Display for ChatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Analyzing => write!(f, "analyzing"),
            Self::Brainstorming => write!(f, "brainstorming"),
            Self::Debating => write!(f, "debating"),
            Self::Solving => write!(f, "solving"),
        }
    }
}

impl std::str::FromStr for ChatMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "analyzing" => Ok(Self::Analyzing),
            "brainstorming" => Ok(Self::Brainstorming),
            "debating" => Ok(Self::Debating),
            "solving" => Ok(Self::Solving),
            other => Err(format!("unknown chat mode: {other}")),
        }
    }
}

/// A conversation session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub mode: ChatMode,
    pub web_search_enabled: bool,
    /// Owned by the title generator; carried through untouched
    pub title: Option<String>,
    pub slug: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Thread {
    /// Create a new thread with a random id
    pub fn new(mode: ChatMode, web_search_enabled: bool) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), mode, web_search_enabled)
    }

    pub fn with_id(id: impl Into<ThreadId>, mode: ChatMode, web_search_enabled: bool) -> Self {
        Self {
            id: id.into(),
            mode,
            web_search_enabled,
            title: None,
            slug: None,
            created_at: Utc::now(),
        }
    }
}

/// An AI responder taking part in every round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    /// Model identifier passed to the transport
    pub model_id: String,
    pub role: Option<String>,
    pub enabled: bool,
    /// Turn order within a round, lowest first
    pub priority: u32,
}

impl Participant {
    pub fn new(id: impl Into<ParticipantId>, model_id: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            model_id: model_id.into(),
            role: None,
            enabled: true,
            priority,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Moderator,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Moderator => write!(f, "moderator"),
        }
    }
}

/// Lifecycle of a single message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Streaming,
    Complete,
    Error,
}

impl MessageStatus {
    /// Whether no further content will arrive for this message
    pub fn is_final(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming => write!(f, "streaming"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One ordered piece of message content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "text", rename_all = "snake_case")]
pub enum MessagePart {
    Text(String),
    Reasoning(String),
}

impl MessagePart {
    pub fn text(&self) -> &str {
        match self {
            Self::Text(text) | Self::Reasoning(text) => text,
        }
    }
}

/// One turn of the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    pub round: u32,
    /// Set for assistant messages
    pub participant_id: Option<ParticipantId>,
    /// Position among enabled participants when the turn ran
    pub participant_index: Option<usize>,
    pub parts: Vec<MessagePart>,
    pub status: MessageStatus,
    pub error: Option<String>,
    /// Speculative local entry without a server-confirmed counterpart
    #[serde(default)]
    pub optimistic: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Completed user message for a round
    pub fn user(id: impl Into<MessageId>, round: u32, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: MessageRole::User,
            round,
            participant_id: None,
            participant_index: None,
            parts: vec![MessagePart::Text(text.into())],
            status: MessageStatus::Complete,
            error: None,
            optimistic: false,
            created_at: Utc::now(),
        }
    }

    /// Empty streaming assistant message for a participant turn
    pub fn assistant(
        id: impl Into<MessageId>,
        round: u32,
        participant_id: impl Into<ParticipantId>,
        participant_index: usize,
    ) -> Self {
        Self {
            id: id.into(),
            role: MessageRole::Assistant,
            round,
            participant_id: Some(participant_id.into()),
            participant_index: Some(participant_index),
            parts: Vec::new(),
            status: MessageStatus::Streaming,
            error: None,
            optimistic: false,
            created_at: Utc::now(),
        }
    }

    /// Empty streaming moderator message for a round
    pub fn moderator(id: impl Into<MessageId>, round: u32) -> Self {
        Self {
            id: id.into(),
            role: MessageRole::Moderator,
            round,
            participant_id: None,
            participant_index: None,
            parts: Vec::new(),
            status: MessageStatus::Streaming,
            error: None,
            optimistic: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.parts.push(MessagePart::Text(text.into()));
        self
    }

    /// Concatenated text of all parts
    pub fn text(&self) -> String {
        self.parts.iter().map(MessagePart::text).collect()
    }

    /// Append a streamed delta to the trailing text part
    pub fn push_delta(&mut self, delta: &str) {
        match self.parts.last_mut() {
            Some(MessagePart::Text(text)) => text.push_str(delta),
            _ => self.parts.push(MessagePart::Text(delta.to_string())),
        }
    }

    /// Whether this is a participant response (moderator output excluded)
    pub fn is_participant_response(&self) -> bool {
        self.role == MessageRole::Assistant
    }
}

/// Status shared by pre-search and analysis records
///
/// Moves `Pending -> Streaming -> {Complete | Failed}` and never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Streaming,
    Complete,
    Failed,
}

impl RecordStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Streaming => 1,
            Self::Complete | Self::Failed => 2,
        }
    }

    /// Whether the record is still being produced
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Streaming)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Whether moving to `to` keeps the status monotonic
    ///
    /// Re-applying the current status is allowed; terminal states are final.
    pub fn can_advance_to(self, to: RecordStatus) -> bool {
        if self == to {
            return true;
        }
        !self.is_terminal() && to.rank() > self.rank()
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Streaming => write!(f, "streaming"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Web search enrichment for one round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreSearchRecord {
    pub id: String,
    pub round: u32,
    pub status: RecordStatus,
    pub query: String,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PreSearchRecord {
    pub fn new(round: u32, query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            round,
            status: RecordStatus::Pending,
            query: query.into(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Moderator summary for one round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: String,
    pub round: u32,
    pub status: RecordStatus,
    /// Participant messages the summary covers
    pub participant_message_ids: Vec<MessageId>,
    pub payload: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisRecord {
    pub fn new(round: u32, participant_message_ids: Vec<MessageId>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            round,
            status: RecordStatus::Pending,
            participant_message_ids,
            payload: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Ephemeral per-session streaming state and guard flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundState {
    /// Round currently holding the streaming slot
    pub streaming_round: Option<u32>,
    pub current_participant_index: usize,
    pub is_streaming: bool,
    pub is_regenerating: bool,
    pub regenerating_round: Option<u32>,
    /// Set while a configuration change awaits backend confirmation
    pub waiting_for_config_sync: bool,
    /// Set while an optimistic user message has no server counterpart
    pub has_early_optimistic_message: bool,
    pub waiting_for_changelog: bool,
    pub stop_requested: bool,
}

/// Options a user can change between rounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub web_search_enabled: bool,
    pub participants: Vec<Participant>,
    pub mode: ChatMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_status_is_monotonic() {
        use RecordStatus::*;
        assert!(Pending.can_advance_to(Streaming));
        assert!(Pending.can_advance_to(Failed));
        assert!(Streaming.can_advance_to(Complete));
        assert!(Streaming.can_advance_to(Streaming));
        assert!(!Streaming.can_advance_to(Pending));
        assert!(!Complete.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Streaming));
        assert!(Complete.can_advance_to(Complete));
    }

    #[test]
    fn test_push_delta_extends_trailing_text() {
        let mut msg = Message::assistant("m-1", 0, "p-1", 0);
        msg.push_delta("Hel");
        msg.push_delta("lo");
        assert_eq!(msg.parts.len(), 1);
        assert_eq!(msg.text(), "Hello");

        msg.parts.push(MessagePart::Reasoning("thinking".into()));
        msg.push_delta("!");
        assert_eq!(msg.parts.len(), 3);
    }

    #[test]
    fn test_chat_mode_parse_and_display() {
        assert_eq!("Debating".parse::<ChatMode>().unwrap(), ChatMode::Debating);
        assert!("chatting".parse::<ChatMode>().is_err());
        assert_eq!(ChatMode::Solving.to_string(), "solving");
    }

    #[test]
    fn test_message_part_serde_shape() {
        let json = serde_json::to_value(MessagePart::Text("hi".into())).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text", "text": "hi"}));
    }
}
