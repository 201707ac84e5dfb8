//! Conversation state store
//!
//! The single mutable source of truth for one open thread session: thread,
//! participants, messages, pre-search and analysis records, streaming
//! state and per-round idempotency markers.
//!
//! # Architecture
//!
//! - `messages`: append/update/remove with the per-round message invariants
//! - `records`: pre-search and analysis records with monotonic statuses
//! - `tracking`: streaming slot, guard flags, idempotency sets, regeneration
//!
//! All mutations are synchronous. Each one publishes a [`StoreEvent`] on the
//! store's own bus after the write lock is released, so subscribers can read
//! the store from their handlers.
//!
//! Every session owns its own store; two stores never share state.
//!
//! # Usage
//!
//! ```ignore
//! use coordination::store::ConversationStore;
//! use coordination::model::{ChatMode, Participant, Thread};
//!
//! let store = ConversationStore::new(
//!     Thread::new(ChatMode::Debating, true),
//!     vec![Participant::new("p-1", "model-a", 0)],
//! )
//! .shared();
//! let mut events = store.subscribe();
//! ```

mod messages;
mod records;
mod tracking;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::RoundConfig;
use crate::events::{EventBus, EventFilter, FilteredReceiver, StoreEvent};
use crate::model::{
    AnalysisRecord, Message, Participant, PreSearchRecord, RoundState, SessionConfig, Thread,
};
use crate::phase::{detect_phase, ModeratorView, ParticipantProgress, PreSearchView, RoundPhase};

/// Shared reference to a ConversationStore
pub type SharedConversationStore = Arc<ConversationStore>;

/// Per-round "already done" markers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoundTracking {
    /// Rounds whose analysis has been created
    pub analysis_created: BTreeSet<u32>,
    /// Rounds whose pre-search has been triggered
    pub pre_search_triggered: BTreeSet<u32>,
}

/// Everything the store owns for one session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    pub thread: Thread,
    /// Sorted by priority
    pub participants: Vec<Participant>,
    /// Append order, round numbers non-decreasing
    pub messages: Vec<Message>,
    pub pre_searches: BTreeMap<u32, PreSearchRecord>,
    pub analyses: BTreeMap<u32, AnalysisRecord>,
    pub round: RoundState,
    pub tracking: RoundTracking,
}

impl SessionState {
    fn new(thread: Thread, mut participants: Vec<Participant>) -> Self {
        participants.sort_by_key(|p| p.priority);
        Self {
            thread,
            participants,
            messages: Vec::new(),
            pre_searches: BTreeMap::new(),
            analyses: BTreeMap::new(),
            round: RoundState::default(),
            tracking: RoundTracking::default(),
        }
    }

    /// Enabled participants in turn order
    pub fn enabled_participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| p.enabled)
    }

    /// Assistant messages for `round`, moderator output excluded
    pub fn participant_response_count(&self, round: u32) -> usize {
        self.messages
            .iter()
            .filter(|m| m.round == round && m.is_participant_response())
            .count()
    }

    /// Phase detector inputs for `round`
    pub fn phase_inputs(&self, round: u32) -> (PreSearchView, ParticipantProgress, ModeratorView) {
        (
            PreSearchView {
                enabled: self.thread.web_search_enabled,
                status: self.pre_searches.get(&round).map(|r| r.status),
            },
            ParticipantProgress {
                total_enabled: Some(self.enabled_participants().count()),
                responded: self.participant_response_count(round),
            },
            ModeratorView {
                status: self.analyses.get(&round).map(|r| r.status),
            },
        )
    }

    pub fn phase(&self, round: u32) -> RoundPhase {
        let (pre_search, participants, moderator) = self.phase_inputs(round);
        detect_phase(pre_search, participants, moderator)
    }
}

/// The conversation state store for one thread session
pub struct ConversationStore {
    state: RwLock<SessionState>,
    bus: EventBus,
}

impl ConversationStore {
    /// Open a session with default configuration
    pub fn new(thread: Thread, participants: Vec<Participant>) -> Self {
        Self::create(thread, participants, &RoundConfig::default())
    }

    /// Open a session
    pub fn create(thread: Thread, participants: Vec<Participant>, config: &RoundConfig) -> Self {
        let thread_id = thread.id.clone();
        let store = Self {
            state: RwLock::new(SessionState::new(thread, participants)),
            bus: EventBus::with_capacity(config.event_channel_capacity),
        };
        info!(thread_id = %thread_id, "Conversation session created");
        store.bus.publish(StoreEvent::SessionCreated {
            thread_id,
            timestamp: Utc::now(),
        });
        store
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedConversationStore {
        Arc::new(self)
    }

    /// Close the session: drop messages, records, markers and flags
    pub fn dispose(&self) {
        let thread_id = self.mutate(|state, _| {
            let thread = state.thread.clone();
            *state = SessionState::new(thread, Vec::new());
            state.thread.id.clone()
        });
        info!(thread_id = %thread_id, "Conversation session disposed");
        self.bus.publish(StoreEvent::SessionDisposed {
            thread_id,
            timestamp: Utc::now(),
        });
    }

    /// Full session reset: keeps thread and participants, drops everything else
    pub fn reset(&self) {
        self.mutate(|state, events| {
            let thread = state.thread.clone();
            let participants = std::mem::take(&mut state.participants);
            *state = SessionState::new(thread, participants);
            events.push(StoreEvent::StreamingChanged {
                round: None,
                is_streaming: false,
                timestamp: Utc::now(),
            });
        });
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.bus.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        self.bus.subscribe_filtered(filter)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Run `f` against the current state under the read lock
    pub fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Clone of the whole session state
    pub fn state(&self) -> SessionState {
        self.read(SessionState::clone)
    }

    pub fn thread(&self) -> Thread {
        self.read(|s| s.thread.clone())
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.read(|s| s.participants.clone())
    }

    pub fn enabled_participants(&self) -> Vec<Participant> {
        self.read(|s| s.enabled_participants().cloned().collect())
    }

    /// Logical phase of `round` from current facts
    pub fn phase_for_round(&self, round: u32) -> RoundPhase {
        self.read(|s| s.phase(round))
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Apply a confirmed configuration change
    pub fn apply_config(&self, config: SessionConfig) {
        self.mutate(|state, events| {
            state.thread.web_search_enabled = config.web_search_enabled;
            state.thread.mode = config.mode;
            let mut participants = config.participants;
            participants.sort_by_key(|p| p.priority);
            state.participants = participants;
            events.push(config_changed(state));
        });
    }

    /// Replace the participant list wholesale
    pub fn set_participants(&self, mut participants: Vec<Participant>) {
        participants.sort_by_key(|p| p.priority);
        self.mutate(|state, events| {
            state.participants = participants;
            events.push(config_changed(state));
        });
    }

    pub fn set_web_search_enabled(&self, enabled: bool) {
        self.mutate(|state, events| {
            state.thread.web_search_enabled = enabled;
            events.push(config_changed(state));
        });
    }

    /// Current configuration surface
    pub fn session_config(&self) -> SessionConfig {
        self.read(|s| SessionConfig {
            web_search_enabled: s.thread.web_search_enabled,
            participants: s.participants.clone(),
            mode: s.thread.mode,
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Apply a mutation, then publish its events outside the lock
    fn mutate<R>(&self, f: impl FnOnce(&mut SessionState, &mut Vec<StoreEvent>) -> R) -> R {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut state, &mut events)
        };
        for event in events {
            self.bus.publish(event);
        }
        result
    }
}

fn config_changed(state: &SessionState) -> StoreEvent {
    StoreEvent::ConfigChanged {
        thread_id: state.thread.id.clone(),
        web_search_enabled: state.thread.web_search_enabled,
        participant_count: state.participants.len(),
        timestamp: Utc::now(),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::model::ChatMode;

    #[test]
    fn test_participants_sorted_by_priority() {
        let store = ConversationStore::new(
            Thread::new(ChatMode::Debating, false),
            vec![
                Participant::new("late", "m", 5),
                Participant::new("early", "m", 1),
                Participant::new("off", "m", 0).disabled(),
            ],
        );
        let ids: Vec<_> = store.participants().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["off", "early", "late"]);
        let enabled: Vec<_> = store
            .enabled_participants()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(enabled, vec!["early", "late"]);
    }

    #[test]
    fn test_apply_config_replaces_participants() {
        let store = store(3, false);
        store.apply_config(SessionConfig {
            web_search_enabled: true,
            participants: participants(1),
            mode: ChatMode::Solving,
        });
        let config = store.session_config();
        assert!(config.web_search_enabled);
        assert_eq!(config.participants.len(), 1);
        assert_eq!(store.thread().mode, ChatMode::Solving);
    }

    #[tokio::test]
    async fn test_mutations_publish_events() {
        let store = store(2, false);
        let mut rx = store.subscribe();
        store.set_web_search_enabled(true);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "config_changed");
    }

    #[test]
    fn test_reset_keeps_thread_and_participants() {
        let store = store(2, false);
        store
            .append_message(Message::user("u-0", 0, "hello"))
            .unwrap();
        store.mark_analysis_created(0);
        store.reset();
        let state = store.state();
        assert!(state.messages.is_empty());
        assert!(state.tracking.analysis_created.is_empty());
        assert_eq!(state.participants.len(), 2);
    }

    #[test]
    fn test_dispose_drops_everything() {
        let store = store(2, true);
        store
            .append_message(Message::user("u-0", 0, "hello"))
            .unwrap();
        store.dispose();
        let state = store.state();
        assert!(state.messages.is_empty());
        assert!(state.participants.is_empty());
    }

    #[test]
    fn test_phase_for_round_counts_only_participant_responses() {
        let store = store(2, false);
        store.append_message(Message::user("u-0", 0, "q")).unwrap();
        store
            .append_message(
                Message::assistant("a-0", 0, "p-0", 0).with_status(crate::model::MessageStatus::Complete),
            )
            .unwrap();
        store
            .append_message(Message::moderator("m-0", 0))
            .unwrap();
        assert_eq!(store.phase_for_round(0), RoundPhase::Participants);
    }
}
