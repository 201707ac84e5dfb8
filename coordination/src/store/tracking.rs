//! Streaming slot, guard flags, idempotency markers and regeneration

use chrono::Utc;
use tracing::{debug, info};

use super::ConversationStore;
use crate::error::{RoundError, RoundResult};
use crate::events::StoreEvent;
use crate::model::{MessageRole, RoundState};
use crate::phase::RoundPhase;

impl ConversationStore {
    pub fn round_state(&self) -> RoundState {
        self.read(|s| s.round.clone())
    }

    // =========================================================================
    // Streaming slot
    // =========================================================================

    /// Claim the streaming slot for `round` starting at participant 0
    ///
    /// Only one round may stream at a time. Re-claiming the slot already
    /// held for `round` (set early by an optimistic submit) is allowed.
    pub fn begin_streaming(&self, round: u32) -> RoundResult<()> {
        self.resume_streaming(round, 0)
    }

    /// Claim the streaming slot for `round` at a given participant index
    pub fn resume_streaming(&self, round: u32, participant_index: usize) -> RoundResult<()> {
        self.mutate(|state, events| {
            if let Some(active) = state.round.streaming_round {
                if active != round {
                    return Err(RoundError::RoundInProgress {
                        active,
                        requested: round,
                    });
                }
            }
            state.round.streaming_round = Some(round);
            state.round.is_streaming = true;
            state.round.stop_requested = false;
            state.round.current_participant_index = participant_index;
            events.push(StoreEvent::StreamingChanged {
                round: Some(round),
                is_streaming: true,
                timestamp: Utc::now(),
            });
            Ok(())
        })
    }

    /// Set or clear the streaming round number without touching other state
    pub fn set_streaming_round(&self, round: Option<u32>) {
        self.mutate(|state, events| {
            state.round.streaming_round = round;
            events.push(StoreEvent::StreamingChanged {
                round,
                is_streaming: state.round.is_streaming,
                timestamp: Utc::now(),
            });
        });
    }

    /// Release the streaming slot after a round finished
    pub fn finish_streaming(&self) {
        self.mutate(|state, events| {
            state.round.streaming_round = None;
            state.round.is_streaming = false;
            events.push(StoreEvent::StreamingChanged {
                round: None,
                is_streaming: false,
                timestamp: Utc::now(),
            });
        });
    }

    /// Release the slot and announce that `round` reached its structural end
    ///
    /// A failed analysis still completes the round; the returned phase tells
    /// the caller whether a summary retry is outstanding.
    pub fn complete_round(&self, round: u32) -> RoundPhase {
        self.mutate(|state, events| {
            let phase = state.phase(round);
            let now = Utc::now();
            state.round.streaming_round = None;
            state.round.is_streaming = false;
            events.push(StoreEvent::StreamingChanged {
                round: None,
                is_streaming: false,
                timestamp: now,
            });
            events.push(StoreEvent::RoundCompleted {
                round,
                phase,
                analysis_status: state.analyses.get(&round).map(|a| a.status),
                timestamp: now,
            });
            info!(round, %phase, "Round completed");
            phase
        })
    }

    /// Stop local streaming: freeze the participant index, keep content
    pub fn stop_streaming(&self) {
        self.mutate(|state, events| {
            let round = state.round.streaming_round.take();
            state.round.is_streaming = false;
            state.round.stop_requested = true;
            info!(
                round = ?round,
                participant_index = state.round.current_participant_index,
                "Streaming stopped"
            );
            events.push(StoreEvent::StreamStopped {
                round,
                participant_index: state.round.current_participant_index,
                timestamp: Utc::now(),
            });
        });
    }

    pub fn is_stop_requested(&self) -> bool {
        self.read(|s| s.round.stop_requested)
    }

    pub fn streaming_round(&self) -> Option<u32> {
        self.read(|s| s.round.streaming_round)
    }

    pub fn current_participant_index(&self) -> usize {
        self.read(|s| s.round.current_participant_index)
    }

    pub fn set_current_participant_index(&self, index: usize) {
        self.mutate(|state, events| {
            state.round.current_participant_index = index;
            if let Some(round) = state.round.streaming_round {
                events.push(StoreEvent::ParticipantIndexChanged {
                    round,
                    index,
                    timestamp: Utc::now(),
                });
            }
        });
    }

    // =========================================================================
    // Guard flags
    // =========================================================================

    pub fn set_waiting_for_config_sync(&self, waiting: bool) {
        self.mutate(|state, _| state.round.waiting_for_config_sync = waiting);
    }

    pub fn set_has_early_optimistic_message(&self, pending: bool) {
        self.mutate(|state, _| state.round.has_early_optimistic_message = pending);
    }

    pub fn set_waiting_for_changelog(&self, waiting: bool) {
        self.mutate(|state, _| state.round.waiting_for_changelog = waiting);
    }

    /// Restore all ephemeral round state at once
    pub fn restore_round_state(&self, round_state: RoundState) {
        self.mutate(|state, events| {
            events.push(StoreEvent::StreamingChanged {
                round: round_state.streaming_round,
                is_streaming: round_state.is_streaming,
                timestamp: Utc::now(),
            });
            state.round = round_state;
        });
    }

    // =========================================================================
    // Idempotency markers
    // =========================================================================

    /// Claim analysis creation for `round`; `false` when already claimed
    pub fn mark_analysis_created(&self, round: u32) -> bool {
        self.mutate(|state, _| state.tracking.analysis_created.insert(round))
    }

    pub fn has_analysis_been_created(&self, round: u32) -> bool {
        self.read(|s| s.tracking.analysis_created.contains(&round))
    }

    pub fn clear_analysis_tracking(&self, round: u32) {
        self.mutate(|state, _| {
            state.tracking.analysis_created.remove(&round);
        });
    }

    /// Claim pre-search execution for `round`; `false` when already claimed
    pub fn mark_pre_search_triggered(&self, round: u32) -> bool {
        self.mutate(|state, _| state.tracking.pre_search_triggered.insert(round))
    }

    pub fn has_pre_search_been_triggered(&self, round: u32) -> bool {
        self.read(|s| s.tracking.pre_search_triggered.contains(&round))
    }

    pub fn clear_pre_search_tracking(&self, round: u32) {
        self.mutate(|state, _| {
            state.tracking.pre_search_triggered.remove(&round);
        });
    }

    // =========================================================================
    // Regeneration
    // =========================================================================

    /// Begin regenerating `round`
    ///
    /// Keeps the user message; drops participant and moderator messages,
    /// the round's records and its idempotency markers.
    pub fn start_regeneration(&self, round: u32) {
        self.mutate(|state, events| {
            state.round.is_regenerating = true;
            state.round.regenerating_round = Some(round);
            state.round.current_participant_index = 0;
            state.tracking.analysis_created.remove(&round);
            state.tracking.pre_search_triggered.remove(&round);

            let now = Utc::now();
            state.messages.retain(|m| {
                let drop = m.round == round && m.role != MessageRole::User;
                if drop {
                    events.push(StoreEvent::MessageRemoved {
                        message_id: m.id.clone(),
                        round,
                        timestamp: now,
                    });
                }
                !drop
            });
            if state.analyses.remove(&round).is_some() {
                events.push(StoreEvent::AnalysisRemoved {
                    round,
                    timestamp: now,
                });
            }
            if state.pre_searches.remove(&round).is_some() {
                events.push(StoreEvent::PreSearchRemoved {
                    round,
                    timestamp: now,
                });
            }
            events.push(StoreEvent::RegenerationStarted {
                round,
                timestamp: now,
            });
            debug!(round, "Regeneration started");
        });
    }

    /// Finish regenerating `round` and clear its markers
    pub fn complete_regeneration(&self, round: u32) {
        self.mutate(|state, events| {
            state.round.is_regenerating = false;
            state.round.regenerating_round = None;
            state.tracking.analysis_created.remove(&round);
            state.tracking.pre_search_triggered.remove(&round);
            events.push(StoreEvent::RegenerationCompleted {
                round,
                timestamp: Utc::now(),
            });
            debug!(round, "Regeneration completed");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::store;
    use crate::error::RoundError;
    use crate::model::{Message, MessageStatus};

    #[test]
    fn test_only_one_round_streams() {
        let store = store(2, false);
        store.begin_streaming(0).unwrap();
        let err = store.begin_streaming(1).unwrap_err();
        assert_eq!(
            err,
            RoundError::RoundInProgress {
                active: 0,
                requested: 1
            }
        );
        store.begin_streaming(0).unwrap();
        store.finish_streaming();
        store.begin_streaming(1).unwrap();
    }

    #[test]
    fn test_stop_freezes_index_and_releases_slot() {
        let store = store(3, false);
        store.begin_streaming(0).unwrap();
        store.set_current_participant_index(2);
        store.stop_streaming();
        let state = store.round_state();
        assert!(!state.is_streaming);
        assert!(state.stop_requested);
        assert_eq!(state.streaming_round, None);
        assert_eq!(state.current_participant_index, 2);
    }

    #[test]
    fn test_markers_are_idempotent() {
        let store = store(1, false);
        assert!(store.mark_analysis_created(0));
        assert!(!store.mark_analysis_created(0));
        assert!(store.has_analysis_been_created(0));
        store.clear_analysis_tracking(0);
        assert!(!store.has_analysis_been_created(0));

        assert!(store.mark_pre_search_triggered(2));
        assert!(!store.mark_pre_search_triggered(2));
        store.clear_pre_search_tracking(2);
        assert!(store.mark_pre_search_triggered(2));
    }

    #[test]
    fn test_regeneration_round_trip_clears_markers() {
        let store = store(1, true);
        store.append_message(Message::user("u-0", 0, "q")).unwrap();
        store
            .append_message(
                Message::assistant("a-0", 0, "p-0", 0).with_status(MessageStatus::Complete),
            )
            .unwrap();
        store.create_pre_search(0, "q").unwrap();
        store.mark_pre_search_triggered(0);
        store.create_analysis(0, vec!["a-0".into()]).unwrap();

        store.start_regeneration(0);
        let state = store.round_state();
        assert!(state.is_regenerating);
        assert_eq!(state.regenerating_round, Some(0));
        assert_eq!(store.message_count(), 1);
        assert!(store.analysis(0).is_none());
        assert!(store.pre_search(0).is_none());

        store.complete_regeneration(0);
        assert!(!store.round_state().is_regenerating);
        assert!(!store.has_analysis_been_created(0));
        assert!(!store.has_pre_search_been_triggered(0));
        assert!(store.mark_analysis_created(0));
        assert!(store.mark_pre_search_triggered(0));
    }
}
