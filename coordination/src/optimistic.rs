//! Optimistic update manager
//!
//! A user message submitted before the backend confirmed the round's
//! configuration is appended locally right away, marked optimistic, and the
//! streaming round number is claimed so collaborators can react at once.
//!
//! [`OptimisticUpdateManager::submit`] hands out an [`OptimisticPermit`]; the
//! permit is consumed by exactly one of [`confirm`](OptimisticUpdateManager::confirm)
//! or [`rollback`](OptimisticUpdateManager::rollback). A second submission for a
//! round with a live permit is rejected, so at most one optimistic message
//! exists per round.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::error::{RoundError, RoundResult};
use crate::model::ids::{optimistic_message_id, user_message_id};
use crate::model::{Message, MessageId, MessageRole, RoundState, SessionConfig};
use crate::store::SharedConversationStore;

/// Proof of one in-flight optimistic submission.
///
/// Carries what rollback needs to restore the pre-submission state.
#[must_use = "an optimistic permit must be confirmed or rolled back"]
#[derive(Debug)]
pub struct OptimisticPermit {
    round: u32,
    message_id: MessageId,
    prior_round_state: RoundState,
    /// Pre-search placeholder created by this submission
    placeholder_pre_search: bool,
    prior_pre_search_triggered: bool,
    pending_config: Option<SessionConfig>,
}

impl OptimisticPermit {
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Id of the speculative message in the store
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn pending_config(&self) -> Option<&SessionConfig> {
        self.pending_config.as_ref()
    }
}

/// Speculative message bookkeeping for one session store
pub struct OptimisticUpdateManager {
    store: SharedConversationStore,
    pending: Mutex<BTreeSet<u32>>,
}

impl OptimisticUpdateManager {
    pub fn new(store: SharedConversationStore) -> Self {
        Self {
            store,
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, BTreeSet<u32>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `round` has an unresolved optimistic submission
    pub fn has_pending(&self, round: u32) -> bool {
        self.pending().contains(&round)
    }

    /// Submit `text` for the next round with the current configuration
    pub fn submit(&self, text: impl Into<String>) -> RoundResult<OptimisticPermit> {
        self.submit_inner(text.into(), None)
    }

    /// Submit `text` together with a configuration change awaiting confirmation
    ///
    /// Raises `waiting_for_config_sync` until the permit resolves. The new
    /// configuration is applied on confirm and discarded on rollback.
    pub fn submit_with_config(
        &self,
        text: impl Into<String>,
        config: SessionConfig,
    ) -> RoundResult<OptimisticPermit> {
        self.submit_inner(text.into(), Some(config))
    }

    fn submit_inner(
        &self,
        text: String,
        pending_config: Option<SessionConfig>,
    ) -> RoundResult<OptimisticPermit> {
        let round = self.store.next_round();
        if let Some(active) = self.store.streaming_round() {
            if active != round {
                return Err(RoundError::RoundInProgress {
                    active,
                    requested: round,
                });
            }
        }
        let already_optimistic = self
            .store
            .messages_for_round(round)
            .iter()
            .any(|m| m.optimistic);
        if already_optimistic || !self.pending().insert(round) {
            return Err(RoundError::OptimisticPending { round });
        }

        let prior_round_state = self.store.round_state();
        let prior_pre_search_triggered = self.store.has_pre_search_been_triggered(round);

        let message_id = optimistic_message_id();
        let mut message = Message::user(message_id.clone(), round, text.clone());
        message.optimistic = true;
        if let Err(e) = self.store.append_message(message) {
            self.pending().remove(&round);
            return Err(e);
        }

        self.store.set_has_early_optimistic_message(true);
        if pending_config.is_some() {
            self.store.set_waiting_for_config_sync(true);
        }
        self.store.set_streaming_round(Some(round));

        let search_enabled = pending_config
            .as_ref()
            .map_or_else(|| self.store.thread().web_search_enabled, |c| c.web_search_enabled);
        let placeholder_pre_search = search_enabled
            && self.store.pre_search(round).is_none()
            && self.store.create_pre_search(round, &text).is_ok();

        info!(
            round,
            message_id = %message_id,
            placeholder_pre_search,
            "Optimistic message submitted"
        );
        Ok(OptimisticPermit {
            round,
            message_id,
            prior_round_state,
            placeholder_pre_search,
            prior_pre_search_triggered,
            pending_config,
        })
    }

    /// Swap the optimistic message for the server-confirmed copy
    ///
    /// The confirmed message must be the round's user message under its
    /// deterministic id. Anything else is treated as a rejected submission:
    /// the permit is rolled back and `MutationFailure` returned.
    pub fn confirm(&self, permit: OptimisticPermit, confirmed: Message) -> RoundResult<()> {
        let thread_id = self.store.thread().id;
        let expected_id = user_message_id(&thread_id, permit.round);
        if confirmed.role != MessageRole::User
            || confirmed.round != permit.round
            || confirmed.id != expected_id
        {
            let error = RoundError::MutationFailure {
                message: format!(
                    "confirmation {} does not match round {} user message {}",
                    confirmed.id, permit.round, expected_id
                ),
            };
            self.rollback(permit, &error);
            return Err(error);
        }

        let round = permit.round;
        self.store.remove_message(&permit.message_id);
        let mut confirmed = confirmed;
        confirmed.optimistic = false;
        if let Err(e) = self.store.upsert_message(confirmed) {
            warn!(round, error = %e, "Confirmed message rejected by store");
            self.rollback(permit, &e);
            return Err(e);
        }

        if let Some(config) = permit.pending_config {
            self.store.apply_config(config);
        }
        self.store.set_waiting_for_config_sync(false);
        self.store.set_has_early_optimistic_message(false);
        self.pending().remove(&round);
        info!(round, message_id = %expected_id, "Optimistic message confirmed");
        Ok(())
    }

    /// Undo a submission after a validation, network or sync failure
    ///
    /// Leaves the store equal to its pre-submission state so the user can
    /// retry immediately.
    pub fn rollback(&self, permit: OptimisticPermit, cause: &RoundError) {
        let round = permit.round;
        warn!(round, error = %cause, code = cause.code(), "Rolling back optimistic message");

        self.store.remove_message(&permit.message_id);
        if permit.placeholder_pre_search {
            self.store.remove_pre_search(round);
        }
        if !permit.prior_pre_search_triggered {
            self.store.clear_pre_search_tracking(round);
        }
        self.store.restore_round_state(permit.prior_round_state);
        self.pending().remove(&round);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatMode, MessageStatus};
    use crate::store::test_support::{participants, store};

    fn manager(web_search: bool) -> OptimisticUpdateManager {
        OptimisticUpdateManager::new(store(2, web_search).shared())
    }

    #[test]
    fn test_submit_marks_round_and_raises_guard() {
        let manager = manager(false);
        let permit = manager.submit("hello").unwrap();
        assert_eq!(permit.round(), 0);

        let state = manager.store.round_state();
        assert_eq!(state.streaming_round, Some(0));
        assert!(state.has_early_optimistic_message);
        assert!(!state.waiting_for_config_sync);
        let message = manager.store.message(permit.message_id()).unwrap();
        assert!(message.optimistic);
        assert_eq!(message.status, MessageStatus::Complete);
        assert!(manager.has_pending(0));

        manager.rollback(permit, &RoundError::transient("submit", "offline"));
    }

    #[test]
    fn test_second_submission_for_round_rejected() {
        let manager = manager(false);
        let permit = manager.submit("first").unwrap();
        let err = manager.submit("second").unwrap_err();
        assert_eq!(err, RoundError::OptimisticPending { round: 0 });
        manager.rollback(permit, &RoundError::validation("x"));
        assert!(manager.submit("retry").is_ok());
    }

    #[test]
    fn test_guard_blocks_message_sync() {
        let manager = manager(false);
        let permit = manager.submit("hello").unwrap();
        assert!(!manager.store.sync_messages(Vec::new()));
        assert_eq!(manager.store.message_count(), 1);

        let confirmed = Message::user("t-1_r0_user", 0, "hello");
        manager.confirm(permit, confirmed).unwrap();
        assert!(manager.store.sync_messages(manager.store.messages()));
    }

    #[test]
    fn test_confirm_swaps_in_deterministic_id() {
        let manager = manager(true);
        let permit = manager.submit("hello").unwrap();
        let optimistic_id = permit.message_id().to_string();

        manager
            .confirm(permit, Message::user("t-1_r0_user", 0, "hello"))
            .unwrap();
        assert!(manager.store.message(&optimistic_id).is_none());
        let confirmed = manager.store.user_message(0).unwrap();
        assert_eq!(confirmed.id, "t-1_r0_user");
        assert!(!confirmed.optimistic);

        let state = manager.store.round_state();
        assert!(!state.has_early_optimistic_message);
        assert_eq!(state.streaming_round, Some(0));
        assert!(manager.store.pre_search(0).is_some(), "placeholder kept on confirm");
        assert!(!manager.has_pending(0));
    }

    #[test]
    fn test_mismatched_confirmation_rolls_back() {
        let manager = manager(false);
        let before = manager.store.state();
        let permit = manager.submit("hello").unwrap();

        let err = manager
            .confirm(permit, Message::user("someone-else", 0, "hello"))
            .unwrap_err();
        assert_eq!(err.code(), "MUTATION_FAILURE");
        assert_eq!(manager.store.state(), before);
    }

    #[test]
    fn test_config_applied_only_on_confirm() {
        let manager = manager(false);
        let config = SessionConfig {
            web_search_enabled: true,
            participants: participants(3),
            mode: ChatMode::Debating,
        };

        let permit = manager.submit_with_config("q", config.clone()).unwrap();
        assert!(manager.store.round_state().waiting_for_config_sync);
        assert!(manager.store.pre_search(0).is_some());
        manager
            .confirm(permit, Message::user("t-1_r0_user", 0, "q"))
            .unwrap();
        assert_eq!(manager.store.session_config(), config);
        assert!(!manager.store.round_state().waiting_for_config_sync);
    }

    #[test]
    fn test_rollback_discards_pending_config() {
        let manager = manager(false);
        let before = manager.store.state();
        let config = SessionConfig {
            web_search_enabled: true,
            participants: participants(1),
            mode: ChatMode::Solving,
        };
        let permit = manager.submit_with_config("q", config).unwrap();
        manager.rollback(
            permit,
            &RoundError::MutationFailure {
                message: "config rejected".into(),
            },
        );
        assert_eq!(manager.store.state(), before);
    }

    #[test]
    fn test_submit_rejected_while_other_round_streams() {
        let manager = manager(false);
        manager
            .store
            .append_message(Message::user("t-1_r0_user", 0, "first"))
            .unwrap();
        manager.store.begin_streaming(0).unwrap();
        let err = manager.submit("too early").unwrap_err();
        assert_eq!(
            err,
            RoundError::RoundInProgress {
                active: 0,
                requested: 1
            }
        );
        assert!(!manager.has_pending(1));
    }
}
