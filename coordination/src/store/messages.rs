//! Message operations and per-round message invariants

use chrono::Utc;
use tracing::{debug, warn};

use super::{ConversationStore, SessionState};
use crate::error::{RoundError, RoundResult};
use crate::events::StoreEvent;
use crate::model::{Message, MessageRole, MessageStatus};

impl SessionState {
    /// Check that `message` may be appended
    fn check_append(&self, message: &Message) -> RoundResult<()> {
        if message.id.is_empty() {
            return Err(RoundError::invariant("message id must not be empty"));
        }
        if self.messages.iter().any(|m| m.id == message.id) {
            return Err(RoundError::invariant(format!(
                "duplicate message id {}",
                message.id
            )));
        }
        if let Some(last) = self.messages.last() {
            if message.round < last.round {
                return Err(RoundError::invariant(format!(
                    "round {} appended after round {}",
                    message.round, last.round
                )));
            }
        }

        let in_round = self.messages.iter().filter(|m| m.round == message.round);
        match message.role {
            MessageRole::User => {
                if in_round.into_iter().any(|m| m.role == MessageRole::User) {
                    return Err(RoundError::invariant(format!(
                        "round {} already has a user message",
                        message.round
                    )));
                }
            }
            MessageRole::Assistant => {
                let Some(pid) = message.participant_id.as_deref() else {
                    return Err(RoundError::invariant(
                        "assistant message without participant id",
                    ));
                };
                let exists = in_round.into_iter().any(|m| {
                    m.role == MessageRole::Assistant && m.participant_id.as_deref() == Some(pid)
                });
                if exists {
                    return Err(RoundError::invariant(format!(
                        "participant {pid} already answered round {}",
                        message.round
                    )));
                }
            }
            MessageRole::Moderator => {
                if in_round.into_iter().any(|m| m.role == MessageRole::Moderator) {
                    return Err(RoundError::invariant(format!(
                        "round {} already has a moderator message",
                        message.round
                    )));
                }
            }
        }
        Ok(())
    }

    fn message_mut(&mut self, id: &str) -> RoundResult<&mut Message> {
        self.messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| RoundError::not_found("message", id))
    }
}

fn appended(message: &Message) -> StoreEvent {
    StoreEvent::MessageAppended {
        message_id: message.id.clone(),
        role: message.role,
        round: message.round,
        participant_index: message.participant_index,
        status: message.status,
        timestamp: Utc::now(),
    }
}

fn updated(message: &Message) -> StoreEvent {
    StoreEvent::MessageUpdated {
        message_id: message.id.clone(),
        round: message.round,
        status: message.status,
        timestamp: Utc::now(),
    }
}

impl ConversationStore {
    /// Append a message, enforcing the per-round invariants
    pub fn append_message(&self, message: Message) -> RoundResult<()> {
        self.mutate(|state, events| {
            state.check_append(&message)?;
            debug!(
                message_id = %message.id,
                role = %message.role,
                round = message.round,
                "Message appended"
            );
            events.push(appended(&message));
            state.messages.push(message);
            Ok(())
        })
    }

    /// Append a streamed delta to a message
    pub fn append_delta(&self, id: &str, delta: &str) -> RoundResult<()> {
        self.mutate(|state, events| {
            let message = state.message_mut(id)?;
            if message.status.is_final() {
                return Err(RoundError::invariant(format!(
                    "delta for finalized message {id}"
                )));
            }
            message.push_delta(delta);
            events.push(updated(message));
            Ok(())
        })
    }

    /// Drop the content of an unfinished message so it can stream again
    pub fn restart_message(&self, id: &str) -> RoundResult<()> {
        self.mutate(|state, events| {
            let message = state.message_mut(id)?;
            if message.status.is_final() {
                return Err(RoundError::invariant(format!(
                    "cannot restart finalized message {id}"
                )));
            }
            message.parts.clear();
            message.error = None;
            debug!(message_id = %id, round = message.round, "Message content reset");
            events.push(updated(message));
            Ok(())
        })
    }

    /// Finalize a message with a terminal status
    ///
    /// `content`, when given, replaces the streamed parts with the
    /// authoritative text.
    pub fn finish_message(
        &self,
        id: &str,
        status: MessageStatus,
        content: Option<String>,
        error: Option<String>,
    ) -> RoundResult<()> {
        self.mutate(|state, events| {
            let message = state.message_mut(id)?;
            if let Some(text) = content {
                message.parts = vec![crate::model::MessagePart::Text(text)];
            }
            message.status = status;
            message.error = error;
            events.push(updated(message));
            Ok(())
        })
    }

    /// Remove a message by id
    pub fn remove_message(&self, id: &str) -> Option<Message> {
        self.mutate(|state, events| {
            let pos = state.messages.iter().position(|m| m.id == id)?;
            let removed = state.messages.remove(pos);
            events.push(StoreEvent::MessageRemoved {
                message_id: removed.id.clone(),
                round: removed.round,
                timestamp: Utc::now(),
            });
            Some(removed)
        })
    }

    /// Insert or replace the server-confirmed copy of a message
    ///
    /// Replaces in place when the id is already present, so confirmed
    /// messages keep their position.
    pub fn upsert_message(&self, message: Message) -> RoundResult<()> {
        let exists = self.read(|s| s.messages.iter().any(|m| m.id == message.id));
        if !exists {
            return self.append_message(message);
        }
        self.mutate(|state, events| {
            let slot = state.message_mut(&message.id)?;
            *slot = message;
            events.push(updated(slot));
            Ok(())
        })
    }

    /// Replace the message list with the server's copy
    ///
    /// Skipped while an optimistic message or a config change awaits
    /// confirmation; returns whether the sync was applied.
    pub fn sync_messages(&self, mut server_messages: Vec<Message>) -> bool {
        self.mutate(|state, events| {
            if state.round.has_early_optimistic_message || state.round.waiting_for_config_sync {
                warn!(
                    incoming = server_messages.len(),
                    "Message sync skipped while optimistic update pending"
                );
                return false;
            }
            server_messages.sort_by_key(|m| m.round);
            let mut seen = std::collections::HashSet::new();
            server_messages.retain(|m| seen.insert(m.id.clone()));
            events.push(StoreEvent::MessagesSynced {
                count: server_messages.len(),
                timestamp: Utc::now(),
            });
            state.messages = server_messages;
            true
        })
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        self.read(|s| s.messages.iter().find(|m| m.id == id).cloned())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.read(|s| s.messages.clone())
    }

    pub fn message_count(&self) -> usize {
        self.read(|s| s.messages.len())
    }

    pub fn messages_for_round(&self, round: u32) -> Vec<Message> {
        self.read(|s| {
            s.messages
                .iter()
                .filter(|m| m.round == round)
                .cloned()
                .collect()
        })
    }

    /// Assistant messages for `round`, moderator output excluded
    pub fn participant_messages(&self, round: u32) -> Vec<Message> {
        self.read(|s| {
            s.messages
                .iter()
                .filter(|m| m.round == round && m.is_participant_response())
                .cloned()
                .collect()
        })
    }

    /// The assistant message a participant index produced in `round`
    pub fn participant_message(&self, round: u32, index: usize) -> Option<Message> {
        self.read(|s| {
            s.messages
                .iter()
                .find(|m| {
                    m.round == round
                        && m.is_participant_response()
                        && m.participant_index == Some(index)
                })
                .cloned()
        })
    }

    pub fn user_message(&self, round: u32) -> Option<Message> {
        self.read(|s| {
            s.messages
                .iter()
                .find(|m| m.round == round && m.role == MessageRole::User)
                .cloned()
        })
    }

    /// Highest round with any message
    pub fn latest_round(&self) -> Option<u32> {
        self.read(|s| s.messages.last().map(|m| m.round))
    }

    /// Round a new user message would start
    pub fn next_round(&self) -> u32 {
        self.latest_round().map_or(0, |r| r + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::store;
    use crate::error::RoundError;
    use crate::model::{Message, MessageStatus};

    #[test]
    fn test_one_user_message_per_round() {
        let store = store(2, false);
        store.append_message(Message::user("u-0", 0, "a")).unwrap();
        let err = store
            .append_message(Message::user("u-0b", 0, "b"))
            .unwrap_err();
        assert!(matches!(err, RoundError::InvariantViolation { .. }));
    }

    #[test]
    fn test_one_assistant_message_per_participant_per_round() {
        let store = store(2, false);
        store.append_message(Message::user("u-0", 0, "q")).unwrap();
        store
            .append_message(Message::assistant("a-0", 0, "p-0", 0))
            .unwrap();
        assert!(store
            .append_message(Message::assistant("a-0-dup", 0, "p-0", 0))
            .is_err());
        store
            .append_message(Message::assistant("a-1", 0, "p-1", 1))
            .unwrap();
        assert_eq!(store.participant_messages(0).len(), 2);
    }

    #[test]
    fn test_one_moderator_message_per_round() {
        let store = store(1, false);
        store.append_message(Message::moderator("m-0", 0)).unwrap();
        assert!(store.append_message(Message::moderator("m-0b", 0)).is_err());
    }

    #[test]
    fn test_rounds_non_decreasing() {
        let store = store(1, false);
        store.append_message(Message::user("u-1", 1, "q")).unwrap();
        let err = store
            .append_message(Message::user("u-0", 0, "late"))
            .unwrap_err();
        assert!(err.to_string().contains("round 0 appended after round 1"));
        assert_eq!(store.next_round(), 2);
    }

    #[test]
    fn test_delta_and_finish() {
        let store = store(1, false);
        store
            .append_message(Message::assistant("a-0", 0, "p-0", 0))
            .unwrap();
        store.append_delta("a-0", "par").unwrap();
        store.append_delta("a-0", "tial").unwrap();
        assert_eq!(store.message("a-0").unwrap().text(), "partial");

        store
            .finish_message("a-0", MessageStatus::Complete, None, None)
            .unwrap();
        assert!(store.append_delta("a-0", "late").is_err());
        assert_eq!(store.message("a-0").unwrap().text(), "partial");
    }

    #[test]
    fn test_restart_clears_partial_content() {
        let store = store(1, false);
        store
            .append_message(Message::assistant("a-0", 0, "p-0", 0))
            .unwrap();
        store.append_delta("a-0", "stale-partial ").unwrap();
        store.restart_message("a-0").unwrap();
        store.append_delta("a-0", "fresh").unwrap();
        assert_eq!(store.message("a-0").unwrap().text(), "fresh");

        store
            .finish_message("a-0", MessageStatus::Complete, None, None)
            .unwrap();
        assert!(store.restart_message("a-0").is_err());
        assert_eq!(store.message("a-0").unwrap().text(), "fresh");
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let store = store(1, false);
        store.append_message(Message::user("u-0", 0, "draft")).unwrap();
        store
            .append_message(Message::assistant("a-0", 0, "p-0", 0))
            .unwrap();
        store
            .upsert_message(Message::user("u-0", 0, "confirmed"))
            .unwrap();
        let messages = store.messages();
        assert_eq!(messages[0].text(), "confirmed");
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_sync_skipped_while_optimistic_guard_raised() {
        let store = store(1, false);
        store.append_message(Message::user("u-0", 0, "local")).unwrap();
        store.set_has_early_optimistic_message(true);
        assert!(!store.sync_messages(Vec::new()));
        assert_eq!(store.message_count(), 1);

        store.set_has_early_optimistic_message(false);
        assert!(store.sync_messages(vec![
            Message::user("u-1", 1, "b"),
            Message::user("u-0", 0, "a"),
            Message::user("u-0", 0, "dup"),
        ]));
        let ids: Vec<_> = store.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["u-0", "u-1"]);
    }
}
