//! Deterministic message identifiers
//!
//! The server derives message ids from thread, round and turn position, so
//! the client can compute the same id before confirmation and suppress
//! duplicates when the authoritative copy arrives.

use super::types::MessageId;

const OPTIMISTIC_PREFIX: &str = "optimistic-";

pub fn user_message_id(thread_id: &str, round: u32) -> MessageId {
    format!("{thread_id}_r{round}_user")
}

pub fn participant_message_id(thread_id: &str, round: u32, participant_index: usize) -> MessageId {
    format!("{thread_id}_r{round}_p{participant_index}")
}

pub fn moderator_message_id(thread_id: &str, round: u32) -> MessageId {
    format!("{thread_id}_r{round}_moderator")
}

/// Fresh id for a speculative local message
pub fn optimistic_message_id() -> MessageId {
    format!("{OPTIMISTIC_PREFIX}{}", uuid::Uuid::new_v4())
}

pub fn is_optimistic_id(id: &str) -> bool {
    id.starts_with(OPTIMISTIC_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_ids() {
        assert_eq!(user_message_id("t1", 0), "t1_r0_user");
        assert_eq!(participant_message_id("t1", 3, 2), "t1_r3_p2");
        assert_eq!(moderator_message_id("t1", 1), "t1_r1_moderator");
    }

    #[test]
    fn test_optimistic_ids_are_unique_and_tagged() {
        let a = optimistic_message_id();
        let b = optimistic_message_id();
        assert_ne!(a, b);
        assert!(is_optimistic_id(&a));
        assert!(!is_optimistic_id(&user_message_id("t1", 0)));
    }
}
