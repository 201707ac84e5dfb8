//! Structural validation of persisted snapshots

use std::collections::HashSet;

use crate::model::StreamSnapshot;

/// Integrity check result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityStatus {
    /// Snapshot is valid and can be resumed.
    Valid,
    /// Snapshot has minor issues but is recoverable.
    Recoverable { warnings: Vec<String> },
    /// Snapshot is corrupted and cannot be used.
    Corrupted { errors: Vec<String> },
}

impl IntegrityStatus {
    /// Whether resume is safe.
    pub fn can_resume(&self) -> bool {
        matches!(self, Self::Valid | Self::Recoverable { .. })
    }

    /// All violations joined into one line, empty when resumable.
    pub fn error_summary(&self) -> String {
        match self {
            Self::Corrupted { errors } => errors.join("; "),
            _ => String::new(),
        }
    }
}

/// Validate a snapshot's structure before resuming from it.
///
/// Every violation is reported, not just the first.
pub fn validate_snapshot(snapshot: &StreamSnapshot) -> IntegrityStatus {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    // Required identifiers
    if snapshot.stream_id.trim().is_empty() {
        errors.push("missing stream id".to_string());
    }
    if snapshot.thread_id.trim().is_empty() {
        errors.push("missing thread id".to_string());
    }
    if snapshot.round < 0 {
        errors.push(format!("negative round {}", snapshot.round));
    }

    // Completed and pending sets must be disjoint
    let completed: HashSet<&str> = snapshot
        .completed_participant_ids
        .iter()
        .map(String::as_str)
        .collect();
    for id in &snapshot.pending_participant_ids {
        if completed.contains(id.as_str()) {
            errors.push(format!("participant {} is both completed and pending", id));
        }
    }
    if completed.len() < snapshot.completed_participant_ids.len() {
        warnings.push("duplicate completed participant ids".to_string());
    }

    for (pos, message) in snapshot.messages.iter().enumerate() {
        if message.id.trim().is_empty() {
            errors.push(format!("message {} has no id", pos));
        }
        if message.participant_id.trim().is_empty() {
            errors.push(format!("message {} has no participant id", pos));
        }
        if message.round as i64 != snapshot.round {
            warnings.push(format!(
                "message {} belongs to round {} not {}",
                pos, message.round, snapshot.round
            ));
        }
    }

    if !errors.is_empty() {
        IntegrityStatus::Corrupted { errors }
    } else if !warnings.is_empty() {
        IntegrityStatus::Recoverable { warnings }
    } else {
        IntegrityStatus::Valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageStatus, SnapshotMessage};

    fn message(id: &str, participant_id: &str, round: u32) -> SnapshotMessage {
        SnapshotMessage {
            id: id.to_string(),
            participant_id: participant_id.to_string(),
            round,
            content: "hi".to_string(),
            status: MessageStatus::Complete,
        }
    }

    #[test]
    fn test_valid_snapshot() {
        let mut snapshot = StreamSnapshot::new("s-1", "t-1", 1);
        snapshot.completed_participant_ids = vec!["p-0".into()];
        snapshot.pending_participant_ids = vec!["p-1".into()];
        snapshot.messages = vec![message("m-0", "p-0", 1)];
        assert_eq!(validate_snapshot(&snapshot), IntegrityStatus::Valid);
    }

    #[test]
    fn test_every_violation_is_reported() {
        let mut snapshot = StreamSnapshot::new("", "t-1", 0);
        snapshot.round = -2;
        snapshot.completed_participant_ids = vec!["p-0".into()];
        snapshot.pending_participant_ids = vec!["p-0".into()];
        snapshot.messages = vec![message("", "", 0)];

        match validate_snapshot(&snapshot) {
            IntegrityStatus::Corrupted { errors } => assert_eq!(errors.len(), 5, "{errors:?}"),
            other => panic!("expected corrupted, got {other:?}"),
        }
    }

    #[test]
    fn test_minor_issues_are_recoverable() {
        let mut snapshot = StreamSnapshot::new("s-1", "t-1", 2);
        snapshot.completed_participant_ids = vec!["p-0".into(), "p-0".into()];
        snapshot.messages = vec![message("m-0", "p-0", 1)];

        let status = validate_snapshot(&snapshot);
        assert!(matches!(status, IntegrityStatus::Recoverable { ref warnings } if warnings.len() == 2));
        assert!(status.can_resume());
        assert!(status.error_summary().is_empty());
    }
}
