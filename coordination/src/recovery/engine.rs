//! Strategy selection, merging and write-back

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, info, warn};

use super::integrity::{validate_snapshot, IntegrityStatus};
use super::source::SnapshotSource;
use super::types::{LocalRoundState, RecoveryStrategy, ResumptionResult};
use crate::config::RoundConfig;
use crate::error::{RoundError, RoundResult};
use crate::model::{
    AnalysisRecord, Message, MessageStatus, PreSearchRecord, RecordStatus, StreamSnapshot,
};
use crate::phase::RoundPhase;
use crate::store::ConversationStore;

/// Resumes interrupted rounds from persisted snapshots
#[derive(Debug, Clone, Default)]
pub struct ResumptionEngine {
    config: RoundConfig,
}

impl ResumptionEngine {
    pub fn new(config: RoundConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RoundConfig {
        &self.config
    }

    /// One resumption attempt at the current time
    pub async fn attempt_resumption(
        &self,
        stream_id: &str,
        source: &dyn SnapshotSource,
        local: &LocalRoundState,
    ) -> ResumptionResult {
        self.attempt_resumption_at(stream_id, source, local, Utc::now())
            .await
    }

    /// One resumption attempt with an explicit clock
    ///
    /// Fetch errors, invalid snapshots, staleness and panics raised by the
    /// source all become a `Restart` result.
    pub async fn attempt_resumption_at(
        &self,
        stream_id: &str,
        source: &dyn SnapshotSource,
        local: &LocalRoundState,
        now: DateTime<Utc>,
    ) -> ResumptionResult {
        let fetched = AssertUnwindSafe(source.fetch_snapshot(stream_id))
            .catch_unwind()
            .await;
        let snapshot = match fetched {
            Ok(Ok(Some(snapshot))) => snapshot,
            Ok(Ok(None)) => {
                info!(stream_id, "No snapshot found, restarting round");
                return ResumptionResult::needs_restart(RoundError::not_found("snapshot", stream_id));
            }
            Ok(Err(e)) => {
                warn!(stream_id, error = %e, "Snapshot fetch failed");
                return ResumptionResult::needs_restart(e.into());
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                warn!(stream_id, reason = %reason, "Snapshot source panicked");
                return ResumptionResult::needs_restart(RoundError::invariant(format!(
                    "snapshot source panicked: {reason}"
                )));
            }
        };

        match self.resolve(stream_id, snapshot, local, now) {
            Ok(result) => {
                info!(
                    stream_id,
                    strategy = %result.recovery_strategy,
                    "Resumption succeeded"
                );
                result
            }
            Err(e) => {
                warn!(stream_id, error = %e, code = e.code(), "Resumption rejected snapshot");
                ResumptionResult::needs_restart(e)
            }
        }
    }

    /// Retry transient fetch failures with a fixed backoff
    ///
    /// Only an exhausted budget or a non-retryable failure is returned as a
    /// restart signal.
    pub async fn attempt_with_retries(
        &self,
        stream_id: &str,
        source: &dyn SnapshotSource,
        local: &LocalRoundState,
    ) -> ResumptionResult {
        let attempts = self.config.resumption_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = self.attempt_resumption(stream_id, source, local).await;
            if !result.is_retryable() || attempt >= attempts {
                if !result.success {
                    warn!(stream_id, attempt, "Resumption gave up, full restart required");
                }
                return result;
            }
            debug!(stream_id, attempt, "Retrying snapshot fetch");
            tokio::time::sleep(self.config.resumption_backoff()).await;
            attempt += 1;
        }
    }

    fn resolve(
        &self,
        stream_id: &str,
        snapshot: StreamSnapshot,
        local: &LocalRoundState,
        now: DateTime<Utc>,
    ) -> RoundResult<ResumptionResult> {
        let status = validate_snapshot(&snapshot);
        if !status.can_resume() {
            return Err(RoundError::validation(status.error_summary()));
        }
        if let IntegrityStatus::Recoverable { warnings } = &status {
            debug!(stream_id, ?warnings, "Snapshot has minor issues");
        }
        if snapshot.stream_id != stream_id {
            return Err(RoundError::validation(format!(
                "snapshot belongs to stream {} not {}",
                snapshot.stream_id, stream_id
            )));
        }

        let age = snapshot.age(now);
        let threshold = self.config.stale_snapshot_after();
        if age > threshold {
            return Err(RoundError::StaleData {
                age_secs: age.num_seconds(),
                threshold_secs: threshold.num_seconds(),
            });
        }

        if local.completed_count() > snapshot.completed_participant_ids.len() {
            Ok(ResumptionResult::partial(merge(snapshot, local)))
        } else {
            Ok(ResumptionResult::full(snapshot))
        }
    }

    /// Write a successful result back into `store`
    ///
    /// Recovered participant messages replace local copies, records marked
    /// complete in the snapshot are completed, and the participant index is
    /// restored. Returns the phase the detector now reports for the round.
    pub fn apply_to_store(
        &self,
        result: &ResumptionResult,
        store: &ConversationStore,
    ) -> RoundResult<RoundPhase> {
        let state = match (&result.state, result.success) {
            (Some(state), true) => state,
            _ => {
                return Err(result
                    .error
                    .clone()
                    .unwrap_or_else(|| RoundError::validation("resumption did not succeed")))
            }
        };
        let round = state
            .round_number()
            .ok_or_else(|| RoundError::validation(format!("negative round {}", state.round)))?;

        let participants = store.enabled_participants();
        for recovered in &state.messages {
            let Some(index) = participants
                .iter()
                .position(|p| p.id == recovered.participant_id)
            else {
                warn!(round, participant_id = %recovered.participant_id, "Recovered message for unknown participant");
                continue;
            };
            if let Some(existing) = store.participant_message(round, index) {
                if existing.id != recovered.id {
                    store.remove_message(&existing.id);
                }
            }
            let message = Message::assistant(
                recovered.id.clone(),
                round,
                recovered.participant_id.clone(),
                index,
            )
            .with_text(recovered.content.clone())
            .with_status(recovered.status);
            if let Err(e) = store.upsert_message(message) {
                warn!(round, message_id = %recovered.id, error = %e, "Recovered message not applied");
            }
        }

        if state.pre_search_complete {
            settle_pre_search(store, round);
        }
        if state.analysis_complete {
            settle_analysis(store, round);
        }

        let completed = store
            .participant_messages(round)
            .iter()
            .filter(|m| m.status == MessageStatus::Complete || m.status == MessageStatus::Error)
            .count();
        store.set_current_participant_index(state.current_participant_index.max(completed));

        let phase = store.phase_for_round(round);
        info!(
            round,
            stream_id = %state.stream_id,
            %phase,
            strategy = %result.recovery_strategy,
            "Recovered state applied"
        );
        Ok(phase)
    }
}

/// Make the local pre-search record for `round` complete
///
/// An active record is completed with whatever result it holds. A missing
/// or failed record is replaced by a complete one.
fn settle_pre_search(store: &ConversationStore, round: u32) {
    match store.pre_search(round) {
        Some(record) if record.status == RecordStatus::Complete => {}
        Some(record) if record.status.is_active() => {
            if let Err(e) = store.complete_pre_search(round, record.result.unwrap_or_default()) {
                warn!(round, error = %e, "Recovered pre-search not completed");
            }
        }
        _ => {
            let query = store
                .user_message(round)
                .map(|m| m.text())
                .unwrap_or_default();
            let mut record = PreSearchRecord::new(round, query);
            record.status = RecordStatus::Complete;
            record.result = Some(serde_json::Value::Null);
            debug!(round, record_id = %record.id, "Inserted recovered pre-search");
            store.replace_pre_search(record);
        }
    }
    store.mark_pre_search_triggered(round);
}

/// Make the local analysis record for `round` complete
fn settle_analysis(store: &ConversationStore, round: u32) {
    match store.analysis(round) {
        Some(record) if record.status == RecordStatus::Complete => {}
        Some(record) if record.status.is_active() => {
            if let Err(e) = store.complete_analysis(round, record.payload.unwrap_or_default()) {
                warn!(round, error = %e, "Recovered analysis not completed");
            }
        }
        _ => {
            let ids = store
                .participant_messages(round)
                .into_iter()
                .map(|m| m.id)
                .collect();
            let mut record = AnalysisRecord::new(round, ids);
            record.status = RecordStatus::Complete;
            record.payload = Some(serde_json::Value::Null);
            debug!(round, record_id = %record.id, "Inserted recovered analysis");
            store.replace_analysis(record);
        }
    }
    store.mark_analysis_created(round);
}

/// Union messages by id (snapshot wins) and completed ids (deduplicated)
fn merge(mut snapshot: StreamSnapshot, local: &LocalRoundState) -> StreamSnapshot {
    let known: HashSet<String> = snapshot.messages.iter().map(|m| m.id.clone()).collect();
    snapshot.messages.extend(
        local
            .messages
            .iter()
            .filter(|m| !known.contains(&m.id))
            .cloned(),
    );

    for id in &local.completed_participant_ids {
        if !snapshot.completed_participant_ids.contains(id) {
            snapshot.completed_participant_ids.push(id.clone());
        }
    }
    let completed = &snapshot.completed_participant_ids;
    snapshot
        .pending_participant_ids
        .retain(|id| !completed.contains(id));
    snapshot.current_participant_index = snapshot
        .current_participant_index
        .max(snapshot.completed_participant_ids.len());
    snapshot
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
