//! Streaming sequencer: turns phase and barrier state into "what happens next".
//!
//! Decision functions read the store; the drive loop in [`StreamingSequencer::run_round`]
//! executes them in order for one round:
//!
//! ```text
//! begin_streaming
//!   ├─ search enabled, no record → create PENDING pre-search
//!   ├─ record PENDING            → execute (failure/timeout recorded, never blocking)
//!   ├─ for each enabled participant, in priority order:
//!   │     stream turn → finalize message → wait own barrier → index + 1
//!   ├─ all done + barrier(last) + not yet created → create analysis → stream summary
//!   └─ complete_round
//! ```
//!
//! No single participant, search or summary failure aborts the round.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::barrier::AnimationBarrier;
use crate::config::RoundConfig;
use crate::error::{RoundError, RoundResult};
use crate::model::ids::{moderator_message_id, participant_message_id};
use crate::model::{AnalysisRecord, Message, MessageStatus, RecordStatus};
use crate::phase::RoundPhase;
use crate::store::SharedConversationStore;
use crate::transport::{RoundTransport, TurnEvent, TurnRequest};

/// Buffered turn events between transport and sequencer
const TURN_CHANNEL_CAPACITY: usize = 64;

/// What the sequencer would do next for a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    /// Pre-search record must be created.
    CreatePreSearch,
    /// Pre-search record is PENDING and must be executed.
    ExecutePreSearch,
    /// Waiting for the running search.
    AwaitPreSearch,
    /// Participant at this index should stream.
    StartParticipant(usize),
    /// Analysis should be created and streamed.
    CreateAnalysis,
    /// Waiting for the running summary.
    AwaitAnalysis,
    /// Analysis failed and may be retried.
    RetryAnalysis,
    /// Nothing left to do.
    Complete,
    /// No round in progress.
    Idle,
}

impl std::fmt::Display for NextAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreatePreSearch => write!(f, "create_pre_search"),
            Self::ExecutePreSearch => write!(f, "execute_pre_search"),
            Self::AwaitPreSearch => write!(f, "await_pre_search"),
            Self::StartParticipant(i) => write!(f, "start_participant({})", i),
            Self::CreateAnalysis => write!(f, "create_analysis"),
            Self::AwaitAnalysis => write!(f, "await_analysis"),
            Self::RetryAnalysis => write!(f, "retry_analysis"),
            Self::Complete => write!(f, "complete"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

/// Result of driving one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub round: u32,
    /// Phase the detector reports once the loop ended.
    pub phase: RoundPhase,
    pub pre_search_status: Option<RecordStatus>,
    pub participants_completed: usize,
    pub participants_failed: usize,
    pub analysis_status: Option<RecordStatus>,
    /// The loop ended because of a stop request.
    pub stopped: bool,
}

impl RoundOutcome {
    /// Round finished with every participant and the summary complete.
    pub fn is_clean(&self) -> bool {
        !self.stopped
            && self.participants_failed == 0
            && self.analysis_status == Some(RecordStatus::Complete)
    }

    /// Compact summary line.
    pub fn summary_line(&self) -> String {
        format!(
            "[{}] round {} | participants {} ok / {} failed | analysis={}{}",
            self.phase,
            self.round,
            self.participants_completed,
            self.participants_failed,
            self.analysis_status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string()),
            if self.stopped { " | stopped" } else { "" }
        )
    }
}

/// Final state of one streamed turn.
#[derive(Debug, Clone, PartialEq)]
struct TurnOutcome {
    status: MessageStatus,
    content: Option<String>,
    error: Option<String>,
    payload: Option<serde_json::Value>,
    cancelled: bool,
}

impl TurnOutcome {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: MessageStatus::Error,
            content: None,
            error: Some(error.into()),
            payload: None,
            cancelled: false,
        }
    }

    fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::failed("cancelled")
        }
    }
}

/// Drives rounds against the conversation store and animation barrier.
pub struct StreamingSequencer {
    store: SharedConversationStore,
    barrier: Arc<AnimationBarrier>,
    config: RoundConfig,
    /// Token of the drive loop currently running, cancelled by [`Self::stop`]
    active: Mutex<Option<CancellationToken>>,
}

impl StreamingSequencer {
    pub fn new(store: SharedConversationStore, barrier: Arc<AnimationBarrier>) -> Self {
        Self::with_config(store, barrier, RoundConfig::default())
    }

    pub fn with_config(
        store: SharedConversationStore,
        barrier: Arc<AnimationBarrier>,
        config: RoundConfig,
    ) -> Self {
        Self {
            store,
            barrier,
            config,
            active: Mutex::new(None),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &SharedConversationStore {
        &self.store
    }

    pub fn barrier(&self) -> &Arc<AnimationBarrier> {
        &self.barrier
    }

    // =========================================================================
    // Decisions
    // =========================================================================

    /// Whether a message may be sent for `round`.
    ///
    /// Blocked only while the round's pre-search is PENDING or STREAMING; a
    /// missing record (degraded mode) or a terminal one allows sending.
    pub fn can_send_message(&self, round: u32) -> bool {
        !matches!(self.store.pre_search(round), Some(r) if r.status.is_active())
    }

    /// Whether a pre-search record should be created for `round`.
    pub fn should_create_pre_search(&self, round: u32) -> bool {
        self.store.thread().web_search_enabled && self.store.pre_search(round).is_none()
    }

    /// Whether the pre-search for `round` should be executed now.
    pub fn should_execute_pre_search(&self, round: u32) -> bool {
        matches!(self.store.pre_search(round), Some(r) if r.status == RecordStatus::Pending)
    }

    /// Whether the participant at `index` has a finalized message for `round`.
    pub fn is_participant_finalized(&self, round: u32, index: usize) -> bool {
        self.store
            .participant_message(round, index)
            .is_some_and(|m| m.status.is_final())
    }

    /// Whether every enabled participant has answered `round` and all
    /// answers are final.
    pub fn all_participants_done(&self, round: u32) -> bool {
        let phase = self.store.phase_for_round(round);
        if !matches!(phase, RoundPhase::Moderator | RoundPhase::Complete) {
            return false;
        }
        self.store
            .participant_messages(round)
            .iter()
            .all(|m| m.status.is_final())
    }

    /// Wait until the next participant may start.
    ///
    /// Requires the participant at `index` to be finalized, then waits for
    /// its own animation. Advances the store's index and returns it; a stop
    /// requested meanwhile leaves the index where it was.
    pub async fn await_next_participant(&self, round: u32, index: usize) -> RoundResult<usize> {
        if !self.is_participant_finalized(round, index) {
            return Err(RoundError::invariant(format!(
                "participant {index} has not finalized round {round}"
            )));
        }
        self.barrier
            .wait_for_animation(index)
            .wait()
            .await
            .map_err(|e| RoundError::cancelled(e.to_string()))?;

        if self.store.is_stop_requested() {
            debug!(round, participant_index = index, "Stopped, index not advanced");
            return Err(RoundError::cancelled("stopped"));
        }
        let next = index + 1;
        self.store.set_current_participant_index(next);
        debug!(round, participant_index = next, "Advanced to next participant");
        Ok(next)
    }

    /// Whether analysis may be created for `round`.
    ///
    /// Participants must be done, the round must not be claimed yet, and the
    /// last participant's animation must have settled.
    pub async fn should_create_analysis(&self, round: u32) -> bool {
        if !self.all_participants_done(round) || self.store.has_analysis_been_created(round) {
            return false;
        }
        let enabled = self.store.enabled_participants().len();
        let last = enabled.saturating_sub(1);
        if let Err(e) = self.barrier.wait_for_animation(last).wait().await {
            warn!(round, error = %e, "Barrier cleared while waiting for last participant");
            return false;
        }
        !self.store.has_analysis_been_created(round)
    }

    /// Create the analysis record for `round` once permitted.
    ///
    /// Calling twice yields one record; the second call returns `None`.
    pub async fn create_analysis(&self, round: u32) -> Option<AnalysisRecord> {
        if !self.should_create_analysis(round).await {
            return None;
        }
        let ids = self
            .store
            .participant_messages(round)
            .into_iter()
            .map(|m| m.id)
            .collect();
        let record = self.store.create_analysis(round, ids);
        if record.is_some() {
            info!(round, "Analysis created");
        }
        record
    }

    /// Clear the idempotency marker and the failed record, then re-create.
    pub async fn retry_analysis(&self, round: u32) -> Option<AnalysisRecord> {
        match self.store.analysis(round) {
            Some(record) if record.status == RecordStatus::Complete => return None,
            Some(_) => {
                self.store.remove_analysis(round);
            }
            None => {}
        }
        self.store.clear_analysis_tracking(round);
        info!(round, "Retrying analysis");
        self.create_analysis(round).await
    }

    /// Next step for `round` from current facts.
    pub fn next_action(&self, round: u32) -> NextAction {
        if self.should_create_pre_search(round) {
            return NextAction::CreatePreSearch;
        }
        if self.should_execute_pre_search(round) {
            return NextAction::ExecutePreSearch;
        }
        match self.store.phase_for_round(round) {
            RoundPhase::PreSearch => NextAction::AwaitPreSearch,
            RoundPhase::Participants => {
                let answered = self.store.participant_messages(round).len();
                NextAction::StartParticipant(answered)
            }
            RoundPhase::Moderator => match self.store.analysis(round) {
                Some(r) if r.status == RecordStatus::Failed => NextAction::RetryAnalysis,
                Some(_) => NextAction::AwaitAnalysis,
                None => NextAction::CreateAnalysis,
            },
            RoundPhase::Complete => NextAction::Complete,
            RoundPhase::Idle => NextAction::Idle,
        }
    }

    // =========================================================================
    // Stop and timeouts
    // =========================================================================

    /// Stop the local drive loop.
    ///
    /// Streaming goes inactive, the participant index freezes and partial
    /// content stays in the store. The backend job is not cancelled.
    pub fn stop(&self) {
        self.store.stop_streaming();
        if let Some(token) = self.active().as_ref() {
            token.cancel();
        }
    }

    /// Fail records stuck past their advisory timeouts; returns affected rounds.
    pub fn expire_stale_records(&self, now: DateTime<Utc>) -> Vec<u32> {
        let pre_search_limit = chrono::Duration::from_std(self.config.pre_search_timeout())
            .unwrap_or(chrono::Duration::MAX);
        let analysis_limit = chrono::Duration::from_std(self.config.analysis_timeout())
            .unwrap_or(chrono::Duration::MAX);

        let (stale_searches, stale_analyses) = self.store.read(|s| {
            let searches: Vec<u32> = s
                .pre_searches
                .values()
                .filter(|r| r.status == RecordStatus::Streaming)
                .filter(|r| now - r.updated_at > pre_search_limit)
                .map(|r| r.round)
                .collect();
            let analyses: Vec<u32> = s
                .analyses
                .values()
                .filter(|r| r.status.is_active())
                .filter(|r| now - r.updated_at > analysis_limit)
                .map(|r| r.round)
                .collect();
            (searches, analyses)
        });

        let mut expired = Vec::new();
        for round in stale_searches {
            warn!(round, "Pre-search timed out");
            if self.store.fail_pre_search(round, "pre-search timed out").is_ok() {
                expired.push(round);
            }
        }
        for round in stale_analyses {
            warn!(round, "Analysis timed out");
            if self.store.fail_analysis(round, "analysis timed out").is_ok() && !expired.contains(&round) {
                expired.push(round);
            }
        }
        expired
    }

    // =========================================================================
    // Drive loop
    // =========================================================================

    /// Drive `round` from the first participant.
    pub async fn run_round(
        &self,
        round: u32,
        transport: &dyn RoundTransport,
        cancel: CancellationToken,
    ) -> RoundResult<RoundOutcome> {
        self.run_round_from(round, 0, transport, cancel).await
    }

    /// Drive `round` starting at participant `start_index`.
    ///
    /// Participants that already have a finalized message are not streamed
    /// again, which lets a resumed round continue where the facts say.
    pub async fn run_round_from(
        &self,
        round: u32,
        start_index: usize,
        transport: &dyn RoundTransport,
        cancel: CancellationToken,
    ) -> RoundResult<RoundOutcome> {
        let token = cancel.child_token();
        *self.active() = Some(token.clone());
        let result = self.drive_round(round, start_index, transport, token).await;
        self.active().take();
        result
    }

    async fn drive_round(
        &self,
        round: u32,
        start_index: usize,
        transport: &dyn RoundTransport,
        cancel: CancellationToken,
    ) -> RoundResult<RoundOutcome> {
        self.store.resume_streaming(round, start_index)?;
        let thread = self.store.thread();
        info!(round, thread_id = %thread.id, start_index, "Round started");

        // Pre-search
        if self.should_create_pre_search(round) {
            let query = self
                .store
                .user_message(round)
                .map(|m| m.text())
                .unwrap_or_default();
            self.store.create_pre_search(round, &query)?;
        }
        if self.should_execute_pre_search(round) {
            if !self.store.mark_pre_search_triggered(round) {
                warn!(round, "Pending pre-search was claimed but never ran, executing");
            }
            if self.run_pre_search(round, &thread.id, transport, &cancel).await {
                return Ok(self.stopped_outcome(round));
            }
        }

        // Participants, strictly in order
        let participants = self.store.enabled_participants();
        let search_context = self.store.pre_search(round).and_then(|r| r.result);
        for (index, participant) in participants.iter().enumerate().skip(start_index) {
            if self.is_stopped(&cancel) {
                return Ok(self.stopped_outcome(round));
            }
            self.store.set_current_participant_index(index);

            if !self.is_participant_finalized(round, index) {
                let message_id = match self.store.participant_message(round, index) {
                    Some(existing) => {
                        // Streams again from the start
                        self.store.restart_message(&existing.id)?;
                        existing.id
                    }
                    None => {
                        let id = participant_message_id(&thread.id, round, index);
                        self.store.append_message(Message::assistant(
                            id.clone(),
                            round,
                            participant.id.clone(),
                            index,
                        ))?;
                        id
                    }
                };

                let request = TurnRequest::Participant {
                    thread_id: thread.id.clone(),
                    round,
                    index,
                    participant: participant.clone(),
                    mode: thread.mode,
                    search_context: search_context.clone(),
                };
                let outcome = self
                    .drive_turn(transport, request, &cancel, |event| {
                        if let TurnEvent::Delta { text } = event {
                            if let Err(e) = self.store.append_delta(&message_id, text) {
                                warn!(round, participant_index = index, error = %e, "Dropped delta");
                            }
                        }
                    })
                    .await;

                if outcome.cancelled {
                    self.stop();
                    return Ok(self.stopped_outcome(round));
                }
                if outcome.status == MessageStatus::Error {
                    warn!(
                        round,
                        participant_index = index,
                        error = outcome.error.as_deref().unwrap_or("unknown"),
                        "Participant turn failed"
                    );
                }
                self.store.finish_message(
                    &message_id,
                    outcome.status,
                    outcome.content,
                    outcome.error,
                )?;
            }

            tokio::select! {
                next = self.await_next_participant(round, index) => match next {
                    Ok(_) => {}
                    Err(RoundError::Cancelled { .. }) if self.is_stopped(&cancel) => {
                        return Ok(self.stopped_outcome(round));
                    }
                    Err(RoundError::Cancelled { reason }) => {
                        // Animations were cleared without a stop; nothing left to wait for
                        debug!(round, participant_index = index, reason = %reason, "Barrier cleared");
                        self.store.set_current_participant_index(index + 1);
                    }
                    Err(e) => return Err(e),
                },
                _ = cancel.cancelled() => {
                    self.stop();
                    return Ok(self.stopped_outcome(round));
                }
            }
        }

        if self.is_stopped(&cancel) {
            return Ok(self.stopped_outcome(round));
        }

        // Summary
        let analysis = match self.store.analysis(round) {
            Some(existing) if existing.status == RecordStatus::Failed => {
                self.retry_analysis(round).await
            }
            // Resumed mid-summary: stream it again
            Some(existing) if existing.status.is_active() => Some(existing),
            Some(_) => None,
            None => self.create_analysis(round).await,
        };
        if let Some(record) = analysis {
            if self.run_analysis(&record, &thread, transport, &cancel).await {
                return Ok(self.stopped_outcome(round));
            }
        }

        self.store.complete_round(round);
        let outcome = self.outcome(round, false);
        info!(round, summary = %outcome.summary_line(), "Round finished");
        Ok(outcome)
    }

    /// Execute the PENDING pre-search; returns `true` when stopped.
    async fn run_pre_search(
        &self,
        round: u32,
        thread_id: &str,
        transport: &dyn RoundTransport,
        cancel: &CancellationToken,
    ) -> bool {
        let query = self
            .store
            .pre_search(round)
            .map(|r| r.query)
            .unwrap_or_default();
        let request = TurnRequest::PreSearch {
            thread_id: thread_id.to_string(),
            round,
            query,
        };

        let turn = self.drive_turn(transport, request, cancel, |event| match event {
            TurnEvent::Started => {
                if let Err(e) = self.store.update_pre_search_status(round, RecordStatus::Streaming) {
                    debug!(round, error = %e, "Pre-search start ignored");
                }
            }
            TurnEvent::Delta { .. } => self.store.touch_pre_search(round),
            TurnEvent::Finished { .. } => {}
        });
        let outcome = match tokio::time::timeout(self.config.pre_search_timeout(), turn).await {
            Ok(outcome) => outcome,
            Err(_) => TurnOutcome::failed("pre-search timed out"),
        };

        if outcome.cancelled {
            self.stop();
            return true;
        }
        let result = match outcome.status {
            MessageStatus::Complete => {
                let payload = outcome
                    .payload
                    .unwrap_or_else(|| serde_json::json!({ "summary": outcome.content }));
                self.store.complete_pre_search(round, payload)
            }
            _ => {
                let error = outcome.error.unwrap_or_else(|| "pre-search failed".to_string());
                warn!(round, error = %error, "Pre-search failed, participants proceed");
                self.store.fail_pre_search(round, error)
            }
        };
        if let Err(e) = result {
            warn!(round, error = %e, "Pre-search result not recorded");
        }
        false
    }

    /// Stream the moderator summary; returns `true` when stopped.
    async fn run_analysis(
        &self,
        record: &AnalysisRecord,
        thread: &crate::model::Thread,
        transport: &dyn RoundTransport,
        cancel: &CancellationToken,
    ) -> bool {
        let round = record.round;
        let message_id = moderator_message_id(&thread.id, round);
        if self.store.message(&message_id).is_some() {
            // Retry: restart the summary text from scratch
            self.store.remove_message(&message_id);
        }
        if let Err(e) = self
            .store
            .append_message(Message::moderator(message_id.clone(), round))
        {
            warn!(round, error = %e, "Moderator message not appended");
        }

        let request = TurnRequest::Moderator {
            thread_id: thread.id.clone(),
            round,
            participant_message_ids: record.participant_message_ids.clone(),
            mode: thread.mode,
        };
        let turn = self.drive_turn(transport, request, cancel, |event| match event {
            TurnEvent::Started => {
                if let Err(e) = self.store.update_analysis_status(round, RecordStatus::Streaming) {
                    debug!(round, error = %e, "Analysis start ignored");
                }
            }
            TurnEvent::Delta { text } => {
                if let Err(e) = self.store.append_delta(&message_id, text) {
                    debug!(round, error = %e, "Dropped moderator delta");
                }
            }
            TurnEvent::Finished { .. } => {}
        });
        let outcome = match tokio::time::timeout(self.config.analysis_timeout(), turn).await {
            Ok(outcome) => outcome,
            Err(_) => TurnOutcome::failed("analysis timed out"),
        };

        if outcome.cancelled {
            self.stop();
            return true;
        }

        let text = outcome.content.clone();
        let finished = self.store.finish_message(
            &message_id,
            outcome.status,
            outcome.content,
            outcome.error.clone(),
        );
        if let Err(e) = finished {
            debug!(round, error = %e, "Moderator message not finalized");
        }

        let result = match outcome.status {
            MessageStatus::Complete => {
                let payload = outcome.payload.unwrap_or_else(|| {
                    let summary = text.unwrap_or_else(|| {
                        self.store
                            .message(&message_id)
                            .map(|m| m.text())
                            .unwrap_or_default()
                    });
                    serde_json::json!({ "summary": summary })
                });
                self.store.complete_analysis(round, payload)
            }
            _ => {
                let error = outcome.error.unwrap_or_else(|| "analysis failed".to_string());
                warn!(round, error = %error, "Analysis failed, round still completes");
                self.store.fail_analysis(round, error)
            }
        };
        if let Err(e) = result {
            warn!(round, error = %e, "Analysis result not recorded");
        }
        false
    }

    /// Run one transport turn, applying progress through `on_event`.
    async fn drive_turn<F>(
        &self,
        transport: &dyn RoundTransport,
        request: TurnRequest,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> TurnOutcome
    where
        F: FnMut(&TurnEvent),
    {
        let kind = request.kind();
        let round = request.round();
        let (tx, mut rx) = mpsc::channel(TURN_CHANNEL_CAPACITY);
        let send = transport.stream_turn(request, tx);
        tokio::pin!(send);

        let mut transport_result = None;
        let mut finished: Option<TurnOutcome> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return TurnOutcome::cancelled(),
                result = &mut send, if transport_result.is_none() => {
                    transport_result = Some(result);
                }
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    on_event(&event);
                    if let TurnEvent::Finished { status, content, error, payload } = event {
                        finished = Some(TurnOutcome {
                            status,
                            content,
                            error,
                            payload,
                            cancelled: false,
                        });
                    }
                }
            }
        }

        // Channel closes once the transport future completed and dropped its sender
        let transport_result = match transport_result {
            Some(result) => result,
            None => send.await,
        };
        match (finished, transport_result) {
            (Some(outcome), _) => outcome,
            (None, Err(e)) => {
                let error = RoundError::transient(kind, e.to_string());
                warn!(round, kind, error = %error, "Turn ended without a result");
                TurnOutcome::failed(e.to_string())
            }
            (None, Ok(())) => TurnOutcome {
                status: MessageStatus::Complete,
                content: None,
                error: None,
                payload: None,
                cancelled: false,
            },
        }
    }

    fn is_stopped(&self, cancel: &CancellationToken) -> bool {
        cancel.is_cancelled() || self.store.is_stop_requested()
    }

    fn stopped_outcome(&self, round: u32) -> RoundOutcome {
        info!(round, "Round stopped locally");
        self.outcome(round, true)
    }

    fn outcome(&self, round: u32, stopped: bool) -> RoundOutcome {
        let messages = self.store.participant_messages(round);
        RoundOutcome {
            round,
            phase: self.store.phase_for_round(round),
            pre_search_status: self.store.pre_search(round).map(|r| r.status),
            participants_completed: messages
                .iter()
                .filter(|m| m.status == MessageStatus::Complete)
                .count(),
            participants_failed: messages
                .iter()
                .filter(|m| m.status == MessageStatus::Error)
                .count(),
            analysis_status: self.store.analysis(round).map(|r| r.status),
            stopped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::store;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::transport::TransportError;

    /// Transport answering every turn with a fixed script.
    #[derive(Default)]
    struct ScriptTransport {
        fail_participants: Vec<usize>,
        fail_moderator: bool,
        fail_search: bool,
        requests: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RoundTransport for ScriptTransport {
        async fn stream_turn(
            &self,
            request: TurnRequest,
            events: mpsc::Sender<TurnEvent>,
        ) -> Result<(), TransportError> {
            let label = match &request {
                TurnRequest::PreSearch { .. } => "search".to_string(),
                TurnRequest::Participant { index, .. } => format!("p{index}"),
                TurnRequest::Moderator { .. } => "moderator".to_string(),
            };
            self.requests.lock().unwrap().push(label.clone());
            let _ = events.send(TurnEvent::Started).await;
            let _ = events.send(TurnEvent::delta(format!("{label} says hi"))).await;
            let fail = match &request {
                TurnRequest::PreSearch { .. } => self.fail_search,
                TurnRequest::Participant { index, .. } => self.fail_participants.contains(index),
                TurnRequest::Moderator { .. } => self.fail_moderator,
            };
            if fail {
                return Err(TransportError::Disconnected("socket closed".into()));
            }
            let _ = events.send(TurnEvent::complete(None)).await;
            Ok(())
        }
    }

    fn sequencer(participants: usize, web_search: bool) -> StreamingSequencer {
        let store = store(participants, web_search).shared();
        StreamingSequencer::new(store, Arc::new(AnimationBarrier::new()))
    }

    #[test]
    fn test_can_send_message_tracks_pre_search() {
        let seq = sequencer(2, true);
        assert!(seq.can_send_message(1), "no record is degraded mode");
        seq.store.create_pre_search(1, "q").unwrap();
        assert!(!seq.can_send_message(1));
        seq.store
            .update_pre_search_status(1, RecordStatus::Streaming)
            .unwrap();
        assert!(!seq.can_send_message(1));
        seq.store.fail_pre_search(1, "boom").unwrap();
        assert!(seq.can_send_message(1));
    }

    #[test]
    fn test_pre_search_decisions() {
        let seq = sequencer(1, true);
        assert!(seq.should_create_pre_search(0));
        assert!(!seq.should_execute_pre_search(0));
        seq.store.create_pre_search(0, "q").unwrap();
        assert!(!seq.should_create_pre_search(0));
        assert!(seq.should_execute_pre_search(0));
        seq.store
            .update_pre_search_status(0, RecordStatus::Streaming)
            .unwrap();
        assert!(!seq.should_execute_pre_search(0));

        let no_search = sequencer(1, false);
        assert!(!no_search.should_create_pre_search(0));
    }

    #[tokio::test]
    async fn test_await_next_participant_requires_finalized_message() {
        let seq = sequencer(2, false);
        seq.store
            .append_message(Message::assistant("a-0", 0, "p-0", 0))
            .unwrap();
        assert!(seq.await_next_participant(0, 0).await.is_err());

        seq.store
            .finish_message("a-0", MessageStatus::Complete, None, None)
            .unwrap();
        assert_eq!(seq.await_next_participant(0, 0).await.unwrap(), 1);
        assert_eq!(seq.store.current_participant_index(), 1);
    }

    #[tokio::test]
    async fn test_await_next_participant_waits_for_own_barrier() {
        let seq = Arc::new(sequencer(2, false));
        seq.store
            .append_message(
                Message::assistant("a-0", 0, "p-0", 0).with_status(MessageStatus::Complete),
            )
            .unwrap();
        seq.barrier.register_animation(0);
        seq.barrier.register_animation(1);

        let waiting = {
            let seq = seq.clone();
            tokio::spawn(async move { seq.await_next_participant(0, 0).await })
        };
        seq.barrier.complete_animation(1);
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished(), "index 1 must not release index 0");

        seq.barrier.complete_animation(0);
        assert_eq!(waiting.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stop_freezes_participant_index() {
        let seq = Arc::new(sequencer(2, false));
        seq.store.resume_streaming(0, 0).unwrap();
        seq.store
            .append_message(
                Message::assistant("a-0", 0, "p-0", 0).with_status(MessageStatus::Complete),
            )
            .unwrap();
        seq.barrier.register_animation(0);

        let waiting = {
            let seq = seq.clone();
            tokio::spawn(async move { seq.await_next_participant(0, 0).await })
        };
        tokio::task::yield_now().await;
        seq.stop();
        seq.barrier.complete_animation(0);

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, RoundError::Cancelled { .. }));
        assert_eq!(seq.store.current_participant_index(), 0);
    }

    #[tokio::test]
    async fn test_next_action_walks_the_round() {
        let seq = sequencer(2, true);
        seq.store.append_message(Message::user("u-0", 0, "q")).unwrap();
        assert_eq!(seq.next_action(0), NextAction::CreatePreSearch);
        seq.store.create_pre_search(0, "q").unwrap();
        assert_eq!(seq.next_action(0), NextAction::ExecutePreSearch);
        seq.store
            .update_pre_search_status(0, RecordStatus::Streaming)
            .unwrap();
        assert_eq!(seq.next_action(0), NextAction::AwaitPreSearch);
        seq.store.complete_pre_search(0, serde_json::json!({})).unwrap();
        assert_eq!(seq.next_action(0), NextAction::StartParticipant(0));
        for i in 0..2 {
            seq.store
                .append_message(
                    Message::assistant(format!("a-{i}"), 0, format!("p-{i}"), i)
                        .with_status(MessageStatus::Complete),
                )
                .unwrap();
        }
        assert_eq!(seq.next_action(0), NextAction::CreateAnalysis);
        seq.create_analysis(0).await.unwrap();
        assert_eq!(seq.next_action(0), NextAction::AwaitAnalysis);
        seq.store.fail_analysis(0, "model overloaded").unwrap();
        assert_eq!(seq.next_action(0), NextAction::RetryAnalysis);
        seq.retry_analysis(0).await.unwrap();
        seq.store
            .complete_analysis(0, serde_json::json!({"summary": "done"}))
            .unwrap();
        assert_eq!(seq.next_action(0), NextAction::Complete);
    }

    #[tokio::test]
    async fn test_retry_analysis_recreates_failed_record() {
        let seq = sequencer(1, false);
        seq.store
            .append_message(
                Message::assistant("a-0", 0, "p-0", 0).with_status(MessageStatus::Complete),
            )
            .unwrap();
        let first = seq.create_analysis(0).await.unwrap();
        seq.store.fail_analysis(0, "timeout").unwrap();

        let retried = seq.retry_analysis(0).await.unwrap();
        assert_ne!(first.id, retried.id);
        assert_eq!(retried.status, RecordStatus::Pending);

        seq.store
            .complete_analysis(0, serde_json::json!({"summary": "ok"}))
            .unwrap();
        assert!(seq.retry_analysis(0).await.is_none());
    }

    #[tokio::test]
    async fn test_run_round_happy_path() {
        let seq = sequencer(3, true);
        seq.store.append_message(Message::user("u-0", 0, "why?")).unwrap();
        let transport = ScriptTransport::default();

        let outcome = seq
            .run_round(0, &transport, CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_clean(), "{}", outcome.summary_line());
        assert_eq!(outcome.phase, RoundPhase::Complete);
        assert_eq!(outcome.pre_search_status, Some(RecordStatus::Complete));
        assert_eq!(outcome.participants_completed, 3);
        assert_eq!(
            *transport.requests.lock().unwrap(),
            vec!["search", "p0", "p1", "p2", "moderator"]
        );
        assert_eq!(seq.store.streaming_round(), None);
        assert_eq!(
            seq.store.participant_message(0, 1).unwrap().text(),
            "p1 says hi"
        );
    }

    #[tokio::test]
    async fn test_failures_never_abort_the_round() {
        let seq = sequencer(3, true);
        seq.store.append_message(Message::user("u-0", 0, "q")).unwrap();
        let transport = ScriptTransport {
            fail_participants: vec![1],
            fail_moderator: true,
            fail_search: true,
            ..Default::default()
        };

        let outcome = seq
            .run_round(0, &transport, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.pre_search_status, Some(RecordStatus::Failed));
        assert_eq!(outcome.participants_completed, 2);
        assert_eq!(outcome.participants_failed, 1);
        assert_eq!(outcome.analysis_status, Some(RecordStatus::Failed));
        assert_eq!(outcome.phase, RoundPhase::Moderator);
        assert!(!outcome.stopped);
        assert_eq!(seq.store.streaming_round(), None);

        let failed = seq.store.participant_message(0, 1).unwrap();
        assert_eq!(failed.status, MessageStatus::Error);
        assert_eq!(failed.text(), "p1 says hi", "partial content kept");
    }

    #[tokio::test]
    async fn test_cancelled_round_keeps_partial_state() {
        let seq = sequencer(2, false);
        seq.store.append_message(Message::user("u-0", 0, "q")).unwrap();
        seq.barrier.register_animation(0);
        let cancel = CancellationToken::new();
        let transport = ScriptTransport::default();

        let run = seq.run_round(0, &transport, cancel.clone());
        let stopper = async {
            tokio::task::yield_now().await;
            while seq.store.participant_message(0, 0).map(|m| m.status) != Some(MessageStatus::Complete) {
                tokio::task::yield_now().await;
            }
            cancel.cancel();
        };
        let (outcome, _) = tokio::join!(run, stopper);
        let outcome = outcome.unwrap();

        assert!(outcome.stopped);
        assert_eq!(outcome.participants_completed, 1);
        let state = seq.store.round_state();
        assert!(!state.is_streaming);
        assert_eq!(state.current_participant_index, 0);
        assert!(seq.store.participant_message(0, 1).is_none());
    }

    #[tokio::test]
    async fn test_stop_halts_running_loop() {
        let seq = sequencer(2, false);
        seq.store.append_message(Message::user("u-0", 0, "q")).unwrap();
        seq.barrier.register_animation(0);
        let transport = ScriptTransport::default();

        let run = seq.run_round(0, &transport, CancellationToken::new());
        let stopper = async {
            while seq.store.participant_message(0, 0).map(|m| m.status) != Some(MessageStatus::Complete) {
                tokio::task::yield_now().await;
            }
            seq.stop();
            seq.barrier.complete_animation(0);
        };
        let (outcome, _) = tokio::join!(run, stopper);
        let outcome = outcome.unwrap();

        assert!(outcome.stopped);
        assert_eq!(seq.store.current_participant_index(), 0);
        assert!(seq.store.participant_message(0, 1).is_none());
        assert_eq!(*transport.requests.lock().unwrap(), vec!["p0"]);
    }

    #[tokio::test]
    async fn test_restreamed_participant_replaces_partial_text() {
        let seq = sequencer(1, false);
        seq.store.append_message(Message::user("u-0", 0, "q")).unwrap();
        seq.store
            .append_message(Message::assistant("a-0", 0, "p-0", 0))
            .unwrap();
        seq.store.append_delta("a-0", "stale-partial ").unwrap();
        let transport = ScriptTransport::default();

        let outcome = seq
            .run_round_from(0, 0, &transport, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.phase, RoundPhase::Complete);
        let message = seq.store.participant_message(0, 0).unwrap();
        assert_eq!(message.id, "a-0");
        assert_eq!(message.status, MessageStatus::Complete);
        assert_eq!(message.text(), "p0 says hi");
    }

    #[tokio::test]
    async fn test_claimed_pending_pre_search_still_runs() {
        let seq = sequencer(1, true);
        seq.store.append_message(Message::user("u-0", 0, "q")).unwrap();
        seq.store.create_pre_search(0, "q").unwrap();
        assert!(seq.store.mark_pre_search_triggered(0));
        let transport = ScriptTransport::default();

        let outcome = seq
            .run_round(0, &transport, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.pre_search_status, Some(RecordStatus::Complete));
        assert_eq!(outcome.phase, RoundPhase::Complete);
        assert!(seq.can_send_message(0));
        assert_eq!(transport.requests.lock().unwrap()[0], "search");
    }

    #[tokio::test]
    async fn test_expire_stale_records() {
        let seq = sequencer(1, true);
        seq.store.create_pre_search(0, "q").unwrap();
        seq.store
            .update_pre_search_status(0, RecordStatus::Streaming)
            .unwrap();
        assert!(seq.expire_stale_records(Utc::now()).is_empty());

        let later = Utc::now() + chrono::Duration::seconds(11);
        assert_eq!(seq.expire_stale_records(later), vec![0]);
        let record = seq.store.pre_search(0).unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert!(seq.can_send_message(0));
    }
}
