//! Multi-round session runner
//!
//! Wires one conversation store to the sequencer, the optimistic update
//! manager, the simulated renderer and the scripted transport, then runs the
//! configured number of rounds. With a snapshot directory, progress is saved
//! after every round and an interrupted stream can be resumed first.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use coordination::model::ids::user_message_id;
use coordination::{
    AnimationBarrier, ConversationStore, JsonFileSnapshotSource, LocalRoundState, Message,
    MessageStatus, OptimisticUpdateManager, RecoveryStrategy, ResumptionEngine, RoundOutcome,
    SharedConversationStore, SnapshotMessage, StreamSnapshot, StreamingSequencer, Thread,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DriverConfig;
use crate::renderer::{RendererStats, SimulatedRenderer};
use crate::transport::ScriptedTransport;

/// What a finished session reports
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub thread_id: String,
    pub outcomes: Vec<RoundOutcome>,
    /// Strategy used when `resume` was requested
    pub resumed: Option<RecoveryStrategy>,
    pub renderer: RendererStats,
    pub stopped: bool,
}

impl SessionReport {
    pub fn failed_participants(&self) -> usize {
        self.outcomes.iter().map(|o| o.participants_failed).sum()
    }
}

/// Stream id used for the snapshot of `round`
pub fn stream_id(thread_id: &str, round: u32) -> String {
    format!("{thread_id}-r{round}")
}

/// Split a stream id back into its thread id and round
pub fn parse_stream_id(stream_id: &str) -> Option<(&str, u32)> {
    let (thread_id, round) = stream_id.rsplit_once("-r")?;
    if thread_id.is_empty() {
        return None;
    }
    Some((thread_id, round.parse().ok()?))
}

/// Question the driver asks in `round`
pub fn question(round: u32) -> String {
    format!("What should we decide in round {round}?")
}

/// Capture the persisted view of `round` from `store`
pub fn capture_snapshot(store: &ConversationStore, stream_id: &str, round: u32) -> StreamSnapshot {
    let thread = store.thread();
    let mut snapshot = StreamSnapshot::new(stream_id, thread.id, round);
    let messages = store.participant_messages(round);
    let participants = store.enabled_participants();

    for participant in &participants {
        let done = messages
            .iter()
            .any(|m| m.participant_id.as_deref() == Some(&participant.id) && m.status.is_final());
        if done {
            snapshot.completed_participant_ids.push(participant.id.clone());
        } else {
            snapshot.pending_participant_ids.push(participant.id.clone());
        }
    }
    snapshot.messages = messages
        .iter()
        .filter_map(|m| {
            Some(SnapshotMessage {
                id: m.id.clone(),
                participant_id: m.participant_id.clone()?,
                round,
                content: m.text(),
                status: m.status,
            })
        })
        .collect();
    snapshot.current_participant_index = store.current_participant_index();
    snapshot.pre_search_complete = store
        .pre_search(round)
        .is_some_and(|r| r.status.is_terminal());
    snapshot.analysis_complete = store
        .analysis(round)
        .is_some_and(|r| r.status == coordination::RecordStatus::Complete);
    snapshot.last_event_id = messages.last().map(|m| m.id.clone());
    snapshot.updated_at = Utc::now();
    snapshot
}

/// One thread session driven end to end
pub struct RoundSession {
    config: DriverConfig,
    store: SharedConversationStore,
    barrier: Arc<AnimationBarrier>,
    sequencer: StreamingSequencer,
    optimistic: OptimisticUpdateManager,
    transport: ScriptedTransport,
    snapshots: Option<JsonFileSnapshotSource>,
}

impl RoundSession {
    /// Fresh thread, or the resumed stream's thread when `resume` is set
    pub fn new(config: DriverConfig) -> Self {
        let resumed_thread = config
            .resume
            .as_deref()
            .and_then(parse_stream_id)
            .map(|(thread_id, _)| thread_id.to_string());
        let thread = match resumed_thread {
            Some(id) => Thread::with_id(id, config.mode, config.web_search),
            None => Thread::new(config.mode, config.web_search),
        };
        Self::with_thread(config, thread)
    }

    /// Session on a known thread id, so resumed streams line up
    pub fn with_thread(config: DriverConfig, thread: Thread) -> Self {
        let store = ConversationStore::create(thread, config.roster(), &config.round).shared();
        let barrier = Arc::new(AnimationBarrier::new());
        let sequencer =
            StreamingSequencer::with_config(store.clone(), barrier.clone(), config.round.clone());
        let optimistic = OptimisticUpdateManager::new(store.clone());
        let transport = ScriptedTransport::from_config(&config);
        let snapshots = config.snapshot_dir.clone().map(JsonFileSnapshotSource::new);
        Self {
            config,
            store,
            barrier,
            sequencer,
            optimistic,
            transport,
            snapshots,
        }
    }

    pub fn store(&self) -> &SharedConversationStore {
        &self.store
    }

    pub fn transport(&self) -> &ScriptedTransport {
        &self.transport
    }

    /// Run every configured round, resuming first when asked
    pub async fn run(&self, cancel: CancellationToken) -> Result<SessionReport> {
        let thread_id = self.store.thread().id;
        info!(
            thread_id = %thread_id,
            rounds = self.config.rounds,
            participants = self.config.participants,
            mode = %self.config.mode,
            "Session starting"
        );

        let renderer_cancel = cancel.child_token();
        let renderer = SimulatedRenderer::new(self.barrier.clone(), self.config.animation())
            .spawn(self.store.subscribe(), renderer_cancel.clone());

        let mut outcomes = Vec::new();
        let mut resumed = None;
        let mut first_round = 0;

        if let Some(stream) = self.config.resume.clone() {
            let (strategy, outcome) = self.resume(&stream, &cancel).await?;
            resumed = Some(strategy);
            first_round = outcome.round + 1;
            outcomes.push(outcome);
        }

        for round in first_round..first_round + self.config.rounds {
            if cancel.is_cancelled() {
                break;
            }
            self.submit_question(round)?;
            let outcome = self
                .sequencer
                .run_round(round, &self.transport, cancel.child_token())
                .await
                .with_context(|| format!("Round {round} failed"))?;
            info!(round, summary = %outcome.summary_line(), "Round done");

            let expired = self.sequencer.expire_stale_records(Utc::now());
            if !expired.is_empty() {
                warn!(?expired, "Expired stale records");
            }
            self.save_snapshot(round).await;

            let stopped = outcome.stopped;
            outcomes.push(outcome);
            if stopped {
                break;
            }
        }

        renderer_cancel.cancel();
        let renderer = renderer.await.context("Renderer task failed")?;
        let stopped = outcomes.last().is_some_and(|o| o.stopped);
        Ok(SessionReport {
            thread_id,
            outcomes,
            resumed,
            renderer,
            stopped,
        })
    }

    /// Append the round's user message through the optimistic path
    fn submit_question(&self, round: u32) -> Result<()> {
        let text = question(round);
        let permit = self
            .optimistic
            .submit(text.clone())
            .with_context(|| format!("Optimistic submit for round {round} rejected"))?;
        let thread_id = self.store.thread().id;
        let confirmed = Message::user(user_message_id(&thread_id, round), round, text);
        self.optimistic
            .confirm(permit, confirmed)
            .with_context(|| format!("Round {round} question not confirmed"))?;
        Ok(())
    }

    /// Resume `stream` from the snapshot directory and finish its round
    async fn resume(
        &self,
        stream: &str,
        cancel: &CancellationToken,
    ) -> Result<(RecoveryStrategy, RoundOutcome)> {
        let source = self
            .snapshots
            .as_ref()
            .context("Resuming needs a snapshot directory")?;
        let thread_id = self.store.thread().id;
        let round = match parse_stream_id(stream) {
            Some((id, round)) if id == thread_id => round,
            _ => bail!("Stream id {stream} does not name a round of thread {thread_id}"),
        };

        // The question was confirmed before the interruption
        self.store.append_message(Message::user(
            user_message_id(&thread_id, round),
            round,
            question(round),
        ))?;
        let local = LocalRoundState::from_store(&self.store, round);
        let engine = ResumptionEngine::new(self.config.round.clone());
        let result = engine.attempt_with_retries(stream, source, &local).await;
        let strategy = result.recovery_strategy;

        let start_index = if result.success {
            let phase = engine.apply_to_store(&result, &self.store)?;
            info!(stream_id = stream, %phase, %strategy, "Resuming round");
            self.store.current_participant_index()
        } else {
            warn!(
                stream_id = stream,
                error = ?result.error,
                "Snapshot unusable, restarting round"
            );
            0
        };

        let outcome = self
            .sequencer
            .run_round_from(round, start_index, &self.transport, cancel.child_token())
            .await
            .with_context(|| format!("Resumed round {round} failed"))?;
        self.save_snapshot(round).await;
        Ok((strategy, outcome))
    }

    async fn save_snapshot(&self, round: u32) {
        let Some(source) = &self.snapshots else {
            return;
        };
        let thread_id = self.store.thread().id;
        let snapshot = capture_snapshot(&self.store, &stream_id(&thread_id, round), round);
        if let Err(e) = source.save(&snapshot).await {
            warn!(round, error = %e, "Snapshot not saved");
        }
    }
}

/// Participant messages in `round` that ended in error
pub fn errored_messages(store: &ConversationStore, round: u32) -> Vec<Message> {
    store
        .participant_messages(round)
        .into_iter()
        .filter(|m| m.status == MessageStatus::Error)
        .collect()
}
