//! Simulated renderer
//!
//! Stands in for the UI layer: it starts an animation when a participant
//! message appears and completes it a fixed time after the message is
//! finalized. The sequencer's barrier waits make participant turns follow
//! the animation pace.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use coordination::{AnimationBarrier, MessageRole, MessageStatus, StoreEvent};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Counters reported when the renderer stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RendererStats {
    pub animations_started: usize,
    pub animations_completed: usize,
    pub clears: usize,
}

pub struct SimulatedRenderer {
    barrier: Arc<AnimationBarrier>,
    animation: Duration,
}

impl SimulatedRenderer {
    pub fn new(barrier: Arc<AnimationBarrier>, animation: Duration) -> Self {
        Self { barrier, animation }
    }

    /// Process store events until `cancel` fires or the store goes away
    pub fn spawn(
        self,
        events: broadcast::Receiver<StoreEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<RendererStats> {
        tokio::spawn(self.run(events, cancel))
    }

    async fn run(
        self,
        mut events: broadcast::Receiver<StoreEvent>,
        cancel: CancellationToken,
    ) -> RendererStats {
        let mut stats = RendererStats::default();
        // message id -> participant index of the animation it drives
        let mut animating: HashMap<String, usize> = HashMap::new();
        let mut completions = tokio::task::JoinSet::new();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(StoreEvent::MessageAppended {
                    message_id,
                    role: MessageRole::Assistant,
                    participant_index: Some(index),
                    status: MessageStatus::Streaming,
                    ..
                }) => {
                    self.barrier.register_animation(index);
                    animating.insert(message_id, index);
                    stats.animations_started += 1;
                }
                Ok(StoreEvent::MessageUpdated {
                    message_id, status, ..
                }) if status.is_final() => {
                    let Some(index) = animating.remove(&message_id) else {
                        continue;
                    };
                    let barrier = self.barrier.clone();
                    let animation = self.animation;
                    completions.spawn(async move {
                        tokio::time::sleep(animation).await;
                        barrier.complete_animation(index);
                        debug!(participant_index = index, "Animation finished");
                    });
                    stats.animations_completed += 1;
                }
                Ok(StoreEvent::RegenerationStarted { .. } | StoreEvent::StreamStopped { .. }) => {
                    animating.clear();
                    completions.abort_all();
                    self.barrier.clear_animations();
                    stats.clears += 1;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Renderer lagged behind store events");
                }
                Err(RecvError::Closed) => break,
            }
        }

        while completions.join_next().await.is_some() {}
        stats
    }
}
