//! Animation barrier
//!
//! Lets asynchronous completion signals wait for the rendering layer to
//! settle. The renderer registers an index when it starts animating a turn
//! and completes it when done; the sequencer waits on the index before
//! moving on.
//!
//! Waiting on an index that is not pending resolves immediately. If the
//! renderer registers late, a waiter that already checked proceeds early;
//! registration must happen before the dependent wait for the barrier to
//! hold.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Error returned to waiters
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierError {
    /// The barrier was cleared before the animation completed
    #[error("animation {index} was cleared before completion")]
    Cleared { index: usize },
}

#[derive(Default)]
struct BarrierState {
    pending: BTreeSet<usize>,
    waiters: HashMap<usize, Vec<oneshot::Sender<()>>>,
}

/// Pending-animation set with per-index waiters
#[derive(Default)]
pub struct AnimationBarrier {
    state: Mutex<BarrierState>,
}

impl AnimationBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `index` as animating. Registering twice is a no-op.
    pub fn register_animation(&self, index: usize) {
        if self.lock().pending.insert(index) {
            debug!(index, "Animation registered");
        }
    }

    /// Finish `index` and wake every waiter for it.
    ///
    /// Completing an index that was never registered does nothing.
    pub fn complete_animation(&self, index: usize) {
        let waiters = {
            let mut state = self.lock();
            if !state.pending.remove(&index) {
                return;
            }
            state.waiters.remove(&index).unwrap_or_default()
        };

        debug!(index, waiters = waiters.len(), "Animation completed");
        for waiter in waiters {
            // Receiver may have been dropped by a caller that stopped waiting
            let _ = waiter.send(());
        }
    }

    /// Wait handle for `index`; ready at once when `index` is not pending.
    pub fn wait_for_animation(&self, index: usize) -> AnimationWait {
        let mut state = self.lock();
        if !state.pending.contains(&index) {
            return AnimationWait {
                index,
                receiver: None,
            };
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.entry(index).or_default().push(tx);
        AnimationWait {
            index,
            receiver: Some(rx),
        }
    }

    /// Drop every pending index and waiter without resolving them.
    pub fn clear_animations(&self) {
        let mut state = self.lock();
        let dropped: usize = state.waiters.values().map(Vec::len).sum();
        state.pending.clear();
        state.waiters.clear();
        debug!(dropped_waiters = dropped, "Animations cleared");
    }

    /// Currently pending indices in ascending order
    pub fn pending_animations(&self) -> Vec<usize> {
        self.lock().pending.iter().copied().collect()
    }

    pub fn is_pending(&self, index: usize) -> bool {
        self.lock().pending.contains(&index)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}

/// Future-like handle returned by [`AnimationBarrier::wait_for_animation`]
#[derive(Debug)]
pub struct AnimationWait {
    index: usize,
    receiver: Option<oneshot::Receiver<()>>,
}

impl AnimationWait {
    /// Whether the handle resolves without suspending
    pub fn is_ready(&self) -> bool {
        self.receiver.is_none()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Resolve once the animation completes
    pub async fn wait(self) -> Result<(), BarrierError> {
        match self.receiver {
            None => Ok(()),
            Some(rx) => rx
                .await
                .map_err(|_| BarrierError::Cleared { index: self.index }),
        }
    }
}
