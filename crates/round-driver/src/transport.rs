//! Scripted streaming transport
//!
//! Produces deterministic text for every turn, chunked word by word with an
//! optional delay, and can be told to fail specific turns mid-stream.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use coordination::{MessageStatus, RoundTransport, TransportError, TurnEvent, TurnRequest};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::DriverConfig;

/// One turn the transport served
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedTurn {
    pub round: u32,
    pub kind: &'static str,
    /// Participant index for participant turns
    pub index: Option<usize>,
    pub failed: bool,
}

/// Deterministic stand-in for the model and search providers
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    fail_participants: HashSet<usize>,
    fail_search: bool,
    fail_moderator: bool,
    chunk_delay: Duration,
    served: Mutex<Vec<ServedTurn>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            fail_participants: config.fail_participants.iter().copied().collect(),
            fail_search: config.fail_search,
            fail_moderator: config.fail_moderator,
            chunk_delay: config.chunk_delay(),
            served: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_participant(mut self, index: usize) -> Self {
        self.fail_participants.insert(index);
        self
    }

    pub fn failing_moderator(mut self) -> Self {
        self.fail_moderator = true;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Turns served so far, in order
    pub fn served(&self) -> Vec<ServedTurn> {
        self.served
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, turn: ServedTurn) {
        self.served
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(turn);
    }

    /// Send `text` one word at a time
    async fn stream_words(
        &self,
        text: &str,
        limit: usize,
        events: &mpsc::Sender<TurnEvent>,
    ) -> Result<(), TransportError> {
        for (i, word) in text.split_inclusive(' ').take(limit).enumerate() {
            if i > 0 && !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            events
                .send(TurnEvent::delta(word))
                .await
                .map_err(|_| TransportError::Disconnected("turn receiver dropped".into()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl RoundTransport for ScriptedTransport {
    async fn stream_turn(
        &self,
        request: TurnRequest,
        events: mpsc::Sender<TurnEvent>,
    ) -> Result<(), TransportError> {
        let round = request.round();
        let kind = request.kind();
        let (text, index, fail, payload) = match &request {
            TurnRequest::PreSearch { query, .. } => (
                format!("searched the web for {query}"),
                None,
                self.fail_search,
                Some(json!({
                    "query": query,
                    "results": [
                        { "title": format!("{query} overview"), "rank": 1 },
                        { "title": format!("{query} in practice"), "rank": 2 },
                    ],
                })),
            ),
            TurnRequest::Participant {
                index,
                participant,
                mode,
                search_context,
                ..
            } => (
                format!(
                    "{} ({}) answers round {} in {} mode{}",
                    participant.model_id,
                    participant.role.as_deref().unwrap_or("participant"),
                    round,
                    mode,
                    if search_context.is_some() {
                        " with search context"
                    } else {
                        ""
                    }
                ),
                Some(*index),
                self.fail_participants.contains(index),
                None,
            ),
            TurnRequest::Moderator {
                participant_message_ids,
                ..
            } => (
                format!(
                    "summary of {} responses for round {}",
                    participant_message_ids.len(),
                    round
                ),
                None,
                self.fail_moderator,
                Some(json!({ "responses": participant_message_ids })),
            ),
        };
        debug!(round, kind, ?index, fail, "Serving scripted turn");
        self.record(ServedTurn {
            round,
            kind,
            index,
            failed: fail,
        });

        let _ = events.send(TurnEvent::Started).await;
        if fail {
            // Half the text, then the connection drops
            let words = text.split_inclusive(' ').count();
            self.stream_words(&text, words / 2, &events).await?;
            return Err(TransportError::Disconnected(format!(
                "{kind} stream for round {round} dropped"
            )));
        }

        self.stream_words(&text, usize::MAX, &events).await?;
        events
            .send(TurnEvent::Finished {
                status: MessageStatus::Complete,
                content: None,
                error: None,
                payload,
            })
            .await
            .map_err(|_| TransportError::Disconnected("turn receiver dropped".into()))?;
        Ok(())
    }
}
