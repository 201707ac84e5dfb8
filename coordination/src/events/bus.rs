//! Event bus for store change notifications
//!
//! Tokio broadcast pub/sub. Publishing never fails the mutation that
//! produced the event: lagging or absent subscribers are a subscriber
//! problem.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::types::StoreEvent;

/// Default channel capacity for broadcast
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Bus handle shared between the store and its collaborators
pub type SharedEventBus = Arc<EventBus>;

/// Broadcast bus for store events
pub struct EventBus {
    sender: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Fan `event` out to every live receiver
    pub fn publish(&self, event: StoreEvent) {
        let kind = event.event_type();
        let receivers = self.sender.send(event).unwrap_or(0);
        trace!(event_type = kind, receivers, "Store event published");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    /// Receiver that only yields events passing `filter`
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Round and event-type constraints; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events for this round (events without a round pass)
    pub round: Option<u32>,
    /// Accepted `event_type()` names
    pub event_types: Option<Vec<&'static str>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn round(mut self, round: u32) -> Self {
        self.round = Some(round);
        self
    }

    pub fn types(mut self, event_types: &[&'static str]) -> Self {
        self.event_types = Some(event_types.to_vec());
        self
    }

    pub fn matches(&self, event: &StoreEvent) -> bool {
        let round_ok = match (self.round, event.round()) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        };
        round_ok
            && self
                .event_types
                .as_ref()
                .map_or(true, |types| types.contains(&event.event_type()))
    }
}

/// Receiver half of [`EventBus::subscribe_filtered`]
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<StoreEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    /// Receive the next matching event, skipping over lag gaps
    pub async fn recv(&mut self) -> Result<StoreEvent, broadcast::error::RecvError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Filtered receiver lagged");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RecordStatus;
    use chrono::Utc;

    #[tokio::test]
    async fn test_subscriber_sees_published_event() {
        let bus = EventBus::with_capacity(8);
        let mut rx = bus.subscribe();

        bus.publish(StoreEvent::SessionCreated {
            thread_id: "t-1".to_string(),
            timestamp: Utc::now(),
        });

        assert_eq!(rx.recv().await.unwrap().event_type(), "session_created");
    }

    #[tokio::test]
    async fn test_every_receiver_gets_a_copy() {
        let bus = EventBus::default().shared();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.receiver_count(), 2);

        bus.publish(StoreEvent::AnalysisRemoved {
            round: 0,
            timestamp: Utc::now(),
        });

        assert_eq!(first.recv().await.unwrap(), second.recv().await.unwrap());
    }

    #[test]
    fn test_publish_with_nobody_listening() {
        let bus = EventBus::with_capacity(1);
        bus.publish(StoreEvent::MessagesSynced {
            count: 0,
            timestamp: Utc::now(),
        });
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn test_filter_by_round_and_type() {
        let filter = EventFilter::new()
            .round(1)
            .types(&["pre_search_changed", "analysis_changed"]);

        let matching = StoreEvent::PreSearchChanged {
            round: 1,
            status: RecordStatus::Complete,
            timestamp: Utc::now(),
        };
        let other_round = StoreEvent::PreSearchChanged {
            round: 2,
            status: RecordStatus::Complete,
            timestamp: Utc::now(),
        };
        let other_type = StoreEvent::PreSearchRemoved {
            round: 1,
            timestamp: Utc::now(),
        };

        assert!(filter.matches(&matching));
        assert!(!filter.matches(&other_round));
        assert!(!filter.matches(&other_type));
    }

    #[tokio::test]
    async fn test_filtered_receiver_skips_other_events() {
        let bus = EventBus::new().shared();
        let mut completions = bus.subscribe_filtered(EventFilter::new().types(&["round_completed"]));

        let publisher = bus.clone();
        tokio::spawn(async move {
            publisher.publish(StoreEvent::MessagesSynced {
                count: 1,
                timestamp: Utc::now(),
            });
            publisher.publish(StoreEvent::RoundCompleted {
                round: 0,
                phase: crate::phase::RoundPhase::Complete,
                analysis_status: Some(RecordStatus::Complete),
                timestamp: Utc::now(),
            });
        });

        let event = completions.recv().await.unwrap();
        assert_eq!(event.round(), Some(0));
    }
}
