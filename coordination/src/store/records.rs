//! Pre-search and analysis records
//!
//! Both record kinds share one status machine that only moves forward.
//! Terminal records are never removed automatically; regeneration and
//! optimistic rollback remove them explicitly.

use chrono::Utc;
use tracing::{debug, warn};

use super::ConversationStore;
use crate::error::{RoundError, RoundResult};
use crate::events::StoreEvent;
use crate::model::{AnalysisRecord, MessageId, PreSearchRecord, RecordStatus};

fn check_advance(round: u32, from: RecordStatus, to: RecordStatus) -> RoundResult<()> {
    if from.can_advance_to(to) {
        Ok(())
    } else {
        warn!(round, %from, %to, "Rejected record status regression");
        Err(RoundError::StatusRegression { round, from, to })
    }
}

impl ConversationStore {
    // =========================================================================
    // Pre-search
    // =========================================================================

    /// Create the PENDING pre-search record for `round`
    pub fn create_pre_search(&self, round: u32, query: &str) -> RoundResult<PreSearchRecord> {
        self.mutate(|state, events| {
            if state.pre_searches.contains_key(&round) {
                return Err(RoundError::invariant(format!(
                    "round {round} already has a pre-search record"
                )));
            }
            let record = PreSearchRecord::new(round, query);
            state.pre_searches.insert(round, record.clone());
            events.push(StoreEvent::PreSearchChanged {
                round,
                status: record.status,
                timestamp: Utc::now(),
            });
            debug!(round, "Pre-search record created");
            Ok(record)
        })
    }

    /// Insert or replace a pre-search record (regeneration, resync)
    pub fn replace_pre_search(&self, record: PreSearchRecord) {
        self.mutate(|state, events| {
            events.push(StoreEvent::PreSearchChanged {
                round: record.round,
                status: record.status,
                timestamp: Utc::now(),
            });
            state.pre_searches.insert(record.round, record);
        });
    }

    /// Move the pre-search record for `round` forward
    pub fn update_pre_search_status(&self, round: u32, status: RecordStatus) -> RoundResult<()> {
        self.update_pre_search(round, status, |_| {})
    }

    /// Record a successful search result
    pub fn complete_pre_search(&self, round: u32, result: serde_json::Value) -> RoundResult<()> {
        self.update_pre_search(round, RecordStatus::Complete, |record| {
            record.result = Some(result);
            record.error = None;
        })
    }

    /// Record a failed search; participants still proceed
    pub fn fail_pre_search(&self, round: u32, error: impl Into<String>) -> RoundResult<()> {
        let error = error.into();
        self.update_pre_search(round, RecordStatus::Failed, |record| {
            record.error = Some(error);
        })
    }

    /// Bump `updated_at` without changing status (progress from the transport)
    pub fn touch_pre_search(&self, round: u32) {
        self.mutate(|state, _| {
            if let Some(record) = state.pre_searches.get_mut(&round) {
                record.updated_at = Utc::now();
            }
        });
    }

    fn update_pre_search(
        &self,
        round: u32,
        status: RecordStatus,
        apply: impl FnOnce(&mut PreSearchRecord),
    ) -> RoundResult<()> {
        self.mutate(|state, events| {
            let record = state
                .pre_searches
                .get_mut(&round)
                .ok_or_else(|| RoundError::not_found("pre-search", round.to_string()))?;
            check_advance(round, record.status, status)?;
            record.status = status;
            record.updated_at = Utc::now();
            apply(record);
            events.push(StoreEvent::PreSearchChanged {
                round,
                status,
                timestamp: Utc::now(),
            });
            Ok(())
        })
    }

    pub fn remove_pre_search(&self, round: u32) -> Option<PreSearchRecord> {
        self.mutate(|state, events| {
            let removed = state.pre_searches.remove(&round)?;
            events.push(StoreEvent::PreSearchRemoved {
                round,
                timestamp: Utc::now(),
            });
            Some(removed)
        })
    }

    pub fn pre_search(&self, round: u32) -> Option<PreSearchRecord> {
        self.read(|s| s.pre_searches.get(&round).cloned())
    }

    // =========================================================================
    // Analysis
    // =========================================================================

    /// Create the PENDING analysis record for `round`
    ///
    /// Idempotent per round through the `analysis_created` marker: returns
    /// `None` when the round was already claimed.
    pub fn create_analysis(
        &self,
        round: u32,
        participant_message_ids: Vec<MessageId>,
    ) -> Option<AnalysisRecord> {
        self.mutate(|state, events| {
            if !state.tracking.analysis_created.insert(round) {
                debug!(round, "Analysis already created, skipping");
                return None;
            }
            let record = AnalysisRecord::new(round, participant_message_ids);
            state.analyses.insert(round, record.clone());
            events.push(StoreEvent::AnalysisChanged {
                round,
                status: record.status,
                timestamp: Utc::now(),
            });
            debug!(round, "Analysis record created");
            Some(record)
        })
    }

    /// Insert or replace an analysis record and claim its round
    pub fn replace_analysis(&self, record: AnalysisRecord) {
        self.mutate(|state, events| {
            state.tracking.analysis_created.insert(record.round);
            events.push(StoreEvent::AnalysisChanged {
                round: record.round,
                status: record.status,
                timestamp: Utc::now(),
            });
            state.analyses.insert(record.round, record);
        });
    }

    pub fn update_analysis_status(&self, round: u32, status: RecordStatus) -> RoundResult<()> {
        self.update_analysis(round, status, |_| {})
    }

    pub fn complete_analysis(&self, round: u32, payload: serde_json::Value) -> RoundResult<()> {
        self.update_analysis(round, RecordStatus::Complete, |record| {
            record.payload = Some(payload);
            record.error = None;
        })
    }

    pub fn fail_analysis(&self, round: u32, error: impl Into<String>) -> RoundResult<()> {
        let error = error.into();
        self.update_analysis(round, RecordStatus::Failed, |record| {
            record.error = Some(error);
        })
    }

    fn update_analysis(
        &self,
        round: u32,
        status: RecordStatus,
        apply: impl FnOnce(&mut AnalysisRecord),
    ) -> RoundResult<()> {
        self.mutate(|state, events| {
            let record = state
                .analyses
                .get_mut(&round)
                .ok_or_else(|| RoundError::not_found("analysis", round.to_string()))?;
            check_advance(round, record.status, status)?;
            record.status = status;
            record.updated_at = Utc::now();
            apply(record);
            events.push(StoreEvent::AnalysisChanged {
                round,
                status,
                timestamp: Utc::now(),
            });
            Ok(())
        })
    }

    pub fn remove_analysis(&self, round: u32) -> Option<AnalysisRecord> {
        self.mutate(|state, events| {
            let removed = state.analyses.remove(&round)?;
            events.push(StoreEvent::AnalysisRemoved {
                round,
                timestamp: Utc::now(),
            });
            Some(removed)
        })
    }

    pub fn analysis(&self, round: u32) -> Option<AnalysisRecord> {
        self.read(|s| s.analyses.get(&round).cloned())
    }
}
