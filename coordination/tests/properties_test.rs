//! Store, barrier and phase properties that must hold for every session

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use coordination::{
    detect_phase, AnimationBarrier, ChatMode, ConversationStore, Message, MessageStatus,
    ModeratorView, OptimisticUpdateManager, Participant, ParticipantProgress, PreSearchView,
    RecordStatus, RoundConfig, RoundError, RoundPhase, StreamingSequencer, Thread,
};
use futures::FutureExt;

fn session(participants: usize, web_search: bool) -> Arc<ConversationStore> {
    let participants = (0..participants)
        .map(|i| Participant::new(format!("p-{i}"), format!("model-{i}"), i as u32))
        .collect();
    ConversationStore::new(
        Thread::with_id("t-1", ChatMode::Solving, web_search),
        participants,
    )
    .shared()
}

#[test]
fn test_zero_or_unknown_participants_never_reach_moderator() {
    for total in [Some(0), None] {
        for responded in [0, 1, 3] {
            for search in [None, Some(RecordStatus::Complete), Some(RecordStatus::Failed)] {
                let phase = detect_phase(
                    PreSearchView {
                        enabled: search.is_some(),
                        status: search,
                    },
                    ParticipantProgress {
                        total_enabled: total,
                        responded,
                    },
                    ModeratorView { status: None },
                );
                assert_eq!(phase, RoundPhase::Idle, "total={total:?} responded={responded}");
            }
        }
    }
}

#[test]
fn test_disabled_participants_do_not_count() {
    let store = ConversationStore::new(
        Thread::with_id("t-1", ChatMode::Analyzing, false),
        vec![
            Participant::new("p-0", "m", 0),
            Participant::new("p-1", "m", 1).disabled(),
        ],
    );
    store.append_message(Message::user("u", 0, "q")).unwrap();
    store
        .append_message(Message::assistant("a", 0, "p-0", 0).with_status(MessageStatus::Complete))
        .unwrap();
    assert_eq!(store.phase_for_round(0), RoundPhase::Moderator);
}

#[test]
fn test_registering_twice_is_idempotent() {
    let barrier = AnimationBarrier::new();
    barrier.register_animation(4);
    barrier.register_animation(4);
    assert_eq!(barrier.pending_count(), 1);
}

#[test]
fn test_completing_unregistered_index_is_noop() {
    let barrier = AnimationBarrier::new();
    barrier.register_animation(1);
    barrier.complete_animation(7);
    assert_eq!(barrier.pending_animations(), vec![1]);
}

#[tokio::test]
async fn test_wait_resolves_only_after_matching_completion() {
    let barrier = Arc::new(AnimationBarrier::new());
    assert!(barrier.wait_for_animation(0).wait().now_or_never().is_some());

    barrier.register_animation(0);
    let pending = barrier.wait_for_animation(0);
    assert!(!pending.is_ready());
    let waiter = tokio::spawn(pending.wait());

    barrier.complete_animation(1);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());

    barrier.complete_animation(0);
    assert_eq!(waiter.await.unwrap(), Ok(()));
}

#[test]
fn test_regeneration_clears_markers_for_reuse() {
    let store = session(2, true);
    store.append_message(Message::user("u", 0, "q")).unwrap();
    assert!(store.mark_pre_search_triggered(0));
    assert!(store.mark_analysis_created(0));

    store.start_regeneration(0);
    store.complete_regeneration(0);

    assert!(!store.has_analysis_been_created(0));
    assert!(!store.has_pre_search_been_triggered(0));
    assert!(store.mark_pre_search_triggered(0));
    assert!(store.mark_analysis_created(0));
    assert_eq!(store.message_count(), 1, "user message survives regeneration");
}

#[tokio::test]
async fn test_analysis_created_once_for_identical_calls() {
    let store = session(2, false);
    store.append_message(Message::user("u", 0, "q")).unwrap();
    for i in 0..2 {
        store
            .append_message(
                Message::assistant(format!("a-{i}"), 0, format!("p-{i}"), i)
                    .with_status(MessageStatus::Complete),
            )
            .unwrap();
    }
    let sequencer = StreamingSequencer::new(store.clone(), Arc::new(AnimationBarrier::new()));

    let (first, second) = tokio::join!(sequencer.create_analysis(0), sequencer.create_analysis(0));
    assert_eq!(first.is_some() as u8 + second.is_some() as u8, 1);
    assert_eq!(store.state().analyses.len(), 1);
}

#[test]
fn test_optimistic_rollback_restores_pre_submission_state() {
    let store = session(2, true);
    store.append_message(Message::user("t-1_r0_user", 0, "first")).unwrap();
    store.set_waiting_for_changelog(true);
    let before = store.state();

    let manager = OptimisticUpdateManager::new(store.clone());
    let permit = manager.submit("second question").unwrap();
    assert_eq!(store.message_count(), 2);
    assert!(store.round_state().has_early_optimistic_message);
    assert_eq!(store.streaming_round(), Some(1));
    assert!(store.pre_search(1).is_some());

    manager.rollback(permit, &RoundError::transient("submit", "timeout"));
    let after = store.state();
    assert_eq!(after.messages.len(), before.messages.len());
    assert_eq!(after.round, before.round);
    assert_eq!(after, before);
}

#[test]
fn test_stores_never_share_tracking() {
    let a = session(1, false);
    let b = session(1, false);
    assert!(a.mark_analysis_created(0));
    assert!(a.mark_pre_search_triggered(0));
    assert!(!b.has_analysis_been_created(0));
    assert!(!b.has_pre_search_been_triggered(0));
    assert!(b.mark_analysis_created(0));

    a.dispose();
    assert!(!a.has_analysis_been_created(0));
    assert!(b.has_analysis_been_created(0));
}

#[test]
fn test_pre_search_never_regresses() {
    let store = session(1, true);
    store.create_pre_search(0, "q").unwrap();
    store
        .update_pre_search_status(0, RecordStatus::Streaming)
        .unwrap();
    store.complete_pre_search(0, serde_json::json!({})).unwrap();
    for status in [RecordStatus::Pending, RecordStatus::Streaming, RecordStatus::Failed] {
        assert!(store.update_pre_search_status(0, status).is_err());
    }
    assert_eq!(store.pre_search(0).unwrap().status, RecordStatus::Complete);
}

#[test]
fn test_stop_preserves_partial_content() {
    let store = session(3, false);
    store.append_message(Message::user("u", 0, "q")).unwrap();
    store.begin_streaming(0).unwrap();
    store.set_current_participant_index(1);
    store
        .append_message(Message::assistant("a-0", 0, "p-0", 0).with_status(MessageStatus::Complete))
        .unwrap();
    store.append_message(Message::assistant("a-1", 0, "p-1", 1)).unwrap();
    store.append_delta("a-1", "half an ans").unwrap();

    let sequencer = StreamingSequencer::new(store.clone(), Arc::new(AnimationBarrier::new()));
    sequencer.stop();

    let state = store.round_state();
    assert!(!state.is_streaming);
    assert_eq!(state.current_participant_index, 1);
    let partial = store.message("a-1").unwrap();
    assert_eq!(partial.text(), "half an ans");
    assert_eq!(partial.status, MessageStatus::Streaming);
}

#[test]
fn test_stale_streaming_pre_search_is_failed() {
    let store = session(1, true);
    let config = RoundConfig {
        pre_search_timeout_secs: 10,
        ..RoundConfig::default()
    };
    let sequencer =
        StreamingSequencer::with_config(store.clone(), Arc::new(AnimationBarrier::new()), config);
    store.create_pre_search(0, "q").unwrap();
    store
        .update_pre_search_status(0, RecordStatus::Streaming)
        .unwrap();
    assert!(!sequencer.can_send_message(0));

    let expired = sequencer.expire_stale_records(Utc::now() + chrono::Duration::seconds(30));
    assert_eq!(expired, vec![0]);
    let record = store.pre_search(0).unwrap();
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("pre-search timed out"));
    assert!(sequencer.can_send_message(0));
}
