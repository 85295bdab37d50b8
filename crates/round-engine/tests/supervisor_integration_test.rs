//! Supervisor admission, single-slot and auxiliary command tests.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use common::{Harness, GROUP};
use matchmaking::{Pair, Participant, ParticipantId};
use round_engine::{
    BulkSummary, EngineConfig, EngineError, GroupId, InMemoryStore, PoolMember, RoundStatus,
    SimulatedProvisioner, SitOutPolicy, StartRejection, StopRejection,
};

#[tokio::test(start_paused = true)]
async fn second_start_is_rejected_while_running() {
    let h = Harness::new();
    let started = h
        .supervisor
        .start_round(h.request(&[1, 2, 3, 4], 1))
        .await
        .unwrap();

    let err = h
        .supervisor
        .start_round(h.request(&[1, 2, 3, 4], 1))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StartRejection::AlreadyRunning {
            round_id: Some(started.round_id)
        }
    );
    assert_eq!(h.supervisor.active_round(GROUP), Some(started.round_id));

    h.supervisor.join(GROUP).await.unwrap();
    assert!(!h.supervisor.is_running(GROUP));
    assert!(h
        .supervisor
        .start_round(h.request(&[1, 2, 3, 4], 1))
        .await
        .is_ok());
    h.supervisor.join(GROUP).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn concurrent_starts_admit_exactly_one() {
    let h = Harness::new();
    let (a, b) = tokio::join!(
        h.supervisor.start_round(h.request(&[1, 2, 3, 4], 1)),
        h.supervisor.start_round(h.request(&[5, 6, 7, 8], 1)),
    );
    let oks = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(oks, 1);
    let rejection = a.err().or(b.err()).unwrap();
    assert!(matches!(rejection, StartRejection::AlreadyRunning { .. }));
    assert_eq!(h.store.round_count(), 1);

    h.supervisor.join(GROUP).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn groups_run_independently() {
    let h = Harness::new();
    h.supervisor
        .start_round(h.request(&[1, 2], 1))
        .await
        .unwrap();

    let mut other = h.request(&[3, 4], 1);
    other.group_id = GroupId(2);
    h.supervisor.start_round(other).await.unwrap();

    assert!(h.supervisor.is_running(GROUP));
    assert!(h.supervisor.is_running(GroupId(2)));
    h.supervisor.join(GROUP).await.unwrap();
    h.supervisor.join(GroupId(2)).await.unwrap();
}

#[tokio::test]
async fn invalid_durations_are_rejected() {
    let h = Harness::new();
    for minutes in [0, 121] {
        let err = h
            .supervisor
            .start_round(h.request(&[1, 2], minutes))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(matches!(err, StartRejection::InvalidDuration { min: 1, max: 120, .. }));
    }
    assert_eq!(h.store.round_count(), 0);
    assert!(!h.supervisor.is_running(GROUP));
}

#[tokio::test]
async fn bots_and_absent_members_do_not_count() {
    let h = Harness::new();
    let mut request = h.request(&[1, 2, 3], 1);
    request.pool[1].is_bot = true;
    request.pool[2].in_voice = false;

    let err = h.supervisor.start_round(request).await.unwrap_err();
    assert_eq!(err, StartRejection::InsufficientParticipants { eligible: 1 });
    assert_eq!(h.store.round_count(), 0);
    assert!(!h.supervisor.is_running(GROUP));
}

#[tokio::test(start_paused = true)]
async fn requester_sits_out_of_odd_pool() {
    let h = Harness::new();
    let mut request = h.request(&[1, 2, 3, 4, 5], 1);
    request.requester = Some(ParticipantId(2));

    let started = h.supervisor.start_round(request).await.unwrap();
    assert_eq!(started.sitters, vec![Participant::new(2u64, "member-2")]);
    let paired: HashSet<u64> = started
        .pairs
        .iter()
        .flat_map(|(a, b)| [a.id.0, b.id.0])
        .collect();
    assert_eq!(paired, HashSet::from([1, 3, 4, 5]));

    let report = h.supervisor.join(GROUP).await.unwrap();
    assert!(h.in_lobby(2));
    assert_eq!(report.pairs, 2);
}

#[tokio::test(start_paused = true)]
async fn last_in_pool_policy_ignores_requester() {
    let config = EngineConfig {
        sit_out_policy: SitOutPolicy::LastInPool,
        ..EngineConfig::default()
    };
    let h = Harness::build(InMemoryStore::new(), SimulatedProvisioner::new(), config);
    let mut request = h.request(&[1, 2, 3], 1);
    request.requester = Some(ParticipantId(1));

    let started = h.supervisor.start_round(request).await.unwrap();
    assert_eq!(started.sitters[0].id, ParticipantId(3));
    h.supervisor.join(GROUP).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn round_numbers_increase_and_pairs_rotate() {
    let h = Harness::new();

    let first = h
        .supervisor
        .start_round(h.request(&[1, 2, 3, 4], 1))
        .await
        .unwrap();
    h.supervisor.join(GROUP).await.unwrap();

    let second = h
        .supervisor
        .start_round(h.request(&[1, 2, 3, 4], 1))
        .await
        .unwrap();
    h.supervisor.join(GROUP).await.unwrap();

    assert_eq!(first.round_number, 1);
    assert_eq!(second.round_number, 2);

    let before: HashSet<Pair> = h.store.round_pairs(first.round_id).into_iter().collect();
    let after: HashSet<Pair> = h.store.round_pairs(second.round_id).into_iter().collect();
    assert_eq!(before.len(), 2);
    assert!(before.is_disjoint(&after), "{before:?} repeated in {after:?}");
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent_and_rejected_when_idle() {
    let h = Harness::new();
    assert_eq!(
        h.supervisor.stop_round(GROUP).unwrap_err(),
        StopRejection::NotRunning
    );

    let started = h
        .supervisor
        .start_round(h.request(&[1, 2], 1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let first = h.supervisor.stop_round(GROUP).unwrap();
    let second = h.supervisor.stop_round(GROUP).unwrap();
    assert!(!first.already_requested);
    assert!(second.already_requested);

    let report = h.supervisor.join(GROUP).await.unwrap();
    assert_eq!(report.status, RoundStatus::Cancelled);
    assert_eq!(h.store.status_log(), vec![(started.round_id, RoundStatus::Cancelled)]);
    assert_eq!(
        h.supervisor.stop_round(GROUP).unwrap_err(),
        StopRejection::NotRunning
    );
}

#[tokio::test]
async fn unavailable_history_rejects_and_releases_slot() {
    let h = Harness::build(
        InMemoryStore::new().with_unavailable_history(),
        SimulatedProvisioner::new(),
        EngineConfig::default(),
    );
    let err = h
        .supervisor
        .start_round(h.request(&[1, 2], 1))
        .await
        .unwrap_err();
    assert!(matches!(err, StartRejection::Unavailable(_)));
    assert!(!h.supervisor.is_running(GROUP));
}

#[tokio::test]
async fn failed_pair_record_marks_round_as_error() {
    let h = Harness::build(
        InMemoryStore::new().with_failing_pair_records(),
        SimulatedProvisioner::new(),
        EngineConfig::default(),
    );
    let err = h
        .supervisor
        .start_round(h.request(&[1, 2], 1))
        .await
        .unwrap_err();
    assert!(matches!(err, StartRejection::Unavailable(_)));
    assert_eq!(h.store.round_count(), 1);
    assert_eq!(
        h.store.status_log(),
        vec![(round_engine::RoundId(1), RoundStatus::Error)]
    );
    assert!(!h.supervisor.is_running(GROUP));
    assert!(h.channels.live_channels().len() == 1);
}

#[tokio::test(start_paused = true)]
async fn participants_are_registered_with_labels() {
    let h = Harness::new();
    h.supervisor
        .start_round(h.request(&[7, 8], 1))
        .await
        .unwrap();
    assert_eq!(h.store.label_of(ParticipantId(7)).as_deref(), Some("member-7"));
    assert_eq!(h.store.label_of(ParticipantId(8)).as_deref(), Some("member-8"));
    h.supervisor.join(GROUP).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn user_history_lists_recent_partners() {
    let h = Harness::new();
    h.store
        .seed_meeting(GROUP, ParticipantId(1), ParticipantId(3), Utc::now() - chrono::Duration::days(7));
    h.supervisor
        .start_round(h.request(&[1, 2], 1))
        .await
        .unwrap();
    h.supervisor.join(GROUP).await.unwrap();

    let history = h
        .supervisor
        .user_history(ParticipantId(1), None)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].partner, Participant::new(2u64, "member-2"));
    assert_eq!(history[1].partner.id, ParticipantId(3));

    let limited = h
        .supervisor
        .user_history(ParticipantId(1), Some(1))
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn relocate_channel_moves_everyone() {
    let h = Harness::new();
    let stage = h.channels.add_channel("Stage");
    for id in [10, 11, 12] {
        h.channels.place(ParticipantId(id), &stage);
    }

    let outcome = h.supervisor.relocate_channel(&stage, &h.lobby).await.unwrap();
    assert_eq!(outcome.summary(), BulkSummary::AllSucceeded { count: 3 });
    for id in [10, 11, 12] {
        assert!(h.in_lobby(id));
    }

    let err = h
        .supervisor
        .relocate_channel(&stage, &h.lobby)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::EmptyChannel(name) if name == "Stage"));
}

#[tokio::test]
async fn relocate_channel_reports_permission_denied_once() {
    let h = Harness::with_channels(SimulatedProvisioner::new().deny_moves());
    let stage = h.channels.add_channel("Stage");
    h.channels.place(ParticipantId(1), &stage);
    h.channels.place(ParticipantId(2), &stage);

    let outcome = h.supervisor.relocate_channel(&stage, &h.lobby).await.unwrap();
    assert_eq!(outcome.summary(), BulkSummary::PermissionDenied { count: 2 });
}

#[tokio::test]
async fn duplicate_pool_entries_count_once() {
    let h = Harness::new();
    let mut request = h.request(&[1], 1);
    request
        .pool
        .push(PoolMember::present(Participant::new(1u64, "again")));

    let err = h.supervisor.start_round(request).await.unwrap_err();
    assert_eq!(err, StartRejection::InsufficientParticipants { eligible: 1 });
}

/// 1-2 and 3-4 met decades ago, 1-4, 2-3 and 2-4 met an hour ago, 1-3 never
/// met. Recency prefers the two ancient repeats; ever-met prefers the one
/// pair that never met.
fn seed_mixed_history(store: &InMemoryStore) {
    let now = Utc::now();
    let ancient = now - chrono::Duration::days(365 * 40);
    let recent = now - chrono::Duration::hours(1);
    for (a, b, at) in [(1, 2, ancient), (3, 4, ancient), (1, 4, recent), (2, 3, recent), (2, 4, recent)] {
        store.seed_meeting(GROUP, ParticipantId(a), ParticipantId(b), at);
    }
}

fn started_pairs(started: &round_engine::RoundStarted) -> HashSet<(u64, u64)> {
    started
        .pairs
        .iter()
        .map(|(a, b)| (a.id.0.min(b.id.0), a.id.0.max(b.id.0)))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn timestamped_history_uses_configured_recency() {
    let store = InMemoryStore::new();
    seed_mixed_history(&store);
    let h = Harness::build(store, SimulatedProvisioner::new(), EngineConfig::default());

    let started = h
        .supervisor
        .start_round(h.request(&[1, 2, 3, 4], 1))
        .await
        .unwrap();
    assert_eq!(started_pairs(&started), HashSet::from([(1, 2), (3, 4)]));
    h.supervisor.join(GROUP).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn met_only_history_falls_back_to_ever_met() {
    let store = InMemoryStore::new().with_met_only_history();
    seed_mixed_history(&store);
    let h = Harness::build(store, SimulatedProvisioner::new(), EngineConfig::default());

    let started = h
        .supervisor
        .start_round(h.request(&[1, 2, 3, 4], 1))
        .await
        .unwrap();
    assert_eq!(started_pairs(&started), HashSet::from([(1, 3), (2, 4)]));
    h.supervisor.join(GROUP).await.unwrap();
}
