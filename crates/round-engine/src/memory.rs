//! In-memory collaborators.
//!
//! [`InMemoryStore`] implements [`RoundStore`]; [`SimulatedProvisioner`]
//! implements both [`ChannelProvisioner`] and [`RoundAnnouncer`] over a
//! simulated channel directory. Both back the `simulate` CLI and the
//! integration tests, and expose observers plus fault injection builders.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use matchmaking::{HistoryMap, MeetingHistory, Pair, Participant, ParticipantId};

use crate::collaborators::{
    ChannelBatch, ChannelHandle, ChannelProvisioner, Collaborators, GroupId, MeetingRecord,
    RoundAnnouncer, RoundId, RoundStatus, RoundStore, WarningNotice,
};
use crate::config::EngineConfig;
use crate::errors::{CollaboratorError, ProvisionFailure};
use crate::events::SharedEventBus;

// ── Store ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StoredRound {
    group_id: GroupId,
    round_number: u32,
    duration_minutes: u32,
    status: RoundStatus,
    started_at: DateTime<Utc>,
    pairs: Vec<Pair>,
}

#[derive(Debug, Default)]
struct StoreState {
    next_round_id: u64,
    labels: HashMap<ParticipantId, String>,
    rounds: BTreeMap<RoundId, StoredRound>,
    status_log: Vec<(RoundId, RoundStatus)>,
    history_unavailable: bool,
    met_only_history: bool,
    fail_record_pairs: bool,
}

/// Persistence collaborator kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// History queries fail with `Unavailable`.
    pub fn with_unavailable_history(self) -> Self {
        self.state().history_unavailable = true;
        self
    }

    /// History queries report only which pairs met, without times.
    pub fn with_met_only_history(self) -> Self {
        self.state().met_only_history = true;
        self
    }

    pub fn with_failing_pair_records(self) -> Self {
        self.state().fail_record_pairs = true;
        self
    }

    /// Record a completed past round in which `a` met `b` at `at`.
    pub fn seed_meeting(&self, group_id: GroupId, a: ParticipantId, b: ParticipantId, at: DateTime<Utc>) {
        let Some(pair) = Pair::new(a, b) else {
            return;
        };
        let mut state = self.state();
        let round_number = next_number(&state, group_id);
        let id = allocate_round_id(&mut state);
        state.rounds.insert(
            id,
            StoredRound {
                group_id,
                round_number,
                duration_minutes: 0,
                status: RoundStatus::Completed,
                started_at: at,
                pairs: vec![pair],
            },
        );
    }

    pub fn round_status(&self, round_id: RoundId) -> Option<RoundStatus> {
        self.state().rounds.get(&round_id).map(|r| r.status)
    }

    pub fn round_pairs(&self, round_id: RoundId) -> Vec<Pair> {
        self.state()
            .rounds
            .get(&round_id)
            .map(|r| r.pairs.clone())
            .unwrap_or_default()
    }

    pub fn round_duration_minutes(&self, round_id: RoundId) -> Option<u32> {
        self.state().rounds.get(&round_id).map(|r| r.duration_minutes)
    }

    /// Every `finalize_round_status` call, in order.
    pub fn status_log(&self) -> Vec<(RoundId, RoundStatus)> {
        self.state().status_log.clone()
    }

    pub fn label_of(&self, id: ParticipantId) -> Option<String> {
        self.state().labels.get(&id).cloned()
    }

    pub fn round_count(&self) -> usize {
        self.state().rounds.len()
    }
}

fn allocate_round_id(state: &mut StoreState) -> RoundId {
    state.next_round_id += 1;
    RoundId(state.next_round_id)
}

fn next_number(state: &StoreState, group_id: GroupId) -> u32 {
    state
        .rounds
        .values()
        .filter(|r| r.group_id == group_id)
        .map(|r| r.round_number)
        .max()
        .unwrap_or(0)
        + 1
}

#[async_trait]
impl RoundStore for InMemoryStore {
    async fn last_meeting_times(
        &self,
        participants: &[ParticipantId],
    ) -> Result<MeetingHistory, CollaboratorError> {
        let state = self.state();
        if state.history_unavailable {
            return Err(CollaboratorError::Unavailable("history store offline".into()));
        }
        let wanted: HashSet<ParticipantId> = participants.iter().copied().collect();
        let mut history = HistoryMap::new();
        for round in state.rounds.values() {
            for pair in &round.pairs {
                if !(wanted.contains(&pair.first()) && wanted.contains(&pair.second())) {
                    continue;
                }
                history
                    .entry(*pair)
                    .and_modify(|at| *at = (*at).max(round.started_at))
                    .or_insert(round.started_at);
            }
        }
        if state.met_only_history {
            return Ok(MeetingHistory::MetOnly(history.into_keys().collect()));
        }
        Ok(MeetingHistory::Timestamped(history))
    }

    async fn record_participants(
        &self,
        participants: &[Participant],
    ) -> Result<(), CollaboratorError> {
        let mut state = self.state();
        for p in participants {
            state.labels.insert(p.id, p.label.clone());
        }
        Ok(())
    }

    async fn next_round_number(&self, group: GroupId) -> Result<u32, CollaboratorError> {
        Ok(next_number(&self.state(), group))
    }

    async fn record_round(
        &self,
        group: GroupId,
        round_number: u32,
        duration_minutes: u32,
    ) -> Result<RoundId, CollaboratorError> {
        let mut state = self.state();
        let id = allocate_round_id(&mut state);
        state.rounds.insert(
            id,
            StoredRound {
                group_id: group,
                round_number,
                duration_minutes,
                status: RoundStatus::InProgress,
                started_at: Utc::now(),
                pairs: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn record_pairs(&self, round: RoundId, pairs: &[Pair]) -> Result<(), CollaboratorError> {
        let mut state = self.state();
        if state.fail_record_pairs {
            return Err(CollaboratorError::Other("pair insert failed".into()));
        }
        let stored = state
            .rounds
            .get_mut(&round)
            .ok_or_else(|| CollaboratorError::NotFound(format!("round {round}")))?;
        stored.pairs.extend_from_slice(pairs);
        Ok(())
    }

    async fn finalize_round_status(
        &self,
        round: RoundId,
        status: RoundStatus,
    ) -> Result<(), CollaboratorError> {
        let mut state = self.state();
        state.status_log.push((round, status));
        let stored = state
            .rounds
            .get_mut(&round)
            .ok_or_else(|| CollaboratorError::NotFound(format!("round {round}")))?;
        stored.status = status;
        Ok(())
    }

    async fn user_history(
        &self,
        participant: ParticipantId,
        limit: usize,
    ) -> Result<Vec<MeetingRecord>, CollaboratorError> {
        let state = self.state();
        let mut meetings: Vec<MeetingRecord> = state
            .rounds
            .iter()
            .flat_map(|(round_id, round)| {
                round.pairs.iter().filter_map(move |pair| {
                    pair.partner_of(participant).map(|partner| (*round_id, round.started_at, partner))
                })
            })
            .map(|(round_id, started_at, partner)| MeetingRecord {
                round_id,
                partner: Participant::new(
                    partner,
                    state
                        .labels
                        .get(&partner)
                        .cloned()
                        .unwrap_or_else(|| partner.to_string()),
                ),
                started_at,
            })
            .collect();
        meetings.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then(b.round_id.cmp(&a.round_id))
        });
        meetings.truncate(limit);
        Ok(meetings)
    }
}

// ── Channels and signalling ─────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimState {
    next_channel_id: u64,
    live: BTreeMap<u64, ChannelHandle>,
    categories: Vec<String>,
    locations: HashMap<ParticipantId, u64>,
    deleted: Vec<ChannelHandle>,
    provision_calls: usize,
    relocation_calls: usize,
    warnings: Vec<WarningNotice>,
    signal_visits: Vec<ChannelHandle>,
    transport_held: bool,
    transport_releases: usize,
    // faults
    failing_members: HashSet<ParticipantId>,
    deny_moves: bool,
    fail_provisioning_after: Option<usize>,
    fail_warning: bool,
    relocation_delay: Duration,
}

/// Simulated channel directory with configurable faults.
#[derive(Debug, Default)]
pub struct SimulatedProvisioner {
    state: Mutex<SimState>,
}

impl SimulatedProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves of `member` fail as if they disconnected.
    pub fn with_failing_member(self, member: ParticipantId) -> Self {
        self.state().failing_members.insert(member);
        self
    }

    /// Every move fails with `PermissionDenied`.
    pub fn deny_moves(self) -> Self {
        self.state().deny_moves = true;
        self
    }

    /// Provisioning creates `count` channels, then fails.
    pub fn fail_provisioning_after(self, count: usize) -> Self {
        self.state().fail_provisioning_after = Some(count);
        self
    }

    pub fn fail_warning(self) -> Self {
        self.state().fail_warning = true;
        self
    }

    pub fn with_relocation_delay(self, delay: Duration) -> Self {
        self.state().relocation_delay = delay;
        self
    }

    /// Register a pre-existing channel (e.g. the lobby).
    pub fn add_channel(&self, name: &str) -> ChannelHandle {
        let mut state = self.state();
        create_channel(&mut state, name)
    }

    /// Put `member` into `channel` without going through `relocate`.
    pub fn place(&self, member: ParticipantId, channel: &ChannelHandle) {
        self.state().locations.insert(member, channel.id);
    }

    pub fn location_of(&self, member: ParticipantId) -> Option<ChannelHandle> {
        let state = self.state();
        state
            .locations
            .get(&member)
            .and_then(|id| state.live.get(id))
            .cloned()
    }

    pub fn live_channels(&self) -> Vec<ChannelHandle> {
        self.state().live.values().cloned().collect()
    }

    pub fn deleted_channels(&self) -> Vec<ChannelHandle> {
        self.state().deleted.clone()
    }

    pub fn categories(&self) -> Vec<String> {
        self.state().categories.clone()
    }

    pub fn warnings(&self) -> Vec<WarningNotice> {
        self.state().warnings.clone()
    }

    pub fn signal_visits(&self) -> Vec<ChannelHandle> {
        self.state().signal_visits.clone()
    }

    pub fn signal_transport_held(&self) -> bool {
        self.state().transport_held
    }

    pub fn transport_releases(&self) -> usize {
        self.state().transport_releases
    }

    pub fn provision_calls(&self) -> usize {
        self.state().provision_calls
    }

    pub fn relocation_calls(&self) -> usize {
        self.state().relocation_calls
    }
}

fn create_channel(state: &mut SimState, name: &str) -> ChannelHandle {
    state.next_channel_id += 1;
    let handle = ChannelHandle::new(state.next_channel_id, name);
    state.live.insert(handle.id, handle.clone());
    handle
}

#[async_trait]
impl ChannelProvisioner for SimulatedProvisioner {
    async fn provision_channels(
        &self,
        batch: &ChannelBatch,
    ) -> Result<Vec<ChannelHandle>, ProvisionFailure> {
        let mut state = self.state();
        state.provision_calls += 1;
        if !state.categories.contains(&batch.category) {
            state.categories.push(batch.category.clone());
        }

        let mut created = Vec::with_capacity(batch.len());
        for (i, name) in batch.names.iter().enumerate() {
            if state.fail_provisioning_after.is_some_and(|limit| i >= limit) {
                return Err(ProvisionFailure::new(
                    created,
                    CollaboratorError::Unavailable("channel limit reached".into()),
                ));
            }
            created.push(create_channel(&mut state, name));
        }
        Ok(created)
    }

    async fn relocate(
        &self,
        member: ParticipantId,
        destination: &ChannelHandle,
    ) -> Result<(), CollaboratorError> {
        let delay = self.state().relocation_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.relocation_calls += 1;
        if state.deny_moves {
            return Err(CollaboratorError::PermissionDenied("move members".into()));
        }
        if state.failing_members.contains(&member) {
            return Err(CollaboratorError::Unavailable(format!("{member} is not connected")));
        }
        if !state.live.contains_key(&destination.id) {
            return Err(CollaboratorError::NotFound(destination.to_string()));
        }
        state.locations.insert(member, destination.id);
        Ok(())
    }

    async fn delete_channel(&self, channel: &ChannelHandle) -> Result<(), CollaboratorError> {
        let mut state = self.state();
        let removed = state
            .live
            .remove(&channel.id)
            .ok_or_else(|| CollaboratorError::NotFound(channel.to_string()))?;
        state.locations.retain(|_, id| *id != channel.id);
        state.deleted.push(removed);
        Ok(())
    }

    async fn members_of(
        &self,
        channel: &ChannelHandle,
    ) -> Result<Vec<ParticipantId>, CollaboratorError> {
        let state = self.state();
        if !state.live.contains_key(&channel.id) {
            return Err(CollaboratorError::NotFound(channel.to_string()));
        }
        let mut members: Vec<ParticipantId> = state
            .locations
            .iter()
            .filter(|(_, id)| **id == channel.id)
            .map(|(member, _)| *member)
            .collect();
        members.sort();
        Ok(members)
    }
}

#[async_trait]
impl RoundAnnouncer for SimulatedProvisioner {
    async fn announce_warning(&self, notice: &WarningNotice) -> Result<(), CollaboratorError> {
        let mut state = self.state();
        if state.fail_warning {
            return Err(CollaboratorError::PermissionDenied("send messages".into()));
        }
        state.warnings.push(notice.clone());
        Ok(())
    }

    async fn signal_channel(&self, channel: &ChannelHandle) -> Result<(), CollaboratorError> {
        let mut state = self.state();
        if !state.live.contains_key(&channel.id) {
            return Err(CollaboratorError::NotFound(channel.to_string()));
        }
        state.transport_held = true;
        state.signal_visits.push(channel.clone());
        Ok(())
    }

    async fn release_signal_transport(&self) -> Result<(), CollaboratorError> {
        let mut state = self.state();
        state.transport_held = false;
        state.transport_releases += 1;
        Ok(())
    }
}

/// Wire an in-memory store and a simulated provisioner together.
pub fn simulated_collaborators(
    store: Arc<InMemoryStore>,
    channels: Arc<SimulatedProvisioner>,
    events: SharedEventBus,
    config: EngineConfig,
) -> Collaborators {
    Collaborators::new(store, channels.clone(), channels, events, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn id(raw: u64) -> ParticipantId {
        ParticipantId(raw)
    }

    #[tokio::test]
    async fn test_store_reports_latest_meeting() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.seed_meeting(GroupId(1), id(1), id(2), now - ChronoDuration::days(3));
        store.seed_meeting(GroupId(1), id(2), id(1), now - ChronoDuration::hours(1));
        store.seed_meeting(GroupId(1), id(3), id(9), now);

        let history = store.last_meeting_times(&[id(1), id(2), id(3)]).await.unwrap();
        assert_eq!(history.len(), 1);
        let key = Pair::new(id(1), id(2)).unwrap();
        let MeetingHistory::Timestamped(times) = history else {
            panic!("expected timestamped history");
        };
        assert_eq!(times[&key], now - ChronoDuration::hours(1));
    }

    #[tokio::test]
    async fn test_met_only_store_drops_times() {
        let store = InMemoryStore::new().with_met_only_history();
        store.seed_meeting(GroupId(1), id(1), id(2), Utc::now());

        let history = store.last_meeting_times(&[id(1), id(2)]).await.unwrap();
        let key = Pair::new(id(1), id(2)).unwrap();
        assert_eq!(history, MeetingHistory::MetOnly(HashSet::from([key])));
    }

    #[tokio::test]
    async fn test_round_numbers_are_per_group() {
        let store = InMemoryStore::new();
        assert_eq!(store.next_round_number(GroupId(1)).await.unwrap(), 1);
        store.record_round(GroupId(1), 1, 5).await.unwrap();
        store.record_round(GroupId(1), 2, 5).await.unwrap();
        assert_eq!(store.next_round_number(GroupId(1)).await.unwrap(), 3);
        assert_eq!(store.next_round_number(GroupId(2)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_user_history_newest_first_with_labels() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store
            .record_participants(&[Participant::new(2u64, "bea"), Participant::new(3u64, "cal")])
            .await
            .unwrap();
        store.seed_meeting(GroupId(1), id(1), id(2), now - ChronoDuration::days(2));
        store.seed_meeting(GroupId(1), id(3), id(1), now - ChronoDuration::days(1));
        store.seed_meeting(GroupId(1), id(2), id(3), now);

        let history = store.user_history(id(1), 10).await.unwrap();
        let partners: Vec<&str> = history.iter().map(|m| m.partner.label.as_str()).collect();
        assert_eq!(partners, vec!["cal", "bea"]);

        let limited = store.user_history(id(1), 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_finalize_unknown_round_is_not_found() {
        let store = InMemoryStore::new();
        let err = store
            .finalize_round_status(RoundId(99), RoundStatus::Completed)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_provisioning_partial_failure_reports_created() {
        let sim = SimulatedProvisioner::new().fail_provisioning_after(2);
        let batch = ChannelBatch::numbered("Speed-friending", "Session", 4);
        let failure = sim.provision_channels(&batch).await.unwrap_err();
        assert_eq!(failure.created.len(), 2);
        assert_eq!(sim.live_channels().len(), 2);
        assert_eq!(sim.categories(), vec!["Speed-friending".to_string()]);
    }

    #[tokio::test]
    async fn test_relocate_and_delete() {
        let sim = SimulatedProvisioner::new();
        let lobby = sim.add_channel("Lobby");
        let batch = ChannelBatch::numbered("Speed-friending", "Session", 1);
        let channels = sim.provision_channels(&batch).await.unwrap();

        sim.relocate(id(1), &channels[0]).await.unwrap();
        assert_eq!(sim.location_of(id(1)), Some(channels[0].clone()));
        assert_eq!(sim.members_of(&channels[0]).await.unwrap(), vec![id(1)]);

        sim.delete_channel(&channels[0]).await.unwrap();
        assert!(sim.delete_channel(&channels[0]).await.unwrap_err().is_not_found());
        assert_eq!(sim.location_of(id(1)), None);
        assert_eq!(sim.live_channels(), vec![lobby]);
    }

    #[tokio::test]
    async fn test_relocation_faults() {
        let sim = SimulatedProvisioner::new().with_failing_member(id(2));
        let lobby = sim.add_channel("Lobby");
        assert!(sim.relocate(id(1), &lobby).await.is_ok());
        assert!(!sim
            .relocate(id(2), &lobby)
            .await
            .unwrap_err()
            .is_permission_denied());

        let denied = SimulatedProvisioner::new().deny_moves();
        let lobby = denied.add_channel("Lobby");
        assert!(denied
            .relocate(id(1), &lobby)
            .await
            .unwrap_err()
            .is_permission_denied());
    }

    #[tokio::test]
    async fn test_signal_transport_lifecycle() {
        let sim = SimulatedProvisioner::new();
        let channel = sim.add_channel("Session 1");
        sim.signal_channel(&channel).await.unwrap();
        assert!(sim.signal_transport_held());
        sim.release_signal_transport().await.unwrap();
        assert!(!sim.signal_transport_held());
        assert_eq!(sim.transport_releases(), 1);
        assert_eq!(sim.signal_visits(), vec![channel]);
    }
}
