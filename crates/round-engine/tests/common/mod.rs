//! Shared fixtures for round-engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use matchmaking::{Participant, ParticipantId};
use round_engine::{
    simulated_collaborators, ChannelHandle, EngineConfig, EventBus, GroupId, InMemoryStore,
    PoolMember, RoundEvent, SharedEventBus, SimulatedProvisioner, StartRequest, Supervisor,
};
use tokio::sync::broadcast;

pub const GROUP: GroupId = GroupId(1);

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub channels: Arc<SimulatedProvisioner>,
    pub events: SharedEventBus,
    pub supervisor: Supervisor,
    pub lobby: ChannelHandle,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(
            InMemoryStore::new(),
            SimulatedProvisioner::new(),
            EngineConfig::default(),
        )
    }

    pub fn with_channels(channels: SimulatedProvisioner) -> Self {
        Self::build(InMemoryStore::new(), channels, EngineConfig::default())
    }

    pub fn build(store: InMemoryStore, channels: SimulatedProvisioner, config: EngineConfig) -> Self {
        let store = Arc::new(store);
        let channels = Arc::new(channels);
        let events = EventBus::new().shared();
        let lobby = channels.add_channel("Lobby");
        let supervisor = Supervisor::new(simulated_collaborators(
            store.clone(),
            channels.clone(),
            events.clone(),
            config,
        ));
        Self {
            store,
            channels,
            events,
            supervisor,
            lobby,
        }
    }

    /// Present, non-bot members placed in the lobby.
    pub fn pool(&self, ids: &[u64]) -> Vec<PoolMember> {
        ids.iter()
            .map(|&id| {
                self.channels.place(ParticipantId(id), &self.lobby);
                PoolMember::present(Participant::new(id, format!("member-{id}")))
            })
            .collect()
    }

    pub fn request(&self, ids: &[u64], duration_minutes: u32) -> StartRequest {
        StartRequest {
            group_id: GROUP,
            requester: None,
            pool: self.pool(ids),
            lobby: self.lobby.clone(),
            duration_minutes,
        }
    }

    pub fn in_lobby(&self, id: u64) -> bool {
        self.channels.location_of(ParticipantId(id)).as_ref() == Some(&self.lobby)
    }
}

/// Everything already published on `receiver`.
pub fn drain(receiver: &mut broadcast::Receiver<RoundEvent>) -> Vec<RoundEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

pub fn event_types(events: &[RoundEvent]) -> Vec<&'static str> {
    events.iter().map(RoundEvent::event_type).collect()
}
