//! Contracts for the external collaborators a round depends on.
//!
//! - [`RoundStore`]: persistence (meeting history, round records)
//! - [`ChannelProvisioner`]: create/delete temporary channels, move members
//! - [`RoundAnnouncer`]: warning broadcast and per-channel audible signal
//!
//! The engine never touches transport or storage details beyond these.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use matchmaking::{MeetingHistory, Pair, Participant, ParticipantId};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::errors::{CollaboratorError, ProvisionFailure};
use crate::events::SharedEventBus;

/// Group (server / community) a round belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a persisted round, assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoundId(pub u64);

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to a communication channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelHandle {
    pub id: u64,
    pub name: String,
}

impl ChannelHandle {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Persisted status of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    InProgress,
    Completed,
    Cancelled,
    Error,
}

impl RoundStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One past meeting from a participant's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingRecord {
    pub round_id: RoundId,
    pub partner: Participant,
    pub started_at: DateTime<Utc>,
}

/// Channels to create for one round, in pair order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBatch {
    /// Category the channels are grouped under (reused if it exists).
    pub category: String,
    pub names: Vec<String>,
}

impl ChannelBatch {
    /// `count` channels named `"<prefix> 1"`, `"<prefix> 2"`, ...
    pub fn numbered(category: &str, prefix: &str, count: usize) -> Self {
        Self {
            category: category.to_string(),
            names: (1..=count).map(|i| format!("{prefix} {i}")).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// The "time is almost up" broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarningNotice {
    pub round_id: RoundId,
    pub group_id: GroupId,
    /// Everyone in the round, sitter included.
    pub participants: Vec<ParticipantId>,
    pub channels: Vec<ChannelHandle>,
    pub remaining: Duration,
}

/// Persistence contract.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoundStore: Send + Sync {
    /// Meeting history for every pair drawn from `participants`: latest
    /// meeting times, or only which pairs met when the backend keeps no times.
    async fn last_meeting_times(
        &self,
        participants: &[ParticipantId],
    ) -> Result<MeetingHistory, CollaboratorError>;

    /// Insert or refresh participant display labels.
    async fn record_participants(
        &self,
        participants: &[Participant],
    ) -> Result<(), CollaboratorError>;

    /// Sequence number for the next round in `group` (1-based).
    async fn next_round_number(&self, group: GroupId) -> Result<u32, CollaboratorError>;

    async fn record_round(
        &self,
        group: GroupId,
        round_number: u32,
        duration_minutes: u32,
    ) -> Result<RoundId, CollaboratorError>;

    async fn record_pairs(&self, round: RoundId, pairs: &[Pair]) -> Result<(), CollaboratorError>;

    async fn finalize_round_status(
        &self,
        round: RoundId,
        status: RoundStatus,
    ) -> Result<(), CollaboratorError>;

    /// Most recent meetings of `participant`, newest first.
    async fn user_history(
        &self,
        participant: ParticipantId,
        limit: usize,
    ) -> Result<Vec<MeetingRecord>, CollaboratorError>;
}

/// Channel provisioning contract.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelProvisioner: Send + Sync {
    /// Create the batch in order. On failure, report what was created.
    async fn provision_channels(
        &self,
        batch: &ChannelBatch,
    ) -> Result<Vec<ChannelHandle>, ProvisionFailure>;

    async fn relocate(
        &self,
        member: ParticipantId,
        destination: &ChannelHandle,
    ) -> Result<(), CollaboratorError>;

    /// Delete a channel. `NotFound` is treated as already deleted.
    async fn delete_channel(&self, channel: &ChannelHandle) -> Result<(), CollaboratorError>;

    /// Members currently present in `channel`.
    async fn members_of(
        &self,
        channel: &ChannelHandle,
    ) -> Result<Vec<ParticipantId>, CollaboratorError>;
}

/// Warning and signalling contract.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoundAnnouncer: Send + Sync {
    async fn announce_warning(&self, notice: &WarningNotice) -> Result<(), CollaboratorError>;

    /// Play the audible signal in one channel. The first call acquires an
    /// exclusive signalling transport.
    async fn signal_channel(&self, channel: &ChannelHandle) -> Result<(), CollaboratorError>;

    /// Give the signalling transport back.
    async fn release_signal_transport(&self) -> Result<(), CollaboratorError>;
}

/// Everything a round needs from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn RoundStore>,
    pub provisioner: Arc<dyn ChannelProvisioner>,
    pub announcer: Arc<dyn RoundAnnouncer>,
    pub events: SharedEventBus,
    pub config: Arc<EngineConfig>,
}

impl Collaborators {
    pub fn new(
        store: Arc<dyn RoundStore>,
        provisioner: Arc<dyn ChannelProvisioner>,
        announcer: Arc<dyn RoundAnnouncer>,
        events: SharedEventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            provisioner,
            announcer,
            events,
            config: Arc::new(config),
        }
    }
}
