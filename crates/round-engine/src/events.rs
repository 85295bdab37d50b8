//! Round events and the broadcast bus that carries them.
//!
//! The engine publishes; front ends subscribe and render. Publishing with
//! no subscribers is not an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::bulk::BulkSummary;
use crate::collaborators::{GroupId, RoundId, RoundStatus};

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Observable milestones of a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoundEvent {
    /// Channels exist and pairs have been moved into them.
    RoundPrepared {
        group_id: GroupId,
        round_id: RoundId,
        pair_count: usize,
        relocation: BulkSummary,
        timestamp: DateTime<Utc>,
    },
    WarningIssued {
        group_id: GroupId,
        round_id: RoundId,
        remaining: Duration,
        timestamp: DateTime<Utc>,
    },
    /// Teardown finished and the status has been finalized.
    RoundEnded {
        group_id: GroupId,
        round_id: RoundId,
        status: RoundStatus,
        pairs: usize,
        returned: usize,
        channels_removed: usize,
        channels_failed: usize,
        timestamp: DateTime<Utc>,
    },
}

impl RoundEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RoundPrepared { .. } => "round_prepared",
            Self::WarningIssued { .. } => "warning_issued",
            Self::RoundEnded { .. } => "round_ended",
        }
    }

    pub fn round_id(&self) -> RoundId {
        match self {
            Self::RoundPrepared { round_id, .. }
            | Self::WarningIssued { round_id, .. }
            | Self::RoundEnded { round_id, .. } => *round_id,
        }
    }

    pub fn group_id(&self) -> GroupId {
        match self {
            Self::RoundPrepared { group_id, .. }
            | Self::WarningIssued { group_id, .. }
            | Self::RoundEnded { group_id, .. } => *group_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RoundPrepared { timestamp, .. }
            | Self::WarningIssued { timestamp, .. }
            | Self::RoundEnded { timestamp, .. } => *timestamp,
        }
    }
}

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

pub struct EventBus {
    sender: broadcast::Sender<RoundEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: RoundEvent) {
        let event_type = event.event_type();
        let round_id = event.round_id();
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, %round_id, receivers = count, "Event published"),
            Err(_) => debug!(event_type, %round_id, "Event published (no receivers)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
