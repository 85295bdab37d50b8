//! Bulk Membership Operator: apply one relocation to N members concurrently.
//!
//! ```text
//!   moves ──► JoinSet::spawn(relocate(member_i, dest_i)) × N
//!                         │
//!                join_next() until empty        (all settled barrier)
//!                         │
//!                         ▼
//!   BulkOutcome (input order) ──► BulkSummary
//! ```
//!
//! Every move is attempted regardless of the others. A panicking move is
//! recorded as a failure for that member only.

use std::sync::Arc;

use matchmaking::ParticipantId;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::collaborators::{ChannelHandle, ChannelProvisioner};
use crate::errors::{CollaboratorError, EngineError};

/// Result of one member's relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveOutcome {
    pub member: ParticipantId,
    pub destination: ChannelHandle,
    pub result: Result<(), CollaboratorError>,
}

impl MoveOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Aggregate classification of a bulk relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BulkSummary {
    /// Nothing to move.
    Empty,
    AllSucceeded { count: usize },
    /// Nothing moved and every failure was a permission error.
    PermissionDenied { count: usize },
    Partial { succeeded: usize, failed: usize },
}

impl BulkSummary {
    pub fn failed(&self) -> usize {
        match *self {
            Self::Empty | Self::AllSucceeded { .. } => 0,
            Self::PermissionDenied { count } => count,
            Self::Partial { failed, .. } => failed,
        }
    }

    pub fn succeeded(&self) -> usize {
        match *self {
            Self::AllSucceeded { count } => count,
            Self::Partial { succeeded, .. } => succeeded,
            Self::Empty | Self::PermissionDenied { .. } => 0,
        }
    }
}

/// Per-member outcomes, in the order the moves were submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub outcomes: Vec<MoveOutcome>,
}

impl BulkOutcome {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = &MoveOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn summary(&self) -> BulkSummary {
        let total = self.outcomes.len();
        let succeeded = self.succeeded();
        let failed = total - succeeded;

        if total == 0 {
            BulkSummary::Empty
        } else if failed == 0 {
            BulkSummary::AllSucceeded { count: succeeded }
        } else if succeeded == 0
            && self
                .failures()
                .all(|o| matches!(&o.result, Err(e) if e.is_permission_denied()))
        {
            BulkSummary::PermissionDenied { count: failed }
        } else {
            BulkSummary::Partial { succeeded, failed }
        }
    }
}

/// Relocate each `(member, destination)` concurrently and wait for all.
pub async fn relocate_moves(
    provisioner: &Arc<dyn ChannelProvisioner>,
    moves: Vec<(ParticipantId, ChannelHandle)>,
) -> BulkOutcome {
    // Pre-filled so a panicked task still leaves a failure in its slot.
    let mut outcomes: Vec<MoveOutcome> = moves
        .iter()
        .map(|(member, destination)| MoveOutcome {
            member: *member,
            destination: destination.clone(),
            result: Err(CollaboratorError::Other("relocation task panicked".into())),
        })
        .collect();

    let mut join_set: JoinSet<(usize, Result<(), CollaboratorError>)> = JoinSet::new();
    for (index, (member, destination)) in moves.into_iter().enumerate() {
        let provisioner = Arc::clone(provisioner);
        join_set.spawn(async move {
            let result = provisioner.relocate(member, &destination).await;
            (index, result)
        });
    }

    while let Some(res) = join_set.join_next().await {
        match res {
            Ok((index, result)) => {
                if let Err(e) = &result {
                    debug!(member = %outcomes[index].member, error = %e, "relocation failed");
                }
                outcomes[index].result = result;
            }
            Err(e) => warn!(error = %e, "relocation task panicked"),
        }
    }

    BulkOutcome { outcomes }
}

/// Relocate every member in `members` to the channel chosen by `resolve`.
pub async fn relocate_all(
    provisioner: &Arc<dyn ChannelProvisioner>,
    members: &[ParticipantId],
    resolve: impl Fn(ParticipantId) -> ChannelHandle,
) -> BulkOutcome {
    let moves = members.iter().map(|&m| (m, resolve(m))).collect();
    relocate_moves(provisioner, moves).await
}

/// Move everyone currently in `source` to `target`.
pub async fn relocate_channel_members(
    provisioner: &Arc<dyn ChannelProvisioner>,
    source: &ChannelHandle,
    target: &ChannelHandle,
) -> Result<BulkOutcome, EngineError> {
    let members = provisioner
        .members_of(source)
        .await
        .map_err(EngineError::Channel)?;
    if members.is_empty() {
        return Err(EngineError::EmptyChannel(source.name.clone()));
    }
    Ok(relocate_all(provisioner, &members, |_| target.clone()).await)
}
