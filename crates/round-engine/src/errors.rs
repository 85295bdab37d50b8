//! Error taxonomy for round orchestration.
//!
//! | Type                | Raised by                    | Effect                               |
//! |---------------------|------------------------------|--------------------------------------|
//! | `StartRejection`    | `Supervisor::start_round`    | No round created                     |
//! | `StopRejection`     | `Supervisor::stop_round`     | Nothing to stop                      |
//! | `CollaboratorError` | store / provisioner / signal | Classified per call site             |
//! | `EngineError`       | round task, bulk moves       | Round ends with status `Error`       |
//!
//! Partial relocation failure is not an error type: it is reported through
//! [`crate::bulk::BulkSummary`] and the round proceeds.

use thiserror::Error;

use crate::collaborators::{ChannelHandle, RoundId};
use crate::state_machine::IllegalTransition;

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    /// Missing platform permission (e.g. "move members").
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Target member or channel no longer exists.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend unreachable or member not connected.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

impl CollaboratorError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Channel provisioning stopped part-way.
///
/// `created` holds the channels that exist and must still be torn down.
#[derive(Debug, Clone, Error)]
#[error("provisioned {} channel(s) before failing: {error}", created.len())]
pub struct ProvisionFailure {
    pub created: Vec<ChannelHandle>,
    pub error: CollaboratorError,
}

impl ProvisionFailure {
    pub fn new(created: Vec<ChannelHandle>, error: CollaboratorError) -> Self {
        Self { created, error }
    }
}

/// Engine-level failure.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Channel provisioning failed: {0}")]
    Provisioning(CollaboratorError),

    #[error("Warning broadcast failed: {0}")]
    Signal(CollaboratorError),

    #[error("Persistence failed: {0}")]
    Persistence(CollaboratorError),

    #[error("Channel lookup failed: {0}")]
    Channel(CollaboratorError),

    #[error("Channel {0} has no members")]
    EmptyChannel(String),

    #[error("Round task panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Transition(#[from] IllegalTransition),
}

/// Why a start request was refused. No round exists after any of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartRejection {
    #[error("A round is already in progress for this group")]
    AlreadyRunning { round_id: Option<RoundId> },

    #[error("Duration must be between {min} and {max} minutes (got {minutes})")]
    InvalidDuration { minutes: u32, min: u32, max: u32 },

    #[error("Not enough eligible participants (need at least 2, have {eligible})")]
    InsufficientParticipants { eligible: usize },

    #[error("Could not create any pairs")]
    NoPairingFound,

    #[error("Round could not be recorded: {0}")]
    Unavailable(String),
}

impl StartRejection {
    /// Rejected by input validation (caller can fix the request).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidDuration { .. } | Self::InsufficientParticipants { .. }
        )
    }
}

/// Why a stop request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StopRejection {
    #[error("There is no round currently running")]
    NotRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collaborator_classification() {
        assert!(CollaboratorError::PermissionDenied("move".into()).is_permission_denied());
        assert!(!CollaboratorError::Unavailable("offline".into()).is_permission_denied());
        assert!(CollaboratorError::NotFound("channel 4".into()).is_not_found());
    }

    #[test]
    fn test_validation_rejections() {
        assert!(StartRejection::InvalidDuration {
            minutes: 0,
            min: 1,
            max: 120
        }
        .is_validation());
        assert!(StartRejection::InsufficientParticipants { eligible: 1 }.is_validation());
        assert!(!StartRejection::AlreadyRunning { round_id: None }.is_validation());
        assert!(!StartRejection::NoPairingFound.is_validation());
    }

    #[test]
    fn test_provision_failure_message() {
        let failure = ProvisionFailure::new(
            vec![ChannelHandle::new(1, "Session 1")],
            CollaboratorError::Unavailable("rate limited".into()),
        );
        assert_eq!(
            failure.to_string(),
            "provisioned 1 channel(s) before failing: Unavailable: rate limited"
        );
    }
}
