//! Round State Machine: explicit phases and legal transition guards.
//!
//! Every round starts at `Preparing` and always ends at `Done`, reached only
//! through `WindingDown` (teardown). The final status (completed, cancelled,
//! error) is a tag carried alongside the phase, settled once.
//!
//! ```text
//! Preparing ──► Active ──► WindingDown ──► Done
//!     │                        ▲
//!     └────────────────────────┘   (provisioning fault / early cancel)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::collaborators::RoundStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Provisioning channels and moving pairs into them.
    Preparing,
    /// Holding for the configured duration (silent span, then warning span).
    Active,
    /// Returning members, deleting channels, releasing transport.
    WindingDown,
    /// Teardown finished. Terminal.
    Done,
}

impl RoundPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preparing => write!(f, "Preparing"),
            Self::Active => write!(f, "Active"),
            Self::WindingDown => write!(f, "WindingDown"),
            Self::Done => write!(f, "Done"),
        }
    }
}

fn is_legal_transition(from: RoundPhase, to: RoundPhase) -> bool {
    use RoundPhase::*;

    matches!(
        (from, to),
        (Preparing, Active)
            | (Preparing, WindingDown)
            | (Active, WindingDown)
            | (WindingDown, Done)
    )
}

/// A single recorded phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: RoundPhase,
    pub to: RoundPhase,
    /// Milliseconds since the state machine was created.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub from: RoundPhase,
    pub to: RoundPhase,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal round transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// Phase tracker for one round.
#[derive(Debug)]
pub struct RoundStateMachine {
    current: RoundPhase,
    status: RoundStatus,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl RoundStateMachine {
    pub fn new() -> Self {
        Self {
            current: RoundPhase::Preparing,
            status: RoundStatus::InProgress,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> RoundPhase {
        self.current
    }

    /// `InProgress` until [`conclude`](Self::conclude) is first called.
    pub fn status(&self) -> RoundStatus {
        self.status
    }

    pub fn advance(&mut self, to: RoundPhase, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        let record = TransitionRecord {
            from: self.current,
            to,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        };

        tracing::debug!(from = %self.current, to = %to, reason = reason.unwrap_or(""), "Round transition");

        self.transitions.push(record);
        self.current = to;
        Ok(())
    }

    /// Settle the final status. Only the first terminal status sticks.
    ///
    /// Returns whether this call set it.
    pub fn conclude(&mut self, status: RoundStatus) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn summary(&self) -> String {
        let phases: Vec<String> = self.transitions.iter().map(|t| t.to.to_string()).collect();
        let mut out = format!(
            "{} → {} [{}] ({}ms, {} transitions)",
            RoundPhase::Preparing,
            self.current,
            self.status,
            self.created_at.elapsed().as_millis(),
            self.transitions.len(),
        );
        if !phases.is_empty() {
            out.push_str(&format!(" [{}]", phases.join(" → ")));
        }
        out
    }
}

impl Default for RoundStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
