//! Core matchmaking types
//!
//! Participants are identified by an opaque integer. Pairs are stored in a
//! normalized order (lower id first) so `(a, b)` and `(b, a)` hash and
//! compare as the same key everywhere.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error type for matchmaking inputs
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchError {
    #[error("A participant cannot be paired with itself: {0}")]
    SelfPair(ParticipantId),
}

/// Stable participant identifier (e.g. a chat platform user id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ParticipantId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A participant with a display label used only for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub label: String,
}

impl Participant {
    pub fn new(id: impl Into<ParticipantId>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label, self.id)
    }
}

/// Unordered pair of two distinct participants.
///
/// Invariant: `first < second`. Deserialization goes through the same
/// normalization as [`Pair::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(
    try_from = "(ParticipantId, ParticipantId)",
    into = "(ParticipantId, ParticipantId)"
)]
pub struct Pair {
    first: ParticipantId,
    second: ParticipantId,
}

impl Pair {
    /// Build a normalized pair. Returns `None` when both ids are equal.
    pub fn new(a: ParticipantId, b: ParticipantId) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self {
                first: a,
                second: b,
            }),
            std::cmp::Ordering::Greater => Some(Self {
                first: b,
                second: a,
            }),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// The member with the lower id.
    pub fn first(&self) -> ParticipantId {
        self.first
    }

    /// The member with the higher id.
    pub fn second(&self) -> ParticipantId {
        self.second
    }

    pub fn members(&self) -> [ParticipantId; 2] {
        [self.first, self.second]
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        self.first == id || self.second == id
    }

    /// The other member of the pair, if `id` belongs to it.
    pub fn partner_of(&self, id: ParticipantId) -> Option<ParticipantId> {
        if id == self.first {
            Some(self.second)
        } else if id == self.second {
            Some(self.first)
        } else {
            None
        }
    }
}

impl TryFrom<(ParticipantId, ParticipantId)> for Pair {
    type Error = MatchError;

    fn try_from((a, b): (ParticipantId, ParticipantId)) -> Result<Self, Self::Error> {
        Pair::new(a, b).ok_or(MatchError::SelfPair(a))
    }
}

impl From<Pair> for (ParticipantId, ParticipantId) {
    fn from(pair: Pair) -> Self {
        (pair.first, pair.second)
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.first, self.second)
    }
}

/// Output of the pairing engine.
///
/// Every pooled participant appears exactly once: either in one pair or in
/// `unmatched`. `unmatched` holds at most one member for any pool of two
/// or more.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingResult {
    pub pairs: Vec<Pair>,
    pub unmatched: Vec<ParticipantId>,
}

impl PairingResult {
    /// A result with no pairs where every input is unmatched.
    pub fn unpaired(participants: Vec<ParticipantId>) -> Self {
        Self {
            pairs: Vec::new(),
            unmatched: participants,
        }
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn has_pairs(&self) -> bool {
        !self.pairs.is_empty()
    }

    /// All paired participants in pair order.
    pub fn paired_participants(&self) -> impl Iterator<Item = ParticipantId> + '_ {
        self.pairs.iter().flat_map(|p| p.members())
    }

    /// Whether this result covers `pool` exactly once per member.
    pub fn is_partition_of(&self, pool: &[ParticipantId]) -> bool {
        let mut seen: Vec<ParticipantId> = self
            .paired_participants()
            .chain(self.unmatched.iter().copied())
            .collect();
        let mut expected: Vec<ParticipantId> = pool.to_vec();
        seen.sort_unstable();
        expected.sort_unstable();
        expected.dedup();
        seen == expected
    }
}
