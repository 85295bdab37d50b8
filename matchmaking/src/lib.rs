//! Matchmaking for speed-friending rounds
//!
//! Turns a participant pool and a meeting history into the set of pairs
//! that maximizes "freshness": as many pairs as possible, and among those
//! the assignment where people have gone longest without meeting.
//!
//! # Components
//!
//! - **types**: `ParticipantId`, `Participant`, normalized `Pair`,
//!   `PairingResult`
//! - **history**: `HistoryMap`, `MeetingHistory` and the two weighting strategies
//!   (`RecencyWeighting`, `EverMetWeighting`)
//! - **pairing**: `PairingEngine`, the pure pool → pairs function
//! - **blossom**: exact maximum-weight matching solver
//!
//! # Usage
//!
//! ```
//! use chrono::Utc;
//! use matchmaking::{HistoryMap, PairingEngine, ParticipantId};
//!
//! let pool: Vec<ParticipantId> = (1..=5).map(ParticipantId).collect();
//! let result = PairingEngine::new().create_pairs_with_history(&pool, &HistoryMap::new(), Utc::now());
//!
//! assert_eq!(result.pairs.len(), 2);
//! assert_eq!(result.unmatched.len(), 1);
//! ```

pub mod blossom;
pub mod history;
pub mod pairing;
pub mod types;

pub use history::{
    EverMetWeighting, HistoryMap, MeetingHistory, PairWeighting, RecencyWeighting,
    WeightingStrategy, MIN_WEIGHT, NEVER_MET_WEIGHT,
};
pub use pairing::PairingEngine;
pub use types::{MatchError, Pair, Participant, ParticipantId, PairingResult};
