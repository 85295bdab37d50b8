//! Meeting history weighting
//!
//! The pairing engine only needs one number per candidate pair: how
//! "fresh" a meeting between the two would be. Two strategies produce
//! that number:
//!
//! - [`RecencyWeighting`]: continuous weight from the time since the pair
//!   last met.
//! - [`EverMetWeighting`]: binary met / never-met signal, for history
//!   sources that only know *whether* two people met.
//!
//! Both rank never-met pairs strictly above any previously-met pair. They
//! differ only in how previously-met pairs are ordered among themselves.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Pair;

/// Timestamp of the most recent meeting per normalized pair.
///
/// A missing entry means the pair has never met.
pub type HistoryMap = HashMap<Pair, DateTime<Utc>>;

/// Weight assigned to a pair that has never met (~31 years in seconds).
///
/// Recency weights are clamped below this value, so a never-met pair
/// always outweighs any previously-met pair.
pub const NEVER_MET_WEIGHT: i64 = 1_000_000_000;

/// Weight of the freshest possible repeat meeting.
pub const MIN_WEIGHT: i64 = 1;

/// Turns meeting history into edge weights for the matcher.
pub trait PairWeighting: Send + Sync {
    /// Strategy name for logging.
    fn name(&self) -> &'static str;

    /// Edge weight for `pair`. Always in `MIN_WEIGHT..=NEVER_MET_WEIGHT`.
    fn weight(&self, pair: Pair) -> i64;
}

/// Continuous weight: seconds since the pair last met.
#[derive(Debug, Clone)]
pub struct RecencyWeighting {
    last_met: HistoryMap,
    now: DateTime<Utc>,
}

impl RecencyWeighting {
    /// Measure elapsed time against the current clock.
    pub fn new(last_met: HistoryMap) -> Self {
        Self::at(last_met, Utc::now())
    }

    /// Measure elapsed time against a fixed reference instant.
    pub fn at(last_met: HistoryMap, now: DateTime<Utc>) -> Self {
        Self { last_met, now }
    }
}

impl PairWeighting for RecencyWeighting {
    fn name(&self) -> &'static str {
        "recency"
    }

    fn weight(&self, pair: Pair) -> i64 {
        match self.last_met.get(&pair) {
            None => NEVER_MET_WEIGHT,
            Some(last) => (self.now - *last)
                .num_seconds()
                .clamp(MIN_WEIGHT, NEVER_MET_WEIGHT - 1),
        }
    }
}

/// Binary weight: never met vs. met at least once.
#[derive(Debug, Clone, Default)]
pub struct EverMetWeighting {
    met: HashSet<Pair>,
}

impl EverMetWeighting {
    pub fn new(met: HashSet<Pair>) -> Self {
        Self { met }
    }
}

impl FromIterator<Pair> for EverMetWeighting {
    fn from_iter<I: IntoIterator<Item = Pair>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl PairWeighting for EverMetWeighting {
    fn name(&self) -> &'static str {
        "ever_met"
    }

    fn weight(&self, pair: Pair) -> i64 {
        if self.met.contains(&pair) {
            MIN_WEIGHT
        } else {
            NEVER_MET_WEIGHT
        }
    }
}

/// Which weighting strategy to build from a history map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingStrategy {
    /// Prefer the pair that has gone longest without meeting.
    #[default]
    Recency,
    /// Only distinguish met from never-met.
    EverMet,
}

impl WeightingStrategy {
    /// Build the selected strategy over `history`, measured at `now`.
    pub fn build(self, history: HistoryMap, now: DateTime<Utc>) -> Box<dyn PairWeighting> {
        match self {
            Self::Recency => Box::new(RecencyWeighting::at(history, now)),
            Self::EverMet => Box::new(history.into_keys().collect::<EverMetWeighting>()),
        }
    }
}

/// Meeting history as a persistence backend serves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeetingHistory {
    /// Most recent meeting time per pair.
    Timestamped(HistoryMap),
    /// Only which pairs have met, without times.
    MetOnly(HashSet<Pair>),
}

impl MeetingHistory {
    /// Weighting for this history. A met-only history carries no times, so
    /// it always yields [`EverMetWeighting`] whatever `preferred` says.
    pub fn into_weighting(
        self,
        preferred: WeightingStrategy,
        now: DateTime<Utc>,
    ) -> Box<dyn PairWeighting> {
        match self {
            Self::Timestamped(history) => preferred.build(history, now),
            Self::MetOnly(met) => Box::new(EverMetWeighting::new(met)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Timestamped(history) => history.len(),
            Self::MetOnly(met) => met.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_met(&self, pair: &Pair) -> bool {
        match self {
            Self::Timestamped(history) => history.contains_key(pair),
            Self::MetOnly(met) => met.contains(pair),
        }
    }
}

impl From<HistoryMap> for MeetingHistory {
    fn from(history: HistoryMap) -> Self {
        Self::Timestamped(history)
    }
}

impl std::fmt::Display for WeightingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recency => write!(f, "recency"),
            Self::EverMet => write!(f, "ever_met"),
        }
    }
}
