//! Pairing engine
//!
//! Builds a complete weighted graph over the pool (one node per
//! participant, one edge per candidate pair weighted by freshness) and
//! solves a maximum-cardinality, maximum-weight matching over it.
//!
//! Greedy "freshest pair first" selection is not enough: it can strand a
//! recently-met pair together when a globally better assignment exists.
//! The solver in [`crate::blossom`] is exact.
//!
//! The engine is pure: no I/O, inputs are not mutated, and results are
//! deterministic for identical inputs (pool order is the tie-break order).

use chrono::{DateTime, Utc};
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use tracing::debug;

use crate::blossom::max_weight_matching;
use crate::history::{HistoryMap, PairWeighting, RecencyWeighting};
use crate::types::{Pair, ParticipantId, PairingResult};

/// Stateless pairing engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct PairingEngine;

impl PairingEngine {
    pub fn new() -> Self {
        Self
    }

    /// Pair up `participants` so that the number of pairs is maximal and,
    /// among those, the total freshness weight is maximal.
    ///
    /// Duplicate ids are ignored after their first occurrence. Pools of
    /// fewer than two participants yield no pairs.
    pub fn create_pairs(
        &self,
        participants: &[ParticipantId],
        weighting: &dyn PairWeighting,
    ) -> PairingResult {
        let pool = dedup_in_order(participants);
        if pool.len() < 2 {
            return PairingResult::unpaired(pool);
        }

        let graph = build_graph(&pool, weighting);
        let edges: Vec<(usize, usize, i64)> = graph
            .edge_references()
            .map(|e| (e.source().index(), e.target().index(), *e.weight()))
            .collect();

        let mate = max_weight_matching(graph.node_count(), &edges, true);

        let mut pairs = Vec::with_capacity(pool.len() / 2);
        let mut unmatched = Vec::with_capacity(pool.len() % 2);
        for (i, &id) in pool.iter().enumerate() {
            match mate[i] {
                Some(j) if j > i => {
                    if let Some(pair) = Pair::new(id, pool[j]) {
                        pairs.push(pair);
                    }
                }
                Some(_) => {}
                None => unmatched.push(id),
            }
        }

        debug!(
            pool = pool.len(),
            pairs = pairs.len(),
            unmatched = unmatched.len(),
            weighting = weighting.name(),
            "Pairing computed"
        );

        PairingResult { pairs, unmatched }
    }

    /// Convenience wrapper using recency weighting measured at `now`.
    pub fn create_pairs_with_history(
        &self,
        participants: &[ParticipantId],
        history: &HistoryMap,
        now: DateTime<Utc>,
    ) -> PairingResult {
        let weighting = RecencyWeighting::at(history.clone(), now);
        self.create_pairs(participants, &weighting)
    }
}

/// Complete graph over the pool, node `i` holding `pool[i]`.
fn build_graph(pool: &[ParticipantId], weighting: &dyn PairWeighting) -> UnGraph<ParticipantId, i64> {
    let n = pool.len();
    let mut graph = UnGraph::with_capacity(n, n * (n - 1) / 2);
    let nodes: Vec<NodeIndex> = pool.iter().map(|id| graph.add_node(*id)).collect();

    for i in 0..n {
        for j in (i + 1)..n {
            if let Some(pair) = Pair::new(pool[i], pool[j]) {
                graph.add_edge(nodes[i], nodes[j], weighting.weight(pair));
            }
        }
    }
    graph
}

fn dedup_in_order(participants: &[ParticipantId]) -> Vec<ParticipantId> {
    let mut seen = std::collections::HashSet::with_capacity(participants.len());
    participants
        .iter()
        .copied()
        .filter(|id| seen.insert(*id))
        .collect()
}
