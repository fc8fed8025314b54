//! Load balancing across the connected subset of the pool.
//!
//! The balancer only ever sees a snapshot of currently-connected
//! connections, in creation order. Strategy changes at runtime affect the
//! next selection; an in-flight pick is never disturbed.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::id::ConnectionId;

/// Strategy used to pick the connection carrying the next outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    /// Cycle through connected connections in creation order.
    RoundRobin,
    /// Pick the connection with the lowest latency moving average.
    LeastLatency,
    /// Pick the connection handling the fewest messages this interval.
    LeastLoad,
}

/// Selection candidate: the connected-subset view of one connection.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub(crate) id: ConnectionId,
    pub(crate) latency_ms: f64,
    pub(crate) messages_per_second: u64,
}

/// Strategy-holding selector.
///
/// The round-robin cursor is an index into whatever subset is passed in, not
/// a connection identity: membership is re-evaluated on every call, so
/// connections joining or leaving the pool never wedge the rotation.
pub(crate) struct Balancer {
    cursor: AtomicUsize,
    calls: AtomicUsize,
}

impl Balancer {
    pub(crate) fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Pick a connection from `candidates`, or `None` when the connected
    /// subset is empty (callers then enqueue).
    pub(crate) fn select(
        &self,
        strategy: LoadBalancingStrategy,
        candidates: &[Candidate],
    ) -> Option<ConnectionId> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if candidates.is_empty() {
            return None;
        }
        let picked = match strategy {
            LoadBalancingStrategy::RoundRobin => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                &candidates[index]
            }
            // Ties keep the first candidate in creation order.
            LoadBalancingStrategy::LeastLatency => candidates.iter().min_by(|a, b| {
                a.latency_ms
                    .partial_cmp(&b.latency_ms)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })?,
            LoadBalancingStrategy::LeastLoad => {
                candidates.iter().min_by_key(|c| c.messages_per_second)?
            }
        };
        Some(picked.id.clone())
    }

    /// How many selections have been requested. Used to verify that some
    /// paths (network down) never consult the balancer.
    pub(crate) fn selection_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, latency_ms: f64, messages_per_second: u64) -> Candidate {
        Candidate {
            id: ConnectionId::from(id),
            latency_ms,
            messages_per_second,
        }
    }

    fn ids(candidates: &[(&str, f64, u64)]) -> Vec<Candidate> {
        candidates
            .iter()
            .map(|(id, latency, load)| candidate(id, *latency, *load))
            .collect()
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let balancer = Balancer::new();
        let candidates = ids(&[("a", 0.0, 0), ("b", 0.0, 0), ("c", 0.0, 0)]);
        let picks: Vec<String> = (0..4)
            .map(|_| {
                balancer
                    .select(LoadBalancingStrategy::RoundRobin, &candidates)
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a"]);
    }

    #[test]
    fn round_robin_survives_membership_changes() {
        let balancer = Balancer::new();
        let three = ids(&[("a", 0.0, 0), ("b", 0.0, 0), ("c", 0.0, 0)]);
        for _ in 0..3 {
            balancer.select(LoadBalancingStrategy::RoundRobin, &three);
        }
        // "a" dropped out; the cursor wraps over the smaller subset instead
        // of chasing a stale index.
        let two = ids(&[("b", 0.0, 0), ("c", 0.0, 0)]);
        let pick = balancer
            .select(LoadBalancingStrategy::RoundRobin, &two)
            .unwrap();
        assert!(pick.as_str() == "b" || pick.as_str() == "c");
    }

    #[test]
    fn least_latency_picks_minimum_and_tracks_changes() {
        let balancer = Balancer::new();
        let before = ids(&[("a", 120.0, 0), ("b", 45.0, 0), ("c", 90.0, 0)]);
        assert_eq!(
            balancer
                .select(LoadBalancingStrategy::LeastLatency, &before)
                .unwrap()
                .as_str(),
            "b"
        );
        // B degrades past C; the next call sees the fresh snapshot.
        let after = ids(&[("a", 120.0, 0), ("b", 95.0, 0), ("c", 90.0, 0)]);
        assert_eq!(
            balancer
                .select(LoadBalancingStrategy::LeastLatency, &after)
                .unwrap()
                .as_str(),
            "c"
        );
    }

    #[test]
    fn least_latency_ties_keep_first_seen() {
        let balancer = Balancer::new();
        let candidates = ids(&[("a", 50.0, 0), ("b", 50.0, 0)]);
        assert_eq!(
            balancer
                .select(LoadBalancingStrategy::LeastLatency, &candidates)
                .unwrap()
                .as_str(),
            "a"
        );
    }

    #[test]
    fn least_load_picks_quietest() {
        let balancer = Balancer::new();
        let candidates = ids(&[("a", 0.0, 12), ("b", 0.0, 3), ("c", 0.0, 7)]);
        assert_eq!(
            balancer
                .select(LoadBalancingStrategy::LeastLoad, &candidates)
                .unwrap()
                .as_str(),
            "b"
        );
    }

    #[test]
    fn empty_subset_yields_none() {
        let balancer = Balancer::new();
        for strategy in [
            LoadBalancingStrategy::RoundRobin,
            LoadBalancingStrategy::LeastLatency,
            LoadBalancingStrategy::LeastLoad,
        ] {
            assert!(balancer.select(strategy, &[]).is_none());
        }
    }
}
