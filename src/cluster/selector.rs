//! Server Selection
//!
//! Maps a file name to an ordered list of partitions. The default strategy is
//! rendezvous hashing (highest random weight): every partition id is hashed
//! together with the file name and partitions are ranked by that score. The
//! ranking is a pure function of `(name, alive set)`, so removing one
//! partition only removes it from the order, leaving all other relative
//! positions intact. That keeps reshuffling minimal when a single node fails.

use crate::cluster::partitions::PartitionId;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub trait ServerSelector: Send + Sync {
    /// Orders the given alive partitions for a file name, best candidate
    /// first.
    fn select_from(&self, name: &str, alive: &[PartitionId]) -> Vec<PartitionId>;
}

/// Rendezvous (highest-random-weight) hashing.
pub struct RendezvousSelector;

impl ServerSelector for RendezvousSelector {
    fn select_from(&self, name: &str, alive: &[PartitionId]) -> Vec<PartitionId> {
        // DefaultHasher with default keys is stable across processes and
        // restarts, which keeps the ranking consistent on every node.
        let mut scored: Vec<(u64, &PartitionId)> = alive
            .iter()
            .map(|id| {
                let mut hasher = DefaultHasher::new();
                id.hash(&mut hasher);
                name.hash(&mut hasher);
                (hasher.finish(), id)
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        scored.into_iter().map(|(_, id)| id.clone()).collect()
    }
}
