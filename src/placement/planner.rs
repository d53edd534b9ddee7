//! Host ranking for block placement.
//!
//! Pure bookkeeping over a snapshot of the online node set: the engine asks
//! for the best host for each placement, commits the block's bytes against
//! it, and asks again for the next one. Candidates are ranked by free bytes
//! descending with the lowest label breaking ties, so every node computes
//! the same plan from the same view.

use crate::metadata::types::{NodeEntry, NodeLabel};

/// Slices a file into block lengths: all blocks are `block_size` except a
/// smaller trailing remainder.
pub fn block_sizes(file_size: u64, block_size: u64) -> Vec<u64> {
    let mut sizes = Vec::new();
    let mut remaining = file_size;
    while remaining > 0 {
        let take = remaining.min(block_size);
        sizes.push(take);
        remaining -= take;
    }
    sizes
}

#[derive(Debug, Clone)]
pub struct HostView {
    pub label: NodeLabel,
    pub free: u64,
}

#[derive(Debug)]
pub struct Planner {
    hosts: Vec<HostView>,
}

impl Planner {
    pub fn from_nodes(nodes: &[NodeEntry]) -> Self {
        Self {
            hosts: nodes
                .iter()
                .map(|n| HostView {
                    label: n.label,
                    free: n.free(),
                })
                .collect(),
        }
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn total_free(&self) -> u64 {
        self.hosts.iter().map(|h| h.free).sum()
    }

    /// Best host able to take `need` bytes: greatest free bytes first, ties
    /// broken by the lowest label. `exclude` removes the other role's host
    /// and candidates that already failed.
    pub fn pick(&self, need: u64, exclude: &[NodeLabel]) -> Option<NodeLabel> {
        self.hosts
            .iter()
            .filter(|h| h.free >= need && !exclude.contains(&h.label))
            .max_by(|a, b| {
                a.free
                    .cmp(&b.free)
                    .then_with(|| b.label.cmp(&a.label))
            })
            .map(|h| h.label)
    }

    /// Books `bytes` against the chosen host before planning the next block.
    pub fn commit(&mut self, label: NodeLabel, bytes: u64) {
        if let Some(host) = self.hosts.iter_mut().find(|h| h.label == label) {
            host.free = host.free.saturating_sub(bytes);
        }
    }
}
