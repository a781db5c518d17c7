// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::block::NodeId;
use crate::hash::hash64_with_seed;
use rustc_hash::FxHashSet;

/// A partitioned registry of file-ids (node-ids), used alongside a
/// [`super::Csc`] to recover the set of node-ids registered under a given
/// bucket offset.
#[derive(Debug, Clone)]
pub struct GlobalPartition {
    partitions: Vec<FxHashSet<NodeId>>,
    seed: u64,
}

impl GlobalPartition {
    /// Creates `partition_num` empty partitions, seeded for `partition_id`.
    #[must_use]
    pub fn new(partition_num: usize, seed: u64) -> Self {
        Self {
            partitions: (0..partition_num).map(|_| FxHashSet::default()).collect(),
            seed,
        }
    }

    /// Empties every partition, without changing their count.
    pub fn clear(&mut self) {
        for p in &mut self.partitions {
            p.clear();
        }
    }

    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// The partition a node-id falls into.
    #[must_use]
    pub fn partition_id(&self, node_id: NodeId) -> usize {
        (hash64_with_seed(&node_id.to_be_bytes(), self.seed) % self.partitions.len() as u64)
            as usize
    }

    /// Registers `node_id` under its own partition.
    pub fn add(&mut self, node_id: NodeId) {
        let id = self.partition_id(node_id);
        if let Some(partition) = self.partitions.get_mut(id) {
            partition.insert(node_id);
        }
    }

    #[must_use]
    pub fn get(&self, offset: usize) -> &FxHashSet<NodeId> {
        static EMPTY: std::sync::OnceLock<FxHashSet<NodeId>> = std::sync::OnceLock::new();
        self.partitions
            .get(offset)
            .unwrap_or_else(|| EMPTY.get_or_init(FxHashSet::default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn add_then_get_recovers_node_id() {
        let mut partitions = GlobalPartition::new(4, 99);
        partitions.add(7);
        let id = partitions.partition_id(7);
        assert!(partitions.get(id).contains(&7));
    }

    #[test]
    fn clear_empties_every_partition() {
        let mut partitions = GlobalPartition::new(4, 99);
        partitions.add(7);
        partitions.clear();
        for i in 0..4 {
            assert!(partitions.get(i).is_empty());
        }
    }
}
