// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A forest is an ordered sequence of [`CscTree`]s, with only the last one
//! open for insertion. Once a tree reaches its configured depth, a fresh one
//! is appended and becomes the new insertion target.
//!
//! Build is strictly serial: `Forest` mutation is not `Sync`. Query is
//! embarrassingly parallel across trees (see [`Forest::get_parallel`]) but
//! serial within a single tree, since each tree owns its own scratch state
//! (hash group, CSC cache) that must not straddle two in-flight queries.

use crate::block::BlockRange;
use crate::config::Config;
use crate::error::Result;
use crate::tree::CscTree;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A growable sequence of segment trees, dispatching inserts to the
/// currently-open tree and queries to all of them.
pub struct Forest {
    config: Config,
    trees: Vec<CscTree>,
    current: usize,
    rng: StdRng,
}

impl Forest {
    /// Creates a forest with a single, empty tree.
    #[must_use]
    pub fn new(config: Config, rng: &mut impl Rng) -> Self {
        let mut rng = StdRng::from_rng(rng);
        let first = CscTree::new(config.clone(), &mut rng);

        Self {
            config,
            trees: vec![first],
            current: 0,
            rng,
        }
    }

    /// Number of trees in the forest, including the currently-open one.
    #[must_use]
    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    #[must_use]
    fn current_tree(&mut self) -> &mut CscTree {
        #[allow(clippy::indexing_slicing)]
        &mut self.trees[self.current]
    }

    /// Ingests one block, forwarding to the currently-open tree. When the
    /// tree fills as a result, a fresh tree is appended and becomes the new
    /// insertion target.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Decode`] if any transaction string in
    /// `txns` is malformed. The whole block is rejected and the forest is
    /// left unchanged.
    pub fn add(&mut self, block_number: u64, txns: &[String]) -> Result<()> {
        let added = self.current_tree().add_block(block_number, txns)?;

        if !added {
            self.trees.push(CscTree::new(self.config.clone(), &mut self.rng));
            self.current = self.trees.len() - 1;
            self.current_tree().add_block(block_number, txns)?;
        } else if self.current_tree().is_full() {
            self.trees.push(CscTree::new(self.config.clone(), &mut self.rng));
            self.current = self.trees.len() - 1;
        }

        Ok(())
    }

    /// Collates `item`'s hits across every tree, serially, in construction
    /// order.
    #[must_use]
    pub fn get(&mut self, item: &str) -> Vec<BlockRange> {
        let mut results = Vec::new();
        for tree in &mut self.trees {
            results.extend(tree.get(item));
        }
        results
    }

    /// Same as [`Self::get`], restricted to nodes whose range intersects
    /// `range`. Sealed trees with no overlap with `range` are skipped
    /// outright; a tree still under construction has no summary range to
    /// prune against yet, so it is always queried.
    #[must_use]
    pub fn get_range(&mut self, item: &str, range: BlockRange) -> Vec<BlockRange> {
        let mut results = Vec::new();
        for tree in &mut self.trees {
            if tree.range().is_none_or(|r| r.intersects(&range)) {
                results.extend(tree.get_range(item, range));
            }
        }
        results
    }

    /// Same as [`Self::get`], dispatching one scoped OS thread per tree.
    /// Relative order across trees is unspecified; the order of hits
    /// *within* a single tree's contribution is preserved.
    #[must_use]
    pub fn get_parallel(&mut self, item: &str) -> Vec<BlockRange> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .trees
                .iter_mut()
                .map(|tree| scope.spawn(|| tree.get(item)))
                .collect();

            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap_or_default())
                .collect()
        })
    }

    /// Total size, in bits, of every Bloom filter and CSCR across all
    /// trees.
    #[must_use]
    pub fn bit_size(&self) -> usize {
        self.trees.iter().map(CscTree::bit_size).sum()
    }

    /// Mean utilization rate across every sketch-backed CSCR in every tree.
    #[must_use]
    pub fn utilization_rate(&self) -> f64 {
        let rates: Vec<f64> = self
            .trees
            .iter()
            .map(CscTree::utilization_rate)
            .filter(|r| *r != 0.0)
            .collect();

        if rates.is_empty() {
            return 0.0;
        }

        let sum: f64 = rates.iter().sum();
        (sum / rates.len() as f64 * 100.0).round() / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn txns(sender: &str, receiver: &str) -> Vec<String> {
        vec![format!("0xabc,0,{sender},{receiver}")]
    }

    #[test]
    fn single_tree_survives_while_not_full() {
        let config = Config::new().max_level(2);
        let mut forest = Forest::new(config, &mut rng());

        for b in 0..4u64 {
            forest.add(b, &txns("alice", "bob")).unwrap();
        }

        assert_eq!(forest.tree_count(), 1);
        assert!(!forest.get("alice").is_empty());
    }

    #[test]
    fn not_yet_full_tree_is_still_queryable() {
        let config = Config::new().max_level(4);
        let mut forest = Forest::new(config, &mut rng());

        forest.add(0, &txns("alice", "bob")).unwrap();
        forest.add(1, &txns("carol", "dave")).unwrap();

        assert_eq!(forest.tree_count(), 1);
        assert_eq!(forest.get("alice"), vec![BlockRange::single(0)]);
        assert_eq!(forest.get("carol"), vec![BlockRange::single(1)]);
        assert!(forest.get("nobody").is_empty());
    }

    #[test]
    fn overflow_spills_into_a_new_tree() {
        let config = Config::new().max_level(1);
        let mut forest = Forest::new(config, &mut rng());

        for b in 0..4u64 {
            forest.add(b, &txns("alice", "bob")).unwrap();
        }

        assert_eq!(forest.tree_count(), 2);

        let hits = forest.get("alice");
        assert_eq!(hits.len(), 4);
    }

    #[test]
    fn malformed_transaction_is_rejected_and_forest_is_unchanged() {
        let config = Config::new().max_level(2);
        let mut forest = Forest::new(config, &mut rng());

        forest.add(0, &txns("alice", "bob")).unwrap();
        let err = forest.add(1, &["not,enough".to_string()]).unwrap_err();
        assert!(matches!(err, crate::error::Error::Decode(_)));

        assert_eq!(forest.get("alice").len(), 1);
        assert!(forest.get("not").is_empty());
    }

    #[test]
    fn get_range_prunes_out_of_range_hits() {
        let config = Config::new().max_level(2);
        let mut forest = Forest::new(config, &mut rng());

        for b in 0..4u64 {
            forest.add(b, &txns("alice", "bob")).unwrap();
        }

        let hits = forest.get_range("alice", BlockRange::new(0, 1));
        assert_eq!(hits.len(), 2);
        for r in hits {
            assert!(r.end() <= 1);
        }
    }

    #[test]
    fn parallel_matches_serial() {
        let config = Config::new().max_level(1);
        let mut forest = Forest::new(config, &mut rng());

        for b in 0..4u64 {
            forest.add(b, &txns("alice", "bob")).unwrap();
        }

        let mut serial = forest.get("alice");
        let mut parallel = forest.get_parallel("alice");
        serial.sort_by_key(BlockRange::start);
        parallel.sort_by_key(BlockRange::start);
        assert_eq!(serial, parallel);
    }
}
