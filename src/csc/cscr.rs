// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! CSCR: a CSC repeated `R` times, queried under intersection to push the
//! effective false-positive rate down to roughly `p_csc^R`. Small, low-level
//! nodes instead use an exact `HashMap` back-end.

use super::cache::CscCacheList;
use super::Csc;
use crate::block::NodeId;
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};

/// A CSCR back-end.
#[derive(Debug)]
enum Backend {
    HashMap(FxHashMap<Vec<u8>, FxHashSet<NodeId>>),
    Sketch(Vec<Csc>),
}

/// `R`-repeated cuckoo sketch, or an exact multimap for small nodes.
#[derive(Debug)]
pub struct Cscr {
    backend: Backend,
    fingerprint_size: usize,
    slot_num: usize,
    max_kick_attempts: usize,
    partition_num: usize,
}

impl Cscr {
    /// An exact multimap back-end, used below the configured sketch level.
    #[must_use]
    pub fn new_hash_map() -> Self {
        Self {
            backend: Backend::HashMap(FxHashMap::default()),
            fingerprint_size: 0,
            slot_num: 0,
            max_kick_attempts: 0,
            partition_num: 0,
        }
    }

    /// A sketch-backed CSCR of `seeds.len()` repetitions, sized for
    /// `element_num` items.
    ///
    /// `seeds` carries one `(s_anchor, s_offset)` pair per repetition. Every
    /// CSCR built for the same tree must be given the *same* `seeds` slice
    /// (held once at the tree level, not redrawn per node), so that
    /// repetition `i`'s CSC is hashed identically everywhere it occurs —
    /// the precondition for [`super::cache::CscCacheList`]'s per-repetition
    /// memoization to stay valid as a query walks from node to node.
    #[must_use]
    pub fn new_sketch(
        element_num: usize,
        fingerprint_size: usize,
        slot_num: usize,
        max_kick_attempts: usize,
        partition_num: usize,
        seeds: &[(u64, u64)],
        rng: &mut impl Rng,
    ) -> Self {
        let cscs = seeds
            .iter()
            .map(|&seed_pair| {
                Csc::with_estimation(
                    element_num,
                    fingerprint_size,
                    slot_num,
                    max_kick_attempts,
                    partition_num,
                    seed_pair,
                    rng,
                )
            })
            .collect();

        Self {
            backend: Backend::Sketch(cscs),
            fingerprint_size,
            slot_num,
            max_kick_attempts,
            partition_num,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match &self.backend {
            Backend::HashMap(m) => m.is_empty(),
            Backend::Sketch(cscs) => cscs.is_empty(),
        }
    }

    fn add_one(&mut self, item: &[u8], node_id: NodeId) -> bool {
        match &mut self.backend {
            Backend::HashMap(m) => {
                m.entry(item.to_vec()).or_default().insert(node_id);
                true
            }
            Backend::Sketch(cscs) => cscs.iter_mut().all(|csc| csc.add(item, node_id)),
        }
    }

    fn double(&mut self) {
        if let Backend::Sketch(cscs) = &mut self.backend {
            for csc in cscs.iter_mut() {
                csc.double();
            }
        }
    }

    /// Inserts every `(account, node_id)` pair, doubling and retrying the
    /// whole batch as many times as a cuckoo overflow requires. The caller
    /// never observes a partially-doubled, partially-retried structure.
    pub fn batch_add(&mut self, items: &FxHashMap<String, NodeId>) {
        loop {
            let mut overflowed = false;

            for (item, node_id) in items {
                if !self.add_one(item.as_bytes(), *node_id) {
                    overflowed = true;
                    break;
                }
            }

            if !overflowed {
                return;
            }

            self.double();
        }
    }

    /// Returns the superset of node-ids registered under `item`.
    #[must_use]
    pub fn get(&self, item: &[u8]) -> FxHashSet<NodeId> {
        match &self.backend {
            Backend::HashMap(m) => m.get(item).cloned().unwrap_or_default(),
            Backend::Sketch(cscs) => {
                if cscs.is_empty() {
                    return FxHashSet::default();
                }

                let mut iter = cscs.iter();
                #[allow(clippy::expect_used)]
                let mut result = iter.next().expect("checked non-empty above").get(item);

                for csc in iter {
                    let part = csc.get(item);
                    result.retain(|id| part.contains(id));
                }

                result
            }
        }
    }

    /// Same as [`get`](Self::get), reusing the per-repetition scratch in
    /// `cache_list` across a single tree query.
    #[must_use]
    pub fn get_with_cache(&self, item: &[u8], cache_list: &mut CscCacheList) -> FxHashSet<NodeId> {
        match &self.backend {
            Backend::HashMap(m) => m.get(item).cloned().unwrap_or_default(),
            Backend::Sketch(cscs) => {
                if cscs.is_empty() {
                    return FxHashSet::default();
                }

                let mut result: Option<FxHashSet<NodeId>> = None;

                for (i, csc) in cscs.iter().enumerate() {
                    let part = csc.get_with_cache(item, cache_list.get_mut(i));
                    result = Some(match result {
                        None => part,
                        Some(mut acc) => {
                            acc.retain(|id| part.contains(id));
                            acc
                        }
                    });
                }

                result.unwrap_or_default()
            }
        }
    }

    /// Total size of the underlying sketches, in bits. Zero for a
    /// `HashMap` back-end.
    #[must_use]
    pub fn bit_size(&self) -> usize {
        match &self.backend {
            Backend::HashMap(_) => 0,
            Backend::Sketch(cscs) => cscs.iter().map(Csc::bit_size).sum(),
        }
    }

    /// Mean utilization rate across repetitions with nonzero utilization.
    /// Zero for a `HashMap` back-end or an all-empty sketch.
    #[must_use]
    pub fn utilization_rate(&self) -> f64 {
        match &self.backend {
            Backend::HashMap(_) => 0.0,
            Backend::Sketch(cscs) => {
                let rates: Vec<f64> = cscs
                    .iter()
                    .map(Csc::utilization_rate)
                    .filter(|r| *r != 0.0)
                    .collect();

                if rates.is_empty() {
                    return 0.0;
                }

                let sum: f64 = rates.iter().sum();
                (sum / rates.len() as f64 * 100.0).round() / 100.0
            }
        }
    }

    #[must_use]
    pub fn fingerprint_size(&self) -> usize {
        self.fingerprint_size
    }

    #[must_use]
    pub fn slot_num(&self) -> usize {
        self.slot_num
    }

    #[must_use]
    pub fn max_kick_attempts(&self) -> usize {
        self.max_kick_attempts
    }

    #[must_use]
    pub fn partition_num(&self) -> usize {
        self.partition_num
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use test_log::test;

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(11)
    }

    fn seeds(r: &mut impl Rng, repetitions: usize) -> Vec<(u64, u64)> {
        (0..repetitions).map(|_| (r.random(), r.random())).collect()
    }

    #[test]
    fn hash_map_backend_round_trips() {
        let mut cscr = Cscr::new_hash_map();
        let mut items = FxHashMap::default();
        items.insert("alice".to_string(), 1u32);
        items.insert("bob".to_string(), 1u32);

        cscr.batch_add(&items);

        assert!(cscr.get(b"alice").contains(&1));
        assert!(cscr.get(b"nobody").is_empty());
    }

    #[test]
    fn sketch_backend_intersection_contains_true_positives() {
        let mut r = rng();
        let s = seeds(&mut r, 3);
        let mut cscr = Cscr::new_sketch(16, 16, 4, 500, 4, &s, &mut r);

        let mut items = FxHashMap::default();
        for i in 0..8u32 {
            items.insert(format!("account-{i}"), i);
        }

        cscr.batch_add(&items);

        for i in 0..8u32 {
            assert!(cscr.get(format!("account-{i}").as_bytes()).contains(&i));
        }
    }

    #[test]
    fn cached_matches_uncached() {
        let mut r = rng();
        let s = seeds(&mut r, 3);
        let mut cscr = Cscr::new_sketch(16, 16, 4, 500, 4, &s, &mut r);

        let mut items = FxHashMap::default();
        items.insert("alice".to_string(), 1u32);
        cscr.batch_add(&items);

        let mut cache_list = CscCacheList::new(3);
        assert_eq!(
            cscr.get_with_cache(b"alice", &mut cache_list),
            cscr.get(b"alice")
        );
    }

    /// Two sibling CSCRs sharing the same seeds, probed through one
    /// `CscCacheList` without clearing it between them (the shape of a real
    /// tree walk descending from one node to the next): the second probe
    /// must not reuse hashes memoized under the first CSCR's seeds and get
    /// them wrong, since here they happen to be identical.
    #[test]
    fn cache_reuse_across_sibling_cscrs_with_shared_seeds_is_sound() {
        let mut r = rng();
        let s = seeds(&mut r, 3);

        let mut left = Cscr::new_sketch(16, 16, 4, 500, 4, &s, &mut r);
        let mut left_items = FxHashMap::default();
        left_items.insert("alice".to_string(), 1u32);
        left.batch_add(&left_items);

        let mut right = Cscr::new_sketch(16, 16, 4, 500, 4, &s, &mut r);
        let mut right_items = FxHashMap::default();
        right_items.insert("alice".to_string(), 2u32);
        right.batch_add(&right_items);

        let mut cache_list = CscCacheList::new(3);
        let left_hit = left.get_with_cache(b"alice", &mut cache_list);
        let right_hit = right.get_with_cache(b"alice", &mut cache_list);

        assert_eq!(left_hit, left.get(b"alice"));
        assert_eq!(right_hit, right.get(b"alice"));
    }
}
