// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Partitioned cuckoo sketch: a cuckoo hash table in which an item's bucket
//! depends both on the item and on a companion node-id, turning the
//! structure into an approximate multimap from account to the set of
//! node-ids it was ever inserted under.

pub mod cache;
pub mod cscr;
pub mod partition;

use crate::block::NodeId;
use crate::hash::hash64_with_seed;
use byteorder::{BigEndian, WriteBytesExt};
use cache::CscCache;
use partition::GlobalPartition;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use rustc_hash::FxHashSet;

#[derive(Debug, Clone)]
struct Bucket {
    fingerprints: Vec<Box<[u8]>>,
}

impl Bucket {
    fn empty(slot_num: usize, fingerprint_byte_len: usize) -> Self {
        Self {
            fingerprints: (0..slot_num)
                .map(|_| vec![0u8; fingerprint_byte_len].into_boxed_slice())
                .collect(),
        }
    }
}

fn is_empty_slot(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| *b == 0)
}

/// A single partitioned cuckoo table.
#[derive(Debug, Clone)]
pub struct Csc {
    bucket_pow: u32,
    buckets: Vec<Bucket>,
    mask: u64,
    fingerprint_size: usize,
    fingerprint_byte_len: usize,
    slot_num: usize,
    max_kick_attempts: usize,
    seed_anchor: u64,
    seed_offset: u64,
    partition_num: usize,
    partitions: GlobalPartition,
    utilization_count: usize,
    rng: StdRng,
}

impl Csc {
    /// Builds a CSC with an explicit bucket count (`2^bucket_pow`), using
    /// `seeds` as `(s_anchor, s_offset)`.
    ///
    /// `seeds` is taken as a parameter, not drawn from `rng`, so that every
    /// CSC at the same repetition index across a tree's CSCRs shares
    /// identical hashers — required for [`CscCache`](cache::CscCache)'s
    /// per-repetition memoization (see [`Cscr::new_sketch`](cscr::Cscr::new_sketch))
    /// to be sound across nodes. `rng` is still used for the cuckoo
    /// eviction's random victim-slot and tie-break choices, which don't
    /// affect which bucket an item hashes to.
    #[must_use]
    pub fn new(
        bucket_pow: u32,
        fingerprint_size: usize,
        slot_num: usize,
        max_kick_attempts: usize,
        partition_num: usize,
        seeds: (u64, u64),
        rng: &mut impl Rng,
    ) -> Self {
        let fingerprint_byte_len = fingerprint_size.div_ceil(8);
        let num_buckets = 1usize << bucket_pow;
        let (seed_anchor, seed_offset) = seeds;

        Self {
            bucket_pow,
            buckets: (0..num_buckets)
                .map(|_| Bucket::empty(slot_num, fingerprint_byte_len))
                .collect(),
            mask: (1u64 << bucket_pow) - 1,
            fingerprint_size,
            fingerprint_byte_len,
            slot_num,
            max_kick_attempts,
            seed_anchor,
            seed_offset,
            partition_num,
            partitions: GlobalPartition::new(partition_num, seed_offset),
            utilization_count: 0,
            rng: StdRng::from_rng(rng),
        }
    }

    /// Builds a CSC sized for roughly `element_num` items, or an empty CSC
    /// if `element_num` is zero. `seeds` follows the same sharing
    /// requirement as [`new`](Self::new).
    #[must_use]
    pub fn with_estimation(
        element_num: usize,
        fingerprint_size: usize,
        slot_num: usize,
        max_kick_attempts: usize,
        partition_num: usize,
        seeds: (u64, u64),
        rng: &mut impl Rng,
    ) -> Self {
        if element_num == 0 {
            return Self::empty(rng);
        }

        let bucket_pow = Self::estimate_bucket_pow(element_num, slot_num, partition_num);
        Self::new(
            bucket_pow,
            fingerprint_size,
            slot_num,
            max_kick_attempts,
            partition_num,
            seeds,
            rng,
        )
    }

    /// An empty CSC: zero slots per bucket, always reports "not a member"
    /// regardless of its (unused) seeds.
    #[must_use]
    pub fn empty(rng: &mut impl Rng) -> Self {
        Self::new(0, 0, 0, 0, 1, (0, 0), rng)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn estimate_bucket_pow(element_num: usize, slot_num: usize, partition_num: usize) -> u32 {
        let min_bucket_num = element_num.div_ceil(slot_num).max(1);
        let bucket_pow = (min_bucket_num as f64).log2().ceil() as u32;
        let partition_pow = (partition_num.max(1) as f64).log2().ceil() as u32;

        let bucket_num = 1usize << bucket_pow;
        if bucket_num <= partition_num {
            partition_pow
        } else {
            bucket_pow
        }
    }

    /// Doubles the bucket count, discarding all stored fingerprints and
    /// partition registrations. The caller is expected to retry the whole
    /// batch of insertions afterwards.
    pub fn double(&mut self) {
        self.bucket_pow += 1;
        let num_buckets = 1usize << self.bucket_pow;
        self.buckets = (0..num_buckets)
            .map(|_| Bucket::empty(self.slot_num, self.fingerprint_byte_len))
            .collect();
        self.mask = (1u64 << self.bucket_pow) - 1;
        self.partitions.clear();
        self.utilization_count = 0;
    }

    fn fingerprint(&self, item: &[u8]) -> Box<[u8]> {
        let shift = 64 - self.fingerprint_size.min(64);
        let value = crate::hash::hash64(item) >> shift;

        let mut bytes = Vec::with_capacity(self.fingerprint_byte_len);
        {
            let mut cursor = &mut bytes;
            cursor
                .write_uint::<BigEndian>(value, self.fingerprint_byte_len)
                .expect("writing into a Vec cannot fail");
        }

        if is_empty_slot(&bytes) {
            // An all-zero fingerprint is indistinguishable from an empty
            // slot; flip the low bit so it can still be stored.
            if let Some(last) = bytes.last_mut() {
                *last |= 1;
            }
        }

        bytes.into_boxed_slice()
    }

    fn anchor(&self, item: &[u8]) -> u64 {
        hash64_with_seed(item, self.seed_anchor) & self.mask
    }

    fn offset(&self, node_id: NodeId) -> u64 {
        hash64_with_seed(&node_id.to_be_bytes(), self.seed_offset) % self.partition_num as u64
    }

    fn primary_index(&self, item: &[u8], node_id: NodeId) -> usize {
        ((self.anchor(item) + self.offset(node_id)) & self.mask) as usize
    }

    fn alt_index(&self, index: usize, fingerprint: &[u8]) -> usize {
        let h = hash64_with_seed(fingerprint, self.seed_anchor);
        (index as u64 ^ (h & self.mask)) as usize
    }

    fn contains(&self, bucket_index: usize, fingerprint: &[u8]) -> bool {
        self.buckets
            .get(bucket_index)
            .is_some_and(|b| b.fingerprints.iter().any(|f| &**f == fingerprint))
    }

    fn has_empty(&self, bucket_index: usize) -> Option<usize> {
        self.buckets.get(bucket_index).and_then(|b| {
            b.fingerprints
                .iter()
                .position(|f| is_empty_slot(f))
        })
    }

    #[allow(clippy::expect_used)]
    fn slot_mut(&mut self, bucket_index: usize, slot_index: usize) -> &mut Box<[u8]> {
        self.buckets
            .get_mut(bucket_index)
            .expect("bucket_index is always derived modulo the bucket count")
            .fingerprints
            .get_mut(slot_index)
            .expect("slot_index is always drawn from 0..slot_num")
    }

    fn swap(&mut self, bucket_index: usize, slot_index: usize, fingerprint: Box<[u8]>) -> Box<[u8]> {
        std::mem::replace(self.slot_mut(bucket_index, slot_index), fingerprint)
    }

    /// Inserts `item` under `node_id`. Returns `false` if cuckoo eviction
    /// exceeded the configured attempt budget, in which case the caller
    /// should [`double`](Self::double) and retry the whole batch.
    pub fn add(&mut self, item: &[u8], node_id: NodeId) -> bool {
        self.partitions.add(node_id);

        let fingerprint = self.fingerprint(item);
        let bucket_index = self.primary_index(item, node_id);
        let alt_bucket_index = self.alt_index(bucket_index, &fingerprint);

        if self.contains(bucket_index, &fingerprint) || self.contains(alt_bucket_index, &fingerprint) {
            return true;
        }

        let empty = self.has_empty(bucket_index);
        let alt_empty = self.has_empty(alt_bucket_index);

        if let Some(slot) = empty {
            *self.slot_mut(bucket_index, slot) = fingerprint;
            self.utilization_count += 1;
            return true;
        }

        if let Some(slot) = alt_empty {
            *self.slot_mut(alt_bucket_index, slot) = fingerprint;
            self.utilization_count += 1;
            return true;
        }

        let mut select_bucket_index = bucket_index;
        if self.rng.random_bool(0.5) {
            select_bucket_index = alt_bucket_index;
        }

        let victim_slot = self.rng.random_range(0..self.slot_num);
        let mut tmp_fingerprint = self.swap(select_bucket_index, victim_slot, fingerprint);
        let mut kick_count = 1;
        let mut alt = self.alt_index(select_bucket_index, &tmp_fingerprint);

        loop {
            if let Some(slot) = self.has_empty(alt) {
                *self.slot_mut(alt, slot) = tmp_fingerprint;
                self.utilization_count += 1;
                return true;
            }

            let slot = self.rng.random_range(0..self.slot_num);
            tmp_fingerprint = self.swap(alt, slot, tmp_fingerprint);
            alt = self.alt_index(alt, &tmp_fingerprint);

            kick_count += 1;
            if kick_count > self.max_kick_attempts {
                return false;
            }
        }
    }

    /// Returns the superset of node-ids registered under `item`.
    #[must_use]
    pub fn get(&self, item: &[u8]) -> FxHashSet<NodeId> {
        let mut result = FxHashSet::default();

        if self.is_empty() {
            return result;
        }

        let fingerprint = self.fingerprint(item);
        let anchor = self.anchor(item);

        for offset in 0..self.partition_num as u64 {
            let index = ((anchor + offset) & self.mask) as usize;
            let alt = self.alt_index(index, &fingerprint);

            if self.contains(index, &fingerprint) || self.contains(alt, &fingerprint) {
                result.extend(self.partitions.get(offset as usize).iter().copied());
            }
        }

        result
    }

    /// Same as [`get`](Self::get), reusing hashes memoized in `cache`
    /// across the `R` repetitions of one CSCR query.
    #[must_use]
    pub fn get_with_cache(&self, item: &[u8], cache: &mut CscCache) -> FxHashSet<NodeId> {
        let mut result = FxHashSet::default();

        if self.is_empty() {
            return result;
        }

        let fingerprint = match cache.fingerprint_bytes() {
            Some(bytes) => bytes.to_vec().into_boxed_slice(),
            None => {
                let bytes = self.fingerprint(item);
                cache.set_fingerprint_bytes(bytes.clone());
                bytes
            }
        };

        let anchor = match cache.anchor_hash() {
            Some(h) => h & self.mask,
            None => {
                let h = hash64_with_seed(item, self.seed_anchor);
                cache.set_anchor_hash(h);
                h & self.mask
            }
        };

        for offset in 0..self.partition_num as u64 {
            let index = ((anchor + offset) & self.mask) as usize;

            let alt = match cache.fingerprint_hash() {
                Some(h) => (index as u64 ^ (h & self.mask)) as usize,
                None => {
                    let h = hash64_with_seed(&fingerprint, self.seed_anchor);
                    cache.set_fingerprint_hash(h);
                    (index as u64 ^ (h & self.mask)) as usize
                }
            };

            if self.contains(index, &fingerprint) || self.contains(alt, &fingerprint) {
                result.extend(self.partitions.get(offset as usize).iter().copied());
            }
        }

        result
    }

    /// Size of the underlying bucket storage, in bits.
    #[must_use]
    pub fn bit_size(&self) -> usize {
        (self.buckets.len() * self.slot_num * self.fingerprint_size) / 8
    }

    /// Fraction of slots occupied, rounded to two decimal places.
    #[must_use]
    pub fn utilization_rate(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }

        let denom = (self.buckets.len() * self.slot_num) as f64;
        (self.utilization_count as f64 / denom * 100.0).round() / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use test_log::test;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(3)
    }

    fn seeds(r: &mut impl Rng) -> (u64, u64) {
        (r.random(), r.random())
    }

    #[test]
    fn alt_index_is_involutive() {
        let mut r = rng();
        let csc = Csc::new(6, 16, 4, 500, 4, seeds(&mut r), &mut r);

        let fingerprint = csc.fingerprint(b"alice");
        let index = csc.primary_index(b"alice", 0);
        let alt = csc.alt_index(index, &fingerprint);
        assert_eq!(csc.alt_index(alt, &fingerprint), index);
    }

    #[test]
    fn partition_coverage_after_inserts() {
        let mut r = rng();
        let mut csc = Csc::new(8, 16, 4, 500, 4, seeds(&mut r), &mut r);

        for node_id in 0..10u32 {
            assert!(csc.add(b"alice", node_id));
        }

        let result = csc.get(b"alice");
        for node_id in 0..10u32 {
            assert!(result.contains(&node_id), "missing node {node_id}");
        }
    }

    #[test]
    fn empty_csc_returns_empty_result() {
        let mut r = rng();
        let csc = Csc::empty(&mut r);
        assert!(csc.get(b"anything").is_empty());
    }

    #[test]
    fn cached_get_matches_uncached_get() {
        let mut r = rng();
        let mut csc = Csc::new(8, 16, 4, 500, 4, seeds(&mut r), &mut r);
        csc.add(b"alice", 1);
        csc.add(b"bob", 2);

        let mut cache = CscCache::new();
        let cached = csc.get_with_cache(b"alice", &mut cache);
        let uncached = csc.get(b"alice");
        assert_eq!(cached, uncached);
    }
}
