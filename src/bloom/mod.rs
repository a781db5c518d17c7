// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod bit_array;

use crate::hash::HashGroup;
use bit_array::BitArray;

/// A Bloom filter with `k` independently seeded hash functions.
///
/// Used at every internal node of a tree to hold the "hot" accounts shared
/// by both of the node's subtrees. An empty filter (`n = 0` at construction)
/// always reports "not a member".
#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct BloomFilter {
    inner: BitArray,
    m: usize,
    seeds: Box<[u64]>,
}

impl BloomFilter {
    /// Constructs a filter sized for `n` items at false-positive rate `fpr`,
    /// using `seeds` as its hash-function seeds (one per hasher, `k =
    /// seeds.len()`).
    ///
    /// Every filter queried through [`contains_with_group`](Self::contains_with_group)
    /// against a given [`HashGroup`] must be built from that same group's
    /// own `seeds()` — [`contains_with_group`](Self::contains_with_group)
    /// trusts the group's memoized hashes to land on this filter's bit
    /// indices, which only holds if the seeds are identical.
    ///
    /// Sizing follows the reference search: find the smallest `m` (in bits)
    /// for which `(1 - e^(-kn/m))^k <= fpr`. When `n` or `k` is zero the
    /// filter is empty and every query reports "not a member".
    #[must_use]
    pub fn with_fp_rate(n: usize, fpr: f64, seeds: &[u64]) -> Self {
        let k = seeds.len();
        if n == 0 || k == 0 {
            return Self::empty();
        }

        let m = Self::find_optimal_m(n, fpr, k);

        Self {
            inner: BitArray::with_capacity(m.div_ceil(8)),
            m,
            seeds: seeds.into(),
        }
    }

    /// An empty filter: zero hash functions, zero bits, always reports
    /// "not a member".
    #[must_use]
    pub fn empty() -> Self {
        Self {
            inner: BitArray::with_capacity(0),
            m: 0,
            seeds: Box::new([]),
        }
    }

    /// Whether this filter was built with zero capacity.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.m == 0
    }

    /// Size of the underlying bit array, in bits.
    #[must_use]
    pub fn bit_len(&self) -> usize {
        self.m
    }

    /// Number of hash functions.
    #[must_use]
    pub fn hash_fn_count(&self) -> usize {
        self.seeds.len()
    }

    fn find_optimal_m(n: usize, fpr: f64, k: usize) -> usize {
        // Closed-form estimate gives a starting point close to the answer;
        // we then walk forward (never backward) to the exact reference
        // search result, since `calculate_fpr` is monotonically decreasing
        // in `m`.
        let n_f = n as f64;
        let k_f = k as f64;
        let target = fpr.clamp(f64::MIN_POSITIVE, 1.0).powf(1.0 / k_f);
        let estimate = if target >= 1.0 {
            n
        } else {
            (-(k_f * n_f) / (1.0 - target).ln()).ceil() as usize
        };

        let mut m = estimate.max(n).max(1);

        while Self::calculate_fpr(k, n, m) > fpr {
            m += 1;
        }

        m
    }

    fn calculate_fpr(k: usize, n: usize, m: usize) -> f64 {
        let exponent = -(k as f64) * (n as f64) / (m as f64);
        (1.0 - exponent.exp()).powi(k as i32)
    }

    /// Adds `item` to the filter. No-op on an empty filter.
    pub fn add(&mut self, item: &[u8]) {
        if self.is_empty() {
            return;
        }

        for seed in &self.seeds {
            let idx = (crate::hash::hash64_with_seed(item, *seed) % self.m as u64) as usize;
            self.inner.set(idx, true);
        }
    }

    /// Returns `true` if `item` may be a member. Never a false negative.
    #[must_use]
    pub fn contains(&self, item: &[u8]) -> bool {
        if self.is_empty() {
            return false;
        }

        for seed in &self.seeds {
            let idx = (crate::hash::hash64_with_seed(item, *seed) % self.m as u64) as usize;
            if !self.inner.get(idx) {
                return false;
            }
        }

        true
    }

    /// Same as [`contains`](Self::contains), but reuses hashes memoized in
    /// `group` for repeated queries of the same item across tree levels.
    ///
    /// `group` must be the same [`HashGroup`] (or one built from the same
    /// seeds) that this filter's `seeds` came from — see
    /// [`with_fp_rate`](Self::with_fp_rate). Given that, `group.hash(item)`
    /// is bit-for-bit the same per-hasher hash `add`/`contains` compute
    /// from `self.seeds`, so it can be indexed directly.
    #[must_use]
    pub fn contains_with_group(&self, item: &[u8], group: &mut HashGroup) -> bool {
        if self.is_empty() {
            return false;
        }

        debug_assert_eq!(
            group.seeds(),
            &*self.seeds,
            "bloom filter and hash group must share seeds"
        );

        for hash in group.hash(item) {
            let idx = (hash % self.m as u64) as usize;
            if !self.inner.get(idx) {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashGroup;
    use rand::SeedableRng;
    use test_log::test;

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(1)
    }

    fn seeds(r: &mut impl rand::Rng, k: usize) -> Vec<u64> {
        (0..k).map(|_| r.random()).collect()
    }

    #[test]
    fn empty_filter_never_contains() {
        let filter = BloomFilter::empty();
        assert!(!filter.contains(b"anything"));
    }

    #[test]
    fn zero_n_is_empty() {
        let mut r = rng();
        let filter = BloomFilter::with_fp_rate(0, 0.01, &seeds(&mut r, 4));
        assert!(filter.is_empty());
        assert!(!filter.contains(b"anything"));
    }

    #[test]
    fn basic_membership() {
        let mut r = rng();
        let mut filter = BloomFilter::with_fp_rate(10, 0.0001, &seeds(&mut r, 4));

        let keys: &[&[u8]] = &[b"item0", b"item1", b"item2", b"item3"];

        for key in keys {
            assert!(!filter.contains(key));
            filter.add(key);
            assert!(filter.contains(key));
        }
    }

    #[test]
    fn false_positive_rate_is_roughly_bounded() {
        let mut r = rng();
        let item_count = 10_000;
        let wanted_fpr = 0.1;

        let mut filter = BloomFilter::with_fp_rate(item_count, wanted_fpr, &seeds(&mut r, 4));

        for i in 0..item_count {
            filter.add(format!("present-{i}").as_bytes());
        }

        let mut false_positives = 0;
        for i in 0..item_count {
            if filter.contains(format!("absent-{i}").as_bytes()) {
                false_positives += 1;
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let fpr = false_positives as f64 / item_count as f64;
        assert!(fpr < wanted_fpr * 2.0, "fpr was {fpr}");
    }

    #[test]
    fn contains_with_group_agrees_with_contains() {
        let mut r = rng();
        let mut group = HashGroup::new(4, &mut r);
        let mut filter = BloomFilter::with_fp_rate(10, 0.0001, group.seeds());

        let keys: &[&[u8]] = &[b"item0", b"item1", b"item2", b"item3"];

        for key in keys {
            assert!(!filter.contains_with_group(key, &mut group));
            filter.add(key);
            assert!(filter.contains(key));
            assert!(filter.contains_with_group(key, &mut group));
        }

        assert!(!filter.contains_with_group(b"absent", &mut group));
    }

    #[test]
    fn calculate_fpr_decreases_with_m() {
        let a = BloomFilter::calculate_fpr(4, 1_000, 4_000);
        let b = BloomFilter::calculate_fpr(4, 1_000, 8_000);
        assert!(b < a);
    }
}
