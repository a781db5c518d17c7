// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Hashes a byte slice with XXH3-64.
#[must_use]
pub fn hash64(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}

/// Hashes a byte slice with XXH3-64, seeded.
#[must_use]
pub fn hash64_with_seed(bytes: &[u8], seed: u64) -> u64 {
    xxhash_rust::xxh3::xxh3_64_with_seed(bytes, seed)
}

/// Hashes a byte slice with XXH3-128.
#[must_use]
pub fn hash128(bytes: &[u8]) -> u128 {
    xxhash_rust::xxh3::xxh3_128(bytes)
}

/// A bank of `k` independently seeded 64-bit hashers, with a one-slot
/// memoization of the most recently hashed input.
///
/// Reused across an entire tree query to avoid rehashing the same account
/// at every level of the walk. This is single-threaded scratch: a group
/// must never be shared between two in-flight queries.
#[derive(Debug, Clone)]
pub struct HashGroup {
    seeds: Box<[u64]>,
    cached_key: Option<Box<[u8]>>,
    cached_hashes: Vec<u64>,
}

impl HashGroup {
    /// Creates a hash group with `k` seeds drawn from `rng`.
    #[must_use]
    pub fn new(k: usize, rng: &mut impl rand::Rng) -> Self {
        let seeds = (0..k).map(|_| rng.random::<u64>()).collect::<Vec<_>>();

        Self {
            seeds: seeds.into_boxed_slice(),
            cached_key: None,
            cached_hashes: Vec::new(),
        }
    }

    /// Number of hash functions in this group.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    /// The group's own seeds, in hasher order. Anything that wants its
    /// hashes interchangeable with [`hash`](Self::hash)'s memoized output
    /// (a [`crate::bloom::BloomFilter`] sharing this group, say) must be
    /// built from this exact slice.
    #[must_use]
    pub fn seeds(&self) -> &[u64] {
        &self.seeds
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    /// Returns the `k` hashes of `item`, reusing the memoized values if
    /// `item` equals the input hashed by the previous call.
    pub fn hash(&mut self, item: &[u8]) -> &[u64] {
        let hit = self
            .cached_key
            .as_deref()
            .is_some_and(|cached| cached == item);

        if !hit {
            self.cached_hashes.clear();
            self.cached_hashes
                .extend(self.seeds.iter().map(|seed| hash64_with_seed(item, *seed)));
            self.cached_key = Some(item.into());
        }

        &self.cached_hashes
    }

    /// Clears the memoized input, forcing the next `hash` call to recompute.
    pub fn clear_cache(&mut self) {
        self.cached_key = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use test_log::test;

    #[test]
    fn hash_group_memoizes_last_input() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut group = HashGroup::new(4, &mut rng);

        let first = group.hash(b"alice").to_vec();
        let second = group.hash(b"alice").to_vec();
        assert_eq!(first, second);

        let third = group.hash(b"bob").to_vec();
        assert_ne!(first, third);
    }

    #[test]
    fn hash_group_is_deterministic_given_same_seeds() {
        let mut rng_a = rand::rngs::StdRng::seed_from_u64(42);
        let mut rng_b = rand::rngs::StdRng::seed_from_u64(42);

        let mut a = HashGroup::new(3, &mut rng_a);
        let mut b = HashGroup::new(3, &mut rng_b);

        assert_eq!(a.hash(b"x"), b.hash(b"x"));
    }
}
