// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-query scratch shared by the `R` CSCs composing one sketch-backed
//! CSCR. Single-threaded: a [`CscCacheList`] must never straddle two
//! in-flight queries.

/// Memoized intermediate hashes for one of the `R` CSCs in a sketch.
#[derive(Debug, Clone)]
pub struct CscCache {
    fingerprint_bytes: Option<Box<[u8]>>,
    fingerprint_hash: Option<u64>,
    anchor_hash: Option<u64>,
}

impl CscCache {
    /// An empty cache: every memoized field starts unset.
    #[must_use]
    pub fn new() -> Self {
        Self {
            fingerprint_bytes: None,
            fingerprint_hash: None,
            anchor_hash: None,
        }
    }

    /// Unsets every memoized field.
    pub fn clear(&mut self) {
        self.fingerprint_bytes = None;
        self.fingerprint_hash = None;
        self.anchor_hash = None;
    }

    #[must_use]
    pub fn fingerprint_bytes(&self) -> Option<&[u8]> {
        self.fingerprint_bytes.as_deref()
    }

    /// Memoizes the packed fingerprint bytes for the rest of one query.
    pub fn set_fingerprint_bytes(&mut self, bytes: Box<[u8]>) {
        self.fingerprint_bytes = Some(bytes);
    }

    #[must_use]
    pub fn anchor_hash(&self) -> Option<u64> {
        self.anchor_hash
    }

    /// Memoizes the anchor-bucket hash for the rest of one query.
    pub fn set_anchor_hash(&mut self, hash: u64) {
        self.anchor_hash = Some(hash);
    }

    #[must_use]
    pub fn fingerprint_hash(&self) -> Option<u64> {
        self.fingerprint_hash
    }

    /// Memoizes the fingerprint hash used to derive alternate buckets for
    /// the rest of one query.
    pub fn set_fingerprint_hash(&mut self, hash: u64) {
        self.fingerprint_hash = Some(hash);
    }
}

impl Default for CscCache {
    fn default() -> Self {
        Self::new()
    }
}

/// One [`CscCache`] per repetition of a sketch-backed CSCR.
#[derive(Debug, Clone)]
pub struct CscCacheList {
    caches: Vec<CscCache>,
}

impl CscCacheList {
    /// Allocates `repetition_num` empty per-repetition caches.
    #[must_use]
    pub fn new(repetition_num: usize) -> Self {
        Self {
            caches: (0..repetition_num).map(|_| CscCache::new()).collect(),
        }
    }

    /// Unsets every memoized field in every cache.
    pub fn clear(&mut self) {
        for cache in &mut self.caches {
            cache.clear();
        }
    }

    /// Returns the cache slot for repetition `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds for the configured repetition
    /// count.
    #[allow(clippy::expect_used)]
    pub fn get_mut(&mut self, index: usize) -> &mut CscCache {
        self.caches
            .get_mut(index)
            .expect("cache list is sized to the configured repetition count")
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.caches.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn clear_resets_every_slot() {
        let mut list = CscCacheList::new(3);
        list.get_mut(0).set_anchor_hash(42);
        list.clear();
        assert_eq!(list.get_mut(0).anchor_hash(), None);
    }
}
