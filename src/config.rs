// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Back-end used by a node's CSCR (repeated cuckoo sketch).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SketchBackend {
    /// Exact multimap, used below [`Config::sketch_level`]
    HashMap,

    /// `R` independent cuckoo sketches queried under intersection
    Sketch,
}

/// Tree configuration builder.
///
/// Unlike a config file loader, this type carries no I/O: it is built in
/// memory and handed to [`crate::forest::Forest::new`] or
/// [`crate::tree::CscTree::new`]. Reading a config from disk is the job of
/// an external collaborator.
#[derive(Clone, Debug)]
pub struct Config {
    /// Depth of a single tree, as a power of two leaf count (`2^max_level`
    /// leaves per tree before it is frozen and a new one starts)
    pub max_level: u32,

    /// Target false-positive rate for the shared Bloom filters
    pub bloom_fp_rate: f64,

    /// Number of hash functions used by each Bloom filter
    pub bloom_hash_fn_count: usize,

    /// Size, in bits, of a cuckoo fingerprint
    pub fingerprint_size: usize,

    /// Number of fingerprint slots per cuckoo bucket
    pub fingerprint_num: usize,

    /// Maximum consecutive cuckoo-kick attempts before doubling a CSC
    pub max_kick_attempts: usize,

    /// Minimum number of partitions in a CSC's file-id table
    pub partition_num: usize,

    /// Number of independent CSCs (`R`) composing a sketch-backed CSCR
    pub repetition_num: usize,

    /// Maximum accounts per partition before the partition count grows
    pub max_element_num_per_partition: usize,

    /// Tree level at and above which a CSCR switches from an exact
    /// `HashMap` to a repeated `Sketch`
    pub sketch_level: u32,

    /// Whether to maintain a node-id -> node index for O(1) lookup
    pub use_node_index: bool,

    /// Number of leaves collapsed into one flattened bottom node, when
    /// [`Config::use_flatten`] is set
    pub leaf_num: usize,

    /// Whether to use the flatten-mode bottom layer
    pub use_flatten: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_level: 10,
            bloom_fp_rate: 0.01,
            bloom_hash_fn_count: 4,
            fingerprint_size: 16,
            fingerprint_num: 4,
            max_kick_attempts: 500,
            partition_num: 4,
            repetition_num: 3,
            max_element_num_per_partition: 1_000,
            sketch_level: 3,
            use_node_index: true,
            leaf_num: 4,
            use_flatten: false,
        }
    }
}

impl Config {
    /// Creates a config with default tuning.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum level (tree depth as a power of two leaf count).
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn max_level(mut self, n: u32) -> Self {
        assert!(n > 0, "max_level must be greater than zero");
        self.max_level = n;
        self
    }

    /// Sets the target Bloom filter false-positive rate.
    ///
    /// # Panics
    ///
    /// Panics if `fpr` is not in `(0, 1]`.
    #[must_use]
    pub fn bloom_fp_rate(mut self, fpr: f64) -> Self {
        assert!(fpr > 0.0 && fpr <= 1.0, "fpr must be in (0, 1]");
        self.bloom_fp_rate = fpr;
        self
    }

    /// Sets the number of Bloom hash functions.
    #[must_use]
    pub fn bloom_hash_fn_count(mut self, k: usize) -> Self {
        assert!(k > 0, "bloom_hash_fn_count must be greater than zero");
        self.bloom_hash_fn_count = k;
        self
    }

    /// Sets the cuckoo fingerprint size, in bits.
    #[must_use]
    pub fn fingerprint_size(mut self, bits: usize) -> Self {
        assert!(bits > 0, "fingerprint_size must be greater than zero");
        self.fingerprint_size = bits;
        self
    }

    /// Sets the number of fingerprint slots per cuckoo bucket.
    #[must_use]
    pub fn fingerprint_num(mut self, n: usize) -> Self {
        assert!(n > 0, "fingerprint_num must be greater than zero");
        self.fingerprint_num = n;
        self
    }

    /// Sets the maximum consecutive cuckoo-kick attempts before doubling.
    #[must_use]
    pub fn max_kick_attempts(mut self, n: usize) -> Self {
        assert!(n > 0, "max_kick_attempts must be greater than zero");
        self.max_kick_attempts = n;
        self
    }

    /// Sets the minimum partition count of a CSC's file-id table.
    #[must_use]
    pub fn partition_num(mut self, n: usize) -> Self {
        assert!(n > 0, "partition_num must be greater than zero");
        self.partition_num = n;
        self
    }

    /// Sets the number of independent CSCs (`R`) in a sketch-backed CSCR.
    #[must_use]
    pub fn repetition_num(mut self, r: usize) -> Self {
        assert!(r > 0, "repetition_num must be greater than zero");
        self.repetition_num = r;
        self
    }

    /// Sets the maximum accounts per partition.
    #[must_use]
    pub fn max_element_num_per_partition(mut self, n: usize) -> Self {
        assert!(
            n > 0,
            "max_element_num_per_partition must be greater than zero"
        );
        self.max_element_num_per_partition = n;
        self
    }

    /// Sets the level at which CSCRs switch from `HashMap` to `Sketch`.
    #[must_use]
    pub fn sketch_level(mut self, level: u32) -> Self {
        self.sketch_level = level;
        self
    }

    /// Enables or disables the node-id -> node index.
    #[must_use]
    pub fn use_node_index(mut self, enabled: bool) -> Self {
        self.use_node_index = enabled;
        self
    }

    /// Sets the number of leaves collapsed into one flatten-mode bottom
    /// node.
    #[must_use]
    pub fn leaf_num(mut self, n: usize) -> Self {
        assert!(n > 1, "leaf_num must be greater than one");
        self.leaf_num = n;
        self
    }

    /// Enables or disables flatten mode.
    #[must_use]
    pub fn use_flatten(mut self, enabled: bool) -> Self {
        self.use_flatten = enabled;
        self
    }

    /// Returns the back-end a CSCR at `level` should use.
    #[must_use]
    pub fn sketch_backend_for_level(&self, level: u32) -> SketchBackend {
        if level >= self.sketch_level {
            SketchBackend::Sketch
        } else {
            SketchBackend::HashMap
        }
    }

    /// Number of partitions a CSCR at a node covering `range_size` blocks
    /// should use.
    #[must_use]
    pub fn partition_num_for_range(&self, range_size: usize) -> usize {
        self.partition_num
            .max(range_size / self.max_element_num_per_partition + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn default_config_is_sane() {
        let config = Config::default();
        assert!(config.max_level > 0);
        assert!(config.repetition_num > 0);
    }

    #[test]
    fn builder_chains() {
        let config = Config::new()
            .max_level(4)
            .bloom_fp_rate(0.001)
            .repetition_num(5)
            .use_flatten(true)
            .leaf_num(8);

        assert_eq!(config.max_level, 4);
        assert!((config.bloom_fp_rate - 0.001).abs() < f64::EPSILON);
        assert_eq!(config.repetition_num, 5);
        assert!(config.use_flatten);
        assert_eq!(config.leaf_num, 8);
    }

    #[test]
    fn sketch_backend_switches_at_configured_level() {
        let config = Config::new().sketch_level(3);
        assert_eq!(
            config.sketch_backend_for_level(2),
            SketchBackend::HashMap
        );
        assert_eq!(config.sketch_backend_for_level(3), SketchBackend::Sketch);
    }

    #[test]
    #[should_panic(expected = "max_level")]
    fn max_level_zero_panics() {
        let _ = Config::new().max_level(0);
    }
}
