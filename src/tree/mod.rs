// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A single segment tree over a contiguous run of blocks: built bottom-up,
//! queried top-down.
//!
//! Construction pairs nodes off a deque as they arrive; every merge of two
//! siblings promotes their shared accounts into a Bloom filter and pushes
//! the rest one level up, until the tree reaches its configured depth and
//! the top pair is promoted into a [`RootNode`]. A query walks back down,
//! trusting the Bloom filter where it can and falling back to a node's CSCR
//! (and, on a detected false positive, backtracking to the parent) where it
//! can't.

mod account_map;
mod node;

use crate::block::{AccountSet, BlockRange, NodeId};
use crate::bloom::BloomFilter;
use crate::config::{Config, SketchBackend};
use crate::csc::cache::CscCacheList;
use crate::csc::cscr::Cscr;
use crate::error::Result;
use crate::hash::HashGroup;
use account_map::AccountMap;
use node::{new_flatten_node, FlattenNode, InternalNode, LeafNode, Node, NodeKind, NodeOps};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;

struct QueryPlan {
    node: NodeId,
    parent: Option<NodeId>,
    pushed_by_bloom: bool,
    ignore_bloom: bool,
}

impl QueryPlan {
    fn new(node: NodeId, parent: Option<NodeId>, pushed_by_bloom: bool, ignore_bloom: bool) -> Self {
        Self {
            node,
            parent,
            pushed_by_bloom,
            ignore_bloom,
        }
    }
}

/// One forest member: a self-contained segment tree over up to
/// `2^max_level` consecutive blocks.
pub struct CscTree {
    config: Config,
    nodes: Vec<Node>,
    root: Option<NodeId>,
    /// Construction-time deque of not-yet-promoted subtree roots, back to
    /// front in arrival order.
    queue: VecDeque<NodeId>,
    next_nid: NodeId,
    hash_group: HashGroup,
    csc_cache_list: CscCacheList,
    /// One `(s_anchor, s_offset)` pair per CSCR repetition, drawn once at
    /// tree construction and reused by every CSCR built for this tree (see
    /// [`new_cscr_with_estimation`](Self::new_cscr_with_estimation)), so
    /// that repetition `i` hashes identically at every node — the
    /// precondition for `csc_cache_list`'s cross-node memoization to be
    /// sound.
    csc_seeds: Vec<(u64, u64)>,
    rng: StdRng,
}

impl CscTree {
    #[must_use]
    pub fn new(config: Config, rng: &mut impl rand::Rng) -> Self {
        let hash_group = HashGroup::new(config.bloom_hash_fn_count, rng);
        let csc_cache_list = CscCacheList::new(config.repetition_num);
        let csc_seeds = (0..config.repetition_num)
            .map(|_| (rng.random::<u64>(), rng.random::<u64>()))
            .collect();

        Self {
            config,
            nodes: Vec::new(),
            root: None,
            queue: VecDeque::new(),
            next_nid: 1,
            hash_group,
            csc_cache_list,
            csc_seeds,
            rng: StdRng::from_rng(rng),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Depth reached so far by the construction frontier: `0` for an empty
    /// tree or a lone leaf, growing by one each time the frontier merges up
    /// a level. Only ever equals [`Config::max_level`](crate::config::Config::max_level)
    /// once the tree is [`full`](Self::is_full).
    #[must_use]
    pub fn level(&self) -> u32 {
        self.root
            .or_else(|| self.queue.back().copied())
            .map_or(0, |r| self.node(r).level())
    }

    /// Whether this tree has reached its configured depth and been
    /// promoted to a final root. No more blocks can be added past this
    /// point.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.root.is_some()
    }

    #[must_use]
    pub fn range(&self) -> Option<BlockRange> {
        self.root.map(|r| self.node(r).range())
    }

    fn alloc_nid(&mut self) -> NodeId {
        let nid = self.next_nid;
        self.next_nid += 1;
        nid
    }

    fn insert_node(&mut self, node: Node) {
        debug_assert_eq!(self.nodes.len() as NodeId + 1, node.nid());
        self.nodes.push(node);
    }

    #[allow(clippy::expect_used)]
    fn node(&self, id: NodeId) -> &Node {
        self.nodes
            .get((id - 1) as usize)
            .expect("node-ids are only ever handed out for arena slots that exist")
    }

    #[allow(clippy::expect_used)]
    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes
            .get_mut((id - 1) as usize)
            .expect("node-ids are only ever handed out for arena slots that exist")
    }

    fn kind_of(&self, id: NodeId) -> NodeKind {
        self.node(id).kind()
    }

    fn range_of(&self, id: NodeId) -> BlockRange {
        self.node(id).range()
    }

    fn left_child_of(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).left_child()
    }

    fn right_child_of(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).right_child()
    }

    fn sibling_of(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).sibling()
    }

    fn bloom_of(&self, id: NodeId) -> Arc<BloomFilter> {
        Arc::clone(self.node(id).bloom_filter())
    }

    fn cscr_of(&self, id: NodeId) -> Arc<Cscr> {
        Arc::clone(self.node(id).cscr())
    }

    fn flatten_cscr_of(&self, id: NodeId) -> Arc<Cscr> {
        match self.node(id) {
            Node::Flatten(f) => Arc::clone(f.flatten_cscr()),
            _ => panic!("flatten_cscr_of called on a non-flatten node"),
        }
    }

    fn children_of(&self, id: NodeId) -> Vec<NodeId> {
        match self.node(id) {
            Node::Flatten(f) => f.children().to_vec(),
            _ => panic!("children_of called on a non-flatten node"),
        }
    }

    /// Every Bloom filter in this tree is built from the tree's own
    /// [`HashGroup`]'s seeds, never freshly drawn ones: `contains_with_group`
    /// only gives correct answers when the filter and the group it's probed
    /// with share identical seeds.
    fn new_bloom_filter(&mut self, n: usize) -> BloomFilter {
        let seeds = self.hash_group.seeds().to_vec();
        BloomFilter::with_fp_rate(n, self.config.bloom_fp_rate, &seeds)
    }

    fn new_cscr_with_estimation(&mut self, element_num: usize, range_size: u64) -> Cscr {
        let partition_num = self.config.partition_num_for_range(range_size as usize);
        Cscr::new_sketch(
            element_num,
            self.config.fingerprint_size,
            self.config.fingerprint_num,
            self.config.max_kick_attempts,
            partition_num,
            &self.csc_seeds,
            &mut self.rng,
        )
    }

    // ---- non-flatten construction -----------------------------------

    /// Adds a block's sender accounts as a new leaf, merging it upward
    /// through the construction deque as far as sibling pairing allows.
    ///
    /// Returns `Ok(false)` without adding anything if the tree has already
    /// reached its configured depth.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Decode`] if any transaction string is
    /// malformed. No partial state is added in that case.
    pub fn add_block(&mut self, block_number: u64, txns: &[String]) -> Result<bool> {
        if self.config.use_flatten {
            return self.add_block_flatten(block_number, txns);
        }

        if self.is_full() {
            return Ok(false);
        }

        let nid = self.alloc_nid();
        let sender_set = AccountSet::from_block(txns, nid)?;
        self.insert_node(Node::Leaf(LeafNode::new(nid, BlockRange::single(block_number), sender_set)));
        Ok(self.add_leaf(nid))
    }

    fn add_leaf(&mut self, leaf_id: NodeId) -> bool {
        if self.is_full() {
            return false;
        }

        let Some(&last) = self.queue.back() else {
            self.queue.push_back(leaf_id);
            return true;
        };

        match self.kind_of(last) {
            NodeKind::Leaf => {
                self.queue.pop_back();
                let new_node = self.create_internal_node(last, leaf_id);
                self.promote_upward(new_node)
            }
            NodeKind::Internal | NodeKind::Flatten => {
                self.queue.push_back(leaf_id);
                true
            }
            NodeKind::Root => unreachable!("a Root node never sits in the construction queue"),
        }
    }

    /// Repeatedly merges `new_node` with same-level internal nodes at the
    /// back of the construction deque, until it either becomes the root or
    /// settles because the deque's back is empty, mismatched in level, or
    /// not an internal node.
    fn promote_upward(&mut self, mut new_node: NodeId) -> bool {
        loop {
            if self.node(new_node).level() == self.config.max_level {
                let root = self.create_root_node(new_node);
                self.root = Some(root);
                return true;
            }

            let Some(&last) = self.queue.back() else {
                self.queue.push_back(new_node);
                return true;
            };

            if self.kind_of(last) != NodeKind::Internal || self.node(last).level() != self.node(new_node).level() {
                self.queue.push_back(new_node);
                return true;
            }

            self.queue.pop_back();
            new_node = self.create_internal_node(last, new_node);
        }
    }

    fn create_internal_node(&mut self, left: NodeId, right: NodeId) -> NodeId {
        let level = self.node(left).level() + 1;
        let range = self
            .node(left)
            .range()
            .merge_adjacent(&self.node(right).range())
            .expect("siblings merged into one internal node must cover adjacent ranges");
        let nid = self.alloc_nid();

        self.node_mut(left).set_left_child_flag(true);
        self.node_mut(right).set_left_child_flag(false);
        self.node_mut(left).set_sibling(right);
        self.node_mut(right).set_sibling(left);

        let left_set = self.node(left).sender_set().cloned().unwrap_or_default();
        let right_set = self.node(right).sender_set().cloned().unwrap_or_default();
        let intersection = left_set.intersect(&right_set);

        let mut bf = self.new_bloom_filter(intersection.len());
        for item in &intersection {
            bf.add(item.as_bytes());
        }
        let bf = Arc::new(bf);
        self.node_mut(left).set_bloom_filter(Arc::clone(&bf));
        self.node_mut(right).set_bloom_filter(bf);

        if self.kind_of(left) == NodeKind::Internal {
            let cscr_left = Arc::new(self.initialize_cscr(left, &intersection));
            let cscr_right = Arc::new(self.initialize_cscr(right, &intersection));

            let (ll, lr) = (
                self.left_child_of(left).expect("internal node has a left child"),
                self.right_child_of(left).expect("internal node has a right child"),
            );
            self.node_mut(ll).set_cscr(Arc::clone(&cscr_left));
            self.node_mut(lr).set_cscr(cscr_left);

            let (rl, rr) = (
                self.left_child_of(right).expect("internal node has a left child"),
                self.right_child_of(right).expect("internal node has a right child"),
            );
            self.node_mut(rl).set_cscr(Arc::clone(&cscr_right));
            self.node_mut(rr).set_cscr(cscr_right);
        }

        let mut new_sender_set = left_set.union(right_set);
        for account in &intersection {
            new_sender_set.insert(account.clone(), nid);
        }

        self.insert_node(Node::Internal(InternalNode::new(
            nid,
            level,
            range,
            left,
            right,
            Some(new_sender_set),
        )));

        self.node_mut(left).set_sender_set(None);
        self.node_mut(right).set_sender_set(None);

        nid
    }

    /// Builds the CSCR that should sit on `node_id`'s own children, holding
    /// just the accounts shared with `node_id`'s new sibling.
    fn initialize_cscr(&mut self, node_id: NodeId, intersection: &[String]) -> Cscr {
        if intersection.is_empty() {
            return Cscr::new_hash_map();
        }

        let extracted: FxHashMap<String, NodeId> = self
            .node_mut(node_id)
            .sender_set_mut()
            .map(|s| s.bulk_extract(intersection))
            .unwrap_or_default();

        let level = self.node(node_id).level();
        let range_size = self.node(node_id).range().size();

        let mut cscr = match self.config.sketch_backend_for_level(level) {
            SketchBackend::HashMap => Cscr::new_hash_map(),
            SketchBackend::Sketch => self.new_cscr_with_estimation(extracted.len(), range_size),
        };
        cscr.batch_add(&extracted);
        cscr
    }

    fn create_root_node(&mut self, internal_id: NodeId) -> NodeId {
        let mut sender_set = self.node_mut(internal_id).sender_set_mut().map(std::mem::take).unwrap_or_default();

        let self_owned: Vec<String> = sender_set
            .iter()
            .filter(|(_, nid)| *nid == internal_id)
            .map(|(k, _)| k.to_string())
            .collect();
        for key in &self_owned {
            sender_set.remove(key);
        }

        let range_size = self.node(internal_id).range().size();
        let account_map: FxHashMap<String, NodeId> =
            sender_set.iter().map(|(k, v)| (k.to_string(), v)).collect();

        let mut cscr = self.new_cscr_with_estimation(account_map.len(), range_size);
        cscr.batch_add(&account_map);
        let cscr = Arc::new(cscr);

        let (left, right) = (
            self.left_child_of(internal_id).expect("internal node has a left child"),
            self.right_child_of(internal_id).expect("internal node has a right child"),
        );
        self.node_mut(left).set_cscr(Arc::clone(&cscr));
        self.node_mut(right).set_cscr(cscr);

        self.node_mut(internal_id).set_sender_set(None);

        let Node::Internal(internal) = std::mem::replace(
            self.node_mut(internal_id),
            Node::Internal(InternalNode::new(internal_id, 0, BlockRange::single(0), 0, 0, None)),
        ) else {
            unreachable!("internal_id always names an InternalNode before promotion");
        };
        *self.node_mut(internal_id) = Node::Root(internal.into_root());

        internal_id
    }

    // ---- flatten-mode construction ------------------------------------

    fn add_block_flatten(&mut self, block_number: u64, txns: &[String]) -> Result<bool> {
        if self.is_full() {
            return Ok(false);
        }

        let nid = self.alloc_nid();
        let sender_set = AccountSet::from_block(txns, nid)?;
        self.insert_node(Node::Leaf(LeafNode::new(nid, BlockRange::single(block_number), sender_set)));
        Ok(self.add_leaf_flatten(nid))
    }

    fn add_leaf_flatten(&mut self, leaf_id: NodeId) -> bool {
        if self.is_full() {
            return false;
        }

        let Some(&last) = self.queue.back() else {
            self.queue.push_back(leaf_id);
            return true;
        };

        match self.kind_of(last) {
            NodeKind::Internal | NodeKind::Flatten => {
                self.queue.push_back(leaf_id);
                true
            }
            NodeKind::Root => unreachable!("a Root node never sits in the construction queue"),
            NodeKind::Leaf => {
                let k = self.config.leaf_num;
                let mut leaves = vec![leaf_id];

                // Walk backward over the deque, collecting the run of
                // trailing leaves. Bails out to a plain push as soon as the
                // run is too short or interrupted by a non-leaf.
                for i in 1..k {
                    let Some(&candidate) = self.queue.iter().rev().nth(i - 1) else {
                        self.queue.push_back(leaf_id);
                        return true;
                    };
                    if self.kind_of(candidate) != NodeKind::Leaf {
                        self.queue.push_back(leaf_id);
                        return true;
                    }
                    leaves.push(candidate);
                }
                leaves.reverse();

                for _ in 0..k - 1 {
                    self.queue.pop_back();
                }

                let flatten_id = self.create_flatten_node(leaves);
                self.promote_flatten_upward(flatten_id)
            }
        }
    }

    /// Merges a freshly-folded flatten group with a same-level flatten
    /// sibling at the back of the deque, if one is waiting, then hands the
    /// resulting internal node to the ordinary upward-merge loop. Mirrors
    /// [`Self::promote_upward`] for the one flatten-specific merge step.
    fn promote_flatten_upward(&mut self, flatten_id: NodeId) -> bool {
        if self.node(flatten_id).level() == self.config.max_level {
            let root = self.create_root_node(flatten_id);
            self.root = Some(root);
            return true;
        }

        let Some(&last) = self.queue.back() else {
            self.queue.push_back(flatten_id);
            return true;
        };

        if self.kind_of(last) != NodeKind::Flatten || self.node(last).level() != self.node(flatten_id).level() {
            self.queue.push_back(flatten_id);
            return true;
        }

        self.queue.pop_back();
        let new_internal = self.create_internal_node_upon_flatten(last, flatten_id);
        self.promote_upward(new_internal)
    }

    /// Collapses `leaves` (in original block order) into one flatten node:
    /// merges their sender sets into an `AccountMap`, then splits off
    /// addresses recurring across more than one leaf into a separate
    /// `tmp_account_map`, replacing their entry in the main map with a
    /// single reference to the flatten node itself.
    fn create_flatten_node(&mut self, leaves: Vec<NodeId>) -> NodeId {
        let range = leaves
            .iter()
            .map(|id| self.range_of(*id))
            .reduce(|a, b| a.merge_adjacent(&b).unwrap_or(a))
            .expect("at least one leaf");

        let nid = self.alloc_nid();
        let mut node = new_flatten_node(nid, leaves.clone(), range);

        let mut account_map = AccountMap::new();
        for &leaf in &leaves {
            if let Some(set) = self.node_mut(leaf).sender_set_mut().map(std::mem::take) {
                for (addr, owner) in set.iter() {
                    account_map.insert(addr.to_string(), owner);
                }
            }
        }

        let recurring: Vec<String> = account_map
            .iter()
            .filter(|(_, nids)| nids.len() > 1)
            .map(|(addr, _)| addr.to_string())
            .collect();

        // Addresses recurring across more than one leaf move to the
        // flatten node's own tmp map, keyed under their original owners;
        // the main map now points them at the flatten node itself.
        let tmp_account_map = account_map.batch_get_with_delete(&recurring);
        for addr in recurring {
            account_map.insert(addr, nid);
        }

        node.account_map = Some(account_map);
        node.tmp_account_map = Some(tmp_account_map);

        self.insert_node(Node::Flatten(node));
        nid
    }

    fn create_internal_node_upon_flatten(&mut self, left: NodeId, right: NodeId) -> NodeId {
        let level = self.node(left).level() + 1;
        let range = self
            .node(left)
            .range()
            .merge_adjacent(&self.node(right).range())
            .expect("flatten siblings must cover adjacent ranges");
        let nid = self.alloc_nid();

        self.node_mut(left).set_left_child_flag(true);
        self.node_mut(right).set_left_child_flag(false);
        self.node_mut(left).set_sibling(right);
        self.node_mut(right).set_sibling(left);

        let (left_map, right_map) = {
            let Node::Flatten(l) = self.node(left) else { unreachable!() };
            let Node::Flatten(r) = self.node(right) else { unreachable!() };
            (
                l.account_map().cloned().unwrap_or_default(),
                r.account_map().cloned().unwrap_or_default(),
            )
        };

        let intersection = left_map.intersect(&right_map);

        let mut bf = self.new_bloom_filter(intersection.len());
        for item in &intersection {
            bf.add(item.as_bytes());
        }
        let bf = Arc::new(bf);
        self.node_mut(left).set_bloom_filter(Arc::clone(&bf));
        self.node_mut(right).set_bloom_filter(bf);

        let cscr_left = Arc::new(self.initialize_flatten_cscr(left, &intersection));
        let cscr_right = Arc::new(self.initialize_flatten_cscr(right, &intersection));
        if let Node::Flatten(l) = self.node_mut(left) {
            l.set_flatten_cscr(cscr_left);
        }
        if let Node::Flatten(r) = self.node_mut(right) {
            r.set_flatten_cscr(cscr_right);
        }

        let (left_map, right_map) = {
            let Node::Flatten(l) = self.node(left) else { unreachable!() };
            let Node::Flatten(r) = self.node(right) else { unreachable!() };
            (
                l.account_map().cloned().unwrap_or_default(),
                r.account_map().cloned().unwrap_or_default(),
            )
        };

        let mut new_sender_set = left_map.to_account_set().union(right_map.to_account_set());
        for addr in &intersection {
            new_sender_set.insert(addr.clone(), nid);
        }

        self.insert_node(Node::Internal(InternalNode::new(
            nid,
            level,
            range,
            left,
            right,
            Some(new_sender_set),
        )));

        if let Node::Flatten(l) = self.node_mut(left) {
            let _ = l.take_account_maps();
        }
        if let Node::Flatten(r) = self.node_mut(right) {
            let _ = r.take_account_maps();
        }

        nid
    }

    /// Builds the flatten-local CSCR for one side of a flatten pair: the
    /// addresses this side shares with its sibling, resolved down to the
    /// individual leaf(s) that actually own them.
    fn initialize_flatten_cscr(&mut self, node_id: NodeId, intersection: &[String]) -> Cscr {
        let range_size = self.node(node_id).range().size();

        let mut extracted = {
            let Node::Flatten(f) = self.node_mut(node_id) else {
                unreachable!("initialize_flatten_cscr called on a non-flatten node")
            };
            f.account_map_mut()
                .map(|m| m.batch_get_with_delete(intersection))
                .unwrap_or_default()
        };
        extracted.remove_entries_owned_by(node_id);

        let merged = {
            let Node::Flatten(f) = self.node_mut(node_id) else {
                unreachable!()
            };
            let tmp = f.tmp_account_map().cloned().unwrap_or_default();
            tmp.union(extracted)
        };

        let pairs = merged.to_pairs();
        if pairs.is_empty() {
            return Cscr::new_hash_map();
        }

        let mut cscr = self.new_cscr_with_estimation(pairs.len(), range_size);
        // A distinct (addr, nid) pair can share an address with another
        // pair, so each is added as its own single-entry batch rather than
        // collapsed into one map; `batch_add` already handles doubling and
        // retrying on cuckoo overflow.
        for (addr, owner) in &pairs {
            let mut one = FxHashMap::default();
            one.insert(addr.clone(), *owner);
            cscr.batch_add(&one);
        }

        cscr
    }

    // ---- queries -------------------------------------------------------

    /// Returns the block ranges of every leaf (or flatten-leaf) that may
    /// contain `item`, with a bounded false-positive-rate superset
    /// guarantee from the Bloom filters and CSCRs involved.
    #[must_use]
    pub fn get(&mut self, item: &str) -> Vec<BlockRange> {
        self.walk(item, None)
    }

    /// Same as [`Self::get`], restricted to nodes whose range intersects
    /// `range`.
    #[must_use]
    pub fn get_range(&mut self, item: &str, range: BlockRange) -> Vec<BlockRange> {
        self.walk(item, Some(range))
    }

    fn walk(&mut self, item: &str, range_filter: Option<BlockRange>) -> Vec<BlockRange> {
        self.csc_cache_list.clear();
        self.hash_group.clear_cache();

        let mut results = Vec::new();
        let item_bytes = item.as_bytes();

        let in_range = |tree: &Self, id: NodeId| {
            range_filter.is_none_or(|r| tree.range_of(id).intersects(&r))
        };

        let mut queue = VecDeque::new();

        if let Some(root) = self.root {
            queue.push_back(QueryPlan::new(root, None, false, false));
        } else {
            // Not yet sealed: there is no root to start from, but every
            // subtree still waiting in the construction deque already
            // carries its own fully up-to-date `sender_set`/`account_map`
            // for everything below it (that data only gets pushed down
            // into a Bloom/CSCR pair once this subtree is itself paired
            // with a sibling). Resolve directly against those instead of
            // returning nothing, so a block is findable immediately after
            // `add_block`, not only once its tree fills up.
            let pending: Vec<NodeId> = self.queue.iter().copied().collect();
            for pending_root in pending {
                if !in_range(self, pending_root) {
                    continue;
                }
                self.resolve_pending_root(pending_root, item, item_bytes, range_filter, &mut queue, &mut results);
            }
        }

        while let Some(qp) = queue.pop_front() {
            if !in_range(self, qp.node) {
                continue;
            }

            match self.kind_of(qp.node) {
                NodeKind::Root => {
                    if let Some(left) = self.left_child_of(qp.node) {
                        queue.push_back(QueryPlan::new(left, None, false, false));
                    }
                }
                NodeKind::Internal => {
                    let n_id = qp.node;
                    let bloom = self.bloom_of(n_id);
                    let hit = bloom.contains_with_group(item_bytes, &mut self.hash_group);

                    if hit && !qp.ignore_bloom {
                        let sibling = self.sibling_of(n_id).expect("internal node has a sibling");
                        let left = self.left_child_of(n_id).expect("internal node has a left child");
                        let sibling_left = self
                            .left_child_of(sibling)
                            .expect("internal sibling has a left child");

                        if in_range(self, left) {
                            queue.push_back(QueryPlan::new(left, Some(n_id), true, false));
                        }
                        if in_range(self, sibling_left) {
                            queue.push_back(QueryPlan::new(sibling_left, Some(n_id), true, false));
                        }
                    } else {
                        let cscr = self.cscr_of(n_id);
                        let cscr_res = cscr.get_with_cache(item_bytes, &mut self.csc_cache_list);

                        if cscr_res.is_empty() && qp.pushed_by_bloom {
                            if let Some(parent) = qp.parent {
                                queue.push_back(QueryPlan::new(parent, None, false, true));
                            }
                            continue;
                        }

                        for found_id in cscr_res {
                            let Some(found) = self.find_node_by_id(n_id, found_id) else {
                                continue;
                            };
                            self.push_found(found, item_bytes, range_filter, &mut queue, &mut results);
                        }
                    }
                }
                NodeKind::Leaf => {
                    let bloom = self.bloom_of(qp.node);
                    let hit = bloom.contains_with_group(item_bytes, &mut self.hash_group);

                    if hit {
                        results.push(self.range_of(qp.node));
                        if let Some(sibling) = self.sibling_of(qp.node) {
                            if in_range(self, sibling) {
                                results.push(self.range_of(sibling));
                            }
                        }
                    } else {
                        let cscr = self.cscr_of(qp.node);
                        let cscr_res = cscr.get_with_cache(item_bytes, &mut self.csc_cache_list);

                        if cscr_res.is_empty() && qp.pushed_by_bloom {
                            if let Some(parent) = qp.parent {
                                queue.push_back(QueryPlan::new(parent, None, false, true));
                            }
                            continue;
                        }

                        let own_nid = self.node(qp.node).nid();
                        for nid in cscr_res {
                            if nid == own_nid {
                                results.push(self.range_of(qp.node));
                            } else if let Some(sibling) = self.sibling_of(qp.node) {
                                if in_range(self, sibling) {
                                    results.push(self.range_of(sibling));
                                }
                            }
                        }
                    }
                }
                NodeKind::Flatten => {
                    let bloom = self.bloom_of(qp.node);
                    let hit = bloom.contains_with_group(item_bytes, &mut self.hash_group);

                    if hit && !qp.ignore_bloom {
                        let left_res = self.search_flatten_cscr(qp.node, item_bytes, range_filter);
                        let sibling = self.sibling_of(qp.node);
                        let right_res = sibling
                            .map(|s| self.search_flatten_cscr(s, item_bytes, range_filter))
                            .unwrap_or_default();

                        if (left_res.is_empty() || right_res.is_empty()) && qp.pushed_by_bloom {
                            queue.push_back(QueryPlan::new(qp.node, None, false, true));
                            continue;
                        }

                        results.extend(left_res);
                        results.extend(right_res);
                    } else {
                        let cscr = self.cscr_of(qp.node);
                        let cscr_res = cscr.get_with_cache(item_bytes, &mut self.csc_cache_list);

                        if cscr_res.is_empty() && qp.pushed_by_bloom {
                            if let Some(parent) = qp.parent {
                                queue.push_back(QueryPlan::new(parent, None, false, true));
                            }
                            continue;
                        }

                        let own_nid = self.node(qp.node).nid();
                        let sibling = self.sibling_of(qp.node);

                        for nid in cscr_res {
                            if nid == own_nid {
                                results.extend(self.search_flatten_cscr(qp.node, item_bytes, range_filter));
                            } else if sibling == Some(nid) {
                                if let Some(sib) = sibling {
                                    results.extend(self.search_flatten_cscr(sib, item_bytes, range_filter));
                                }
                            } else if self.children_of(qp.node).contains(&nid) {
                                if in_range(self, nid) {
                                    results.push(self.range_of(nid));
                                }
                            } else if let Some(sib) = sibling {
                                if self.children_of(sib).contains(&nid) && in_range(self, nid) {
                                    results.push(self.range_of(nid));
                                }
                            }
                        }
                    }
                }
            }
        }

        results
    }

    fn search_flatten_cscr(
        &mut self,
        flatten_id: NodeId,
        item: &[u8],
        range_filter: Option<BlockRange>,
    ) -> Vec<BlockRange> {
        let cscr = self.flatten_cscr_of(flatten_id);
        let nid_list = cscr.get_with_cache(item, &mut self.csc_cache_list);
        let children = self.children_of(flatten_id);

        nid_list
            .into_iter()
            .filter(|nid| children.contains(nid))
            .map(|nid| self.range_of(nid))
            .filter(|r| range_filter.is_none_or(|rf| r.intersects(&rf)))
            .collect()
    }

    /// Resolves `item` against a subtree that is still sitting in the
    /// construction deque, i.e. hasn't yet been paired with a sibling and so
    /// has no Bloom filter or CSCR of its own. Every such node's own
    /// `sender_set` (or, for a [`FlattenNode`], its `account_map`/
    /// `tmp_account_map` pair) is exactly the not-yet-demoted mapping from
    /// account to the id of the node that currently owns it — the same
    /// information a sealed ancestor's CSCR would have stored, one level up.
    fn resolve_pending_root(
        &mut self,
        root: NodeId,
        item: &str,
        item_bytes: &[u8],
        range_filter: Option<BlockRange>,
        queue: &mut VecDeque<QueryPlan>,
        results: &mut Vec<BlockRange>,
    ) {
        match self.kind_of(root) {
            NodeKind::Leaf | NodeKind::Internal => {
                if let Some(target) = self.node(root).sender_set().and_then(|s| s.get(item)) {
                    self.push_found(target, item_bytes, range_filter, queue, results);
                }
            }
            NodeKind::Flatten => {
                let Node::Flatten(f) = self.node(root) else {
                    unreachable!("kind_of(root) == Flatten")
                };
                let Some(owners) = f.account_map().and_then(|m| m.nids(item)).cloned() else {
                    return;
                };
                let own_nid = self.node(root).nid();

                for owner in owners {
                    if owner == own_nid {
                        let Node::Flatten(f) = self.node(root) else {
                            unreachable!("kind_of(root) == Flatten")
                        };
                        let leaf_ids: Vec<NodeId> = f
                            .tmp_account_map()
                            .and_then(|m| m.nids(item))
                            .into_iter()
                            .flatten()
                            .copied()
                            .collect();
                        for leaf_id in leaf_ids {
                            self.push_found(leaf_id, item_bytes, range_filter, queue, results);
                        }
                    } else {
                        self.push_found(owner, item_bytes, range_filter, queue, results);
                    }
                }
            }
            NodeKind::Root => unreachable!("a Root node never sits in the construction queue"),
        }
    }

    /// Dispatches a node-id resolved from a CSCR lookup (or, for a
    /// still-pending subtree, directly from a `sender_set`/`account_map`):
    /// a leaf is a hit, a flatten node is probed via its flatten-local CSCR,
    /// and anything else has its left child re-enqueued for a fresh
    /// Bloom/CSCR pass — mirroring the spec's "t &lt;= L.id" resolution
    /// rule rather than trusting `found_id` to already be a leaf.
    fn push_found(
        &mut self,
        found_id: NodeId,
        item_bytes: &[u8],
        range_filter: Option<BlockRange>,
        queue: &mut VecDeque<QueryPlan>,
        results: &mut Vec<BlockRange>,
    ) {
        if range_filter.is_some_and(|r| !self.range_of(found_id).intersects(&r)) {
            return;
        }

        match self.kind_of(found_id) {
            NodeKind::Leaf => results.push(self.range_of(found_id)),
            NodeKind::Flatten => {
                results.extend(self.search_flatten_cscr(found_id, item_bytes, range_filter));
            }
            NodeKind::Internal | NodeKind::Root => {
                if let Some(left) = self.left_child_of(found_id) {
                    queue.push_back(QueryPlan::new(left, Some(found_id), false, false));
                }
            }
        }
    }

    /// Descends from `from` (an internal node whose CSCR named `target`) to
    /// find the node with that id, either via the node-id index (an O(1)
    /// arena lookup) or, when disabled, a bounded BFS over the subtree the
    /// `t <= L.id` invariant guarantees `target` lives in.
    fn find_node_by_id(&self, from: NodeId, target: NodeId) -> Option<NodeId> {
        let sibling = self.sibling_of(from)?;
        if from < target && sibling < target {
            return None;
        }

        if self.config.use_node_index {
            return (target >= 1 && (target as usize) <= self.nodes.len()).then_some(target);
        }

        let start = if target <= from { from } else { sibling };
        let mut queue = VecDeque::new();
        queue.push_back(start);

        while let Some(id) = queue.pop_front() {
            if id == target {
                return Some(id);
            }
            match self.kind_of(id) {
                NodeKind::Internal => {
                    if let Some(l) = self.left_child_of(id) {
                        queue.push_back(l);
                    }
                    if let Some(r) = self.right_child_of(id) {
                        queue.push_back(r);
                    }
                }
                NodeKind::Leaf | NodeKind::Flatten | NodeKind::Root => {}
            }
        }

        None
    }

    fn bfs(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let Some(root) = self.root else {
            return out;
        };

        let mut queue = VecDeque::new();
        queue.push_back(root);

        while let Some(id) = queue.pop_front() {
            out.push(id);
            if matches!(self.kind_of(id), NodeKind::Root | NodeKind::Internal) {
                if let Some(l) = self.left_child_of(id) {
                    queue.push_back(l);
                }
                if let Some(r) = self.right_child_of(id) {
                    queue.push_back(r);
                }
            }
        }

        out
    }

    /// Total size, in bits, of every Bloom filter and CSCR in the tree.
    /// Shared structures are only counted once even though both siblings
    /// hold a reference to them.
    #[must_use]
    pub fn bit_size(&self) -> usize {
        let mut total = 0;
        for id in self.bfs() {
            if matches!(self.kind_of(id), NodeKind::Internal | NodeKind::Leaf | NodeKind::Flatten) {
                total += self.node(id).bloom_filter().bit_len();
                total += self.node(id).cscr().bit_size();
            }
        }
        total / 2
    }

    /// Mean utilization rate across every sketch-backed CSCR in the tree.
    #[must_use]
    pub fn utilization_rate(&self) -> f64 {
        let mut sum = 0.0;
        let mut denom = 0usize;
        for id in self.bfs() {
            if matches!(self.kind_of(id), NodeKind::Internal | NodeKind::Leaf | NodeKind::Flatten) {
                let rate = self.node(id).cscr().utilization_rate();
                if rate != 0.0 {
                    sum += rate;
                    denom += 1;
                }
            }
        }

        if denom == 0 {
            0.0
        } else {
            (sum / denom as f64 * 100.0).round() / 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(21)
    }

    fn txns_for(accounts: &[&str]) -> Vec<String> {
        accounts
            .iter()
            .enumerate()
            .map(|(i, a)| format!("0x{i},0,{a},receiver"))
            .collect()
    }

    #[test]
    fn two_leaf_tree_finds_its_own_senders() {
        let mut r = rng();
        let config = Config::new().max_level(1);
        let mut tree = CscTree::new(config, &mut r);

        assert!(tree.add_block(1, &txns_for(&["alice", "bob"])).unwrap());
        assert!(!tree.is_full());
        assert!(tree.add_block(2, &txns_for(&["carol"])).unwrap());
        assert!(tree.is_full());

        assert_eq!(tree.get("alice"), vec![BlockRange::single(1)]);
        assert_eq!(tree.get("carol"), vec![BlockRange::single(2)]);
        assert!(tree.get("nobody").is_empty());
    }

    #[test]
    fn two_block_tree_returns_both_on_hot_account() {
        let mut r = rng();
        let config = Config::new().max_level(1);
        let mut tree = CscTree::new(config, &mut r);

        assert!(tree.add_block(1, &txns_for(&["alice"])).unwrap());
        assert!(tree.add_block(2, &txns_for(&["alice"])).unwrap());
        assert!(tree.is_full());

        let mut hits = tree.get("alice");
        hits.sort_by_key(BlockRange::start);
        assert_eq!(hits, vec![BlockRange::single(1), BlockRange::single(2)]);
    }

    #[test]
    fn four_block_tree_resolves_cold_account_to_one_leaf() {
        let mut r = rng();
        let config = Config::new().max_level(2).sketch_level(0);
        let mut tree = CscTree::new(config, &mut r);

        assert!(tree.add_block(1, &txns_for(&["alice"])).unwrap());
        assert!(tree.add_block(2, &txns_for(&["bob"])).unwrap());
        assert!(tree.add_block(3, &txns_for(&["carol"])).unwrap());
        assert!(tree.add_block(4, &txns_for(&["dave"])).unwrap());
        assert!(tree.is_full());

        assert_eq!(tree.get("carol"), vec![BlockRange::single(3)]);
        assert!(tree.get("nobody").is_empty());
    }

    #[test]
    fn tree_rejects_further_adds_once_full() {
        let mut r = rng();
        let config = Config::new().max_level(1);
        let mut tree = CscTree::new(config, &mut r);

        assert!(tree.add_block(1, &txns_for(&["alice"])).unwrap());
        assert!(tree.add_block(2, &txns_for(&["bob"])).unwrap());
        assert!(!tree.add_block(3, &txns_for(&["carol"])).unwrap());
    }

    #[test]
    fn malformed_transaction_is_rejected_without_mutating_tree() {
        let mut r = rng();
        let config = Config::new().max_level(2);
        let mut tree = CscTree::new(config, &mut r);

        let bad = vec!["not,enough".to_string()];
        assert!(tree.add_block(1, &bad).is_err());
        assert!(tree.is_empty());
    }

    #[test]
    fn flatten_mode_groups_bottom_leaves() {
        let mut r = rng();
        let config = Config::new().max_level(1).use_flatten(true).leaf_num(4);
        let mut tree = CscTree::new(config, &mut r);

        // First flatten group of four leaves.
        assert!(tree.add_block(1, &txns_for(&["alice"])).unwrap());
        assert!(tree.add_block(2, &txns_for(&["bob"])).unwrap());
        assert!(tree.add_block(3, &txns_for(&["alice"])).unwrap());
        assert!(tree.add_block(4, &txns_for(&["dave"])).unwrap());
        assert!(!tree.is_full());

        // Second flatten group; its sibling pairing with the first
        // promotes the tree straight to its root.
        assert!(tree.add_block(5, &txns_for(&["eve"])).unwrap());
        assert!(tree.add_block(6, &txns_for(&["alice"])).unwrap());
        assert!(tree.add_block(7, &txns_for(&["frank"])).unwrap());
        assert!(tree.add_block(8, &txns_for(&["alice"])).unwrap());
        assert!(tree.is_full());

        let mut hits = tree.get("alice");
        hits.sort_by_key(BlockRange::start);
        assert_eq!(
            hits,
            vec![
                BlockRange::single(1),
                BlockRange::single(3),
                BlockRange::single(6),
                BlockRange::single(8),
            ]
        );

        assert_eq!(tree.get("bob"), vec![BlockRange::single(2)]);
        assert_eq!(tree.get("eve"), vec![BlockRange::single(5)]);
        assert!(tree.get("nobody").is_empty());
    }

    #[test]
    fn not_yet_sealed_tree_finds_its_own_senders() {
        let mut r = rng();
        let config = Config::new().max_level(4);
        let mut tree = CscTree::new(config, &mut r);

        assert!(tree.add_block(1, &txns_for(&["alice"])).unwrap());
        assert!(!tree.is_full());

        assert_eq!(tree.get("alice"), vec![BlockRange::single(1)]);
        assert!(tree.get("nobody").is_empty());

        assert!(tree.add_block(2, &txns_for(&["bob"])).unwrap());
        assert!(!tree.is_full());

        let mut hits = tree.get("alice");
        hits.extend(tree.get("bob"));
        hits.sort_by_key(BlockRange::start);
        assert_eq!(hits, vec![BlockRange::single(1), BlockRange::single(2)]);
    }

    #[test]
    fn range_restricted_query_drops_out_of_range_hits() {
        let mut r = rng();
        let config = Config::new().max_level(2).sketch_level(0);
        let mut tree = CscTree::new(config, &mut r);

        assert!(tree.add_block(1, &txns_for(&["alice"])).unwrap());
        assert!(tree.add_block(2, &txns_for(&["alice"])).unwrap());
        assert!(tree.add_block(3, &txns_for(&["alice"])).unwrap());
        assert!(tree.add_block(4, &txns_for(&["alice"])).unwrap());

        let hits = tree.get_range("alice", BlockRange::new(3, 4));
        for hit in &hits {
            assert!(hit.start() >= 3);
        }
        assert!(!hits.is_empty());
    }
}
