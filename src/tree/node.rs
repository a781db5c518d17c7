// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Node types composing one tree: `Leaf` and `Flatten` at the bottom,
//! `Internal` everywhere above, and a single `Root` at the top. Dispatched
//! through [`NodeOps`] via `enum_dispatch` instead of a boxed trait object,
//! since the query walker calls into every node on the hot path.

use super::account_map::AccountMap;
use crate::block::{AccountSet, BlockRange, NodeId};
use crate::bloom::BloomFilter;
use crate::csc::cscr::Cscr;
use enum_dispatch::enum_dispatch;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Internal,
    Root,
    Flatten,
}

#[enum_dispatch]
pub trait NodeOps {
    fn kind(&self) -> NodeKind;
    fn nid(&self) -> NodeId;
    fn level(&self) -> u32;
    fn range(&self) -> BlockRange;
    fn left_child(&self) -> Option<NodeId>;
    fn right_child(&self) -> Option<NodeId>;
    fn sibling(&self) -> Option<NodeId>;
    fn set_sibling(&mut self, id: NodeId);
    fn is_left_child(&self) -> bool;
    fn set_left_child_flag(&mut self, is_left: bool);
    fn bloom_filter(&self) -> &Arc<BloomFilter>;
    fn set_bloom_filter(&mut self, bf: Arc<BloomFilter>);
    fn cscr(&self) -> &Arc<Cscr>;
    fn set_cscr(&mut self, cscr: Arc<Cscr>);
    fn sender_set(&self) -> Option<&AccountSet>;
    fn sender_set_mut(&mut self) -> Option<&mut AccountSet>;
    fn set_sender_set(&mut self, set: Option<AccountSet>);
}

#[enum_dispatch(NodeOps)]
#[derive(Debug)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
    Root(RootNode),
    Flatten(FlattenNode),
}

fn empty_bloom() -> Arc<BloomFilter> {
    Arc::new(BloomFilter::empty())
}

fn empty_cscr() -> Arc<Cscr> {
    Arc::new(Cscr::new_hash_map())
}

#[derive(Debug)]
pub struct LeafNode {
    pub(super) nid: NodeId,
    pub(super) range: BlockRange,
    pub(super) bloom_filter: Arc<BloomFilter>,
    pub(super) cscr: Arc<Cscr>,
    pub(super) sender_set: Option<AccountSet>,
    pub(super) is_left_child: bool,
    pub(super) sibling: Option<NodeId>,
}

impl LeafNode {
    #[must_use]
    pub fn new(nid: NodeId, range: BlockRange, sender_set: AccountSet) -> Self {
        Self {
            nid,
            range,
            bloom_filter: empty_bloom(),
            cscr: empty_cscr(),
            sender_set: Some(sender_set),
            is_left_child: false,
            sibling: None,
        }
    }
}

impl NodeOps for LeafNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Leaf
    }
    fn nid(&self) -> NodeId {
        self.nid
    }
    /// A leaf always sits at the bottom of the merge tree: `max_level`
    /// counts pairwise merges above this point, not raw block depth.
    fn level(&self) -> u32 {
        0
    }
    fn range(&self) -> BlockRange {
        self.range
    }
    fn left_child(&self) -> Option<NodeId> {
        None
    }
    fn right_child(&self) -> Option<NodeId> {
        None
    }
    fn sibling(&self) -> Option<NodeId> {
        self.sibling
    }
    fn set_sibling(&mut self, id: NodeId) {
        self.sibling = Some(id);
    }
    fn is_left_child(&self) -> bool {
        self.is_left_child
    }
    fn set_left_child_flag(&mut self, is_left: bool) {
        self.is_left_child = is_left;
    }
    fn bloom_filter(&self) -> &Arc<BloomFilter> {
        &self.bloom_filter
    }
    fn set_bloom_filter(&mut self, bf: Arc<BloomFilter>) {
        self.bloom_filter = bf;
    }
    fn cscr(&self) -> &Arc<Cscr> {
        &self.cscr
    }
    fn set_cscr(&mut self, cscr: Arc<Cscr>) {
        self.cscr = cscr;
    }
    fn sender_set(&self) -> Option<&AccountSet> {
        self.sender_set.as_ref()
    }
    fn sender_set_mut(&mut self) -> Option<&mut AccountSet> {
        self.sender_set.as_mut()
    }
    fn set_sender_set(&mut self, set: Option<AccountSet>) {
        self.sender_set = set;
    }
}

#[derive(Debug)]
pub struct InternalNode {
    pub(super) nid: NodeId,
    pub(super) level: u32,
    pub(super) range: BlockRange,
    pub(super) left: NodeId,
    pub(super) right: NodeId,
    pub(super) bloom_filter: Arc<BloomFilter>,
    pub(super) cscr: Arc<Cscr>,
    pub(super) sender_set: Option<AccountSet>,
    pub(super) is_left_child: bool,
    pub(super) sibling: Option<NodeId>,
}

impl InternalNode {
    #[must_use]
    pub fn new(
        nid: NodeId,
        level: u32,
        range: BlockRange,
        left: NodeId,
        right: NodeId,
        sender_set: Option<AccountSet>,
    ) -> Self {
        Self {
            nid,
            level,
            range,
            left,
            right,
            bloom_filter: empty_bloom(),
            cscr: empty_cscr(),
            sender_set,
            is_left_child: false,
            sibling: None,
        }
    }

    /// Converts this node in place into a [`RootNode`], keeping the same
    /// id, level and range.
    #[must_use]
    pub fn into_root(self) -> RootNode {
        RootNode {
            nid: self.nid,
            level: self.level,
            range: self.range,
            left: self.left,
            right: self.right,
        }
    }
}

impl NodeOps for InternalNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Internal
    }
    fn nid(&self) -> NodeId {
        self.nid
    }
    fn level(&self) -> u32 {
        self.level
    }
    fn range(&self) -> BlockRange {
        self.range
    }
    fn left_child(&self) -> Option<NodeId> {
        Some(self.left)
    }
    fn right_child(&self) -> Option<NodeId> {
        Some(self.right)
    }
    fn sibling(&self) -> Option<NodeId> {
        self.sibling
    }
    fn set_sibling(&mut self, id: NodeId) {
        self.sibling = Some(id);
    }
    fn is_left_child(&self) -> bool {
        self.is_left_child
    }
    fn set_left_child_flag(&mut self, is_left: bool) {
        self.is_left_child = is_left;
    }
    fn bloom_filter(&self) -> &Arc<BloomFilter> {
        &self.bloom_filter
    }
    fn set_bloom_filter(&mut self, bf: Arc<BloomFilter>) {
        self.bloom_filter = bf;
    }
    fn cscr(&self) -> &Arc<Cscr> {
        &self.cscr
    }
    fn set_cscr(&mut self, cscr: Arc<Cscr>) {
        self.cscr = cscr;
    }
    fn sender_set(&self) -> Option<&AccountSet> {
        self.sender_set.as_ref()
    }
    fn sender_set_mut(&mut self) -> Option<&mut AccountSet> {
        self.sender_set.as_mut()
    }
    fn set_sender_set(&mut self, set: Option<AccountSet>) {
        self.sender_set = set;
    }
}

/// The single root of a tree. Carries no Bloom filter or CSCR of its own:
/// both of its children received theirs from
/// [`super::Tree::create_root_node`].
#[derive(Debug)]
pub struct RootNode {
    pub(super) nid: NodeId,
    pub(super) level: u32,
    pub(super) range: BlockRange,
    pub(super) left: NodeId,
    pub(super) right: NodeId,
}

impl NodeOps for RootNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Root
    }
    fn nid(&self) -> NodeId {
        self.nid
    }
    fn level(&self) -> u32 {
        self.level
    }
    fn range(&self) -> BlockRange {
        self.range
    }
    fn left_child(&self) -> Option<NodeId> {
        Some(self.left)
    }
    fn right_child(&self) -> Option<NodeId> {
        Some(self.right)
    }
    fn sibling(&self) -> Option<NodeId> {
        None
    }
    fn set_sibling(&mut self, _id: NodeId) {}
    fn is_left_child(&self) -> bool {
        false
    }
    fn set_left_child_flag(&mut self, _is_left: bool) {}
    fn bloom_filter(&self) -> &Arc<BloomFilter> {
        static EMPTY: std::sync::OnceLock<Arc<BloomFilter>> = std::sync::OnceLock::new();
        EMPTY.get_or_init(empty_bloom)
    }
    fn set_bloom_filter(&mut self, _bf: Arc<BloomFilter>) {}
    fn cscr(&self) -> &Arc<Cscr> {
        static EMPTY: std::sync::OnceLock<Arc<Cscr>> = std::sync::OnceLock::new();
        EMPTY.get_or_init(empty_cscr)
    }
    fn set_cscr(&mut self, _cscr: Arc<Cscr>) {}
    fn sender_set(&self) -> Option<&AccountSet> {
        None
    }
    fn sender_set_mut(&mut self) -> Option<&mut AccountSet> {
        None
    }
    fn set_sender_set(&mut self, _set: Option<AccountSet>) {}
}

/// A group of [`leaf_num`](crate::config::Config::leaf_num) leaves collapsed
/// into one bottom-layer node, trading the per-pair Bloom filter/CSCR at
/// every level within the group for one shared `AccountMap` plus a single
/// `flatten_cscr` keyed across the whole group.
#[derive(Debug)]
pub struct FlattenNode {
    pub(super) nid: NodeId,
    pub(super) range: BlockRange,
    pub(super) children: Vec<NodeId>,
    pub(super) bloom_filter: Arc<BloomFilter>,
    pub(super) cscr: Arc<Cscr>,
    pub(super) flatten_cscr: Arc<Cscr>,
    pub(super) account_map: Option<AccountMap>,
    pub(super) tmp_account_map: Option<AccountMap>,
    pub(super) is_left_child: bool,
    pub(super) sibling: Option<NodeId>,
}

impl FlattenNode {
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    #[must_use]
    pub fn flatten_cscr(&self) -> &Arc<Cscr> {
        &self.flatten_cscr
    }

    pub fn set_flatten_cscr(&mut self, cscr: Arc<Cscr>) {
        self.flatten_cscr = cscr;
    }

    #[must_use]
    pub fn account_map(&self) -> Option<&AccountMap> {
        self.account_map.as_ref()
    }

    pub fn account_map_mut(&mut self) -> Option<&mut AccountMap> {
        self.account_map.as_mut()
    }

    #[must_use]
    pub fn tmp_account_map(&self) -> Option<&AccountMap> {
        self.tmp_account_map.as_ref()
    }

    pub fn take_account_maps(&mut self) -> (Option<AccountMap>, Option<AccountMap>) {
        (self.account_map.take(), self.tmp_account_map.take())
    }
}

impl NodeOps for FlattenNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Flatten
    }
    fn nid(&self) -> NodeId {
        self.nid
    }
    /// A flatten group is a base unit of construction just like a leaf:
    /// it sits at the bottom of the merge tree regardless of how many raw
    /// leaves it folded together.
    fn level(&self) -> u32 {
        0
    }
    fn range(&self) -> BlockRange {
        self.range
    }
    fn left_child(&self) -> Option<NodeId> {
        None
    }
    fn right_child(&self) -> Option<NodeId> {
        None
    }
    fn sibling(&self) -> Option<NodeId> {
        self.sibling
    }
    fn set_sibling(&mut self, id: NodeId) {
        self.sibling = Some(id);
    }
    fn is_left_child(&self) -> bool {
        self.is_left_child
    }
    fn set_left_child_flag(&mut self, is_left: bool) {
        self.is_left_child = is_left;
    }
    fn bloom_filter(&self) -> &Arc<BloomFilter> {
        &self.bloom_filter
    }
    fn set_bloom_filter(&mut self, bf: Arc<BloomFilter>) {
        self.bloom_filter = bf;
    }
    fn cscr(&self) -> &Arc<Cscr> {
        &self.cscr
    }
    fn set_cscr(&mut self, cscr: Arc<Cscr>) {
        self.cscr = cscr;
    }
    fn sender_set(&self) -> Option<&AccountSet> {
        None
    }
    fn sender_set_mut(&mut self) -> Option<&mut AccountSet> {
        None
    }
    fn set_sender_set(&mut self, _set: Option<AccountSet>) {}
}

#[must_use]
pub fn new_flatten_node(nid: NodeId, children: Vec<NodeId>, range: BlockRange) -> FlattenNode {
    FlattenNode {
        nid,
        range,
        children,
        bloom_filter: empty_bloom(),
        cscr: empty_cscr(),
        flatten_cscr: empty_cscr(),
        account_map: Some(AccountMap::new()),
        tmp_account_map: Some(AccountMap::new()),
        is_left_child: false,
        sibling: None,
    }
}
