// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A multimap from account address to the set of node-ids it was seen under,
//! used only while collapsing a group of leaves into one flatten node.
//!
//! Unlike [`crate::block::AccountSet`], an address here can map to more than
//! one node-id at once: that's exactly the signal used to detect an address
//! that recurs across more than one leaf in the flattened group.

use crate::block::{AccountSet, NodeId};
use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Debug, Clone, Default)]
pub struct AccountMap {
    map: FxHashMap<String, FxHashSet<NodeId>>,
}

impl AccountMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn insert(&mut self, addr: String, node_id: NodeId) {
        self.map.entry(addr).or_default().insert(node_id);
    }

    #[must_use]
    pub fn nids(&self, addr: &str) -> Option<&FxHashSet<NodeId>> {
        self.map.get(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FxHashSet<NodeId>)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Addresses present in both maps.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Vec<String> {
        self.map
            .keys()
            .filter(|k| other.map.contains_key(*k))
            .cloned()
            .collect()
    }

    /// Merges `other` into `self`, unioning the node-id sets of any shared
    /// key.
    #[must_use]
    pub fn union(mut self, other: Self) -> Self {
        for (addr, nids) in other.map {
            self.map.entry(addr).or_default().extend(nids);
        }
        self
    }

    /// Removes and returns the entries keyed by `keys`.
    pub fn batch_get_with_delete(&mut self, keys: &[String]) -> Self {
        let mut extracted = Self::new();
        for key in keys {
            if let Some(nids) = self.map.remove(key) {
                extracted.map.insert(key.clone(), nids);
            }
        }
        extracted
    }

    /// Removes every entry whose node-id set contains `node_id`.
    pub fn remove_entries_owned_by(&mut self, node_id: NodeId) {
        self.map.retain(|_, nids| !nids.contains(&node_id));
    }

    /// Converts a map in which every remaining entry has exactly one
    /// node-id into an [`AccountSet`]. Entries with more than one node-id
    /// are skipped (callers are expected to have already separated those
    /// out via [`Self::intersect`]).
    #[must_use]
    pub fn to_account_set(&self) -> AccountSet {
        let mut set = AccountSet::with_capacity(self.map.len());
        for (addr, nids) in &self.map {
            if let Some(&nid) = nids.iter().next() {
                set.insert(addr.clone(), nid);
            }
        }
        set
    }

    /// Flattens every `(addr, {nid0, nid1, ...})` entry into individual
    /// `(addr, nid)` pairs, for feeding a flatten-local CSCR that maps one
    /// address to potentially several node-ids.
    #[must_use]
    pub fn to_pairs(&self) -> Vec<(String, NodeId)> {
        self.map
            .iter()
            .flat_map(|(addr, nids)| nids.iter().map(move |nid| (addr.clone(), *nid)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn intersect_finds_shared_keys() {
        let mut a = AccountMap::new();
        a.insert("alice".into(), 1);
        a.insert("bob".into(), 1);

        let mut b = AccountMap::new();
        b.insert("bob".into(), 2);
        b.insert("carol".into(), 2);

        assert_eq!(a.intersect(&b), vec!["bob".to_string()]);
    }

    #[test]
    fn union_merges_nid_sets() {
        let mut a = AccountMap::new();
        a.insert("alice".into(), 1);

        let mut b = AccountMap::new();
        b.insert("alice".into(), 2);

        let merged = a.union(b);
        assert_eq!(merged.nids("alice").unwrap().len(), 2);
    }

    #[test]
    fn to_account_set_takes_single_nid_entries() {
        let mut a = AccountMap::new();
        a.insert("alice".into(), 7);

        let set = a.to_account_set();
        assert_eq!(set.get("alice"), Some(7));
    }

    #[test]
    fn batch_get_with_delete_removes_keys() {
        let mut a = AccountMap::new();
        a.insert("alice".into(), 1);
        a.insert("bob".into(), 1);

        let extracted = a.batch_get_with_delete(&["alice".to_string()]);
        assert_eq!(extracted.len(), 1);
        assert_eq!(a.len(), 1);
        assert!(a.nids("alice").is_none());
    }
}
