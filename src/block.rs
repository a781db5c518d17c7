// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Block ranges and the per-block account set extracted from a block's raw
//! transaction strings.
//!
//! Decoding an actual block file is out of scope here; the only input this
//! module accepts is the already-decoded `blockNumber` and list of
//! transaction strings an external collaborator hands us.

use crate::coding::DecodeError;
use rustc_hash::FxHashMap;

/// A tree or node's identity within its tree, assigned monotonically during
/// construction.
pub type NodeId = u32;

/// A closed, inclusive range of block numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRange {
    start: u64,
    end: u64,
}

impl BlockRange {
    /// Creates a range covering a single block.
    #[must_use]
    pub fn single(block_number: u64) -> Self {
        Self {
            start: block_number,
            end: block_number,
        }
    }

    /// Creates a range `[start, end]`.
    ///
    /// # Panics
    ///
    /// Panics if `start > end`.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        assert!(start <= end, "block range start must not exceed end");
        Self { start, end }
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of blocks covered by this range.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Whether `self` and `other` overlap.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    /// Merges `self` with `other` if they are adjacent (`self.end + 1 ==
    /// other.start`), returning the combined range. Returns `None`
    /// otherwise.
    #[must_use]
    pub fn merge_adjacent(&self, other: &Self) -> Option<Self> {
        if self.end + 1 == other.start {
            Some(Self::new(self.start, other.end))
        } else {
            None
        }
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.start, self.end)
    }
}

/// A single sender-account occurrence, resolved after strict parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedTransaction<'a> {
    sender: &'a str,
    receiver: &'a str,
}

/// Parses one `"hash,blockNumber,sender,receiver"` string.
///
/// Rejects the string wholesale if it has fewer than four comma-separated
/// fields, rather than silently indexing into whatever fields happen to be
/// present.
fn parse_transaction(raw: &str) -> Result<ParsedTransaction<'_>, DecodeError> {
    let mut fields = raw.splitn(4, ',');

    let _hash = fields.next();
    let _block_number = fields.next();
    let sender = fields.next();
    let receiver = fields.next();

    match (sender, receiver) {
        (Some(sender), Some(receiver)) => Ok(ParsedTransaction { sender, receiver }),
        _ => Err(DecodeError::MalformedTransaction { raw: raw.into() }),
    }
}

/// A mapping from account address to the single node-id it currently lives
/// in. Used to track "cold" (not-yet-promoted) accounts at a tree node
/// during construction.
#[derive(Debug, Clone, Default)]
pub struct AccountSet {
    accounts: FxHashMap<String, NodeId>,
}

impl AccountSet {
    #[must_use]
    pub fn with_capacity(n: usize) -> Self {
        Self {
            accounts: FxHashMap::with_capacity_and_hasher(n, Default::default()),
        }
    }

    /// Extracts every sender address out of a block's raw transactions,
    /// all associated with `node_id`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::MalformedTransaction`] and leaves no partial
    /// state behind if any transaction string has fewer than four fields.
    pub fn from_block(txns: &[String], node_id: NodeId) -> Result<Self, DecodeError> {
        let mut set = Self::with_capacity(txns.len());

        for txn in txns {
            let parsed = parse_transaction(txn)?;
            set.accounts.insert(parsed.sender.to_owned(), node_id);
        }

        Ok(set)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Associates `account` with `node_id`, overwriting any prior owner.
    pub fn insert(&mut self, account: String, node_id: NodeId) {
        self.accounts.insert(account, node_id);
    }

    #[must_use]
    pub fn get(&self, account: &str) -> Option<NodeId> {
        self.accounts.get(account).copied()
    }

    /// Removes `account`, returning its owning node-id if it was present.
    pub fn remove(&mut self, account: &str) -> Option<NodeId> {
        self.accounts.remove(account)
    }

    /// Addresses present in both `self` and `other`.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Vec<String> {
        self.accounts
            .keys()
            .filter(|k| other.accounts.contains_key(*k))
            .cloned()
            .collect()
    }

    /// Union of `self` and `other`. On a key collision the value from
    /// `other` wins.
    #[must_use]
    pub fn union(mut self, other: Self) -> Self {
        self.accounts.extend(other.accounts);
        self
    }

    /// Removes and returns the entries keyed by `keys`, mapped to their
    /// stored node-ids.
    pub fn bulk_extract(&mut self, keys: &[String]) -> FxHashMap<String, NodeId> {
        let mut extracted = FxHashMap::with_capacity_and_hasher(keys.len(), Default::default());

        for key in keys {
            if let Some(node_id) = self.accounts.remove(key) {
                extracted.insert(key.clone(), node_id);
            }
        }

        extracted
    }

    /// Removes accounts whose stored node-id equals `node_id`, returning
    /// them.
    pub fn extract_owned_by(&mut self, node_id: NodeId) -> FxHashMap<String, NodeId> {
        let owned: Vec<String> = self
            .accounts
            .iter()
            .filter(|(_, v)| **v == node_id)
            .map(|(k, _)| k.clone())
            .collect();

        self.bulk_extract(&owned)
    }

    /// Iterates over every `(account, owning node-id)` pair.
    pub fn iter(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.accounts.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Extracts the receiver out of one transaction string, without the
    /// strict sender-count validation `from_block` performs (used only by
    /// the small set of callers that need the receiver side).
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::MalformedTransaction`] if `raw` has fewer
    /// than four comma-separated fields.
    pub fn receiver_of(raw: &str) -> Result<String, DecodeError> {
        parse_transaction(raw).map(|t| t.receiver.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn block_range_size_and_intersect() {
        let a = BlockRange::new(1, 4);
        let b = BlockRange::new(3, 6);
        let c = BlockRange::new(5, 8);

        assert_eq!(a.size(), 4);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn block_range_merge_adjacent() {
        let a = BlockRange::new(1, 4);
        let b = BlockRange::new(5, 8);
        let c = BlockRange::new(6, 8);

        assert_eq!(a.merge_adjacent(&b), Some(BlockRange::new(1, 8)));
        assert_eq!(a.merge_adjacent(&c), None);
    }

    #[test]
    fn account_set_extracts_senders() {
        let txns = vec![
            "0x1,10,alice,bob".to_string(),
            "0x2,10,carol,alice".to_string(),
        ];

        let set = AccountSet::from_block(&txns, 7).expect("should parse");
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("alice"), Some(7));
        assert_eq!(set.get("carol"), Some(7));
        assert_eq!(set.get("bob"), None);
    }

    #[test]
    fn malformed_transaction_is_rejected() {
        let txns = vec!["0x1,10,alice".to_string()];
        let err = AccountSet::from_block(&txns, 0).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedTransaction { .. }));
    }

    #[test]
    fn malformed_transaction_leaves_no_partial_state() {
        let txns = vec![
            "0x1,10,alice,bob".to_string(),
            "not-a-transaction".to_string(),
        ];

        assert!(AccountSet::from_block(&txns, 0).is_err());
    }

    #[test]
    fn intersect_and_union() {
        let mut a = AccountSet::with_capacity(2);
        a.insert("alice".into(), 1);
        a.insert("bob".into(), 1);

        let mut b = AccountSet::with_capacity(2);
        b.insert("bob".into(), 2);
        b.insert("carol".into(), 2);

        let mut intersection = a.intersect(&b);
        intersection.sort();
        assert_eq!(intersection, vec!["bob".to_string()]);

        let union = a.union(b);
        assert_eq!(union.get("bob"), Some(2));
        assert_eq!(union.len(), 3);
    }

    #[test]
    fn bulk_extract_removes_entries() {
        let mut a = AccountSet::with_capacity(3);
        a.insert("alice".into(), 1);
        a.insert("bob".into(), 1);
        a.insert("carol".into(), 1);

        let extracted = a.bulk_extract(&["alice".into(), "bob".into()]);
        assert_eq!(extracted.len(), 2);
        assert_eq!(a.len(), 1);
        assert!(a.get("alice").is_none());
    }
}
