// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A hierarchical probabilistic index over a stream of numbered blocks.
//!
//! ##### About
//!
//! Given a sequence of blocks, each carrying a set of `"hash,blockNumber,
//! sender,receiver"` transaction strings, this crate answers "which blocks
//! did this account send a transaction from" with a bounded false-positive
//! rate and no false negatives.
//!
//! Blocks are folded bottom-up into a *segment tree* (the [`tree::CscTree`]):
//! every pair of sibling nodes shares a Bloom filter over their common
//! ("hot") accounts and a repeated cuckoo sketch (CSCR) over everything else
//! ("cold"). A tree accepts at most `2^max_level` leaves; once full, a
//! [`Forest`] opens a new one and keeps going.
//!
//! Queries walk a tree top-down, trusting a Bloom hit to push both children
//! and falling back to the CSCR — with bounded backtracking on a detected
//! false positive — otherwise.
//!
//! # Example usage
//!
//! ```
//! use csc_tree::{Config, Forest};
//!
//! let mut rng = rand::rng();
//! let mut forest = Forest::new(Config::new().max_level(4), &mut rng);
//!
//! forest.add(0, &["0xaa,0,alice,bob".to_string()])?;
//! forest.add(1, &["0xbb,1,alice,carol".to_string()])?;
//!
//! let hits = forest.get("alice");
//! assert_eq!(hits.len(), 2);
//! # Ok::<(), csc_tree::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

pub mod block;

#[doc(hidden)]
pub mod bloom;

pub mod coding;
mod config;

#[doc(hidden)]
pub mod csc;

pub mod error;
pub mod forest;

#[doc(hidden)]
pub mod hash;

pub mod tree;

pub use {
    block::{BlockRange, NodeId},
    config::{Config, SketchBackend},
    error::{Error, Result},
    forest::Forest,
    tree::CscTree,
};
