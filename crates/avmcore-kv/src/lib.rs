//! Embedded ordered key-value store for the execution core.
//!
//! The core's storage contract is narrow: named column families over
//! byte-ordered keys, point reads, forward and reverse seeks, atomic
//! read-write transactions, and consistent read snapshots. This crate is the
//! one concrete implementation of that contract — an in-memory store with
//! copy-on-write families, so snapshots are O(1) and a commit publishes all
//! of a transaction's effects in a single swap.
//!
//! Exactly one writer exists by design (the host thread); the store does not
//! detect write-write conflicts.

pub mod column;
pub mod store;

pub use column::Column;
pub use store::{KvStore, ReadView, Snapshot, WriteTx};
