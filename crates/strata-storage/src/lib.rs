//! Storage engine for Strata.
//!
//! This crate provides:
//! - Disk manager for page-level file I/O
//! - The header page describing the data file
//! - Page manager with the free list and staged, logged mutations
//! - Page-based B+ tree with range cursors and a bulk loader

pub mod btree;
mod disk;
mod header;
mod pager;

pub use btree::{BTree, InternalNode, LeafNode, Node, RangeCursor};
pub use disk::DiskManager;
pub use header::{DatabaseHeader, DB_MAGIC, FORMAT_VERSION};
pub use pager::{PageBatch, PageManager, StagedChanges};
