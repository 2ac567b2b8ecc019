//! Page-based B+Tree storage engine.
//!
//! All tree links are page ids resolved through the [`PageManager`]; no
//! node holds an in-memory reference to another. Page layouts:
//!
//! ```text
//! leaf:      [page header | (key_len, val_len, key, value) ...]   link = next leaf
//! internal:  [page header | (key_len, child, key) ...]            link = leftmost child
//! ```
//!
//! Fill bounds for a tree of order `m`:
//! - leaf: at most `m - 1` entries, at least `ceil(m/2) - 1` unless root
//! - internal: at most `m` children, at least `ceil(m/2)` unless root
//!
//! [`PageManager`]: crate::pager::PageManager

pub mod bulk;
pub mod cursor;
pub mod node;
pub mod tree;

pub use cursor::RangeCursor;
pub use node::{InternalNode, LeafNode, Node};
pub use tree::BTree;
