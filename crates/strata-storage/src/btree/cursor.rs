//! Range cursor over the leaf chain.
//!
//! The cursor holds a decoded copy of one leaf and only takes the tree's
//! read latch while it moves between leaves. Before following a sibling
//! link it checks that the leaf it came from still carries the LSN it was
//! read at; if a writer changed it in the meantime, the cursor descends
//! again from the root just past the last key it returned.

use super::node::{LeafNode, Node};
use super::tree::{find_leaf, BTree};
use bytes::Bytes;
use std::ops::Bound;
use strata_common::{Lsn, PageId, Result, StrataError};

/// Leaf the cursor is reading from.
struct LeafPosition {
    page_id: PageId,
    lsn: Lsn,
    leaf: LeafNode,
    index: usize,
}

/// Iterator over `(key, value)` pairs in ascending key order.
pub struct RangeCursor<'a> {
    tree: &'a BTree,
    lower: Bound<Bytes>,
    upper: Bound<Bytes>,
    position: Option<LeafPosition>,
    /// Last key returned, the restart point after a concurrent change.
    last_key: Option<Bytes>,
    done: bool,
}

impl<'a> RangeCursor<'a> {
    pub(crate) fn new(tree: &'a BTree, lower: Bound<Bytes>, upper: Bound<Bytes>) -> Self {
        Self {
            tree,
            lower,
            upper,
            position: None,
            last_key: None,
            done: false,
        }
    }

    /// Positions the cursor on the first entry after `last_key`, or at
    /// the lower bound if nothing was returned yet.
    fn seek(&self) -> Result<LeafPosition> {
        let from = match &self.last_key {
            Some(key) => Bound::Excluded(key.clone()),
            None => self.lower.clone(),
        };

        let _latch = self.tree.latch.read();
        let pager = self.tree.pager.as_ref();
        let root = pager.header().root_page_id;
        let page_id = match &from {
            Bound::Included(key) | Bound::Excluded(key) => find_leaf(pager, root, key)?.0,
            Bound::Unbounded => leftmost_leaf(self.tree, root)?,
        };
        let (leaf, lsn) = read_leaf(self.tree, page_id)?;

        let index = match &from {
            Bound::Included(key) => leaf.entries.partition_point(|(k, _)| k < key),
            Bound::Excluded(key) => leaf.entries.partition_point(|(k, _)| k <= key),
            Bound::Unbounded => 0,
        };
        Ok(LeafPosition {
            page_id,
            lsn,
            leaf,
            index,
        })
    }

    /// Moves from an exhausted leaf to its right sibling.
    ///
    /// Returns None at the end of the chain, or Some(None) when the leaf
    /// changed and the cursor has to seek again.
    fn step(&self, position: &LeafPosition) -> Result<Option<Option<LeafPosition>>> {
        let Some(next) = position.leaf.next else {
            return Ok(None);
        };

        let _latch = self.tree.latch.read();
        if self.tree.pager.page_lsn(position.page_id)? != position.lsn {
            return Ok(Some(None));
        }
        let (leaf, lsn) = read_leaf(self.tree, next)?;
        Ok(Some(Some(LeafPosition {
            page_id: next,
            lsn,
            leaf,
            index: 0,
        })))
    }

    fn below_upper(&self, key: &Bytes) -> bool {
        match &self.upper {
            Bound::Included(hi) => key <= hi,
            Bound::Excluded(hi) => key < hi,
            Bound::Unbounded => true,
        }
    }

    fn advance(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        loop {
            let position = match self.position.take() {
                Some(position) => position,
                None => self.seek()?,
            };

            if let Some((key, value)) = position.leaf.entries.get(position.index) {
                if !self.below_upper(key) {
                    return Ok(None);
                }
                let entry = (key.clone(), value.clone());
                self.last_key = Some(key.clone());
                self.position = Some(LeafPosition {
                    index: position.index + 1,
                    ..position
                });
                return Ok(Some(entry));
            }

            match self.step(&position)? {
                None => return Ok(None),
                Some(next) => self.position = next,
            }
        }
    }
}

impl Iterator for RangeCursor<'_> {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn leftmost_leaf(tree: &BTree, root: PageId) -> Result<PageId> {
    let mut page_id = root;
    loop {
        match tree.pager.read_node(page_id)? {
            Node::Internal(node) => page_id = node.children[0],
            Node::Leaf(_) => return Ok(page_id),
        }
    }
}

fn read_leaf(tree: &BTree, page_id: PageId) -> Result<(LeafNode, Lsn)> {
    match tree.pager.read_node_with_lsn(page_id)? {
        (Node::Leaf(leaf), lsn) => Ok((leaf, lsn)),
        (Node::Internal(_), _) => Err(StrataError::TreeCorrupted(format!(
            "{} is linked as a leaf but is internal",
            page_id
        ))),
    }
}
