//! Page-based B+Tree over the page manager.
//!
//! Nodes reference each other by page id only. Mutations are serialized by
//! a tree latch; each one runs against a staged [`PageBatch`], is logged as
//! a single record carrying the after-images of every page it touched plus
//! a logical undo, and is then installed. Readers take the latch shared.

use super::cursor::RangeCursor;
use super::node::{InternalNode, LeafNode, Node};
use crate::pager::{PageBatch, PageManager};
use bytes::Bytes;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::ops::Bound;
use std::sync::Arc;
use strata_common::{Lsn, PageId, Result, StorageConfig, StrataError, TxnId};
use strata_wal::{LogOp, LogRecord, PageImage, UndoPayload, WalWriter};
use tracing::trace;

/// Anything tree pages can be read from: the installed state or a batch.
pub(crate) trait NodeSource {
    fn node(&self, page_id: PageId) -> Result<Node>;
}

impl NodeSource for PageManager {
    fn node(&self, page_id: PageId) -> Result<Node> {
        self.read_node(page_id)
    }
}

impl NodeSource for PageBatch<'_> {
    fn node(&self, page_id: PageId) -> Result<Node> {
        self.read_node(page_id)
    }
}

/// Result of inserting into a subtree: the replaced value and an optional
/// split (separator, new right sibling) for the parent to absorb.
type InsertOutcome = (Option<Bytes>, Option<(Bytes, PageId)>);

/// B+Tree keyed by byte-lexicographic order.
pub struct BTree {
    /// Page access.
    pub(crate) pager: Arc<PageManager>,
    /// Log the mutations are recorded in.
    pub(crate) wal: Arc<WalWriter>,
    /// Serializes writers against each other and against readers.
    pub(crate) latch: RwLock<()>,
    /// Maximum children per internal node.
    pub(crate) order: usize,
    /// Key length limit.
    max_key_size: usize,
    /// Value length limit.
    max_value_size: usize,
}

impl BTree {
    /// Creates a tree over an opened page manager.
    ///
    /// The fanout is the one recorded in the file header.
    pub fn new(pager: Arc<PageManager>, wal: Arc<WalWriter>, config: &StorageConfig) -> Self {
        let order = pager.header().order as usize;
        Self {
            pager,
            wal,
            latch: RwLock::new(()),
            order,
            max_key_size: config.max_key_size,
            max_value_size: config.max_value_size,
        }
    }

    /// Returns the page manager.
    pub fn pager(&self) -> &Arc<PageManager> {
        &self.pager
    }

    /// Returns the log.
    pub fn wal(&self) -> &Arc<WalWriter> {
        &self.wal
    }

    /// Returns the fanout.
    pub fn order(&self) -> usize {
        self.order
    }

    /// Returns the number of key-value pairs.
    pub fn len(&self) -> u64 {
        self.pager.header().entry_count
    }

    /// Returns true if the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of levels (1 = the root is a leaf).
    pub fn height(&self) -> usize {
        self.pager.header().tree_height as usize
    }

    /// Maximum entries in a leaf.
    pub(crate) fn max_leaf(&self) -> usize {
        self.order - 1
    }

    /// Minimum fill of a non-root node, in entries (leaf) or children (internal).
    pub(crate) fn min_fill(&self, node: &Node) -> usize {
        let min_children = self.order.div_ceil(2);
        match node {
            Node::Leaf(_) => min_children - 1,
            Node::Internal(_) => min_children,
        }
    }

    fn is_underfull(&self, node: &Node) -> bool {
        node.fill() < self.min_fill(node)
    }

    /// Checks key length limits.
    pub fn validate_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(StrataError::EmptyKey);
        }
        if key.len() > self.max_key_size {
            return Err(StrataError::KeyTooLarge {
                size: key.len(),
                max: self.max_key_size,
            });
        }
        Ok(())
    }

    /// Checks value length limits.
    pub fn validate_value(&self, value: &[u8]) -> Result<()> {
        if value.len() > self.max_value_size {
            return Err(StrataError::ValueTooLarge {
                size: value.len(),
                max: self.max_value_size,
            });
        }
        Ok(())
    }

    /// Runs one logged mutation. The caller holds the write latch.
    ///
    /// `f` stages the change and returns its result plus the undo payload.
    /// Nothing is logged when the batch ends up empty. Returns the record's
    /// LSN alongside the result.
    pub(crate) fn mutate<R>(
        &self,
        _latch: &RwLockWriteGuard<'_, ()>,
        txn_id: TxnId,
        op: LogOp,
        f: impl FnOnce(&mut PageBatch<'_>) -> Result<(R, Bytes)>,
    ) -> Result<(R, Option<Lsn>)> {
        let mut batch = self.pager.batch();
        let (out, undo) = f(&mut batch)?;
        let changes = batch.finish();
        if changes.is_empty() {
            return Ok((out, None));
        }

        let record = LogRecord::new(
            txn_id,
            op,
            changes.primary_page(),
            PageImage::encode_all(changes.images()),
            undo,
        );
        let lsn = self.wal.append(record)?;
        let pages = changes.images().len();
        self.pager.install(changes, lsn)?;
        trace!(txn_id = %txn_id, op = ?op, lsn = %lsn, pages, "Applied tree mutation");
        Ok((out, Some(lsn)))
    }

    /// Runs `f` while no mutation is in flight.
    ///
    /// Holds the write latch, so every logged change is installed before
    /// `f` starts and none begins until it returns. `f` must not call back
    /// into the tree.
    pub fn with_writes_paused<R>(&self, f: impl FnOnce() -> R) -> R {
        let _latch = self.latch.write();
        f()
    }

    /// Looks up a key.
    pub fn search(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let _latch = self.latch.read();
        search_in(self.pager.as_ref(), self.pager.header().root_page_id, key)
    }

    /// Inserts a key-value pair on behalf of `txn_id`.
    ///
    /// With `upsert`, an existing key is overwritten and its prior value
    /// returned; otherwise an existing key fails with `DuplicateKey`.
    pub fn insert(
        &self,
        txn_id: TxnId,
        key: Bytes,
        value: Bytes,
        upsert: bool,
    ) -> Result<Option<Bytes>> {
        self.validate_key(&key)?;
        self.validate_value(&value)?;

        let latch = self.latch.write();
        // Upserts that replace are logged as updates; the op is only known
        // after the descent, so peek first.
        let exists = search_in(self.pager.as_ref(), self.pager.header().root_page_id, &key)?;
        if exists.is_some() && !upsert {
            return Err(StrataError::DuplicateKey);
        }
        let op = if exists.is_some() {
            LogOp::Update
        } else {
            LogOp::Insert
        };

        let (prior, _) = self.mutate(&latch, txn_id, op, |batch| {
            let prior = self.insert_in_batch(batch, key.clone(), value, upsert)?;
            let undo = UndoPayload {
                key: key.clone(),
                prior: prior.clone(),
            };
            Ok((prior, undo.serialize()))
        })?;
        Ok(prior)
    }

    /// Removes a key on behalf of `txn_id`, returning its value.
    pub fn delete(&self, txn_id: TxnId, key: &[u8]) -> Result<Bytes> {
        self.validate_key(key)?;
        let latch = self.latch.write();
        let (removed, _) = self.mutate(&latch, txn_id, LogOp::Delete, |batch| {
            let removed = self.delete_in_batch(batch, key)?;
            let undo = UndoPayload {
                key: Bytes::copy_from_slice(key),
                prior: Some(removed.clone()),
            };
            Ok((removed, undo.serialize()))
        })?;
        Ok(removed)
    }

    /// Sets `key` back to `prior` (absent when `None`), logged as a
    /// compensation record.
    ///
    /// Restoring an already restored key changes nothing and logs nothing.
    /// Returns true if the tree changed.
    pub fn restore(&self, txn_id: TxnId, key: Bytes, prior: Option<Bytes>) -> Result<bool> {
        let latch = self.latch.write();
        let (changed, _) = self.mutate(&latch, txn_id, LogOp::Compensation, |batch| {
            let root = batch.header().root_page_id;
            let current = search_in(&*batch, root, &key)?;
            let changed = match (current, prior) {
                (None, None) => false,
                (Some(current), Some(prior)) if current == prior => false,
                (_, Some(prior)) => {
                    self.insert_in_batch(batch, key.clone(), prior, true)?;
                    true
                }
                (Some(_), None) => {
                    self.delete_in_batch(batch, &key)?;
                    true
                }
            };
            Ok((changed, Bytes::new()))
        })?;
        Ok(changed)
    }

    /// Returns a cursor over `[lo, hi)`.
    pub fn range_scan(&self, lo: Bytes, hi: Bytes) -> RangeCursor<'_> {
        self.range(Bound::Included(lo), Bound::Excluded(hi))
    }

    /// Returns a cursor over keys within the given bounds.
    pub fn range(&self, lower: Bound<Bytes>, upper: Bound<Bytes>) -> RangeCursor<'_> {
        RangeCursor::new(self, lower, upper)
    }

    /// Returns a cursor over every entry.
    pub fn iter(&self) -> RangeCursor<'_> {
        self.range(Bound::Unbounded, Bound::Unbounded)
    }

    /// Returns the smallest key.
    pub fn first_key(&self) -> Result<Option<Bytes>> {
        self.iter().next().transpose().map(|e| e.map(|(k, _)| k))
    }

    /// Returns the largest key.
    pub fn last_key(&self) -> Result<Option<Bytes>> {
        let _latch = self.latch.read();
        let mut page_id = self.pager.header().root_page_id;
        loop {
            match self.pager.read_node(page_id)? {
                Node::Internal(node) => {
                    page_id = *node.children.last().ok_or_else(|| {
                        StrataError::TreeCorrupted(format!("{} has no children", page_id))
                    })?;
                }
                Node::Leaf(leaf) => return Ok(leaf.entries.last().map(|(k, _)| k.clone())),
            }
        }
    }

    /// Inserts within a batch, growing a new root on root split.
    pub(crate) fn insert_in_batch(
        &self,
        batch: &mut PageBatch<'_>,
        key: Bytes,
        value: Bytes,
        upsert: bool,
    ) -> Result<Option<Bytes>> {
        let root = batch.header().root_page_id;
        let (prior, split) = self.insert_into(batch, root, &key, value, upsert)?;

        if let Some((separator, right)) = split {
            let new_root = batch.allocate()?;
            let node = Node::Internal(InternalNode {
                keys: vec![separator],
                children: vec![root, right],
            });
            batch.write_node(new_root, &node)?;
            let header = batch.header_mut();
            header.root_page_id = new_root;
            header.tree_height += 1;
        }
        if prior.is_none() {
            batch.header_mut().entry_count += 1;
        }
        Ok(prior)
    }

    fn insert_into(
        &self,
        batch: &mut PageBatch<'_>,
        page_id: PageId,
        key: &Bytes,
        value: Bytes,
        upsert: bool,
    ) -> Result<InsertOutcome> {
        match batch.read_node(page_id)? {
            Node::Leaf(mut leaf) => {
                let prior = match leaf.search(key) {
                    Ok(i) if upsert => Some(std::mem::replace(&mut leaf.entries[i].1, value)),
                    Ok(_) => return Err(StrataError::DuplicateKey),
                    Err(i) => {
                        leaf.entries.insert(i, (key.clone(), value));
                        None
                    }
                };

                if leaf.entries.len() <= self.max_leaf() {
                    batch.write_node(page_id, &Node::Leaf(leaf))?;
                    return Ok((prior, None));
                }

                // Split at the median; the right half's first key moves up.
                let right_entries = leaf.entries.split_off(leaf.entries.len() / 2);
                let right_id = batch.allocate()?;
                let right = LeafNode {
                    entries: right_entries,
                    next: leaf.next,
                };
                leaf.next = Some(right_id);
                let separator = right.entries[0].0.clone();
                batch.write_node(page_id, &Node::Leaf(leaf))?;
                batch.write_node(right_id, &Node::Leaf(right))?;
                Ok((prior, Some((separator, right_id))))
            }
            Node::Internal(mut node) => {
                let idx = node.child_index(key);
                let (prior, split) = self.insert_into(batch, node.children[idx], key, value, upsert)?;
                let Some((separator, right_child)) = split else {
                    return Ok((prior, None));
                };

                node.keys.insert(idx, separator);
                node.children.insert(idx + 1, right_child);
                if node.children.len() <= self.order {
                    batch.write_node(page_id, &Node::Internal(node))?;
                    return Ok((prior, None));
                }

                // The median key moves up and belongs to neither half.
                let mid = node.keys.len() / 2;
                let right_keys = node.keys.split_off(mid + 1);
                let separator = node.keys.pop().ok_or_else(|| {
                    StrataError::TreeCorrupted(format!("split of {} lost its median", page_id))
                })?;
                let right_children = node.children.split_off(mid + 1);
                let right_id = batch.allocate()?;
                batch.write_node(page_id, &Node::Internal(node))?;
                batch.write_node(
                    right_id,
                    &Node::Internal(InternalNode {
                        keys: right_keys,
                        children: right_children,
                    }),
                )?;
                Ok((prior, Some((separator, right_id))))
            }
        }
    }

    /// Deletes within a batch, collapsing the root when it is left with one child.
    pub(crate) fn delete_in_batch(&self, batch: &mut PageBatch<'_>, key: &[u8]) -> Result<Bytes> {
        let root = batch.header().root_page_id;
        let removed = self.delete_from(batch, root, key)?;

        if let Node::Internal(node) = batch.read_node(root)? {
            if node.children.len() == 1 {
                batch.free(root)?;
                let header = batch.header_mut();
                header.root_page_id = node.children[0];
                header.tree_height -= 1;
            }
        }
        let header = batch.header_mut();
        header.entry_count = header.entry_count.saturating_sub(1);
        Ok(removed)
    }

    fn delete_from(&self, batch: &mut PageBatch<'_>, page_id: PageId, key: &[u8]) -> Result<Bytes> {
        match batch.read_node(page_id)? {
            Node::Leaf(mut leaf) => {
                let idx = leaf.search(key).map_err(|_| StrataError::NotFound)?;
                let (_, value) = leaf.entries.remove(idx);
                batch.write_node(page_id, &Node::Leaf(leaf))?;
                Ok(value)
            }
            Node::Internal(mut node) => {
                let idx = node.child_index(key);
                let removed = self.delete_from(batch, node.children[idx], key)?;
                let child = batch.read_node(node.children[idx])?;
                if self.is_underfull(&child) {
                    self.rebalance(batch, &mut node, idx, child)?;
                    batch.write_node(page_id, &Node::Internal(node))?;
                }
                Ok(removed)
            }
        }
    }

    /// Restores the minimum fill of `parent.children[idx]`.
    ///
    /// Borrows from the left sibling first, then the right; merges when
    /// neither can spare an entry.
    fn rebalance(
        &self,
        batch: &mut PageBatch<'_>,
        parent: &mut InternalNode,
        idx: usize,
        child: Node,
    ) -> Result<()> {
        let child_id = parent.children[idx];

        let left = if idx > 0 {
            let left_id = parent.children[idx - 1];
            let left = batch.read_node(left_id)?;
            if left.fill() > self.min_fill(&left) {
                let (left, child) = borrow_from_left(left, child, &mut parent.keys[idx - 1])?;
                batch.write_node(left_id, &left)?;
                batch.write_node(child_id, &child)?;
                return Ok(());
            }
            Some(left)
        } else {
            None
        };

        if idx + 1 < parent.children.len() {
            let right_id = parent.children[idx + 1];
            let right = batch.read_node(right_id)?;
            if right.fill() > self.min_fill(&right) {
                let (child, right) = borrow_from_right(child, right, &mut parent.keys[idx])?;
                batch.write_node(child_id, &child)?;
                batch.write_node(right_id, &right)?;
                return Ok(());
            }
            if left.is_none() {
                return self.merge(batch, parent, idx, child, right);
            }
        }

        match left {
            Some(left) => self.merge(batch, parent, idx - 1, left, child),
            None => Err(StrataError::TreeCorrupted(format!(
                "{} has no sibling to rebalance with",
                child_id
            ))),
        }
    }

    /// Merges `parent.children[left_idx + 1]` into `parent.children[left_idx]`.
    fn merge(
        &self,
        batch: &mut PageBatch<'_>,
        parent: &mut InternalNode,
        left_idx: usize,
        left: Node,
        right: Node,
    ) -> Result<()> {
        let left_id = parent.children[left_idx];
        let right_id = parent.children[left_idx + 1];
        let separator = parent.keys.remove(left_idx);
        parent.children.remove(left_idx + 1);

        let merged = match (left, right) {
            (Node::Leaf(mut left), Node::Leaf(right)) => {
                left.entries.extend(right.entries);
                left.next = right.next;
                Node::Leaf(left)
            }
            (Node::Internal(mut left), Node::Internal(right)) => {
                left.keys.push(separator);
                left.keys.extend(right.keys);
                left.children.extend(right.children);
                Node::Internal(left)
            }
            _ => return Err(mismatched_siblings(left_id, right_id)),
        };
        batch.write_node(left_id, &merged)?;
        batch.free(right_id)
    }

    /// Verifies ordering, fill bounds, equal leaf depth, the sibling chain,
    /// and the stored entry count.
    pub fn check_invariants(&self) -> Result<()> {
        let _latch = self.latch.read();
        let header = self.pager.header();
        let mut walk = InvariantWalk::default();
        self.check_node(header.root_page_id, 1, None, None, true, &mut walk)?;

        if walk.leaf_depth != Some(header.tree_height as usize) {
            return Err(StrataError::TreeCorrupted(format!(
                "leaf depth {:?} but header height {}",
                walk.leaf_depth, header.tree_height
            )));
        }
        if walk.entries != header.entry_count {
            return Err(StrataError::TreeCorrupted(format!(
                "{} entries found, header says {}",
                walk.entries, header.entry_count
            )));
        }

        // The sibling chain visits the same leaves in the same order.
        let mut chained = Vec::with_capacity(walk.leaves.len());
        let mut next = walk.leaves.first().copied();
        let mut last_key: Option<Bytes> = None;
        while let Some(page_id) = next {
            if chained.len() > walk.leaves.len() {
                return Err(StrataError::TreeCorrupted("leaf chain has a cycle".to_string()));
            }
            let Node::Leaf(leaf) = self.pager.read_node(page_id)? else {
                return Err(StrataError::TreeCorrupted(format!("{} in leaf chain is internal", page_id)));
            };
            if let (Some(last), Some((first, _))) = (&last_key, leaf.entries.first()) {
                if first <= last {
                    return Err(StrataError::TreeCorrupted(format!(
                        "leaf chain out of order at {}",
                        page_id
                    )));
                }
            }
            if let Some((k, _)) = leaf.entries.last() {
                last_key = Some(k.clone());
            }
            chained.push(page_id);
            next = leaf.next;
        }
        if chained != walk.leaves {
            return Err(StrataError::TreeCorrupted("leaf chain does not match tree order".to_string()));
        }
        Ok(())
    }

    fn check_node(
        &self,
        page_id: PageId,
        depth: usize,
        lower: Option<&Bytes>,
        upper: Option<&Bytes>,
        is_root: bool,
        walk: &mut InvariantWalk,
    ) -> Result<()> {
        let node = self.pager.read_node(page_id)?;
        let corrupt = |what: String| StrataError::TreeCorrupted(format!("{}: {}", page_id, what));

        if !is_root && self.is_underfull(&node) {
            return Err(corrupt(format!("underfull with {}", node.fill())));
        }
        let in_bounds = |k: &Bytes| lower.is_none_or(|l| k >= l) && upper.is_none_or(|u| k < u);

        match node {
            Node::Leaf(leaf) => {
                if leaf.entries.len() > self.max_leaf() {
                    return Err(corrupt(format!("overfull with {}", leaf.entries.len())));
                }
                if !leaf.entries.windows(2).all(|w| w[0].0 < w[1].0) {
                    return Err(corrupt("keys not strictly ascending".to_string()));
                }
                if !leaf.entries.iter().all(|(k, _)| in_bounds(k)) {
                    return Err(corrupt("key outside parent range".to_string()));
                }
                match walk.leaf_depth {
                    None => walk.leaf_depth = Some(depth),
                    Some(d) if d != depth => return Err(corrupt(format!("leaf at depth {} not {}", depth, d))),
                    Some(_) => {}
                }
                walk.entries += leaf.entries.len() as u64;
                walk.leaves.push(page_id);
            }
            Node::Internal(node) => {
                if node.children.len() > self.order || node.children.len() < 2 {
                    return Err(corrupt(format!("{} children", node.children.len())));
                }
                if !node.keys.windows(2).all(|w| w[0] < w[1]) {
                    return Err(corrupt("separators not strictly ascending".to_string()));
                }
                if !node.keys.iter().all(in_bounds) {
                    return Err(corrupt("separator outside parent range".to_string()));
                }
                for (i, &child) in node.children.iter().enumerate() {
                    let lo = if i == 0 { lower } else { Some(&node.keys[i - 1]) };
                    let hi = node.keys.get(i).or(upper);
                    self.check_node(child, depth + 1, lo, hi, false, walk)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct InvariantWalk {
    leaf_depth: Option<usize>,
    entries: u64,
    leaves: Vec<PageId>,
}

/// Descends from `root` to the leaf that may hold `key`.
pub(crate) fn find_leaf<S: NodeSource + ?Sized>(
    source: &S,
    root: PageId,
    key: &[u8],
) -> Result<(PageId, LeafNode)> {
    let mut page_id = root;
    loop {
        match source.node(page_id)? {
            Node::Internal(node) => page_id = node.children[node.child_index(key)],
            Node::Leaf(leaf) => return Ok((page_id, leaf)),
        }
    }
}

/// Point lookup against any node source.
pub(crate) fn search_in<S: NodeSource + ?Sized>(
    source: &S,
    root: PageId,
    key: &[u8],
) -> Result<Option<Bytes>> {
    let (_, leaf) = find_leaf(source, root, key)?;
    Ok(leaf.search(key).ok().map(|i| leaf.entries[i].1.clone()))
}

fn mismatched_siblings(left: PageId, right: PageId) -> StrataError {
    StrataError::TreeCorrupted(format!("siblings {} and {} differ in kind", left, right))
}

/// Moves the last entry of `left` to the front of `child`.
fn borrow_from_left(left: Node, child: Node, separator: &mut Bytes) -> Result<(Node, Node)> {
    match (left, child) {
        (Node::Leaf(mut left), Node::Leaf(mut child)) => {
            let entry = left.entries.pop().ok_or_else(empty_sibling)?;
            *separator = entry.0.clone();
            child.entries.insert(0, entry);
            Ok((Node::Leaf(left), Node::Leaf(child)))
        }
        (Node::Internal(mut left), Node::Internal(mut child)) => {
            let key = left.keys.pop().ok_or_else(empty_sibling)?;
            let grandchild = left.children.pop().ok_or_else(empty_sibling)?;
            child.keys.insert(0, std::mem::replace(separator, key));
            child.children.insert(0, grandchild);
            Ok((Node::Internal(left), Node::Internal(child)))
        }
        _ => Err(StrataError::TreeCorrupted("siblings differ in kind".to_string())),
    }
}

/// Moves the first entry of `right` to the end of `child`.
fn borrow_from_right(child: Node, right: Node, separator: &mut Bytes) -> Result<(Node, Node)> {
    match (child, right) {
        (Node::Leaf(mut child), Node::Leaf(mut right)) => {
            if right.entries.len() < 2 {
                return Err(empty_sibling());
            }
            let entry = right.entries.remove(0);
            child.entries.push(entry);
            *separator = right.entries[0].0.clone();
            Ok((Node::Leaf(child), Node::Leaf(right)))
        }
        (Node::Internal(mut child), Node::Internal(mut right)) => {
            if right.keys.is_empty() {
                return Err(empty_sibling());
            }
            let key = right.keys.remove(0);
            let grandchild = right.children.remove(0);
            child.keys.push(std::mem::replace(separator, key));
            child.children.push(grandchild);
            Ok((Node::Internal(child), Node::Internal(right)))
        }
        _ => Err(StrataError::TreeCorrupted("siblings differ in kind".to_string())),
    }
}

fn empty_sibling() -> StrataError {
    StrataError::TreeCorrupted("sibling has nothing to lend".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::test_support::{create_test_tree, key, TestTree};
    use rand::seq::SliceRandom;
    use std::collections::BTreeMap;

    const TXN: TxnId = TxnId(1);

    fn insert(tree: &TestTree, k: u32, v: &str) {
        tree.insert(TXN, key(k), Bytes::from(v.to_string()), false)
            .unwrap();
    }

    #[test]
    fn test_btree_empty() {
        let tree = create_test_tree(4);
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 1);
        assert_eq!(tree.search(b"missing").unwrap(), None);
        assert_eq!(tree.first_key().unwrap(), None);
        assert_eq!(tree.last_key().unwrap(), None);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_btree_insert_search() {
        let tree = create_test_tree(4);
        for i in 0..100 {
            insert(&tree, i, &format!("value-{}", i));
        }

        assert_eq!(tree.len(), 100);
        for i in 0..100 {
            assert_eq!(
                tree.search(&key(i)).unwrap(),
                Some(Bytes::from(format!("value-{}", i)))
            );
        }
        assert!(tree.height() > 2);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_btree_root_split_grows_height() {
        let tree = create_test_tree(4);
        for i in 0..3 {
            insert(&tree, i, "v");
        }
        assert_eq!(tree.height(), 1);

        // The fourth entry overflows the root leaf
        insert(&tree, 3, "v");
        assert_eq!(tree.height(), 2);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_btree_duplicate_key() {
        let tree = create_test_tree(4);
        insert(&tree, 1, "first");

        let result = tree.insert(TXN, key(1), Bytes::from_static(b"second"), false);
        assert!(matches!(result, Err(StrataError::DuplicateKey)));
        assert_eq!(tree.search(&key(1)).unwrap(), Some(Bytes::from_static(b"first")));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_btree_upsert() {
        let tree = create_test_tree(4);
        insert(&tree, 1, "first");

        let prior = tree
            .insert(TXN, key(1), Bytes::from_static(b"second"), true)
            .unwrap();
        assert_eq!(prior, Some(Bytes::from_static(b"first")));
        assert_eq!(tree.search(&key(1)).unwrap(), Some(Bytes::from_static(b"second")));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_btree_key_limits() {
        let tree = create_test_tree(4);
        assert!(matches!(
            tree.insert(TXN, Bytes::new(), Bytes::new(), false),
            Err(StrataError::EmptyKey)
        ));
        assert!(matches!(
            tree.insert(TXN, Bytes::from(vec![1u8; 65]), Bytes::new(), false),
            Err(StrataError::KeyTooLarge { size: 65, max: 64 })
        ));
        assert!(matches!(
            tree.insert(TXN, key(1), Bytes::from(vec![1u8; 65]), false),
            Err(StrataError::ValueTooLarge { size: 65, max: 64 })
        ));
    }

    #[test]
    fn test_btree_delete() {
        let tree = create_test_tree(4);
        for i in 0..50 {
            insert(&tree, i, "v");
        }

        assert_eq!(tree.delete(TXN, &key(10)).unwrap(), Bytes::from_static(b"v"));
        assert_eq!(tree.search(&key(10)).unwrap(), None);
        assert!(matches!(tree.delete(TXN, &key(10)), Err(StrataError::NotFound)));
        assert_eq!(tree.len(), 49);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_btree_delete_all_shrinks_to_leaf() {
        let tree = create_test_tree(4);
        for i in 0..200 {
            insert(&tree, i, "v");
        }
        for i in 0..200 {
            tree.delete(TXN, &key(i)).unwrap();
            tree.check_invariants().unwrap();
        }
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 1);
    }

    #[test]
    fn test_btree_deleted_pages_are_reused() {
        let tree = create_test_tree(4);
        for i in 0..200 {
            insert(&tree, i, "v");
        }
        let grown = tree.pager().header().page_count;
        for i in 0..200 {
            tree.delete(TXN, &key(i)).unwrap();
        }
        assert!(tree.pager().header().free_list_head.is_some());

        for i in 0..200 {
            insert(&tree, i, "v");
        }
        assert_eq!(tree.pager().header().page_count, grown);
    }

    #[test]
    fn test_btree_random_workload_matches_model() {
        for order in [3, 4, 5, 8] {
            let tree = create_test_tree(order);
            let mut model = BTreeMap::new();
            let mut rng = rand::rng();

            let mut keys: Vec<u32> = (0..400).collect();
            keys.shuffle(&mut rng);
            for &k in &keys {
                insert(&tree, k, &k.to_string());
                model.insert(key(k), Bytes::from(k.to_string()));
            }
            tree.check_invariants().unwrap();

            keys.shuffle(&mut rng);
            for &k in keys.iter().take(300) {
                tree.delete(TXN, &key(k)).unwrap();
                model.remove(&key(k));
            }
            tree.check_invariants().unwrap();

            let scanned: Vec<_> = tree.iter().map(|r| r.unwrap()).collect();
            let expected: Vec<_> = model.into_iter().collect();
            assert_eq!(scanned, expected, "order {}", order);
        }
    }

    #[test]
    fn test_btree_restore() {
        let tree = create_test_tree(4);
        insert(&tree, 1, "a");

        // Undo of an insert removes the key; repeating it changes nothing
        assert!(tree.restore(TXN, key(1), None).unwrap());
        assert!(!tree.restore(TXN, key(1), None).unwrap());
        assert_eq!(tree.search(&key(1)).unwrap(), None);

        // Undo of a delete or update restores the prior value
        assert!(tree.restore(TXN, key(2), Some(Bytes::from_static(b"b"))).unwrap());
        assert!(!tree.restore(TXN, key(2), Some(Bytes::from_static(b"b"))).unwrap());
        assert_eq!(tree.search(&key(2)).unwrap(), Some(Bytes::from_static(b"b")));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_btree_mutations_are_logged() {
        let tree = create_test_tree(4);
        let before = tree.wal.next_lsn();
        insert(&tree, 1, "a");
        tree.delete(TXN, &key(1)).unwrap();
        assert_eq!(tree.wal.next_lsn().0, before.0 + 2);

        // A failed mutation logs nothing
        let _ = tree.delete(TXN, &key(1));
        assert_eq!(tree.wal.next_lsn().0, before.0 + 2);
    }

    #[test]
    fn test_btree_first_last_key() {
        let tree = create_test_tree(4);
        for i in [5, 1, 9, 3] {
            insert(&tree, i, "v");
        }
        assert_eq!(tree.first_key().unwrap(), Some(key(1)));
        assert_eq!(tree.last_key().unwrap(), Some(key(9)));
    }
}
