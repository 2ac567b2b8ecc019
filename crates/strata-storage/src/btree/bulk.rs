//! Bottom-up bulk loading from sorted input.
//!
//! The loader packs leaves left to right at a target fill factor, then
//! builds each internal level over the level below until a single root
//! remains. Input that lies entirely after the existing keys (or entirely
//! before them) is grafted onto the tree's right (or left) edge: only the
//! edge leaf and its ancestors are rewritten, in place, and the rest of the
//! tree is left alone. Input that interleaves with existing keys rebuilds
//! the whole tree.
//!
//! Every staged page and the new header are logged before any of them is
//! installed. Images beyond one record's budget go into `BulkLoadPart`
//! records ahead of the closing `BulkLoad` record, and all pages carry the
//! closing LSN, so the load is visible either completely or not at all.

use super::node::{InternalNode, LeafNode, Node};
use super::tree::BTree;
use crate::pager::{PageBatch, StagedChanges};
use bytes::Bytes;
use parking_lot::RwLockWriteGuard;
use std::time::Instant;
use strata_common::{BulkLoadConfig, Lsn, PageId, Result, StrataError, TxnId};
use strata_wal::{LogOp, LogRecord, PageImage, MAX_PAYLOAD_SIZE};
use tracing::{debug, info};

/// Node capacities used for one load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Capacities {
    leaf: usize,
    min_leaf: usize,
    max_leaf: usize,
    internal: usize,
    min_children: usize,
    max_children: usize,
}

impl Capacities {
    /// Target sizes for `fill_factor`, clamped so every node meets the
    /// minimum fill and leaves room for at least one insert.
    fn new(order: usize, fill_factor: f64) -> Self {
        let max_leaf = order - 1;
        let min_children = order.div_ceil(2);
        let min_leaf = min_children - 1;
        let target = |max: usize| (fill_factor * max as f64).round() as usize;
        Self {
            leaf: target(max_leaf).clamp(min_leaf.max(1), (max_leaf - 1).max(min_leaf).max(1)),
            min_leaf,
            max_leaf,
            internal: target(order).clamp(min_children, (order - 1).max(min_children)),
            min_children,
            max_children: order,
        }
    }
}

/// Side of the tree a graft rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Left,
    Right,
}

/// How a load changes the existing tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    /// Old and new entries are repacked into a fresh tree.
    Rebuild,
    /// New entries are added along one edge.
    Graft(Edge),
}

/// (first key, page) of each node on a level being built. The key of a
/// node that is first among its parent's children is never used.
type Level = Vec<(Bytes, PageId)>;

/// Splits `len` items into runs of `target`, rebalancing the last two
/// runs so that neither ends below `min` (unless there is only one run).
fn chunk_sizes(len: usize, target: usize, min: usize, max: usize) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    let mut sizes = vec![target; len / target];
    if len % target != 0 {
        sizes.push(len % target);
    }

    let n = sizes.len();
    if n >= 2 && sizes[n - 1] < min {
        let combined = sizes[n - 2] + sizes[n - 1];
        sizes.truncate(n - 2);
        if combined <= max {
            sizes.push(combined);
        } else {
            sizes.push(combined - combined / 2);
            sizes.push(combined / 2);
        }
    }
    sizes
}

/// Merges two sorted runs; a key present in both is `DuplicateKey`.
fn merge_sorted(
    existing: Vec<(Bytes, Bytes)>,
    incoming: Vec<(Bytes, Bytes)>,
) -> Result<Vec<(Bytes, Bytes)>> {
    let mut merged = Vec::with_capacity(existing.len() + incoming.len());
    let mut a = existing.into_iter().peekable();
    let mut b = incoming.into_iter().peekable();
    loop {
        let take_a = match (a.peek(), b.peek()) {
            (Some((ka, _)), Some((kb, _))) => {
                if ka == kb {
                    return Err(StrataError::DuplicateKey);
                }
                ka < kb
            }
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return Ok(merged),
        };
        let next = if take_a { a.next() } else { b.next() };
        merged.extend(next);
    }
}

/// Splits page images into runs whose encoding fits in `budget` bytes.
/// An image larger than the budget gets a run of its own. Always returns
/// at least one run.
fn split_images(images: &[PageImage], budget: usize) -> Vec<&[PageImage]> {
    let mut runs = Vec::new();
    let mut start = 0;
    let mut size = PageImage::SET_HEADER_LEN;
    for (i, image) in images.iter().enumerate() {
        let len = image.encoded_len();
        if i > start && size + len > budget {
            runs.push(&images[start..i]);
            start = i;
            size = PageImage::SET_HEADER_LEN;
        }
        size += len;
    }
    runs.push(&images[start..]);
    runs
}

/// Page a record carrying `images` is filed under.
fn primary_page(images: &[PageImage]) -> PageId {
    images
        .iter()
        .map(|i| i.page_id)
        .find(|p| *p != PageId::HEADER)
        .unwrap_or(PageId::HEADER)
}

impl BTree {
    /// Checks that bulk input is strictly ascending by key and within the
    /// size limits, failing with `UnsortedInput` at the first position out
    /// of order. Reads nothing from the tree.
    pub fn validate_bulk_input(&self, pairs: &[(Bytes, Bytes)]) -> Result<()> {
        for (position, (key, value)) in pairs.iter().enumerate() {
            self.validate_key(key)?;
            self.validate_value(value)?;
            if position > 0 && pairs[position - 1].0 >= *key {
                return Err(StrataError::UnsortedInput { position });
            }
        }
        Ok(())
    }

    /// Adds `pairs` to the tree as one self-committing unit.
    ///
    /// `pairs` must be strictly ascending by key; otherwise the load fails
    /// with `UnsortedInput` before anything is read or written. A key that
    /// is already in the tree fails with `DuplicateKey`, leaving the tree
    /// untouched. Returns the number of pairs loaded. The load is durable
    /// when this returns.
    pub fn bulk_load(
        &self,
        txn_id: TxnId,
        pairs: Vec<(Bytes, Bytes)>,
        config: &BulkLoadConfig,
    ) -> Result<usize> {
        self.validate_bulk_input(&pairs)?;
        if pairs.is_empty() {
            return Ok(0);
        }
        let loaded = pairs.len();
        let started = Instant::now();
        let caps = Capacities::new(self.order, config.fill_factor);

        let latch = self.latch.write();
        let mut batch = self.pager.batch();
        let (shape, pages) = stage_load(&mut batch, pairs, caps)?;
        let changes = batch.finish();
        let (lsn, records) = self.log_load(&latch, txn_id, &changes, config.record_bytes)?;
        self.pager.install(changes, lsn)?;
        drop(latch);

        self.wal.flush_to(lsn)?;
        info!(
            loaded,
            entries = self.len(),
            pages,
            records,
            shape = ?shape,
            height = self.height(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Bulk load complete"
        );
        Ok(loaded)
    }

    /// Logs a staged load. Images that do not fit in `record_bytes` spill
    /// into `BulkLoadPart` records ahead of the closing `BulkLoad` record.
    /// Returns the closing LSN and the number of records written.
    fn log_load(
        &self,
        _latch: &RwLockWriteGuard<'_, ()>,
        txn_id: TxnId,
        changes: &StagedChanges,
        record_bytes: usize,
    ) -> Result<(Lsn, usize)> {
        let runs = split_images(changes.images(), record_bytes.min(MAX_PAYLOAD_SIZE));
        let last = runs.len() - 1;
        let mut lsn = Lsn::INVALID;
        for (i, run) in runs.iter().enumerate() {
            let op = if i == last {
                LogOp::BulkLoad
            } else {
                LogOp::BulkLoadPart
            };
            let record = LogRecord::new(
                txn_id,
                op,
                primary_page(run),
                PageImage::encode_all(run),
                Bytes::new(),
            );
            lsn = self.wal.append(record)?;
        }
        debug!(
            txn_id = %txn_id,
            lsn = %lsn,
            records = runs.len(),
            pages = changes.images().len(),
            "Logged bulk load"
        );
        Ok((lsn, runs.len()))
    }
}

/// Stages the whole load in `batch`. Returns how the tree was changed and
/// the number of tree pages written.
fn stage_load(
    batch: &mut PageBatch<'_>,
    pairs: Vec<(Bytes, Bytes)>,
    caps: Capacities,
) -> Result<(Shape, usize)> {
    let added = pairs.len() as u64;
    let shape = choose_shape(batch, &pairs)?;
    let (root, height, pages) = match shape {
        Shape::Rebuild => {
            let (existing, old_pages) = collect_tree(batch)?;
            let entries = merge_sorted(existing, pairs)?;
            for page_id in old_pages {
                batch.free(page_id)?;
            }
            build(batch, entries, caps)?
        }
        Shape::Graft(edge) => graft(batch, pairs, edge, caps)?,
    };

    let header = batch.header_mut();
    header.root_page_id = root;
    header.tree_height = height;
    header.entry_count += added;
    Ok((shape, pages))
}

/// Picks a graft when the sorted input lies wholly past one end of a
/// non-empty tree.
fn choose_shape(batch: &PageBatch<'_>, pairs: &[(Bytes, Bytes)]) -> Result<Shape> {
    let (Some((first_new, _)), Some((last_new, _))) = (pairs.first(), pairs.last()) else {
        return Ok(Shape::Rebuild);
    };
    if batch.header().entry_count == 0 {
        return Ok(Shape::Rebuild);
    }

    let (_, _, right) = edge_path(batch, Edge::Right)?;
    if right.entries.last().is_some_and(|(last, _)| first_new > last) {
        return Ok(Shape::Graft(Edge::Right));
    }
    let (_, _, left) = edge_path(batch, Edge::Left)?;
    if left.entries.first().is_some_and(|(first, _)| last_new < first) {
        return Ok(Shape::Graft(Edge::Left));
    }
    Ok(Shape::Rebuild)
}

/// Internal nodes from the root down along `edge`, then the edge leaf.
type EdgePath = (Vec<(PageId, InternalNode)>, PageId, LeafNode);

fn edge_path(batch: &PageBatch<'_>, edge: Edge) -> Result<EdgePath> {
    let mut path = Vec::new();
    let mut page_id = batch.header().root_page_id;
    loop {
        match batch.read_node(page_id)? {
            Node::Internal(node) => {
                let child = match edge {
                    Edge::Left => node.children.first(),
                    Edge::Right => node.children.last(),
                };
                let child = child.copied().ok_or_else(|| {
                    StrataError::TreeCorrupted(format!("internal node {} has no children", page_id))
                })?;
                path.push((page_id, node));
                page_id = child;
            }
            Node::Leaf(leaf) => return Ok((path, page_id, leaf)),
        }
    }
}

/// Reads every entry of the current tree in key order, along with the ids
/// of all its pages.
fn collect_tree(batch: &PageBatch<'_>) -> Result<(Vec<(Bytes, Bytes)>, Vec<PageId>)> {
    let mut entries = Vec::with_capacity(batch.header().entry_count as usize);
    let mut pages = Vec::new();
    let mut stack = vec![batch.header().root_page_id];
    while let Some(page_id) = stack.pop() {
        pages.push(page_id);
        match batch.read_node(page_id)? {
            // Children pushed right to left so leaves pop in key order
            Node::Internal(node) => stack.extend(node.children.into_iter().rev()),
            Node::Leaf(leaf) => entries.extend(leaf.entries),
        }
    }
    Ok((entries, pages))
}

/// Writes a new tree over `entries`, returning its root, height, and page
/// count.
fn build(
    batch: &mut PageBatch<'_>,
    entries: Vec<(Bytes, Bytes)>,
    caps: Capacities,
) -> Result<(PageId, u16, usize)> {
    let level = write_leaves(batch, entries, None, None, caps)?;
    let leaves = level.len();
    let (root, height, upper) = stack_levels(batch, level, 1, caps)?;
    Ok((root, height, leaves + upper))
}

/// Rewrites the `edge` path of the tree with `pairs` added.
///
/// Each node on the path is repacked together with the new nodes below it.
/// The first node of every repacked run keeps the old page id, so the
/// leaf chain and every untouched subtree stay valid. Returns the root,
/// height, and number of pages written.
fn graft(
    batch: &mut PageBatch<'_>,
    pairs: Vec<(Bytes, Bytes)>,
    edge: Edge,
    caps: Capacities,
) -> Result<(PageId, u16, usize)> {
    let (path, leaf_id, leaf) = edge_path(batch, edge)?;
    let height = path.len() as u16 + 1;

    let entries = match edge {
        Edge::Right => leaf.entries.into_iter().chain(pairs).collect(),
        Edge::Left => pairs.into_iter().chain(leaf.entries).collect(),
    };
    // The right edge leaf has no successor
    let mut level = write_leaves(batch, entries, Some(leaf_id), leaf.next, caps)?;
    let mut pages = level.len();

    for (page_id, node) in path.into_iter().rev() {
        // (separator before the child, child); the first child has none
        let old: Level = std::iter::once(Bytes::new())
            .chain(node.keys)
            .zip(node.children)
            .collect();
        let items = match edge {
            Edge::Right => {
                let mut items = old;
                let (separator, _) = items.pop().ok_or_else(|| {
                    StrataError::TreeCorrupted(format!("internal node {} has no children", page_id))
                })?;
                // The rebuilt child keeps its slot and its separator
                level[0].0 = separator;
                items.extend(level);
                items
            }
            Edge::Left => {
                let mut items = level;
                items.extend(old.into_iter().skip(1));
                items
            }
        };
        level = write_internal(batch, items, Some(page_id), caps)?;
        pages += level.len();
    }

    let (root, height, upper) = stack_levels(batch, level, height, caps)?;
    Ok((root, height, pages + upper))
}

/// Packs sorted entries into a chain of leaves that ends in `next`. The
/// first leaf goes to `first_page` when given.
fn write_leaves(
    batch: &mut PageBatch<'_>,
    entries: Vec<(Bytes, Bytes)>,
    first_page: Option<PageId>,
    next: Option<PageId>,
    caps: Capacities,
) -> Result<Level> {
    let sizes = chunk_sizes(entries.len(), caps.leaf, caps.min_leaf, caps.max_leaf);
    let mut ids = Vec::with_capacity(sizes.len());
    for i in 0..sizes.len() {
        ids.push(match first_page {
            Some(page_id) if i == 0 => page_id,
            _ => batch.allocate()?,
        });
    }

    let mut entries = entries.into_iter();
    let mut level = Vec::with_capacity(sizes.len());
    for (i, &size) in sizes.iter().enumerate() {
        let leaf = LeafNode {
            entries: entries.by_ref().take(size).collect(),
            next: ids.get(i + 1).copied().or(next),
        };
        let first = leaf.entries[0].0.clone();
        batch.write_node(ids[i], &Node::Leaf(leaf))?;
        level.push((first, ids[i]));
    }
    Ok(level)
}

/// Packs `items` into internal nodes, one level up. The first node goes to
/// `first_page` when given.
fn write_internal(
    batch: &mut PageBatch<'_>,
    items: Level,
    first_page: Option<PageId>,
    caps: Capacities,
) -> Result<Level> {
    let sizes = chunk_sizes(items.len(), caps.internal, caps.min_children, caps.max_children);
    let mut items = items.into_iter();
    let mut parents = Vec::with_capacity(sizes.len());
    for (i, size) in sizes.into_iter().enumerate() {
        let group: Level = items.by_ref().take(size).collect();
        let first = group[0].0.clone();
        let node = InternalNode {
            keys: group[1..].iter().map(|(k, _)| k.clone()).collect(),
            children: group.iter().map(|(_, p)| *p).collect(),
        };
        let page_id = match first_page {
            Some(page_id) if i == 0 => page_id,
            _ => batch.allocate()?,
        };
        batch.write_node(page_id, &Node::Internal(node))?;
        parents.push((first, page_id));
    }
    Ok(parents)
}

/// Adds internal levels over `level` until a single root remains. Returns
/// the root, the final height, and the number of pages added.
fn stack_levels(
    batch: &mut PageBatch<'_>,
    mut level: Level,
    mut height: u16,
    caps: Capacities,
) -> Result<(PageId, u16, usize)> {
    let mut pages = 0;
    while level.len() > 1 {
        level = write_internal(batch, level, None, caps)?;
        pages += level.len();
        height += 1;
    }
    let (_, root) = level
        .pop()
        .ok_or_else(|| StrataError::Internal("bulk load built no root".to_string()))?;
    Ok((root, height, pages))
}
