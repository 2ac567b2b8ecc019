//! B+Tree node pages (leaf and internal).
//!
//! Leaf page payload, after the common page header (`link` = next leaf):
//! ```text
//! | key_len: u16 | val_len: u16 | key | value |  x entry_count
//! ```
//!
//! Internal page payload (`link` = leftmost child):
//! ```text
//! | key_len: u16 | child: u32 | key |  x entry_count
//! ```
//! Entry i holds separator key i and the child to its right, so every key
//! in that child is >= the separator.

use bytes::Bytes;
use strata_common::config::{INTERNAL_ENTRY_OVERHEAD, LEAF_ENTRY_OVERHEAD};
use strata_common::page::{read_u16, read_u32};
use strata_common::{PageHeader, PageId, PageKind, Result, StrataError};

/// Leaf node: sorted key-value pairs plus the right sibling link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafNode {
    /// Entries in strictly ascending key order.
    pub entries: Vec<(Bytes, Bytes)>,
    /// Next leaf in key order.
    pub next: Option<PageId>,
}

/// Internal node: `children.len() == keys.len() + 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternalNode {
    /// Separator keys in strictly ascending order.
    pub keys: Vec<Bytes>,
    /// Child pages.
    pub children: Vec<PageId>,
}

/// Materialized view of a tree page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl LeafNode {
    /// Binary search for a key. Returns Ok(index) if found, Err(index) for insertion point.
    pub fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.as_ref().cmp(key))
    }

    /// Bytes the entries occupy on the page.
    pub fn payload_size(&self) -> usize {
        self.entries
            .iter()
            .map(|(k, v)| LEAF_ENTRY_OVERHEAD + k.len() + v.len())
            .sum()
    }
}

impl InternalNode {
    /// Index of the child whose subtree may contain `key`.
    pub fn child_index(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|k| k.as_ref() <= key)
    }

    /// Bytes the entries occupy on the page.
    pub fn payload_size(&self) -> usize {
        self.keys
            .iter()
            .map(|k| INTERNAL_ENTRY_OVERHEAD + k.len())
            .sum()
    }
}

impl Node {
    /// Number of entries (leaf) or children (internal), the unit of fill bounds.
    pub fn fill(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.entries.len(),
            Node::Internal(internal) => internal.children.len(),
        }
    }

    /// Smallest key stored in or routed by this node.
    pub fn first_key(&self) -> Option<&Bytes> {
        match self {
            Node::Leaf(leaf) => leaf.entries.first().map(|(k, _)| k),
            Node::Internal(internal) => internal.keys.first(),
        }
    }

    /// Encodes the node into a full page image.
    pub fn encode(&self, page_id: PageId, page_size: usize) -> Result<Vec<u8>> {
        let mut page = vec![0u8; page_size];
        let (kind, count, link, payload) = match self {
            Node::Leaf(leaf) => (
                PageKind::Leaf,
                leaf.entries.len(),
                PageId::to_link(leaf.next),
                leaf.payload_size(),
            ),
            Node::Internal(internal) => (
                PageKind::Internal,
                internal.keys.len(),
                internal.children.first().map(|c| c.0).unwrap_or(0),
                internal.payload_size(),
            ),
        };
        if PageHeader::SIZE + payload > page_size || count > u16::MAX as usize {
            return Err(StrataError::TreeCorrupted(format!(
                "{} entries ({} bytes) do not fit {}",
                count, payload, page_id
            )));
        }

        let mut header = PageHeader::new(page_id, kind);
        header.entry_count = count as u16;
        header.link = link;
        header.write_to(&mut page);

        let mut off = PageHeader::SIZE;
        match self {
            Node::Leaf(leaf) => {
                for (key, value) in &leaf.entries {
                    page[off..off + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
                    page[off + 2..off + 4].copy_from_slice(&(value.len() as u16).to_le_bytes());
                    off += LEAF_ENTRY_OVERHEAD;
                    page[off..off + key.len()].copy_from_slice(key);
                    off += key.len();
                    page[off..off + value.len()].copy_from_slice(value);
                    off += value.len();
                }
            }
            Node::Internal(internal) => {
                for (key, child) in internal.keys.iter().zip(&internal.children[1..]) {
                    page[off..off + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
                    page[off + 2..off + 6].copy_from_slice(&child.0.to_le_bytes());
                    off += INTERNAL_ENTRY_OVERHEAD;
                    page[off..off + key.len()].copy_from_slice(key);
                    off += key.len();
                }
            }
        }
        Ok(page)
    }

    /// Decodes a leaf or internal page.
    pub fn decode(page_id: PageId, page: &[u8]) -> Result<Self> {
        let header = PageHeader::from_bytes(page)?;
        let corrupt = |reason: String| StrataError::PageCorrupted {
            page_id: page_id.0,
            reason,
        };
        let count = header.entry_count as usize;
        let mut off = PageHeader::SIZE;

        match header.kind {
            PageKind::Leaf => {
                let mut entries = Vec::with_capacity(count);
                for i in 0..count {
                    if off + LEAF_ENTRY_OVERHEAD > page.len() {
                        return Err(corrupt(format!("leaf entry {} header out of bounds", i)));
                    }
                    let key_len = read_u16(page, off) as usize;
                    let val_len = read_u16(page, off + 2) as usize;
                    off += LEAF_ENTRY_OVERHEAD;
                    if off + key_len + val_len > page.len() {
                        return Err(corrupt(format!("leaf entry {} out of bounds", i)));
                    }
                    let key = Bytes::copy_from_slice(&page[off..off + key_len]);
                    off += key_len;
                    let value = Bytes::copy_from_slice(&page[off..off + val_len]);
                    off += val_len;
                    entries.push((key, value));
                }
                Ok(Node::Leaf(LeafNode {
                    entries,
                    next: PageId::from_link(header.link),
                }))
            }
            PageKind::Internal => {
                if header.link == 0 {
                    return Err(corrupt("internal node without leftmost child".to_string()));
                }
                let mut keys = Vec::with_capacity(count);
                let mut children = Vec::with_capacity(count + 1);
                children.push(PageId(header.link));
                for i in 0..count {
                    if off + INTERNAL_ENTRY_OVERHEAD > page.len() {
                        return Err(corrupt(format!("internal entry {} header out of bounds", i)));
                    }
                    let key_len = read_u16(page, off) as usize;
                    let child = read_u32(page, off + 2);
                    off += INTERNAL_ENTRY_OVERHEAD;
                    if off + key_len > page.len() || child == 0 {
                        return Err(corrupt(format!("internal entry {} is invalid", i)));
                    }
                    keys.push(Bytes::copy_from_slice(&page[off..off + key_len]));
                    children.push(PageId(child));
                    off += key_len;
                }
                Ok(Node::Internal(InternalNode { keys, children }))
            }
            kind => Err(corrupt(format!("expected a tree page, found {:?}", kind))),
        }
    }
}
