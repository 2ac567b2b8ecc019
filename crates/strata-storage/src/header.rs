//! Database header page (page 0).

use strata_common::page::{read_u16, read_u32, read_u64};
use strata_common::{PageHeader, PageId, PageKind, Result, StorageConfig, StrataError};

/// Magic bytes identifying a Strata data file.
pub const DB_MAGIC: [u8; 8] = *b"STRATA\0\x01";

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Decoded contents of the header page.
///
/// Payload layout (after the 24-byte page header):
/// - magic: 8 bytes
/// - format_version: 4 bytes
/// - page_size: 4 bytes
/// - order: 2 bytes
/// - tree_height: 2 bytes
/// - page_count: 4 bytes
/// - free_list_head: 4 bytes (0 = empty)
/// - root_page_id: 4 bytes
/// - entry_count: 8 bytes
/// - schema_version: 8 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseHeader {
    /// On-disk format version.
    pub format_version: u32,
    /// Page size the file was created with.
    pub page_size: u32,
    /// Tree fanout chosen at creation.
    pub order: u16,
    /// Number of levels in the tree (1 = root is a leaf).
    pub tree_height: u16,
    /// Number of pages in use or on the free list, including this one.
    pub page_count: u32,
    /// First page of the free list.
    pub free_list_head: Option<PageId>,
    /// Root page of the tree.
    pub root_page_id: PageId,
    /// Number of key-value pairs in the tree.
    pub entry_count: u64,
    /// Bumped whenever cached plans must be discarded.
    pub schema_version: u64,
}

impl DatabaseHeader {
    const PAYLOAD: usize = PageHeader::SIZE;

    /// Bytes used by the header page payload.
    pub const ENCODED_SIZE: usize = Self::PAYLOAD + 48;

    /// Header for a new file whose root is an empty leaf at `root`.
    pub fn new(config: &StorageConfig, root: PageId) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            page_size: config.page_size as u32,
            order: config.order as u16,
            tree_height: 1,
            page_count: root.0 + 1,
            free_list_head: None,
            root_page_id: root,
            entry_count: 0,
            schema_version: 0,
        }
    }

    /// Encodes the header into a full page image.
    pub fn encode(&self, page_size: usize) -> Vec<u8> {
        let mut page = vec![0u8; page_size];
        PageHeader::new(PageId::HEADER, PageKind::Header).write_to(&mut page);

        let p = Self::PAYLOAD;
        page[p..p + 8].copy_from_slice(&DB_MAGIC);
        page[p + 8..p + 12].copy_from_slice(&self.format_version.to_le_bytes());
        page[p + 12..p + 16].copy_from_slice(&self.page_size.to_le_bytes());
        page[p + 16..p + 18].copy_from_slice(&self.order.to_le_bytes());
        page[p + 18..p + 20].copy_from_slice(&self.tree_height.to_le_bytes());
        page[p + 20..p + 24].copy_from_slice(&self.page_count.to_le_bytes());
        page[p + 24..p + 28].copy_from_slice(&PageId::to_link(self.free_list_head).to_le_bytes());
        page[p + 28..p + 32].copy_from_slice(&self.root_page_id.0.to_le_bytes());
        page[p + 32..p + 40].copy_from_slice(&self.entry_count.to_le_bytes());
        page[p + 40..p + 48].copy_from_slice(&self.schema_version.to_le_bytes());
        page
    }

    /// Decodes the header page.
    ///
    /// A foreign magic or an unknown format version is `IncompatibleFormat`.
    pub fn decode(page: &[u8]) -> Result<Self> {
        if page.len() < Self::ENCODED_SIZE {
            return Err(StrataError::IncompatibleFormat {
                found: format!("{} byte header page", page.len()),
                supported: format!("at least {} bytes", Self::ENCODED_SIZE),
            });
        }
        let p = Self::PAYLOAD;
        if page[p..p + 8] != DB_MAGIC {
            return Err(StrataError::IncompatibleFormat {
                found: format!("magic {:?}", &page[p..p + 8]),
                supported: format!("magic {:?}", DB_MAGIC),
            });
        }
        let format_version = read_u32(page, p + 8);
        if format_version != FORMAT_VERSION {
            return Err(StrataError::IncompatibleFormat {
                found: format!("format version {}", format_version),
                supported: format!("format version {}", FORMAT_VERSION),
            });
        }
        let header = PageHeader::from_bytes(page)?;
        if header.kind != PageKind::Header {
            return Err(StrataError::PageCorrupted {
                page_id: 0,
                reason: format!("page 0 has kind {:?}", header.kind),
            });
        }

        Ok(Self {
            format_version,
            page_size: read_u32(page, p + 12),
            order: read_u16(page, p + 16),
            tree_height: read_u16(page, p + 18),
            page_count: read_u32(page, p + 20),
            free_list_head: PageId::from_link(read_u32(page, p + 24)),
            root_page_id: PageId(read_u32(page, p + 28)),
            entry_count: read_u64(page, p + 32),
            schema_version: read_u64(page, p + 40),
        })
    }
}
