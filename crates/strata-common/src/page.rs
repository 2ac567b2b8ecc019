//! Page structures for Strata storage.

use crate::error::{Result, StrataError};
use crate::types::Lsn;
use serde::{Deserialize, Serialize};

/// Default page size in bytes (8 KB).
pub const DEFAULT_PAGE_SIZE: usize = 8 * 1024;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Checks that a page size is a power of two within the supported range.
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(StrataError::InvalidConfig(format!(
            "page size {} must be a power of two between {} and {}",
            page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
        )));
    }
    Ok(())
}

/// Identifier of a page within the data file.
///
/// Page 0 is always the header page. Because nothing ever links to the
/// header page, id 0 doubles as the "no page" value in on-page links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// The header page.
    pub const HEADER: PageId = PageId(0);

    /// Returns the page number as a byte offset multiplier.
    pub fn offset(&self, page_size: usize) -> u64 {
        self.0 as u64 * page_size as u64
    }

    /// Decodes an on-page link, mapping 0 to `None`.
    pub fn from_link(raw: u32) -> Option<PageId> {
        if raw == 0 {
            None
        } else {
            Some(PageId(raw))
        }
    }

    /// Encodes an optional page as an on-page link.
    pub fn to_link(page: Option<PageId>) -> u32 {
        page.map(|p| p.0).unwrap_or(0)
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "page:{}", self.0)
    }
}

/// Page kinds in Strata storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageKind {
    /// Page on the free list.
    Free = 0,
    /// Database header page (page 0).
    Header = 1,
    /// B+ tree leaf page.
    Leaf = 2,
    /// B+ tree internal page.
    Internal = 3,
}

impl TryFrom<u8> for PageKind {
    type Error = StrataError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PageKind::Free),
            1 => Ok(PageKind::Header),
            2 => Ok(PageKind::Leaf),
            3 => Ok(PageKind::Internal),
            _ => Err(StrataError::PageCorrupted {
                page_id: 0,
                reason: format!("invalid page kind: {}", value),
            }),
        }
    }
}

/// Header structure at the beginning of every page.
///
/// Layout (24 bytes total):
/// - page_id: 4 bytes
/// - lsn: 8 bytes (LSN of the record that produced this image)
/// - kind: 1 byte
/// - flags: 1 byte
/// - entry_count: 2 bytes
/// - link: 4 bytes (next leaf, leftmost child, or next free page)
/// - checksum: 4 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Page this header belongs to.
    pub page_id: PageId,
    /// LSN of the last logged modification.
    pub lsn: Lsn,
    /// Kind of this page.
    pub kind: PageKind,
    /// Reserved page flags.
    pub flags: u8,
    /// Number of entries stored in the payload.
    pub entry_count: u16,
    /// Kind-specific page link (0 = none).
    pub link: u32,
    /// CRC32 of the whole page with this field zeroed.
    pub checksum: u32,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 24;

    /// Byte range of the checksum field.
    const CHECKSUM_OFFSET: usize = 20;

    /// Creates a new page header.
    pub fn new(page_id: PageId, kind: PageKind) -> Self {
        Self {
            page_id,
            lsn: Lsn::INVALID,
            kind,
            flags: 0,
            entry_count: 0,
            link: 0,
            checksum: 0,
        }
    }

    /// Serializes the header into the first `SIZE` bytes of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.page_id.0.to_le_bytes());
        buf[4..12].copy_from_slice(&self.lsn.0.to_le_bytes());
        buf[12] = self.kind as u8;
        buf[13] = self.flags;
        buf[14..16].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[16..20].copy_from_slice(&self.link.to_le_bytes());
        buf[20..24].copy_from_slice(&self.checksum.to_le_bytes());
    }

    /// Deserializes the header from bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(StrataError::PageCorrupted {
                page_id: 0,
                reason: format!("page too short: {} bytes", buf.len()),
            });
        }
        let page_id = PageId(read_u32(buf, 0));
        let kind = PageKind::try_from(buf[12]).map_err(|_| StrataError::PageCorrupted {
            page_id: page_id.0,
            reason: format!("invalid page kind: {}", buf[12]),
        })?;

        Ok(Self {
            page_id,
            lsn: Lsn(read_u64(buf, 4)),
            kind,
            flags: buf[13],
            entry_count: read_u16(buf, 14),
            link: read_u32(buf, 16),
            checksum: read_u32(buf, 20),
        })
    }

    /// Reads only the LSN field of a page image.
    pub fn lsn_of(buf: &[u8]) -> Lsn {
        if buf.len() < 12 {
            return Lsn::INVALID;
        }
        Lsn(read_u64(buf, 4))
    }

    /// Overwrites the LSN field of a page image.
    pub fn stamp_lsn(buf: &mut [u8], lsn: Lsn) {
        buf[4..12].copy_from_slice(&lsn.0.to_le_bytes());
    }
}

/// Computes the CRC32 of a page, treating the checksum field as zero.
pub fn compute_checksum(page: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page[..PageHeader::CHECKSUM_OFFSET]);
    hasher.update(&[0u8; 4]);
    hasher.update(&page[PageHeader::SIZE..]);
    hasher.finalize()
}

/// Stores the page checksum in its header. Called right before write-back.
pub fn seal_page(page: &mut [u8]) {
    let checksum = compute_checksum(page);
    page[PageHeader::CHECKSUM_OFFSET..PageHeader::SIZE].copy_from_slice(&checksum.to_le_bytes());
}

/// Verifies a page read from disk.
pub fn verify_page(page_id: PageId, page: &[u8]) -> Result<()> {
    if page.len() < PageHeader::SIZE {
        return Err(StrataError::PageCorrupted {
            page_id: page_id.0,
            reason: "page too short".to_string(),
        });
    }
    let stored = read_u32(page, PageHeader::CHECKSUM_OFFSET);
    let computed = compute_checksum(page);
    if stored != computed {
        return Err(StrataError::PageCorrupted {
            page_id: page_id.0,
            reason: format!("checksum mismatch: stored={}, computed={}", stored, computed),
        });
    }
    let stored_id = read_u32(page, 0);
    if stored_id != page_id.0 {
        return Err(StrataError::PageCorrupted {
            page_id: page_id.0,
            reason: format!("page id mismatch: stored={}", stored_id),
        });
    }
    Ok(())
}

/// Reads a little-endian u16. Caller guarantees bounds.
#[inline]
pub fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

/// Reads a little-endian u32. Caller guarantees bounds.
#[inline]
pub fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Reads a little-endian u64. Caller guarantees bounds.
#[inline]
pub fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(bytes)
}
