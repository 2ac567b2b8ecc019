//! WAL file management.
//!
//! The log is a single append-only file. Checkpoints discard its prefix by
//! rewriting the retained suffix to a temporary file and renaming it over
//! the original, so the log on disk is always either the old or the new
//! version.

use crate::constants::{FILE_HEADER_SIZE, FILE_MAGIC, FILE_VERSION};
use strata_common::page::{read_u32, read_u64};
use strata_common::{Lsn, Result, StrataError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Header at the beginning of the WAL file.
///
/// Layout (32 bytes):
/// - magic: 4 bytes ("SWAL")
/// - version: 4 bytes
/// - page_size: 4 bytes
/// - reserved: 4 bytes
/// - base_lsn: 8 bytes (next LSN to assign when the file holds no records)
/// - flags: 4 bytes
/// - checksum: 4 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFileHeader {
    /// Magic bytes for identification.
    pub magic: [u8; 4],
    /// Format version.
    pub version: u32,
    /// Page size of the data file this log belongs to.
    pub page_size: u32,
    /// LSN floor carried across truncation.
    pub base_lsn: Lsn,
    /// File flags.
    pub flags: u32,
    /// Header checksum.
    pub checksum: u32,
}

impl LogFileHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = FILE_HEADER_SIZE;

    /// Creates a new file header.
    pub fn new(page_size: u32, base_lsn: Lsn) -> Self {
        let mut header = Self {
            magic: FILE_MAGIC,
            version: FILE_VERSION,
            page_size,
            base_lsn,
            flags: 0,
            checksum: 0,
        };
        header.checksum = header.compute_checksum();
        header
    }

    /// Computes the checksum for this header.
    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        crc32fast::hash(&bytes[..Self::SIZE - 4])
    }

    /// Validates this header.
    pub fn validate(&self) -> Result<()> {
        if self.magic != FILE_MAGIC {
            return Err(StrataError::IncompatibleFormat {
                found: format!("{:?}", self.magic),
                supported: format!("{:?}", FILE_MAGIC),
            });
        }
        if self.version != FILE_VERSION {
            return Err(StrataError::IncompatibleFormat {
                found: format!("WAL version {}", self.version),
                supported: format!("WAL version {}", FILE_VERSION),
            });
        }
        if self.checksum != self.compute_checksum() {
            return Err(StrataError::WalCorruption {
                lsn: self.base_lsn.0,
                reason: "file header checksum mismatch".to_string(),
            });
        }
        Ok(())
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut data = [0u8; Self::SIZE];
        data[0..4].copy_from_slice(&self.magic);
        data[4..8].copy_from_slice(&self.version.to_le_bytes());
        data[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        // bytes 12-15 are reserved
        data[16..24].copy_from_slice(&self.base_lsn.0.to_le_bytes());
        data[24..28].copy_from_slice(&self.flags.to_le_bytes());
        data[28..32].copy_from_slice(&self.checksum.to_le_bytes());
        data
    }

    /// Deserializes the header from bytes.
    pub fn from_bytes(data: &[u8; Self::SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[0..4]);

        Self {
            magic,
            version: read_u32(data, 4),
            page_size: read_u32(data, 8),
            base_lsn: Lsn(read_u64(data, 16)),
            flags: read_u32(data, 24),
            checksum: read_u32(data, 28),
        }
    }
}

/// The WAL file.
pub struct LogFile {
    /// Path to the log file.
    path: PathBuf,
    /// File header.
    header: LogFileHeader,
    /// Current end of the file.
    write_offset: u64,
    /// File handle.
    file: File,
}

impl LogFile {
    /// Creates (or replaces) a log file with an empty body.
    pub fn create(path: &Path, page_size: u32, base_lsn: Lsn) -> Result<Self> {
        let header = LogFileHeader::new(page_size, base_lsn);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        file.write_all(&header.to_bytes())?;
        file.sync_all()?;

        Ok(Self {
            path: path.to_path_buf(),
            header,
            write_offset: LogFileHeader::SIZE as u64,
            file,
        })
    }

    /// Opens an existing log file.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header_bytes = [0u8; LogFileHeader::SIZE];
        file.read_exact(&mut header_bytes).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                StrataError::WalCorruption {
                    lsn: 0,
                    reason: "file header truncated".to_string(),
                }
            } else {
                StrataError::Io(e)
            }
        })?;
        let header = LogFileHeader::from_bytes(&header_bytes);
        header.validate()?;

        let write_offset = file.seek(SeekFrom::End(0))?;

        Ok(Self {
            path: path.to_path_buf(),
            header,
            write_offset,
            file,
        })
    }

    /// Returns the file header.
    pub fn header(&self) -> &LogFileHeader {
        &self.header
    }

    /// Returns the path to this log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current end of the file.
    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    /// Appends already-serialized records.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.write_offset))?;
        self.file.write_all(data)?;
        self.write_offset += data.len() as u64;
        Ok(())
    }

    /// Syncs the file to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Reads the whole record area (everything after the header).
    pub fn read_body(&mut self) -> Result<Vec<u8>> {
        let len = self.write_offset.saturating_sub(LogFileHeader::SIZE as u64) as usize;
        let mut body = vec![0u8; len];
        self.file.seek(SeekFrom::Start(LogFileHeader::SIZE as u64))?;
        self.file.read_exact(&mut body)?;
        Ok(body)
    }

    /// Cuts the file at `body_len` bytes past the header.
    pub fn truncate_body(&mut self, body_len: u64) -> Result<()> {
        let new_len = LogFileHeader::SIZE as u64 + body_len;
        self.file.set_len(new_len)?;
        self.file.sync_all()?;
        self.write_offset = new_len;
        Ok(())
    }

    /// Atomically replaces the log with `body` under a new header.
    pub fn replace(&mut self, base_lsn: Lsn, body: &[u8]) -> Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = LogFile::create(&tmp_path, self.header.page_size, base_lsn)?;
            tmp.append(body)?;
            tmp.file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        sync_parent_dir(&self.path);
        *self = LogFile::open(&self.path)?;
        Ok(())
    }

    /// Swaps the handle for a read-only one so later writes fail.
    #[cfg(test)]
    pub(crate) fn reopen_read_only(&mut self) -> Result<()> {
        self.file = File::open(&self.path)?;
        Ok(())
    }
}

/// Persists a rename in `path`'s directory. Returns false if the sync
/// did not happen.
///
/// Some platforms cannot open directories; there the rename is left to the
/// file system and the failure is only logged.
fn sync_parent_dir(path: &Path) -> bool {
    let Some(dir) = path.parent() else {
        return false;
    };
    let synced = File::open(dir).and_then(|d| d.sync_all());
    if let Err(e) = &synced {
        warn!(dir = %dir.display(), error = %e, "Could not sync WAL directory after rename");
    }
    synced.is_ok()
}
