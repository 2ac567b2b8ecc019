//! Disk manager for page-level file I/O.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use strata_buffer::PageIo;
use strata_common::page::{seal_page, verify_page};
use strata_common::{PageId, Result, StorageConfig, StrataError};

/// Reads and writes fixed-size pages of the single data file.
///
/// Pages are sealed with a checksum on write and verified on read.
pub struct DiskManager {
    /// Path to the data file.
    path: PathBuf,
    /// Page size in bytes.
    page_size: usize,
    /// Enable fsync in `sync`.
    fsync_enabled: bool,
    /// File handle.
    file: Mutex<File>,
    /// Number of whole pages in the file.
    num_pages: AtomicU32,
}

impl DiskManager {
    /// Opens or creates the data file.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        if let Some(dir) = config.data_path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config.data_path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / config.page_size as u64) as u32;

        Ok(Self {
            path: config.data_path.clone(),
            page_size: config.page_size,
            fsync_enabled: config.fsync_enabled,
            file: Mutex::new(file),
            num_pages: AtomicU32::new(num_pages),
        })
    }

    /// Returns the data file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the number of pages in the file.
    pub fn num_pages(&self) -> u32 {
        self.num_pages.load(Ordering::Acquire)
    }

    /// Reads a page from disk into `buf`, verifying its checksum and id.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        if page_id.0 >= self.num_pages() {
            return Err(StrataError::PageNotFound { page_id: page_id.0 });
        }

        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(page_id.offset(self.page_size)))?;
            file.read_exact(&mut buf[..self.page_size])?;
        }

        verify_page(page_id, &buf[..self.page_size])
    }

    /// Writes a page to disk, sealing its checksum.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        let mut sealed = data[..self.page_size].to_vec();
        seal_page(&mut sealed);

        let mut file = self.file.lock();
        let num_pages = self.num_pages();
        file.seek(SeekFrom::Start(page_id.offset(self.page_size)))
            .and_then(|_| file.write_all(&sealed))
            .map_err(|e| StrataError::from_io(e, num_pages))?;

        // Update page count if we extended the file
        if page_id.0 >= num_pages {
            self.num_pages.store(page_id.0 + 1, Ordering::Release);
        }
        Ok(())
    }

    /// Flushes written pages to stable storage.
    pub fn sync(&self) -> Result<()> {
        if self.fsync_enabled {
            self.file.lock().sync_data()?;
        }
        Ok(())
    }
}

impl PageIo for DiskManager {
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        DiskManager::read_page(self, page_id, buf)
    }

    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        DiskManager::write_page(self, page_id, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::{PageHeader, PageKind};
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> StorageConfig {
        StorageConfig {
            data_path: dir.join("test.db"),
            page_size: 4096,
            fsync_enabled: false,
            ..Default::default()
        }
    }

    fn page(page_id: PageId, fill: u8) -> Vec<u8> {
        let mut data = vec![fill; 4096];
        PageHeader::new(page_id, PageKind::Leaf).write_to(&mut data);
        data
    }

    #[test]
    fn test_disk_manager_write_read() {
        let dir = tempdir().unwrap();
        let disk = DiskManager::open(&test_config(dir.path())).unwrap();
        assert_eq!(disk.num_pages(), 0);

        disk.write_page(PageId(0), &page(PageId(0), 1)).unwrap();
        disk.write_page(PageId(1), &page(PageId(1), 2)).unwrap();
        assert_eq!(disk.num_pages(), 2);

        let mut buf = vec![0u8; 4096];
        disk.read_page(PageId(1), &mut buf).unwrap();
        assert_eq!(buf[100], 2);
    }

    #[test]
    fn test_disk_manager_reopen() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let disk = DiskManager::open(&config).unwrap();
            for i in 0..5 {
                disk.write_page(PageId(i), &page(PageId(i), i as u8)).unwrap();
            }
            disk.sync().unwrap();
        }

        let disk = DiskManager::open(&config).unwrap();
        assert_eq!(disk.num_pages(), 5);
        let mut buf = vec![0u8; 4096];
        disk.read_page(PageId(3), &mut buf).unwrap();
        assert_eq!(buf[4000], 3);
    }

    #[test]
    fn test_disk_manager_missing_page() {
        let dir = tempdir().unwrap();
        let disk = DiskManager::open(&test_config(dir.path())).unwrap();
        let mut buf = vec![0u8; 4096];
        assert!(matches!(
            disk.read_page(PageId(3), &mut buf),
            Err(StrataError::PageNotFound { page_id: 3 })
        ));
    }

    #[test]
    fn test_disk_manager_detects_corruption() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let disk = DiskManager::open(&config).unwrap();
            disk.write_page(PageId(0), &page(PageId(0), 9)).unwrap();
        }

        // Flip a byte in the payload
        let mut raw = std::fs::read(&config.data_path).unwrap();
        raw[2000] ^= 0xFF;
        std::fs::write(&config.data_path, raw).unwrap();

        let disk = DiskManager::open(&config).unwrap();
        let mut buf = vec![0u8; 4096];
        assert!(matches!(
            disk.read_page(PageId(0), &mut buf),
            Err(StrataError::PageCorrupted { page_id: 0, .. })
        ));
    }

    #[test]
    fn test_disk_manager_hole_is_corrupt() {
        let dir = tempdir().unwrap();
        let disk = DiskManager::open(&test_config(dir.path())).unwrap();
        disk.write_page(PageId(2), &page(PageId(2), 1)).unwrap();

        // Page 1 was never written; the file hole reads as zeros
        let mut buf = vec![0u8; 4096];
        assert!(matches!(
            disk.read_page(PageId(1), &mut buf),
            Err(StrataError::PageCorrupted { .. })
        ));
    }
}
