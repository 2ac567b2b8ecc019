//! Buffer pool manager.

use crate::frame::{BufferFrame, FrameId};
use crate::replacer::{ClockReplacer, Replacer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_common::{LogDurability, Lsn, PageHeader, PageId, Result, StorageConfig, StrataError};
use tracing::{debug, trace};

/// Backing store the pool reads missing pages from and writes dirty pages to.
pub trait PageIo: Send + Sync {
    /// Reads one page into `buf`, verifying it.
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()>;

    /// Writes one page image.
    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()>;
}

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
    /// Size of every frame in bytes.
    pub page_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            num_frames: 1024,
            page_size: strata_common::DEFAULT_PAGE_SIZE,
        }
    }
}

impl BufferPoolConfig {
    /// Derives the pool geometry from the storage configuration.
    pub fn from_storage(storage: &StorageConfig) -> Self {
        Self {
            num_frames: storage.buffer_pool_pages,
            page_size: storage.page_size,
        }
    }
}

/// Mapping state guarded by a single lock.
struct PoolState {
    /// Page ID to frame ID mapping.
    page_table: HashMap<PageId, FrameId>,
    /// List of free frame IDs.
    free_list: Vec<FrameId>,
}

/// Buffer pool manager.
///
/// Manages a fixed-size pool of page frames with:
/// - Page ID to frame ID mapping
/// - Free frame list for new pages
/// - Clock replacement for eviction
/// - Pin counting for concurrent access
///
/// A dirty frame is only written back when the log is durable up to the
/// frame's page LSN. When every unpinned frame is dirty and ahead of the
/// log, the pool forces the log once and retries.
pub struct BufferPool {
    /// Configuration.
    config: BufferPoolConfig,
    /// Array of buffer frames.
    frames: Vec<BufferFrame>,
    /// Page table and free list.
    state: Mutex<PoolState>,
    /// Page replacement policy.
    replacer: ClockReplacer,
    /// Data file access.
    io: Arc<dyn PageIo>,
    /// Log durability boundary.
    log: Arc<dyn LogDurability>,
    /// Fetches served from memory.
    hits: AtomicU64,
    /// Fetches that went to disk.
    misses: AtomicU64,
}

impl BufferPool {
    /// Creates a new buffer pool.
    pub fn new(
        config: BufferPoolConfig,
        io: Arc<dyn PageIo>,
        log: Arc<dyn LogDurability>,
    ) -> Self {
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32), config.page_size))
            .collect();

        // All frames start in free list, lowest id popped first
        let free_list: Vec<_> = (0..num_frames).rev().map(|i| FrameId(i as u32)).collect();

        Self {
            config,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::with_capacity(num_frames),
                free_list,
            }),
            replacer: ClockReplacer::new(num_frames),
            io,
            log,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the page size.
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.state.lock().free_list.len()
    }

    /// Returns the number of pages currently in the pool.
    pub fn page_count(&self) -> usize {
        self.state.lock().page_table.len()
    }

    /// Checks if a page is in the buffer pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.state.lock().page_table.contains_key(&page_id)
    }

    #[inline]
    fn frame(&self, frame_id: FrameId) -> &BufferFrame {
        &self.frames[frame_id.0 as usize]
    }

    /// Fetches a page, reading it from disk on a miss.
    ///
    /// The page stays pinned until the returned guard is dropped.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageReadGuard<'_>> {
        let mut state = self.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let frame = self.frame(frame_id);
            frame.pin();
            self.replacer.touch(frame_id);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(PageReadGuard { page_id, frame });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let frame_id = self.acquire_frame(&mut state)?;
        let frame = self.frame(frame_id);

        let loaded = {
            let mut data = frame.data_mut();
            self.io
                .read_page(page_id, &mut data)
                .map(|_| PageHeader::lsn_of(&data))
        };
        let lsn = match loaded {
            Ok(lsn) => lsn,
            Err(e) => {
                frame.clear();
                state.free_list.push(frame_id);
                return Err(e);
            }
        };

        frame.assign(page_id, lsn);
        frame.pin();
        self.replacer.touch(frame_id);
        state.page_table.insert(page_id, frame_id);
        trace!(page_id = %page_id, frame_id = %frame_id, "Page loaded");

        Ok(PageReadGuard { page_id, frame })
    }

    /// Installs a complete page image produced by a logged change.
    ///
    /// The frame is marked dirty with `lsn` as its page LSN. A page not yet
    /// cached is not read from disk first.
    pub fn install(&self, page_id: PageId, image: &[u8], lsn: Lsn) -> Result<()> {
        if image.len() != self.config.page_size {
            return Err(StrataError::Internal(format!(
                "image for {} is {} bytes, expected {}",
                page_id,
                image.len(),
                self.config.page_size
            )));
        }

        let mut state = self.state.lock();
        let frame_id = match state.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => {
                let frame_id = self.acquire_frame(&mut state)?;
                state.page_table.insert(page_id, frame_id);
                frame_id
            }
        };

        self.frame(frame_id).install(page_id, image, lsn);
        self.replacer.touch(frame_id);
        Ok(())
    }

    /// Finds an empty frame, evicting a page if necessary.
    fn acquire_frame(&self, state: &mut PoolState) -> Result<FrameId> {
        if let Some(frame_id) = state.free_list.pop() {
            return Ok(frame_id);
        }

        let mut victim = {
            let durable = self.log.durable_lsn();
            self.replacer.victim(&|f| self.frame(f).evictable(durable))
        };

        if victim.is_none() {
            // Unpinned frames may be blocked only by the log.
            let blocked = self
                .frames
                .iter()
                .any(|f| !f.is_pinned() && f.pending_write().is_some());
            if blocked {
                debug!("Forcing WAL to make dirty pages evictable");
                let durable = self.log.force()?;
                victim = self.replacer.victim(&|f| self.frame(f).evictable(durable));
            }
        }

        let frame_id = victim.ok_or(StrataError::BufferPoolFull)?;
        let frame = self.frame(frame_id);

        if let Some((page_id, lsn)) = frame.pending_write() {
            self.io.write_page(page_id, &frame.data())?;
            trace!(page_id = %page_id, lsn = %lsn, "Evicted dirty page");
        }
        if let Some(old_page_id) = frame.page() {
            state.page_table.remove(&old_page_id);
        }
        self.replacer.forget(frame_id);
        frame.clear();
        Ok(frame_id)
    }

    /// Writes one cached page back if it is dirty.
    ///
    /// Returns true if the page was written.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let state = self.state.lock();
        match state.page_table.get(&page_id) {
            Some(&frame_id) => self.write_back(self.frame(frame_id)),
            None => Ok(false),
        }
    }

    /// Writes every dirty page back.
    ///
    /// Returns the number of pages written.
    pub fn flush_all(&self) -> Result<usize> {
        let state = self.state.lock();

        let mut frame_ids: Vec<_> = state.page_table.iter().map(|(p, f)| (*p, *f)).collect();
        frame_ids.sort_unstable_by_key(|(p, _)| *p);

        let mut flushed = 0;
        for (_, frame_id) in frame_ids {
            if self.write_back(self.frame(frame_id))? {
                flushed += 1;
            }
        }
        debug!(pages = flushed, "Flushed dirty pages");
        Ok(flushed)
    }

    /// Writes a dirty frame, forcing the log first when it is behind.
    fn write_back(&self, frame: &BufferFrame) -> Result<bool> {
        let Some((page_id, lsn)) = frame.pending_write() else {
            return Ok(false);
        };
        if lsn > self.log.durable_lsn() {
            self.log.force()?;
        }
        self.io.write_page(page_id, &frame.data())?;
        frame.mark_clean();
        Ok(true)
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let state = self.state.lock();
        let mut pinned_frames = 0;
        let mut dirty_frames = 0;

        for &frame_id in state.page_table.values() {
            let frame = self.frame(frame_id);
            if frame.is_pinned() {
                pinned_frames += 1;
            }
            if frame.is_dirty() {
                dirty_frames += 1;
            }
        }

        BufferPoolStats {
            total_frames: self.config.num_frames,
            free_frames: state.free_list.len(),
            used_frames: state.page_table.len(),
            pinned_frames,
            dirty_frames,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
    /// Fetches served from memory.
    pub hits: u64,
    /// Fetches that read from disk.
    pub misses: u64,
}

/// RAII guard for reading a pinned page.
pub struct PageReadGuard<'a> {
    page_id: PageId,
    frame: &'a BufferFrame,
}

impl<'a> PageReadGuard<'a> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the LSN of the last change applied to the page.
    pub fn page_lsn(&self) -> Lsn {
        self.frame.page_lsn()
    }

    /// Returns the page data.
    pub fn data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8]>> {
        self.frame.data()
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        self.frame.unpin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const PAGE: usize = 512;

    #[derive(Default)]
    struct MemIo {
        pages: Mutex<HashMap<PageId, Vec<u8>>>,
        writes: AtomicUsize,
    }

    impl PageIo for MemIo {
        fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
            match self.pages.lock().get(&page_id) {
                Some(data) => {
                    buf.copy_from_slice(data);
                    Ok(())
                }
                None => Err(StrataError::PageNotFound { page_id: page_id.0 }),
            }
        }

        fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.pages.lock().insert(page_id, data.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeLog {
        durable: AtomicU64,
        appended: AtomicU64,
        forces: AtomicUsize,
    }

    impl LogDurability for FakeLog {
        fn durable_lsn(&self) -> Lsn {
            Lsn(self.durable.load(Ordering::SeqCst))
        }

        fn force(&self) -> Result<Lsn> {
            self.forces.fetch_add(1, Ordering::SeqCst);
            let appended = self.appended.load(Ordering::SeqCst);
            self.durable.store(appended, Ordering::SeqCst);
            Ok(Lsn(appended))
        }
    }

    fn create_test_pool(num_frames: usize) -> (BufferPool, Arc<MemIo>, Arc<FakeLog>) {
        let io = Arc::new(MemIo::default());
        let log = Arc::new(FakeLog::default());
        let pool = BufferPool::new(
            BufferPoolConfig {
                num_frames,
                page_size: PAGE,
            },
            io.clone(),
            log.clone(),
        );
        (pool, io, log)
    }

    fn image(fill: u8, lsn: Lsn) -> Vec<u8> {
        let mut data = vec![fill; PAGE];
        PageHeader::stamp_lsn(&mut data, lsn);
        data
    }

    #[test]
    fn test_buffer_pool_new() {
        let (pool, _, _) = create_test_pool(10);

        assert_eq!(pool.num_frames(), 10);
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn test_buffer_pool_fetch_from_disk() {
        let (pool, io, _) = create_test_pool(4);
        io.pages.lock().insert(PageId(3), image(7, Lsn(5)));

        {
            let page = pool.fetch_page(PageId(3)).unwrap();
            assert_eq!(page.data()[100], 7);
            assert_eq!(page.page_lsn(), Lsn(5));
        }
        assert!(pool.contains(PageId(3)));

        pool.fetch_page(PageId(3)).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.pinned_frames, 0);
    }

    #[test]
    fn test_buffer_pool_fetch_missing_page() {
        let (pool, _, _) = create_test_pool(4);

        assert!(matches!(
            pool.fetch_page(PageId(9)),
            Err(StrataError::PageNotFound { page_id: 9 })
        ));
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_buffer_pool_install_marks_dirty() {
        let (pool, io, log) = create_test_pool(4);
        log.appended.store(10, Ordering::SeqCst);

        pool.install(PageId(1), &image(1, Lsn(10)), Lsn(10)).unwrap();
        assert_eq!(pool.stats().dirty_frames, 1);
        assert_eq!(io.writes.load(Ordering::SeqCst), 0);

        // Page LSN is ahead of the durable log; flushing forces the log first
        assert_eq!(pool.flush_all().unwrap(), 1);
        assert_eq!(log.forces.load(Ordering::SeqCst), 1);
        assert_eq!(io.pages.lock()[&PageId(1)][100], 1);
        assert_eq!(pool.stats().dirty_frames, 0);
    }

    #[test]
    fn test_buffer_pool_evicts_clean_before_forcing() {
        let (pool, io, log) = create_test_pool(2);
        io.pages.lock().insert(PageId(1), image(1, Lsn(1)));
        log.appended.store(50, Ordering::SeqCst);

        pool.fetch_page(PageId(1)).unwrap();
        pool.install(PageId(2), &image(2, Lsn(50)), Lsn(50)).unwrap();

        // Pool is full; the clean page goes, the unlogged dirty page stays
        pool.install(PageId(3), &image(3, Lsn(50)), Lsn(50)).unwrap();
        assert!(!pool.contains(PageId(1)));
        assert!(pool.contains(PageId(2)));
        assert_eq!(log.forces.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_buffer_pool_wal_first_eviction() {
        let (pool, io, log) = create_test_pool(2);
        log.appended.store(20, Ordering::SeqCst);

        pool.install(PageId(1), &image(1, Lsn(10)), Lsn(10)).unwrap();
        pool.install(PageId(2), &image(2, Lsn(20)), Lsn(20)).unwrap();
        assert_eq!(log.durable_lsn(), Lsn::INVALID);

        // Every frame is dirty and ahead of the log: force, then evict
        pool.install(PageId(3), &image(3, Lsn(20)), Lsn(20)).unwrap();
        assert_eq!(log.forces.load(Ordering::SeqCst), 1);
        assert_eq!(io.writes.load(Ordering::SeqCst), 1);

        // The written page can be read back after eviction
        let evicted = if pool.contains(PageId(1)) { PageId(2) } else { PageId(1) };
        let page = pool.fetch_page(evicted).unwrap();
        assert_eq!(page.data()[100], evicted.0 as u8);
    }

    #[test]
    fn test_buffer_pool_full_when_all_pinned() {
        let (pool, io, _) = create_test_pool(2);
        io.pages.lock().insert(PageId(1), image(1, Lsn(1)));
        io.pages.lock().insert(PageId(2), image(2, Lsn(1)));
        io.pages.lock().insert(PageId(3), image(3, Lsn(1)));

        let _a = pool.fetch_page(PageId(1)).unwrap();
        let _b = pool.fetch_page(PageId(2)).unwrap();

        assert!(matches!(
            pool.fetch_page(PageId(3)),
            Err(StrataError::BufferPoolFull)
        ));
    }

    #[test]
    fn test_buffer_pool_install_rejects_wrong_size() {
        let (pool, _, _) = create_test_pool(2);
        assert!(pool.install(PageId(1), &[0u8; 10], Lsn(1)).is_err());
    }

    #[test]
    fn test_buffer_pool_flush_page() {
        let (pool, io, log) = create_test_pool(4);
        log.durable.store(5, Ordering::SeqCst);

        pool.install(PageId(1), &image(4, Lsn(5)), Lsn(5)).unwrap();
        assert!(pool.flush_page(PageId(1)).unwrap());
        assert!(!pool.flush_page(PageId(1)).unwrap());
        assert!(!pool.flush_page(PageId(2)).unwrap());
        assert_eq!(io.writes.load(Ordering::SeqCst), 1);
        assert_eq!(log.forces.load(Ordering::SeqCst), 0);
    }
}
