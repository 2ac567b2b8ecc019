//! Page frames.
//!
//! A frame holds the image of one page plus what the pool needs to decide
//! whether it may be reused: the pin count, the dirty flag and the LSN of
//! the last logged change installed in it.

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU32, Ordering};
use strata_common::{Lsn, PageId};

/// Index of a frame in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// Which page a frame holds and in what state.
#[derive(Debug, Clone, Copy, Default)]
struct Residency {
    page: Option<PageId>,
    dirty: bool,
    lsn: Lsn,
}

/// One slot of the buffer pool.
pub struct BufferFrame {
    id: FrameId,
    pins: AtomicU32,
    resident: Mutex<Residency>,
    data: RwLock<Box<[u8]>>,
}

impl BufferFrame {
    pub fn new(id: FrameId, page_size: usize) -> Self {
        Self {
            id,
            pins: AtomicU32::new(0),
            resident: Mutex::new(Residency::default()),
            data: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
        }
    }

    #[inline]
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// The page held, or None for an unused frame.
    #[inline]
    pub fn page(&self) -> Option<PageId> {
        self.resident.lock().page
    }

    #[inline]
    pub fn page_lsn(&self) -> Lsn {
        self.resident.lock().lsn
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.resident.lock().dirty
    }

    #[inline]
    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one pin. Returns the pins left.
    pub fn unpin(&self) -> u32 {
        let prev = self
            .pins
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    /// Records that the frame now holds `page` as read from disk.
    pub fn assign(&self, page: PageId, lsn: Lsn) {
        *self.resident.lock() = Residency {
            page: Some(page),
            dirty: false,
            lsn,
        };
    }

    /// Replaces the frame's content with the image of a logged change.
    pub fn install(&self, page: PageId, image: &[u8], lsn: Lsn) {
        let mut data = self.data.write();
        let len = image.len().min(data.len());
        data[..len].copy_from_slice(&image[..len]);
        *self.resident.lock() = Residency {
            page: Some(page),
            dirty: true,
            lsn,
        };
    }

    /// True if the frame can be handed to another page with the log
    /// durable up to `durable`.
    ///
    /// A dirty frame qualifies only once its last change is durable, so
    /// writing it back can never get ahead of the log.
    pub fn evictable(&self, durable: Lsn) -> bool {
        if self.is_pinned() {
            return false;
        }
        let resident = self.resident.lock();
        resident.page.is_some() && (!resident.dirty || resident.lsn <= durable)
    }

    /// The page and page LSN to write back, or None if the frame is clean.
    pub fn pending_write(&self) -> Option<(PageId, Lsn)> {
        let resident = self.resident.lock();
        match resident.page {
            Some(page) if resident.dirty => Some((page, resident.lsn)),
            _ => None,
        }
    }

    pub fn mark_clean(&self) {
        self.resident.lock().dirty = false;
    }

    #[inline]
    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    #[inline]
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    /// Returns the frame to the unused state.
    pub fn clear(&self) {
        self.pins.store(0, Ordering::Release);
        *self.resident.lock() = Residency::default();
        self.data.write().fill(0);
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let resident = *self.resident.lock();
        f.debug_struct("BufferFrame")
            .field("id", &self.id)
            .field("page", &resident.page)
            .field("dirty", &resident.dirty)
            .field("lsn", &resident.lsn)
            .field("pins", &self.pins.load(Ordering::Relaxed))
            .finish()
    }
}
