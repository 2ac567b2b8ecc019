//! Page manager: page allocation, the free list, and staged mutations.
//!
//! Every change to the data file goes through a [`PageBatch`]. The batch
//! reads through to the buffer pool and keeps modified pages (and a copy
//! of the header page) to itself. Once the caller has logged the batch's
//! page images, [`PageManager::install`] publishes them into the pool
//! stamped with the record's LSN. Dropping a batch instead discards the
//! change without a trace.

use crate::btree::node::Node;
use crate::disk::DiskManager;
use crate::header::DatabaseHeader;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_buffer::{BufferPool, BufferPoolConfig, BufferPoolStats, PageReadGuard};
use strata_common::page::read_u16;
use strata_common::{
    LogDurability, Lsn, PageHeader, PageId, PageKind, Result, StorageConfig, StrataError,
};
use strata_wal::PageImage;
use tracing::{debug, info, warn};

/// Owns the data file, the shared page cache, and the header page.
pub struct PageManager {
    /// Data file.
    disk: Arc<DiskManager>,
    /// Shared page cache.
    pool: BufferPool,
    /// Header as of the last installed change.
    header: RwLock<DatabaseHeader>,
    /// Page size in bytes.
    page_size: usize,
    /// Upper bound on `page_count`.
    max_pages: Option<u32>,
}

impl PageManager {
    /// Opens the data file, creating it with an empty tree if it has no pages.
    ///
    /// `fallback_header` is the newest logged image of page 0 and the LSN
    /// of its record. It replaces a header page that fails verification
    /// (a torn write), since recovery would restore that image anyway.
    pub fn open(
        config: &StorageConfig,
        log: Arc<dyn LogDurability>,
        fallback_header: Option<(Lsn, Bytes)>,
    ) -> Result<Self> {
        config.validate()?;
        let disk = Arc::new(DiskManager::open(config)?);

        let header = if disk.num_pages() == 0 {
            Self::bootstrap(&disk, config)?
        } else {
            Self::read_header(&disk, fallback_header)?
        };

        if header.page_size as usize != config.page_size {
            return Err(StrataError::IncompatibleFormat {
                found: format!("page size {}", header.page_size),
                supported: format!("page size {}", config.page_size),
            });
        }
        if header.order as usize != config.order {
            debug!(
                stored = header.order,
                configured = config.order,
                "Using the order the file was created with"
            );
        }

        let pool = BufferPool::new(BufferPoolConfig::from_storage(config), disk.clone(), log);

        Ok(Self {
            disk,
            pool,
            header: RwLock::new(header),
            page_size: config.page_size,
            max_pages: config.max_pages,
        })
    }

    /// Writes the header page and an empty root leaf to a new file.
    fn bootstrap(disk: &DiskManager, config: &StorageConfig) -> Result<DatabaseHeader> {
        let root = PageId(1);
        let header = DatabaseHeader::new(config, root);
        let leaf = Node::Leaf(Default::default()).encode(root, config.page_size)?;

        disk.write_page(root, &leaf)?;
        disk.write_page(PageId::HEADER, &header.encode(config.page_size))?;
        disk.sync()?;
        info!(path = %disk.path().display(), page_size = config.page_size, order = config.order, "Created data file");
        Ok(header)
    }

    /// Reads and decodes page 0, repairing it from the log when torn.
    fn read_header(
        disk: &DiskManager,
        fallback: Option<(Lsn, Bytes)>,
    ) -> Result<DatabaseHeader> {
        let mut page = vec![0u8; disk.page_size()];
        match disk.read_page(PageId::HEADER, &mut page) {
            Ok(()) => DatabaseHeader::decode(&page),
            Err(StrataError::PageCorrupted { reason, .. }) => {
                // Decode first so a foreign file reports IncompatibleFormat.
                DatabaseHeader::decode(&page)?;
                let Some((lsn, image)) = fallback else {
                    return Err(StrataError::UnrecoverableState(format!(
                        "header page is corrupt ({}) and the log holds no copy",
                        reason
                    )));
                };
                warn!(reason = %reason, lsn = %lsn, "Restoring torn header page from the log");
                let mut repaired = image.to_vec();
                PageHeader::stamp_lsn(&mut repaired, lsn);
                disk.write_page(PageId::HEADER, &repaired)?;
                disk.sync()?;
                DatabaseHeader::decode(&repaired)
            }
            Err(StrataError::PageNotFound { .. }) => Err(StrataError::IncompatibleFormat {
                found: "file shorter than one page".to_string(),
                supported: "Strata data file".to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Returns the header as of the last installed change.
    pub fn header(&self) -> DatabaseHeader {
        *self.header.read()
    }

    /// Returns the page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns buffer pool statistics.
    pub fn pool_stats(&self) -> BufferPoolStats {
        self.pool.stats()
    }

    /// Pins a page for reading.
    pub fn read_page(&self, page_id: PageId) -> Result<PageReadGuard<'_>> {
        self.pool.fetch_page(page_id)
    }

    /// Reads and decodes a tree page.
    pub fn read_node(&self, page_id: PageId) -> Result<Node> {
        Ok(self.read_node_with_lsn(page_id)?.0)
    }

    /// Reads a tree page together with its page LSN.
    pub fn read_node_with_lsn(&self, page_id: PageId) -> Result<(Node, Lsn)> {
        let page = self.pool.fetch_page(page_id)?;
        let data = page.data();
        Ok((Node::decode(page_id, &data)?, page.page_lsn()))
    }

    /// Returns the LSN stamped on a page.
    pub fn page_lsn(&self, page_id: PageId) -> Result<Lsn> {
        Ok(self.pool.fetch_page(page_id)?.page_lsn())
    }

    /// Starts a staged mutation.
    pub fn batch(&self) -> PageBatch<'_> {
        PageBatch {
            pager: self,
            header: self.header(),
            header_dirty: false,
            pages: BTreeMap::new(),
        }
    }

    /// Publishes logged changes into the page cache.
    pub fn install(&self, changes: StagedChanges, lsn: Lsn) -> Result<()> {
        for image in &changes.images {
            let mut page = image.data.to_vec();
            PageHeader::stamp_lsn(&mut page, lsn);
            self.pool.install(image.page_id, &page, lsn)?;
        }
        *self.header.write() = changes.header;
        Ok(())
    }

    /// Reapplies logged page images whose page is older than `lsn`.
    ///
    /// A page that is missing or fails verification counts as older than
    /// any record. Returns the number of pages rewritten.
    pub fn redo(&self, images: &[PageImage], lsn: Lsn) -> Result<usize> {
        let mut applied = 0;
        for image in images {
            let current = match self.pool.fetch_page(image.page_id) {
                Ok(page) => Some(page.page_lsn()),
                Err(StrataError::PageCorrupted { .. } | StrataError::PageNotFound { .. }) => None,
                Err(e) => return Err(e),
            };
            if current.is_some_and(|page_lsn| page_lsn >= lsn) {
                continue;
            }

            let mut page = image.data.to_vec();
            PageHeader::stamp_lsn(&mut page, lsn);
            self.pool.install(image.page_id, &page, lsn)?;
            if image.page_id == PageId::HEADER {
                *self.header.write() = DatabaseHeader::decode(&page)?;
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Writes every dirty page back and syncs the data file.
    pub fn flush_all(&self) -> Result<usize> {
        let flushed = self.pool.flush_all()?;
        self.disk.sync()?;
        Ok(flushed)
    }
}

/// Page images and header produced by a finished batch.
#[derive(Debug)]
pub struct StagedChanges {
    images: Vec<PageImage>,
    header: DatabaseHeader,
}

impl StagedChanges {
    /// Returns true if the batch changed nothing.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Returns the after-images of every modified page.
    pub fn images(&self) -> &[PageImage] {
        &self.images
    }

    /// Returns the header after the change.
    pub fn header(&self) -> &DatabaseHeader {
        &self.header
    }

    /// Page a log record for this change is filed under.
    pub fn primary_page(&self) -> PageId {
        self.images
            .iter()
            .map(|i| i.page_id)
            .find(|p| *p != PageId::HEADER)
            .unwrap_or(PageId::HEADER)
    }
}

/// A staged mutation of the data file.
pub struct PageBatch<'a> {
    pager: &'a PageManager,
    header: DatabaseHeader,
    header_dirty: bool,
    pages: BTreeMap<PageId, Vec<u8>>,
}

impl<'a> PageBatch<'a> {
    /// Returns the staged header.
    pub fn header(&self) -> &DatabaseHeader {
        &self.header
    }

    /// Returns the staged header for modification.
    pub fn header_mut(&mut self) -> &mut DatabaseHeader {
        self.header_dirty = true;
        &mut self.header
    }

    /// Returns a copy of a page, staged version first.
    fn page_bytes(&self, page_id: PageId) -> Result<Vec<u8>> {
        if let Some(page) = self.pages.get(&page_id) {
            return Ok(page.clone());
        }
        let page = self.pager.pool.fetch_page(page_id)?;
        let data = page.data();
        Ok(data.to_vec())
    }

    /// Reads and decodes a tree page, staged version first.
    pub fn read_node(&self, page_id: PageId) -> Result<Node> {
        if let Some(page) = self.pages.get(&page_id) {
            return Node::decode(page_id, page);
        }
        self.pager.read_node(page_id)
    }

    /// Stages a tree page.
    pub fn write_node(&mut self, page_id: PageId, node: &Node) -> Result<()> {
        if page_id == PageId::HEADER {
            return Err(StrataError::Internal("tree node written to page 0".to_string()));
        }
        let page = node.encode(page_id, self.pager.page_size)?;
        self.pages.insert(page_id, page);
        Ok(())
    }

    /// Allocates a page, reusing the free list head or growing the file.
    ///
    /// The caller must write the page before finishing the batch.
    pub fn allocate(&mut self) -> Result<PageId> {
        if let Some(head) = self.header.free_list_head {
            let page = self.page_bytes(head)?;
            let free = PageHeader::from_bytes(&page)?;
            if free.kind != PageKind::Free {
                return Err(StrataError::TreeCorrupted(format!(
                    "free list head {} is a {:?} page",
                    head, free.kind
                )));
            }
            self.header_mut().free_list_head = PageId::from_link(free.link);
            return Ok(head);
        }

        let page_count = self.header.page_count;
        if self.pager.max_pages.is_some_and(|max| page_count >= max) || page_count == u32::MAX {
            return Err(StrataError::StorageFull { page_count });
        }
        self.header_mut().page_count = page_count + 1;
        Ok(PageId(page_count))
    }

    /// Pushes a page onto the free list. Its payload is left intact.
    pub fn free(&mut self, page_id: PageId) -> Result<()> {
        if page_id == PageId::HEADER || page_id.0 >= self.header.page_count {
            return Err(StrataError::Internal(format!("cannot free {}", page_id)));
        }
        let mut page = self
            .page_bytes(page_id)
            .unwrap_or_else(|_| vec![0u8; self.pager.page_size]);

        let mut header = PageHeader::new(page_id, PageKind::Free);
        header.entry_count = read_u16(&page, 14);
        header.link = PageId::to_link(self.header.free_list_head);
        header.write_to(&mut page);

        self.pages.insert(page_id, page);
        self.header_mut().free_list_head = Some(page_id);
        Ok(())
    }

    /// Ends the batch, returning the after-images to log and install.
    pub fn finish(self) -> StagedChanges {
        let mut images = Vec::with_capacity(self.pages.len() + 1);
        if self.header_dirty {
            images.push(PageImage {
                page_id: PageId::HEADER,
                data: Bytes::from(self.header.encode(self.pager.page_size)),
            });
        }
        images.extend(self.pages.into_iter().map(|(page_id, data)| PageImage {
            page_id,
            data: Bytes::from(data),
        }));
        StagedChanges {
            images,
            header: self.header,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::LeafNode;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::{tempdir, TempDir};

    /// Log that is always durable up to whatever was asked for.
    #[derive(Default)]
    struct SyncedLog(AtomicU64);

    impl LogDurability for SyncedLog {
        fn durable_lsn(&self) -> Lsn {
            Lsn(self.0.load(Ordering::SeqCst))
        }

        fn force(&self) -> Result<Lsn> {
            self.0.store(u64::MAX, Ordering::SeqCst);
            Ok(Lsn(u64::MAX))
        }
    }

    fn test_config(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            data_path: dir.path().join("test.db"),
            page_size: 4096,
            order: 4,
            buffer_pool_pages: 16,
            fsync_enabled: false,
            ..Default::default()
        }
    }

    fn open(config: &StorageConfig) -> PageManager {
        PageManager::open(config, Arc::new(SyncedLog::default()), None).unwrap()
    }

    fn leaf(key: &str) -> Node {
        Node::Leaf(LeafNode {
            entries: vec![(Bytes::from(key.to_string()), Bytes::from_static(b"v"))],
            next: None,
        })
    }

    #[test]
    fn test_pager_bootstrap() {
        let dir = tempdir().unwrap();
        let pager = open(&test_config(&dir));

        let header = pager.header();
        assert_eq!(header.root_page_id, PageId(1));
        assert_eq!(header.page_count, 2);
        assert_eq!(
            pager.read_node(PageId(1)).unwrap(),
            Node::Leaf(LeafNode::default())
        );
    }

    #[test]
    fn test_pager_dropped_batch_changes_nothing() {
        let dir = tempdir().unwrap();
        let pager = open(&test_config(&dir));

        {
            let mut batch = pager.batch();
            let page = batch.allocate().unwrap();
            batch.write_node(page, &leaf("x")).unwrap();
        }

        assert_eq!(pager.header().page_count, 2);
        assert!(pager.read_node(PageId(2)).is_err());
    }

    #[test]
    fn test_pager_install_and_persist() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);
        {
            let pager = open(&config);
            let mut batch = pager.batch();
            let page = batch.allocate().unwrap();
            assert_eq!(page, PageId(2));
            batch.write_node(page, &leaf("x")).unwrap();
            let changes = batch.finish();
            assert_eq!(changes.images().len(), 2);
            assert_eq!(changes.primary_page(), PageId(2));

            pager.install(changes, Lsn(7)).unwrap();
            assert_eq!(pager.page_lsn(page).unwrap(), Lsn(7));
            assert_eq!(pager.flush_all().unwrap(), 2);
        }

        let pager = open(&config);
        assert_eq!(pager.header().page_count, 3);
        assert_eq!(pager.read_node(PageId(2)).unwrap(), leaf("x"));
        assert_eq!(pager.page_lsn(PageId(0)).unwrap(), Lsn(7));
    }

    #[test]
    fn test_pager_free_list_reuse() {
        let dir = tempdir().unwrap();
        let pager = open(&test_config(&dir));

        let mut batch = pager.batch();
        let a = batch.allocate().unwrap();
        let b = batch.allocate().unwrap();
        batch.write_node(a, &leaf("a")).unwrap();
        batch.write_node(b, &leaf("b")).unwrap();
        pager.install(batch.finish(), Lsn(1)).unwrap();

        let mut batch = pager.batch();
        batch.free(a).unwrap();
        batch.free(b).unwrap();
        pager.install(batch.finish(), Lsn(2)).unwrap();
        assert_eq!(pager.header().free_list_head, Some(b));

        // LIFO reuse, no file growth
        let mut batch = pager.batch();
        assert_eq!(batch.allocate().unwrap(), b);
        assert_eq!(batch.allocate().unwrap(), a);
        assert_eq!(batch.header().free_list_head, None);
        assert_eq!(batch.header().page_count, 4);
    }

    #[test]
    fn test_pager_freed_page_keeps_payload() {
        let dir = tempdir().unwrap();
        let pager = open(&test_config(&dir));

        let mut batch = pager.batch();
        batch.free(PageId(1)).unwrap();
        let changes = batch.finish();
        let image = changes
            .images()
            .iter()
            .find(|i| i.page_id == PageId(1))
            .unwrap();
        let header = PageHeader::from_bytes(&image.data).unwrap();
        assert_eq!(header.kind, PageKind::Free);
        assert_eq!(header.link, 0);
    }

    #[test]
    fn test_pager_storage_full() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            max_pages: Some(3),
            ..test_config(&dir)
        };
        let pager = open(&config);

        let mut batch = pager.batch();
        assert_eq!(batch.allocate().unwrap(), PageId(2));
        assert!(matches!(
            batch.allocate(),
            Err(StrataError::StorageFull { page_count: 3 })
        ));
    }

    #[test]
    fn test_pager_redo_is_lsn_guarded() {
        let dir = tempdir().unwrap();
        let pager = open(&test_config(&dir));

        let mut batch = pager.batch();
        batch.write_node(PageId(1), &leaf("new")).unwrap();
        let changes = batch.finish();
        let images = changes.images().to_vec();

        assert_eq!(pager.redo(&images, Lsn(5)).unwrap(), 1);
        assert_eq!(pager.read_node(PageId(1)).unwrap(), leaf("new"));

        // Same or older records are skipped
        assert_eq!(pager.redo(&images, Lsn(5)).unwrap(), 0);
        assert_eq!(pager.redo(&images, Lsn(3)).unwrap(), 0);
        assert_eq!(pager.redo(&images, Lsn(6)).unwrap(), 1);
    }

    #[test]
    fn test_pager_page_size_mismatch() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);
        drop(open(&config));

        let other = StorageConfig {
            page_size: 8192,
            ..config
        };
        assert!(matches!(
            PageManager::open(&other, Arc::new(SyncedLog::default()), None),
            Err(StrataError::IncompatibleFormat { .. })
        ));
    }

    #[test]
    fn test_pager_repairs_torn_header() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);
        let image = {
            let pager = open(&config);
            let mut batch = pager.batch();
            batch.header_mut().entry_count = 42;
            batch.finish().images()[0].data.clone()
        };

        // Tear the header page after its magic
        let mut raw = std::fs::read(&config.data_path).unwrap();
        raw[300] ^= 0xFF;
        std::fs::write(&config.data_path, raw).unwrap();

        assert!(matches!(
            PageManager::open(&config, Arc::new(SyncedLog::default()), None),
            Err(StrataError::UnrecoverableState(_))
        ));

        let pager = PageManager::open(
            &config,
            Arc::new(SyncedLog::default()),
            Some((Lsn(9), image)),
        )
        .unwrap();
        assert_eq!(pager.header().entry_count, 42);
    }
}
