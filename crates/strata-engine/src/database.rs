//! The database: one data file, one log, and the state built over them.
//!
//! Opening runs recovery in three passes. Analysis reads the verified log
//! prefix and works out which transactions never finished. Redo replays
//! logged page images newer than the pages on disk. Undo restores the keys
//! the unfinished transactions touched and writes an abort for each. A
//! checkpoint then makes the recovered state the new starting point.

use bytes::Bytes;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use strata_common::{EngineConfig, LogDurability, Lsn, PageId, Result, StrataError, TxnId};
use strata_planner::{
    CompiledPlan, PlanCache, PlanCacheStats, StatisticsCollector, TableDef, TableStatistics,
};
use strata_storage::{BTree, PageManager, RangeCursor};
use strata_txn::TransactionManager;
use strata_wal::{CheckpointPayload, PageImage, RecoveryManager, WalWriter};
use tracing::{error, info};

/// What opening the database had to repair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Verified records read from the log.
    pub records_scanned: usize,
    /// True if an incomplete tail was cut off the log.
    pub tail_truncated: bool,
    /// Pages rewritten from logged images.
    pub pages_redone: usize,
    /// Transactions rolled back because they never finished.
    pub losers: usize,
    /// Keys restored while rolling them back.
    pub keys_restored: usize,
}

/// Outcome of a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointReport {
    pub lsn: Lsn,
    pub pages_flushed: usize,
    pub records_truncated: usize,
    pub active_transactions: usize,
}

/// An open database.
pub struct Database {
    config: EngineConfig,
    txns: TransactionManager,
    plan_cache: PlanCache<CompiledPlan>,
    statistics: StatisticsCollector,
    recovery: RecoveryReport,
    closed: AtomicBool,
}

impl Database {
    /// Opens the database described by `config`, creating the data file
    /// and log if they don't exist, and recovers it.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let started = Instant::now();
        let page_size = config.storage.page_size;

        // Analysis
        let (wal, scan) = WalWriter::open(config.wal.clone(), page_size as u32)?;
        let wal = Arc::new(wal);
        let mut report = RecoveryReport {
            records_scanned: scan.records.len(),
            tail_truncated: scan.has_torn_tail(),
            ..Default::default()
        };
        let plan = RecoveryManager::analyze(scan.records)?;

        // Redo
        let mut logged = Vec::with_capacity(plan.redo.len());
        for record in &plan.redo {
            logged.push((record.lsn, PageImage::decode_all(&record.redo)?));
        }
        let fallback_header = logged.iter().rev().find_map(|(lsn, images)| {
            images
                .iter()
                .find(|image| image.page_id == PageId::HEADER)
                .map(|image| (*lsn, image.data.clone()))
        });
        let pager = PageManager::open(
            &config.storage,
            wal.clone() as Arc<dyn LogDurability>,
            fallback_header,
        )?;
        for (lsn, images) in &logged {
            report.pages_redone += pager.redo(images, *lsn)?;
        }

        let tree = Arc::new(BTree::new(Arc::new(pager), wal, &config.storage));
        validate_root(&tree)?;

        // Undo
        let txns = TransactionManager::new(tree, &config.txn, plan.max_txn_id.next());
        report.losers = plan.losers.len();
        report.keys_restored = txns.undo_losers(&plan.undo, &plan.losers)?;

        let db = Self {
            plan_cache: PlanCache::new(config.plan_cache.clone()),
            statistics: StatisticsCollector::new(config.statistics.clone()),
            config,
            txns,
            recovery: report,
            closed: AtomicBool::new(false),
        };
        db.checkpoint_inner()?;

        info!(
            path = %db.config.storage.data_path.display(),
            records = db.recovery.records_scanned,
            tail_truncated = db.recovery.tail_truncated,
            pages_redone = db.recovery.pages_redone,
            losers = db.recovery.losers,
            keys_restored = db.recovery.keys_restored,
            entries = db.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Database opened"
        );
        Ok(db)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// What recovery did when this database was opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    fn tree(&self) -> &Arc<BTree> {
        self.txns.tree()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StrataError::DatabaseClosed)
        } else {
            Ok(())
        }
    }

    // Transactions

    pub fn begin(&self) -> Result<TxnId> {
        self.ensure_open()?;
        self.txns.begin()
    }

    pub fn commit(&self, txn_id: TxnId) -> Result<()> {
        self.ensure_open()?;
        self.txns.commit(txn_id)
    }

    pub fn rollback(&self, txn_id: TxnId) -> Result<()> {
        self.ensure_open()?;
        self.txns.rollback(txn_id)
    }

    pub fn txn_insert(&self, txn_id: TxnId, key: &[u8], value: &[u8]) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        self.txns.insert(
            txn_id,
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(value),
        )
    }

    pub fn txn_search(&self, txn_id: TxnId, key: &[u8]) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        self.txns.search(txn_id, key)
    }

    pub fn txn_delete(&self, txn_id: TxnId, key: &[u8]) -> Result<Bytes> {
        self.ensure_open()?;
        self.txns.delete(txn_id, key)
    }

    /// Cursor over `[lo, hi)` within a transaction, which holds the range
    /// locked shared until it ends.
    pub fn txn_range_scan(&self, txn_id: TxnId, lo: &[u8], hi: &[u8]) -> Result<RangeCursor<'_>> {
        self.ensure_open()?;
        self.txns.range_scan(
            txn_id,
            Bytes::copy_from_slice(lo),
            Bytes::copy_from_slice(hi),
        )
    }

    // Autocommit operations

    /// Inserts a key. Fails with `DuplicateKey` if it exists, unless the
    /// database was opened with upsert, which overwrites and returns the
    /// prior value.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        self.txns.autocommit(|txn_id| {
            self.txns.insert(
                txn_id,
                Bytes::copy_from_slice(key),
                Bytes::copy_from_slice(value),
            )
        })
    }

    /// Returns the value stored under `key`, `None` if there is none.
    pub fn search(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        self.txns.autocommit(|txn_id| self.txns.search(txn_id, key))
    }

    /// Removes a key, returning its value. Fails with `NotFound`.
    pub fn delete(&self, key: &[u8]) -> Result<Bytes> {
        self.ensure_open()?;
        self.txns.autocommit(|txn_id| self.txns.delete(txn_id, key))
    }

    /// Returns the pairs with keys in `[lo, hi)`, in key order.
    pub fn range_scan(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        self.scan(
            Bound::Included(Bytes::copy_from_slice(lo)),
            Bound::Excluded(Bytes::copy_from_slice(hi)),
        )
    }

    /// Returns the pairs with keys within the bounds, in key order.
    pub fn scan(&self, lower: Bound<Bytes>, upper: Bound<Bytes>) -> Result<Vec<(Bytes, Bytes)>> {
        self.ensure_open()?;
        self.txns
            .autocommit(|txn_id| self.txns.range(txn_id, lower, upper)?.collect())
    }

    /// Loads strictly ascending pairs as one atomic, self-committing unit.
    ///
    /// Unsorted input fails with `UnsortedInput` before any lock is taken,
    /// and a key already present fails with `DuplicateKey`; either way the
    /// tree is left as it was.
    pub fn bulk_load(&self, pairs: Vec<(Bytes, Bytes)>) -> Result<usize> {
        self.ensure_open()?;
        self.txns.bulk_load(pairs, &self.config.bulk_load)
    }

    // Plan cache and statistics

    pub fn plan_cache(&self) -> &PlanCache<CompiledPlan> {
        &self.plan_cache
    }

    pub fn get_cache_stats(&self) -> PlanCacheStats {
        self.plan_cache.stats()
    }

    /// Drops every cached plan. Returns the number dropped.
    pub fn clear_cache(&self) -> usize {
        self.plan_cache.clear()
    }

    /// Registers (or redefines) a table for statistics. Plans that
    /// reference it are dropped.
    pub fn register_table(&self, table: TableDef) {
        self.plan_cache.invalidate(&table.name);
        self.statistics.register_table(table);
    }

    /// Scans a registered table and stores fresh statistics for it. Plans
    /// that reference it are dropped.
    pub fn collect_statistics(&self, table: &str) -> Result<Arc<TableStatistics>> {
        self.ensure_open()?;
        let def = self.statistics.table(table)?;
        let (lower, upper) = def.key_bounds();
        let stats = self.txns.autocommit(|txn_id| {
            let rows = self.txns.range(txn_id, lower, upper)?;
            self.statistics.collect(table, rows)
        })?;
        self.plan_cache.invalidate(table);
        Ok(stats)
    }

    pub fn table_statistics(&self, table: &str) -> Option<Arc<TableStatistics>> {
        self.statistics.get(table)
    }

    pub fn statistics(&self) -> &StatisticsCollector {
        &self.statistics
    }

    // Introspection

    /// Number of entries.
    pub fn len(&self) -> u64 {
        self.tree().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree().is_empty()
    }

    pub fn height(&self) -> usize {
        self.tree().height()
    }

    pub fn active_transactions(&self) -> usize {
        self.txns.active_count()
    }

    /// Verifies the tree's structural invariants.
    pub fn check_integrity(&self) -> Result<()> {
        self.ensure_open()?;
        self.tree().check_invariants()
    }

    // Lifecycle

    /// Writes back every dirty page and discards the log history recovery
    /// no longer needs.
    pub fn checkpoint(&self) -> Result<CheckpointReport> {
        self.ensure_open()?;
        self.checkpoint_inner()
    }

    fn checkpoint_inner(&self) -> Result<CheckpointReport> {
        let started = Instant::now();
        let tree = self.tree();
        let wal = tree.wal();

        // With writes paused every logged change is in the page cache, so
        // flushing it covers everything before the checkpoint record.
        let (lsn, pages_flushed, payload) = tree.with_writes_paused(|| -> Result<_> {
            let payload = CheckpointPayload {
                active: self.txns.active_transactions(),
            };
            let pages = tree.pager().flush_all()?;
            let lsn = wal.log_checkpoint(&payload)?;
            wal.flush_to(lsn)?;
            Ok((lsn, pages, payload))
        })?;

        let keep_from = payload.oldest_lsn().map_or(lsn, |oldest| oldest.min(lsn));
        let records_truncated = wal.truncate_before(keep_from)?;

        let report = CheckpointReport {
            lsn,
            pages_flushed,
            records_truncated,
            active_transactions: payload.active.len(),
        };
        info!(
            lsn = %lsn,
            pages_flushed,
            records_truncated,
            active = report.active_transactions,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Checkpoint complete"
        );
        Ok(report)
    }

    /// Rolls back open transactions, checkpoints and closes the log. Later
    /// operations fail with `DatabaseClosed`; closing again does nothing.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let aborted = self.txns.abort_all()?;
        self.checkpoint_inner()?;
        self.tree().wal().close()?;
        info!(
            path = %self.config.storage.data_path.display(),
            aborted,
            "Database closed"
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Failed to close database cleanly");
        }
    }
}

/// Checks that the header points at a readable tree node.
fn validate_root(tree: &BTree) -> Result<()> {
    let header = tree.pager().header();
    let root = header.root_page_id;
    if root == PageId::HEADER || root.0 >= header.page_count {
        return Err(StrataError::UnrecoverableState(format!(
            "root {} is outside the file's {} pages",
            root, header.page_count
        )));
    }
    tree.pager()
        .read_node(root)
        .map(|_| ())
        .map_err(|e| StrataError::UnrecoverableState(format!("root {} is unreadable: {}", root, e)))
}
