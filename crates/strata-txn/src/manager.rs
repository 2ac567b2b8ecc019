//! Transaction manager.
//!
//! Transactions are strict two-phase: key-range locks are taken before each
//! operation and held until commit or rollback. Tree mutations are logged
//! and applied immediately; the transaction keeps the logical undo of each
//! one so rollback can restore keys newest first. Commit forces the log
//! only for transactions that wrote something.

use crate::lock::{KeyRange, LockManager, LockMode};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_common::{BulkLoadConfig, Lsn, Result, StrataError, TxnConfig, TxnId};
use strata_storage::{BTree, RangeCursor};
use strata_wal::{LogRecord, UndoPayload};
use tracing::{debug, error, info, warn};

/// Transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// How to put one key back the way it was before a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoEntry {
    pub key: Bytes,
    /// Value before the write, `None` if the key was absent.
    pub prior: Option<Bytes>,
}

/// A transaction's private state.
#[derive(Debug)]
pub struct Transaction {
    pub id: TxnId,
    pub state: TxnState,
    /// LSN of the begin record.
    pub first_lsn: Lsn,
    /// Undo of every applied write, oldest first.
    pub write_set: Vec<UndoEntry>,
}

impl Transaction {
    fn new(id: TxnId, first_lsn: Lsn) -> Self {
        Self {
            id,
            state: TxnState::Active,
            first_lsn,
            write_set: Vec::new(),
        }
    }

    /// Returns true if the transaction changed any key.
    pub fn has_writes(&self) -> bool {
        !self.write_set.is_empty()
    }
}

/// Registry entry of an active transaction.
struct ActiveTxn {
    first_lsn: Lsn,
    txn: Arc<Mutex<Transaction>>,
}

/// Coordinates transactions over one tree.
pub struct TransactionManager {
    tree: Arc<BTree>,
    locks: LockManager,
    active: Mutex<HashMap<TxnId, ActiveTxn>>,
    /// Next id to hand out; every id below it was issued.
    next_txn: AtomicU64,
    upsert: bool,
}

impl TransactionManager {
    /// Creates a manager that issues ids starting at `next_txn`.
    pub fn new(tree: Arc<BTree>, config: &TxnConfig, next_txn: TxnId) -> Self {
        Self {
            tree,
            locks: LockManager::new(config.lock_timeout()),
            active: Mutex::new(HashMap::new()),
            next_txn: AtomicU64::new(next_txn.0.max(TxnId::FIRST.0)),
            upsert: config.upsert,
        }
    }

    pub fn tree(&self) -> &Arc<BTree> {
        &self.tree
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Starts a transaction.
    pub fn begin(&self) -> Result<TxnId> {
        // The begin record is written under the registry lock so a
        // checkpoint listing active transactions never misses one that
        // already has a record in the log.
        let mut active = self.active.lock();
        let txn_id = TxnId(self.next_txn.fetch_add(1, Ordering::SeqCst));
        let first_lsn = self.tree.wal().log_begin(txn_id)?;
        active.insert(
            txn_id,
            ActiveTxn {
                first_lsn,
                txn: Arc::new(Mutex::new(Transaction::new(txn_id, first_lsn))),
            },
        );
        drop(active);

        debug!(txn_id = %txn_id, first_lsn = %first_lsn, "Transaction started");
        Ok(txn_id)
    }

    /// Inserts a key. With upsert enabled an existing key is overwritten
    /// and its prior value returned.
    pub fn insert(&self, txn_id: TxnId, key: Bytes, value: Bytes) -> Result<Option<Bytes>> {
        self.tree.validate_key(&key)?;
        self.tree.validate_value(&value)?;
        self.with_active(txn_id, |txn| {
            self.locks
                .acquire(txn_id, KeyRange::point(&key), LockMode::Exclusive)?;
            let prior = self.tree.insert(txn_id, key.clone(), value, self.upsert)?;
            txn.write_set.push(UndoEntry {
                key,
                prior: prior.clone(),
            });
            Ok(prior)
        })
    }

    /// Looks up a key.
    pub fn search(&self, txn_id: TxnId, key: &[u8]) -> Result<Option<Bytes>> {
        self.with_active(txn_id, |_| {
            self.locks
                .acquire(txn_id, KeyRange::point(key), LockMode::Shared)?;
            self.tree.search(key)
        })
    }

    /// Removes a key, returning its value.
    pub fn delete(&self, txn_id: TxnId, key: &[u8]) -> Result<Bytes> {
        self.tree.validate_key(key)?;
        self.with_active(txn_id, |txn| {
            self.locks
                .acquire(txn_id, KeyRange::point(key), LockMode::Exclusive)?;
            let removed = self.tree.delete(txn_id, key)?;
            txn.write_set.push(UndoEntry {
                key: Bytes::copy_from_slice(key),
                prior: Some(removed.clone()),
            });
            Ok(removed)
        })
    }

    /// Locks `[lo, hi)` shared and returns a cursor over it.
    pub fn range_scan(&self, txn_id: TxnId, lo: Bytes, hi: Bytes) -> Result<RangeCursor<'_>> {
        self.range(txn_id, Bound::Included(lo), Bound::Excluded(hi))
    }

    /// Locks the range shared and returns a cursor over it.
    pub fn range(
        &self,
        txn_id: TxnId,
        lower: Bound<Bytes>,
        upper: Bound<Bytes>,
    ) -> Result<RangeCursor<'_>> {
        let range = KeyRange::new(lower.clone(), upper.clone());
        self.with_active(txn_id, |_| {
            self.locks.acquire(txn_id, range, LockMode::Shared)?;
            Ok(self.tree.range(lower, upper))
        })
    }

    /// Commits a transaction.
    ///
    /// If forcing the log fails the transaction stays active with its locks
    /// held; the caller may retry the commit or roll back.
    pub fn commit(&self, txn_id: TxnId) -> Result<()> {
        let txn = self.lookup(txn_id)?;
        let mut txn = txn.lock();
        if txn.state != TxnState::Active {
            return Err(StrataError::TransactionAlreadyClosed { txn_id: txn_id.0 });
        }

        let wal = self.tree.wal();
        let lsn = wal.log_commit(txn_id)?;
        if txn.has_writes() {
            wal.flush_to(lsn)?;
        }
        txn.state = TxnState::Committed;
        let writes = txn.write_set.len();
        drop(txn);

        let locks = self.finish(txn_id);
        debug!(txn_id = %txn_id, commit_lsn = %lsn, writes, locks, "Transaction committed");
        Ok(())
    }

    /// Rolls a transaction back.
    ///
    /// If undo fails midway the transaction stays active with the remaining
    /// undo and its locks; rolling back again resumes where it stopped.
    pub fn rollback(&self, txn_id: TxnId) -> Result<()> {
        let txn = self.lookup(txn_id)?;
        let mut txn = txn.lock();
        if txn.state != TxnState::Active {
            return Err(StrataError::TransactionAlreadyClosed { txn_id: txn_id.0 });
        }
        self.abort(&mut txn)
    }

    /// Runs `f` as a single-operation transaction.
    ///
    /// Commits on success; on failure rolls back (unless the failure already
    /// did) and returns the original error.
    pub fn autocommit<R>(&self, f: impl FnOnce(TxnId) -> Result<R>) -> Result<R> {
        let txn_id = self.begin()?;
        match f(txn_id) {
            Ok(out) => {
                self.commit(txn_id)?;
                Ok(out)
            }
            Err(e) => {
                match self.rollback(txn_id) {
                    Ok(()) | Err(StrataError::TransactionAlreadyClosed { .. }) => {}
                    Err(undo_err) => {
                        error!(txn_id = %txn_id, error = %undo_err, "Autocommit rollback failed");
                    }
                }
                Err(e)
            }
        }
    }

    /// Bulk loads sorted pairs under an exclusive lock on every key.
    ///
    /// Input that is out of order or over the size limits fails at once,
    /// without touching the lock table. Otherwise the load waits for all
    /// lock holders like any other request and fails with `LockTimeout` if
    /// they don't finish in time.
    pub fn bulk_load(&self, pairs: Vec<(Bytes, Bytes)>, config: &BulkLoadConfig) -> Result<usize> {
        self.tree.validate_bulk_input(&pairs)?;
        let loader = TxnId(self.next_txn.fetch_add(1, Ordering::SeqCst));
        self.locks
            .acquire(loader, KeyRange::all(), LockMode::Exclusive)?;
        let result = self.tree.bulk_load(loader, pairs, config);
        self.locks.release_all(loader);
        result
    }

    /// Undoes the work of transactions that never finished, newest record
    /// first, then writes an abort record for each of them.
    ///
    /// Returns the number of keys that had to be restored.
    pub fn undo_losers(&self, undo: &[LogRecord], losers: &[TxnId]) -> Result<usize> {
        let mut restored = 0;
        for record in undo {
            let payload = UndoPayload::deserialize(&record.undo)?;
            if self.tree.restore(record.txn_id, payload.key, payload.prior)? {
                restored += 1;
            }
        }
        let wal = self.tree.wal();
        for &txn_id in losers {
            wal.log_abort(txn_id)?;
        }
        if !losers.is_empty() {
            info!(losers = losers.len(), restored, "Rolled back unfinished transactions");
        }
        Ok(restored)
    }

    /// Active transactions with the LSN of their begin record, oldest first.
    pub fn active_transactions(&self) -> Vec<(TxnId, Lsn)> {
        let mut active: Vec<_> = self
            .active
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.first_lsn))
            .collect();
        active.sort();
        active
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_active(&self, txn_id: TxnId) -> bool {
        self.active.lock().contains_key(&txn_id)
    }

    /// Rolls back every active transaction. Used at shutdown.
    pub fn abort_all(&self) -> Result<usize> {
        let ids: Vec<TxnId> = self.active.lock().keys().copied().collect();
        let mut aborted = 0;
        for txn_id in ids {
            match self.rollback(txn_id) {
                Ok(()) => aborted += 1,
                Err(StrataError::TransactionAlreadyClosed { .. })
                | Err(StrataError::TransactionNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(aborted)
    }

    fn lookup(&self, txn_id: TxnId) -> Result<Arc<Mutex<Transaction>>> {
        if let Some(entry) = self.active.lock().get(&txn_id) {
            return Ok(entry.txn.clone());
        }
        if txn_id >= TxnId::FIRST && txn_id.0 < self.next_txn.load(Ordering::SeqCst) {
            Err(StrataError::TransactionAlreadyClosed { txn_id: txn_id.0 })
        } else {
            Err(StrataError::TransactionNotFound { txn_id: txn_id.0 })
        }
    }

    /// Runs `f` against an active transaction, rolling it back first if
    /// `f` fails in a way that dooms the whole transaction.
    fn with_active<R>(
        &self,
        txn_id: TxnId,
        f: impl FnOnce(&mut Transaction) -> Result<R>,
    ) -> Result<R> {
        let txn = self.lookup(txn_id)?;
        let mut txn = txn.lock();
        if txn.state != TxnState::Active {
            return Err(StrataError::TransactionAlreadyClosed { txn_id: txn_id.0 });
        }

        match f(&mut txn) {
            Ok(out) => Ok(out),
            Err(e) if e.is_transaction_fatal() => {
                if let Err(undo_err) = self.abort(&mut txn) {
                    error!(txn_id = %txn_id, error = %undo_err, "Automatic rollback failed");
                } else {
                    warn!(txn_id = %txn_id, error = %e, "Transaction rolled back");
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Undoes a transaction's writes and closes it as aborted.
    fn abort(&self, txn: &mut Transaction) -> Result<()> {
        let txn_id = txn.id;
        let mut restored = 0;
        while let Some(entry) = txn.write_set.last() {
            if self
                .tree
                .restore(txn_id, entry.key.clone(), entry.prior.clone())?
            {
                restored += 1;
            }
            txn.write_set.pop();
        }
        self.tree.wal().log_abort(txn_id)?;
        txn.state = TxnState::Aborted;

        let locks = self.finish(txn_id);
        debug!(txn_id = %txn_id, restored, locks, "Transaction aborted");
        Ok(())
    }

    /// Drops a closed transaction from the registry and releases its locks.
    fn finish(&self, txn_id: TxnId) -> usize {
        self.active.lock().remove(&txn_id);
        self.locks.release_all(txn_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::{Duration, Instant};
    use strata_common::{LogDurability, StorageConfig, WalConfig};
    use strata_storage::PageManager;
    use strata_wal::{RecoveryManager, WalReader, WalWriter};
    use tempfile::{tempdir, TempDir};

    fn create_manager(lock_timeout_ms: u64, upsert: bool) -> (TransactionManager, TempDir) {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_path: dir.path().join("txn.db"),
            page_size: 4096,
            order: 8,
            max_key_size: 64,
            max_value_size: 64,
            buffer_pool_pages: 64,
            max_pages: None,
            fsync_enabled: false,
        };
        let wal_config = WalConfig {
            wal_path: dir.path().join("txn.wal"),
            fsync_enabled: false,
            ..Default::default()
        };
        let (wal, _) = WalWriter::open(wal_config, config.page_size as u32).unwrap();
        let wal = Arc::new(wal);
        let pager = PageManager::open(&config, wal.clone() as Arc<dyn LogDurability>, None).unwrap();
        let tree = Arc::new(BTree::new(Arc::new(pager), wal, &config));

        let txn_config = TxnConfig {
            lock_timeout_ms,
            upsert,
        };
        (TransactionManager::new(tree, &txn_config, TxnId::FIRST), dir)
    }

    fn b(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    #[test]
    fn test_commit_makes_writes_visible() {
        let (txns, _dir) = create_manager(100, false);
        let t1 = txns.begin().unwrap();
        txns.insert(t1, b("a"), b("1")).unwrap();
        txns.insert(t1, b("b"), b("2")).unwrap();
        assert_eq!(txns.search(t1, b"a").unwrap(), Some(b("1")));
        txns.commit(t1).unwrap();

        assert!(!txns.is_active(t1));
        assert_eq!(txns.tree().search(b"b").unwrap(), Some(b("2")));
        assert!(txns.tree().wal().flushed_lsn() >= txns.tree().wal().last_lsn());
    }

    #[test]
    fn test_rollback_restores_prior_state() {
        let (txns, _dir) = create_manager(100, true);
        txns.autocommit(|t| txns.insert(t, b("keep"), b("old"))).unwrap();

        let t = txns.begin().unwrap();
        txns.insert(t, b("a"), b("1")).unwrap();
        assert_eq!(txns.insert(t, b("keep"), b("new")).unwrap(), Some(b("old")));
        txns.delete(t, b"a").unwrap();
        txns.insert(t, b("a"), b("2")).unwrap();
        txns.rollback(t).unwrap();

        let tree = txns.tree();
        assert_eq!(tree.search(b"a").unwrap(), None);
        assert_eq!(tree.search(b"keep").unwrap(), Some(b("old")));
        assert_eq!(tree.len(), 1);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_closed_and_unknown_transactions() {
        let (txns, _dir) = create_manager(100, false);
        let t = txns.begin().unwrap();
        txns.commit(t).unwrap();

        assert!(matches!(
            txns.commit(t),
            Err(StrataError::TransactionAlreadyClosed { .. })
        ));
        assert!(matches!(
            txns.rollback(t),
            Err(StrataError::TransactionAlreadyClosed { .. })
        ));
        assert!(matches!(
            txns.insert(t, b("x"), b("y")),
            Err(StrataError::TransactionAlreadyClosed { .. })
        ));
        assert!(matches!(
            txns.commit(TxnId(999)),
            Err(StrataError::TransactionNotFound { txn_id: 999 })
        ));
        assert!(matches!(
            txns.search(TxnId::SYSTEM, b"x"),
            Err(StrataError::TransactionNotFound { .. })
        ));
    }

    #[test]
    fn test_statement_failure_keeps_transaction_active() {
        let (txns, _dir) = create_manager(100, false);
        let t = txns.begin().unwrap();
        txns.insert(t, b("a"), b("1")).unwrap();

        assert!(matches!(
            txns.insert(t, b("a"), b("2")),
            Err(StrataError::DuplicateKey)
        ));
        assert!(matches!(txns.delete(t, b"zz"), Err(StrataError::NotFound)));
        assert!(matches!(
            txns.insert(t, Bytes::new(), b("v")),
            Err(StrataError::EmptyKey)
        ));

        assert!(txns.is_active(t));
        txns.commit(t).unwrap();
        assert_eq!(txns.tree().search(b"a").unwrap(), Some(b("1")));
    }

    #[test]
    fn test_lock_timeout_rolls_back() {
        let (txns, _dir) = create_manager(30, false);
        let holder = txns.begin().unwrap();
        txns.insert(holder, b("k"), b("1")).unwrap();

        let waiter = txns.begin().unwrap();
        txns.insert(waiter, b("other"), b("2")).unwrap();
        let err = txns.search(waiter, b"k").unwrap_err();
        assert!(matches!(err, StrataError::LockTimeout { .. }));

        // The waiter was rolled back and its write undone
        assert!(!txns.is_active(waiter));
        assert!(matches!(
            txns.commit(waiter),
            Err(StrataError::TransactionAlreadyClosed { .. })
        ));
        assert_eq!(txns.tree().search(b"other").unwrap(), None);

        txns.commit(holder).unwrap();
        assert_eq!(txns.locks().lock_count(holder), 0);
    }

    #[test]
    fn test_range_scan_blocks_writer_in_range() {
        let (txns, _dir) = create_manager(30, false);
        txns.autocommit(|t| {
            for i in 0..10 {
                txns.insert(t, b(&format!("k{}", i)), b("v"))?;
            }
            Ok(())
        })
        .unwrap();

        let reader = txns.begin().unwrap();
        let seen = txns
            .range_scan(reader, b("k2"), b("k5"))
            .unwrap()
            .count();
        assert_eq!(seen, 3);

        let writer = txns.begin().unwrap();
        txns.insert(writer, b("k9a"), b("v")).unwrap();
        assert!(matches!(
            txns.insert(writer, b("k3a"), b("v")),
            Err(StrataError::LockTimeout { .. })
        ));
        txns.commit(reader).unwrap();
    }

    #[test]
    fn test_concurrent_disjoint_transactions() {
        let (txns, _dir) = create_manager(1_000, false);
        let txns = Arc::new(txns);
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let txns = txns.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let t = txns.begin().unwrap();
                    barrier.wait();
                    for i in 0..50 {
                        let key = format!("w{}-{:03}", worker, i);
                        txns.insert(t, Bytes::from(key), Bytes::from_static(b"v"))
                            .unwrap();
                    }
                    if worker % 2 == 0 {
                        txns.commit(t).unwrap();
                    } else {
                        txns.rollback(t).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let tree = txns.tree();
        assert_eq!(tree.len(), 100);
        tree.check_invariants().unwrap();
        assert_eq!(txns.active_count(), 0);
    }

    #[test]
    fn test_deadlock_victim_is_rolled_back() {
        let (txns, _dir) = create_manager(5_000, false);
        let txns = Arc::new(txns);
        let t1 = txns.begin().unwrap();
        let t2 = txns.begin().unwrap();
        txns.insert(t1, b("a"), b("1")).unwrap();
        txns.insert(t2, b("b"), b("2")).unwrap();

        let first = {
            let txns = txns.clone();
            thread::spawn(move || txns.insert(t1, b("b2"), b("x")).and_then(|_| txns.search(t1, b"b")))
        };
        while txns.locks().waiting_edges() == 0 {
            thread::sleep(Duration::from_millis(5));
        }

        let err = txns.search(t2, b"a").unwrap_err();
        assert!(matches!(err, StrataError::Deadlock { .. }));
        assert!(!txns.is_active(t2));

        // The survivor proceeds once the victim's locks are gone
        assert_eq!(first.join().unwrap().unwrap(), None);
        txns.commit(t1).unwrap();
        assert_eq!(txns.tree().search(b"b").unwrap(), None);
        assert_eq!(txns.tree().search(b"a").unwrap(), Some(b("1")));
    }

    #[test]
    fn test_bulk_load_waits_for_lock_holders() {
        let (txns, _dir) = create_manager(30, false);
        let t = txns.begin().unwrap();
        txns.insert(t, b("zz"), b("1")).unwrap();

        let pairs = vec![(b("a"), b("1")), (b("b"), b("2"))];
        assert!(matches!(
            txns.bulk_load(pairs.clone(), &BulkLoadConfig::default()),
            Err(StrataError::LockTimeout { .. })
        ));
        txns.commit(t).unwrap();
        assert_eq!(txns.bulk_load(pairs, &BulkLoadConfig::default()).unwrap(), 2);
        assert_eq!(txns.tree().len(), 3);
    }

    #[test]
    fn test_bulk_load_rejects_unsorted_input_without_waiting() {
        // Long enough that waiting for the lock would time the test out
        let (txns, _dir) = create_manager(60_000, false);
        let t = txns.begin().unwrap();
        txns.insert(t, b("zz"), b("1")).unwrap();

        let pairs = vec![(b("5"), b("five")), (b("3"), b("three")), (b("9"), b("nine"))];
        let started = Instant::now();
        assert!(matches!(
            txns.bulk_load(pairs, &BulkLoadConfig::default()),
            Err(StrataError::UnsortedInput { position: 1 })
        ));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(txns.locks().waiting_edges(), 0);

        // The holder is unaffected
        txns.commit(t).unwrap();
        assert_eq!(txns.tree().len(), 1);
    }

    #[test]
    fn test_undo_losers() {
        let (txns, _dir) = create_manager(100, false);
        let tree = txns.tree().clone();
        let loser = TxnId(40);
        tree.insert(loser, b("a"), b("1"), false).unwrap();
        tree.insert(loser, b("b"), b("2"), false).unwrap();
        tree.delete(loser, b"a").unwrap();
        tree.wal().flush().unwrap();

        let scan = WalReader::scan_path(tree.wal().path()).unwrap();
        let plan = RecoveryManager::analyze(scan.records).unwrap();
        assert_eq!(plan.losers, vec![loser]);
        assert_eq!(plan.undo.len(), 3);

        let restored = txns.undo_losers(&plan.undo, &plan.losers).unwrap();
        assert_eq!(restored, 3);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_active_transactions_report_first_lsn() {
        let (txns, _dir) = create_manager(100, false);
        let t1 = txns.begin().unwrap();
        let t2 = txns.begin().unwrap();
        let active = txns.active_transactions();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].0, t1);
        assert!(active[0].1 < active[1].1);

        txns.rollback(t2).unwrap();
        assert_eq!(txns.active_transactions(), vec![active[0]]);
        assert_eq!(txns.abort_all().unwrap(), 1);
        assert_eq!(txns.active_count(), 0);
    }
}
