//! Key-range lock manager.
//!
//! Transactions lock ranges of keys in Shared (read) or Exclusive (write)
//! mode and keep them until they finish. Two locks conflict when their
//! ranges overlap, they belong to different transactions, and at least one
//! is Exclusive. A blocked request waits on a condition variable; before
//! waiting it records its wait-for edges and fails with `Deadlock` if that
//! closes a cycle, and it fails with `LockTimeout` once the configured wait
//! has passed.

use crate::deadlock::WaitForGraph;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::ops::Bound;
use std::time::{Duration, Instant};
use strata_common::{Result, StrataError, TxnId};
use tracing::{debug, warn};

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    /// Read access; compatible with other Shared locks.
    Shared,
    /// Write access; compatible with nothing overlapping.
    Exclusive,
}

impl LockMode {
    fn compatible(self, other: LockMode) -> bool {
        self == LockMode::Shared && other == LockMode::Shared
    }
}

/// A range of keys with optional ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Bound<Bytes>,
    pub upper: Bound<Bytes>,
}

/// True if some key can satisfy both `lower` and `upper`.
fn bounds_meet(lower: &Bound<Bytes>, upper: &Bound<Bytes>) -> bool {
    match (lower, upper) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => true,
        (Bound::Included(lo), Bound::Included(hi)) => lo <= hi,
        (Bound::Included(lo) | Bound::Excluded(lo), Bound::Excluded(hi))
        | (Bound::Excluded(lo), Bound::Included(hi)) => lo < hi,
    }
}

impl KeyRange {
    pub fn new(lower: Bound<Bytes>, upper: Bound<Bytes>) -> Self {
        Self { lower, upper }
    }

    /// The single key `key`.
    pub fn point(key: &[u8]) -> Self {
        let key = Bytes::copy_from_slice(key);
        Self::new(Bound::Included(key.clone()), Bound::Included(key))
    }

    /// The half-open range `[lo, hi)`.
    pub fn half_open(lo: Bytes, hi: Bytes) -> Self {
        Self::new(Bound::Included(lo), Bound::Excluded(hi))
    }

    /// Every key.
    pub fn all() -> Self {
        Self::new(Bound::Unbounded, Bound::Unbounded)
    }

    /// True if no key lies in the range.
    pub fn is_empty(&self) -> bool {
        !bounds_meet(&self.lower, &self.upper)
    }

    /// True if some key lies in both ranges.
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && bounds_meet(&self.lower, &other.upper)
            && bounds_meet(&other.lower, &self.upper)
    }
}

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeLock {
    pub range: KeyRange,
    pub mode: LockMode,
}

/// Granted locks and waits, guarded together.
#[derive(Default)]
struct LockTable {
    held: HashMap<TxnId, Vec<RangeLock>>,
    waits: WaitForGraph,
}

impl LockTable {
    /// Transactions other than `txn_id` holding a lock that conflicts.
    fn blockers(&self, txn_id: TxnId, range: &KeyRange, mode: LockMode) -> Vec<TxnId> {
        let mut blockers: Vec<TxnId> = self
            .held
            .iter()
            .filter(|(holder, _)| **holder != txn_id)
            .filter(|(_, locks)| {
                locks
                    .iter()
                    .any(|l| !l.mode.compatible(mode) && l.range.overlaps(range))
            })
            .map(|(holder, _)| *holder)
            .collect();
        blockers.sort();
        blockers
    }

    fn grant(&mut self, txn_id: TxnId, range: KeyRange, mode: LockMode) {
        let locks = self.held.entry(txn_id).or_default();
        let covered = locks.iter().any(|l| l.range == range && l.mode >= mode);
        if !covered {
            locks.push(RangeLock { range, mode });
        }
    }
}

/// Key-range lock manager shared by all transactions of one database.
pub struct LockManager {
    table: Mutex<LockTable>,
    /// Signalled whenever a transaction releases its locks.
    released: Condvar,
    /// Longest time a request waits.
    timeout: Duration,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Acquires a lock, blocking while a conflicting lock is held.
    ///
    /// Fails with `Deadlock` if waiting would close a cycle of waits, or
    /// with `LockTimeout` if the lock is still unavailable after the
    /// configured timeout. Locks already granted are kept either way.
    pub fn acquire(&self, txn_id: TxnId, range: KeyRange, mode: LockMode) -> Result<()> {
        if range.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut table = self.table.lock();

        loop {
            let blockers = table.blockers(txn_id, &range, mode);
            if blockers.is_empty() {
                table.waits.remove_waiter(txn_id);
                table.grant(txn_id, range, mode);
                return Ok(());
            }

            table.waits.set_waits(txn_id, &blockers);
            if let Some(cycle) = table.waits.cycle_through(txn_id) {
                table.waits.remove_waiter(txn_id);
                warn!(txn_id = %txn_id, cycle = ?cycle, "Deadlock detected, aborting requester");
                return Err(StrataError::Deadlock { txn_id: txn_id.0 });
            }

            let timed_out = self.released.wait_until(&mut table, deadline).timed_out();
            if timed_out && !table.blockers(txn_id, &range, mode).is_empty() {
                table.waits.remove_waiter(txn_id);
                let waited_ms = started.elapsed().as_millis() as u64;
                debug!(txn_id = %txn_id, waited_ms, "Lock wait timed out");
                return Err(StrataError::LockTimeout {
                    txn_id: txn_id.0,
                    waited_ms,
                });
            }
        }
    }

    /// Releases every lock of a transaction and wakes waiters.
    ///
    /// Returns the number of locks released.
    pub fn release_all(&self, txn_id: TxnId) -> usize {
        let mut table = self.table.lock();
        let released = table.held.remove(&txn_id).map(|l| l.len()).unwrap_or(0);
        table.waits.remove_txn(txn_id);
        drop(table);
        self.released.notify_all();
        released
    }

    /// Number of locks a transaction holds.
    pub fn lock_count(&self, txn_id: TxnId) -> usize {
        self.table
            .lock()
            .held
            .get(&txn_id)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Number of wait-for edges currently recorded.
    pub fn waiting_edges(&self) -> usize {
        self.table.lock().waits.edge_count()
    }
}
