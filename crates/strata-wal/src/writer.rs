//! WAL writer for appending log records.
//!
//! Appends are buffered in memory and assigned LSNs under one lock. Commit
//! durability uses group commit: the first committer to call `flush_to`
//! becomes the leader, writes everything buffered so far, and syncs once;
//! committers arriving meanwhile wait on a condition variable and are
//! released together when the leader's sync covers their LSN.

use crate::constants::MAX_PAYLOAD_SIZE;
use crate::reader::{LogScan, WalReader};
use crate::record::{CheckpointPayload, LogOp, LogRecord};
use crate::segment::LogFile;
use bytes::BytesMut;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::{LogDurability, Lsn, Result, StrataError, TxnId, WalConfig};
use tracing::{debug, error, info, warn};

/// Buffered state protected by the writer lock.
struct WriterState {
    /// Next LSN to assign.
    next_lsn: Lsn,
    /// Serialized records not yet handed to the OS.
    pending: BytesMut,
    /// Highest LSN assigned so far.
    last_appended: Lsn,
    /// True while a group commit leader is writing and syncing.
    flushing: bool,
    /// Set by `close`.
    closed: bool,
    /// Set once a write or sync fails. Buffered records may be lost, so
    /// nothing more is accepted.
    failed: Option<String>,
}

impl WriterState {
    fn check_healthy(&self) -> Result<()> {
        match &self.failed {
            Some(reason) => Err(StrataError::WalFailed(reason.clone())),
            None => Ok(()),
        }
    }
}

/// Thread-safe WAL writer.
pub struct WalWriter {
    /// Configuration.
    config: WalConfig,
    /// Buffer and LSN allocation.
    state: Mutex<WriterState>,
    /// Signalled when a group commit finishes.
    flush_done: Condvar,
    /// Log file. Always locked after `state` when both are held.
    file: Mutex<Option<LogFile>>,
    /// Highest LSN on stable storage.
    durable_lsn: AtomicU64,
}

impl WalWriter {
    /// Opens or creates the WAL at `config.wal_path`.
    ///
    /// An existing log is scanned; an incomplete tail (torn or corrupt
    /// record and everything after it) is cut off before new records are
    /// appended. Returns the writer and the verified records for recovery.
    pub fn open(config: WalConfig, page_size: u32) -> Result<(Self, LogScan)> {
        if let Some(dir) = config.wal_path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let (file, scan) = if config.wal_path.exists() {
            let mut file = LogFile::open(&config.wal_path)?;
            if file.header().page_size != page_size {
                return Err(StrataError::IncompatibleFormat {
                    found: format!("WAL page size {}", file.header().page_size),
                    supported: format!("page size {}", page_size),
                });
            }
            let scan = WalReader::scan(&mut file)?;
            if scan.has_torn_tail() {
                warn!(
                    valid_bytes = scan.valid_len,
                    discarded_bytes = scan.total_len - scan.valid_len,
                    error = ?scan.tail_error,
                    "Discarding incomplete WAL tail"
                );
                file.truncate_body(scan.valid_len)?;
            }
            (file, scan)
        } else {
            let file = LogFile::create(&config.wal_path, page_size, Lsn::FIRST)?;
            (file, LogScan::default())
        };

        let next_lsn = scan.next_lsn();
        let last = Lsn(next_lsn.0 - 1);
        debug!(path = %config.wal_path.display(), next_lsn = %next_lsn, records = scan.records.len(), "WAL opened");

        let writer = Self {
            config,
            state: Mutex::new(WriterState {
                next_lsn,
                pending: BytesMut::new(),
                last_appended: last,
                flushing: false,
                closed: false,
                failed: None,
            }),
            flush_done: Condvar::new(),
            file: Mutex::new(Some(file)),
            durable_lsn: AtomicU64::new(last.0),
        };
        Ok((writer, scan))
    }

    /// Returns the path of the WAL file.
    pub fn path(&self) -> &Path {
        &self.config.wal_path
    }

    /// Returns the next LSN that will be assigned.
    pub fn next_lsn(&self) -> Lsn {
        self.state.lock().next_lsn
    }

    /// Returns the highest LSN assigned so far.
    pub fn last_lsn(&self) -> Lsn {
        self.state.lock().last_appended
    }

    /// Returns the last flushed LSN.
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn(self.durable_lsn.load(Ordering::Acquire))
    }

    /// Appends a log record, assigning its LSN.
    ///
    /// The record is buffered; it becomes durable with the next flush.
    pub fn append(&self, mut record: LogRecord) -> Result<Lsn> {
        let payload = record.redo.len().max(record.undo.len());
        if payload > MAX_PAYLOAD_SIZE {
            return Err(StrataError::Internal(format!(
                "log record payload of {} bytes exceeds the {} byte limit",
                payload, MAX_PAYLOAD_SIZE
            )));
        }

        let mut state = self.state.lock();
        state.check_healthy()?;
        if state.closed {
            return Err(StrataError::DatabaseClosed);
        }

        let lsn = state.next_lsn;
        state.next_lsn = lsn.next();
        state.last_appended = lsn;
        record.lsn = lsn;
        record.serialize_into(&mut state.pending);

        // Bound memory use; the data reaches the OS but is not synced.
        if state.pending.len() >= self.config.group_commit_bytes && !state.flushing {
            self.write_pending(&mut state)?;
        }

        Ok(lsn)
    }

    /// Hands buffered records to the OS without syncing.
    fn write_pending(&self, state: &mut MutexGuard<'_, WriterState>) -> Result<()> {
        let bytes = state.pending.split();
        let upto = state.last_appended;
        let mut file = self.file.lock();
        let file = file.as_mut().ok_or(StrataError::DatabaseClosed)?;
        if let Err(e) = file.append(&bytes) {
            self.fail(state, &e);
            return Err(e);
        }
        if !self.config.fsync_enabled {
            self.durable_lsn.fetch_max(upto.0, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Stops the log after a failed write or sync.
    ///
    /// The records handed to the failed call are gone from the buffer and
    /// may be partly on disk, so accepting later records would leave a hole
    /// in the LSN sequence.
    fn fail(&self, state: &mut WriterState, err: &StrataError) {
        error!(
            error = %err,
            durable_lsn = %self.flushed_lsn(),
            last_lsn = %state.last_appended,
            "WAL write failed, rejecting further records"
        );
        if state.failed.is_none() {
            state.failed = Some(err.to_string());
        }
    }

    /// Logs a transaction begin.
    pub fn log_begin(&self, txn_id: TxnId) -> Result<Lsn> {
        self.append(LogRecord::marker(txn_id, LogOp::Begin))
    }

    /// Logs a transaction commit. Durability requires a following `flush_to`.
    pub fn log_commit(&self, txn_id: TxnId) -> Result<Lsn> {
        self.append(LogRecord::marker(txn_id, LogOp::Commit))
    }

    /// Logs a transaction abort.
    pub fn log_abort(&self, txn_id: TxnId) -> Result<Lsn> {
        self.append(LogRecord::marker(txn_id, LogOp::Abort))
    }

    /// Logs a checkpoint record listing the active transactions.
    pub fn log_checkpoint(&self, payload: &CheckpointPayload) -> Result<Lsn> {
        let mut record = LogRecord::marker(TxnId::SYSTEM, LogOp::Checkpoint);
        record.redo = payload.serialize();
        self.append(record)
    }

    /// Makes every record up to `target` durable.
    ///
    /// Concurrent callers are batched into a single write and sync.
    pub fn flush_to(&self, target: Lsn) -> Result<Lsn> {
        let mut state = self.state.lock();
        loop {
            let target = target.min(state.last_appended);
            let durable = self.flushed_lsn();
            if durable >= target {
                return Ok(durable);
            }
            state.check_healthy()?;
            if state.flushing {
                // Follower: the running leader may already cover us.
                self.flush_done.wait(&mut state);
                continue;
            }

            // Leader
            state.flushing = true;
            let delay = self.config.group_commit_delay();
            if !delay.is_zero() {
                MutexGuard::unlocked(&mut state, || std::thread::sleep(delay));
            }
            let bytes = state.pending.split();
            let upto = state.last_appended;

            // Take the file before releasing the buffer so writes stay in LSN order.
            let mut file = self.file.lock();
            drop(state);

            let result = match file.as_mut() {
                Some(f) => f.append(&bytes).and_then(|_| {
                    if self.config.fsync_enabled {
                        f.sync()
                    } else {
                        Ok(())
                    }
                }),
                None => Err(StrataError::DatabaseClosed),
            };
            drop(file);

            let mut state = self.state.lock();
            state.flushing = false;
            match &result {
                Ok(()) => {
                    self.durable_lsn.fetch_max(upto.0, Ordering::AcqRel);
                }
                Err(e) => self.fail(&mut state, e),
            }
            self.flush_done.notify_all();
            drop(state);

            result?;
            return Ok(upto);
        }
    }

    /// Forces all buffered records to disk.
    pub fn flush(&self) -> Result<Lsn> {
        self.flush_to(Lsn(u64::MAX))
    }

    /// Discards every record with an LSN below `keep_from`.
    ///
    /// The retained suffix is rewritten atomically; the LSN counter carries
    /// over through the file header. Returns the number of records removed.
    pub fn truncate_before(&self, keep_from: Lsn) -> Result<usize> {
        self.flush()?;

        let mut state = self.state.lock();
        state.check_healthy()?;
        let mut file = self.file.lock();
        let file = file.as_mut().ok_or(StrataError::DatabaseClosed)?;

        match Self::rewrite_from(file, &mut state, keep_from) {
            Ok((removed, kept)) => {
                self.durable_lsn
                    .fetch_max(state.last_appended.0, Ordering::AcqRel);
                info!(removed, kept, keep_from = %keep_from, "WAL truncated");
                Ok(removed)
            }
            Err(e) => {
                self.fail(&mut state, &e);
                Err(e)
            }
        }
    }

    /// Rewrites the log keeping records from `keep_from` on. Returns the
    /// number of records removed and kept.
    fn rewrite_from(
        file: &mut LogFile,
        state: &mut WriterState,
        keep_from: Lsn,
    ) -> Result<(usize, usize)> {
        // Anything appended since the flush goes to disk first.
        let pending = state.pending.split();
        file.append(&pending)?;

        let scan = WalReader::scan(file)?;
        let mut body = BytesMut::new();
        let mut removed = 0;
        for record in &scan.records {
            if record.lsn >= keep_from {
                record.serialize_into(&mut body);
            } else {
                removed += 1;
            }
        }
        file.replace(state.next_lsn, &body)?;
        Ok((removed, scan.records.len() - removed))
    }

    /// Closes the WAL writer, flushing buffered records.
    ///
    /// The writer is closed even when the final flush fails; the error is
    /// still returned.
    pub fn close(&self) -> Result<()> {
        if self.state.lock().closed {
            return Ok(());
        }
        let flushed = self.flush();
        let mut state = self.state.lock();
        state.closed = true;
        let file = self.file.lock().take();
        drop(state);

        flushed?;
        if let Some(mut file) = file {
            file.sync()?;
        }
        Ok(())
    }
}

impl LogDurability for WalWriter {
    fn durable_lsn(&self) -> Lsn {
        self.flushed_lsn()
    }

    fn force(&self) -> Result<Lsn> {
        self.flush()
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, path = %self.config.wal_path.display(), "Failed to close WAL");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{PageImage, UndoPayload};
    use bytes::Bytes;
    use std::sync::Arc;
    use strata_common::PageId;
    use tempfile::{tempdir, TempDir};

    fn test_config(dir: &TempDir) -> WalConfig {
        WalConfig {
            wal_path: dir.path().join("test.wal"),
            fsync_enabled: false, // Disable for faster tests
            ..Default::default()
        }
    }

    fn create_test_writer() -> (WalWriter, TempDir) {
        let dir = tempdir().unwrap();
        let (writer, _) = WalWriter::open(test_config(&dir), 4096).unwrap();
        (writer, dir)
    }

    fn insert_record(txn: u64, key: &str) -> LogRecord {
        let images = vec![PageImage {
            page_id: PageId(1),
            data: Bytes::from(vec![1u8; 128]),
        }];
        LogRecord::new(
            TxnId(txn),
            LogOp::Insert,
            PageId(1),
            PageImage::encode_all(&images),
            UndoPayload {
                key: Bytes::from(key.to_string()),
                prior: None,
            }
            .serialize(),
        )
    }

    #[test]
    fn test_wal_writer_creation() {
        let (writer, _dir) = create_test_writer();
        assert_eq!(writer.next_lsn(), Lsn::FIRST);
        assert_eq!(writer.flushed_lsn(), Lsn::INVALID);
    }

    #[test]
    fn test_wal_writer_lsns_increase() {
        let (writer, _dir) = create_test_writer();

        let begin = writer.log_begin(TxnId(1)).unwrap();
        let insert = writer.append(insert_record(1, "a")).unwrap();
        let commit = writer.log_commit(TxnId(1)).unwrap();

        assert_eq!(begin, Lsn(1));
        assert!(insert > begin);
        assert!(commit > insert);
    }

    #[test]
    fn test_wal_writer_flush() {
        let (writer, _dir) = create_test_writer();

        let lsn = writer.log_begin(TxnId(1)).unwrap();
        assert!(writer.flushed_lsn() < lsn);

        let flushed = writer.flush().unwrap();
        assert!(flushed >= lsn);
        assert_eq!(writer.durable_lsn(), lsn);
    }

    #[test]
    fn test_wal_writer_reopen_continues_lsns() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);

        let final_lsn;
        {
            let (writer, _) = WalWriter::open(config.clone(), 4096).unwrap();
            writer.log_begin(TxnId(1)).unwrap();
            writer.append(insert_record(1, "k")).unwrap();
            final_lsn = writer.log_commit(TxnId(1)).unwrap();
            writer.close().unwrap();
        }

        let (writer, scan) = WalWriter::open(config, 4096).unwrap();
        assert_eq!(scan.records.len(), 3);
        assert_eq!(scan.records[2].op, LogOp::Commit);
        assert_eq!(writer.next_lsn(), final_lsn.next());
    }

    #[test]
    fn test_wal_writer_page_size_mismatch() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);
        {
            let (writer, _) = WalWriter::open(config.clone(), 4096).unwrap();
            writer.close().unwrap();
        }
        assert!(matches!(
            WalWriter::open(config, 8192),
            Err(StrataError::IncompatibleFormat { .. })
        ));
    }

    #[test]
    fn test_wal_writer_discards_torn_tail() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);
        {
            let (writer, _) = WalWriter::open(config.clone(), 4096).unwrap();
            writer.log_begin(TxnId(1)).unwrap();
            writer.log_commit(TxnId(1)).unwrap();
            writer.close().unwrap();
        }
        // Simulate a torn write at the end of the log
        {
            let mut file = LogFile::open(&config.wal_path).unwrap();
            file.append(&[0xAB; 17]).unwrap();
        }

        let (writer, scan) = WalWriter::open(config.clone(), 4096).unwrap();
        assert_eq!(scan.records.len(), 2);
        assert!(scan.tail_error.is_some());

        // New records land right after the verified prefix
        let lsn = writer.log_begin(TxnId(2)).unwrap();
        writer.flush().unwrap();
        writer.close().unwrap();
        drop(writer);

        let scan = WalReader::scan_path(&config.wal_path).unwrap();
        assert_eq!(scan.records.len(), 3);
        assert_eq!(scan.records[2].lsn, lsn);
        assert!(scan.tail_error.is_none());
    }

    #[test]
    fn test_wal_writer_truncate_before() {
        let (writer, dir) = create_test_writer();

        for txn in 1..=5 {
            writer.log_begin(TxnId(txn)).unwrap();
            writer.append(insert_record(txn, "k")).unwrap();
            writer.log_commit(TxnId(txn)).unwrap();
        }
        let keep_from = writer.log_checkpoint(&CheckpointPayload::default()).unwrap();
        let removed = writer.truncate_before(keep_from).unwrap();
        assert_eq!(removed, 15);

        // LSNs keep increasing after truncation
        let next = writer.log_begin(TxnId(6)).unwrap();
        assert!(next > keep_from);
        writer.close().unwrap();
        drop(writer);

        let scan = WalReader::scan_path(&dir.path().join("test.wal")).unwrap();
        assert_eq!(scan.records.len(), 2);
        assert_eq!(scan.records[0].op, LogOp::Checkpoint);
        assert_eq!(scan.records[1].lsn, next);
    }

    #[test]
    fn test_wal_writer_truncate_everything_keeps_counter() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);
        let last;
        {
            let (writer, _) = WalWriter::open(config.clone(), 4096).unwrap();
            writer.log_begin(TxnId(1)).unwrap();
            last = writer.log_commit(TxnId(1)).unwrap();
            writer.truncate_before(last.next()).unwrap();
            writer.close().unwrap();
        }

        let (writer, scan) = WalWriter::open(config, 4096).unwrap();
        assert!(scan.records.is_empty());
        assert_eq!(writer.next_lsn(), last.next());
    }

    #[test]
    fn test_wal_writer_group_commit_threads() {
        let (writer, _dir) = create_test_writer();
        let writer = Arc::new(writer);

        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let writer = Arc::clone(&writer);
                std::thread::spawn(move || {
                    for i in 0..50u64 {
                        let txn = TxnId(t * 1000 + i + 1);
                        writer.log_begin(txn).unwrap();
                        writer.append(insert_record(txn.0, "k")).unwrap();
                        let commit = writer.log_commit(txn).unwrap();
                        let durable = writer.flush_to(commit).unwrap();
                        assert!(durable >= commit);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(writer.flushed_lsn(), writer.last_lsn());
        writer.close().unwrap();

        let scan = WalReader::scan_path(writer.path()).unwrap();
        assert_eq!(scan.records.len(), 8 * 50 * 3);
        assert!(scan.records.windows(2).all(|w| w[0].lsn < w[1].lsn));
    }

    #[test]
    fn test_wal_writer_failed_write_stops_the_log() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);

        let durable;
        {
            let (writer, _) = WalWriter::open(config.clone(), 4096).unwrap();
            writer.log_begin(TxnId(1)).unwrap();
            durable = writer.log_commit(TxnId(1)).unwrap();
            writer.flush_to(durable).unwrap();

            writer.log_begin(TxnId(2)).unwrap();
            writer.append(insert_record(2, "k")).unwrap();

            // Every later write on the handle fails
            writer
                .file
                .lock()
                .as_mut()
                .unwrap()
                .reopen_read_only()
                .unwrap();

            assert!(writer.flush().is_err());
            assert_eq!(writer.flushed_lsn(), durable);

            // Already durable records still report success
            assert_eq!(writer.flush_to(durable).unwrap(), durable);

            assert!(matches!(
                writer.log_commit(TxnId(2)),
                Err(StrataError::WalFailed(_))
            ));
            assert!(matches!(writer.flush(), Err(StrataError::WalFailed(_))));
            assert!(matches!(
                writer.truncate_before(durable),
                Err(StrataError::WalFailed(_))
            ));
            assert!(writer.close().is_err());
            // Closing again is a no-op
            assert!(writer.close().is_ok());
        }

        // Only the flushed prefix survives and numbering resumes after it
        let (writer, scan) = WalWriter::open(config, 4096).unwrap();
        assert_eq!(scan.records.len(), 2);
        assert!(scan.records.windows(2).all(|w| w[1].lsn == w[0].lsn.next()));
        assert_eq!(writer.next_lsn(), durable.next());
    }

    #[test]
    fn test_wal_writer_closed_rejects_appends() {
        let (writer, _dir) = create_test_writer();
        writer.close().unwrap();
        assert!(matches!(
            writer.log_begin(TxnId(1)),
            Err(StrataError::DatabaseClosed)
        ));
    }
}
