//! WAL reader and recovery analysis.

use crate::record::{CheckpointPayload, LogOp, LogRecord};
use crate::segment::LogFile;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use strata_common::{Lsn, Result, StrataError, TxnId};
use tracing::warn;

/// Result of scanning a log file.
#[derive(Debug, Default)]
pub struct LogScan {
    /// Records of the verified prefix, in LSN order.
    pub records: Vec<LogRecord>,
    /// Length in bytes of the verified prefix of the record area.
    pub valid_len: u64,
    /// Total length of the record area on disk.
    pub total_len: u64,
    /// Why the scan stopped early, if it did.
    pub tail_error: Option<StrataError>,
    /// LSN floor from the file header.
    pub base_lsn: Lsn,
}

impl LogScan {
    /// Returns true if bytes after the verified prefix must be discarded.
    pub fn has_torn_tail(&self) -> bool {
        self.valid_len < self.total_len
    }

    /// Next LSN to assign after this log.
    pub fn next_lsn(&self) -> Lsn {
        let after_last = self
            .records
            .last()
            .map(|r| r.lsn.next())
            .unwrap_or(Lsn::FIRST);
        after_last.max(self.base_lsn).max(Lsn::FIRST)
    }
}

/// Sequential reader over a WAL file.
pub struct WalReader;

impl WalReader {
    /// Reads and verifies every record in the file at `path`.
    pub fn scan_path(path: &Path) -> Result<LogScan> {
        let mut file = LogFile::open(path)?;
        Self::scan(&mut file)
    }

    /// Reads and verifies every record in `file`.
    ///
    /// Stops at the first record that is truncated, fails its checksum, or
    /// breaks LSN monotonicity. That record and everything after it form
    /// the incomplete tail.
    pub fn scan(file: &mut LogFile) -> Result<LogScan> {
        let body = file.read_body()?;
        let mut scan = LogScan {
            total_len: body.len() as u64,
            base_lsn: file.header().base_lsn,
            ..Default::default()
        };

        let mut offset = 0usize;
        let mut last_lsn = Lsn::INVALID;
        while offset < body.len() {
            let rest = &body[offset..];
            let record = LogRecord::encoded_len(rest).and_then(|len| {
                if rest.len() < len {
                    Err(StrataError::WalCorruption {
                        lsn: last_lsn.0,
                        reason: "truncated record".to_string(),
                    })
                } else {
                    LogRecord::deserialize(&rest[..len]).map(|r| (r, len))
                }
            });
            match record {
                // LSNs are assigned one apart; a jump means lost records.
                Ok((record, _))
                    if record.lsn <= last_lsn
                        || (last_lsn != Lsn::INVALID && record.lsn != last_lsn.next()) =>
                {
                    scan.tail_error = Some(StrataError::WalCorruption {
                        lsn: record.lsn.0,
                        reason: format!("LSN {} does not follow {}", record.lsn, last_lsn),
                    });
                    break;
                }
                Ok((record, len)) => {
                    last_lsn = record.lsn;
                    offset += len;
                    scan.records.push(record);
                }
                Err(e) => {
                    scan.tail_error = Some(e);
                    break;
                }
            }
        }
        scan.valid_len = offset as u64;
        Ok(scan)
    }
}

/// What recovery has to do, derived from the verified log.
#[derive(Debug, Default)]
pub struct RecoveryPlan {
    /// LSN of the last checkpoint record, if any.
    pub checkpoint_lsn: Option<Lsn>,
    /// Records whose page images must be replayed, in LSN order.
    pub redo: Vec<LogRecord>,
    /// Undoable records of unfinished transactions, newest first.
    pub undo: Vec<LogRecord>,
    /// Transactions with neither a commit nor an abort record.
    pub losers: Vec<TxnId>,
    /// Number of committed transactions seen.
    pub committed: usize,
    /// Number of aborted transactions seen.
    pub aborted: usize,
    /// Highest LSN in the log.
    pub last_lsn: Lsn,
    /// Highest transaction id in the log.
    pub max_txn_id: TxnId,
}

impl RecoveryPlan {
    /// Returns true if there's nothing to recover.
    pub fn is_empty(&self) -> bool {
        self.redo.is_empty() && self.undo.is_empty() && self.losers.is_empty()
    }
}

/// Analyzes a verified log for crash recovery.
///
/// Redo repeats history from the last checkpoint: every record carrying
/// page images after it is replayed, guarded by page LSN, which covers
/// committed work as well as compensations already written by rollbacks.
/// Work of transactions without a commit or abort record is then undone
/// logically, newest record first.
///
/// A bulk load spread over several records is replayed only when its
/// closing `BulkLoad` record made it into the log; parts without one are
/// dropped.
pub struct RecoveryManager;

impl RecoveryManager {
    /// Builds the recovery plan for `records`.
    pub fn analyze(records: Vec<LogRecord>) -> Result<RecoveryPlan> {
        let mut plan = RecoveryPlan::default();

        let checkpoint = records
            .iter()
            .rev()
            .find(|r| r.op == LogOp::Checkpoint)
            .map(|r| r.lsn);
        plan.checkpoint_lsn = checkpoint;
        let redo_from = checkpoint.unwrap_or(Lsn::INVALID);

        let mut active: HashMap<TxnId, Vec<LogRecord>> = HashMap::new();
        let mut committed = HashSet::new();
        let mut aborted = HashSet::new();
        let mut load_parts: HashMap<TxnId, Vec<LogRecord>> = HashMap::new();

        for record in records {
            plan.last_lsn = plan.last_lsn.max(record.lsn);
            let txn_id = record.txn_id;
            if txn_id != TxnId::SYSTEM {
                plan.max_txn_id = plan.max_txn_id.max(txn_id);
            }

            match record.op {
                LogOp::Begin => {
                    active.entry(txn_id).or_default();
                }
                LogOp::Commit => {
                    active.remove(&txn_id);
                    committed.insert(txn_id);
                }
                LogOp::Abort => {
                    active.remove(&txn_id);
                    aborted.insert(txn_id);
                }
                LogOp::Checkpoint => {
                    // A malformed payload is corruption, not an empty checkpoint.
                    CheckpointPayload::deserialize(&record.redo)?;
                }
                LogOp::Insert | LogOp::Update | LogOp::Delete => {
                    if !committed.contains(&txn_id) && !aborted.contains(&txn_id) {
                        active.entry(txn_id).or_default().push(record.clone());
                    }
                    if record.lsn > redo_from {
                        plan.redo.push(record);
                    }
                }
                LogOp::Compensation => {
                    if record.lsn > redo_from {
                        plan.redo.push(record);
                    }
                }
                LogOp::BulkLoadPart => {
                    load_parts.entry(txn_id).or_default().push(record);
                }
                LogOp::BulkLoad => {
                    let parts = load_parts.remove(&txn_id).unwrap_or_default();
                    if record.lsn > redo_from {
                        plan.redo.extend(parts);
                        plan.redo.push(record);
                    }
                }
            }
        }

        if !load_parts.is_empty() {
            let records: usize = load_parts.values().map(Vec::len).sum();
            warn!(
                loads = load_parts.len(),
                records,
                "Discarding bulk load records without a closing record"
            );
        }

        let mut losers: Vec<TxnId> = active.keys().copied().collect();
        losers.sort();
        let mut undo: Vec<LogRecord> = active.into_values().flatten().collect();
        undo.sort_by(|a, b| b.lsn.cmp(&a.lsn));

        if !losers.is_empty() {
            warn!(
                losers = losers.len(),
                undo_records = undo.len(),
                "WAL contains unfinished transactions"
            );
        }

        plan.losers = losers;
        plan.undo = undo;
        plan.committed = committed.len();
        plan.aborted = aborted.len();
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{PageImage, UndoPayload};
    use crate::segment::LogFile;
    use bytes::{Bytes, BytesMut};
    use strata_common::PageId;
    use tempfile::tempdir;

    fn record(lsn: u64, txn: u64, op: LogOp) -> LogRecord {
        let (redo, undo) = if op.has_page_images() {
            let images = vec![PageImage {
                page_id: PageId(1),
                data: Bytes::from(vec![0u8; 32]),
            }];
            let undo = if op.is_undoable() {
                UndoPayload {
                    key: Bytes::from(format!("k{}", lsn)),
                    prior: None,
                }
                .serialize()
            } else {
                Bytes::new()
            };
            (PageImage::encode_all(&images), undo)
        } else if op == LogOp::Checkpoint {
            (CheckpointPayload::default().serialize(), Bytes::new())
        } else {
            (Bytes::new(), Bytes::new())
        };
        let mut r = LogRecord::new(TxnId(txn), op, PageId(1), redo, undo);
        r.lsn = Lsn(lsn);
        r
    }

    fn write_records(path: &Path, records: &[LogRecord]) -> LogFile {
        let mut file = LogFile::create(path, 4096, Lsn::FIRST).unwrap();
        let mut buf = BytesMut::new();
        for r in records {
            r.serialize_into(&mut buf);
        }
        file.append(&buf).unwrap();
        file
    }

    #[test]
    fn test_scan_all_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scan.wal");
        let records = vec![
            record(1, 1, LogOp::Begin),
            record(2, 1, LogOp::Insert),
            record(3, 1, LogOp::Commit),
        ];
        write_records(&path, &records);

        let scan = WalReader::scan_path(&path).unwrap();
        assert_eq!(scan.records, records);
        assert!(!scan.has_torn_tail());
        assert!(scan.tail_error.is_none());
        assert_eq!(scan.next_lsn(), Lsn(4));
    }

    #[test]
    fn test_scan_stops_at_corrupt_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.wal");
        let records = vec![
            record(1, 1, LogOp::Begin),
            record(2, 1, LogOp::Insert),
            record(3, 1, LogOp::Commit),
        ];
        let mut file = write_records(&path, &records);
        let first_two = (records[0].size_on_disk() + records[1].size_on_disk()) as u64;

        // Flip a byte inside the third record
        let mut body = file.read_body().unwrap();
        let idx = first_two as usize + 10;
        body[idx] ^= 0xFF;
        file.truncate_body(0).unwrap();
        file.append(&body).unwrap();

        let scan = WalReader::scan(&mut file).unwrap();
        assert_eq!(scan.records.len(), 2);
        assert_eq!(scan.valid_len, first_two);
        assert!(scan.has_torn_tail());
        assert!(matches!(
            scan.tail_error,
            Some(StrataError::WalCorruption { .. })
        ));
    }

    #[test]
    fn test_scan_stops_at_partial_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.wal");
        let records = vec![record(1, 1, LogOp::Begin), record(2, 1, LogOp::Insert)];
        let mut file = write_records(&path, &records);
        let keep = records[0].size_on_disk() as u64 + 20;
        file.truncate_body(keep).unwrap();

        let scan = WalReader::scan(&mut file).unwrap();
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.valid_len, records[0].size_on_disk() as u64);
        assert!(scan.has_torn_tail());
    }

    #[test]
    fn test_scan_stops_at_lsn_gap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gap.wal");
        let records = vec![
            record(1, 1, LogOp::Begin),
            record(2, 1, LogOp::Insert),
            // Records 3 and 4 never reached the file
            record(5, 1, LogOp::Commit),
        ];
        write_records(&path, &records);

        let scan = WalReader::scan_path(&path).unwrap();
        assert_eq!(scan.records.len(), 2);
        assert!(scan.has_torn_tail());
        assert!(matches!(
            scan.tail_error,
            Some(StrataError::WalCorruption { lsn: 5, .. })
        ));
        assert_eq!(scan.next_lsn(), Lsn(3));
    }

    #[test]
    fn test_next_lsn_respects_base() {
        let scan = LogScan {
            base_lsn: Lsn(90),
            ..Default::default()
        };
        assert_eq!(scan.next_lsn(), Lsn(90));

        let scan = LogScan::default();
        assert_eq!(scan.next_lsn(), Lsn::FIRST);
    }

    #[test]
    fn test_recovery_committed_txns() {
        let records = vec![
            record(1, 1, LogOp::Begin),
            record(2, 1, LogOp::Insert),
            record(3, 1, LogOp::Commit),
            record(4, 2, LogOp::Begin),
            record(5, 2, LogOp::Insert),
            record(6, 2, LogOp::Commit),
        ];

        let plan = RecoveryManager::analyze(records).unwrap();
        assert_eq!(plan.committed, 2);
        assert!(plan.losers.is_empty());
        assert!(plan.undo.is_empty());
        assert_eq!(plan.redo.len(), 2);
        assert_eq!(plan.last_lsn, Lsn(6));
        assert_eq!(plan.max_txn_id, TxnId(2));
    }

    #[test]
    fn test_recovery_uncommitted_txn() {
        let records = vec![
            record(1, 1, LogOp::Begin),
            record(2, 1, LogOp::Insert),
            record(3, 1, LogOp::Commit),
            record(4, 2, LogOp::Begin),
            record(5, 2, LogOp::Insert),
            record(6, 2, LogOp::Delete),
        ];

        let plan = RecoveryManager::analyze(records).unwrap();
        assert_eq!(plan.losers, vec![TxnId(2)]);
        assert_eq!(plan.undo.len(), 2);
        // Newest first
        assert_eq!(plan.undo[0].lsn, Lsn(6));
        assert_eq!(plan.undo[1].lsn, Lsn(5));
        // History is repeated before undo
        assert_eq!(plan.redo.len(), 3);
    }

    #[test]
    fn test_recovery_aborted_txn_not_undone() {
        let records = vec![
            record(1, 1, LogOp::Begin),
            record(2, 1, LogOp::Insert),
            record(3, 1, LogOp::Compensation),
            record(4, 1, LogOp::Abort),
        ];

        let plan = RecoveryManager::analyze(records).unwrap();
        assert_eq!(plan.aborted, 1);
        assert!(plan.losers.is_empty());
        assert!(plan.undo.is_empty());
        assert_eq!(plan.redo.len(), 2);
    }

    #[test]
    fn test_recovery_starts_at_checkpoint() {
        let records = vec![
            record(1, 1, LogOp::Begin),
            record(2, 1, LogOp::Insert),
            record(3, 2, LogOp::Begin),
            record(4, 2, LogOp::Insert),
            record(5, 2, LogOp::Commit),
            record(6, 0, LogOp::Checkpoint),
            record(7, 1, LogOp::Insert),
        ];

        let plan = RecoveryManager::analyze(records).unwrap();
        assert_eq!(plan.checkpoint_lsn, Some(Lsn(6)));
        // Only records after the checkpoint are replayed
        assert_eq!(plan.redo.len(), 1);
        assert_eq!(plan.redo[0].lsn, Lsn(7));
        // The loser's records before the checkpoint are still undone
        assert_eq!(plan.losers, vec![TxnId(1)]);
        assert_eq!(plan.undo.len(), 2);
    }

    #[test]
    fn test_recovery_bulk_load_is_redone() {
        let records = vec![record(1, 3, LogOp::BulkLoad)];
        let plan = RecoveryManager::analyze(records).unwrap();
        assert_eq!(plan.redo.len(), 1);
        assert!(plan.losers.is_empty());
    }

    #[test]
    fn test_recovery_chained_bulk_load() {
        let records = vec![
            record(1, 3, LogOp::BulkLoadPart),
            record(2, 3, LogOp::BulkLoadPart),
            record(3, 4, LogOp::Begin),
            record(4, 3, LogOp::BulkLoad),
            record(5, 4, LogOp::Insert),
            record(6, 4, LogOp::Commit),
        ];
        let plan = RecoveryManager::analyze(records).unwrap();
        let redo: Vec<_> = plan.redo.iter().map(|r| (r.lsn.0, r.op)).collect();
        assert_eq!(
            redo,
            vec![
                (1, LogOp::BulkLoadPart),
                (2, LogOp::BulkLoadPart),
                (4, LogOp::BulkLoad),
                (5, LogOp::Insert),
            ]
        );
        assert!(plan.losers.is_empty());
    }

    #[test]
    fn test_recovery_drops_unfinished_bulk_load() {
        let records = vec![
            record(1, 1, LogOp::Begin),
            record(2, 1, LogOp::Insert),
            record(3, 1, LogOp::Commit),
            record(4, 2, LogOp::BulkLoadPart),
            record(5, 2, LogOp::BulkLoadPart),
        ];
        let plan = RecoveryManager::analyze(records).unwrap();
        assert_eq!(plan.redo.len(), 1);
        assert_eq!(plan.redo[0].lsn, Lsn(2));
        assert!(plan.losers.is_empty());
        // The loader's id is still never handed out again
        assert_eq!(plan.max_txn_id, TxnId(2));
        assert_eq!(plan.last_lsn, Lsn(5));
    }
}
