//! WAL log record format.

use crate::constants::{CHECKSUM_SIZE, HEADER_SIZE, MAX_PAYLOAD_SIZE, OFF_REDO_LEN, OFF_UNDO_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use strata_common::page::read_u32;
use strata_common::{Lsn, PageId, Result, StrataError, TxnId};

/// Operation recorded by a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogOp {
    /// Transaction begin.
    Begin = 1,
    /// Transaction commit.
    Commit = 2,
    /// Transaction abort, written after all compensations.
    Abort = 3,
    /// Key inserted.
    Insert = 10,
    /// Existing key overwritten (upsert).
    Update = 11,
    /// Key deleted.
    Delete = 12,
    /// Undo step applied during rollback. Redo only.
    Compensation = 13,
    /// Bulk load, closing record. Self-committing; the load's earlier
    /// `BulkLoadPart` records take effect with it.
    BulkLoad = 20,
    /// Page images of a bulk load too large for one record. Ignored unless
    /// the same transaction's `BulkLoad` record follows.
    BulkLoadPart = 21,
    /// Checkpoint marker.
    Checkpoint = 30,
}

impl LogOp {
    /// Returns true for records whose redo payload carries page images.
    pub fn has_page_images(&self) -> bool {
        matches!(
            self,
            LogOp::Insert
                | LogOp::Update
                | LogOp::Delete
                | LogOp::Compensation
                | LogOp::BulkLoad
                | LogOp::BulkLoadPart
        )
    }

    /// Returns true for records that carry a logical undo payload.
    pub fn is_undoable(&self) -> bool {
        matches!(self, LogOp::Insert | LogOp::Update | LogOp::Delete)
    }
}

impl TryFrom<u8> for LogOp {
    type Error = StrataError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(LogOp::Begin),
            2 => Ok(LogOp::Commit),
            3 => Ok(LogOp::Abort),
            10 => Ok(LogOp::Insert),
            11 => Ok(LogOp::Update),
            12 => Ok(LogOp::Delete),
            13 => Ok(LogOp::Compensation),
            20 => Ok(LogOp::BulkLoad),
            21 => Ok(LogOp::BulkLoadPart),
            30 => Ok(LogOp::Checkpoint),
            _ => Err(StrataError::WalCorruption {
                lsn: 0,
                reason: format!("invalid record op: {}", value),
            }),
        }
    }
}

/// A single log record in the WAL.
///
/// Record format on disk:
/// - header (32 bytes):
///   - lsn: 8 bytes
///   - txn_id: 8 bytes
///   - op: 1 byte
///   - flags: 1 byte
///   - reserved: 2 bytes
///   - page_id: 4 bytes (leaf touched by the mutation, 0 if none)
///   - redo_len: 4 bytes
///   - undo_len: 4 bytes
/// - redo payload: variable length
/// - undo payload: variable length
/// - checksum: 4 bytes (CRC32 of header + payloads)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// LSN of this record. Assigned by the writer on append.
    pub lsn: Lsn,
    /// Owning transaction.
    pub txn_id: TxnId,
    /// Recorded operation.
    pub op: LogOp,
    /// Record flags.
    pub flags: u8,
    /// Page the operation targeted.
    pub page_id: PageId,
    /// Redo payload (encoded page images for mutations).
    pub redo: Bytes,
    /// Undo payload (encoded `UndoPayload` for undoable mutations).
    pub undo: Bytes,
}

impl LogRecord {
    /// Size of the record header in bytes.
    pub const HEADER_SIZE: usize = HEADER_SIZE;
    /// Size of the checksum in bytes.
    pub const CHECKSUM_SIZE: usize = CHECKSUM_SIZE;

    /// Creates a new log record. The LSN is filled in on append.
    pub fn new(txn_id: TxnId, op: LogOp, page_id: PageId, redo: Bytes, undo: Bytes) -> Self {
        Self {
            lsn: Lsn::INVALID,
            txn_id,
            op,
            flags: 0,
            page_id,
            redo,
            undo,
        }
    }

    /// Creates a record with no payloads.
    pub fn marker(txn_id: TxnId, op: LogOp) -> Self {
        Self::new(txn_id, op, PageId::HEADER, Bytes::new(), Bytes::new())
    }

    /// Returns the total size of this record on disk.
    pub fn size_on_disk(&self) -> usize {
        HEADER_SIZE + self.redo.len() + self.undo.len() + CHECKSUM_SIZE
    }

    /// Serializes this record into `buf`.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.reserve(self.size_on_disk());

        buf.put_u64_le(self.lsn.0);
        buf.put_u64_le(self.txn_id.0);
        buf.put_u8(self.op as u8);
        buf.put_u8(self.flags);
        buf.put_u16_le(0);
        buf.put_u32_le(self.page_id.0);
        buf.put_u32_le(self.redo.len() as u32);
        buf.put_u32_le(self.undo.len() as u32);

        buf.put_slice(&self.redo);
        buf.put_slice(&self.undo);

        let checksum = crc32fast::hash(&buf[start..]);
        buf.put_u32_le(checksum);
    }

    /// Serializes this record to bytes.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size_on_disk());
        self.serialize_into(&mut buf);
        buf.freeze()
    }

    /// Reads the total encoded length from a record header.
    pub fn encoded_len(header: &[u8]) -> Result<usize> {
        if header.len() < HEADER_SIZE {
            return Err(StrataError::WalCorruption {
                lsn: 0,
                reason: "record header truncated".to_string(),
            });
        }
        let redo_len = read_u32(header, OFF_REDO_LEN) as usize;
        let undo_len = read_u32(header, OFF_UNDO_LEN) as usize;
        if redo_len > MAX_PAYLOAD_SIZE || undo_len > MAX_PAYLOAD_SIZE {
            return Err(StrataError::WalCorruption {
                lsn: 0,
                reason: format!("payload too large: redo={}, undo={}", redo_len, undo_len),
            });
        }
        Ok(HEADER_SIZE + redo_len + undo_len + CHECKSUM_SIZE)
    }

    /// Deserializes a record from bytes, verifying its checksum.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let total = Self::encoded_len(data)?;
        if data.len() < total {
            return Err(StrataError::WalCorruption {
                lsn: 0,
                reason: "truncated record".to_string(),
            });
        }

        let body = &data[..total - CHECKSUM_SIZE];
        let stored_checksum = read_u32(data, total - CHECKSUM_SIZE);
        let computed_checksum = crc32fast::hash(body);

        let mut cursor = body;
        let lsn = Lsn(cursor.get_u64_le());

        if stored_checksum != computed_checksum {
            return Err(StrataError::WalCorruption {
                lsn: lsn.0,
                reason: format!(
                    "checksum mismatch: stored={}, computed={}",
                    stored_checksum, computed_checksum
                ),
            });
        }

        let txn_id = TxnId(cursor.get_u64_le());
        let op = LogOp::try_from(cursor.get_u8()).map_err(|_| StrataError::WalCorruption {
            lsn: lsn.0,
            reason: "invalid record op".to_string(),
        })?;
        let flags = cursor.get_u8();
        cursor.advance(2);
        let page_id = PageId(cursor.get_u32_le());
        let redo_len = cursor.get_u32_le() as usize;
        let undo_len = cursor.get_u32_le() as usize;

        let redo = Bytes::copy_from_slice(&cursor[..redo_len]);
        let undo = Bytes::copy_from_slice(&cursor[redo_len..redo_len + undo_len]);

        Ok(Self {
            lsn,
            txn_id,
            op,
            flags,
            page_id,
            redo,
            undo,
        })
    }
}

fn payload_error(what: &str) -> StrataError {
    StrataError::WalCorruption {
        lsn: 0,
        reason: format!("malformed {} payload", what),
    }
}

/// After-image of one page produced by a tree mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub page_id: PageId,
    pub data: Bytes,
}

impl PageImage {
    /// Bytes the count prefix of an encoded set takes.
    pub const SET_HEADER_LEN: usize = 4;

    /// Bytes this image takes inside an encoded set.
    pub fn encoded_len(&self) -> usize {
        8 + self.data.len()
    }

    /// Encodes a set of images as a redo payload.
    ///
    /// Layout: count u32, then per image: page_id u32, len u32, bytes.
    pub fn encode_all(images: &[PageImage]) -> Bytes {
        let total: usize = images.iter().map(PageImage::encoded_len).sum();
        let mut buf = BytesMut::with_capacity(Self::SET_HEADER_LEN + total);
        buf.put_u32_le(images.len() as u32);
        for image in images {
            buf.put_u32_le(image.page_id.0);
            buf.put_u32_le(image.data.len() as u32);
            buf.put_slice(&image.data);
        }
        buf.freeze()
    }

    /// Decodes a redo payload produced by `encode_all`.
    pub fn decode_all(payload: &Bytes) -> Result<Vec<PageImage>> {
        let mut data = &payload[..];
        if data.remaining() < 4 {
            return Err(payload_error("page image"));
        }
        let count = data.get_u32_le() as usize;
        let mut images = Vec::with_capacity(count.min(1024));
        let mut offset = 4;
        for _ in 0..count {
            if data.remaining() < 8 {
                return Err(payload_error("page image"));
            }
            let page_id = PageId(data.get_u32_le());
            let len = data.get_u32_le() as usize;
            offset += 8;
            if data.remaining() < len {
                return Err(payload_error("page image"));
            }
            images.push(PageImage {
                page_id,
                data: payload.slice(offset..offset + len),
            });
            data.advance(len);
            offset += len;
        }
        Ok(images)
    }
}

/// Logical undo information: the state a key had before the mutation.
///
/// Undo restores the key to `prior` (deleting it when `prior` is None),
/// so applying it more than once has the same effect as applying it once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoPayload {
    pub key: Bytes,
    pub prior: Option<Bytes>,
}

impl UndoPayload {
    /// Serializes the payload to bytes.
    ///
    /// Layout: key_len u32, key, has_prior u8, [prior_len u32, prior].
    pub fn serialize(&self) -> Bytes {
        let prior_len = self.prior.as_ref().map(|p| 4 + p.len()).unwrap_or(0);
        let mut buf = BytesMut::with_capacity(5 + self.key.len() + prior_len);
        buf.put_u32_le(self.key.len() as u32);
        buf.put_slice(&self.key);
        match self.prior {
            Some(ref prior) => {
                buf.put_u8(1);
                buf.put_u32_le(prior.len() as u32);
                buf.put_slice(prior);
            }
            None => buf.put_u8(0),
        }
        buf.freeze()
    }

    /// Deserializes the payload from bytes.
    pub fn deserialize(mut data: &[u8]) -> Result<Self> {
        if data.remaining() < 4 {
            return Err(payload_error("undo"));
        }
        let key_len = data.get_u32_le() as usize;
        if data.remaining() < key_len + 1 {
            return Err(payload_error("undo"));
        }
        let key = Bytes::copy_from_slice(&data[..key_len]);
        data.advance(key_len);

        let prior = match data.get_u8() {
            0 => None,
            1 => {
                if data.remaining() < 4 {
                    return Err(payload_error("undo"));
                }
                let len = data.get_u32_le() as usize;
                if data.remaining() < len {
                    return Err(payload_error("undo"));
                }
                Some(Bytes::copy_from_slice(&data[..len]))
            }
            _ => return Err(payload_error("undo")),
        };

        Ok(Self { key, prior })
    }
}

/// Payload of a checkpoint record: transactions active when it was taken.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointPayload {
    /// (transaction, LSN of its first record)
    pub active: Vec<(TxnId, Lsn)>,
}

impl CheckpointPayload {
    /// Serializes the payload to bytes.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.active.len() * 16);
        buf.put_u32_le(self.active.len() as u32);
        for (txn_id, lsn) in &self.active {
            buf.put_u64_le(txn_id.0);
            buf.put_u64_le(lsn.0);
        }
        buf.freeze()
    }

    /// Deserializes the payload from bytes.
    pub fn deserialize(mut data: &[u8]) -> Result<Self> {
        if data.remaining() < 4 {
            return Err(payload_error("checkpoint"));
        }
        let count = data.get_u32_le() as usize;
        if data.remaining() < count * 16 {
            return Err(payload_error("checkpoint"));
        }
        let active = (0..count)
            .map(|_| (TxnId(data.get_u64_le()), Lsn(data.get_u64_le())))
            .collect();
        Ok(Self { active })
    }

    /// Oldest first-LSN among the active transactions.
    pub fn oldest_lsn(&self) -> Option<Lsn> {
        self.active.iter().map(|(_, lsn)| *lsn).min()
    }
}
