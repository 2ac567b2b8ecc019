//! Identifiers shared between the log, the page cache, and transactions.

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Log Sequence Number - unique identifier for each log record.
///
/// LSNs are assigned by the WAL writer from a strictly increasing counter
/// and survive log truncation, so page LSNs stay comparable across
/// checkpoints.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Invalid/uninitialized LSN.
    pub const INVALID: Lsn = Lsn(0);

    /// First valid LSN.
    pub const FIRST: Lsn = Lsn(1);

    /// Returns true if this is a valid LSN.
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    /// Returns the LSN immediately after this one.
    pub fn next(&self) -> Self {
        Lsn(self.0 + 1)
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Owner of records that belong to no user transaction (checkpoints).
    pub const SYSTEM: TxnId = TxnId(0);

    /// First id handed out to user transactions.
    pub const FIRST: TxnId = TxnId(1);

    /// Returns the id after this one.
    pub fn next(&self) -> Self {
        TxnId(self.0 + 1)
    }
}

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Durability boundary of the write-ahead log.
///
/// The page cache consults this before writing a dirty page back: a page
/// whose LSN is above `durable_lsn()` may only be written after `force()`.
pub trait LogDurability: Send + Sync {
    /// Highest LSN known to be on stable storage.
    fn durable_lsn(&self) -> Lsn;

    /// Makes every appended record durable, returning the new durable LSN.
    fn force(&self) -> Result<Lsn>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_validity() {
        assert!(!Lsn::INVALID.is_valid());
        assert!(Lsn::FIRST.is_valid());
        assert_eq!(Lsn::FIRST.next(), Lsn(2));
    }

    #[test]
    fn test_lsn_ordering() {
        assert!(Lsn(1) < Lsn(2));
        assert!(Lsn(100) > Lsn(99));
        assert_eq!(Lsn::default(), Lsn::INVALID);
    }

    #[test]
    fn test_txn_id_display() {
        assert_eq!(TxnId(12).to_string(), "txn:12");
        assert_eq!(TxnId::FIRST.next(), TxnId(2));
        assert!(TxnId::SYSTEM < TxnId::FIRST);
    }
}
