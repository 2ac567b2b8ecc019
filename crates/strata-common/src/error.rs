//! Error types for Strata.

use thiserror::Error;

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors that can occur in Strata operations.
#[derive(Debug, Error)]
pub enum StrataError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Storage errors
    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: u32 },

    #[error("Page corrupted: {page_id}, reason: {reason}")]
    PageCorrupted { page_id: u32, reason: String },

    #[error("Storage full: cannot grow beyond {page_count} pages")]
    StorageFull { page_count: u32 },

    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("Incompatible format: found {found}, supported {supported}")]
    IncompatibleFormat { found: String, supported: String },

    #[error("Unrecoverable state: {0}")]
    UnrecoverableState(String),

    // B+ tree errors
    #[error("Key not found")]
    NotFound,

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Empty keys are not allowed")]
    EmptyKey,

    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Value too large: {size} bytes (max {max})")]
    ValueTooLarge { size: usize, max: usize },

    #[error("B+ tree corrupted: {0}")]
    TreeCorrupted(String),

    #[error("Unsorted bulk input at position {position}")]
    UnsortedInput { position: usize },

    // WAL errors
    #[error("WAL corrupted at LSN {lsn}: {reason}")]
    WalCorruption { lsn: u64, reason: String },

    #[error("WAL unavailable after a failed write: {0}")]
    WalFailed(String),

    // Transaction errors
    #[error("Transaction {txn_id} timed out after {waited_ms} ms waiting for a lock")]
    LockTimeout { txn_id: u64, waited_ms: u64 },

    #[error("Deadlock detected, transaction {txn_id} chosen as victim")]
    Deadlock { txn_id: u64 },

    #[error("Transaction {txn_id} is already closed")]
    TransactionAlreadyClosed { txn_id: u64 },

    #[error("Transaction not found: {txn_id}")]
    TransactionNotFound { txn_id: u64 },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Lifecycle errors
    #[error("Database is closed")]
    DatabaseClosed,

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Returns true for failures that abort the whole transaction.
    ///
    /// The transaction manager rolls the transaction back before
    /// surfacing one of these to the caller.
    pub fn is_transaction_fatal(&self) -> bool {
        matches!(
            self,
            StrataError::Deadlock { .. } | StrataError::LockTimeout { .. }
        )
    }

    /// Maps an I/O error, translating out-of-space conditions to `StorageFull`.
    pub fn from_io(err: std::io::Error, page_count: u32) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            StrataError::StorageFull { page_count }
        } else {
            StrataError::Io(err)
        }
    }
}
