//! Transactions for Strata.
//!
//! Provides strict two-phase key-range locking with deadlock detection and
//! the transaction manager that logs, applies and undoes tree mutations on
//! behalf of transactions.

pub mod deadlock;
pub mod lock;
pub mod manager;

pub use deadlock::WaitForGraph;
pub use lock::{KeyRange, LockManager, LockMode, RangeLock};
pub use manager::{Transaction, TransactionManager, TxnState, UndoEntry};
