//! Strata: an embedded, transactional key-value storage engine.
//!
//! A [`Database`] owns one data file of fixed-size pages holding a B+ tree
//! and one write-ahead log. Keys and values are opaque byte strings ordered
//! byte-wise. Operations run either inside explicit transactions
//! (`begin`/`txn_*`/`commit`/`rollback`) or as single-operation
//! transactions. Next to the tree each database keeps a cache of compiled
//! plans and the table statistics an external planner consults.

mod database;

pub use database::{CheckpointReport, Database, RecoveryReport};

pub use strata_common::{
    BulkLoadConfig, EngineConfig, PlanCacheConfig, Result, StatisticsConfig, StorageConfig,
    StrataError, TxnConfig, TxnId, WalConfig,
};
pub use strata_planner::{
    CachedPlan, CompiledPlan, DelimitedRowDecoder, Fingerprint, PlanCache, PlanCacheStats,
    Predicate, RowDecoder, TableDef, TableStatistics,
};
pub use strata_storage::RangeCursor;
