//! Strata common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all Strata components.

pub mod config;
pub mod error;
pub mod page;
pub mod types;

pub use config::{
    BulkLoadConfig, EngineConfig, PlanCacheConfig, StatisticsConfig, StorageConfig, TxnConfig,
    WalConfig,
};
pub use error::{Result, StrataError};
pub use page::{PageHeader, PageId, PageKind, DEFAULT_PAGE_SIZE};
pub use types::{LogDurability, Lsn, TxnId};
