//! Configuration structures for Strata.

use crate::error::{Result, StrataError};
use crate::page::{validate_page_size, PageHeader, DEFAULT_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-entry overhead of a leaf entry on a page (key_len u16 + value_len u16).
pub const LEAF_ENTRY_OVERHEAD: usize = 4;

/// Per-entry overhead of an internal entry on a page (key_len u16 + child u32).
pub const INTERNAL_ENTRY_OVERHEAD: usize = 6;

/// Storage configuration for the data file and B+ tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the data file.
    pub data_path: PathBuf,
    /// Page size in bytes. Fixed when the file is created.
    pub page_size: usize,
    /// Maximum number of children per internal node. Fixed when the file is created.
    pub order: usize,
    /// Maximum key size in bytes.
    pub max_key_size: usize,
    /// Maximum value size in bytes.
    pub max_value_size: usize,
    /// Buffer pool size in number of pages.
    pub buffer_pool_pages: usize,
    /// Upper bound on the data file size in pages (None = grow until the disk is full).
    pub max_pages: Option<u32>,
    /// Enable fsync of the data file on checkpoint.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./strata.db"),
            page_size: DEFAULT_PAGE_SIZE,
            order: 32,
            max_key_size: 128,
            max_value_size: 128,
            buffer_pool_pages: 1024, // 8 MB with 8 KB pages
            max_pages: None,
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Minimum number of children of a non-root internal node.
    pub fn min_children(&self) -> usize {
        self.order.div_ceil(2)
    }

    /// Maximum number of entries in a leaf.
    pub fn max_leaf_entries(&self) -> usize {
        self.order - 1
    }

    /// Minimum number of entries in a non-root leaf.
    pub fn min_leaf_entries(&self) -> usize {
        self.min_children() - 1
    }

    /// Checks that the geometry is usable.
    ///
    /// A full leaf and a full internal node of maximal keys must each fit
    /// in one page.
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if self.order < 3 {
            return Err(StrataError::InvalidConfig(format!(
                "order {} must be at least 3",
                self.order
            )));
        }
        if self.order > u16::MAX as usize {
            return Err(StrataError::InvalidConfig(format!(
                "order {} exceeds {}",
                self.order,
                u16::MAX
            )));
        }
        if self.max_key_size == 0 || self.max_key_size > u16::MAX as usize {
            return Err(StrataError::InvalidConfig(format!(
                "max key size {} out of range",
                self.max_key_size
            )));
        }
        if self.max_value_size > u16::MAX as usize {
            return Err(StrataError::InvalidConfig(format!(
                "max value size {} out of range",
                self.max_value_size
            )));
        }
        let usable = self.page_size - PageHeader::SIZE;
        let leaf_bytes =
            (self.order - 1) * (LEAF_ENTRY_OVERHEAD + self.max_key_size + self.max_value_size);
        let internal_bytes = (self.order - 1) * (INTERNAL_ENTRY_OVERHEAD + self.max_key_size);
        if leaf_bytes > usable || internal_bytes > usable {
            return Err(StrataError::InvalidConfig(format!(
                "order {} with keys up to {} and values up to {} does not fit a {} byte page",
                self.order, self.max_key_size, self.max_value_size, self.page_size
            )));
        }
        if self.buffer_pool_pages < 16 {
            return Err(StrataError::InvalidConfig(format!(
                "buffer pool of {} pages is too small (min 16)",
                self.buffer_pool_pages
            )));
        }
        Ok(())
    }

    /// Returns the total buffer pool size in bytes.
    pub fn buffer_pool_size_bytes(&self) -> usize {
        self.buffer_pool_pages * self.page_size
    }
}

/// Write-ahead log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Path of the WAL file.
    pub wal_path: PathBuf,
    /// Enable fsync when records are made durable.
    pub fsync_enabled: bool,
    /// Buffered bytes that trigger a write to the OS without waiting for a commit.
    pub group_commit_bytes: usize,
    /// How long a commit leader waits for followers before syncing (0 = no wait).
    pub group_commit_delay_us: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            wal_path: PathBuf::from("./strata.wal"),
            fsync_enabled: true,
            group_commit_bytes: 1024 * 1024, // 1 MB
            group_commit_delay_us: 0,
        }
    }
}

impl WalConfig {
    /// Returns the group commit delay as a Duration.
    pub fn group_commit_delay(&self) -> Duration {
        Duration::from_micros(self.group_commit_delay_us)
    }
}

/// Transaction manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnConfig {
    /// How long a transaction waits for a conflicting lock before giving up.
    pub lock_timeout_ms: u64,
    /// Overwrite existing keys on insert instead of failing with DuplicateKey.
    pub upsert: bool,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            upsert: false,
        }
    }
}

impl TxnConfig {
    /// Returns the lock wait timeout as a Duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Bulk loader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkLoadConfig {
    /// Target fraction of each node filled by the loader (0.5 to 1.0).
    pub fill_factor: f64,
    /// Page image bytes per log record. Larger loads continue in further
    /// records.
    pub record_bytes: usize,
}

impl Default for BulkLoadConfig {
    fn default() -> Self {
        Self {
            fill_factor: 0.9,
            record_bytes: 8 * 1024 * 1024, // 8 MB
        }
    }
}

/// Plan cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCacheConfig {
    /// Maximum number of cached plans.
    pub max_entries: usize,
    /// Optional budget on the summed approximate size of cached plans.
    pub max_bytes: Option<usize>,
}

impl Default for PlanCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_bytes: None,
        }
    }
}

/// Statistics collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    /// Number of equal-depth histogram buckets per column.
    pub histogram_buckets: usize,
    /// Number of hash values kept by the distinct-count sketch.
    pub distinct_sketch_size: usize,
    /// Number of most common values tracked per column.
    pub most_common_values: usize,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            histogram_buckets: 10,
            distinct_sketch_size: 1024,
            most_common_values: 5,
        }
    }
}

/// Top-level configuration of one database instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub wal: WalConfig,
    pub txn: TxnConfig,
    pub bulk_load: BulkLoadConfig,
    pub plan_cache: PlanCacheConfig,
    pub statistics: StatisticsConfig,
}

impl EngineConfig {
    /// Creates a configuration with the data file and WAL inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let mut config = Self::default();
        config.storage.data_path = dir.join("strata.db");
        config.wal.wal_path = dir.join("strata.wal");
        config
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        if !(0.5..=1.0).contains(&self.bulk_load.fill_factor) {
            return Err(StrataError::InvalidConfig(format!(
                "fill factor {} must be between 0.5 and 1.0",
                self.bulk_load.fill_factor
            )));
        }
        if self.bulk_load.record_bytes < self.storage.page_size {
            return Err(StrataError::InvalidConfig(format!(
                "bulk load record size {} is smaller than a page ({})",
                self.bulk_load.record_bytes, self.storage.page_size
            )));
        }
        if self.plan_cache.max_entries == 0 {
            return Err(StrataError::InvalidConfig(
                "plan cache needs room for at least one entry".to_string(),
            ));
        }
        if self.statistics.histogram_buckets == 0 {
            return Err(StrataError::InvalidConfig(
                "histogram needs at least one bucket".to_string(),
            ));
        }
        if self.statistics.distinct_sketch_size < 2 {
            return Err(StrataError::InvalidConfig(
                "distinct sketch needs at least two slots".to_string(),
            ));
        }
        Ok(())
    }
}
