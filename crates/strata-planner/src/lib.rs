//! Planner support for Strata.
//!
//! The SQL layer compiles statements and chooses plans; this crate gives it
//! a per-database cache of compiled plans and the table statistics its cost
//! model reads.

pub mod plan_cache;
pub mod statistics;

pub use plan_cache::{CachedPlan, CompiledPlan, EntryInfo, Fingerprint, PlanCache, PlanCacheStats};
pub use statistics::{
    ColumnStatistics, DelimitedRowDecoder, DistinctSketch, Histogram, HistogramBucket, Predicate,
    RowDecoder, StatisticsCollector, TableDef, TableStatistics,
};
