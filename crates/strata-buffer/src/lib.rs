//! Buffer pool management for Strata.
//!
//! This crate provides in-memory page caching with:
//! - Fixed-size buffer pool sized from the storage configuration
//! - Clock eviction policy for cache management
//! - Pin counting for concurrent access
//! - Dirty page tracking with write-ahead-log ordered write-back

mod frame;
mod pool;
mod replacer;

pub use frame::{BufferFrame, FrameId};
pub use pool::{BufferPool, BufferPoolConfig, BufferPoolStats, PageIo, PageReadGuard};
pub use replacer::{ClockReplacer, Replacer};
