//! Write-Ahead Log (WAL) for Strata.
//!
//! Provides durability by logging all modifications before they are applied.
//! Supports crash recovery through log replay.

mod constants;
pub mod reader;
pub mod record;
pub mod segment;
pub mod writer;

pub use constants::MAX_PAYLOAD_SIZE;
pub use reader::{LogScan, RecoveryManager, RecoveryPlan, WalReader};
pub use record::{CheckpointPayload, LogOp, LogRecord, PageImage, UndoPayload};
pub use segment::{LogFile, LogFileHeader};
pub use writer::WalWriter;
