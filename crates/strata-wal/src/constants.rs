//! WAL constants for record format and file layout.

/// Size of the record header in bytes.
pub const HEADER_SIZE: usize = 32;

/// Size of the checksum in bytes.
pub const CHECKSUM_SIZE: usize = 4;

/// Upper bound on a single payload. A length above this is treated as corruption.
pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024 * 1024;

// Header field offsets

/// Offset of the redo payload length in the header.
pub const OFF_REDO_LEN: usize = 24;

/// Offset of the undo payload length in the header.
pub const OFF_UNDO_LEN: usize = 28;

// File constants

/// File header size in bytes.
pub const FILE_HEADER_SIZE: usize = 32;

/// Magic bytes identifying a Strata WAL file.
pub const FILE_MAGIC: [u8; 4] = *b"SWAL";

/// Current WAL format version.
pub const FILE_VERSION: u32 = 1;
