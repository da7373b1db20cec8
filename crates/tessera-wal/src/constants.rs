//! WAL constants for record format and segment configuration.

// Log record header constants

/// Size of the record header in bytes.
pub const HEADER_SIZE: usize = 32;

/// Size of the checksum in bytes.
pub const CHECKSUM_SIZE: usize = 4;

/// Maximum payload size. A full 16 KB page image must fit.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

// Header field offsets for pointer-based parsing

/// Offset of LSN field in header.
pub const OFF_LSN: usize = 0;

/// Offset of record type tag in header.
pub const OFF_RECORD_TYPE: usize = 8;

/// Offset of page segment id in header.
pub const OFF_SEGMENT: usize = 10;

/// Offset of page index in header.
pub const OFF_PAGE_INDEX: usize = 14;

/// Offset of operation id in header.
pub const OFF_OP_ID: usize = 22;

/// Offset of payload length field in header.
pub const OFF_PAYLOAD_LEN: usize = 30;

// Segment constants

/// Default segment size (16 MB).
pub const DEFAULT_SEGMENT_SIZE: u32 = 16 * 1024 * 1024;

/// Segment header size in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 32;

/// Magic bytes identifying a WAL segment.
pub const SEGMENT_MAGIC: [u8; 4] = *b"TWAL";

/// Current format version.
pub const SEGMENT_VERSION: u32 = 1;

/// File extension of WAL segment files.
pub const SEGMENT_EXTENSION: &str = "wal";
