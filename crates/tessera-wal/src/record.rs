//! WAL record envelope format.

use crate::constants::{
    CHECKSUM_SIZE, HEADER_SIZE, MAX_PAYLOAD_SIZE, OFF_PAYLOAD_LEN,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tessera_common::{PageId, Result, TesseraError, INVALID_PAGE_INDEX};

/// Log Sequence Number - unique identifier for each log record.
///
/// LSN is a monotonically increasing 64-bit value that identifies
/// the position of a record in the WAL. It encodes both the log segment
/// ID and the byte offset within that segment, so comparing two LSNs
/// compares their append order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Invalid/uninitialized LSN. Pages that were never modified carry it.
    pub const INVALID: Lsn = Lsn(0);

    /// Creates a new LSN from log segment ID and offset.
    pub fn new(segment_id: u32, offset: u32) -> Self {
        Self(((segment_id as u64) << 32) | (offset as u64))
    }

    /// Returns the log segment ID portion of this LSN.
    pub fn segment_id(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns the offset within the log segment.
    pub fn offset(&self) -> u32 {
        self.0 as u32
    }

    /// Returns true if this is a valid LSN.
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    /// Returns the next LSN after advancing by the given number of bytes.
    pub fn advance(&self, bytes: u32) -> Self {
        Self(self.0 + bytes as u64)
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.segment_id(), self.offset())
    }
}

/// Operation id carried by records that belong to no operation.
///
/// Page allocation and free-list maintenance are logged this way and are
/// always replayed.
pub const AUTONOMOUS_OP: u64 = 0;

/// Record type tags.
///
/// Delta tags describe a change to the page named in the envelope. The
/// remaining tags are operation boundaries and checkpoint markers and carry
/// no page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum RecordType {
    /// Operation begin. Its LSN is the operation id.
    OperationBegin = 1,
    /// Operation commit.
    OperationCommit = 2,
    /// Operation abort.
    OperationAbort = 3,
    /// Checkpoint marker; payload is the redo LSN.
    Checkpoint = 10,
    /// Format a page as an empty tree page.
    InitNewPage = 20,
    /// Insert one entry at an index.
    InsertEntry = 21,
    /// Remove a contiguous run of entries.
    RemoveEntries = 22,
    /// Truncate a page at a split point and link it to its new sibling.
    Split = 23,
    /// Populate a new sibling from the upper half of its source page.
    SplitForward = 24,
    /// Append all entries of a right sibling.
    Merge = 25,
    /// Copy one entry from another page over a destination index.
    InnerReplace = 26,
    /// Overwrite one child pointer of an inner page.
    SetChild = 27,
    /// Overwrite the forward link of a tree page.
    SetForward = 28,
    /// Record a new tree root and height in the meta page.
    SetTreeRoot = 29,
    /// Record the free-list head and next unused index in the meta page.
    SetFreeList = 30,
    /// Format a page as a free-list page.
    FreePage = 31,
    /// Full page image.
    PageSnapshot = 32,
}

impl RecordType {
    /// Returns true for records that modify a page.
    pub fn is_delta(&self) -> bool {
        (*self as u16) >= RecordType::InitNewPage as u16
    }

    /// Returns the type name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            RecordType::OperationBegin => "OperationBegin",
            RecordType::OperationCommit => "OperationCommit",
            RecordType::OperationAbort => "OperationAbort",
            RecordType::Checkpoint => "Checkpoint",
            RecordType::InitNewPage => "InitNewPage",
            RecordType::InsertEntry => "InsertEntry",
            RecordType::RemoveEntries => "RemoveEntries",
            RecordType::Split => "Split",
            RecordType::SplitForward => "SplitForward",
            RecordType::Merge => "Merge",
            RecordType::InnerReplace => "InnerReplace",
            RecordType::SetChild => "SetChild",
            RecordType::SetForward => "SetForward",
            RecordType::SetTreeRoot => "SetTreeRoot",
            RecordType::SetFreeList => "SetFreeList",
            RecordType::FreePage => "FreePage",
            RecordType::PageSnapshot => "PageSnapshot",
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u16> for RecordType {
    type Error = TesseraError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(RecordType::OperationBegin),
            2 => Ok(RecordType::OperationCommit),
            3 => Ok(RecordType::OperationAbort),
            10 => Ok(RecordType::Checkpoint),
            20 => Ok(RecordType::InitNewPage),
            21 => Ok(RecordType::InsertEntry),
            22 => Ok(RecordType::RemoveEntries),
            23 => Ok(RecordType::Split),
            24 => Ok(RecordType::SplitForward),
            25 => Ok(RecordType::Merge),
            26 => Ok(RecordType::InnerReplace),
            27 => Ok(RecordType::SetChild),
            28 => Ok(RecordType::SetForward),
            29 => Ok(RecordType::SetTreeRoot),
            30 => Ok(RecordType::SetFreeList),
            31 => Ok(RecordType::FreePage),
            32 => Ok(RecordType::PageSnapshot),
            _ => Err(TesseraError::WalCorrupted {
                lsn: 0,
                reason: format!("invalid record type: {}", value),
            }),
        }
    }
}

/// A single record in the WAL.
///
/// Record format on disk:
/// - header (32 bytes):
///   - lsn: 8 bytes
///   - record_type: 2 bytes
///   - segment_id: 4 bytes (page segment)
///   - page_index: 8 bytes
///   - op_id: 8 bytes (operation boundary marker, 0 for autonomous records)
///   - payload_len: 2 bytes
/// - payload: variable length, fixed layout per record type
/// - checksum: 4 bytes (CRC32 of header + payload)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    /// LSN of this record. Assigned by the WAL on append.
    pub lsn: Lsn,
    /// Type of this record.
    pub record_type: RecordType,
    /// Page this record applies to.
    pub page_id: PageId,
    /// Operation this record belongs to.
    pub op_id: u64,
    /// Record payload.
    pub payload: Bytes,
}

impl WalRecord {
    /// Page id used by records that do not target a page.
    pub const NO_PAGE: PageId = PageId::new(0, INVALID_PAGE_INDEX);

    /// Creates a new record. The LSN is filled in on append.
    pub fn new(record_type: RecordType, page_id: PageId, op_id: u64, payload: Bytes) -> Self {
        Self {
            lsn: Lsn::INVALID,
            record_type,
            page_id,
            op_id,
            payload,
        }
    }

    /// Creates an operation boundary record.
    pub fn marker(record_type: RecordType, op_id: u64) -> Self {
        Self::new(record_type, Self::NO_PAGE, op_id, Bytes::new())
    }

    /// Creates a checkpoint marker carrying its redo LSN.
    pub fn checkpoint(redo_lsn: Lsn) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64_le(redo_lsn.0);
        Self::new(
            RecordType::Checkpoint,
            Self::NO_PAGE,
            AUTONOMOUS_OP,
            payload.freeze(),
        )
    }

    /// Returns the redo LSN of a checkpoint marker.
    pub fn checkpoint_redo_lsn(&self) -> Result<Lsn> {
        if self.record_type != RecordType::Checkpoint || self.payload.len() != 8 {
            return Err(TesseraError::WalCorrupted {
                lsn: self.lsn.0,
                reason: format!("{} is not a checkpoint marker", self.record_type),
            });
        }
        Ok(Lsn((&self.payload[..]).get_u64_le()))
    }

    /// Returns the total size of this record on disk.
    pub fn size_on_disk(&self) -> usize {
        HEADER_SIZE + self.payload.len() + CHECKSUM_SIZE
    }

    /// Serializes this record to bytes.
    pub fn encode(&self) -> Result<Bytes> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TesseraError::Internal(format!(
                "{} payload too large: {}",
                self.record_type,
                self.payload.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(self.size_on_disk());

        // Write header
        buf.put_u64_le(self.lsn.0);
        buf.put_u16_le(self.record_type as u16);
        buf.put_u32_le(self.page_id.segment_id);
        buf.put_u64_le(self.page_id.page_index);
        buf.put_u64_le(self.op_id);
        buf.put_u16_le(self.payload.len() as u16);

        // Write payload
        buf.put_slice(&self.payload);

        // Compute and write checksum
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        Ok(buf.freeze())
    }

    /// Returns the on-disk size of the record at the start of `data`, or
    /// `None` if not even the header is present.
    pub fn peek_size(data: &[u8]) -> Option<usize> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        let payload_len =
            u16::from_le_bytes([data[OFF_PAYLOAD_LEN], data[OFF_PAYLOAD_LEN + 1]]) as usize;
        Some(HEADER_SIZE + payload_len + CHECKSUM_SIZE)
    }

    /// Deserializes a record from bytes.
    ///
    /// `data` must hold at least the full record; trailing bytes are ignored.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let total = Self::peek_size(data).ok_or_else(|| TesseraError::WalCorrupted {
            lsn: 0,
            reason: "record too short".to_string(),
        })?;
        if data.len() < total {
            return Err(TesseraError::WalCorrupted {
                lsn: 0,
                reason: "truncated record".to_string(),
            });
        }

        let body = &data[..total - CHECKSUM_SIZE];
        let stored_checksum = (&data[total - CHECKSUM_SIZE..total]).get_u32_le();
        let computed_checksum = crc32fast::hash(body);

        let mut cursor = body;
        let lsn = Lsn(cursor.get_u64_le());
        if stored_checksum != computed_checksum {
            return Err(TesseraError::WalCorrupted {
                lsn: lsn.0,
                reason: format!(
                    "checksum mismatch: stored={}, computed={}",
                    stored_checksum, computed_checksum
                ),
            });
        }

        let record_type = RecordType::try_from(cursor.get_u16_le()).map_err(|_| {
            TesseraError::WalCorrupted {
                lsn: lsn.0,
                reason: "invalid record type".to_string(),
            }
        })?;
        let segment_id = cursor.get_u32_le();
        let page_index = cursor.get_u64_le();
        let op_id = cursor.get_u64_le();
        let payload_len = cursor.get_u16_le() as usize;
        let payload = Bytes::copy_from_slice(&cursor[..payload_len]);

        Ok(Self {
            lsn,
            record_type,
            page_id: PageId::new(segment_id, page_index),
            op_id,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_new() {
        let lsn = Lsn::new(5, 1000);
        assert_eq!(lsn.segment_id(), 5);
        assert_eq!(lsn.offset(), 1000);
    }

    #[test]
    fn test_lsn_advance() {
        let lsn = Lsn::new(1, 100);
        let advanced = lsn.advance(50);
        assert_eq!(advanced.offset(), 150);
        assert_eq!(advanced.segment_id(), 1);
    }

    #[test]
    fn test_lsn_ordering() {
        let lsn1 = Lsn::new(1, 100);
        let lsn2 = Lsn::new(1, 200);
        let lsn3 = Lsn::new(2, 50);

        assert!(lsn1 < lsn2);
        assert!(lsn2 < lsn3);
        assert!(lsn1 < lsn3);
    }

    #[test]
    fn test_lsn_display() {
        let lsn = Lsn::new(3, 1024);
        assert_eq!(lsn.to_string(), "3/1024");
    }

    #[test]
    fn test_lsn_validity() {
        assert!(!Lsn::INVALID.is_valid());
        assert!(Lsn::new(1, 32).is_valid());
    }

    #[test]
    fn test_record_type_conversion() {
        assert_eq!(RecordType::try_from(1).unwrap(), RecordType::OperationBegin);
        assert_eq!(RecordType::try_from(26).unwrap(), RecordType::InnerReplace);
        assert_eq!(RecordType::try_from(32).unwrap(), RecordType::PageSnapshot);
        assert!(RecordType::try_from(0).is_err());
        assert!(RecordType::try_from(999).is_err());
    }

    #[test]
    fn test_record_type_classes() {
        assert!(RecordType::InsertEntry.is_delta());
        assert!(RecordType::PageSnapshot.is_delta());
        assert!(!RecordType::OperationCommit.is_delta());
        assert!(!RecordType::Checkpoint.is_delta());
        assert_eq!(RecordType::InnerReplace.to_string(), "InnerReplace");
    }

    #[test]
    fn test_record_serialization() {
        let mut record = WalRecord::new(
            RecordType::InsertEntry,
            PageId::new(4, 17),
            99,
            Bytes::from_static(b"entry bytes"),
        );
        record.lsn = Lsn::new(1, 64);

        let serialized = record.encode().unwrap();
        assert_eq!(serialized.len(), record.size_on_disk());
        assert_eq!(WalRecord::peek_size(&serialized), Some(serialized.len()));

        let deserialized = WalRecord::decode(&serialized).unwrap();
        assert_eq!(deserialized, record);
    }

    #[test]
    fn test_record_header_layout() {
        let mut record = WalRecord::new(
            RecordType::SetChild,
            PageId::new(0x0102_0304, 7),
            0,
            Bytes::from_static(&[0xAA; 3]),
        );
        record.lsn = Lsn(0x1122_3344_5566_7788);
        let bytes = record.encode().unwrap();

        assert_eq!(&bytes[0..8], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&bytes[8..10], &27u16.to_le_bytes());
        assert_eq!(&bytes[10..14], &0x0102_0304u32.to_le_bytes());
        assert_eq!(&bytes[14..22], &7u64.to_le_bytes());
        assert_eq!(&bytes[30..32], &3u16.to_le_bytes());
        assert_eq!(&bytes[32..35], &[0xAA; 3]);
    }

    #[test]
    fn test_checkpoint_marker() {
        let record = WalRecord::checkpoint(Lsn::new(2, 4096));
        assert_eq!(record.checkpoint_redo_lsn().unwrap(), Lsn::new(2, 4096));
        assert_eq!(record.page_id, WalRecord::NO_PAGE);

        let marker = WalRecord::marker(RecordType::OperationCommit, 5);
        assert!(marker.checkpoint_redo_lsn().is_err());
    }

    #[test]
    fn test_truncated_record_detection() {
        let record = WalRecord::marker(RecordType::OperationBegin, 1);
        let serialized = record.encode().unwrap();

        assert_eq!(WalRecord::peek_size(&serialized[..10]), None);
        assert!(WalRecord::decode(&serialized[..serialized.len() - 1]).is_err());
    }

    #[test]
    fn test_corrupted_record_detection() {
        let mut record = WalRecord::new(
            RecordType::RemoveEntries,
            PageId::new(1, 2),
            3,
            Bytes::from_static(b"payload"),
        );
        record.lsn = Lsn::new(1, 32);
        let mut serialized = record.encode().unwrap().to_vec();
        serialized[HEADER_SIZE + 2] ^= 0xFF;

        let err = WalRecord::decode(&serialized).unwrap_err();
        assert!(matches!(err, TesseraError::WalCorrupted { .. }));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let record = WalRecord::new(
            RecordType::PageSnapshot,
            PageId::new(0, 1),
            0,
            Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]),
        );
        assert!(record.encode().is_err());
    }
}
