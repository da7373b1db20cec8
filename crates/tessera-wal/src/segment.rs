//! WAL segment file management.

use crate::constants::{
    SEGMENT_EXTENSION, SEGMENT_HEADER_SIZE, SEGMENT_MAGIC, SEGMENT_VERSION,
};
use crate::record::{Lsn, WalRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tessera_common::{Result, TesseraError};
use tracing::warn;

/// Unique identifier for a WAL segment file.
///
/// Distinct from page segments: a log segment is one file of the log, a page
/// segment is one partition of the page namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogSegmentId(pub u32);

impl LogSegmentId {
    /// First segment ID.
    pub const FIRST: LogSegmentId = LogSegmentId(1);

    /// Returns the next segment ID.
    pub fn next(&self) -> Self {
        LogSegmentId(self.0 + 1)
    }

    /// Generates the filename for this segment.
    pub fn filename(&self) -> String {
        format!("{:016}.{}", self.0, SEGMENT_EXTENSION)
    }

    /// Parses a segment id from a WAL file path.
    pub fn from_path(path: &Path) -> Option<Self> {
        if path.extension()? != SEGMENT_EXTENSION {
            return None;
        }
        path.file_stem()?
            .to_str()?
            .parse::<u32>()
            .ok()
            .map(LogSegmentId)
    }

    /// Returns the LSN of the first record slot in this segment.
    pub fn first_lsn(&self) -> Lsn {
        Lsn::new(self.0, SEGMENT_HEADER_SIZE as u32)
    }
}

impl std::fmt::Display for LogSegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08}", self.0)
    }
}

/// Header at the beginning of each segment file.
///
/// Layout (32 bytes):
/// - magic: 4 bytes ("TWAL")
/// - version: 4 bytes
/// - segment_id: 4 bytes
/// - segment_size: 4 bytes
/// - first_lsn: 8 bytes
/// - flags: 4 bytes
/// - checksum: 4 bytes
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SegmentHeader {
    /// Magic bytes for identification.
    pub magic: [u8; 4],
    /// Format version.
    pub version: u32,
    /// Segment ID.
    pub segment_id: LogSegmentId,
    /// Maximum size of this segment.
    pub segment_size: u32,
    /// First LSN in this segment.
    pub first_lsn: Lsn,
    /// Segment flags.
    pub flags: u32,
    /// Header checksum.
    pub checksum: u32,
}

impl SegmentHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = SEGMENT_HEADER_SIZE;

    /// Creates a new segment header.
    pub fn new(segment_id: LogSegmentId, segment_size: u32) -> Self {
        let mut header = Self {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_VERSION,
            segment_id,
            segment_size,
            first_lsn: segment_id.first_lsn(),
            flags: 0,
            checksum: 0,
        };
        header.checksum = header.compute_checksum();
        header
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        crc32fast::hash(&bytes[..Self::SIZE - 4])
    }

    /// Validates this header.
    pub fn validate(&self) -> Result<()> {
        if self.magic != SEGMENT_MAGIC {
            return Err(TesseraError::WalCorrupted {
                lsn: self.first_lsn.0,
                reason: "invalid magic bytes".to_string(),
            });
        }
        if self.version != SEGMENT_VERSION {
            return Err(TesseraError::WalCorrupted {
                lsn: self.first_lsn.0,
                reason: format!("unsupported version: {}", self.version),
            });
        }
        if self.checksum != self.compute_checksum() {
            return Err(TesseraError::WalCorrupted {
                lsn: self.first_lsn.0,
                reason: "header checksum mismatch".to_string(),
            });
        }
        Ok(())
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut data = [0u8; Self::SIZE];
        data[0..4].copy_from_slice(&self.magic);
        data[4..8].copy_from_slice(&self.version.to_le_bytes());
        data[8..12].copy_from_slice(&self.segment_id.0.to_le_bytes());
        data[12..16].copy_from_slice(&self.segment_size.to_le_bytes());
        data[16..24].copy_from_slice(&self.first_lsn.0.to_le_bytes());
        data[24..28].copy_from_slice(&self.flags.to_le_bytes());
        data[28..32].copy_from_slice(&self.checksum.to_le_bytes());
        data
    }

    /// Deserializes the header from bytes.
    pub fn from_bytes(data: &[u8; Self::SIZE]) -> Self {
        let u32_at = |off: usize| {
            u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
        };
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[0..4]);
        let mut lsn = [0u8; 8];
        lsn.copy_from_slice(&data[16..24]);

        Self {
            magic,
            version: u32_at(4),
            segment_id: LogSegmentId(u32_at(8)),
            segment_size: u32_at(12),
            first_lsn: Lsn(u64::from_le_bytes(lsn)),
            flags: u32_at(24),
            checksum: u32_at(28),
        }
    }
}

/// Returns the length of the records region up to the end of the last
/// complete record.
///
/// An incomplete record at the tail, or a damaged record with nothing after
/// it, is a torn write and ends the prefix. A damaged record followed by
/// more bytes is `WalCorrupted`: cutting it off would drop later records.
pub(crate) fn valid_prefix_len(data: &[u8], segment_id: LogSegmentId) -> Result<usize> {
    let mut offset = 0;
    while let Some(size) = WalRecord::peek_size(&data[offset..]) {
        if offset + size > data.len() {
            break;
        }
        if let Err(e) = WalRecord::decode(&data[offset..]) {
            let trailing = data.len() - offset - size;
            if trailing == 0 {
                break;
            }
            let lsn = Lsn::new(segment_id.0, (SegmentHeader::SIZE + offset) as u32);
            return Err(TesseraError::WalCorrupted {
                lsn: lsn.0,
                reason: format!(
                    "damaged record at {} in segment {} followed by {} bytes: {}",
                    lsn, segment_id, trailing, e
                ),
            });
        }
        offset += size;
    }
    Ok(offset)
}

/// Lists the segment files of a WAL directory ordered by segment id.
pub fn list_segments(wal_dir: &Path) -> Result<BTreeMap<LogSegmentId, PathBuf>> {
    let mut segments = BTreeMap::new();
    if !wal_dir.exists() {
        return Ok(segments);
    }
    for entry in std::fs::read_dir(wal_dir)? {
        let path = entry?.path();
        if let Some(id) = LogSegmentId::from_path(&path) {
            segments.insert(id, path);
        }
    }
    Ok(segments)
}

/// A single WAL segment file.
pub struct LogSegment {
    /// Path to the segment file.
    path: PathBuf,
    /// Segment header.
    header: SegmentHeader,
    /// Current write position within the segment.
    write_offset: u32,
    /// File handle for writing.
    file: Option<File>,
}

impl LogSegment {
    /// Creates a new segment file.
    pub fn create(wal_dir: &Path, segment_id: LogSegmentId, segment_size: u32) -> Result<Self> {
        let path = wal_dir.join(segment_id.filename());
        let header = SegmentHeader::new(segment_id, segment_size);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        file.write_all(&header.to_bytes())?;
        file.sync_all()?;

        Ok(Self {
            path,
            header,
            write_offset: SegmentHeader::SIZE as u32,
            file: Some(file),
        })
    }

    /// Opens an existing segment file for appending.
    ///
    /// The records region is scanned and a torn record at the tail is cut
    /// off, so the next append starts right after the last complete record.
    /// Fails with `WalCorrupted` if a damaged record has records after it.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let header = Self::read_header(&mut file)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let valid = valid_prefix_len(&data, header.segment_id)?;
        if valid < data.len() {
            warn!(
                segment = %header.segment_id,
                valid_bytes = valid,
                discarded_bytes = data.len() - valid,
                "truncating torn WAL tail"
            );
            file.set_len((SegmentHeader::SIZE + valid) as u64)?;
            file.sync_all()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            write_offset: (SegmentHeader::SIZE + valid) as u32,
            file: Some(file),
        })
    }

    /// Reads the header and every byte after it, without modifying the file.
    pub fn read_all(path: &Path) -> Result<(SegmentHeader, Vec<u8>)> {
        let mut file = File::open(path)?;
        let header = Self::read_header(&mut file)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok((header, data))
    }

    fn read_header(file: &mut File) -> Result<SegmentHeader> {
        let mut header_bytes = [0u8; SegmentHeader::SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = SegmentHeader::from_bytes(&header_bytes);
        header.validate()?;
        Ok(header)
    }

    /// Returns the segment ID.
    pub fn segment_id(&self) -> LogSegmentId {
        self.header.segment_id
    }

    /// Returns the first LSN in this segment.
    pub fn first_lsn(&self) -> Lsn {
        self.header.first_lsn
    }

    /// Returns the current write offset.
    pub fn write_offset(&self) -> u32 {
        self.write_offset
    }

    /// Returns the LSN the next appended record will receive.
    pub fn next_lsn(&self) -> Lsn {
        Lsn::new(self.header.segment_id.0, self.write_offset)
    }

    /// Returns the remaining space in this segment.
    pub fn remaining_space(&self) -> u32 {
        self.header.segment_size.saturating_sub(self.write_offset)
    }

    /// Returns true if this segment has space for a record of the given size.
    pub fn has_space(&self, record_size: usize) -> bool {
        self.remaining_space() as usize >= record_size
    }

    /// Returns the path to this segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a record, assigning its LSN from the write position.
    ///
    /// A failed write is rolled back to the previous write offset so the
    /// segment never keeps a partial record.
    pub fn append(&mut self, record: &mut WalRecord) -> Result<Lsn> {
        let size = record.size_on_disk();
        if !self.has_space(size) {
            return Err(TesseraError::IoFailure("WAL segment full".to_string()));
        }

        let lsn = self.next_lsn();
        record.lsn = lsn;
        let data = record.encode()?;

        let offset = self.write_offset as u64;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TesseraError::IoFailure("segment not open for writing".to_string()))?;

        let written = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(&data));
        if let Err(e) = written {
            let _ = file.set_len(offset);
            return Err(TesseraError::IoFailure(format!(
                "WAL append at {} failed: {}",
                lsn, e
            )));
        }

        self.write_offset += size as u32;
        Ok(lsn)
    }

    /// Syncs the segment to disk.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(ref file) = self.file {
            file.sync_all()
                .map_err(|e| TesseraError::IoFailure(format!("WAL fsync failed: {}", e)))?;
        }
        Ok(())
    }

    /// Closes the segment.
    pub fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}
