//! Page identifiers and the fixed page header shared by every page type.

use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};

/// Default page size in bytes (16 KB).
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest supported page size.
pub const MAX_PAGE_SIZE: usize = 16 * 1024;

/// Current on-disk page format version.
pub const PAGE_FORMAT_VERSION: u8 = 1;

/// Sentinel page index meaning "no page".
pub const INVALID_PAGE_INDEX: u64 = u64::MAX;

/// Checks that a page size is a power of two within the supported range.
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(TesseraError::InvalidConfig(format!(
            "page size {} must be a power of two between {} and {}",
            page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
        )));
    }
    Ok(())
}

/// Unique identifier for a page.
///
/// A page is addressed by the segment (cache/partition) it belongs to and its
/// index inside that segment. Page ids are never renumbered; freed pages are
/// reused under the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId {
    /// Segment identifier.
    pub segment_id: u32,
    /// Page index within the segment (0 is the segment meta page).
    pub page_index: u64,
}

impl PageId {
    /// Creates a new PageId.
    pub const fn new(segment_id: u32, page_index: u64) -> Self {
        Self {
            segment_id,
            page_index,
        }
    }

    /// Returns the meta page of the given segment.
    pub const fn meta(segment_id: u32) -> Self {
        Self::new(segment_id, 0)
    }

    /// Returns another page in the same segment.
    pub const fn sibling(&self, page_index: u64) -> Self {
        Self::new(self.segment_id, page_index)
    }

    /// Returns true if this is the segment meta page.
    pub fn is_meta(&self) -> bool {
        self.page_index == 0
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.segment_id, self.page_index)
    }
}

/// Page types stored in the header type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageType {
    /// Never formatted (all-zero buffer).
    Unformatted = 0,
    /// Segment meta page (page index 0).
    Meta = 1,
    /// Page sitting on the segment free list.
    FreeList = 2,
    /// B+ tree leaf page.
    BTreeLeaf = 3,
    /// B+ tree inner page.
    BTreeInner = 4,
}

impl PageType {
    /// Decodes a type tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(PageType::Unformatted),
            1 => Some(PageType::Meta),
            2 => Some(PageType::FreeList),
            3 => Some(PageType::BTreeLeaf),
            4 => Some(PageType::BTreeInner),
            _ => None,
        }
    }

    /// Returns true for leaf and inner tree pages.
    pub fn is_tree(&self) -> bool {
        matches!(self, PageType::BTreeLeaf | PageType::BTreeInner)
    }
}

/// Header at the beginning of every page.
///
/// Layout (32 bytes, little endian):
/// - page_type: 1 byte
/// - version: 1 byte
/// - item_count: 2 bytes
/// - item_size: 2 bytes
/// - capacity: 2 bytes
/// - checksum: 4 bytes (CRC32 of the page with this field zeroed)
/// - segment_id: 4 bytes
/// - page_index: 8 bytes
/// - lsn: 8 bytes (sequence pointer of the last applied record)
///
/// Tree pages store fixed-size items, so the free space of a page is fully
/// described by `capacity - item_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageHeader {
    /// Type of this page.
    pub page_type: PageType,
    /// Format version.
    pub version: u8,
    /// Number of items stored on the page.
    pub item_count: u16,
    /// Size of one item in bytes.
    pub item_size: u16,
    /// Maximum number of items the page may hold.
    pub capacity: u16,
    /// Stored checksum.
    pub checksum: u32,
    /// Page identity, written at format time.
    pub page_id: PageId,
    /// Sequence pointer of the last record applied to this page.
    pub lsn: u64,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 32;

    const OFF_TYPE: usize = 0;
    const OFF_VERSION: usize = 1;
    const OFF_COUNT: usize = 2;
    const OFF_ITEM_SIZE: usize = 4;
    const OFF_CAPACITY: usize = 6;
    const OFF_CHECKSUM: usize = 8;
    const OFF_SEGMENT: usize = 12;
    const OFF_INDEX: usize = 16;
    const OFF_LSN: usize = 24;

    /// Creates a new page header.
    pub fn new(page_id: PageId, page_type: PageType) -> Self {
        Self {
            page_type,
            version: PAGE_FORMAT_VERSION,
            item_count: 0,
            item_size: 0,
            capacity: 0,
            checksum: 0,
            page_id,
            lsn: 0,
        }
    }

    /// Serializes the header into the first `SIZE` bytes of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[Self::OFF_TYPE] = self.page_type as u8;
        buf[Self::OFF_VERSION] = self.version;
        buf[Self::OFF_COUNT..Self::OFF_COUNT + 2].copy_from_slice(&self.item_count.to_le_bytes());
        buf[Self::OFF_ITEM_SIZE..Self::OFF_ITEM_SIZE + 2]
            .copy_from_slice(&self.item_size.to_le_bytes());
        buf[Self::OFF_CAPACITY..Self::OFF_CAPACITY + 2]
            .copy_from_slice(&self.capacity.to_le_bytes());
        buf[Self::OFF_CHECKSUM..Self::OFF_CHECKSUM + 4]
            .copy_from_slice(&self.checksum.to_le_bytes());
        buf[Self::OFF_SEGMENT..Self::OFF_SEGMENT + 4]
            .copy_from_slice(&self.page_id.segment_id.to_le_bytes());
        buf[Self::OFF_INDEX..Self::OFF_INDEX + 8]
            .copy_from_slice(&self.page_id.page_index.to_le_bytes());
        buf[Self::OFF_LSN..Self::OFF_LSN + 8].copy_from_slice(&self.lsn.to_le_bytes());
    }

    /// Deserializes the header from the start of `buf`.
    ///
    /// Fails with `CorruptPage` if the type tag is unknown or the version is
    /// newer than this build understands.
    pub fn read_from(buf: &[u8], page_id: PageId) -> Result<Self> {
        let page_type = PageType::from_u8(buf[Self::OFF_TYPE]).ok_or_else(|| {
            TesseraError::CorruptPage {
                page_id,
                reason: format!("unknown page type tag {}", buf[Self::OFF_TYPE]),
            }
        })?;
        let version = buf[Self::OFF_VERSION];
        if version > PAGE_FORMAT_VERSION {
            return Err(TesseraError::CorruptPage {
                page_id,
                reason: format!("unsupported page format version {}", version),
            });
        }

        Ok(Self {
            page_type,
            version,
            item_count: Self::item_count(buf),
            item_size: read_u16(buf, Self::OFF_ITEM_SIZE),
            capacity: read_u16(buf, Self::OFF_CAPACITY),
            checksum: read_u32(buf, Self::OFF_CHECKSUM),
            page_id: PageId::new(
                read_u32(buf, Self::OFF_SEGMENT),
                read_u64(buf, Self::OFF_INDEX),
            ),
            lsn: Self::lsn(buf),
        })
    }

    /// Reads the raw page type tag.
    #[inline]
    pub fn type_tag(buf: &[u8]) -> u8 {
        buf[Self::OFF_TYPE]
    }

    /// Reads the item count without decoding the full header.
    #[inline]
    pub fn item_count(buf: &[u8]) -> u16 {
        read_u16(buf, Self::OFF_COUNT)
    }

    /// Overwrites the item count.
    #[inline]
    pub fn set_item_count(buf: &mut [u8], count: u16) {
        buf[Self::OFF_COUNT..Self::OFF_COUNT + 2].copy_from_slice(&count.to_le_bytes());
    }

    /// Reads the item size without decoding the full header.
    #[inline]
    pub fn item_size(buf: &[u8]) -> u16 {
        read_u16(buf, Self::OFF_ITEM_SIZE)
    }

    /// Reads the item capacity without decoding the full header.
    #[inline]
    pub fn capacity(buf: &[u8]) -> u16 {
        read_u16(buf, Self::OFF_CAPACITY)
    }

    /// Reads the page LSN without decoding the full header.
    #[inline]
    pub fn lsn(buf: &[u8]) -> u64 {
        read_u64(buf, Self::OFF_LSN)
    }

    /// Overwrites the page LSN.
    #[inline]
    pub fn set_lsn(buf: &mut [u8], lsn: u64) {
        buf[Self::OFF_LSN..Self::OFF_LSN + 8].copy_from_slice(&lsn.to_le_bytes());
    }

    /// Computes the page checksum with the checksum field treated as zero.
    pub fn compute_checksum(buf: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[..Self::OFF_CHECKSUM]);
        hasher.update(&[0u8; 4]);
        hasher.update(&buf[Self::OFF_CHECKSUM + 4..]);
        hasher.finalize()
    }

    /// Stamps the current checksum into the header before a page is written.
    pub fn stamp_checksum(buf: &mut [u8]) {
        let checksum = Self::compute_checksum(buf);
        buf[Self::OFF_CHECKSUM..Self::OFF_CHECKSUM + 4].copy_from_slice(&checksum.to_le_bytes());
    }

    /// Verifies a page image read from backing storage.
    ///
    /// All-zero buffers are pages that were allocated but never written and
    /// pass without a checksum.
    pub fn verify(buf: &[u8], page_id: PageId) -> Result<()> {
        if is_zeroed(buf) {
            return Ok(());
        }
        let header = Self::read_from(buf, page_id)?;
        let computed = Self::compute_checksum(buf);
        if header.checksum != computed {
            return Err(TesseraError::CorruptPage {
                page_id,
                reason: format!(
                    "checksum mismatch: stored={:#010x}, computed={:#010x}",
                    header.checksum, computed
                ),
            });
        }
        if header.page_id != page_id {
            return Err(TesseraError::CorruptPage {
                page_id,
                reason: format!("page header claims id {}", header.page_id),
            });
        }
        Ok(())
    }
}

/// Returns true if every byte of the buffer is zero.
pub fn is_zeroed(buf: &[u8]) -> bool {
    buf.iter().all(|b| *b == 0)
}

#[inline]
fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(bytes)
}
