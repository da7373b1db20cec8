//! Typed views over page buffers.
//!
//! Every page starts with the common [`PageHeader`]. The body depends on the
//! page type:
//!
//! Tree pages (leaf and inner):
//! ```text
//! +----------------------+ 0
//! | PageHeader           | 32
//! | forward: u64         | 40 (ITEMS_OFFSET)
//! +----------------------+
//! | leaf:  item_0, item_1, ...
//! | inner: child_0, (item_0, child_1), (item_1, child_2), ...
//! +----------------------+
//! ```
//!
//! Leaf slots are `item_size` bytes. Inner slots pair an item with the child
//! to its right and are `item_size + 8` bytes, so inserting or removing slot
//! `i` of an inner page moves item `i` together with child `i + 1`.
//!
//! Meta page (index 0 of every segment):
//! ```text
//! | PageHeader | root: u64 | height: u32 | pad | next_page: u64 | free_head: u64 |
//! ```
//!
//! Free-list page:
//! ```text
//! | PageHeader | next_free: u64 |
//! ```

use tessera_common::{PageHeader, PageId, PageType, Result, TesseraError, INVALID_PAGE_INDEX};

/// Offset of the forward link in tree pages.
pub const FORWARD_OFFSET: usize = PageHeader::SIZE;

/// Offset of the first slot in tree pages.
pub const ITEMS_OFFSET: usize = PageHeader::SIZE + 8;

/// Size of a child pointer in inner pages.
pub const CHILD_SIZE: usize = 8;

#[inline]
fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(bytes)
}

#[inline]
fn put_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

/// Slice accessors for B+ tree leaf and inner pages.
///
/// The accessors do not check bounds against the item count; callers
/// validate first with [`TreePage::check`].
pub struct TreePage;

impl TreePage {
    /// Largest number of items a tree page of `page_size` bytes can hold.
    pub fn max_capacity(page_size: usize, page_type: PageType, item_size: usize) -> usize {
        match page_type {
            PageType::BTreeLeaf => page_size.saturating_sub(ITEMS_OFFSET) / item_size.max(1),
            _ => {
                page_size.saturating_sub(ITEMS_OFFSET + CHILD_SIZE)
                    / (item_size + CHILD_SIZE)
            }
        }
    }

    /// Formats `buf` as an empty tree page.
    pub fn format(
        buf: &mut [u8],
        page_id: PageId,
        page_type: PageType,
        item_size: u16,
        capacity: u16,
    ) {
        buf.fill(0);
        let mut header = PageHeader::new(page_id, page_type);
        header.item_size = item_size;
        header.capacity = capacity;
        header.write_to(buf);
        put_u64(buf, FORWARD_OFFSET, INVALID_PAGE_INDEX);
        if page_type == PageType::BTreeInner {
            put_u64(buf, ITEMS_OFFSET, INVALID_PAGE_INDEX);
        }
    }

    /// Checks that `buf` holds a tree page whose header fits the buffer.
    pub fn check(buf: &[u8], page_id: PageId) -> Result<PageType> {
        let page_type = PageType::from_u8(PageHeader::type_tag(buf))
            .filter(PageType::is_tree)
            .ok_or_else(|| {
                TesseraError::corrupt(
                    page_id,
                    format!("type tag {} is not a tree page", PageHeader::type_tag(buf)),
                )
            })?;
        let item_size = Self::item_size(buf);
        let capacity = Self::capacity(buf);
        if item_size == 0 || capacity > Self::max_capacity(buf.len(), page_type, item_size) {
            return Err(TesseraError::corrupt(
                page_id,
                format!(
                    "capacity {} of {}-byte items does not fit the page",
                    capacity, item_size
                ),
            ));
        }
        if Self::count(buf) > capacity {
            return Err(TesseraError::corrupt(
                page_id,
                format!("item count {} exceeds capacity {}", Self::count(buf), capacity),
            ));
        }
        Ok(page_type)
    }

    /// Returns true for leaf pages.
    #[inline]
    pub fn is_leaf(buf: &[u8]) -> bool {
        PageHeader::type_tag(buf) == PageType::BTreeLeaf as u8
    }

    /// Returns the number of items.
    #[inline]
    pub fn count(buf: &[u8]) -> usize {
        PageHeader::item_count(buf) as usize
    }

    /// Sets the number of items.
    #[inline]
    pub fn set_count(buf: &mut [u8], count: usize) {
        PageHeader::set_item_count(buf, count as u16);
    }

    /// Returns the size of one item.
    #[inline]
    pub fn item_size(buf: &[u8]) -> usize {
        PageHeader::item_size(buf) as usize
    }

    /// Returns the maximum number of items.
    #[inline]
    pub fn capacity(buf: &[u8]) -> usize {
        PageHeader::capacity(buf) as usize
    }

    /// Returns true if no further item fits.
    #[inline]
    pub fn is_full(buf: &[u8]) -> bool {
        Self::count(buf) >= Self::capacity(buf)
    }

    /// Size of one slot: the item, plus the right child on inner pages.
    #[inline]
    pub fn slot_size(buf: &[u8]) -> usize {
        if Self::is_leaf(buf) {
            Self::item_size(buf)
        } else {
            Self::item_size(buf) + CHILD_SIZE
        }
    }

    #[inline]
    fn slot_offset(buf: &[u8], index: usize) -> usize {
        if Self::is_leaf(buf) {
            ITEMS_OFFSET + index * Self::item_size(buf)
        } else {
            ITEMS_OFFSET + CHILD_SIZE + index * Self::slot_size(buf)
        }
    }

    /// Returns the forward link (next leaf), or `INVALID_PAGE_INDEX`.
    #[inline]
    pub fn forward(buf: &[u8]) -> u64 {
        get_u64(buf, FORWARD_OFFSET)
    }

    /// Sets the forward link.
    #[inline]
    pub fn set_forward(buf: &mut [u8], forward: u64) {
        put_u64(buf, FORWARD_OFFSET, forward);
    }

    /// Returns item `index`.
    #[inline]
    pub fn item(buf: &[u8], index: usize) -> &[u8] {
        let off = Self::slot_offset(buf, index);
        &buf[off..off + Self::item_size(buf)]
    }

    /// Returns slot `index`: the item, followed by its right child on inner
    /// pages.
    #[inline]
    pub fn slot(buf: &[u8], index: usize) -> &[u8] {
        let off = Self::slot_offset(buf, index);
        &buf[off..off + Self::slot_size(buf)]
    }

    /// Overwrites the first `src.len()` bytes of item `index`.
    #[inline]
    pub fn write_item(buf: &mut [u8], index: usize, src: &[u8]) {
        let off = Self::slot_offset(buf, index);
        buf[off..off + src.len()].copy_from_slice(src);
    }

    /// Returns child `index` of an inner page (`0..=count`).
    #[inline]
    pub fn child(buf: &[u8], index: usize) -> u64 {
        get_u64(buf, ITEMS_OFFSET + index * Self::slot_size(buf))
    }

    /// Sets child `index` of an inner page.
    #[inline]
    pub fn set_child(buf: &mut [u8], index: usize, child: u64) {
        let off = ITEMS_OFFSET + index * Self::slot_size(buf);
        put_u64(buf, off, child);
    }

    /// Shifts slots at and after `index` right by one and writes `slot`.
    pub fn insert_slot(buf: &mut [u8], index: usize, slot: &[u8]) {
        let count = Self::count(buf);
        let size = Self::slot_size(buf);
        let start = Self::slot_offset(buf, index);
        let end = Self::slot_offset(buf, count);
        buf.copy_within(start..end, start + size);
        buf[start..start + size].copy_from_slice(slot);
        Self::set_count(buf, count + 1);
    }

    /// Removes `n` slots starting at `index`, shifting later slots left.
    pub fn remove_slots(buf: &mut [u8], index: usize, n: usize) {
        let count = Self::count(buf);
        let size = Self::slot_size(buf);
        let start = Self::slot_offset(buf, index);
        let tail = Self::slot_offset(buf, index + n);
        let end = Self::slot_offset(buf, count);
        buf.copy_within(tail..end, start);
        let vacated = end - (tail - start);
        buf[vacated..end].fill(0);
        debug_assert_eq!(end - vacated, n * size);
        Self::set_count(buf, count - n);
    }

    /// Truncates the page to `count` slots, zeroing the rest.
    pub fn truncate(buf: &mut [u8], count: usize) {
        let start = Self::slot_offset(buf, count);
        let end = Self::slot_offset(buf, Self::count(buf));
        buf[start..end].fill(0);
        Self::set_count(buf, count);
    }

    /// Appends raw slots, advancing the count by `n`.
    pub fn append_slots(buf: &mut [u8], slots: &[u8], n: usize) {
        let count = Self::count(buf);
        let start = Self::slot_offset(buf, count);
        buf[start..start + slots.len()].copy_from_slice(slots);
        Self::set_count(buf, count + n);
    }

    /// Returns the raw bytes of slots `from..to`.
    pub fn slots(buf: &[u8], from: usize, to: usize) -> &[u8] {
        &buf[Self::slot_offset(buf, from)..Self::slot_offset(buf, to)]
    }
}

/// Accessors for the segment meta page.
pub struct MetaPage;

impl MetaPage {
    const OFF_ROOT: usize = PageHeader::SIZE;
    const OFF_HEIGHT: usize = PageHeader::SIZE + 8;
    const OFF_NEXT_PAGE: usize = PageHeader::SIZE + 16;
    const OFF_FREE_HEAD: usize = PageHeader::SIZE + 24;

    /// Formats `buf` as the meta page of an empty segment.
    pub fn format(buf: &mut [u8], segment_id: u32) {
        buf.fill(0);
        PageHeader::new(PageId::meta(segment_id), PageType::Meta).write_to(buf);
        put_u64(buf, Self::OFF_ROOT, INVALID_PAGE_INDEX);
        put_u64(buf, Self::OFF_NEXT_PAGE, 1);
        put_u64(buf, Self::OFF_FREE_HEAD, INVALID_PAGE_INDEX);
    }

    /// Checks that `buf` holds a meta page.
    pub fn check(buf: &[u8], page_id: PageId) -> Result<()> {
        if PageHeader::type_tag(buf) != PageType::Meta as u8 {
            return Err(TesseraError::corrupt(
                page_id,
                format!("type tag {} is not a meta page", PageHeader::type_tag(buf)),
            ));
        }
        Ok(())
    }

    /// Returns true if the buffer holds a formatted meta page.
    pub fn is_formatted(buf: &[u8]) -> bool {
        PageHeader::type_tag(buf) == PageType::Meta as u8
    }

    /// Returns the tree root page index, or `INVALID_PAGE_INDEX`.
    pub fn root(buf: &[u8]) -> u64 {
        get_u64(buf, Self::OFF_ROOT)
    }

    /// Returns the tree height (1 = root is a leaf, 0 = no tree).
    pub fn height(buf: &[u8]) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[Self::OFF_HEIGHT..Self::OFF_HEIGHT + 4]);
        u32::from_le_bytes(bytes)
    }

    /// Sets the tree root and height.
    pub fn set_tree_root(buf: &mut [u8], root: u64, height: u32) {
        put_u64(buf, Self::OFF_ROOT, root);
        buf[Self::OFF_HEIGHT..Self::OFF_HEIGHT + 4].copy_from_slice(&height.to_le_bytes());
    }

    /// Returns the first never-used page index.
    pub fn next_page(buf: &[u8]) -> u64 {
        get_u64(buf, Self::OFF_NEXT_PAGE)
    }

    /// Returns the head of the free list, or `INVALID_PAGE_INDEX`.
    pub fn free_head(buf: &[u8]) -> u64 {
        get_u64(buf, Self::OFF_FREE_HEAD)
    }

    /// Sets the free-list head and the next never-used page index.
    pub fn set_free_list(buf: &mut [u8], free_head: u64, next_page: u64) {
        put_u64(buf, Self::OFF_FREE_HEAD, free_head);
        put_u64(buf, Self::OFF_NEXT_PAGE, next_page);
    }
}

/// Accessors for pages on the segment free list.
pub struct FreePage;

impl FreePage {
    const OFF_NEXT: usize = PageHeader::SIZE;

    /// Formats `buf` as a free-list page linking to `next_free`.
    pub fn format(buf: &mut [u8], page_id: PageId, next_free: u64) {
        buf.fill(0);
        PageHeader::new(page_id, PageType::FreeList).write_to(buf);
        put_u64(buf, Self::OFF_NEXT, next_free);
    }

    /// Returns the next page on the free list.
    pub fn next_free(buf: &[u8]) -> u64 {
        get_u64(buf, Self::OFF_NEXT)
    }

    /// Checks that `buf` holds a free-list page.
    pub fn check(buf: &[u8], page_id: PageId) -> Result<()> {
        if PageHeader::type_tag(buf) != PageType::FreeList as u8 {
            return Err(TesseraError::corrupt(
                page_id,
                format!("type tag {} is not a free-list page", PageHeader::type_tag(buf)),
            ));
        }
        Ok(())
    }
}
