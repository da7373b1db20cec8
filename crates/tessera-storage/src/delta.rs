//! Delta records: typed, replayable descriptions of single-page changes.
//!
//! Each record changes exactly one target page. Records that copy data from
//! another page (split forward, merge, inner replace) carry the source page
//! index instead of the bytes, so applying them reads the source through a
//! [`PageSource`]. This is only correct when records are applied in log
//! order: the source must be in the state it had when the record was
//! written.
//!
//! Payload layouts (little endian):
//!
//! | Record        | Payload                                             |
//! |---------------|-----------------------------------------------------|
//! | InitNewPage   | type u8, version u8, item_size u16, capacity u16    |
//! | InsertEntry   | index u32, entry bytes                              |
//! | RemoveEntries | index u32, count u32                                |
//! | Split         | middle u32, sibling u64                             |
//! | SplitForward  | source u64, middle u32                              |
//! | Merge         | source u64, parent u64, parent_index u32            |
//! | InnerReplace  | dst_index u32, src_page u64, src_index u32          |
//! | SetChild      | index u32, child u64                                |
//! | SetForward    | forward u64                                         |
//! | SetTreeRoot   | root u64, height u32                                |
//! | SetFreeList   | free_head u64, next_page u64                        |
//! | FreePage      | next_free u64                                       |
//! | PageSnapshot  | full page image                                     |

use crate::layout::{self, MetaPage, TreePage};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tessera_common::{
    PageHeader, PageId, PageType, Result, TesseraError, INVALID_PAGE_INDEX, PAGE_FORMAT_VERSION,
};
use tessera_wal::{Lsn, RecordType, WalRecord};

/// Read access to pages other than the one a record is applied to.
pub trait PageSource {
    /// Calls `f` with the current image of `page_id` under a shared latch.
    fn read_page(&self, page_id: PageId, f: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()>;
}

/// One atomic change to a single page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaRecord {
    /// Formats the page as an empty page of the given type.
    InitNewPage {
        page_type: PageType,
        version: u8,
        item_size: u16,
        capacity: u16,
    },
    /// Inserts a slot at `index`, shifting later slots right. On inner pages
    /// the entry is the item followed by its right child.
    InsertEntry { index: u32, entry: Bytes },
    /// Removes `count` slots starting at `index`.
    RemoveEntries { index: u32, count: u32 },
    /// Truncates the page at `middle_index` after its upper half moved to
    /// `sibling_page`. Leaves link forward to the sibling.
    Split { middle_index: u32, sibling_page: u64 },
    /// Formats the page as the right half of `source_page` split at
    /// `middle_index`, copying the upper slots from the source.
    SplitForward { source_page: u64, middle_index: u32 },
    /// Appends every slot of `source_page`. Inner merges pull the separator
    /// down from `parent_page` at `parent_index`.
    Merge {
        source_page: u64,
        parent_page: u64,
        parent_index: u32,
    },
    /// Overwrites the key of item `dst_index` with the leading bytes of item
    /// `src_index` of `src_page`.
    InnerReplace {
        dst_index: u32,
        src_page: u64,
        src_index: u32,
    },
    /// Sets child `index` of an inner page.
    SetChild { index: u32, child: u64 },
    /// Sets the forward link of a tree page.
    SetForward { forward: u64 },
    /// Sets the tree root and height in the meta page.
    SetTreeRoot { root: u64, height: u32 },
    /// Sets the free-list head and next unused page in the meta page.
    SetFreeList { free_head: u64, next_page: u64 },
    /// Formats the page as a free-list page linking to `next_free`.
    FreePage { next_free: u64 },
    /// Replaces the page with a full image.
    PageSnapshot { image: Bytes },
}

impl DeltaRecord {
    /// Returns the WAL record type of this record.
    pub fn record_type(&self) -> RecordType {
        match self {
            DeltaRecord::InitNewPage { .. } => RecordType::InitNewPage,
            DeltaRecord::InsertEntry { .. } => RecordType::InsertEntry,
            DeltaRecord::RemoveEntries { .. } => RecordType::RemoveEntries,
            DeltaRecord::Split { .. } => RecordType::Split,
            DeltaRecord::SplitForward { .. } => RecordType::SplitForward,
            DeltaRecord::Merge { .. } => RecordType::Merge,
            DeltaRecord::InnerReplace { .. } => RecordType::InnerReplace,
            DeltaRecord::SetChild { .. } => RecordType::SetChild,
            DeltaRecord::SetForward { .. } => RecordType::SetForward,
            DeltaRecord::SetTreeRoot { .. } => RecordType::SetTreeRoot,
            DeltaRecord::SetFreeList { .. } => RecordType::SetFreeList,
            DeltaRecord::FreePage { .. } => RecordType::FreePage,
            DeltaRecord::PageSnapshot { .. } => RecordType::PageSnapshot,
        }
    }

    /// Returns true if the record rewrites the whole page, so it can be
    /// applied to a page whose stored image is unreadable.
    pub fn overwrites_page(&self) -> bool {
        matches!(
            self,
            DeltaRecord::InitNewPage { .. }
                | DeltaRecord::FreePage { .. }
                | DeltaRecord::PageSnapshot { .. }
        )
    }

    /// Serializes the payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(24);
        match self {
            DeltaRecord::InitNewPage {
                page_type,
                version,
                item_size,
                capacity,
            } => {
                buf.put_u8(*page_type as u8);
                buf.put_u8(*version);
                buf.put_u16_le(*item_size);
                buf.put_u16_le(*capacity);
            }
            DeltaRecord::InsertEntry { index, entry } => {
                buf.put_u32_le(*index);
                buf.put_slice(entry);
            }
            DeltaRecord::RemoveEntries { index, count } => {
                buf.put_u32_le(*index);
                buf.put_u32_le(*count);
            }
            DeltaRecord::Split {
                middle_index,
                sibling_page,
            } => {
                buf.put_u32_le(*middle_index);
                buf.put_u64_le(*sibling_page);
            }
            DeltaRecord::SplitForward {
                source_page,
                middle_index,
            } => {
                buf.put_u64_le(*source_page);
                buf.put_u32_le(*middle_index);
            }
            DeltaRecord::Merge {
                source_page,
                parent_page,
                parent_index,
            } => {
                buf.put_u64_le(*source_page);
                buf.put_u64_le(*parent_page);
                buf.put_u32_le(*parent_index);
            }
            DeltaRecord::InnerReplace {
                dst_index,
                src_page,
                src_index,
            } => {
                buf.put_u32_le(*dst_index);
                buf.put_u64_le(*src_page);
                buf.put_u32_le(*src_index);
            }
            DeltaRecord::SetChild { index, child } => {
                buf.put_u32_le(*index);
                buf.put_u64_le(*child);
            }
            DeltaRecord::SetForward { forward } => buf.put_u64_le(*forward),
            DeltaRecord::SetTreeRoot { root, height } => {
                buf.put_u64_le(*root);
                buf.put_u32_le(*height);
            }
            DeltaRecord::SetFreeList {
                free_head,
                next_page,
            } => {
                buf.put_u64_le(*free_head);
                buf.put_u64_le(*next_page);
            }
            DeltaRecord::FreePage { next_free } => buf.put_u64_le(*next_free),
            DeltaRecord::PageSnapshot { image } => return image.clone(),
        }
        buf.freeze()
    }

    /// Deserializes a payload. Returns None if the payload does not match
    /// the fixed layout of its record type.
    pub fn decode(record_type: RecordType, payload: &[u8]) -> Option<Self> {
        let mut buf = payload;
        let fixed_len = match record_type {
            RecordType::InitNewPage => 6,
            RecordType::RemoveEntries | RecordType::SetForward | RecordType::FreePage => 8,
            RecordType::Split
            | RecordType::SplitForward
            | RecordType::SetChild
            | RecordType::SetTreeRoot => 12,
            RecordType::InnerReplace | RecordType::SetFreeList => 16,
            RecordType::Merge => 20,
            RecordType::InsertEntry => {
                if buf.len() <= 4 {
                    return None;
                }
                let index = buf.get_u32_le();
                return Some(DeltaRecord::InsertEntry {
                    index,
                    entry: Bytes::copy_from_slice(buf),
                });
            }
            RecordType::PageSnapshot => {
                return Some(DeltaRecord::PageSnapshot {
                    image: Bytes::copy_from_slice(buf),
                });
            }
            _ => return None,
        };
        if buf.len() != fixed_len {
            return None;
        }

        let record = match record_type {
            RecordType::InitNewPage => DeltaRecord::InitNewPage {
                page_type: PageType::from_u8(buf.get_u8())?,
                version: buf.get_u8(),
                item_size: buf.get_u16_le(),
                capacity: buf.get_u16_le(),
            },
            RecordType::RemoveEntries => DeltaRecord::RemoveEntries {
                index: buf.get_u32_le(),
                count: buf.get_u32_le(),
            },
            RecordType::Split => DeltaRecord::Split {
                middle_index: buf.get_u32_le(),
                sibling_page: buf.get_u64_le(),
            },
            RecordType::SplitForward => DeltaRecord::SplitForward {
                source_page: buf.get_u64_le(),
                middle_index: buf.get_u32_le(),
            },
            RecordType::Merge => DeltaRecord::Merge {
                source_page: buf.get_u64_le(),
                parent_page: buf.get_u64_le(),
                parent_index: buf.get_u32_le(),
            },
            RecordType::InnerReplace => DeltaRecord::InnerReplace {
                dst_index: buf.get_u32_le(),
                src_page: buf.get_u64_le(),
                src_index: buf.get_u32_le(),
            },
            RecordType::SetChild => DeltaRecord::SetChild {
                index: buf.get_u32_le(),
                child: buf.get_u64_le(),
            },
            RecordType::SetForward => DeltaRecord::SetForward {
                forward: buf.get_u64_le(),
            },
            RecordType::SetTreeRoot => DeltaRecord::SetTreeRoot {
                root: buf.get_u64_le(),
                height: buf.get_u32_le(),
            },
            RecordType::SetFreeList => DeltaRecord::SetFreeList {
                free_head: buf.get_u64_le(),
                next_page: buf.get_u64_le(),
            },
            RecordType::FreePage => DeltaRecord::FreePage {
                next_free: buf.get_u64_le(),
            },
            _ => return None,
        };
        Some(record)
    }

    /// Decodes the delta carried by a WAL record.
    pub fn from_wal(record: &WalRecord) -> Result<Self> {
        Self::decode(record.record_type, &record.payload).ok_or_else(|| {
            TesseraError::WalCorrupted {
                lsn: record.lsn.0,
                reason: format!(
                    "malformed {} payload of {} bytes",
                    record.record_type,
                    record.payload.len()
                ),
            }
        })
    }

    /// Wraps the record in a WAL envelope targeting `page_id`.
    pub fn to_wal(&self, page_id: PageId, op_id: u64) -> WalRecord {
        WalRecord::new(self.record_type(), page_id, op_id, self.encode())
    }

    /// Applies the record to `page`, the current image of `page_id`.
    ///
    /// Fails with `CorruptPage` when the page does not match the record's
    /// assumptions and with `MissingSourcePage` when a referenced page does
    /// not hold a tree page. The page LSN is left untouched.
    pub fn apply(&self, page_id: PageId, page: &mut [u8], sources: &dyn PageSource) -> Result<()> {
        match self {
            DeltaRecord::InitNewPage {
                page_type,
                version,
                item_size,
                capacity,
            } => init_page(page_id, page, *page_type, *version, *item_size, *capacity),
            DeltaRecord::InsertEntry { index, entry } => {
                TreePage::check(page, page_id)?;
                let index = *index as usize;
                let count = TreePage::count(page);
                if TreePage::is_full(page) {
                    return Err(TesseraError::corrupt(page_id, "insert into a full page"));
                }
                if index > count {
                    return Err(out_of_bounds(page_id, "insert", index, count));
                }
                if entry.len() != TreePage::slot_size(page) {
                    return Err(TesseraError::corrupt(
                        page_id,
                        format!(
                            "entry of {} bytes does not fit {}-byte slots",
                            entry.len(),
                            TreePage::slot_size(page)
                        ),
                    ));
                }
                TreePage::insert_slot(page, index, entry);
                Ok(())
            }
            DeltaRecord::RemoveEntries { index, count } => {
                TreePage::check(page, page_id)?;
                let (index, n) = (*index as usize, *count as usize);
                let count = TreePage::count(page);
                if index + n > count {
                    return Err(out_of_bounds(page_id, "remove", index + n, count));
                }
                TreePage::remove_slots(page, index, n);
                Ok(())
            }
            DeltaRecord::Split {
                middle_index,
                sibling_page,
            } => {
                TreePage::check(page, page_id)?;
                let middle = *middle_index as usize;
                let count = TreePage::count(page);
                if middle > count || (!TreePage::is_leaf(page) && middle == count) {
                    return Err(out_of_bounds(page_id, "split", middle, count));
                }
                TreePage::truncate(page, middle);
                if TreePage::is_leaf(page) {
                    TreePage::set_forward(page, *sibling_page);
                }
                Ok(())
            }
            DeltaRecord::SplitForward {
                source_page,
                middle_index,
            } => {
                let source = source_id(page_id, *source_page)?;
                let middle = *middle_index as usize;
                sources.read_page(source, &mut |src| {
                    let page_type = source_tree_page(src, source)?;
                    let count = TreePage::count(src);
                    let leaf = page_type == PageType::BTreeLeaf;
                    if middle > count || (!leaf && middle == count) {
                        return Err(out_of_bounds(source, "split", middle, count));
                    }
                    TreePage::format(
                        page,
                        page_id,
                        page_type,
                        TreePage::item_size(src) as u16,
                        TreePage::capacity(src) as u16,
                    );
                    if leaf {
                        TreePage::append_slots(page, TreePage::slots(src, middle, count), count - middle);
                        TreePage::set_forward(page, TreePage::forward(src));
                    } else {
                        // The middle item moves up to the parent.
                        TreePage::set_child(page, 0, TreePage::child(src, middle + 1));
                        TreePage::append_slots(
                            page,
                            TreePage::slots(src, middle + 1, count),
                            count - middle - 1,
                        );
                    }
                    Ok(())
                })
            }
            DeltaRecord::Merge {
                source_page,
                parent_page,
                parent_index,
            } => {
                let page_type = TreePage::check(page, page_id)?;
                let source = source_id(page_id, *source_page)?;
                let separator = if page_type == PageType::BTreeInner {
                    let parent = source_id(page_id, *parent_page)?;
                    let index = *parent_index as usize;
                    let mut separator = Vec::new();
                    sources.read_page(parent, &mut |src| {
                        source_tree_page(src, parent)?;
                        if index >= TreePage::count(src) {
                            return Err(out_of_bounds(parent, "separator", index, TreePage::count(src)));
                        }
                        separator = TreePage::item(src, index).to_vec();
                        Ok(())
                    })?;
                    Some(separator)
                } else {
                    None
                };

                sources.read_page(source, &mut |src| {
                    if source_tree_page(src, source)? != page_type
                        || TreePage::item_size(src) != TreePage::item_size(page)
                    {
                        return Err(TesseraError::corrupt(
                            page_id,
                            format!("cannot merge page {} of a different shape", source),
                        ));
                    }
                    let (count, src_count) = (TreePage::count(page), TreePage::count(src));
                    let merged = count + src_count + usize::from(separator.is_some());
                    if merged > TreePage::capacity(page) {
                        return Err(TesseraError::corrupt(
                            page_id,
                            format!(
                                "merge of {} items exceeds capacity {}",
                                merged,
                                TreePage::capacity(page)
                            ),
                        ));
                    }
                    match &separator {
                        Some(separator) => {
                            if separator.len() != TreePage::item_size(page) {
                                return Err(TesseraError::corrupt(
                                    page_id,
                                    "separator size does not match item size",
                                ));
                            }
                            let mut slot = separator.clone();
                            slot.extend_from_slice(&TreePage::child(src, 0).to_le_bytes());
                            TreePage::append_slots(page, &slot, 1);
                        }
                        None => TreePage::set_forward(page, TreePage::forward(src)),
                    }
                    TreePage::append_slots(page, TreePage::slots(src, 0, src_count), src_count);
                    Ok(())
                })
            }
            DeltaRecord::InnerReplace {
                dst_index,
                src_page,
                src_index,
            } => {
                TreePage::check(page, page_id)?;
                let (dst, index) = (*dst_index as usize, *src_index as usize);
                if dst >= TreePage::count(page) {
                    return Err(out_of_bounds(page_id, "replace", dst, TreePage::count(page)));
                }
                let source = source_id(page_id, *src_page)?;
                let key_size = TreePage::item_size(page);
                sources.read_page(source, &mut |src| {
                    source_tree_page(src, source)?;
                    if index >= TreePage::count(src) {
                        return Err(out_of_bounds(source, "replace source", index, TreePage::count(src)));
                    }
                    if TreePage::item_size(src) < key_size {
                        return Err(TesseraError::corrupt(
                            page_id,
                            format!("source items of page {} are shorter than keys", source),
                        ));
                    }
                    TreePage::write_item(page, dst, &TreePage::item(src, index)[..key_size]);
                    Ok(())
                })
            }
            DeltaRecord::SetChild { index, child } => {
                if TreePage::check(page, page_id)? != PageType::BTreeInner {
                    return Err(TesseraError::corrupt(page_id, "set child on a leaf page"));
                }
                let index = *index as usize;
                if index > TreePage::count(page) {
                    return Err(out_of_bounds(page_id, "child", index, TreePage::count(page)));
                }
                TreePage::set_child(page, index, *child);
                Ok(())
            }
            DeltaRecord::SetForward { forward } => {
                TreePage::check(page, page_id)?;
                TreePage::set_forward(page, *forward);
                Ok(())
            }
            DeltaRecord::SetTreeRoot { root, height } => {
                MetaPage::check(page, page_id)?;
                MetaPage::set_tree_root(page, *root, *height);
                Ok(())
            }
            DeltaRecord::SetFreeList {
                free_head,
                next_page,
            } => {
                MetaPage::check(page, page_id)?;
                MetaPage::set_free_list(page, *free_head, *next_page);
                Ok(())
            }
            DeltaRecord::FreePage { next_free } => {
                if page_id.is_meta() {
                    return Err(TesseraError::corrupt(page_id, "the meta page cannot be freed"));
                }
                layout::FreePage::format(page, page_id, *next_free);
                Ok(())
            }
            DeltaRecord::PageSnapshot { image } => {
                if image.len() != page.len() {
                    return Err(TesseraError::corrupt(
                        page_id,
                        format!("snapshot of {} bytes for a {}-byte page", image.len(), page.len()),
                    ));
                }
                page.copy_from_slice(image);
                Ok(())
            }
        }
    }

    /// Applies the record unless the page already reflects it.
    ///
    /// A page whose LSN is at or past `lsn` is left untouched and false is
    /// returned. Otherwise the record is applied and the page LSN advanced to
    /// `lsn`, which makes replaying the same record a no-op.
    pub fn redo(
        &self,
        lsn: Lsn,
        page_id: PageId,
        page: &mut [u8],
        sources: &dyn PageSource,
    ) -> Result<bool> {
        if PageHeader::lsn(page) >= lsn.0 {
            return Ok(false);
        }
        self.apply(page_id, page, sources)?;
        PageHeader::set_lsn(page, lsn.0);
        Ok(true)
    }
}

fn init_page(
    page_id: PageId,
    page: &mut [u8],
    page_type: PageType,
    version: u8,
    item_size: u16,
    capacity: u16,
) -> Result<()> {
    if version == 0 || version > PAGE_FORMAT_VERSION {
        return Err(TesseraError::corrupt(
            page_id,
            format!("unsupported page format version {}", version),
        ));
    }
    match page_type {
        PageType::BTreeLeaf | PageType::BTreeInner => {
            let max = TreePage::max_capacity(page.len(), page_type, item_size as usize);
            if item_size == 0 || capacity == 0 || capacity as usize > max {
                return Err(TesseraError::corrupt(
                    page_id,
                    format!("capacity {} of {}-byte items does not fit", capacity, item_size),
                ));
            }
            TreePage::format(page, page_id, page_type, item_size, capacity);
        }
        PageType::Meta => {
            if !page_id.is_meta() {
                return Err(TesseraError::corrupt(page_id, "meta page outside index 0"));
            }
            MetaPage::format(page, page_id.segment_id);
        }
        PageType::FreeList => layout::FreePage::format(page, page_id, INVALID_PAGE_INDEX),
        PageType::Unformatted => {
            page.fill(0);
            PageHeader::new(page_id, PageType::Unformatted).write_to(page);
        }
    }
    let mut header = PageHeader::read_from(page, page_id)?;
    header.version = version;
    header.write_to(page);
    Ok(())
}

fn source_id(target: PageId, source_page: u64) -> Result<PageId> {
    let source = target.sibling(source_page);
    if source_page == INVALID_PAGE_INDEX || source == target {
        return Err(TesseraError::MissingSourcePage { page_id: source });
    }
    Ok(source)
}

/// Checks a source page, reporting anything but a tree page as missing.
fn source_tree_page(src: &[u8], source: PageId) -> Result<PageType> {
    TreePage::check(src, source).map_err(|_| TesseraError::MissingSourcePage { page_id: source })
}

fn out_of_bounds(page_id: PageId, what: &str, index: usize, count: usize) -> TesseraError {
    TesseraError::corrupt(
        page_id,
        format!("{} index {} out of bounds for {} items", what, index, count),
    )
}
