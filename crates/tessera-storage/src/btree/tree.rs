//! Page-based B+ tree whose changes are logged structural operations.

use super::key::KeyLayout;
use super::operation::Operation;
use crate::delta::DeltaRecord;
use crate::layout::{MetaPage, TreePage};
use crate::store::PageStore;
use bytes::Bytes;
use parking_lot::RwLock;
use std::cmp::Ordering as KeyOrdering;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tessera_buffer::PageReadGuard;
use tessera_common::{
    PageId, PageType, Result, TesseraError, INVALID_PAGE_INDEX, PAGE_FORMAT_VERSION,
};
use tracing::{debug, info};

/// Maximum tree height.
const MAX_HEIGHT: usize = 16;

/// Page geometry for new tree pages.
///
/// Capacities default to as many items as fit a page and are clamped to
/// that maximum. Pages formatted earlier keep the capacity in their header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeOptions {
    /// Items per leaf page (at least 2).
    pub leaf_capacity: Option<u16>,
    /// Separator keys per inner page (at least 3).
    pub inner_capacity: Option<u16>,
}

/// One level of a latched root-to-leaf path.
#[derive(Debug, Clone, Copy)]
struct PathStep {
    page_id: PageId,
    /// Child followed from this page; unused for the leaf.
    child_index: usize,
}

/// B+ tree over fixed-size keys and values stored in one segment.
///
/// The segment meta page records the root and height. Every change runs as
/// an [`Operation`], so a crash in the middle of a split or merge leaves no
/// trace after recovery.
///
/// Writers first try an optimistic pass that read-latches inner pages and
/// write-latches only the leaf. When the leaf would overflow or underflow,
/// or the removed key bounds the leaf from below, they retry with the whole
/// path write-latched while holding the root latch exclusively.
pub struct BPlusTree<L: KeyLayout> {
    store: Arc<PageStore>,
    layout: L,
    segment_id: u32,
    leaf_capacity: u16,
    inner_capacity: u16,
    root: AtomicU64,
    height: AtomicU32,
    /// Shared by readers and leaf-only writers, exclusive for restructuring.
    root_latch: RwLock<()>,
}

fn capacities<L: KeyLayout>(
    page_size: usize,
    layout: &L,
    options: TreeOptions,
) -> Result<(u16, u16)> {
    let key_size = layout.key_size();
    if key_size == 0 || layout.leaf_item_size() > usize::from(u16::MAX) {
        return Err(TesseraError::InvalidConfig(format!(
            "unsupported item layout: {}-byte keys, {}-byte values",
            key_size,
            layout.value_size()
        )));
    }
    let leaf_max = TreePage::max_capacity(page_size, PageType::BTreeLeaf, layout.leaf_item_size())
        .min(usize::from(u16::MAX));
    let inner_max = TreePage::max_capacity(page_size, PageType::BTreeInner, key_size)
        .min(usize::from(u16::MAX));
    let leaf = options
        .leaf_capacity
        .map_or(leaf_max, usize::from)
        .min(leaf_max);
    let inner = options
        .inner_capacity
        .map_or(inner_max, usize::from)
        .min(inner_max);
    if leaf < 2 || inner < 3 {
        return Err(TesseraError::InvalidConfig(format!(
            "tree pages hold {} leaf items and {} inner keys (need at least 2 and 3)",
            leaf, inner
        )));
    }
    Ok((leaf as u16, inner as u16))
}

/// Serializes an inner slot: the separator followed by its right child.
fn inner_slot(separator: &[u8], child: u64) -> Bytes {
    let mut slot = Vec::with_capacity(separator.len() + 8);
    slot.extend_from_slice(separator);
    slot.extend_from_slice(&child.to_le_bytes());
    Bytes::from(slot)
}

/// Fewest items a non-root page may hold.
fn min_items(page: &[u8]) -> usize {
    TreePage::capacity(page) / 2
}

impl<L: KeyLayout> BPlusTree<L> {
    /// Creates an empty tree in a segment, formatting the segment if needed.
    pub fn create(
        store: Arc<PageStore>,
        segment_id: u32,
        layout: L,
        options: TreeOptions,
    ) -> Result<Self> {
        let (leaf_capacity, inner_capacity) = capacities(store.page_size(), &layout, options)?;
        store.open_segment(segment_id)?;
        let meta_id = PageId::meta(segment_id);
        if MetaPage::root(&store.read(meta_id)?) != INVALID_PAGE_INDEX {
            return Err(TesseraError::InvalidConfig(format!(
                "segment {} already holds a tree",
                segment_id
            )));
        }

        let root = store.allocate(segment_id)?;
        {
            let mut op = Operation::begin(&store, store.deadline())?;
            op.lock(root)?;
            op.log(root, DeltaRecord::InitNewPage {
                page_type: PageType::BTreeLeaf,
                version: PAGE_FORMAT_VERSION,
                item_size: layout.leaf_item_size() as u16,
                capacity: leaf_capacity,
            })?;
            op.lock(meta_id)?;
            op.log(meta_id, DeltaRecord::SetTreeRoot {
                root: root.page_index,
                height: 1,
            })?;
            op.commit()?;
        }
        info!(
            segment = segment_id,
            leaf_capacity, inner_capacity, "created tree"
        );

        Ok(Self {
            store,
            layout,
            segment_id,
            leaf_capacity,
            inner_capacity,
            root: AtomicU64::new(root.page_index),
            height: AtomicU32::new(1),
            root_latch: RwLock::new(()),
        })
    }

    /// Opens the tree stored in a segment.
    ///
    /// Capacities left unset in `options` are taken from the pages on the
    /// leftmost path, so new pages match the ones already written. A tree
    /// without inner pages yet falls back to the default inner capacity.
    pub fn open(
        store: Arc<PageStore>,
        segment_id: u32,
        layout: L,
        options: TreeOptions,
    ) -> Result<Self> {
        let meta_id = PageId::meta(segment_id);
        let (root, height) = {
            let meta = store.read(meta_id)?;
            if !MetaPage::is_formatted(&meta) {
                return Err(TesseraError::PageNotFound { page_id: meta_id });
            }
            (MetaPage::root(&meta), MetaPage::height(&meta))
        };
        if root == INVALID_PAGE_INDEX || height == 0 {
            return Err(TesseraError::PageNotFound { page_id: meta_id });
        }

        // Check the item sizes along the leftmost path against the layout.
        let mut stored_leaf = None;
        let mut stored_inner = None;
        let mut page = store.read(meta_id.sibling(root))?;
        for _ in 0..MAX_HEIGHT {
            let page_type = TreePage::check(&page, page.page_id())?;
            let expected = match page_type {
                PageType::BTreeLeaf => layout.leaf_item_size(),
                _ => layout.key_size(),
            };
            if TreePage::item_size(&page) != expected {
                return Err(TesseraError::InvalidEntrySize {
                    expected,
                    actual: TreePage::item_size(&page),
                });
            }
            let capacity = u16::try_from(TreePage::capacity(&page)).ok();
            if page_type == PageType::BTreeLeaf {
                stored_leaf = capacity;
                break;
            }
            stored_inner = stored_inner.or(capacity);
            page = store.read(meta_id.sibling(TreePage::child(&page, 0)))?;
        }
        drop(page);
        let (leaf_capacity, inner_capacity) = capacities(store.page_size(), &layout, TreeOptions {
            leaf_capacity: options.leaf_capacity.or(stored_leaf),
            inner_capacity: options.inner_capacity.or(stored_inner),
        })?;
        debug!(
            segment = segment_id,
            root, height, leaf_capacity, inner_capacity, "opened tree"
        );

        Ok(Self {
            store,
            layout,
            segment_id,
            leaf_capacity,
            inner_capacity,
            root: AtomicU64::new(root),
            height: AtomicU32::new(height),
            root_latch: RwLock::new(()),
        })
    }

    /// Returns the segment holding the tree.
    pub fn segment_id(&self) -> u32 {
        self.segment_id
    }

    /// Returns the key layout.
    pub fn layout(&self) -> &L {
        &self.layout
    }

    /// Returns the page store.
    pub fn store(&self) -> &Arc<PageStore> {
        &self.store
    }

    /// Returns the root page.
    pub fn root_page_id(&self) -> PageId {
        self.page_id(self.root.load(Ordering::Acquire))
    }

    /// Returns the tree height (1 = the root is a leaf).
    pub fn height(&self) -> u32 {
        self.height.load(Ordering::Acquire)
    }

    /// Returns the capacity of new leaf pages.
    pub fn leaf_capacity(&self) -> u16 {
        self.leaf_capacity
    }

    /// Returns the capacity of new inner pages.
    pub fn inner_capacity(&self) -> u16 {
        self.inner_capacity
    }

    fn page_id(&self, page_index: u64) -> PageId {
        PageId::new(self.segment_id, page_index)
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.layout.key_size() {
            return Err(TesseraError::InvalidEntrySize {
                expected: self.layout.key_size(),
                actual: key.len(),
            });
        }
        Ok(())
    }

    /// Binary search over the keys of a tree page.
    fn search(&self, page: &[u8], key: &[u8]) -> std::result::Result<usize, usize> {
        let key_size = self.layout.key_size();
        let (mut lo, mut hi) = (0, TreePage::count(page));
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.layout.compare(&TreePage::item(page, mid)[..key_size], key) {
                KeyOrdering::Less => lo = mid + 1,
                KeyOrdering::Greater => hi = mid,
                KeyOrdering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    /// Child of an inner page that covers `key`. Separator `i` is the
    /// smallest key under child `i + 1`.
    fn child_index(&self, page: &[u8], key: &[u8]) -> usize {
        match self.search(page, key) {
            Ok(index) => index + 1,
            Err(index) => index,
        }
    }

    // Reads

    /// Crabs down to the leaf covering `key`, or the leftmost leaf.
    fn find_leaf(&self, key: Option<&[u8]>) -> Result<PageReadGuard<'_>> {
        let mut page = {
            let _root = self.root_latch.read();
            self.store.read(self.root_page_id())?
        };
        for _ in 0..MAX_HEIGHT {
            if TreePage::check(&page, page.page_id())? == PageType::BTreeLeaf {
                return Ok(page);
            }
            let index = key.map_or(0, |key| self.child_index(&page, key));
            let child = self.page_id(TreePage::child(&page, index));
            page = self.store.read(child)?;
        }
        Err(TesseraError::corrupt(
            page.page_id(),
            format!("tree deeper than {} levels", MAX_HEIGHT),
        ))
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_key(key)?;
        let leaf = self.find_leaf(Some(key))?;
        let key_size = self.layout.key_size();
        Ok(self
            .search(&leaf, key)
            .ok()
            .map(|index| TreePage::item(&leaf, index)[key_size..].to_vec()))
    }

    /// Returns every entry with a key at or after `from`, in key order.
    pub fn scan(&self, from: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if let Some(key) = from {
            self.check_key(key)?;
        }
        let key_size = self.layout.key_size();
        let mut leaf = self.find_leaf(from)?;
        let mut start = match from {
            Some(key) => match self.search(&leaf, key) {
                Ok(index) | Err(index) => index,
            },
            None => 0,
        };

        let mut entries = Vec::new();
        loop {
            for index in start..TreePage::count(&leaf) {
                let item = TreePage::item(&leaf, index);
                entries.push((item[..key_size].to_vec(), item[key_size..].to_vec()));
            }
            let forward = TreePage::forward(&leaf);
            if forward == INVALID_PAGE_INDEX {
                return Ok(entries);
            }
            let next = self.store.read(self.page_id(forward))?;
            TreePage::check(&next, next.page_id())?;
            leaf = next;
            start = 0;
        }
    }

    /// Returns the number of entries.
    pub fn len(&self) -> Result<usize> {
        Ok(self.scan(None)?.len())
    }

    /// Returns true if the tree holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        let leaf = self.find_leaf(None)?;
        Ok(TreePage::count(&leaf) == 0 && TreePage::forward(&leaf) == INVALID_PAGE_INDEX)
    }

    // Writes

    /// Inserts a new entry. Fails with `DuplicateKey` if the key exists.
    ///
    /// Fails with `OperationAborted` when a latch is not granted within the
    /// store's lock timeout; the tree is unchanged and the call may be
    /// retried.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        if value.len() != self.layout.value_size() {
            return Err(TesseraError::InvalidEntrySize {
                expected: self.layout.value_size(),
                actual: value.len(),
            });
        }
        let mut entry = Vec::with_capacity(self.layout.leaf_item_size());
        entry.extend_from_slice(key);
        entry.extend_from_slice(value);

        if self.insert_in_leaf(key, &entry)? {
            return Ok(());
        }
        self.insert_with_split(key, &entry)
    }

    /// Removes an entry and returns its value. Fails with `KeyNotFound` if
    /// the key is absent.
    pub fn remove(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.check_key(key)?;
        if let Some(value) = self.remove_from_leaf(key)? {
            return Ok(value);
        }
        self.remove_with_rebalance(key)
    }

    /// Read-latches inner pages down to the leaf for `key` and write-latches
    /// the leaf. Returns the leaf and whether a separator bounds it from
    /// below.
    fn lock_leaf(&self, op: &mut Operation<'_>, key: &[u8]) -> Result<(PageId, bool)> {
        let height = self.height.load(Ordering::Acquire) as usize;
        let mut current = self.root_page_id();
        let mut bounded = false;
        let mut parent = None;
        for _ in 1..height {
            let page = self.store.try_read_until(current, op.deadline())?;
            TreePage::check(&page, current)?;
            let index = self.child_index(&page, key);
            bounded |= index > 0;
            current = self.page_id(TreePage::child(&page, index));
            parent = Some(page);
        }
        op.lock(current)?;
        drop(parent);

        if TreePage::check(op.page(current)?, current)? != PageType::BTreeLeaf {
            return Err(TesseraError::corrupt(current, "expected a leaf"));
        }
        Ok((current, bounded))
    }

    /// Write-latches every page from the root to the leaf for `key`.
    ///
    /// With `left_siblings`, the left sibling of every rightmost child on
    /// the path is latched before the child. Rebalancing such a child uses
    /// that sibling, and latching it afterwards would go right to left
    /// against scans.
    fn lock_path(
        &self,
        op: &mut Operation<'_>,
        key: &[u8],
        left_siblings: bool,
    ) -> Result<Vec<PathStep>> {
        let mut path = Vec::with_capacity(self.height() as usize);
        let mut current = self.root_page_id();
        while path.len() < MAX_HEIGHT {
            op.lock(current)?;
            let page = op.page(current)?;
            if TreePage::check(page, current)? == PageType::BTreeLeaf {
                path.push(PathStep {
                    page_id: current,
                    child_index: 0,
                });
                return Ok(path);
            }
            let child_index = self.child_index(page, key);
            let child = self.page_id(TreePage::child(page, child_index));
            let left = (left_siblings && child_index > 0 && child_index == TreePage::count(page))
                .then(|| self.page_id(TreePage::child(page, child_index - 1)));
            path.push(PathStep {
                page_id: current,
                child_index,
            });
            if let Some(left) = left {
                op.lock(left)?;
            }
            current = child;
        }
        Err(TesseraError::corrupt(
            current,
            format!("tree deeper than {} levels", MAX_HEIGHT),
        ))
    }

    /// Inserts into a leaf with room. Returns false if the leaf is full.
    fn insert_in_leaf(&self, key: &[u8], entry: &[u8]) -> Result<bool> {
        let deadline = self.store.deadline();
        let _root = self
            .root_latch
            .try_read_until(deadline)
            .ok_or_else(|| TesseraError::aborted("timed out waiting for the tree root"))?;
        let mut op = Operation::begin(&self.store, deadline)?;
        let (leaf_id, _) = self.lock_leaf(&mut op, key)?;

        let page = op.page(leaf_id)?;
        let index = match self.search(page, key) {
            Ok(_) => return Err(TesseraError::DuplicateKey),
            Err(index) => index,
        };
        if TreePage::is_full(page) {
            return Ok(false);
        }
        op.log(leaf_id, DeltaRecord::InsertEntry {
            index: index as u32,
            entry: Bytes::copy_from_slice(entry),
        })?;
        op.commit()?;
        Ok(true)
    }

    fn insert_with_split(&self, key: &[u8], entry: &[u8]) -> Result<()> {
        let deadline = self.store.deadline();
        let _root = self
            .root_latch
            .try_write_until(deadline)
            .ok_or_else(|| TesseraError::aborted("timed out waiting for the tree root"))?;
        let mut op = Operation::begin(&self.store, deadline)?;
        let path = self.lock_path(&mut op, key, false)?;
        let leaf_id = path[path.len() - 1].page_id;

        let page = op.page(leaf_id)?;
        let index = self.search(page, key).err().ok_or(TesseraError::DuplicateKey)?;
        if !TreePage::is_full(page) {
            op.log(leaf_id, DeltaRecord::InsertEntry {
                index: index as u32,
                entry: Bytes::copy_from_slice(entry),
            })?;
            return op.commit();
        }

        let (separator, sibling) = self.split(&mut op, leaf_id)?;
        let target = if self.layout.compare(key, &separator) == KeyOrdering::Less {
            leaf_id
        } else {
            sibling
        };
        let index = self
            .search(op.page(target)?, key)
            .err()
            .ok_or(TesseraError::DuplicateKey)?;
        op.log(target, DeltaRecord::InsertEntry {
            index: index as u32,
            entry: Bytes::copy_from_slice(entry),
        })?;

        // Push separators up until a parent has room.
        let mut pending = Some((separator, sibling));
        for step in path[..path.len() - 1].iter().rev() {
            let Some((separator, sibling)) = pending.take() else {
                break;
            };
            let slot = inner_slot(&separator, sibling.page_index);
            if !TreePage::is_full(op.page(step.page_id)?) {
                op.log(step.page_id, DeltaRecord::InsertEntry {
                    index: step.child_index as u32,
                    entry: slot,
                })?;
                break;
            }

            let (up, right) = self.split(&mut op, step.page_id)?;
            let middle = TreePage::count(op.page(step.page_id)?);
            if step.child_index <= middle {
                op.log(step.page_id, DeltaRecord::InsertEntry {
                    index: step.child_index as u32,
                    entry: slot,
                })?;
            } else {
                op.log(right, DeltaRecord::InsertEntry {
                    index: (step.child_index - middle - 1) as u32,
                    entry: slot,
                })?;
            }
            pending = Some((up, right));
        }

        match pending {
            Some((separator, sibling)) => self.grow_root(op, path[0].page_id, &separator, sibling),
            None => op.commit(),
        }
    }

    /// Moves the upper half of a full page into a new sibling.
    ///
    /// Returns the separator key for the parent and the sibling. An inner
    /// page gives its middle key to the parent.
    fn split(&self, op: &mut Operation<'_>, page_id: PageId) -> Result<(Vec<u8>, PageId)> {
        let page = op.page(page_id)?;
        let middle = TreePage::count(page) / 2;
        let separator = TreePage::item(page, middle)[..self.layout.key_size()].to_vec();

        let sibling = self.store.allocate(self.segment_id)?;
        op.lock(sibling)?;
        op.log(sibling, DeltaRecord::SplitForward {
            source_page: page_id.page_index,
            middle_index: middle as u32,
        })?;
        op.log(page_id, DeltaRecord::Split {
            middle_index: middle as u32,
            sibling_page: sibling.page_index,
        })?;
        debug!(page_id = %page_id, sibling = %sibling, middle, "split page");
        Ok((separator, sibling))
    }

    /// Puts a new inner root above a root that split. Takes the meta page
    /// after every allocation of the operation.
    fn grow_root(
        &self,
        mut op: Operation<'_>,
        old_root: PageId,
        separator: &[u8],
        sibling: PageId,
    ) -> Result<()> {
        let height = self.height();
        let new_root = self.store.allocate(self.segment_id)?;
        op.lock(new_root)?;
        op.log(new_root, DeltaRecord::InitNewPage {
            page_type: PageType::BTreeInner,
            version: PAGE_FORMAT_VERSION,
            item_size: self.layout.key_size() as u16,
            capacity: self.inner_capacity,
        })?;
        op.log(new_root, DeltaRecord::SetChild {
            index: 0,
            child: old_root.page_index,
        })?;
        op.log(new_root, DeltaRecord::InsertEntry {
            index: 0,
            entry: inner_slot(separator, sibling.page_index),
        })?;

        let meta_id = PageId::meta(self.segment_id);
        op.lock(meta_id)?;
        op.log(meta_id, DeltaRecord::SetTreeRoot {
            root: new_root.page_index,
            height: height + 1,
        })?;
        op.commit()?;

        self.root.store(new_root.page_index, Ordering::Release);
        self.height.store(height + 1, Ordering::Release);
        debug!(root = %new_root, height = height + 1, "tree grew");
        Ok(())
    }

    /// Removes from a leaf that stays at least half full. Returns `None` when
    /// the removal needs rebalancing or a separator update.
    fn remove_from_leaf(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let deadline = self.store.deadline();
        let _root = self
            .root_latch
            .try_read_until(deadline)
            .ok_or_else(|| TesseraError::aborted("timed out waiting for the tree root"))?;
        let mut op = Operation::begin(&self.store, deadline)?;
        let (leaf_id, bounded) = self.lock_leaf(&mut op, key)?;

        let page = op.page(leaf_id)?;
        let index = self
            .search(page, key)
            .map_err(|_| TesseraError::KeyNotFound)?;
        let value = TreePage::item(page, index)[self.layout.key_size()..].to_vec();
        let is_root = self.height() == 1;
        let local = TreePage::count(page) > min_items(page) && (index > 0 || !bounded);
        if !is_root && !local {
            return Ok(None);
        }

        op.log(leaf_id, DeltaRecord::RemoveEntries {
            index: index as u32,
            count: 1,
        })?;
        op.commit()?;
        Ok(Some(value))
    }

    fn remove_with_rebalance(&self, key: &[u8]) -> Result<Vec<u8>> {
        let deadline = self.store.deadline();
        let _root = self
            .root_latch
            .try_write_until(deadline)
            .ok_or_else(|| TesseraError::aborted("timed out waiting for the tree root"))?;
        let mut op = Operation::begin(&self.store, deadline)?;
        let path = self.lock_path(&mut op, key, true)?;
        let leaf_id = path[path.len() - 1].page_id;

        let page = op.page(leaf_id)?;
        let index = self
            .search(page, key)
            .map_err(|_| TesseraError::KeyNotFound)?;
        let value = TreePage::item(page, index)[self.layout.key_size()..].to_vec();
        op.log(leaf_id, DeltaRecord::RemoveEntries {
            index: index as u32,
            count: 1,
        })?;

        let emptied = TreePage::count(op.page(leaf_id)?) == 0;
        if index == 0 && !emptied {
            self.replace_separator(&mut op, &path, key)?;
        }

        for depth in (1..path.len()).rev() {
            let node = path[depth].page_id;
            let page = op.page(node)?;
            if TreePage::count(page) >= min_items(page) {
                break;
            }
            let parent = path[depth - 1];
            self.rebalance(&mut op, parent.page_id, parent.child_index, node)?;
        }
        // An emptied leaf only has a new minimum once rebalancing refilled it.
        if index == 0 && emptied && path.len() > 1 {
            self.refresh_separator(&mut op, key)?;
        }

        let height = self.height();
        let root_id = path[0].page_id;
        let collapse = {
            let root = op.page(root_id)?;
            (height > 1 && TreePage::count(root) == 0).then(|| TreePage::child(root, 0))
        };
        let Some(child) = collapse else {
            op.commit()?;
            return Ok(value);
        };

        let meta_id = PageId::meta(self.segment_id);
        op.lock(meta_id)?;
        op.log(meta_id, DeltaRecord::SetTreeRoot {
            root: child,
            height: height - 1,
        })?;
        op.free_after_commit(root_id);
        op.commit()?;

        self.root.store(child, Ordering::Release);
        self.height.store(height - 1, Ordering::Release);
        debug!(root = child, height = height - 1, "tree shrank");
        Ok(value)
    }

    /// Points the separator that equals a removed leaf minimum at the
    /// leaf's new first key.
    fn replace_separator(
        &self,
        op: &mut Operation<'_>,
        path: &[PathStep],
        key: &[u8],
    ) -> Result<()> {
        let leaf_id = path[path.len() - 1].page_id;
        let Some(step) = path[..path.len() - 1]
            .iter()
            .rev()
            .find(|step| step.child_index > 0)
        else {
            return Ok(());
        };
        let index = step.child_index - 1;
        let separator = TreePage::item(op.page(step.page_id)?, index);
        if self.layout.compare(separator, key) != KeyOrdering::Equal {
            return Ok(());
        }
        op.log(step.page_id, DeltaRecord::InnerReplace {
            dst_index: index as u32,
            src_page: leaf_id.page_index,
            src_index: 0,
        })?;
        Ok(())
    }

    /// Points a separator equal to `key` at the first key of the leaf that
    /// now covers `key`, after merges and borrows reshaped the path.
    ///
    /// Every page on the new route was latched by the removal. A separator
    /// removed by a merge leaves nothing to refresh.
    fn refresh_separator(&self, op: &mut Operation<'_>, key: &[u8]) -> Result<()> {
        let mut stale = None;
        let mut current = self.root_page_id();
        for _ in 0..MAX_HEIGHT {
            if !op.holds(current) {
                return Ok(());
            }
            let page = op.page(current)?;
            if TreePage::is_leaf(page) {
                let Some((page_id, index)) = stale else {
                    return Ok(());
                };
                if TreePage::count(page) == 0 {
                    return Ok(());
                }
                op.log(page_id, DeltaRecord::InnerReplace {
                    dst_index: index as u32,
                    src_page: current.page_index,
                    src_index: 0,
                })?;
                return Ok(());
            }
            let child_index = self.child_index(page, key);
            if child_index > 0
                && self.layout.compare(TreePage::item(page, child_index - 1), key)
                    == KeyOrdering::Equal
            {
                stale = Some((current, child_index - 1));
            }
            current = self.page_id(TreePage::child(page, child_index));
        }
        Ok(())
    }

    /// Fixes an underflowing child of `parent_id` by merging it with a
    /// sibling, or by borrowing one item when the two do not fit one page.
    fn rebalance(
        &self,
        op: &mut Operation<'_>,
        parent_id: PageId,
        child_index: usize,
        node: PageId,
    ) -> Result<()> {
        let parent = op.page(parent_id)?;
        let parent_count = TreePage::count(parent);
        if parent_count == 0 {
            return Err(TesseraError::corrupt(parent_id, "inner page without separators"));
        }
        let left_index = if child_index < parent_count {
            child_index
        } else {
            child_index - 1
        };
        let left_id = self.page_id(TreePage::child(parent, left_index));
        let right_id = self.page_id(TreePage::child(parent, left_index + 1));
        // The left sibling of a rightmost child is already held from
        // `lock_path`, so both calls latch left to right.
        op.lock(left_id)?;
        op.lock(right_id)?;

        let left = op.page(left_id)?;
        let right = op.page(right_id)?;
        let leaf = TreePage::is_leaf(left);
        let merged = TreePage::count(left) + TreePage::count(right) + usize::from(!leaf);

        if merged <= TreePage::capacity(left) {
            op.log(left_id, DeltaRecord::Merge {
                source_page: right_id.page_index,
                parent_page: parent_id.page_index,
                parent_index: left_index as u32,
            })?;
            op.log(parent_id, DeltaRecord::RemoveEntries {
                index: left_index as u32,
                count: 1,
            })?;
            op.free_after_commit(right_id);
            debug!(page_id = %left_id, source = %right_id, "merged pages");
            return Ok(());
        }

        match (node == left_id, leaf) {
            (true, true) => {
                let first = Bytes::copy_from_slice(TreePage::item(right, 0));
                let count = TreePage::count(left);
                op.log(left_id, DeltaRecord::InsertEntry {
                    index: count as u32,
                    entry: first,
                })?;
                op.log(right_id, DeltaRecord::RemoveEntries { index: 0, count: 1 })?;
                op.log(parent_id, DeltaRecord::InnerReplace {
                    dst_index: left_index as u32,
                    src_page: right_id.page_index,
                    src_index: 0,
                })?;
            }
            (true, false) => {
                let separator = TreePage::item(op.page(parent_id)?, left_index).to_vec();
                let (first_child, second_child) = (TreePage::child(right, 0), TreePage::child(right, 1));
                let count = TreePage::count(left);
                op.log(left_id, DeltaRecord::InsertEntry {
                    index: count as u32,
                    entry: inner_slot(&separator, first_child),
                })?;
                op.log(parent_id, DeltaRecord::InnerReplace {
                    dst_index: left_index as u32,
                    src_page: right_id.page_index,
                    src_index: 0,
                })?;
                op.log(right_id, DeltaRecord::SetChild {
                    index: 0,
                    child: second_child,
                })?;
                op.log(right_id, DeltaRecord::RemoveEntries { index: 0, count: 1 })?;
            }
            (false, true) => {
                let last = TreePage::count(left) - 1;
                let item = Bytes::copy_from_slice(TreePage::item(left, last));
                op.log(right_id, DeltaRecord::InsertEntry {
                    index: 0,
                    entry: item,
                })?;
                op.log(left_id, DeltaRecord::RemoveEntries {
                    index: last as u32,
                    count: 1,
                })?;
                op.log(parent_id, DeltaRecord::InnerReplace {
                    dst_index: left_index as u32,
                    src_page: right_id.page_index,
                    src_index: 0,
                })?;
            }
            (false, false) => {
                let separator = TreePage::item(op.page(parent_id)?, left_index).to_vec();
                let count = TreePage::count(left);
                let (last_child, first_child) = (TreePage::child(left, count), TreePage::child(right, 0));
                op.log(right_id, DeltaRecord::InsertEntry {
                    index: 0,
                    entry: inner_slot(&separator, first_child),
                })?;
                op.log(right_id, DeltaRecord::SetChild {
                    index: 0,
                    child: last_child,
                })?;
                op.log(parent_id, DeltaRecord::InnerReplace {
                    dst_index: left_index as u32,
                    src_page: left_id.page_index,
                    src_index: (count - 1) as u32,
                })?;
                op.log(left_id, DeltaRecord::RemoveEntries {
                    index: (count - 1) as u32,
                    count: 1,
                })?;
            }
        }
        debug!(page_id = %node, "borrowed from sibling");
        Ok(())
    }
}
