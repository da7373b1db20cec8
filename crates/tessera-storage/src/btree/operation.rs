//! Structural operations: atomic multi-page changes.

use crate::delta::{DeltaRecord, PageSource};
use crate::store::PageStore;
use parking_lot::RwLockReadGuard;
use std::collections::HashMap;
use std::time::Instant;
use tessera_buffer::PageWriteGuard;
use tessera_common::{PageHeader, PageId, Result, TesseraError};
use tessera_wal::Lsn;
use tracing::{debug, warn};

/// A group of delta records that commits or aborts as a unit.
///
/// Pages are write-latched through [`Operation::lock`] and stay latched
/// until the operation ends. Each [`Operation::log`] applies one record to a
/// latched page and appends it to the WAL under the operation id; the
/// begin marker is written with the first record, so an operation that
/// changes nothing leaves no trace in the log.
///
/// Dropping an uncommitted operation rolls the latched pages back to their
/// images from before the first change and appends an abort marker.
/// Recovery never replays records of an operation without a commit marker.
///
/// The operation also serves as the [`PageSource`] for its own records, so
/// a record that copies from another latched page reads the latched image
/// instead of waiting on its own latch.
pub struct Operation<'a> {
    store: &'a PageStore,
    deadline: Instant,
    op_id: Option<u64>,
    pages: HashMap<PageId, PageWriteGuard<'a>>,
    before_images: HashMap<PageId, Box<[u8]>>,
    pending_free: Vec<PageId>,
    records: usize,
    finished: bool,
    // Declared last: the page latches go first on drop.
    _checkpoint: RwLockReadGuard<'a, ()>,
}

impl<'a> Operation<'a> {
    /// Starts an operation whose lock waits end at `deadline`.
    ///
    /// Holds off checkpoints until the operation ends.
    pub fn begin(store: &'a PageStore, deadline: Instant) -> Result<Self> {
        let checkpoint = store.operation_latch(deadline)?;
        Ok(Self {
            store,
            deadline,
            op_id: None,
            pages: HashMap::new(),
            before_images: HashMap::new(),
            pending_free: Vec::new(),
            records: 0,
            finished: false,
            _checkpoint: checkpoint,
        })
    }

    /// Returns the operation id once the first record has been logged.
    pub fn op_id(&self) -> Option<u64> {
        self.op_id
    }

    /// Returns the lock deadline.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Returns the number of records logged so far.
    pub fn record_count(&self) -> usize {
        self.records
    }

    /// Write-latches a page for the rest of the operation.
    ///
    /// Locking a page already held is a no-op. Fails with `OperationAborted`
    /// if the latch is not granted before the deadline.
    pub fn lock(&mut self, page_id: PageId) -> Result<()> {
        if self.pages.contains_key(&page_id) {
            return Ok(());
        }
        let guard = self.store.try_write_until(page_id, self.deadline)?;
        self.pages.insert(page_id, guard);
        Ok(())
    }

    /// Returns true if the page is latched by this operation.
    pub fn holds(&self, page_id: PageId) -> bool {
        self.pages.contains_key(&page_id)
    }

    /// Releases the latch on a page the operation has not changed.
    pub fn release(&mut self, page_id: PageId) {
        if !self.before_images.contains_key(&page_id) {
            self.pages.remove(&page_id);
        }
    }

    /// Returns the current image of a latched page.
    pub fn page(&self, page_id: PageId) -> Result<&[u8]> {
        self.pages
            .get(&page_id)
            .map(|guard| &guard[..])
            .ok_or_else(|| TesseraError::Internal(format!("page {} is not latched", page_id)))
    }

    /// Applies a record to a latched page and appends it to the WAL.
    ///
    /// Returns the LSN of the record, which also becomes the page LSN.
    pub fn log(&mut self, page_id: PageId, record: DeltaRecord) -> Result<Lsn> {
        let mut guard = self
            .pages
            .remove(&page_id)
            .ok_or_else(|| TesseraError::Internal(format!("page {} is not latched", page_id)))?;
        let result = self.log_latched(page_id, &mut guard, &record);
        self.pages.insert(page_id, guard);
        result
    }

    fn log_latched(
        &mut self,
        page_id: PageId,
        guard: &mut PageWriteGuard<'a>,
        record: &DeltaRecord,
    ) -> Result<Lsn> {
        if !self.before_images.contains_key(&page_id) {
            self.before_images
                .insert(page_id, guard.to_vec().into_boxed_slice());
        }
        let op_id = match self.op_id {
            Some(op_id) => op_id,
            None => {
                let op_id = self.store.wal().begin_operation()?;
                self.op_id = Some(op_id);
                op_id
            }
        };

        record.apply(page_id, &mut guard[..], &*self)?;
        let lsn = self.store.wal().append(record.to_wal(page_id, op_id))?;
        PageHeader::set_lsn(&mut guard[..], lsn.0);
        self.records += 1;
        Ok(lsn)
    }

    /// Frees a page once the operation has committed.
    pub fn free_after_commit(&mut self, page_id: PageId) {
        self.pending_free.push(page_id);
    }

    /// Makes the operation durable and releases its latches.
    ///
    /// Pages scheduled with [`Operation::free_after_commit`] are returned to
    /// the free list afterwards. A page another reader still pins is queued
    /// on the store and freed by a later checkpoint.
    pub fn commit(mut self) -> Result<()> {
        if let Some(op_id) = self.op_id {
            self.store.wal().commit_operation(op_id)?;
            debug!(op_id, records = self.records, "operation committed");
        }
        self.finished = true;
        self.pages.clear();
        self.before_images.clear();

        for page_id in std::mem::take(&mut self.pending_free) {
            if let Err(e) = self.store.free_or_defer(page_id) {
                warn!(page_id = %page_id, error = %e, "failed to free page after commit");
            }
        }
        Ok(())
    }

    /// Rolls the operation back.
    pub fn abort(mut self) {
        self.rollback();
    }

    fn rollback(&mut self) {
        self.finished = true;
        for (page_id, image) in self.before_images.drain() {
            if let Some(guard) = self.pages.get_mut(&page_id) {
                guard.copy_from_slice(&image);
            }
        }
        self.pending_free.clear();
        if let Some(op_id) = self.op_id {
            if let Err(e) = self.store.wal().abort_operation(op_id) {
                warn!(op_id, error = %e, "failed to log operation abort");
            }
            debug!(op_id, records = self.records, "operation rolled back");
        }
    }
}

impl Drop for Operation<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}

impl PageSource for Operation<'_> {
    fn read_page(&self, page_id: PageId, f: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        if let Some(guard) = self.pages.get(&page_id) {
            return f(guard);
        }
        let guard = self.store.try_read_until(page_id, self.deadline)?;
        f(&guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskManager, DiskManagerConfig};
    use crate::layout::TreePage;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tessera_buffer::{BufferPool, BufferPoolConfig};
    use tessera_common::{PageType, PAGE_FORMAT_VERSION};
    use tessera_wal::{RecordType, WalConfig, WalManager, WalRecord};

    const PAGE: usize = 1024;

    fn open_store(dir: &TempDir) -> PageStore {
        let wal = WalManager::open(WalConfig {
            wal_dir: dir.path().join("wal"),
            segment_size: 1 << 20,
            fsync_enabled: false,
        })
        .unwrap();
        let disk = DiskManager::new(DiskManagerConfig {
            data_dir: dir.path().to_path_buf(),
            page_size: PAGE,
            fsync_enabled: false,
        })
        .unwrap();
        let pool = BufferPool::new(BufferPoolConfig {
            num_frames: 32,
            page_size: PAGE,
        });
        PageStore::with_parts(disk, pool, Arc::new(wal), Duration::from_millis(100)).unwrap()
    }

    fn leaf(page_id: PageId, op: &mut Operation<'_>) {
        op.lock(page_id).unwrap();
        op.log(page_id, DeltaRecord::InitNewPage {
            page_type: PageType::BTreeLeaf,
            version: PAGE_FORMAT_VERSION,
            item_size: 8,
            capacity: 4,
        })
        .unwrap();
    }

    fn entry(key: u64) -> DeltaRecord {
        DeltaRecord::InsertEntry {
            index: 0,
            entry: Bytes::copy_from_slice(&key.to_be_bytes()),
        }
    }

    fn records(store: &PageStore) -> Vec<WalRecord> {
        store
            .wal()
            .iterate(Lsn::INVALID)
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_commit_logs_begin_records_commit() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.open_segment(1).unwrap();
        let page_id = store.allocate(1).unwrap();
        let before = store.wal().next_lsn();

        let mut op = Operation::begin(&store, store.deadline()).unwrap();
        leaf(page_id, &mut op);
        op.log(page_id, entry(7)).unwrap();
        let op_id = op.op_id().unwrap();
        assert_eq!(op.record_count(), 2);
        op.commit().unwrap();

        let tail: Vec<_> = records(&store)
            .into_iter()
            .filter(|r| r.lsn >= before)
            .collect();
        let types: Vec<_> = tail.iter().map(|r| r.record_type).collect();
        assert_eq!(
            types,
            vec![
                RecordType::OperationBegin,
                RecordType::InitNewPage,
                RecordType::InsertEntry,
                RecordType::OperationCommit,
            ]
        );
        assert_eq!(op_id, tail[0].lsn.0);
        assert!(tail[1..].iter().all(|r| r.op_id == op_id));
        assert!(store.wal().flushed_lsn() > tail[3].lsn);

        let page = store.read(page_id).unwrap();
        assert_eq!(TreePage::count(&page), 1);
        assert_eq!(PageHeader::lsn(&page), tail[2].lsn.0);
    }

    #[test]
    fn test_empty_operation_logs_nothing() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.open_segment(1).unwrap();
        let page_id = store.allocate(1).unwrap();
        let before = store.wal().next_lsn();

        let mut op = Operation::begin(&store, store.deadline()).unwrap();
        op.lock(page_id).unwrap();
        assert!(op.holds(page_id));
        op.commit().unwrap();
        assert_eq!(store.wal().next_lsn(), before);
    }

    #[test]
    fn test_drop_restores_pages_and_logs_abort() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.open_segment(1).unwrap();
        let page_id = store.allocate(1).unwrap();
        let original = store.read(page_id).unwrap().to_vec();

        {
            let mut op = Operation::begin(&store, store.deadline()).unwrap();
            leaf(page_id, &mut op);
            op.log(page_id, entry(1)).unwrap();
        }

        assert_eq!(&store.read(page_id).unwrap()[..], &original[..]);
        let last = records(&store).pop().unwrap();
        assert_eq!(last.record_type, RecordType::OperationAbort);
    }

    #[test]
    fn test_failed_record_keeps_operation_usable() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.open_segment(1).unwrap();
        let page_id = store.allocate(1).unwrap();

        let mut op = Operation::begin(&store, store.deadline()).unwrap();
        leaf(page_id, &mut op);
        let bad = DeltaRecord::RemoveEntries { index: 3, count: 1 };
        assert!(op.log(page_id, bad).is_err());
        assert!(op.holds(page_id));
        op.log(page_id, entry(5)).unwrap();
        op.commit().unwrap();
        assert_eq!(TreePage::count(&store.read(page_id).unwrap()), 1);
    }

    #[test]
    fn test_log_requires_latch() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.open_segment(1).unwrap();
        let page_id = store.allocate(1).unwrap();

        let mut op = Operation::begin(&store, store.deadline()).unwrap();
        assert!(matches!(
            op.log(page_id, entry(1)),
            Err(TesseraError::Internal(_))
        ));
        assert!(op.page(page_id).is_err());
    }

    #[test]
    fn test_lock_times_out() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.open_segment(1).unwrap();
        let page_id = store.allocate(1).unwrap();

        let _held = store.write(page_id).unwrap();
        let deadline = Instant::now() + Duration::from_millis(20);
        let mut op = Operation::begin(&store, deadline).unwrap();
        let err = op.lock(page_id).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_release_keeps_changed_pages() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.open_segment(1).unwrap();
        let a = store.allocate(1).unwrap();
        let b = store.allocate(1).unwrap();

        let mut op = Operation::begin(&store, store.deadline()).unwrap();
        leaf(a, &mut op);
        op.lock(b).unwrap();
        op.release(a);
        op.release(b);
        assert!(op.holds(a));
        assert!(!op.holds(b));
        op.commit().unwrap();
    }

    #[test]
    fn test_split_reads_latched_source() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.open_segment(1).unwrap();
        let left = store.allocate(1).unwrap();
        let right = store.allocate(1).unwrap();

        let mut op = Operation::begin(&store, store.deadline()).unwrap();
        leaf(left, &mut op);
        for key in [8u64, 5, 3, 1] {
            op.log(left, entry(key)).unwrap();
        }
        op.lock(right).unwrap();
        op.log(right, DeltaRecord::SplitForward {
            source_page: left.page_index,
            middle_index: 2,
        })
        .unwrap();
        op.log(left, DeltaRecord::Split {
            middle_index: 2,
            sibling_page: right.page_index,
        })
        .unwrap();
        op.commit().unwrap();

        let l = store.read(left).unwrap();
        let r = store.read(right).unwrap();
        assert_eq!(TreePage::count(&l), 2);
        assert_eq!(TreePage::count(&r), 2);
        assert_eq!(TreePage::forward(&l), right.page_index);
        assert_eq!(TreePage::item(&r, 0), &5u64.to_be_bytes()[..]);
    }

    #[test]
    fn test_free_after_commit() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.open_segment(1).unwrap();
        let page_id = store.allocate(1).unwrap();

        let mut op = Operation::begin(&store, store.deadline()).unwrap();
        leaf(page_id, &mut op);
        op.free_after_commit(page_id);
        op.commit().unwrap();

        assert_eq!(store.allocate(1).unwrap(), page_id);
    }
}
