//! Page store: buffer pool, segment files and WAL behind one page API.

use crate::delta::{DeltaRecord, PageSource};
use crate::disk::{DiskManager, DiskManagerConfig};
use crate::layout::{FreePage, MetaPage};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_buffer::{BufferFrame, BufferPool, BufferPoolConfig, PageReadGuard, PageWriteGuard};
use tessera_common::page::is_zeroed;
use tessera_common::{
    PageHeader, PageId, PageType, Result, StorageConfig, TesseraError, INVALID_PAGE_INDEX,
    PAGE_FORMAT_VERSION,
};
use tessera_wal::{Lsn, WalManager, AUTONOMOUS_OP};
use tracing::{debug, info, warn};

/// Maps page ids to cached page buffers backed by segment files.
///
/// Pages are read and written through scoped guards from the buffer pool.
/// Every change that must survive a crash goes through [`PageStore::log_change`]
/// or an [`Operation`](crate::Operation), which apply a [`DeltaRecord`] and
/// append it to the WAL while the page is latched.
///
/// The pool never evicts dirty pages, so segment files only change during a
/// checkpoint. A checkpoint holds the checkpoint latch exclusively while
/// operations and allocations hold it shared, so the files always contain
/// the image of one checkpoint.
pub struct PageStore {
    disk: DiskManager,
    pool: BufferPool,
    wal: Arc<WalManager>,
    lock_timeout: Duration,
    checkpoint_latch: RwLock<()>,
    /// Pages whose free was refused while another handle pinned them.
    deferred_frees: Mutex<Vec<PageId>>,
}

impl PageStore {
    /// Opens a page store over the directories named in `config`.
    pub fn open(config: &StorageConfig, wal: Arc<WalManager>) -> Result<Self> {
        config.validate()?;
        let disk = DiskManager::new(DiskManagerConfig::from_storage(config))?;
        let pool = BufferPool::new(BufferPoolConfig::from_storage(config));
        Self::with_parts(disk, pool, wal, config.lock_timeout())
    }

    /// Assembles a page store from its parts.
    pub fn with_parts(
        disk: DiskManager,
        pool: BufferPool,
        wal: Arc<WalManager>,
        lock_timeout: Duration,
    ) -> Result<Self> {
        if disk.page_size() != pool.page_size() {
            return Err(TesseraError::InvalidConfig(format!(
                "disk page size {} does not match buffer pool page size {}",
                disk.page_size(),
                pool.page_size()
            )));
        }
        Ok(Self {
            disk,
            pool,
            wal,
            lock_timeout,
            checkpoint_latch: RwLock::new(()),
            deferred_frees: Mutex::new(Vec::new()),
        })
    }

    /// Returns the WAL.
    pub fn wal(&self) -> &Arc<WalManager> {
        &self.wal
    }

    /// Returns the buffer pool.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Returns the disk manager.
    pub fn disk(&self) -> &DiskManager {
        &self.disk
    }

    /// Returns the page size.
    pub fn page_size(&self) -> usize {
        self.pool.page_size()
    }

    /// Returns the bounded wait for page locks.
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Returns a lock deadline starting now.
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.lock_timeout
    }

    /// Holds off checkpoints until the guard is dropped.
    ///
    /// Recursive so that work already holding the latch can allocate and
    /// free pages while a checkpoint is waiting.
    pub(crate) fn operation_latch(&self, deadline: Instant) -> Result<RwLockReadGuard<'_, ()>> {
        self.checkpoint_latch
            .try_read_recursive_until(deadline)
            .ok_or_else(|| TesseraError::aborted("timed out waiting for a checkpoint to finish"))
    }

    /// Pins a page, loading it from its segment file if it is not resident.
    fn fetch(&self, page_id: PageId) -> Result<&BufferFrame> {
        if let Some(frame) = self.pool.fetch_page(page_id) {
            return Ok(frame);
        }
        let mut buf = vec![0u8; self.page_size()];
        self.disk.read_page(page_id, &mut buf)?;
        PageHeader::verify(&buf, page_id)?;
        self.pool.load_page(page_id, &buf)
    }

    /// Returns a read guard, blocking while a writer holds the page.
    pub fn read(&self, page_id: PageId) -> Result<PageReadGuard<'_>> {
        let frame = self.fetch(page_id)?;
        self.pool.read_guard(frame, None)
    }

    /// Returns a write guard, blocking while the page is latched.
    ///
    /// Changes made through the guard are not logged; use
    /// [`PageStore::log_change`] for changes that must survive a crash.
    pub fn write(&self, page_id: PageId) -> Result<PageWriteGuard<'_>> {
        let frame = self.fetch(page_id)?;
        self.pool.write_guard(frame, None)
    }

    /// Returns a read guard, failing with `OperationAborted` at `deadline`.
    pub fn try_read_until(&self, page_id: PageId, deadline: Instant) -> Result<PageReadGuard<'_>> {
        let frame = self.fetch(page_id)?;
        self.pool.read_guard(frame, Some(deadline))
    }

    /// Returns a write guard, failing with `OperationAborted` at `deadline`.
    pub fn try_write_until(
        &self,
        page_id: PageId,
        deadline: Instant,
    ) -> Result<PageWriteGuard<'_>> {
        let frame = self.fetch(page_id)?;
        self.pool.write_guard(frame, Some(deadline))
    }

    /// Returns a write guard for replay.
    ///
    /// When the record about to be replayed rewrites the whole page, an
    /// unreadable stored image (torn write) is replaced by zeros instead of
    /// failing.
    pub(crate) fn write_for_redo(
        &self,
        page_id: PageId,
        overwrite: bool,
    ) -> Result<PageWriteGuard<'_>> {
        let frame = match self.fetch(page_id) {
            Ok(frame) => frame,
            Err(TesseraError::CorruptPage { reason, .. }) if overwrite => {
                warn!(page_id = %page_id, reason = %reason, "replacing unreadable page image");
                self.pool.load_page(page_id, &vec![0u8; self.page_size()])?
            }
            Err(e) => return Err(e),
        };
        self.pool.write_guard(frame, None)
    }

    /// Applies `record` to a latched page and logs it outside any operation.
    ///
    /// Autonomous records are always replayed. If the append fails the page
    /// is restored before the error is returned.
    pub fn log_change(&self, page: &mut PageWriteGuard<'_>, record: &DeltaRecord) -> Result<Lsn> {
        let page_id = page.page_id();
        let before = page.to_vec();
        record.apply(page_id, &mut page[..], self)?;
        match self.wal.append(record.to_wal(page_id, AUTONOMOUS_OP)) {
            Ok(lsn) => {
                PageHeader::set_lsn(&mut page[..], lsn.0);
                Ok(lsn)
            }
            Err(e) => {
                page.copy_from_slice(&before);
                Err(e)
            }
        }
    }

    /// Formats the meta page of a segment if the segment is new.
    ///
    /// Returns true if the segment was created.
    pub fn open_segment(&self, segment_id: u32) -> Result<bool> {
        let deadline = self.deadline();
        let _latch = self.operation_latch(deadline)?;
        let meta_id = PageId::meta(segment_id);
        let mut meta = self.try_write_until(meta_id, deadline)?;

        if MetaPage::is_formatted(&meta) {
            return Ok(false);
        }
        if !is_zeroed(&meta) {
            return Err(TesseraError::corrupt(
                meta_id,
                format!("type tag {} is not a meta page", PageHeader::type_tag(&meta)),
            ));
        }

        let mut image = vec![0u8; self.page_size()];
        MetaPage::format(&mut image, segment_id);
        self.log_change(&mut meta, &DeltaRecord::PageSnapshot {
            image: Bytes::from(image),
        })?;
        self.wal.flush()?;
        info!(segment = segment_id, "created segment");
        Ok(true)
    }

    /// Reserves a page in a segment.
    ///
    /// Pops the free list when it is not empty and extends the segment
    /// otherwise. The page comes back formatted as an unformatted page with
    /// a zero body.
    pub fn allocate(&self, segment_id: u32) -> Result<PageId> {
        let deadline = self.deadline();
        let _latch = self.operation_latch(deadline)?;
        let meta_id = PageId::meta(segment_id);
        let mut meta = self.try_write_until(meta_id, deadline)?;
        if !MetaPage::is_formatted(&meta) {
            return Err(TesseraError::PageNotFound { page_id: meta_id });
        }

        let free_head = MetaPage::free_head(&meta);
        let next_page = MetaPage::next_page(&meta);
        if free_head == INVALID_PAGE_INDEX {
            let page_id = meta_id.sibling(next_page);
            self.log_change(&mut meta, &DeltaRecord::SetFreeList {
                free_head: INVALID_PAGE_INDEX,
                next_page: next_page + 1,
            })?;
            debug!(page_id = %page_id, "extended segment");
            return Ok(page_id);
        }

        let page_id = meta_id.sibling(free_head);
        let mut page = self.try_write_until(page_id, deadline)?;
        FreePage::check(&page, page_id)?;
        let next_free = FreePage::next_free(&page);
        self.log_change(&mut meta, &DeltaRecord::SetFreeList {
            free_head: next_free,
            next_page,
        })?;
        self.log_change(&mut page, &DeltaRecord::InitNewPage {
            page_type: PageType::Unformatted,
            version: PAGE_FORMAT_VERSION,
            item_size: 0,
            capacity: 0,
        })?;
        debug!(page_id = %page_id, "reused free page");
        Ok(page_id)
    }

    /// Returns a page to its segment's free list.
    ///
    /// Fails with `PageInUse` if any other handle to the page is outstanding.
    pub fn free(&self, page_id: PageId) -> Result<()> {
        if page_id.is_meta() {
            return Err(TesseraError::Internal(format!(
                "meta page {} cannot be freed",
                page_id
            )));
        }
        let deadline = self.deadline();
        let _latch = self.operation_latch(deadline)?;

        let frame = self.fetch(page_id)?;
        if frame.pin_count() > 1 {
            self.pool.unpin(frame);
            return Err(TesseraError::PageInUse { page_id });
        }
        let mut page = self.pool.write_guard(frame, Some(deadline))?;
        if PageHeader::type_tag(&page) == PageType::FreeList as u8 {
            return Err(TesseraError::Internal(format!("page {} is already free", page_id)));
        }

        let meta_id = PageId::meta(page_id.segment_id);
        let mut meta = self.try_write_until(meta_id, deadline)?;
        if !MetaPage::is_formatted(&meta) || page_id.page_index >= MetaPage::next_page(&meta) {
            return Err(TesseraError::PageNotFound { page_id });
        }

        let free_head = MetaPage::free_head(&meta);
        let next_page = MetaPage::next_page(&meta);
        self.log_change(&mut page, &DeltaRecord::FreePage {
            next_free: free_head,
        })?;
        self.log_change(&mut meta, &DeltaRecord::SetFreeList {
            free_head: page_id.page_index,
            next_page,
        })?;
        debug!(page_id = %page_id, "freed page");
        Ok(())
    }

    /// Frees a page, or queues the free while another handle pins the page.
    ///
    /// Queued pages are retried by [`PageStore::retry_deferred_frees`],
    /// which every checkpoint runs before taking the checkpoint latch.
    pub fn free_or_defer(&self, page_id: PageId) -> Result<()> {
        match self.free(page_id) {
            Err(e) if e.is_retryable() => {
                debug!(page_id = %page_id, error = %e, "deferring page free");
                self.deferred_frees.lock().push(page_id);
                Ok(())
            }
            other => other,
        }
    }

    /// Returns the pages waiting for a deferred free.
    pub fn deferred_frees(&self) -> Vec<PageId> {
        self.deferred_frees.lock().clone()
    }

    /// Retries queued frees and returns how many pages were freed.
    ///
    /// Pages still pinned stay queued. Other failures drop the page from the
    /// queue; it remains allocated until the segment is rebuilt.
    pub fn retry_deferred_frees(&self) -> usize {
        let pending = std::mem::take(&mut *self.deferred_frees.lock());
        let mut freed = 0;
        for page_id in pending {
            match self.free(page_id) {
                Ok(()) => freed += 1,
                Err(e) if e.is_retryable() => self.deferred_frees.lock().push(page_id),
                Err(e) => warn!(page_id = %page_id, error = %e, "dropping deferred free"),
            }
        }
        if freed > 0 {
            debug!(pages = freed, "completed deferred frees");
        }
        freed
    }

    /// Makes the current contents of one page durable.
    ///
    /// The image goes to the WAL as a full-page snapshot and is forced; the
    /// segment file itself is only rewritten by the next checkpoint. Returns
    /// false if the page is not resident or not dirty.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let deadline = self.deadline();
        let _latch = self.operation_latch(deadline)?;
        let Some(frame) = self.pool.fetch_page(page_id) else {
            return Ok(false);
        };
        let mut page = self.pool.write_guard(frame, Some(deadline))?;
        if !page.is_dirty() {
            return Ok(false);
        }
        let snapshot = DeltaRecord::PageSnapshot {
            image: Bytes::copy_from_slice(&page),
        };
        let lsn = self.log_change(&mut page, &snapshot)?;
        self.wal.flush_to(lsn)?;
        Ok(true)
    }

    /// Writes every dirty page to its segment file.
    ///
    /// Runs a full checkpoint so that the segment files keep matching a
    /// checkpoint image. Returns the number of pages written.
    pub fn flush_all(&self) -> Result<usize> {
        let (_, _, pages_written) = self.write_checkpoint()?;
        Ok(pages_written)
    }

    /// Writes a sharp checkpoint and returns `(checkpoint_lsn, redo_lsn,
    /// pages_written)`.
    ///
    /// With the checkpoint latch held exclusively no operation is in flight.
    /// Every dirty page is logged as a snapshot before the checkpoint marker,
    /// so a crash while the pages are being written is repaired by replaying
    /// from the marker's redo LSN.
    pub(crate) fn write_checkpoint(&self) -> Result<(Lsn, Lsn, usize)> {
        self.retry_deferred_frees();
        let _latch = self.checkpoint_latch.write();
        let redo_lsn = self.wal.next_lsn();

        let dirty = self.pool.dirty_pages();
        for page_id in &dirty {
            let Some(mut page) = self.pool.write_page(*page_id) else {
                continue;
            };
            let record = DeltaRecord::PageSnapshot {
                image: Bytes::copy_from_slice(&page),
            };
            let lsn = self.wal.append(record.to_wal(*page_id, AUTONOMOUS_OP))?;
            PageHeader::set_lsn(&mut page[..], lsn.0);
        }

        let checkpoint_lsn = self.wal.log_checkpoint(redo_lsn)?;
        let pages_written = self
            .pool
            .flush_all(|page_id, data| self.write_back(page_id, data))?;
        self.disk.flush()?;
        debug!(pages = pages_written, redo_lsn = %redo_lsn, "wrote checkpoint pages");
        Ok((checkpoint_lsn, redo_lsn, pages_written))
    }

    /// Writes one page image to its segment file, forcing the WAL first.
    fn write_back(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        self.wal.flush_to(Lsn(PageHeader::lsn(data)))?;
        let mut image = data.to_vec();
        PageHeader::stamp_checksum(&mut image);
        self.disk.write_page(page_id, &image)
    }
}

impl PageSource for PageStore {
    fn read_page(&self, page_id: PageId, f: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        let page = self.read(page_id)?;
        f(&page)
    }
}
