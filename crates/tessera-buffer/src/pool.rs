//! Buffer pool manager.

use crate::frame::{BufferFrame, FrameId, PageRef};
use crate::replacer::{ClockReplacer, Replacer};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::time::Instant;
use sysinfo::System;
use tessera_common::{PageId, Result, StorageConfig, TesseraError, DEFAULT_PAGE_SIZE};
use tracing::trace;

/// Lower bound on the frame count picked by [`BufferPool::auto_sized`].
pub const MIN_AUTO_FRAMES: usize = 1_000;

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
    /// Size of every frame in bytes.
    pub page_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            num_frames: 1024,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl BufferPoolConfig {
    /// Derives the pool configuration from the storage configuration.
    pub fn from_storage(config: &StorageConfig) -> Self {
        Self {
            num_frames: config.buffer_pool_pages,
            page_size: config.page_size,
        }
    }
}

/// Buffer pool manager.
///
/// Manages a fixed arena of page frames with:
/// - Page ID to frame ID mapping
/// - Free frame list for new pages
/// - Clock replacement for eviction
/// - Pin counting for concurrent access
///
/// Frames are pinned only while the page table read lock is held, and the
/// evictor only inspects pin counts under the write lock, so a pinned frame
/// is never reassigned. Dirty frames are never evicted: their bytes reach
/// storage only through `flush_page` / `flush_all`.
pub struct BufferPool {
    /// Configuration.
    config: BufferPoolConfig,
    /// Arena of buffer frames.
    frames: Vec<BufferFrame>,
    /// Page ID to frame ID mapping.
    page_table: RwLock<HashMap<PageId, FrameId>>,
    /// List of free frame IDs.
    free_list: Mutex<Vec<FrameId>>,
    /// Page replacement policy.
    replacer: ClockReplacer,
}

impl BufferPool {
    /// Creates a new buffer pool.
    pub fn new(config: BufferPoolConfig) -> Self {
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32), config.page_size))
            .collect();

        // Pop order hands out frame 0 first.
        let free_list: Vec<_> = (0..num_frames).rev().map(|i| FrameId(i as u32)).collect();

        Self {
            config,
            frames,
            page_table: RwLock::new(HashMap::with_capacity(num_frames)),
            free_list: Mutex::new(free_list),
            replacer: ClockReplacer::new(num_frames),
        }
    }

    /// Creates a buffer pool sized to 25% of available system RAM.
    ///
    /// Minimum 1,000 frames to ensure useful caching even on low-memory
    /// systems.
    pub fn auto_sized(page_size: usize) -> Self {
        Self::new(BufferPoolConfig {
            num_frames: Self::auto_frame_count(page_size),
            page_size,
        })
    }

    /// Returns the frame count [`BufferPool::auto_sized`] would use.
    pub fn auto_frame_count(page_size: usize) -> usize {
        let mut sys = System::new();
        sys.refresh_memory();
        frames_for_memory(sys.available_memory(), page_size)
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the page size of every frame.
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns the number of pages currently in the pool.
    pub fn page_count(&self) -> usize {
        self.page_table.read().len()
    }

    /// Checks if a page is in the buffer pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.read().contains_key(&page_id)
    }

    #[inline]
    fn frame(&self, frame_id: FrameId) -> &BufferFrame {
        &self.frames[frame_id.0 as usize]
    }

    #[inline]
    fn pin_frame(&self, frame: &BufferFrame) {
        if frame.pin() == 0 {
            self.replacer.set_evictable(frame.frame_id(), false);
        }
        self.replacer.record_access(frame.frame_id());
    }

    /// Fetches a resident page, pinning it.
    ///
    /// Returns None if the page is not in the pool.
    pub fn fetch_page(&self, page_id: PageId) -> Option<&BufferFrame> {
        let table = self.page_table.read();
        let frame = self.frame(*table.get(&page_id)?);
        self.pin_frame(frame);
        Some(frame)
    }

    /// Pins the page behind a handle if the handle is still current.
    pub fn pin_ref(&self, page_ref: PageRef) -> Option<&BufferFrame> {
        let _table = self.page_table.read();
        let frame = self.frames.get(page_ref.frame_id.0 as usize)?;
        if frame.is_empty() || frame.generation() != page_ref.generation {
            return None;
        }
        self.pin_frame(frame);
        Some(frame)
    }

    /// Takes a frame from the free list or evicts a clean, unpinned page.
    ///
    /// Must be called with the page table write lock held.
    fn allocate_frame(&self, table: &mut HashMap<PageId, FrameId>) -> Result<FrameId> {
        if let Some(frame_id) = self.free_list.lock().pop() {
            return Ok(frame_id);
        }

        let victim = self.replacer.evict(&|fid| {
            let frame = self.frame(fid);
            !frame.is_pinned() && !frame.is_dirty()
        });
        let victim = victim.ok_or(TesseraError::BufferPoolFull)?;

        let frame = self.frame(victim);
        if let Some(old_page_id) = frame.page_id() {
            table.remove(&old_page_id);
            trace!(page_id = %old_page_id, frame = %victim, "evicted clean page");
        }
        Ok(victim)
    }

    /// Installs a page, pinning it. If the page is already resident the
    /// existing frame is pinned and `init` is not called.
    fn install(&self, page_id: PageId, init: impl FnOnce(&mut [u8])) -> Result<&BufferFrame> {
        let mut table = self.page_table.write();
        if let Some(&frame_id) = table.get(&page_id) {
            let frame = self.frame(frame_id);
            self.pin_frame(frame);
            return Ok(frame);
        }

        let frame_id = self.allocate_frame(&mut table)?;
        let frame = self.frame(frame_id);
        frame.reset();
        init(&mut frame.write_data());
        frame.assign(page_id);
        self.pin_frame(frame);
        table.insert(page_id, frame_id);
        Ok(frame)
    }

    /// Inserts a zeroed page into the pool, pinning it.
    ///
    /// If the page already exists, returns the existing frame.
    pub fn new_page(&self, page_id: PageId) -> Result<&BufferFrame> {
        self.install(page_id, |_| {})
    }

    /// Loads page data read from storage into the pool, pinning it.
    ///
    /// If another thread loaded the page first, its frame wins and `data`
    /// is discarded.
    pub fn load_page(&self, page_id: PageId, data: &[u8]) -> Result<&BufferFrame> {
        self.install(page_id, |buf| {
            let len = data.len().min(buf.len());
            buf[..len].copy_from_slice(&data[..len]);
        })
    }

    /// Releases one pin. At zero pins the frame becomes an eviction candidate.
    pub fn unpin(&self, frame: &BufferFrame) {
        if frame.unpin() == 0 {
            self.replacer.set_evictable(frame.frame_id(), true);
        }
    }

    /// Latches a pinned frame for reading. The guard takes over the pin.
    ///
    /// With a deadline, gives up with `OperationAborted` once it passes and
    /// releases the pin.
    pub fn read_guard<'a>(
        &'a self,
        frame: &'a BufferFrame,
        deadline: Option<Instant>,
    ) -> Result<PageReadGuard<'a>> {
        let page_id = frame.page_id().ok_or_else(|| {
            TesseraError::Internal(format!("{} holds no page", frame.frame_id()))
        })?;
        let data = match deadline {
            Some(deadline) => frame.try_read_until(deadline),
            None => Some(frame.read_data()),
        };
        let Some(data) = data else {
            self.unpin(frame);
            return Err(TesseraError::aborted(format!(
                "timed out waiting for read lock on page {}",
                page_id
            )));
        };
        Ok(PageReadGuard {
            pool: self,
            frame,
            page_id,
            data: Some(data),
        })
    }

    /// Latches a pinned frame for writing. The guard takes over the pin.
    pub fn write_guard<'a>(
        &'a self,
        frame: &'a BufferFrame,
        deadline: Option<Instant>,
    ) -> Result<PageWriteGuard<'a>> {
        let page_id = frame.page_id().ok_or_else(|| {
            TesseraError::Internal(format!("{} holds no page", frame.frame_id()))
        })?;
        let data = match deadline {
            Some(deadline) => frame.try_write_until(deadline),
            None => Some(frame.write_data()),
        };
        let Some(data) = data else {
            self.unpin(frame);
            return Err(TesseraError::aborted(format!(
                "timed out waiting for write lock on page {}",
                page_id
            )));
        };
        Ok(PageWriteGuard {
            pool: self,
            frame,
            page_id,
            data: Some(data),
        })
    }

    /// Returns a read guard for a resident page, blocking on the latch.
    pub fn read_page(&self, page_id: PageId) -> Option<PageReadGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        self.read_guard(frame, None).ok()
    }

    /// Returns a write guard for a resident page, blocking on the latch.
    pub fn write_page(&self, page_id: PageId) -> Option<PageWriteGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        self.write_guard(frame, None).ok()
    }

    /// Returns the ids of resident dirty pages.
    pub fn dirty_pages(&self) -> Vec<PageId> {
        let table = self.page_table.read();
        let mut dirty: Vec<_> = table
            .iter()
            .filter(|(_, fid)| self.frame(**fid).is_dirty())
            .map(|(pid, _)| *pid)
            .collect();
        dirty.sort();
        dirty
    }

    /// Hands a dirty page to `flush_fn` under its read latch, then marks it
    /// clean. Returns true if the page was flushed.
    pub fn flush_page<F>(&self, page_id: PageId, mut flush_fn: F) -> Result<bool>
    where
        F: FnMut(PageId, &[u8]) -> Result<()>,
    {
        let Some(guard) = self.read_page(page_id) else {
            return Ok(false);
        };
        if !guard.frame.is_dirty() {
            return Ok(false);
        }
        flush_fn(page_id, &guard)?;
        guard.frame.set_dirty(false);
        Ok(true)
    }

    /// Flushes all dirty pages in page id order.
    ///
    /// Returns the number of pages flushed. Stops at the first error.
    pub fn flush_all<F>(&self, mut flush_fn: F) -> Result<usize>
    where
        F: FnMut(PageId, &[u8]) -> Result<()>,
    {
        let mut flushed = 0;
        for page_id in self.dirty_pages() {
            if self.flush_page(page_id, &mut flush_fn)? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let table = self.page_table.read();
        let mut pinned_frames = 0;
        let mut dirty_frames = 0;
        for frame_id in table.values() {
            let frame = self.frame(*frame_id);
            if frame.is_pinned() {
                pinned_frames += 1;
            }
            if frame.is_dirty() {
                dirty_frames += 1;
            }
        }

        BufferPoolStats {
            total_frames: self.config.num_frames,
            free_frames: self.free_count(),
            used_frames: table.len(),
            pinned_frames,
            dirty_frames,
        }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}

/// Scoped shared latch on a page. Dropping it releases the latch and the pin
/// on every exit path.
pub struct PageReadGuard<'a> {
    pool: &'a BufferPool,
    frame: &'a BufferFrame,
    page_id: PageId,
    data: Option<RwLockReadGuard<'a, Box<[u8]>>>,
}

impl<'a> PageReadGuard<'a> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns a handle to the page.
    pub fn page_ref(&self) -> PageRef {
        self.frame.page_ref()
    }
}

impl Deref for PageReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.data {
            Some(data) => &data[..],
            None => &[],
        }
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        self.data.take();
        self.pool.unpin(self.frame);
    }
}

/// Scoped exclusive latch on a page. Mutable access marks the page dirty.
pub struct PageWriteGuard<'a> {
    pool: &'a BufferPool,
    frame: &'a BufferFrame,
    page_id: PageId,
    data: Option<RwLockWriteGuard<'a, Box<[u8]>>>,
}

impl<'a> PageWriteGuard<'a> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns a handle to the page.
    pub fn page_ref(&self) -> PageRef {
        self.frame.page_ref()
    }

    /// Returns true if the page has unflushed changes.
    pub fn is_dirty(&self) -> bool {
        self.frame.is_dirty()
    }
}

impl Deref for PageWriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.data {
            Some(data) => &data[..],
            None => &[],
        }
    }
}

impl DerefMut for PageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.frame.set_dirty(true);
        match &mut self.data {
            Some(data) => &mut data[..],
            None => &mut [],
        }
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        self.data.take();
        self.pool.unpin(self.frame);
    }
}

/// Frames for a quarter of `available_bytes`, never fewer than
/// [`MIN_AUTO_FRAMES`].
fn frames_for_memory(available_bytes: u64, page_size: usize) -> usize {
    let target_bytes = usize::try_from(available_bytes / 4).unwrap_or(usize::MAX);
    (target_bytes / page_size.max(1)).max(MIN_AUTO_FRAMES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn create_test_pool(num_frames: usize) -> BufferPool {
        BufferPool::new(BufferPoolConfig {
            num_frames,
            page_size: 1024,
        })
    }

    #[test]
    fn test_buffer_pool_new() {
        let pool = create_test_pool(10);

        assert_eq!(pool.num_frames(), 10);
        assert_eq!(pool.page_size(), 1024);
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn test_buffer_pool_new_page() {
        let pool = create_test_pool(10);
        let page_id = PageId::new(0, 1);

        let frame = pool.new_page(page_id).unwrap();

        assert_eq!(frame.page_id(), Some(page_id));
        assert!(frame.is_pinned());
        assert_eq!(pool.free_count(), 9);
        assert!(pool.contains(page_id));
    }

    #[test]
    fn test_buffer_pool_fetch_existing() {
        let pool = create_test_pool(10);
        let page_id = PageId::new(0, 1);

        let frame = pool.new_page(page_id).unwrap();
        pool.unpin(frame);

        let frame = pool.fetch_page(page_id).unwrap();
        assert_eq!(frame.page_id(), Some(page_id));
        assert_eq!(frame.pin_count(), 1);
        assert!(pool.fetch_page(PageId::new(0, 2)).is_none());
    }

    #[test]
    fn test_buffer_pool_load_page() {
        let pool = create_test_pool(10);
        let page_id = PageId::new(0, 1);

        let frame = pool.load_page(page_id, &[0xABu8; 1024]).unwrap();
        assert_eq!(frame.read_data()[100], 0xAB);

        // Second load of a resident page keeps the resident bytes.
        let again = pool.load_page(page_id, &[0x11u8; 1024]).unwrap();
        assert_eq!(again.frame_id(), frame.frame_id());
        assert_eq!(again.read_data()[100], 0xAB);
        assert_eq!(pool.page_count(), 1);
    }

    #[test]
    fn test_buffer_pool_evicts_clean_pages() {
        let pool = create_test_pool(3);

        for i in 0..3 {
            let frame = pool.new_page(PageId::new(0, i)).unwrap();
            pool.unpin(frame);
        }
        assert_eq!(pool.free_count(), 0);

        let new_page_id = PageId::new(0, 99);
        pool.new_page(new_page_id).unwrap();
        assert_eq!(pool.page_count(), 3);
        assert!(pool.contains(new_page_id));
    }

    #[test]
    fn test_buffer_pool_never_evicts_dirty_pages() {
        let pool = create_test_pool(1);
        let page_id = PageId::new(0, 1);

        assert!(pool.write_page(page_id).is_none());
        {
            let frame = pool.new_page(page_id).unwrap();
            let mut guard = pool.write_guard(frame, None).unwrap();
            guard[0] = 0xAB;
        }

        let result = pool.new_page(PageId::new(0, 2));
        assert!(matches!(result, Err(TesseraError::BufferPoolFull)));

        pool.flush_page(page_id, |_, _| Ok(())).unwrap();
        assert!(pool.new_page(PageId::new(0, 2)).is_ok());
        assert!(!pool.contains(page_id));
    }

    #[test]
    fn test_buffer_pool_full_all_pinned() {
        let pool = create_test_pool(2);

        pool.new_page(PageId::new(0, 1)).unwrap();
        pool.new_page(PageId::new(0, 2)).unwrap();

        let result = pool.new_page(PageId::new(0, 3));
        assert!(matches!(result, Err(TesseraError::BufferPoolFull)));
    }

    #[test]
    fn test_page_ref_goes_stale_after_eviction() {
        let pool = create_test_pool(1);
        let frame = pool.new_page(PageId::new(0, 1)).unwrap();
        let page_ref = frame.page_ref();
        pool.unpin(frame);

        let pinned = pool.pin_ref(page_ref).unwrap();
        assert_eq!(pinned.page_id(), Some(PageId::new(0, 1)));
        pool.unpin(pinned);

        let other = pool.new_page(PageId::new(0, 2)).unwrap();
        assert_eq!(other.frame_id(), page_ref.frame_id);
        assert!(pool.pin_ref(page_ref).is_none());
    }

    #[test]
    fn test_guards_release_pin() {
        let pool = create_test_pool(10);
        let page_id = PageId::new(0, 1);
        let frame = pool.new_page(page_id).unwrap();
        pool.unpin(frame);

        {
            let guard = pool.read_page(page_id).unwrap();
            assert_eq!(guard.page_id(), page_id);
            assert_eq!(guard.len(), 1024);
            assert_eq!(frame.pin_count(), 1);
        }
        assert_eq!(frame.pin_count(), 0);

        {
            let mut guard = pool.write_page(page_id).unwrap();
            assert!(!guard.is_dirty());
            guard[0] = 0xFF;
            assert!(guard.is_dirty());
        }
        assert_eq!(frame.pin_count(), 0);
        assert_eq!(pool.read_page(page_id).unwrap()[0], 0xFF);
        assert_eq!(pool.dirty_pages(), vec![page_id]);
    }

    #[test]
    fn test_write_guard_deadline() {
        let pool = Arc::new(create_test_pool(4));
        let page_id = PageId::new(0, 1);
        let frame = pool.new_page(page_id).unwrap();
        let _held = pool.write_guard(frame, None).unwrap();

        let frame = pool.fetch_page(page_id).unwrap();
        let deadline = Instant::now() + Duration::from_millis(20);
        let err = pool.write_guard(frame, Some(deadline)).err().unwrap();
        assert!(err.is_retryable());
        // The failed attempt gave its pin back.
        assert_eq!(frame.pin_count(), 1);
    }

    #[test]
    fn test_buffer_pool_flush_all() {
        let pool = create_test_pool(10);

        for i in 0..5 {
            let mut guard = pool
                .write_guard(pool.new_page(PageId::new(0, i)).unwrap(), None)
                .unwrap();
            guard[0] = i as u8;
        }

        let mut flushed = Vec::new();
        let count = pool
            .flush_all(|pid, data| {
                flushed.push((pid, data[0]));
                Ok(())
            })
            .unwrap();

        assert_eq!(count, 5);
        assert_eq!(flushed[4], (PageId::new(0, 4), 4));
        assert!(pool.dirty_pages().is_empty());
        assert_eq!(pool.flush_all(|_, _| Ok(())).unwrap(), 0);
    }

    #[test]
    fn test_frames_for_memory() {
        // A quarter of 64 MiB in 4 KiB pages.
        assert_eq!(frames_for_memory(64 << 20, 4096), 4096);
        assert_eq!(frames_for_memory(0, 4096), MIN_AUTO_FRAMES);
        assert_eq!(frames_for_memory(1 << 20, 4096), MIN_AUTO_FRAMES);
        assert!(frames_for_memory(u64::MAX, 4096) > MIN_AUTO_FRAMES);
    }

    #[test]
    fn test_auto_frame_count_within_bounds() {
        let mut sys = System::new();
        sys.refresh_memory();
        let ceiling = (sys.total_memory() / 4096) as usize;

        let frames = BufferPool::auto_frame_count(4096);
        assert!(frames >= MIN_AUTO_FRAMES);
        assert!(frames <= ceiling.max(MIN_AUTO_FRAMES));
    }

    #[test]
    fn test_buffer_pool_stats() {
        let pool = create_test_pool(10);

        for i in 0..5 {
            let frame = pool.new_page(PageId::new(0, i)).unwrap();
            if i % 2 == 0 {
                let mut guard = pool.write_guard(frame, None).unwrap();
                guard[0] = 1;
            }
            // Odd pages remain pinned
        }

        let stats = pool.stats();
        assert_eq!(stats.total_frames, 10);
        assert_eq!(stats.free_frames, 5);
        assert_eq!(stats.used_frames, 5);
        assert_eq!(stats.pinned_frames, 2);
        assert_eq!(stats.dirty_frames, 3);
    }
}
