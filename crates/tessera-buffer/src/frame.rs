//! Buffer frame management.

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;
use tessera_common::PageId;

/// Unique identifier for a frame in the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

impl FrameId {
    /// Invalid frame ID.
    pub const INVALID: FrameId = FrameId(u32::MAX);

    /// Returns true if this is a valid frame ID.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// Lightweight handle to a resident page: frame index plus the frame's
/// generation when the handle was taken.
///
/// A handle never keeps a page resident. Once the frame is reassigned to
/// another page its generation changes and the handle stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRef {
    /// Frame holding the page.
    pub frame_id: FrameId,
    /// Frame generation at the time the handle was taken.
    pub generation: u64,
}

/// A frame in the buffer pool holding a single page.
///
/// The page bytes sit behind a reader-writer lock that doubles as the page
/// latch. Pin count, dirty flag and generation are atomics so they can be
/// inspected without taking the latch.
pub struct BufferFrame {
    /// Frame identifier.
    frame_id: FrameId,
    /// The page currently stored in this frame.
    page_id: Mutex<Option<PageId>>,
    /// Page data buffer.
    data: RwLock<Box<[u8]>>,
    /// Number of users currently holding this page.
    pin_count: AtomicU32,
    /// Whether the page differs from its durable copy.
    is_dirty: AtomicBool,
    /// Bumped each time the frame is assigned to a page.
    generation: AtomicU64,
}

impl BufferFrame {
    /// Creates a new empty buffer frame.
    pub fn new(frame_id: FrameId, page_size: usize) -> Self {
        Self {
            frame_id,
            page_id: Mutex::new(None),
            data: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// Returns the frame ID.
    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the page ID currently stored in this frame.
    #[inline]
    pub fn page_id(&self) -> Option<PageId> {
        *self.page_id.lock()
    }

    /// Returns the current generation.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns a handle to the page in this frame.
    #[inline]
    pub fn page_ref(&self) -> PageRef {
        PageRef {
            frame_id: self.frame_id,
            generation: self.generation(),
        }
    }

    /// Assigns the frame to a page, bumping its generation.
    pub(crate) fn assign(&self, page_id: PageId) {
        *self.page_id.lock() = Some(page_id);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the previous pin count.
    #[inline]
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the pin count and returns the new pin count.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let result = self
            .pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match result {
            Ok(prev) => prev - 1,
            Err(_) => 0,
        }
    }

    /// Returns true if this frame is pinned.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Returns true if this frame is dirty.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    /// Sets the dirty flag.
    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Returns true if this frame is empty (no page loaded).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.page_id.lock().is_none()
    }

    /// Returns the size of the page buffer.
    pub fn page_size(&self) -> usize {
        self.data.read().len()
    }

    /// Locks the page data for reading.
    #[inline]
    pub fn read_data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Locks the page data for writing.
    #[inline]
    pub fn write_data(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    /// Locks the page data for reading, giving up at `deadline`.
    #[inline]
    pub fn try_read_until(&self, deadline: Instant) -> Option<RwLockReadGuard<'_, Box<[u8]>>> {
        self.data.try_read_until(deadline)
    }

    /// Locks the page data for writing, giving up at `deadline`.
    #[inline]
    pub fn try_write_until(&self, deadline: Instant) -> Option<RwLockWriteGuard<'_, Box<[u8]>>> {
        self.data.try_write_until(deadline)
    }

    /// Copies data into the frame.
    pub fn copy_from(&self, src: &[u8]) {
        let mut data = self.data.write();
        let len = src.len().min(data.len());
        data[..len].copy_from_slice(&src[..len]);
    }

    /// Copies data out of the frame.
    pub fn copy_to(&self, dst: &mut [u8]) {
        let data = self.data.read();
        let len = dst.len().min(data.len());
        dst[..len].copy_from_slice(&data[..len]);
    }

    /// Resets the frame to empty state.
    pub(crate) fn reset(&self) {
        *self.page_id.lock() = None;
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        self.data.write().fill(0);
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferFrame")
            .field("frame_id", &self.frame_id)
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .field("is_dirty", &self.is_dirty())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_frame_id_validity() {
        assert!(FrameId(0).is_valid());
        assert!(!FrameId::INVALID.is_valid());
        assert_eq!(FrameId(42).to_string(), "frame:42");
    }

    #[test]
    fn test_buffer_frame_new() {
        let frame = BufferFrame::new(FrameId(0), 1024);

        assert_eq!(frame.frame_id(), FrameId(0));
        assert!(frame.page_id().is_none());
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());
        assert!(frame.is_empty());
        assert_eq!(frame.page_size(), 1024);
    }

    #[test]
    fn test_buffer_frame_pin_unpin() {
        let frame = BufferFrame::new(FrameId(0), 1024);

        assert_eq!(frame.pin(), 0);
        assert_eq!(frame.pin(), 1);
        assert_eq!(frame.unpin(), 1);
        assert!(frame.is_pinned());
        assert_eq!(frame.unpin(), 0);
        assert!(!frame.is_pinned());

        // Underflow stays at zero.
        assert_eq!(frame.unpin(), 0);
        assert_eq!(frame.pin_count(), 0);
    }

    #[test]
    fn test_assign_bumps_generation() {
        let frame = BufferFrame::new(FrameId(3), 1024);
        let before = frame.page_ref();

        frame.assign(PageId::new(1, 100));
        let after = frame.page_ref();

        assert_eq!(frame.page_id(), Some(PageId::new(1, 100)));
        assert_eq!(after.frame_id, FrameId(3));
        assert_ne!(before, after);
    }

    #[test]
    fn test_buffer_frame_data_access() {
        let frame = BufferFrame::new(FrameId(0), 1024);
        {
            let mut data = frame.write_data();
            data[0] = 0xAB;
            data[1023] = 0xCD;
        }
        let data = frame.read_data();
        assert_eq!(data[0], 0xAB);
        assert_eq!(data[1023], 0xCD);
    }

    #[test]
    fn test_deadline_lock_times_out() {
        let frame = BufferFrame::new(FrameId(0), 1024);
        let _writer = frame.write_data();

        let deadline = Instant::now() + Duration::from_millis(10);
        assert!(frame.try_read_until(deadline).is_none());
        assert!(frame.try_write_until(deadline).is_none());
    }

    #[test]
    fn test_buffer_frame_copy_from_to() {
        let frame = BufferFrame::new(FrameId(0), 1024);
        frame.copy_from(&[1u8, 2, 3, 4, 5]);

        let mut dst = [0u8; 5];
        frame.copy_to(&mut dst);
        assert_eq!(dst, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_buffer_frame_reset() {
        let frame = BufferFrame::new(FrameId(0), 1024);
        frame.assign(PageId::new(1, 1));
        frame.pin();
        frame.set_dirty(true);
        frame.write_data()[0] = 0xFF;

        frame.reset();

        assert!(frame.is_empty());
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());
        assert_eq!(frame.read_data()[0], 0);
    }
}
