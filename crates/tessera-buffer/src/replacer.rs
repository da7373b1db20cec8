//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;

/// Trait for page replacement algorithms.
pub trait Replacer: Send + Sync {
    /// Records that the given frame was accessed.
    fn record_access(&self, frame_id: FrameId);

    /// Marks a frame as evictable (unpinned) or not.
    fn set_evictable(&self, frame_id: FrameId, evictable: bool);

    /// Selects a victim among evictable frames that also pass `can_evict`.
    ///
    /// Frames rejected by `can_evict` stay candidates for later calls.
    /// Returns None if no frame qualifies.
    fn evict(&self, can_evict: &dyn Fn(FrameId) -> bool) -> Option<FrameId>;

    /// Removes a frame from the replacer.
    fn remove(&self, frame_id: FrameId);

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// Clock (second chance) replacement.
///
/// The hand sweeps the frames in order. An evictable frame with its
/// reference bit set gets the bit cleared and is passed over once; the first
/// evictable frame found with a clear bit that the caller accepts becomes
/// the victim.
pub struct ClockReplacer {
    inner: Mutex<ClockState>,
}

struct ClockState {
    reference_bits: Vec<bool>,
    evictable: Vec<bool>,
    evictable_count: usize,
    hand: usize,
}

impl ClockState {
    fn in_range(&self, frame_id: FrameId) -> bool {
        (frame_id.0 as usize) < self.evictable.len()
    }

    fn mark(&mut self, idx: usize, evictable: bool) {
        if self.evictable[idx] != evictable {
            self.evictable[idx] = evictable;
            if evictable {
                self.evictable_count += 1;
            } else {
                self.evictable_count -= 1;
            }
        }
    }
}

impl ClockReplacer {
    /// Creates a new clock replacer with the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            inner: Mutex::new(ClockState {
                reference_bits: vec![false; num_frames],
                evictable: vec![false; num_frames],
                evictable_count: 0,
                hand: 0,
            }),
        }
    }

    /// Returns the total capacity.
    pub fn capacity(&self) -> usize {
        self.inner.lock().evictable.len()
    }
}

impl Replacer for ClockReplacer {
    fn record_access(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if inner.in_range(frame_id) {
            inner.reference_bits[frame_id.0 as usize] = true;
        }
    }

    fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut inner = self.inner.lock();
        if inner.in_range(frame_id) {
            inner.mark(frame_id.0 as usize, evictable);
        }
    }

    fn evict(&self, can_evict: &dyn Fn(FrameId) -> bool) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        let num_frames = inner.evictable.len();
        if inner.evictable_count == 0 || num_frames == 0 {
            return None;
        }

        // Two sweeps: the first may only clear reference bits.
        for _ in 0..(2 * num_frames) {
            let hand = inner.hand;
            inner.hand = (hand + 1) % num_frames;
            if !inner.evictable[hand] {
                continue;
            }
            if inner.reference_bits[hand] {
                inner.reference_bits[hand] = false;
                continue;
            }
            let frame_id = FrameId(hand as u32);
            if can_evict(frame_id) {
                inner.mark(hand, false);
                return Some(frame_id);
            }
        }
        None
    }

    fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if inner.in_range(frame_id) {
            let idx = frame_id.0 as usize;
            inner.mark(idx, false);
            inner.reference_bits[idx] = false;
        }
    }

    fn size(&self) -> usize {
        self.inner.lock().evictable_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any(_: FrameId) -> bool {
        true
    }

    #[test]
    fn test_clock_replacer_new() {
        let replacer = ClockReplacer::new(10);
        assert_eq!(replacer.capacity(), 10);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_clock_replacer_set_evictable() {
        let replacer = ClockReplacer::new(10);

        replacer.set_evictable(FrameId(0), true);
        replacer.set_evictable(FrameId(1), true);
        replacer.set_evictable(FrameId(2), true);
        replacer.set_evictable(FrameId(2), true);
        assert_eq!(replacer.size(), 3);

        replacer.set_evictable(FrameId(1), false);
        assert_eq!(replacer.size(), 2);
    }

    #[test]
    fn test_clock_replacer_evict_empty() {
        let replacer = ClockReplacer::new(10);
        assert!(replacer.evict(&any).is_none());
    }

    #[test]
    fn test_clock_replacer_evict_single() {
        let replacer = ClockReplacer::new(10);

        replacer.set_evictable(FrameId(5), true);
        assert_eq!(replacer.evict(&any), Some(FrameId(5)));
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_clock_replacer_second_chance() {
        let replacer = ClockReplacer::new(10);

        replacer.set_evictable(FrameId(0), true);
        replacer.set_evictable(FrameId(1), true);
        replacer.set_evictable(FrameId(2), true);
        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));

        // Frame 2 is the only one without a reference bit.
        assert_eq!(replacer.evict(&any), Some(FrameId(2)));
    }

    #[test]
    fn test_clock_replacer_evict_all_referenced() {
        let replacer = ClockReplacer::new(3);

        for i in 0..3 {
            replacer.set_evictable(FrameId(i), true);
            replacer.record_access(FrameId(i));
        }

        assert!(replacer.evict(&any).is_some());
        assert_eq!(replacer.size(), 2);
    }

    #[test]
    fn test_clock_replacer_predicate_skips_frames() {
        let replacer = ClockReplacer::new(4);
        for i in 0..4 {
            replacer.set_evictable(FrameId(i), true);
        }

        // Only odd frames are acceptable victims.
        let victim = replacer.evict(&|f: FrameId| f.0 % 2 == 1);
        assert_eq!(victim, Some(FrameId(1)));
        assert_eq!(replacer.size(), 3);

        // Rejected frames are still candidates.
        assert_eq!(replacer.evict(&|f: FrameId| f.0 == 0), Some(FrameId(0)));
        assert!(replacer.evict(&|_| false).is_none());
        assert_eq!(replacer.size(), 2);
    }

    #[test]
    fn test_clock_replacer_remove() {
        let replacer = ClockReplacer::new(10);

        replacer.set_evictable(FrameId(0), true);
        replacer.set_evictable(FrameId(1), true);
        replacer.remove(FrameId(0));
        assert_eq!(replacer.size(), 1);

        assert_eq!(replacer.evict(&any), Some(FrameId(1)));
    }

    #[test]
    fn test_clock_replacer_out_of_bounds() {
        let replacer = ClockReplacer::new(5);

        replacer.set_evictable(FrameId(100), true);
        replacer.record_access(FrameId(100));
        replacer.remove(FrameId(100));

        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_clock_replacer_pin_unpin_cycle() {
        let replacer = ClockReplacer::new(3);

        for i in 0..3 {
            replacer.set_evictable(FrameId(i), true);
        }
        replacer.set_evictable(FrameId(1), false);
        assert_eq!(replacer.size(), 2);

        let victim = replacer.evict(&any);
        assert!(victim.is_some());
        assert_ne!(victim, Some(FrameId(1)));

        replacer.set_evictable(FrameId(1), true);
        assert_eq!(replacer.size(), 2);
    }
}
