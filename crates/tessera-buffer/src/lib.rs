//! Buffer pool management for Tessera.
//!
//! This crate provides in-memory page caching with:
//! - Fixed-size buffer pool with configurable page count
//! - Clock eviction policy restricted to clean, unpinned frames
//! - Pin counting and per-page reader/writer latches
//! - Scoped page guards that release latch and pin on drop

mod frame;
mod pool;
mod replacer;

pub use frame::{BufferFrame, FrameId, PageRef};
pub use pool::{
    BufferPool, BufferPoolConfig, BufferPoolStats, PageReadGuard, PageWriteGuard, MIN_AUTO_FRAMES,
};
pub use replacer::{ClockReplacer, Replacer};
