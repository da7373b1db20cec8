//! Configuration structures for Tessera.

use crate::error::{Result, TesseraError};
use crate::page::{validate_page_size, DEFAULT_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Storage configuration for the page store and its log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for segment data files.
    pub data_dir: PathBuf,
    /// Directory for WAL files.
    pub wal_dir: PathBuf,
    /// Page size in bytes (power of two, 1 KB to 16 KB).
    pub page_size: usize,
    /// Buffer pool size in number of pages.
    pub buffer_pool_pages: usize,
    /// WAL segment size in bytes.
    pub wal_segment_size: u32,
    /// Enable fsync for durability.
    pub fsync_enabled: bool,
    /// Bounded wait for page locks taken by structural operations.
    pub lock_timeout_ms: u64,
    /// Checkpoint interval in seconds, consumed by the external scheduler.
    pub checkpoint_interval_secs: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            wal_dir: PathBuf::from("./data/wal"),
            page_size: DEFAULT_PAGE_SIZE,
            buffer_pool_pages: 8192,            // 128 MB with 16 KB pages
            wal_segment_size: 16 * 1024 * 1024, // 16 MB
            fsync_enabled: true,
            lock_timeout_ms: 1000,
            checkpoint_interval_secs: 300,
        }
    }
}

impl StorageConfig {
    /// Minimum number of buffer pool frames. A structural operation may pin
    /// a full root-to-leaf path plus siblings.
    pub const MIN_BUFFER_POOL_PAGES: usize = 8;

    /// Creates a configuration rooted at a single directory.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            wal_dir: dir.join("wal"),
            data_dir: dir,
            ..Default::default()
        }
    }

    /// Returns the total buffer pool size in bytes.
    pub fn buffer_pool_size_bytes(&self) -> usize {
        self.buffer_pool_pages * self.page_size
    }

    /// Returns the lock timeout as a Duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if self.buffer_pool_pages < Self::MIN_BUFFER_POOL_PAGES {
            return Err(TesseraError::InvalidConfig(format!(
                "buffer_pool_pages = {} (min {})",
                self.buffer_pool_pages,
                Self::MIN_BUFFER_POOL_PAGES
            )));
        }
        // A segment must hold its header plus a full-page image record.
        let min_segment = 2 * self.page_size as u64 + 4096;
        if (self.wal_segment_size as u64) < min_segment {
            return Err(TesseraError::InvalidConfig(format!(
                "wal_segment_size = {} (min {} for page size {})",
                self.wal_segment_size, min_segment, self.page_size
            )));
        }
        Ok(())
    }
}
