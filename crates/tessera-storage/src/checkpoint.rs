//! Checkpoints: bound recovery time and reclaim WAL segments.

use crate::store::PageStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_common::{Result, StorageConfig};
use tessera_wal::Lsn;
use tracing::info;

/// Outcome of one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    /// LSN of the checkpoint marker.
    pub checkpoint_lsn: Lsn,
    /// Replay start recorded in the marker.
    pub redo_lsn: Lsn,
    /// Pages written to segment files.
    pub pages_written: usize,
    /// WAL segment files removed.
    pub segments_truncated: usize,
    /// Wall time spent.
    pub duration: Duration,
}

/// Writes checkpoints for a page store.
///
/// Scheduling belongs to the caller: [`Checkpointer::trigger_checkpoint`]
/// runs one immediately, [`Checkpointer::checkpoint_if_due`] runs one once
/// the interval has passed since the last.
pub struct Checkpointer {
    store: Arc<PageStore>,
    interval: Duration,
    last: Mutex<Instant>,
}

impl Checkpointer {
    /// Creates a checkpointer that is due `interval` after creation and
    /// after each checkpoint it writes.
    pub fn new(store: Arc<PageStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            last: Mutex::new(Instant::now()),
        }
    }

    /// Creates a checkpointer using the configured interval.
    pub fn from_config(store: Arc<PageStore>, config: &StorageConfig) -> Self {
        Self::new(
            store,
            Duration::from_secs(u64::from(config.checkpoint_interval_secs)),
        )
    }

    /// Returns the checkpoint interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Writes a checkpoint now.
    ///
    /// Waits for in-flight operations to finish and holds new ones off while
    /// dirty pages are logged and written. Then deletes the WAL segments
    /// that lie entirely below the new redo LSN.
    pub fn trigger_checkpoint(&self) -> Result<CheckpointStats> {
        let start = Instant::now();
        info!("checkpoint started");

        let (checkpoint_lsn, redo_lsn, pages_written) = self.store.write_checkpoint()?;
        let segments_truncated = self.store.wal().truncate_before(redo_lsn)?;
        *self.last.lock() = Instant::now();

        let stats = CheckpointStats {
            checkpoint_lsn,
            redo_lsn,
            pages_written,
            segments_truncated,
            duration: start.elapsed(),
        };
        info!(
            checkpoint_lsn = %checkpoint_lsn,
            redo_lsn = %redo_lsn,
            pages = pages_written,
            segments = segments_truncated,
            elapsed_ms = stats.duration.as_millis() as u64,
            "checkpoint complete"
        );
        Ok(stats)
    }

    /// Writes a checkpoint if the interval has elapsed since the last one.
    pub fn checkpoint_if_due(&self) -> Result<Option<CheckpointStats>> {
        if self.last.lock().elapsed() < self.interval {
            return Ok(None);
        }
        self.trigger_checkpoint().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::DeltaRecord;
    use crate::disk::{DiskManager, DiskManagerConfig};
    use tempfile::{tempdir, TempDir};
    use tessera_buffer::{BufferPool, BufferPoolConfig};
    use tessera_common::{PageId, PageType, PAGE_FORMAT_VERSION};
    use tessera_wal::{WalConfig, WalManager};

    const PAGE: usize = 1024;

    fn open_store(dir: &TempDir, segment_size: u32) -> Arc<PageStore> {
        let wal = WalManager::open(WalConfig {
            wal_dir: dir.path().join("wal"),
            segment_size,
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
        Arc::new(
            PageStore::with_parts(disk, pool, Arc::new(wal), Duration::from_millis(100)).unwrap(),
        )
    }

    #[test]
    fn test_checkpoint_cleans_pages() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, 1 << 20);
        store.open_segment(1).unwrap();
        store.allocate(1).unwrap();

        let checkpointer = Checkpointer::new(store.clone(), Duration::from_secs(60));
        let stats = checkpointer.trigger_checkpoint().unwrap();
        assert_eq!(stats.pages_written, 1);
        assert!(stats.redo_lsn < stats.checkpoint_lsn);
        assert!(store.pool().dirty_pages().is_empty());
        assert_eq!(
            store.wal().latest_checkpoint().map(|c| c.redo_lsn),
            Some(stats.redo_lsn)
        );

        // Nothing dirty: the marker is still written.
        let again = checkpointer.trigger_checkpoint().unwrap();
        assert_eq!(again.pages_written, 0);
        assert!(again.checkpoint_lsn > stats.checkpoint_lsn);
    }

    #[test]
    fn test_checkpoint_truncates_old_segments() {
        let dir = tempdir().unwrap();
        // Small segments so that snapshots rotate the log.
        let store = open_store(&dir, 4096);
        store.open_segment(1).unwrap();
        for _ in 0..8 {
            let page_id = store.allocate(1).unwrap();
            let mut page = store.write(page_id).unwrap();
            store
                .log_change(&mut page, &DeltaRecord::InitNewPage {
                    page_type: PageType::BTreeLeaf,
                    version: PAGE_FORMAT_VERSION,
                    item_size: 8,
                    capacity: 8,
                })
                .unwrap();
            drop(page);
            store.flush_page(page_id).unwrap();
        }
        assert!(store.wal().current_segment_id().0 > 1);

        let checkpointer = Checkpointer::new(store.clone(), Duration::from_secs(60));
        let stats = checkpointer.trigger_checkpoint().unwrap();
        assert!(stats.segments_truncated > 0);
        let first = tessera_wal::segment::list_segments(store.wal().wal_dir())
            .unwrap()
            .into_keys()
            .next()
            .unwrap();
        assert!(first.0 >= stats.redo_lsn.segment_id());
        assert_eq!(store.read(PageId::meta(1)).unwrap()[0], PageType::Meta as u8);
    }

    #[test]
    fn test_checkpoint_if_due() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, 1 << 20);
        let lazy = Checkpointer::new(store.clone(), Duration::from_secs(3600));
        assert!(lazy.checkpoint_if_due().unwrap().is_none());

        let eager = Checkpointer::new(store, Duration::ZERO);
        assert!(eager.checkpoint_if_due().unwrap().is_some());
    }
}
