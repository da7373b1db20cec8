//! WAL manager: ordered durable append, operation markers, checkpoints.

use crate::constants::{DEFAULT_SEGMENT_SIZE, SEGMENT_HEADER_SIZE};
use crate::reader::WalIterator;
use crate::record::{Lsn, RecordType, WalRecord};
use crate::segment::{list_segments, LogSegment, LogSegmentId};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_common::{Result, StorageConfig, TesseraError};
use tracing::{debug, info};

/// Configuration for the WAL manager.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory for WAL segment files.
    pub wal_dir: PathBuf,
    /// Maximum size of each segment file.
    pub segment_size: u32,
    /// Enable fsync on flush.
    pub fsync_enabled: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("./data/wal"),
            segment_size: DEFAULT_SEGMENT_SIZE,
            fsync_enabled: true,
        }
    }
}

impl WalConfig {
    /// Derives the WAL configuration from the storage configuration.
    pub fn from_storage(config: &StorageConfig) -> Self {
        Self {
            wal_dir: config.wal_dir.clone(),
            segment_size: config.wal_segment_size,
            fsync_enabled: config.fsync_enabled,
        }
    }
}

/// Location of a durable checkpoint marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointInfo {
    /// LSN of the checkpoint marker record.
    pub lsn: Lsn,
    /// Replay start: every mutation below it is reflected in page storage.
    pub redo_lsn: Lsn,
}

/// Thread-safe write-ahead log.
///
/// Records are appended in strict LSN order under a single lock; the LSN of
/// a record is its byte position in the log. Durability is explicit:
/// `flush` / `flush_to` force the log, `commit_operation` flushes its commit
/// marker before returning.
pub struct WalManager {
    /// Configuration.
    config: WalConfig,
    /// Active segment. `None` once closed.
    current_segment: Mutex<Option<LogSegment>>,
    /// LSN the next record will receive.
    next_lsn: AtomicU64,
    /// Every record below this LSN is durable.
    flushed_lsn: AtomicU64,
    /// Latest checkpoint marker.
    latest_checkpoint: Mutex<Option<CheckpointInfo>>,
}

impl WalManager {
    /// Opens the WAL, creating the directory and first segment if needed.
    ///
    /// The newest segment's torn tail is truncated and the log is scanned for
    /// its latest checkpoint marker.
    pub fn open(config: WalConfig) -> Result<Self> {
        if (config.segment_size as usize) < SEGMENT_HEADER_SIZE * 2 {
            return Err(TesseraError::InvalidConfig(format!(
                "wal segment size {} too small",
                config.segment_size
            )));
        }
        std::fs::create_dir_all(&config.wal_dir)?;

        let segment = Self::recover_or_create(&config)?;
        let tail = segment.next_lsn();

        let mut latest = None;
        for record in WalIterator::new(&config.wal_dir, Lsn::INVALID, tail)? {
            let record = record?;
            if record.record_type == RecordType::Checkpoint {
                latest = Some(CheckpointInfo {
                    lsn: record.lsn,
                    redo_lsn: record.checkpoint_redo_lsn()?,
                });
            }
        }

        info!(
            wal_dir = %config.wal_dir.display(),
            segment = %segment.segment_id(),
            next_lsn = %tail,
            checkpoint = ?latest.map(|c| c.redo_lsn.0),
            "WAL opened"
        );

        Ok(Self {
            config,
            current_segment: Mutex::new(Some(segment)),
            next_lsn: AtomicU64::new(tail.0),
            flushed_lsn: AtomicU64::new(tail.0),
            latest_checkpoint: Mutex::new(latest),
        })
    }

    /// Opens the newest segment or creates the first one.
    fn recover_or_create(config: &WalConfig) -> Result<LogSegment> {
        match list_segments(&config.wal_dir)?.into_iter().next_back() {
            Some((_, path)) => LogSegment::open(&path),
            None => LogSegment::create(&config.wal_dir, LogSegmentId::FIRST, config.segment_size),
        }
    }

    /// Returns the directory containing WAL segments.
    pub fn wal_dir(&self) -> &Path {
        &self.config.wal_dir
    }

    /// Returns the next LSN that will be assigned.
    pub fn next_lsn(&self) -> Lsn {
        Lsn(self.next_lsn.load(Ordering::SeqCst))
    }

    /// Returns the durable end of the log: every record below it is durable.
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn(self.flushed_lsn.load(Ordering::SeqCst))
    }

    /// Returns the latest checkpoint marker, if any.
    pub fn latest_checkpoint(&self) -> Option<CheckpointInfo> {
        *self.latest_checkpoint.lock()
    }

    /// Returns the current segment ID.
    pub fn current_segment_id(&self) -> LogSegmentId {
        self.current_segment
            .lock()
            .as_ref()
            .map(|s| s.segment_id())
            .unwrap_or(LogSegmentId(self.next_lsn().segment_id()))
    }

    /// Appends a record and returns its LSN.
    ///
    /// The LSN is assigned inside the append lock, so LSN order equals log
    /// order. The record is not durable until a later flush covers it.
    pub fn append(&self, mut record: WalRecord) -> Result<Lsn> {
        let record_size = record.size_on_disk();
        if record_size + SEGMENT_HEADER_SIZE > self.config.segment_size as usize {
            return Err(TesseraError::Internal(format!(
                "{} record of {} bytes exceeds WAL segment size",
                record.record_type, record_size
            )));
        }

        let mut segment_guard = self.current_segment.lock();
        let segment = segment_guard.as_mut().ok_or(TesseraError::WalClosed)?;

        if !segment.has_space(record_size) {
            self.rotate(segment)?;
        }

        if record.record_type == RecordType::OperationBegin {
            record.op_id = segment.next_lsn().0;
        }
        let lsn = segment.append(&mut record)?;
        self.next_lsn.store(segment.next_lsn().0, Ordering::SeqCst);
        Ok(lsn)
    }

    /// Seals the active segment and replaces it with the next one.
    fn rotate(&self, segment: &mut LogSegment) -> Result<()> {
        segment.sync()?;
        segment.close()?;
        let next_id = segment.segment_id().next();
        *segment = LogSegment::create(&self.config.wal_dir, next_id, self.config.segment_size)?;
        // The sealed segment was synced in full.
        self.flushed_lsn.store(segment.next_lsn().0, Ordering::SeqCst);
        debug!(segment = %next_id, "rotated WAL segment");
        Ok(())
    }

    /// Starts an operation and returns its id (the LSN of its begin marker).
    pub fn begin_operation(&self) -> Result<u64> {
        let lsn = self.append(WalRecord::marker(RecordType::OperationBegin, 0))?;
        Ok(lsn.0)
    }

    /// Appends the commit marker of an operation and makes it durable.
    ///
    /// Only after this returns may the operation's effects be reported as
    /// durable.
    pub fn commit_operation(&self, op_id: u64) -> Result<Lsn> {
        let lsn = self.append(WalRecord::marker(RecordType::OperationCommit, op_id))?;
        self.flush_to(lsn)?;
        Ok(lsn)
    }

    /// Appends the abort marker of an operation. Aborted operations are never
    /// replayed, so the marker is not forced.
    pub fn abort_operation(&self, op_id: u64) -> Result<Lsn> {
        self.append(WalRecord::marker(RecordType::OperationAbort, op_id))
    }

    /// Appends a durable checkpoint marker and makes it the latest checkpoint.
    pub fn log_checkpoint(&self, redo_lsn: Lsn) -> Result<Lsn> {
        let lsn = self.append(WalRecord::checkpoint(redo_lsn))?;
        self.flush_to(lsn)?;
        *self.latest_checkpoint.lock() = Some(CheckpointInfo { lsn, redo_lsn });
        info!(checkpoint_lsn = %lsn, redo_lsn = %redo_lsn, "checkpoint marker written");
        Ok(lsn)
    }

    /// Returns a cursor over records from `from` to the current tail.
    pub fn iterate(&self, from: Lsn) -> Result<WalIterator> {
        WalIterator::new(&self.config.wal_dir, from, self.next_lsn())
    }

    /// Forces all appended records to disk and returns the durable end.
    pub fn flush(&self) -> Result<Lsn> {
        let mut segment_guard = self.current_segment.lock();
        let segment = segment_guard.as_mut().ok_or(TesseraError::WalClosed)?;
        if self.config.fsync_enabled {
            segment.sync()?;
        }
        let end = segment.next_lsn();
        self.flushed_lsn.fetch_max(end.0, Ordering::SeqCst);
        Ok(end)
    }

    /// Makes sure the record at `lsn` is durable.
    pub fn flush_to(&self, lsn: Lsn) -> Result<()> {
        if lsn < self.flushed_lsn() {
            return Ok(());
        }
        self.flush()?;
        Ok(())
    }

    /// Deletes segment files whose records all lie below `lsn`.
    ///
    /// Truncation is segment-granular and never goes past the redo LSN of the
    /// latest checkpoint. Returns the number of files removed.
    pub fn truncate_before(&self, lsn: Lsn) -> Result<usize> {
        let checkpoint = self.latest_checkpoint().map(|c| c.redo_lsn).unwrap_or(Lsn::INVALID);
        if lsn > checkpoint {
            return Err(TesseraError::TruncateBeyondCheckpoint {
                requested: lsn.0,
                checkpoint: checkpoint.0,
            });
        }

        let current = self.current_segment_id();
        let mut removed = 0;
        for (id, path) in list_segments(&self.config.wal_dir)? {
            if id.0 >= lsn.segment_id() || id >= current {
                break;
            }
            std::fs::remove_file(&path)?;
            removed += 1;
        }
        if removed > 0 {
            info!(before = %lsn, segments = removed, "truncated WAL");
        }
        Ok(removed)
    }

    /// Closes the WAL. Further appends fail with `WalClosed`.
    pub fn close(&self) -> Result<()> {
        let mut segment_guard = self.current_segment.lock();
        if let Some(mut segment) = segment_guard.take() {
            segment.sync()?;
            segment.close()?;
            self.flushed_lsn.fetch_max(segment.next_lsn().0, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for WalManager {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
