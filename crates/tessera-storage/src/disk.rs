//! Disk manager for page-level file I/O.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tessera_common::page::validate_page_size;
use tessera_common::{PageId, Result, StorageConfig, TesseraError, DEFAULT_PAGE_SIZE};
use tracing::debug;

/// Extension of segment data files.
const SEGMENT_FILE_EXTENSION: &str = "seg";

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Base directory for data files.
    pub data_dir: PathBuf,
    /// Page size in bytes.
    pub page_size: usize,
    /// Enable fsync in `flush`.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            page_size: DEFAULT_PAGE_SIZE,
            fsync_enabled: true,
        }
    }
}

impl DiskManagerConfig {
    /// Derives the disk configuration from the storage configuration.
    pub fn from_storage(config: &StorageConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            page_size: config.page_size,
            fsync_enabled: config.fsync_enabled,
        }
    }
}

/// Manages reading and writing pages to segment files.
///
/// Each segment maps to one data file. Page `i` of a segment lives at byte
/// offset `i * page_size`. Files grow on write; reading a page beyond the end
/// of its file yields zeros, the image of a page that was allocated but
/// never written back.
pub struct DiskManager {
    /// Configuration.
    config: DiskManagerConfig,
    /// Open file handles keyed by segment id.
    files: Mutex<HashMap<u32, FileHandle>>,
}

/// Handle for an open segment file.
struct FileHandle {
    /// The file handle.
    file: File,
    /// Number of whole pages in the file.
    num_pages: u64,
}

impl DiskManager {
    /// Creates a new disk manager.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        validate_page_size(config.page_size)?;
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(Self {
            config,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Returns the page size.
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Generates the file path for a given segment.
    fn file_path(&self, segment_id: u32) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{:08}.{}", segment_id, SEGMENT_FILE_EXTENSION))
    }

    /// Runs `f` against the handle of a segment file, opening it on first use.
    fn with_file<T>(&self, segment_id: u32, f: impl FnOnce(&mut FileHandle) -> Result<T>) -> Result<T> {
        let mut files = self.files.lock();

        if !files.contains_key(&segment_id) {
            let path = self.file_path(segment_id);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            let file_size = file.metadata()?.len();
            let num_pages = file_size / self.config.page_size as u64;
            debug!(segment = segment_id, pages = num_pages, "opened segment file");
            files.insert(segment_id, FileHandle { file, num_pages });
        }

        let handle = files
            .get_mut(&segment_id)
            .ok_or_else(|| TesseraError::IoFailure(format!("segment {} not open", segment_id)))?;
        f(handle)
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.config.page_size {
            return Err(TesseraError::InvalidEntrySize {
                expected: self.config.page_size,
                actual: len,
            });
        }
        Ok(())
    }

    /// Reads a page from disk into `buf`.
    ///
    /// Pages past the end of the file read as zeros.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        self.check_len(buf.len())?;
        let page_size = self.config.page_size as u64;

        self.with_file(page_id.segment_id, |handle| {
            if page_id.page_index >= handle.num_pages {
                buf.fill(0);
                return Ok(());
            }
            handle
                .file
                .seek(SeekFrom::Start(page_id.page_index * page_size))?;
            handle.file.read_exact(buf)?;
            Ok(())
        })
    }

    /// Writes a page to disk.
    ///
    /// The write is not durable until `flush` returns.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        self.check_len(data.len())?;
        let page_size = self.config.page_size as u64;

        self.with_file(page_id.segment_id, |handle| {
            handle
                .file
                .seek(SeekFrom::Start(page_id.page_index * page_size))?;
            handle.file.write_all(data)?;

            // Update page count if we extended the file
            if page_id.page_index >= handle.num_pages {
                handle.num_pages = page_id.page_index + 1;
            }
            Ok(())
        })
    }

    /// Returns the number of pages backed by a segment file.
    pub fn num_pages(&self, segment_id: u32) -> Result<u64> {
        self.with_file(segment_id, |handle| Ok(handle.num_pages))
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        if !self.config.fsync_enabled {
            return Ok(());
        }
        let files = self.files.lock();
        for handle in files.values() {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Closes a specific segment file.
    pub fn close_file(&self, segment_id: u32) -> Result<()> {
        let mut files = self.files.lock();
        if let Some(handle) = files.remove(&segment_id) {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Closes all open files.
    pub fn close_all(&self) -> Result<()> {
        let mut files = self.files.lock();
        for (_, handle) in files.drain() {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Deletes a segment file.
    pub fn delete_file(&self, segment_id: u32) -> Result<()> {
        self.close_file(segment_id)?;
        let path = self.file_path(segment_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE: usize = 1024;

    fn create_test_disk_manager() -> (DiskManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = DiskManagerConfig {
            data_dir: dir.path().to_path_buf(),
            page_size: PAGE,
            fsync_enabled: false,
        };
        let dm = DiskManager::new(config).unwrap();
        (dm, dir)
    }

    #[test]
    fn test_disk_manager_new() {
        let (dm, _dir) = create_test_disk_manager();
        assert!(dm.data_dir().exists());
        assert_eq!(dm.page_size(), PAGE);
    }

    #[test]
    fn test_disk_manager_rejects_bad_page_size() {
        let dir = tempdir().unwrap();
        let result = DiskManager::new(DiskManagerConfig {
            data_dir: dir.path().to_path_buf(),
            page_size: 3000,
            fsync_enabled: false,
        });
        assert!(matches!(result, Err(TesseraError::InvalidConfig(_))));
    }

    #[test]
    fn test_disk_manager_write_read() {
        let (dm, _dir) = create_test_disk_manager();
        let page_id = PageId::new(0, 3);

        let mut data = vec![0u8; PAGE];
        data[0] = 0xAB;
        data[100] = 0xCD;
        data[PAGE - 1] = 0xEF;
        dm.write_page(page_id, &data).unwrap();

        let mut read_data = vec![0u8; PAGE];
        dm.read_page(page_id, &mut read_data).unwrap();
        assert_eq!(read_data, data);
        assert_eq!(dm.num_pages(0).unwrap(), 4);
    }

    #[test]
    fn test_disk_manager_reads_zeros_past_eof() {
        let (dm, _dir) = create_test_disk_manager();
        dm.write_page(PageId::new(0, 0), &vec![7u8; PAGE]).unwrap();

        let mut buf = vec![0xFFu8; PAGE];
        dm.read_page(PageId::new(0, 99), &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));

        // Holes left by writing past the end also read as zeros.
        dm.write_page(PageId::new(0, 5), &vec![9u8; PAGE]).unwrap();
        dm.read_page(PageId::new(0, 2), &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_disk_manager_multiple_segments() {
        let (dm, _dir) = create_test_disk_manager();

        for segment in 0..3u32 {
            dm.write_page(PageId::new(segment, 0), &vec![segment as u8 + 1; PAGE])
                .unwrap();
        }

        let mut buf = vec![0u8; PAGE];
        for segment in 0..3u32 {
            dm.read_page(PageId::new(segment, 0), &mut buf).unwrap();
            assert_eq!(buf[0], segment as u8 + 1);
        }
    }

    #[test]
    fn test_disk_manager_wrong_buffer_size() {
        let (dm, _dir) = create_test_disk_manager();
        let mut small = vec![0u8; 100];
        assert!(dm.read_page(PageId::new(0, 0), &mut small).is_err());
        assert!(dm.write_page(PageId::new(0, 0), &small).is_err());
    }

    #[test]
    fn test_disk_manager_persistence() {
        let dir = tempdir().unwrap();
        let page_id = PageId::new(4, 1);
        let config = DiskManagerConfig {
            data_dir: dir.path().to_path_buf(),
            page_size: PAGE,
            fsync_enabled: true,
        };

        {
            let dm = DiskManager::new(config.clone()).unwrap();
            dm.write_page(page_id, &vec![0xFFu8; PAGE]).unwrap();
            dm.flush().unwrap();
        }

        {
            let dm = DiskManager::new(config).unwrap();
            let mut buf = vec![0u8; PAGE];
            dm.read_page(page_id, &mut buf).unwrap();
            assert_eq!(buf[0], 0xFF);
            assert_eq!(dm.num_pages(4).unwrap(), 2);
        }
    }

    #[test]
    fn test_disk_manager_delete_file() {
        let (dm, dir) = create_test_disk_manager();

        dm.write_page(PageId::new(0, 0), &vec![1u8; PAGE]).unwrap();
        let file_path = dir.path().join("00000000.seg");
        assert!(file_path.exists());

        dm.delete_file(0).unwrap();
        assert!(!file_path.exists());
    }

    #[test]
    fn test_disk_manager_close_file() {
        let (dm, _dir) = create_test_disk_manager();

        dm.write_page(PageId::new(0, 0), &vec![1u8; PAGE]).unwrap();
        dm.close_file(0).unwrap();

        // Can reopen and continue
        dm.write_page(PageId::new(0, 1), &vec![2u8; PAGE]).unwrap();
        assert_eq!(dm.num_pages(0).unwrap(), 2);
    }
}
