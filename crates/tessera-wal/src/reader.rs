//! Replay cursor over historical WAL records.

use crate::constants::SEGMENT_HEADER_SIZE;
use crate::record::{Lsn, WalRecord};
use crate::segment::{list_segments, LogSegment, LogSegmentId};
use bytes::Bytes;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tessera_common::{Result, TesseraError};

/// Segment currently being read by the iterator.
struct LoadedSegment {
    id: LogSegmentId,
    data: Bytes,
    pos: usize,
    limit: usize,
}

/// Lazy, forward-only cursor over WAL records in append order.
///
/// Segments are loaded one at a time. The cursor stops at the tail captured
/// when it was created, so records appended afterwards are not visited. An
/// incomplete record at the tail ends iteration; a checksum mismatch or an
/// incomplete record anywhere else yields `WalCorrupted` and ends iteration.
pub struct WalIterator {
    pending: VecDeque<(LogSegmentId, PathBuf)>,
    current: Option<LoadedSegment>,
    from: Lsn,
    tail: Lsn,
    done: bool,
}

impl WalIterator {
    /// Creates a cursor over records with `from <= lsn < tail`.
    ///
    /// If `from` lies below the oldest segment still on disk the cursor starts
    /// at the oldest record available.
    pub fn new(wal_dir: &Path, from: Lsn, tail: Lsn) -> Result<Self> {
        let pending = list_segments(wal_dir)?
            .into_iter()
            .filter(|(id, _)| id.0 >= from.segment_id() && id.0 <= tail.segment_id())
            .collect();

        Ok(Self {
            pending,
            current: None,
            from,
            tail,
            done: false,
        })
    }

    /// Returns the tail this cursor stops at.
    pub fn tail(&self) -> Lsn {
        self.tail
    }

    fn load_next(&mut self) -> Result<bool> {
        let Some((id, path)) = self.pending.pop_front() else {
            return Ok(false);
        };
        let (header, data) = LogSegment::read_all(&path)?;
        if header.segment_id != id {
            return Err(TesseraError::WalCorrupted {
                lsn: id.first_lsn().0,
                reason: format!("file {} holds segment {}", id, header.segment_id),
            });
        }

        let pos = if id.0 == self.from.segment_id() {
            (self.from.offset() as usize).saturating_sub(SEGMENT_HEADER_SIZE)
        } else {
            0
        };
        let limit = if id.0 == self.tail.segment_id() {
            (self.tail.offset() as usize)
                .saturating_sub(SEGMENT_HEADER_SIZE)
                .min(data.len())
        } else {
            data.len()
        };

        self.current = Some(LoadedSegment {
            id,
            data: Bytes::from(data),
            pos,
            limit,
        });
        Ok(true)
    }

    fn is_last_segment(&self, id: LogSegmentId) -> bool {
        id.0 == self.tail.segment_id() || self.pending.is_empty()
    }

    fn read_next(&mut self) -> Result<Option<WalRecord>> {
        loop {
            if self.current.is_none() && !self.load_next()? {
                return Ok(None);
            }
            let Some(segment) = self.current.as_ref() else {
                return Ok(None);
            };
            let (id, pos, limit) = (segment.id, segment.pos, segment.limit);
            if pos >= limit {
                self.current = None;
                continue;
            }

            let expected = Lsn::new(id.0, (SEGMENT_HEADER_SIZE + pos) as u32);
            let window = segment.data.slice(pos..limit);
            let complete = WalRecord::peek_size(&window).filter(|size| *size <= window.len());
            let Some(size) = complete else {
                if self.is_last_segment(id) {
                    return Ok(None);
                }
                return Err(TesseraError::WalCorrupted {
                    lsn: expected.0,
                    reason: format!("incomplete record inside segment {}", id),
                });
            };

            let record = WalRecord::decode(&window).map_err(|e| match e {
                TesseraError::WalCorrupted { reason, .. } => TesseraError::WalCorrupted {
                    lsn: expected.0,
                    reason,
                },
                other => other,
            })?;
            if record.lsn != expected {
                return Err(TesseraError::WalCorrupted {
                    lsn: expected.0,
                    reason: format!("record claims LSN {}", record.lsn),
                });
            }

            if let Some(segment) = self.current.as_mut() {
                segment.pos += size;
            }
            return Ok(Some(record));
        }
    }
}

impl Iterator for WalIterator {
    type Item = Result<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordType;
    use crate::writer::{WalConfig, WalManager};
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::tempdir;
    use tessera_common::PageId;

    fn create_test_wal(dir: &Path, segment_size: u32) -> WalManager {
        WalManager::open(WalConfig {
            wal_dir: dir.to_path_buf(),
            segment_size,
            fsync_enabled: false,
        })
        .unwrap()
    }

    fn delta(page_index: u64, op_id: u64, payload: &'static [u8]) -> WalRecord {
        WalRecord::new(
            RecordType::InsertEntry,
            PageId::new(1, page_index),
            op_id,
            Bytes::from_static(payload),
        )
    }

    #[test]
    fn test_iterate_empty_wal() {
        let dir = tempdir().unwrap();
        let wal = create_test_wal(dir.path(), 1 << 20);
        assert_eq!(wal.iterate(Lsn::INVALID).unwrap().count(), 0);
    }

    #[test]
    fn test_iterate_in_append_order() {
        let dir = tempdir().unwrap();
        let wal = create_test_wal(dir.path(), 1 << 20);

        let mut lsns = Vec::new();
        for i in 0..10 {
            lsns.push(wal.append(delta(i, 0, b"x")).unwrap());
        }

        let records: Vec<_> = wal
            .iterate(Lsn::INVALID)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 10);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.lsn, lsns[i]);
            assert_eq!(record.page_id, PageId::new(1, i as u64));
        }
    }

    #[test]
    fn test_iterate_from_middle() {
        let dir = tempdir().unwrap();
        let wal = create_test_wal(dir.path(), 1 << 20);

        let mut lsns = Vec::new();
        for i in 0..5 {
            lsns.push(wal.append(delta(i, 0, b"abc")).unwrap());
        }

        let records: Vec<_> = wal
            .iterate(lsns[2])
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].lsn, lsns[2]);
    }

    #[test]
    fn test_iterate_across_segments() {
        let dir = tempdir().unwrap();
        let wal = create_test_wal(dir.path(), 512);

        for i in 0..40 {
            wal.append(delta(i, 0, b"spans several segments")).unwrap();
        }
        assert!(wal.current_segment_id().0 > 1);

        let records: Vec<_> = wal
            .iterate(Lsn::INVALID)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 40);
        assert!(records.windows(2).all(|w| w[0].lsn < w[1].lsn));
    }

    #[test]
    fn test_iterator_stops_at_captured_tail() {
        let dir = tempdir().unwrap();
        let wal = create_test_wal(dir.path(), 1 << 20);

        wal.append(delta(1, 0, b"a")).unwrap();
        let iter = wal.iterate(Lsn::INVALID).unwrap();
        wal.append(delta(2, 0, b"b")).unwrap();

        assert_eq!(iter.count(), 1);
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let dir = tempdir().unwrap();
        let wal = create_test_wal(dir.path(), 1 << 20);

        let first = wal.append(delta(1, 0, b"first")).unwrap();
        wal.append(delta(2, 0, b"second")).unwrap();
        wal.flush().unwrap();

        // Flip a payload byte of the first record.
        let path = dir.path().join(LogSegmentId::FIRST.filename());
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(first.offset() as u64 + 33))
            .unwrap();
        file.write_all(&[0xFF]).unwrap();
        drop(file);

        let results: Vec<_> = wal.iterate(Lsn::INVALID).unwrap().collect();
        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(TesseraError::WalCorrupted { lsn, .. }) => assert_eq!(*lsn, first.0),
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_torn_tail_ends_iteration() {
        let dir = tempdir().unwrap();
        let wal = create_test_wal(dir.path(), 1 << 20);
        wal.append(delta(1, 0, b"kept")).unwrap();
        let tail = wal.next_lsn();
        wal.close().unwrap();

        // Append half a record behind the WAL's back.
        let path = dir.path().join(LogSegmentId::FIRST.filename());
        let mut torn = delta(2, 0, b"torn away");
        torn.lsn = tail;
        let bytes = torn.encode().unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&bytes[..40]).unwrap();
        drop(file);

        let far_tail = Lsn::new(1, u32::MAX);
        let records: Vec<_> = WalIterator::new(dir.path(), Lsn::INVALID, far_tail)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 1);
    }
}
