//! Crash recovery: replays the WAL from the latest checkpoint.

use crate::delta::DeltaRecord;
use crate::store::PageStore;
use std::collections::HashSet;
use tessera_common::{Result, TesseraError};
use tessera_wal::{Lsn, RecordType, WalManager, WalRecord, AUTONOMOUS_OP};
use tracing::{debug, info, warn};

/// Summary of a recovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Checkpoint marker recovery started from.
    pub checkpoint_lsn: Option<Lsn>,
    /// First LSN scanned.
    pub redo_lsn: Lsn,
    /// End of the log after recovery, including appended abort markers.
    pub end_lsn: Lsn,
    /// Records read in the analysis pass.
    pub records_scanned: usize,
    /// Delta records applied to a page.
    pub records_applied: usize,
    /// Delta records the page already reflected.
    pub records_skipped: usize,
    /// Delta records of operations that never committed.
    pub records_discarded: usize,
    /// Operations with a commit marker.
    pub operations_committed: usize,
    /// Operations without a commit marker, aborted or cut off by the crash.
    pub operations_discarded: usize,
}

/// Brings the page store up to date with the WAL.
///
/// Runs once at startup before any other access. The log is read twice from
/// the redo LSN of the latest checkpoint: the first pass collects committed
/// operations, the second redoes, in log order, every autonomous record and
/// every record of a committed operation. Records of operations without a
/// commit marker are skipped; operations cut off by the crash get an abort
/// marker so the log states their outcome.
///
/// Replay is strictly sequential. Records that copy from another page read
/// it in the state left by the records before them, which is the state it
/// had when the record was written.
///
/// Stops at the first record that cannot be applied and returns
/// `RecoveryFailed` with its LSN, page and type.
pub fn recover(store: &PageStore, wal: &WalManager) -> Result<RecoveryStats> {
    let checkpoint = wal.latest_checkpoint();
    let mut stats = RecoveryStats {
        checkpoint_lsn: checkpoint.map(|c| c.lsn),
        redo_lsn: checkpoint.map_or(Lsn::INVALID, |c| c.redo_lsn),
        ..Default::default()
    };
    info!(
        checkpoint_lsn = ?stats.checkpoint_lsn,
        redo_lsn = %stats.redo_lsn,
        "starting recovery"
    );

    // Analysis: which operations reached their commit marker.
    let mut begun = HashSet::new();
    let mut committed = HashSet::new();
    let mut aborted = HashSet::new();
    for record in wal.iterate(stats.redo_lsn)? {
        let record = record?;
        stats.records_scanned += 1;
        match record.record_type {
            RecordType::OperationBegin => {
                begun.insert(record.op_id);
            }
            RecordType::OperationCommit => {
                committed.insert(record.op_id);
            }
            RecordType::OperationAbort => {
                aborted.insert(record.op_id);
            }
            _ => {}
        }
    }
    stats.operations_committed = committed.len();
    debug!(
        records = stats.records_scanned,
        operations = begun.len(),
        committed = committed.len(),
        "analysis pass complete"
    );

    // Redo.
    for record in wal.iterate(stats.redo_lsn)? {
        let record = record?;
        if !record.record_type.is_delta() {
            continue;
        }
        if record.op_id != AUTONOMOUS_OP && !committed.contains(&record.op_id) {
            stats.records_discarded += 1;
            continue;
        }
        let applied = replay(store, &record).map_err(|e| TesseraError::RecoveryFailed {
            lsn: record.lsn.0,
            page_id: record.page_id,
            record_type: record.record_type.name().to_string(),
            source: Box::new(e),
        })?;
        if applied {
            stats.records_applied += 1;
        } else {
            stats.records_skipped += 1;
        }
    }

    let mut cut_off: Vec<u64> = begun
        .iter()
        .filter(|op_id| !committed.contains(*op_id) && !aborted.contains(*op_id))
        .copied()
        .collect();
    cut_off.sort_unstable();
    for op_id in &cut_off {
        wal.abort_operation(*op_id)?;
    }
    if !cut_off.is_empty() {
        warn!(
            operations = cut_off.len(),
            records = stats.records_discarded,
            "discarded operations without a commit marker"
        );
    }
    stats.end_lsn = wal.flush()?;
    stats.operations_discarded = begun.len() - begun.intersection(&committed).count();

    info!(
        applied = stats.records_applied,
        skipped = stats.records_skipped,
        discarded = stats.records_discarded,
        end_lsn = %stats.end_lsn,
        "recovery complete"
    );
    Ok(stats)
}

/// Redoes one delta record. Returns false if the page already reflected it.
fn replay(store: &PageStore, record: &WalRecord) -> Result<bool> {
    let delta = DeltaRecord::from_wal(record)?;
    let mut page = store.write_for_redo(record.page_id, delta.overwrites_page())?;
    delta.redo(record.lsn, record.page_id, &mut page[..], store)
}
