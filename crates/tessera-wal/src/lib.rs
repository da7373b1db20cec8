//! Write-Ahead Log (WAL) for Tessera.
//!
//! Every page mutation is logged as a delta record before it is considered
//! durable. Records are appended in strict sequence order, grouped by
//! operation boundary markers, and read back through a lazy cursor during
//! crash recovery.

pub mod constants;
pub mod reader;
pub mod record;
pub mod segment;
pub mod writer;

pub use reader::WalIterator;
pub use record::{Lsn, RecordType, WalRecord, AUTONOMOUS_OP};
pub use segment::{LogSegment, LogSegmentId};
pub use writer::{CheckpointInfo, WalConfig, WalManager};
