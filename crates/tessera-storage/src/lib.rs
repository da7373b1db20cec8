//! Storage engine for Tessera.
//!
//! This crate provides:
//! - Disk manager for segment files
//! - Page layouts for tree, meta and free-list pages
//! - Delta records describing page changes and their redo
//! - Page store combining the buffer pool, WAL and page allocation
//! - B+ tree index built from logged operations
//! - Crash recovery and checkpoints

mod btree;
mod checkpoint;
mod delta;
mod disk;
mod layout;
mod recovery;
mod store;

pub use btree::{BPlusTree, FixedBytes, KeyLayout, Operation, TreeOptions, U64Keys};
pub use checkpoint::{CheckpointStats, Checkpointer};
pub use delta::{DeltaRecord, PageSource};
pub use disk::{DiskManager, DiskManagerConfig};
pub use layout::{FreePage, MetaPage, TreePage};
pub use recovery::{recover, RecoveryStats};
pub use store::PageStore;
