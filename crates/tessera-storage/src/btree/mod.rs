//! B+ tree index over logged pages.
//!
//! Tree pages hold fixed-size items in sorted order:
//!
//! ```text
//! leaf:  [header][forward][key|value][key|value]...
//! inner: [header][forward][child_0][key_0|child_1][key_1|child_2]...
//! ```
//!
//! Separator `key_i` is the smallest key reachable through `child_{i+1}`.
//! Leaves are chained left to right through their forward links.
//!
//! Key comparison lives in [`KeyLayout`]; the delta records underneath work
//! on byte offsets and never see a key type.

mod key;
mod operation;
mod tree;

pub use key::{FixedBytes, KeyLayout, U64Keys};
pub use operation::Operation;
pub use tree::{BPlusTree, TreeOptions};
