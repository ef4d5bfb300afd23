//! Generalized inverted index.
//!
//! This crate provides:
//! - Entry tree keyed by (column, key), with inline posting lists
//! - Posting trees for keys with many heap rows
//! - Compressed posting lists
//! - A pending list for batched fast-path inserts
//! - Serial and parallel builds
//! - Bitmap scans with tri-state consistency and partial matching
//! - Vacuum, structural verification and WAL redo

mod btree;
mod bulk;
mod datapage;
mod entrypage;
mod fast;
mod index;
mod insert;
mod state;
mod tuplesort;

pub mod bitmap;
pub mod build;
pub mod ginpage;
pub mod hooks;
pub mod meta;
pub mod opclass;
pub mod posting;
pub mod scan;
pub mod tid;
pub mod tuple;
pub mod vacuum;
pub mod verify;
pub mod xlog;

#[cfg(test)]
mod testutil;

pub use bitmap::{BitmapPage, TidBitmap};
pub use btree::{INTERNAL_SPLIT_INJECTION, LEAF_SPLIT_INJECTION};
pub use build::{BuildParams, BuildResult, HeapSource, MemHeap};
pub use hooks::{
    Hooks, InjectionCallback, InjectionPoints, InterruptCheck, NoPredicateLocks, PredicateLocker,
    RecordingPredicateLocker, TransactionContext,
};
pub use index::GinIndex;
pub use meta::{GinMetaPageData, GinStatistics};
pub use opclass::{
    ARRAY_CONTAINED, ARRAY_CONTAINS, ARRAY_EQUAL, ARRAY_OVERLAP, ArrayOps, OpClass, PREFIX_EQUAL,
    PREFIX_MATCH, PrefixOps,
};
pub use scan::{
    GinScan, PARTIAL_MATCH_RESTART_INJECTION, PARTIAL_MATCH_UNLATCHED_INJECTION, ScanKey,
};
pub use state::{EntryKey, GinState};
pub use tid::ItemPointer;
pub use vacuum::{VacuumInfo, VacuumStats};
pub use verify::VerifyReport;
