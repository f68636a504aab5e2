//! Garbage collection
//!
//! Object records are never freed while a snapshot that could see them is
//! alive. The collector derives its floor from the lowest active snapshot
//! and prunes version chains, index entries, and inverse-reference edges
//! below it; string/blob refcounts of reclaimed versions are released at
//! this point, not at delete time.

use crate::manager::TransactionManager;
use tracing::debug;
use velox_storage::StoreSet;

/// Result of one collection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    /// The floor snapshot the pass ran against.
    pub floor: u64,
    /// Object records reclaimed.
    pub reclaimed_records: usize,
}

/// Floor-driven garbage collector.
#[derive(Debug, Default)]
pub struct GarbageCollector;

impl GarbageCollector {
    /// New collector.
    pub fn new() -> Self {
        GarbageCollector
    }

    /// Run one pass over every structure in the store set.
    pub fn collect(&self, manager: &TransactionManager, stores: &StoreSet) -> GcStats {
        let floor = manager.lowest_active_snapshot();
        let reclaimed_records = stores.gc(floor);
        debug!(target: "velox::gc", floor, reclaimed_records, "collection pass finished");
        GcStats {
            floor,
            reclaimed_records,
        }
    }
}
