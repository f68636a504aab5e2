//! Inverse-reference map
//!
//! Reverse adjacency over tracked reference properties: for a target class,
//! `target object id → [(source id, property id)]`. Entries are versioned
//! with the writing transaction's commit version so they become visible
//! atomically with the source write, and carry a removal version instead of
//! being deleted eagerly (snapshots below the removal still see them).
//!
//! The map is range-partitioned by target id so schema-update jobs can walk
//! partitions in parallel.

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use velox_core::limits::POOL_SHARDS;
use velox_core::{ObjectId, PropertyId};

/// Removal stamp of an entry that is still live.
pub const LIVE: u64 = u64::MAX;

/// One inverse-reference edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvEntry {
    /// Object holding the reference.
    pub source: ObjectId,
    /// The reference property.
    pub property: PropertyId,
    /// Commit version that added the edge.
    pub added: u64,
    /// Commit version that removed it, or [`LIVE`].
    pub removed: u64,
}

type Partition = FxHashMap<ObjectId, SmallVec<[InvEntry; 4]>>;

/// Inverse-reference map for one target class.
#[derive(Debug)]
pub struct InverseRefMap {
    partitions: Vec<RwLock<Partition>>,
}

impl Default for InverseRefMap {
    fn default() -> Self {
        Self::new()
    }
}

impl InverseRefMap {
    /// Empty map.
    pub fn new() -> Self {
        let mut partitions = Vec::with_capacity(POOL_SHARDS);
        for _ in 0..POOL_SHARDS {
            partitions.push(RwLock::new(Partition::default()));
        }
        InverseRefMap { partitions }
    }

    /// Number of range partitions (for parallel jobs).
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn partition_of(&self, target: ObjectId) -> usize {
        (target.counter() as usize) % self.partitions.len()
    }

    /// Add an edge, visible from `commit_version` on.
    pub fn insert(
        &self,
        target: ObjectId,
        source: ObjectId,
        property: PropertyId,
        commit_version: u64,
    ) {
        let mut partition = self.partitions[self.partition_of(target)].write();
        partition.entry(target).or_default().push(InvEntry {
            source,
            property,
            added: commit_version,
            removed: LIVE,
        });
    }

    /// Mark the live edge `(source, property)` removed at `commit_version`.
    pub fn remove(
        &self,
        target: ObjectId,
        source: ObjectId,
        property: PropertyId,
        commit_version: u64,
    ) {
        let mut partition = self.partitions[self.partition_of(target)].write();
        if let Some(entries) = partition.get_mut(&target) {
            if let Some(entry) = entries
                .iter_mut()
                .find(|e| e.source == source && e.property == property && e.removed == LIVE)
            {
                entry.removed = commit_version;
            }
        }
    }

    /// Sources referencing `target` through `property`, as visible at
    /// `snapshot`.
    pub fn get_inverse(
        &self,
        target: ObjectId,
        property: PropertyId,
        snapshot: u64,
    ) -> Vec<ObjectId> {
        let partition = self.partitions[self.partition_of(target)].read();
        match partition.get(&target) {
            None => Vec::new(),
            Some(entries) => entries
                .iter()
                .filter(|e| e.property == property && e.added <= snapshot && e.removed > snapshot)
                .map(|e| e.source)
                .collect(),
        }
    }

    /// All live edges into `target` at `snapshot`, any property.
    pub fn all_inbound(&self, target: ObjectId, snapshot: u64) -> Vec<(ObjectId, PropertyId)> {
        let partition = self.partitions[self.partition_of(target)].read();
        match partition.get(&target) {
            None => Vec::new(),
            Some(entries) => entries
                .iter()
                .filter(|e| e.added <= snapshot && e.removed > snapshot)
                .map(|e| (e.source, e.property))
                .collect(),
        }
    }

    /// Whether any edge into `target` was added after `snapshot` and is
    /// still live (commit-time re-check for deletions).
    pub fn has_inbound_after(&self, target: ObjectId, snapshot: u64) -> bool {
        let partition = self.partitions[self.partition_of(target)].read();
        partition
            .get(&target)
            .map(|entries| {
                entries
                    .iter()
                    .any(|e| e.added > snapshot && e.removed == LIVE)
            })
            .unwrap_or(false)
    }

    /// Purge every edge of the given properties from one partition,
    /// regardless of visibility (schema delete / untrack / rebuild).
    pub fn delete_properties(&self, partition: usize, properties: &FxHashSet<PropertyId>) {
        let mut part = self.partitions[partition].write();
        for entries in part.values_mut() {
            entries.retain(|e| !properties.contains(&e.property));
        }
        part.retain(|_, entries| !entries.is_empty());
    }

    /// Purge edges whose source class is in `classes` from one partition
    /// (partially-deleted references).
    pub fn delete_source_classes(
        &self,
        partition: usize,
        property: PropertyId,
        classes: &FxHashSet<velox_core::ClassId>,
    ) {
        let mut part = self.partitions[partition].write();
        for entries in part.values_mut() {
            entries
                .retain(|e| e.property != property || !classes.contains(&e.source.class_id()));
        }
        part.retain(|_, entries| !entries.is_empty());
    }

    /// Drop dead edges no snapshot can see and shrink storage.
    pub fn compact(&self, partition: usize, floor: u64) {
        let mut part = self.partitions[partition].write();
        for entries in part.values_mut() {
            entries.retain(|e| e.removed == LIVE || e.removed > floor);
            entries.shrink_to_fit();
        }
        part.retain(|_, entries| !entries.is_empty());
    }

    /// Total number of edges (live and pending-removal), for tests.
    pub fn len(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.read().values().map(|e| e.len()).sum::<usize>())
            .sum()
    }

    /// Whether the map holds no edges.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
