//! Secondary indexes
//!
//! Hash and sorted indexes share one contract, parameterised by a key
//! comparator derived from the index descriptor and the covered classes'
//! property offsets. Entries are versioned with the writing transaction's
//! commit version; uniqueness is probed against live entries under the
//! commit locks.
//!
//! An index can be atomically marked empty and *pending refill* during an
//! alignment-mode schema update; readers then fall back to a filtered base
//! scan until asynchronous population completes.

pub mod hash;
pub mod key;
pub mod sorted;

pub use key::{key_from_values, IndexKey, KeyExtractor, KeyValue};
pub use sorted::ScanDirection;

use hash::HashCore;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use sorted::SortedCore;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use velox_core::{ClassId, DbError, ObjectId, PropertyValue, Result};
use velox_model::{ClassDesc, IndexDesc, IndexKind};

/// Removal stamp of an index entry that is still live.
pub const ENTRY_LIVE: u64 = u64::MAX;

/// One versioned index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// The indexed object.
    pub id: ObjectId,
    /// Commit version that added the entry.
    pub added: u64,
    /// Commit version that removed it, or [`ENTRY_LIVE`].
    pub removed: u64,
}

#[derive(Debug)]
enum Core {
    Hash(HashCore),
    Sorted(SortedCore),
}

/// A secondary index over one or more classes.
#[derive(Debug)]
pub struct SecondaryIndex {
    desc: RwLock<Arc<IndexDesc>>,
    extractors: RwLock<FxHashMap<ClassId, Arc<KeyExtractor>>>,
    core: Core,
    pending_refill: AtomicBool,
    /// Commit version of the last structural write, for phantom checks on
    /// range reads.
    last_write: AtomicU64,
}

impl SecondaryIndex {
    /// Build an index for its descriptor over the given class descriptors,
    /// sized for `estimated` entries.
    pub fn new(
        desc: Arc<IndexDesc>,
        classes: &[Arc<ClassDesc>],
        estimated: usize,
    ) -> Result<Self> {
        let core = match desc.kind {
            IndexKind::Hash => Core::Hash(HashCore::with_capacity(estimated)),
            IndexKind::Sorted => Core::Sorted(SortedCore::new(&desc.sort_directions)),
        };
        let index = SecondaryIndex {
            desc: RwLock::new(Arc::clone(&desc)),
            extractors: RwLock::new(FxHashMap::default()),
            core,
            pending_refill: AtomicBool::new(false),
            last_write: AtomicU64::new(0),
        };
        for class in classes {
            index.add_class(class)?;
        }
        Ok(index)
    }

    /// The active descriptor.
    pub fn desc(&self) -> Arc<IndexDesc> {
        Arc::clone(&self.desc.read())
    }

    /// Swap the descriptor (in-place index update at schema commit).
    pub fn set_desc(&self, desc: Arc<IndexDesc>) {
        *self.desc.write() = desc;
    }

    /// Derive and register the key extractor for a newly covered class.
    pub fn add_class(&self, class: &Arc<ClassDesc>) -> Result<()> {
        let desc = self.desc();
        let extractor = KeyExtractor::new(&desc, class).ok_or_else(|| DbError::InvalidModel {
            reason: format!(
                "class {} cannot produce keys for index {}",
                class.id.as_u16(),
                desc.id.as_u16()
            ),
        })?;
        self.extractors.write().insert(class.id, Arc::new(extractor));
        Ok(())
    }

    /// Drop a class's extractor (its entries are purged separately).
    pub fn remove_class(&self, class: ClassId) {
        self.extractors.write().remove(&class);
    }

    /// Whether the index covers objects of `class`.
    pub fn covers_class(&self, class: ClassId) -> bool {
        self.extractors.read().contains_key(&class)
    }

    /// Extract the key an object of `class` contributes, if covered.
    pub fn key_for(
        &self,
        class: ClassId,
        data: &[u8],
        strings: &crate::refpool::RefPool,
    ) -> Option<IndexKey> {
        let extractor = self.extractors.read().get(&class).cloned()?;
        Some(extractor.extract(data, strings))
    }

    /// Build a lookup key from caller values under this index's case rule.
    pub fn lookup_key(&self, values: &[PropertyValue]) -> Result<IndexKey> {
        let desc = self.desc();
        if values.len() != desc.key_properties.len() {
            return Err(DbError::NotApplicable);
        }
        key_from_values(values, desc.string_compare.case_sensitive)
    }

    /// Insert an entry visible from `commit_version` on.
    pub fn insert(&self, key: IndexKey, id: ObjectId, commit_version: u64) {
        self.last_write.fetch_max(commit_version, Ordering::Release);
        match &self.core {
            Core::Hash(core) => core.insert(key, id, commit_version),
            Core::Sorted(core) => core.insert(key, id, commit_version),
        }
    }

    /// Mark an entry removed from `commit_version` on.
    pub fn remove(&self, key: &IndexKey, id: ObjectId, commit_version: u64) {
        self.last_write.fetch_max(commit_version, Ordering::Release);
        match &self.core {
            Core::Hash(core) => core.remove(key, id, commit_version),
            Core::Sorted(core) => core.remove(key, id, commit_version),
        }
    }

    /// Ids under `key` visible at `snapshot`.
    pub fn lookup(&self, key: &IndexKey, snapshot: u64) -> Vec<ObjectId> {
        match &self.core {
            Core::Hash(core) => core.lookup(key, snapshot),
            Core::Sorted(core) => core.lookup(key, snapshot),
        }
    }

    /// Sole id under `key` at `snapshot`, for unique indexes.
    pub fn lookup_unique(&self, key: &IndexKey, snapshot: u64) -> Option<ObjectId> {
        self.lookup(key, snapshot).into_iter().next()
    }

    /// A live entry colliding with `key` other than `exclude`; used for
    /// uniqueness probes at commit.
    pub fn probe_live(&self, key: &IndexKey, exclude: ObjectId) -> Option<ObjectId> {
        match &self.core {
            Core::Hash(core) => core.probe_live(key, exclude),
            Core::Sorted(core) => core.probe_live(key, exclude),
        }
    }

    /// Range scan (sorted only).
    pub fn range(
        &self,
        low: Option<&IndexKey>,
        high: Option<&IndexKey>,
        direction: ScanDirection,
        snapshot: u64,
    ) -> Result<Vec<ObjectId>> {
        match &self.core {
            Core::Hash(_) => Err(DbError::NotApplicable),
            Core::Sorted(core) => Ok(core.range(low, high, direction, snapshot)),
        }
    }

    /// Verify no key holds two live distinct ids; used when an index
    /// becomes unique.
    pub fn check_uniqueness(&self) -> Result<()> {
        let duplicate = match &self.core {
            Core::Hash(core) => core.has_duplicate_live_key(),
            Core::Sorted(core) => core.has_duplicate_live_key(),
        };
        if duplicate {
            Err(DbError::UniquenessViolation {
                index: self.desc().id,
            })
        } else {
            Ok(())
        }
    }

    /// Drop all entries of the given classes (class deletion / uncovering).
    pub fn purge_classes(&self, classes: &FxHashSet<ClassId>) {
        match &self.core {
            Core::Hash(core) => core.purge_classes(classes),
            Core::Sorted(core) => core.purge_classes(classes),
        }
    }

    /// Atomically mark the index empty and refilling; queries fall back to
    /// a filtered base scan until [`SecondaryIndex::finish_refill`].
    pub fn prepare_for_pending_refill(&self) {
        match &self.core {
            Core::Hash(core) => core.clear(),
            Core::Sorted(core) => core.clear(),
        }
        self.pending_refill.store(true, Ordering::Release);
    }

    /// Population completed; queries use the index again.
    pub fn finish_refill(&self) {
        self.pending_refill.store(false, Ordering::Release);
    }

    /// Whether queries must fall back to a base scan.
    pub fn is_pending_refill(&self) -> bool {
        self.pending_refill.load(Ordering::Acquire)
    }

    /// Commit version of the last structural write.
    pub fn last_write_version(&self) -> u64 {
        self.last_write.load(Ordering::Acquire)
    }

    /// Drop dead entries no snapshot can see.
    pub fn gc(&self, floor: u64) {
        match &self.core {
            Core::Hash(core) => core.gc(floor),
            Core::Sorted(core) => core.gc(floor),
        }
    }

    /// Total entries, live and pending-removal (tests).
    pub fn entry_count(&self) -> usize {
        match &self.core {
            Core::Hash(core) => core.entry_count(),
            Core::Sorted(core) => core.entry_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refpool::RefPool;
    use velox_core::{PropertyId, PropertyType};
    use velox_model::{
        IndexKind, PropertyDesc, PropertyKind, SortDirection, StringCompare,
    };

    fn person_class() -> Arc<ClassDesc> {
        Arc::new(ClassDesc::new(
            ClassId(1),
            "Person".into(),
            None,
            false,
            0,
            None,
            vec![
                PropertyDesc {
                    id: PropertyId(10),
                    name: "user_name".into(),
                    kind: PropertyKind::Simple(PropertyType::String),
                    default: None,
                },
                PropertyDesc {
                    id: PropertyId(11),
                    name: "age".into(),
                    kind: PropertyKind::Simple(PropertyType::Int),
                    default: None,
                },
            ],
        ))
    }

    fn hash_desc(unique: bool) -> Arc<IndexDesc> {
        Arc::new(IndexDesc {
            id: velox_core::IndexId(1),
            name: "person_name".into(),
            kind: IndexKind::Hash,
            key_properties: vec![PropertyId(10)],
            sort_directions: vec![SortDirection::Ascending],
            is_unique: unique,
            string_compare: StringCompare::default(),
            classes: vec![ClassId(1)],
        })
    }

    fn sorted_desc() -> Arc<IndexDesc> {
        Arc::new(IndexDesc {
            id: velox_core::IndexId(2),
            name: "person_age".into(),
            kind: IndexKind::Sorted,
            key_properties: vec![PropertyId(11)],
            sort_directions: vec![SortDirection::Ascending],
            is_unique: false,
            string_compare: StringCompare::default(),
            classes: vec![ClassId(1)],
        })
    }

    fn key(s: &str) -> IndexKey {
        key_from_values(&[PropertyValue::String(Some(s.into()))], true).unwrap()
    }

    fn int_key(v: i32) -> IndexKey {
        key_from_values(&[PropertyValue::Int(v)], true).unwrap()
    }

    fn oid(counter: u64) -> ObjectId {
        ObjectId::new(ClassId(1), counter)
    }

    #[test]
    fn test_versioned_visibility() {
        let index = SecondaryIndex::new(hash_desc(true), &[person_class()], 16).unwrap();
        index.insert(key("john"), oid(1), 50);
        assert!(index.lookup(&key("john"), 49).is_empty());
        assert_eq!(index.lookup_unique(&key("john"), 50), Some(oid(1)));
        index.remove(&key("john"), oid(1), 70);
        assert_eq!(index.lookup_unique(&key("john"), 60), Some(oid(1)));
        assert_eq!(index.lookup_unique(&key("john"), 70), None);
    }

    #[test]
    fn test_probe_live_for_uniqueness() {
        let index = SecondaryIndex::new(hash_desc(true), &[person_class()], 16).unwrap();
        index.insert(key("john"), oid(1), 50);
        assert_eq!(index.probe_live(&key("john"), oid(2)), Some(oid(1)));
        assert_eq!(index.probe_live(&key("john"), oid(1)), None);
        index.remove(&key("john"), oid(1), 60);
        assert_eq!(index.probe_live(&key("john"), oid(2)), None);
    }

    #[test]
    fn test_key_extraction_from_record() {
        let strings = RefPool::new();
        let class = person_class();
        let index = SecondaryIndex::new(hash_desc(true), &[Arc::clone(&class)], 16).unwrap();
        let handle = strings.acquire(b"john", true);
        let mut data = vec![0u8; class.record_size as usize];
        data[..8].copy_from_slice(&handle.to_le_bytes());
        let extracted = index.key_for(ClassId(1), &data, &strings).unwrap();
        assert_eq!(extracted, key("john"));
        assert!(index.key_for(ClassId(9), &data, &strings).is_none());
    }

    #[test]
    fn test_sorted_range_directions() {
        let index = SecondaryIndex::new(sorted_desc(), &[person_class()], 16).unwrap();
        for (i, age) in [30, 10, 20].into_iter().enumerate() {
            index.insert(int_key(age), oid(i as u64 + 1), 5);
        }
        let forward = index
            .range(None, None, ScanDirection::Forward, 99)
            .unwrap();
        assert_eq!(forward, vec![oid(2), oid(3), oid(1)]);
        let reverse = index
            .range(None, None, ScanDirection::Reverse, 99)
            .unwrap();
        assert_eq!(reverse, vec![oid(1), oid(3), oid(2)]);
        let bounded = index
            .range(
                Some(&int_key(10)),
                Some(&int_key(20)),
                ScanDirection::Forward,
                99,
            )
            .unwrap();
        assert_eq!(bounded, vec![oid(2), oid(3)]);
    }

    #[test]
    fn test_range_on_hash_not_applicable() {
        let index = SecondaryIndex::new(hash_desc(false), &[person_class()], 16).unwrap();
        let err = index
            .range(None, None, ScanDirection::Forward, 1)
            .unwrap_err();
        assert_eq!(err, DbError::NotApplicable);
    }

    #[test]
    fn test_check_uniqueness() {
        let index = SecondaryIndex::new(hash_desc(false), &[person_class()], 16).unwrap();
        index.insert(key("dup"), oid(1), 5);
        index.insert(key("dup"), oid(2), 6);
        assert!(matches!(
            index.check_uniqueness(),
            Err(DbError::UniquenessViolation { .. })
        ));
        index.remove(&key("dup"), oid(2), 7);
        assert!(index.check_uniqueness().is_ok());
    }

    #[test]
    fn test_pending_refill_cycle() {
        let index = SecondaryIndex::new(hash_desc(true), &[person_class()], 16).unwrap();
        index.insert(key("john"), oid(1), 5);
        index.prepare_for_pending_refill();
        assert!(index.is_pending_refill());
        assert_eq!(index.entry_count(), 0);
        index.insert(key("john"), oid(1), 5);
        index.finish_refill();
        assert!(!index.is_pending_refill());
        assert_eq!(index.lookup_unique(&key("john"), 9), Some(oid(1)));
    }

    #[test]
    fn test_purge_classes_and_gc() {
        let index = SecondaryIndex::new(hash_desc(false), &[person_class()], 16).unwrap();
        index.insert(key("a"), oid(1), 5);
        index.insert(key("b"), oid(2), 5);
        index.remove(&key("a"), oid(1), 8);
        index.gc(10);
        assert_eq!(index.entry_count(), 1);
        let classes: FxHashSet<ClassId> = [ClassId(1)].into_iter().collect();
        index.purge_classes(&classes);
        assert_eq!(index.entry_count(), 0);
    }
}
