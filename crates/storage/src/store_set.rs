//! The storage set: every long-lived structure of one model version
//!
//! Groups the per-class stores, secondary indexes, inverse-reference maps,
//! and the two refcounted pools. The set is cheap to clone (all members are
//! shared); a schema update builds a modified copy and swaps it in together
//! with the new model.

use crate::class_store::ClassStore;
use crate::index::SecondaryIndex;
use crate::inverse::InverseRefMap;
use crate::refpool::RefPool;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use velox_core::limits::INDEX_CAPACITY_FACTOR;
use velox_core::{ClassId, DbError, IndexId, ObjectId, Result};
use velox_model::Model;

/// All storage structures of one model version.
#[derive(Debug, Clone)]
pub struct StoreSet {
    /// Per-class object heaps (concrete classes only).
    pub classes: FxHashMap<ClassId, Arc<ClassStore>>,
    /// Secondary indexes by id.
    pub indexes: FxHashMap<IndexId, Arc<SecondaryIndex>>,
    /// Inverse-reference maps keyed by target class.
    pub inverse: FxHashMap<ClassId, Arc<InverseRefMap>>,
    /// Interned string pool.
    pub strings: Arc<RefPool>,
    /// Blob pool (arrays, reference arrays).
    pub blobs: Arc<RefPool>,
}

impl StoreSet {
    /// Build the empty storage set for a model.
    pub fn for_model(model: &Model) -> Result<StoreSet> {
        let mut set = StoreSet {
            classes: FxHashMap::default(),
            indexes: FxHashMap::default(),
            inverse: FxHashMap::default(),
            strings: Arc::new(RefPool::new()),
            blobs: Arc::new(RefPool::new()),
        };
        for class in model.classes() {
            if !class.is_abstract {
                set.classes
                    .insert(class.id, Arc::new(ClassStore::new(Arc::clone(class))));
            }
            if class.inbound_refs.iter().any(|r| r.track_inverse) && !class.is_abstract {
                set.inverse.insert(class.id, Arc::new(InverseRefMap::new()));
            }
        }
        for desc in model.indexes() {
            let covered: Vec<_> = desc
                .classes
                .iter()
                .filter_map(|c| model.class(*c).cloned())
                .collect();
            let index = SecondaryIndex::new(Arc::clone(desc), &covered, 0)?;
            set.indexes.insert(desc.id, Arc::new(index));
        }
        Ok(set)
    }

    /// Estimated capacity for an index over the given classes:
    /// Σ live counts × 1.2.
    pub fn estimated_index_capacity(&self, classes: &[ClassId]) -> usize {
        let total: u64 = classes
            .iter()
            .filter_map(|c| self.classes.get(c))
            .map(|s| s.live_count())
            .sum();
        (total as f64 * INDEX_CAPACITY_FACTOR) as usize
    }

    /// Class store or `InvalidClass`.
    pub fn class(&self, id: ClassId) -> Result<&Arc<ClassStore>> {
        self.classes.get(&id).ok_or(DbError::InvalidClass { class: id })
    }

    /// Index by id.
    pub fn index(&self, id: IndexId) -> Option<&Arc<SecondaryIndex>> {
        self.indexes.get(&id)
    }

    /// Inverse-reference map holding edges into `target`.
    pub fn inverse_for(&self, target: ObjectId) -> Option<&Arc<InverseRefMap>> {
        self.inverse.get(&target.class_id())
    }

    /// Run a garbage-collection pass against the lowest active snapshot.
    /// Returns the number of reclaimed object records.
    pub fn gc(&self, floor: u64) -> usize {
        let mut reclaimed = 0;
        for store in self.classes.values() {
            reclaimed += store.gc(floor, &self.strings, &self.blobs);
        }
        for index in self.indexes.values() {
            index.gc(floor);
        }
        for map in self.inverse.values() {
            for partition in 0..map.partition_count() {
                map.compact(partition, floor);
            }
        }
        reclaimed
    }
}
