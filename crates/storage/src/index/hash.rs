//! Hash index core
//!
//! A chained bucket structure keyed by [`IndexKey`], sized up front from
//! estimated object counts. Entries are versioned `(added, removed)` pairs
//! so visibility commutes with the owning write's commit version.

use crate::index::key::IndexKey;
use crate::index::{IndexEntry, ENTRY_LIVE};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use velox_core::{ClassId, ObjectId};

type Buckets = FxHashMap<IndexKey, SmallVec<[IndexEntry; 2]>>;

/// Point-lookup index structure.
#[derive(Debug)]
pub struct HashCore {
    buckets: RwLock<Buckets>,
}

impl HashCore {
    /// Empty core with capacity for `estimated` keys.
    pub fn with_capacity(estimated: usize) -> Self {
        HashCore {
            buckets: RwLock::new(FxHashMap::with_capacity_and_hasher(
                estimated,
                Default::default(),
            )),
        }
    }

    pub(crate) fn insert(&self, key: IndexKey, id: ObjectId, commit_version: u64) {
        self.buckets.write().entry(key).or_default().push(IndexEntry {
            id,
            added: commit_version,
            removed: ENTRY_LIVE,
        });
    }

    pub(crate) fn remove(&self, key: &IndexKey, id: ObjectId, commit_version: u64) {
        if let Some(entries) = self.buckets.write().get_mut(key) {
            if let Some(entry) = entries
                .iter_mut()
                .find(|e| e.id == id && e.removed == ENTRY_LIVE)
            {
                entry.removed = commit_version;
            }
        }
    }

    pub(crate) fn lookup(&self, key: &IndexKey, snapshot: u64) -> Vec<ObjectId> {
        match self.buckets.read().get(key) {
            None => Vec::new(),
            Some(entries) => entries
                .iter()
                .filter(|e| e.added <= snapshot && e.removed > snapshot)
                .map(|e| e.id)
                .collect(),
        }
    }

    /// A live entry under `key` with an id other than `exclude`, if any.
    pub(crate) fn probe_live(&self, key: &IndexKey, exclude: ObjectId) -> Option<ObjectId> {
        self.buckets.read().get(key).and_then(|entries| {
            entries
                .iter()
                .find(|e| e.removed == ENTRY_LIVE && e.id != exclude)
                .map(|e| e.id)
        })
    }

    pub(crate) fn has_duplicate_live_key(&self) -> bool {
        self.buckets.read().values().any(|entries| {
            let mut first: Option<ObjectId> = None;
            for entry in entries.iter().filter(|e| e.removed == ENTRY_LIVE) {
                match first {
                    None => first = Some(entry.id),
                    Some(id) if id != entry.id => return true,
                    Some(_) => {}
                }
            }
            false
        })
    }

    pub(crate) fn purge_classes(&self, classes: &FxHashSet<ClassId>) {
        let mut buckets = self.buckets.write();
        for entries in buckets.values_mut() {
            entries.retain(|e| !classes.contains(&e.id.class_id()));
        }
        buckets.retain(|_, entries| !entries.is_empty());
    }

    pub(crate) fn gc(&self, floor: u64) {
        let mut buckets = self.buckets.write();
        for entries in buckets.values_mut() {
            entries.retain(|e| e.removed == ENTRY_LIVE || e.removed > floor);
        }
        buckets.retain(|_, entries| !entries.is_empty());
    }

    pub(crate) fn clear(&self) {
        self.buckets.write().clear();
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.buckets.read().values().map(|e| e.len()).sum()
    }
}
