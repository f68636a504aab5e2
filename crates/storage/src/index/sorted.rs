//! Sorted index core
//!
//! An ordered map over directed keys: per-field sort directions from the
//! index descriptor are applied inside the comparator, so forward iteration
//! of the map is the index's declared order and reverse iteration its
//! mirror. Point operations are logarithmic; ranges iterate either
//! direction.

use crate::index::key::{IndexKey, KeyValue};
use crate::index::{IndexEntry, ENTRY_LIVE};
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use velox_core::{ClassId, ObjectId};
use velox_model::SortDirection;

/// Direction of a range scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    /// The index's declared order.
    Forward,
    /// Its mirror.
    Reverse,
}

/// An [`IndexKey`] ordered under the index's sort directions.
#[derive(Debug, Clone)]
struct DirectedKey {
    key: IndexKey,
    dirs: Arc<[SortDirection]>,
}

impl DirectedKey {
    fn cmp_fields(&self, other: &Self) -> Ordering {
        let a = &self.key.0;
        let b = &other.key.0;
        for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            let natural = x.cmp(y);
            let directed = match self.dirs.get(i) {
                Some(SortDirection::Descending) => natural.reverse(),
                _ => natural,
            };
            if directed != Ordering::Equal {
                return directed;
            }
        }
        // shorter keys (range-bound prefixes) sort before their extensions
        a.len().cmp(&b.len())
    }
}

impl PartialEq for DirectedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_fields(other) == Ordering::Equal
    }
}

impl Eq for DirectedKey {}

impl PartialOrd for DirectedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp_fields(other))
    }
}

impl Ord for DirectedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_fields(other)
    }
}

type Tree = BTreeMap<DirectedKey, SmallVec<[IndexEntry; 2]>>;

/// Ordered index structure.
#[derive(Debug)]
pub struct SortedCore {
    tree: RwLock<Tree>,
    dirs: Arc<[SortDirection]>,
}

impl SortedCore {
    /// Empty core ordering keys under `dirs`.
    pub fn new(dirs: &[SortDirection]) -> Self {
        SortedCore {
            tree: RwLock::new(BTreeMap::new()),
            dirs: Arc::from(dirs),
        }
    }

    fn directed(&self, key: IndexKey) -> DirectedKey {
        DirectedKey {
            key,
            dirs: Arc::clone(&self.dirs),
        }
    }

    pub(crate) fn insert(&self, key: IndexKey, id: ObjectId, commit_version: u64) {
        self.tree
            .write()
            .entry(self.directed(key))
            .or_default()
            .push(IndexEntry {
                id,
                added: commit_version,
                removed: ENTRY_LIVE,
            });
    }

    pub(crate) fn remove(&self, key: &IndexKey, id: ObjectId, commit_version: u64) {
        if let Some(entries) = self.tree.write().get_mut(&self.directed(key.clone())) {
            if let Some(entry) = entries
                .iter_mut()
                .find(|e| e.id == id && e.removed == ENTRY_LIVE)
            {
                entry.removed = commit_version;
            }
        }
    }

    pub(crate) fn lookup(&self, key: &IndexKey, snapshot: u64) -> Vec<ObjectId> {
        match self.tree.read().get(&self.directed(key.clone())) {
            None => Vec::new(),
            Some(entries) => entries
                .iter()
                .filter(|e| e.added <= snapshot && e.removed > snapshot)
                .map(|e| e.id)
                .collect(),
        }
    }

    pub(crate) fn probe_live(&self, key: &IndexKey, exclude: ObjectId) -> Option<ObjectId> {
        self.tree
            .read()
            .get(&self.directed(key.clone()))
            .and_then(|entries| {
                entries
                    .iter()
                    .find(|e| e.removed == ENTRY_LIVE && e.id != exclude)
                    .map(|e| e.id)
            })
    }

    /// Range scan between optional bounds (inclusive), in `direction`.
    pub(crate) fn range(
        &self,
        low: Option<&IndexKey>,
        high: Option<&IndexKey>,
        direction: ScanDirection,
        snapshot: u64,
    ) -> Vec<ObjectId> {
        let tree = self.tree.read();
        let low_bound = match low {
            None => Bound::Unbounded,
            Some(k) => Bound::Included(self.directed(k.clone())),
        };
        let high_bound = match high {
            None => Bound::Unbounded,
            Some(k) => {
                // include every extension of a prefix bound
                let mut extended = k.clone();
                extended.0.push(KeyValue::Str(String::from("\u{10FFFF}")));
                Bound::Included(self.directed(extended))
            }
        };
        let visible = |entries: &SmallVec<[IndexEntry; 2]>| -> Vec<ObjectId> {
            entries
                .iter()
                .filter(|e| e.added <= snapshot && e.removed > snapshot)
                .map(|e| e.id)
                .collect()
        };
        let mut out = Vec::new();
        match direction {
            ScanDirection::Forward => {
                for (_, entries) in tree.range((low_bound, high_bound)) {
                    out.extend(visible(entries));
                }
            }
            ScanDirection::Reverse => {
                for (_, entries) in tree.range((low_bound, high_bound)).rev() {
                    out.extend(visible(entries));
                }
            }
        }
        out
    }

    pub(crate) fn has_duplicate_live_key(&self) -> bool {
        self.tree.read().values().any(|entries| {
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
        let mut tree = self.tree.write();
        for entries in tree.values_mut() {
            entries.retain(|e| !classes.contains(&e.id.class_id()));
        }
        tree.retain(|_, entries| !entries.is_empty());
    }

    pub(crate) fn gc(&self, floor: u64) {
        let mut tree = self.tree.write();
        for entries in tree.values_mut() {
            entries.retain(|e| e.removed == ENTRY_LIVE || e.removed > floor);
        }
        tree.retain(|_, entries| !entries.is_empty());
    }

    pub(crate) fn clear(&self) {
        self.tree.write().clear();
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.tree.read().values().map(|e| e.len()).sum()
    }
}
