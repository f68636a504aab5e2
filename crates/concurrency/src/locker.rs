//! Locker layer
//!
//! Two kinds of locker protect the engine:
//! - [`ClassLocker`] guards a class against concurrent structural change.
//!   The read side is sharded by a stable per-thread core hint so commit
//!   traffic never contends; a schema update writer takes every shard.
//! - [`KeyReadLocker`] records last-writer commit versions per index key
//!   and per class, giving commit-time validation the state it needs to
//!   detect phantoms under key and class-range reads.

use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use velox_core::limits::POOL_SHARDS;
use velox_core::{ClassId, IndexId};

static NEXT_CORE_HINT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CORE_HINT: usize = NEXT_CORE_HINT.fetch_add(1, Ordering::Relaxed);
}

fn core_hint() -> usize {
    CORE_HINT.with(|h| *h)
}

/// Multi-reader / single-writer guard over one class's structure.
#[derive(Debug)]
pub struct ClassLocker {
    shards: Vec<RwLock<()>>,
}

impl Default for ClassLocker {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassLocker {
    /// New locker with per-core read shards.
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(POOL_SHARDS);
        for _ in 0..POOL_SHARDS {
            shards.push(RwLock::new(()));
        }
        ClassLocker { shards }
    }

    /// Shared guard on this thread's shard (commit path).
    pub fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.shards[core_hint() % self.shards.len()].read()
    }

    /// Exclusive guards over every shard (structural change).
    pub fn write_all(&self) -> Vec<RwLockWriteGuard<'_, ()>> {
        self.shards.iter().map(|s| s.write()).collect()
    }
}

/// Last-writer tables for phantom protection.
#[derive(Debug, Default)]
pub struct KeyReadLocker {
    keys: DashMap<(IndexId, u64), u64>,
    class_epochs: DashMap<ClassId, u64>,
}

impl KeyReadLocker {
    /// New empty locker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Note a committed write under an index key.
    pub fn note_key_write(&self, index: IndexId, key_hash: u64, commit_version: u64) {
        self.keys
            .entry((index, key_hash))
            .and_modify(|v| *v = (*v).max(commit_version))
            .or_insert(commit_version);
    }

    /// Last commit version that wrote under an index key.
    pub fn key_write_version(&self, index: IndexId, key_hash: u64) -> u64 {
        self.keys.get(&(index, key_hash)).map(|v| *v).unwrap_or(0)
    }

    /// Note a committed write of any object of a class.
    pub fn note_class_write(&self, class: ClassId, commit_version: u64) {
        self.class_epochs
            .entry(class)
            .and_modify(|v| *v = (*v).max(commit_version))
            .or_insert(commit_version);
    }

    /// Last commit version that wrote any object of a class.
    pub fn class_write_version(&self, class: ClassId) -> u64 {
        self.class_epochs.get(&class).map(|v| *v).unwrap_or(0)
    }

    /// Forget an index's key entries (index dropped).
    pub fn forget_index(&self, index: IndexId) {
        self.keys.retain(|(ix, _), _| *ix != index);
    }

    /// Forget a class's epoch (class dropped).
    pub fn forget_class(&self, class: ClassId) {
        self.class_epochs.remove(&class);
    }
}

/// The engine's locker registry.
#[derive(Debug, Default)]
pub struct LockerSet {
    classes: DashMap<ClassId, Arc<ClassLocker>>,
    /// Key and class-range read locking state.
    pub keys: KeyReadLocker,
}

impl LockerSet {
    /// New empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The locker of a class, created on first use.
    pub fn class(&self, id: ClassId) -> Arc<ClassLocker> {
        Arc::clone(
            &self
                .classes
                .entry(id)
                .or_insert_with(|| Arc::new(ClassLocker::new())),
        )
    }

    /// Drop a deleted class's locker.
    pub fn remove_class(&self, id: ClassId) {
        self.classes.remove(&id);
        self.keys.forget_class(id);
    }
}
