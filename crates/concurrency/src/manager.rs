//! Transaction manager: snapshots, conflict detection, atomic commit
//!
//! The manager owns the global commit version and drives the serializable
//! commit protocol:
//!
//! 1. Acquire the touched classes' lockers (shared side, ascending class
//!    order), which excludes concurrent structural change.
//! 2. Validate the read set: no object read may have a committed version
//!    in `(snapshot, now]`.
//! 3. Validate key / range / class-scan intents against the locker tables.
//! 4. Run integrity checks (references, delete actions, uniqueness)
//!    against the would-be-commit state.
//! 5. Allocate the next commit version, install new versions (per object a
//!    head-pointer swing), stamp index and inverse-map deltas, append one
//!    log record per write to the class's log partition, release locks.
//!
//! Version installation is serialized by an internal commit lock so that a
//! snapshot taken at version `v` always sees every effect of commits
//! `<= v`. A failed log append after installation surfaces as
//! `UnavailableCommitResult`: the outcome is installed but unconfirmed.

use crate::locker::LockerSet;
use crate::transaction::{
    hash_key, Transaction, TransactionKind, TransactionStatus, WriteKind, WriteOp,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use velox_core::limits::READER_SLOTS;
use velox_core::{ClassId, DbError, ObjectId, PropertyId, Result, TxSlot};
use velox_model::{ClassDesc, Model, Multiplicity};
use velox_storage::{IndexKey, ObjectReader, StoreSet};

/// Operation tag of a write-ahead-log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogOperation {
    /// Object created.
    Insert = 0,
    /// New version of an existing object.
    Update = 1,
    /// Object tombstoned.
    Delete = 2,
}

/// One write-ahead-log record, borrowed from the committing write.
#[derive(Debug)]
pub struct LogRecord<'a> {
    /// Commit version of the owning transaction.
    pub commit_version: u64,
    /// Class of the object.
    pub class: ClassId,
    /// Insert / update / delete.
    pub op: LogOperation,
    /// The object.
    pub id: ObjectId,
    /// Property payload in the class's current layout (empty for deletes).
    pub payload: &'a [u8],
}

/// Byte sink for committed log records, partitioned by each class's
/// log index. Implemented by the engine's log set.
pub trait CommitLog: Send + Sync {
    /// Append one record to a partition. An error means the record's fate
    /// is unknown to the engine.
    fn append(&self, log_index: u32, record: &LogRecord<'_>) -> Result<()>;
}

/// A [`CommitLog`] that drops every record (ephemeral databases, tests).
#[derive(Debug, Default)]
pub struct NullCommitLog;

impl CommitLog for NullCommitLog {
    fn append(&self, _log_index: u32, _record: &LogRecord<'_>) -> Result<()> {
        Ok(())
    }
}

/// Manages transaction lifecycle and atomic commits.
pub struct TransactionManager {
    /// Global commit version; every snapshot is a load of this counter.
    version: AtomicU64,
    next_tx_id: AtomicU64,
    /// Serializes validation + installation so published versions are
    /// always complete.
    commit_serial: Mutex<()>,
    /// Active transaction id → snapshot, for the GC floor.
    active: Mutex<FxHashMap<u64, u64>>,
}

impl TransactionManager {
    /// New manager starting at the given commit version.
    pub fn new(initial_version: u64) -> Self {
        TransactionManager {
            version: AtomicU64::new(initial_version),
            next_tx_id: AtomicU64::new(0),
            commit_serial: Mutex::new(()),
            active: Mutex::new(FxHashMap::default()),
        }
    }

    /// Current global commit version.
    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Begin a transaction at the current version.
    pub fn begin(&self, kind: TransactionKind, deadline: Option<DateTime<Utc>>) -> Transaction {
        let id = self.next_tx_id.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = self.current_version();
        self.active.lock().insert(id, snapshot);
        let slot = TxSlot((id % READER_SLOTS as u64) as u32);
        debug!(target: "velox::txn", tx = id, snapshot, "transaction started");
        Transaction::new(id, slot, kind, snapshot, deadline)
    }

    /// Number of active transactions.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Lowest snapshot any active transaction could read at; the garbage
    /// collection floor.
    pub fn lowest_active_snapshot(&self) -> u64 {
        let active = self.active.lock();
        active
            .values()
            .copied()
            .min()
            .unwrap_or_else(|| self.current_version())
    }

    fn finish(&self, tx_id: u64) {
        self.active.lock().remove(&tx_id);
    }

    /// Roll back a transaction: unlink pending creates, return buffered
    /// handles to the pools, mark aborted.
    pub fn rollback(&self, tx: &mut Transaction, stores: &StoreSet, reason: &str) {
        for op in tx.writes() {
            if let Some(handle) = op.insert_handle {
                if let Some(store) = stores.classes.get(&op.id.class_id()) {
                    store.rollback_insert(handle);
                }
            }
        }
        tx.release_buffers(&stores.strings, &stores.blobs);
        tx.status = TransactionStatus::Aborted {
            reason: reason.to_owned(),
        };
        self.finish(tx.id);
        debug!(target: "velox::txn", tx = tx.id, reason, "transaction rolled back");
    }

    fn abort_with(&self, tx: &mut Transaction, stores: &StoreSet, err: DbError) -> DbError {
        self.rollback(tx, stores, &err.to_string());
        err
    }

    /// Commit a transaction.
    ///
    /// `model_current` is re-checked under the commit locks: it must return
    /// false once a schema update has published a newer model, so that a
    /// transaction built against the old layout retries instead of
    /// installing stale bytes.
    ///
    /// Returns the assigned commit version. Read-only transactions commit
    /// at their snapshot without touching the global counter.
    pub fn commit(
        &self,
        tx: &mut Transaction,
        model: &Model,
        stores: &StoreSet,
        lockers: &LockerSet,
        log: &dyn CommitLog,
        model_current: &dyn Fn() -> bool,
    ) -> Result<u64> {
        if let Err(err) = tx.ensure_active() {
            if err == DbError::TransactionTimeout {
                return Err(self.abort_with(tx, stores, err));
            }
            return Err(err);
        }
        if tx.is_read_only() {
            let version = tx.snapshot;
            tx.status = TransactionStatus::Committed { version };
            self.finish(tx.id);
            return Ok(version);
        }

        // shared class lockers, ascending class order, exclude schema change
        let write_classes = tx.write_classes();
        let class_lockers: Vec<_> = write_classes.iter().map(|c| lockers.class(*c)).collect();
        let _class_guards: Vec<_> = class_lockers.iter().map(|l| l.read()).collect();

        let _serial = self.commit_serial.lock();

        if !model_current() {
            return Err(self.abort_with(tx, stores, DbError::Conflict));
        }

        if let Err(err) = self.validate(tx, model, stores, lockers) {
            return Err(self.abort_with(tx, stores, err));
        }

        let commit_version = self.current_version() + 1;
        let log_ok = self.install(tx, stores, lockers, log, commit_version);
        self.version.store(commit_version, Ordering::Release);

        tx.status = TransactionStatus::Committed {
            version: commit_version,
        };
        self.finish(tx.id);
        debug!(target: "velox::txn", tx = tx.id, commit_version, "transaction committed");

        if !log_ok {
            warn!(target: "velox::txn", tx = tx.id, commit_version,
                  "log append failed after installation");
            return Err(DbError::UnavailableCommitResult);
        }
        Ok(commit_version)
    }

    // ---- validation ----

    fn validate(
        &self,
        tx: &Transaction,
        model: &Model,
        stores: &StoreSet,
        lockers: &LockerSet,
    ) -> Result<()> {
        // integrity first: a write-write race on a unique key reports the
        // data error, not a generic conflict
        self.validate_integrity(tx, model, stores)?;
        self.validate_reads(tx, stores)?;
        self.validate_intents(tx, stores, lockers)?;
        Ok(())
    }

    /// No object read may have gained a committed version newer than the
    /// one observed.
    fn validate_reads(&self, tx: &Transaction, stores: &StoreSet) -> Result<()> {
        for (id, observed) in tx.reads() {
            if tx
                .write_for(*id)
                .map(|w| w.kind == WriteKind::Insert)
                .unwrap_or(false)
            {
                continue;
            }
            let current = stores
                .classes
                .get(&id.class_id())
                .and_then(|s| s.head_version(*id))
                .map(|(cv, _)| cv);
            if current != *observed {
                return Err(DbError::Conflict);
            }
        }
        Ok(())
    }

    /// Phantom protection for key, range, and class-scan reads.
    fn validate_intents(
        &self,
        tx: &Transaction,
        stores: &StoreSet,
        lockers: &LockerSet,
    ) -> Result<()> {
        for (index, key_hash) in tx.key_reads() {
            if lockers.keys.key_write_version(*index, *key_hash) > tx.snapshot {
                return Err(DbError::Conflict);
            }
        }
        for index in tx.range_reads() {
            if let Some(ix) = stores.index(*index) {
                if ix.last_write_version() > tx.snapshot {
                    return Err(DbError::Conflict);
                }
            }
        }
        for class in tx.class_reads() {
            if lockers.keys.class_write_version(*class) > tx.snapshot {
                return Err(DbError::Conflict);
            }
        }
        Ok(())
    }

    /// Reference integrity, delete re-checks, and uniqueness probes.
    fn validate_integrity(&self, tx: &Transaction, model: &Model, stores: &StoreSet) -> Result<()> {
        let mut tx_keys: FxHashMap<(velox_core::IndexId, IndexKey), ObjectId> =
            FxHashMap::default();
        for op in tx.writes() {
            match op.kind {
                WriteKind::Insert | WriteKind::Update => {
                    let data = op.data.as_ref().expect("write op carries data");
                    let desc = data.class();
                    self.check_references(tx, model, stores, op, desc)?;
                    self.check_uniqueness(stores, op, desc, &mut tx_keys)?;
                }
                WriteKind::Delete => {
                    if op.insert_handle.is_some() {
                        continue; // created and deleted in this transaction
                    }
                    if let Some(map) = stores.inverse_for(op.id) {
                        if map.has_inbound_after(op.id, tx.snapshot) {
                            return Err(DbError::Conflict);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn check_references(
        &self,
        tx: &Transaction,
        model: &Model,
        stores: &StoreSet,
        op: &WriteOp,
        desc: &Arc<ClassDesc>,
    ) -> Result<()> {
        let data = op.data.as_ref().expect("checked by caller");
        for (property, reference, targets) in reference_values(desc, data.bytes(), stores) {
            if reference.multiplicity == Multiplicity::One && targets.is_empty() {
                return Err(DbError::NullReferenceNotAllowed {
                    source_id: op.id,
                    property,
                });
            }
            for target in targets {
                let unknown = DbError::UnknownReference {
                    source_id: op.id,
                    property,
                    target,
                };
                if let Some(w) = tx.write_for(target) {
                    if w.kind == WriteKind::Delete {
                        return Err(unknown);
                    }
                } else {
                    let head = stores
                        .classes
                        .get(&target.class_id())
                        .and_then(|s| s.head_version(target));
                    match head {
                        None => return Err(unknown),
                        Some((cv, true)) => {
                            // deleted concurrently: retryable; deleted
                            // before our snapshot: a data error
                            if cv > tx.snapshot {
                                return Err(DbError::Conflict);
                            }
                            return Err(unknown);
                        }
                        Some((_, false)) => {}
                    }
                }
                if !model.is_instance_of(target.class_id(), reference.target_class) {
                    return Err(DbError::InvalidReferencedClass {
                        source_id: op.id,
                        property,
                        target,
                    });
                }
            }
        }
        Ok(())
    }

    fn check_uniqueness(
        &self,
        stores: &StoreSet,
        op: &WriteOp,
        desc: &Arc<ClassDesc>,
        tx_keys: &mut FxHashMap<(velox_core::IndexId, IndexKey), ObjectId>,
    ) -> Result<()> {
        let data = op.data.as_ref().expect("checked by caller");
        for ix_id in &desc.indexes {
            let Some(index) = stores.index(*ix_id) else {
                continue;
            };
            if !index.desc().is_unique {
                continue;
            }
            let Some(new_key) = index.key_for(desc.id, data.bytes(), &stores.strings) else {
                continue;
            };
            let old_key = match op.kind {
                WriteKind::Update => stores
                    .classes
                    .get(&desc.id)
                    .and_then(|s| s.head_view(op.id))
                    .filter(|head| !head.deleted && head.data.len() >= desc.record_size as usize)
                    .and_then(|head| index.key_for(desc.id, &head.data, &stores.strings)),
                _ => None,
            };
            if old_key.as_ref() == Some(&new_key) {
                continue;
            }
            if index.probe_live(&new_key, op.id).is_some() {
                return Err(DbError::UniquenessViolation { index: *ix_id });
            }
            if let Some(other) = tx_keys.insert((*ix_id, new_key), op.id) {
                if other != op.id {
                    return Err(DbError::UniquenessViolation { index: *ix_id });
                }
            }
        }
        Ok(())
    }

    // ---- installation ----

    /// Apply the write set at `commit_version`. Returns whether every log
    /// append succeeded.
    fn install(
        &self,
        tx: &mut Transaction,
        stores: &StoreSet,
        lockers: &LockerSet,
        log: &dyn CommitLog,
        commit_version: u64,
    ) -> bool {
        let slot_mask = tx.slot.mask();
        let mut log_ok = true;
        let mut append = |log_index: u32, record: LogRecord<'_>| {
            if log.append(log_index, &record).is_err() {
                log_ok = false;
            }
        };

        for op in tx.writes_mut() {
            let class_id = op.id.class_id();
            let Some(store) = stores.classes.get(&class_id) else {
                continue;
            };
            let desc = store.desc();
            match op.kind {
                WriteKind::Insert => {
                    let data = op.data.take().expect("insert carries data");
                    let bytes = data.into_bytes();
                    let handle = op.insert_handle.expect("insert has a pending record");
                    store.commit_insert(handle, Arc::clone(&bytes), commit_version);
                    index_insert(stores, lockers, &desc, op.id, &bytes, commit_version);
                    inverse_apply(stores, &desc, op.id, None, Some(bytes.as_ref()), commit_version);
                    append(
                        desc.log_index,
                        LogRecord {
                            commit_version,
                            class: class_id,
                            op: LogOperation::Insert,
                            id: op.id,
                            payload: &bytes,
                        },
                    );
                }
                WriteKind::Update => {
                    let data = op.data.take().expect("update carries data");
                    let bytes = data.into_bytes();
                    let old = store.head_view(op.id);
                    if let Some(old) = &old {
                        store.mark_read(old.handle, slot_mask);
                    }
                    store.install_version(op.id, Arc::clone(&bytes), false, commit_version);
                    let old_bytes = old.as_ref().map(|o| o.data.as_ref());
                    index_update(
                        stores,
                        lockers,
                        &desc,
                        op.id,
                        old_bytes,
                        &bytes,
                        commit_version,
                    );
                    inverse_apply(
                        stores,
                        &desc,
                        op.id,
                        old_bytes,
                        Some(bytes.as_ref()),
                        commit_version,
                    );
                    append(
                        desc.log_index,
                        LogRecord {
                            commit_version,
                            class: class_id,
                            op: LogOperation::Update,
                            id: op.id,
                            payload: &bytes,
                        },
                    );
                }
                WriteKind::Delete => {
                    if let Some(handle) = op.insert_handle {
                        // never visible to anyone; drop the pending record
                        store.rollback_insert(handle);
                        continue;
                    }
                    let old = store.head_view(op.id);
                    if let Some(old) = &old {
                        store.mark_read(old.handle, slot_mask);
                    }
                    let empty: Arc<[u8]> = Arc::from(Vec::new().into_boxed_slice());
                    store.install_version(op.id, empty, true, commit_version);
                    if let Some(old) = &old {
                        index_remove(stores, lockers, &desc, op.id, &old.data, commit_version);
                        inverse_apply(
                            stores,
                            &desc,
                            op.id,
                            Some(old.data.as_ref()),
                            None,
                            commit_version,
                        );
                    }
                    append(
                        desc.log_index,
                        LogRecord {
                            commit_version,
                            class: class_id,
                            op: LogOperation::Delete,
                            id: op.id,
                            payload: &[],
                        },
                    );
                }
            }
            lockers.keys.note_class_write(class_id, commit_version);
        }
        log_ok
    }
}

// ---- write-derived index and inverse maintenance ----

fn index_insert(
    stores: &StoreSet,
    lockers: &LockerSet,
    desc: &Arc<ClassDesc>,
    id: ObjectId,
    bytes: &[u8],
    commit_version: u64,
) {
    for ix_id in &desc.indexes {
        let Some(index) = stores.index(*ix_id) else {
            continue;
        };
        if let Some(key) = index.key_for(desc.id, bytes, &stores.strings) {
            lockers.keys.note_key_write(*ix_id, hash_key(&key), commit_version);
            index.insert(key, id, commit_version);
        }
    }
}

fn index_remove(
    stores: &StoreSet,
    lockers: &LockerSet,
    desc: &Arc<ClassDesc>,
    id: ObjectId,
    bytes: &[u8],
    commit_version: u64,
) {
    if bytes.len() < desc.record_size as usize {
        return;
    }
    for ix_id in &desc.indexes {
        let Some(index) = stores.index(*ix_id) else {
            continue;
        };
        if let Some(key) = index.key_for(desc.id, bytes, &stores.strings) {
            lockers.keys.note_key_write(*ix_id, hash_key(&key), commit_version);
            index.remove(&key, id, commit_version);
        }
    }
}

fn index_update(
    stores: &StoreSet,
    lockers: &LockerSet,
    desc: &Arc<ClassDesc>,
    id: ObjectId,
    old_bytes: Option<&[u8]>,
    new_bytes: &[u8],
    commit_version: u64,
) {
    for ix_id in &desc.indexes {
        let Some(index) = stores.index(*ix_id) else {
            continue;
        };
        let old_key = old_bytes
            .filter(|b| b.len() >= desc.record_size as usize)
            .and_then(|b| index.key_for(desc.id, b, &stores.strings));
        let new_key = index.key_for(desc.id, new_bytes, &stores.strings);
        if old_key == new_key {
            continue;
        }
        if let Some(old_key) = old_key {
            lockers
                .keys
                .note_key_write(*ix_id, hash_key(&old_key), commit_version);
            index.remove(&old_key, id, commit_version);
        }
        if let Some(new_key) = new_key {
            lockers
                .keys
                .note_key_write(*ix_id, hash_key(&new_key), commit_version);
            index.insert(new_key, id, commit_version);
        }
    }
}

/// Apply inverse-reference deltas derived from an object transition.
fn inverse_apply(
    stores: &StoreSet,
    desc: &Arc<ClassDesc>,
    id: ObjectId,
    old_bytes: Option<&[u8]>,
    new_bytes: Option<&[u8]>,
    commit_version: u64,
) {
    let old_refs: FxHashMap<(PropertyId, ObjectId), ()> = old_bytes
        .filter(|b| b.len() >= desc.record_size as usize)
        .map(|b| tracked_targets(desc, b, stores))
        .unwrap_or_default();
    let new_refs: FxHashMap<(PropertyId, ObjectId), ()> = new_bytes
        .map(|b| tracked_targets(desc, b, stores))
        .unwrap_or_default();

    for (property, target) in old_refs.keys().map(|(p, t)| (*p, *t)) {
        if !new_refs.contains_key(&(property, target)) {
            if let Some(map) = stores.inverse_for(target) {
                map.remove(target, id, property, commit_version);
            }
        }
    }
    for (property, target) in new_refs.keys().map(|(p, t)| (*p, *t)) {
        if !old_refs.contains_key(&(property, target)) {
            if let Some(map) = stores.inverse_for(target) {
                map.insert(target, id, property, commit_version);
            }
        }
    }
}

/// `(property, target)` pairs of every tracked, non-null reference held in
/// the record bytes.
fn tracked_targets(
    desc: &Arc<ClassDesc>,
    bytes: &[u8],
    stores: &StoreSet,
) -> FxHashMap<(PropertyId, ObjectId), ()> {
    let mut out = FxHashMap::default();
    for (property, reference, targets) in reference_values(desc, bytes, stores) {
        if !reference.track_inverse {
            continue;
        }
        for target in targets {
            out.insert((property, target), ());
        }
    }
    out
}

/// Every reference property of a record with its non-null target ids.
fn reference_values<'a>(
    desc: &'a Arc<ClassDesc>,
    bytes: &[u8],
    stores: &StoreSet,
) -> Vec<(PropertyId, &'a velox_model::ReferenceDesc, SmallVec<[ObjectId; 2]>)> {
    let reader = ObjectReader::new(ObjectId::NULL, 0, desc, bytes);
    let mut out = Vec::new();
    for (pos, prop) in desc.properties.iter().enumerate() {
        let Some(reference) = prop.reference() else {
            continue;
        };
        let offset = desc.offsets[pos] as usize;
        let mut targets = SmallVec::new();
        if reference.multiplicity == Multiplicity::Many {
            for raw in reader.get_long_array_optimized(offset, &stores.blobs) {
                let target = ObjectId::from_u64(raw as u64);
                if !target.is_null() {
                    targets.push(target);
                }
            }
        } else {
            let target = reader.reference_at(offset);
            if !target.is_null() {
                targets.push(target);
            }
        }
        out.push((prop.id, reference, targets));
    }
    out
}
