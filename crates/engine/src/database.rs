//! Database facade
//!
//! Owns the compiled model, the storage set, the transaction manager, the
//! locker registry, the partitioned log, and the worker pool. Stored
//! procedures receive a [`TxHandle`] exposing exactly: `create`, `get`,
//! `get_all`, `get_hash_index`, `apply_changes`, `rollback` (plus the
//! property setter and delete the object model compiles down to).
//!
//! [`Database::transaction`] wraps a closure with automatic retry: band-3
//! errors back off exponentially (capped at 200 ms); a panic in the
//! closure rolls back and surfaces as "unknown error".

use crate::wal::LogSet;
use crate::workers::WorkerPool;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, info};
use velox_concurrency::{
    GarbageCollector, GcStats, LockerSet, Transaction, TransactionKind, TransactionManager,
    WriteKind,
};
use velox_core::limits::{MAX_RETRIES, RETRY_BACKOFF_CAP, RETRY_BACKOFF_INITIAL};
use velox_core::{ClassId, DbError, IndexId, ObjectId, PropertyId, PropertyValue, Result};
use velox_model::{ClassDesc, IndexKind, Model, ModelScheme, Multiplicity};
use velox_storage::{ObjectData, ObjectReader, RefPool, SecondaryIndex, StoreSet};

/// The in-memory transactional object database.
pub struct Database {
    pub(crate) model: RwLock<Arc<Model>>,
    pub(crate) stores: RwLock<StoreSet>,
    pub(crate) manager: TransactionManager,
    pub(crate) lockers: LockerSet,
    pub(crate) log: LogSet,
    pub(crate) gc: GarbageCollector,
    pub(crate) pool: WorkerPool,
}

impl Database {
    /// Open a database on an ingested model, logging to `log`.
    pub fn open(scheme: &ModelScheme, log: LogSet) -> Result<Database> {
        let model = Arc::new(Model::from_scheme(scheme, 1)?);
        let stores = StoreSet::for_model(&model)?;
        log.ensure_partitions(model.log_partitions());
        info!(target: "velox::db", version = model.version, "database opened");
        Ok(Database {
            model: RwLock::new(model),
            stores: RwLock::new(stores),
            manager: TransactionManager::new(0),
            lockers: LockerSet::new(),
            log,
            gc: GarbageCollector::new(),
            pool: WorkerPool::with_default_size(),
        })
    }

    /// Open an ephemeral database with an in-memory log.
    pub fn in_memory(scheme: &ModelScheme) -> Result<Database> {
        Self::open(scheme, LogSet::in_memory())
    }

    /// The active model.
    pub fn model(&self) -> Arc<Model> {
        Arc::clone(&self.model.read())
    }

    /// Snapshot of the storage set (cheap; members are shared).
    pub fn stores(&self) -> StoreSet {
        self.stores.read().clone()
    }

    /// Current global commit version.
    pub fn current_version(&self) -> u64 {
        self.manager.current_version()
    }

    /// Begin a transaction; the caller drives commit or rollback.
    pub fn begin(&self, kind: TransactionKind) -> TxHandle<'_> {
        self.begin_with_deadline(kind, None)
    }

    /// Begin a transaction carrying a deadline from the request budget.
    pub fn begin_with_deadline(
        &self,
        kind: TransactionKind,
        deadline: Option<DateTime<Utc>>,
    ) -> TxHandle<'_> {
        TxHandle {
            model: self.model(),
            stores: self.stores(),
            tx: self.manager.begin(kind, deadline),
            db: self,
            finished: false,
        }
    }

    /// Run a stored procedure with automatic retry.
    ///
    /// Transient errors retry with exponential backoff capped at 200 ms;
    /// other errors and panics roll back and propagate.
    pub fn transaction<T>(
        &self,
        kind: TransactionKind,
        f: impl FnMut(&mut TxHandle<'_>) -> Result<T>,
    ) -> Result<T> {
        self.transaction_with_deadline(kind, None, f)
    }

    /// [`Database::transaction`] with an explicit deadline.
    pub fn transaction_with_deadline<T>(
        &self,
        kind: TransactionKind,
        deadline: Option<DateTime<Utc>>,
        mut f: impl FnMut(&mut TxHandle<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut backoff = RETRY_BACKOFF_INITIAL;
        let mut last_err = DbError::Conflict;
        for _ in 0..MAX_RETRIES {
            let mut handle = self.begin_with_deadline(kind, deadline);
            let outcome = catch_unwind(AssertUnwindSafe(|| f(&mut handle)));
            match outcome {
                Err(_) => {
                    error!(target: "velox::db", tx = handle.tx.id, "stored procedure panicked");
                    handle.rollback();
                    return Err(DbError::Unknown);
                }
                Ok(Err(err)) => {
                    handle.rollback();
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    last_err = err;
                }
                Ok(Ok(value)) => {
                    if handle.finished {
                        return Ok(value);
                    }
                    match handle.apply_changes() {
                        Ok(_) => return Ok(value),
                        Err(err) if err.is_retryable() => last_err = err,
                        Err(err) => return Err(err),
                    }
                }
            }
            if deadline.map(|d| Utc::now() > d).unwrap_or(false) {
                return Err(last_err);
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
        }
        Err(last_err)
    }

    /// Run a garbage-collection pass at the lowest active snapshot.
    pub fn collect_garbage(&self) -> GcStats {
        let stores = self.stores();
        self.gc.collect(&self.manager, &stores)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("model_version", &self.model.read().version)
            .field("commit_version", &self.current_version())
            .finish()
    }
}

/// Read-only view of one object as of the transaction's snapshot (or its
/// own buffered state).
#[derive(Debug, Clone)]
pub struct ObjectView {
    /// The object's id.
    pub id: ObjectId,
    /// Commit version of the viewed version (zero for buffered state).
    pub version: u64,
    class: Arc<ClassDesc>,
    data: Arc<[u8]>,
    strings: Arc<RefPool>,
    blobs: Arc<RefPool>,
}

impl ObjectView {
    /// The object's class.
    pub fn class_id(&self) -> ClassId {
        self.class.id
    }

    /// Unpack a property value.
    pub fn get(&self, property: PropertyId) -> Result<PropertyValue> {
        ObjectReader::new(self.id, self.version, &self.class, &self.data).read_value(
            property,
            &self.strings,
            &self.blobs,
        )
    }
}

/// Transactional handle passed to stored procedures.
pub struct TxHandle<'db> {
    db: &'db Database,
    model: Arc<Model>,
    stores: StoreSet,
    tx: Transaction,
    finished: bool,
}

impl<'db> TxHandle<'db> {
    /// The snapshot this transaction reads at.
    pub fn snapshot(&self) -> u64 {
        self.tx.snapshot
    }

    /// Fail with a retryable error once a schema update has published a
    /// newer model: this transaction's descriptors no longer match the
    /// record layouts.
    fn ensure_model_current(&self) -> Result<()> {
        if self.db.model.read().version != self.model.version {
            return Err(DbError::Conflict);
        }
        Ok(())
    }

    /// Create an object of a concrete class.
    pub fn create(&mut self, class: ClassId) -> Result<ObjectId> {
        self.tx.ensure_writable()?;
        self.ensure_model_current()?;
        let desc = self.model.expect_class(class)?;
        if desc.is_abstract {
            return Err(DbError::InvalidClass { class });
        }
        let store = self.stores.class(class)?;
        let id = store.allocate_id()?;
        let handle = store.insert_uncommitted(id, self.tx.id);
        let data = ObjectData::new_default(
            Arc::clone(desc),
            &self.stores.strings,
            &self.stores.blobs,
        )?;
        self.tx.push_insert(id, handle, data);
        Ok(id)
    }

    /// Read an object at the transaction's snapshot (own writes first).
    pub fn get(&mut self, id: ObjectId) -> Result<Option<ObjectView>> {
        self.tx.ensure_active()?;
        // the shared locker side keeps a schema update from rewriting the
        // class under this read; the model re-check runs under the guard
        let locker = self.db.lockers.class(id.class_id());
        let _guard = locker.read();
        self.ensure_model_current()?;
        if let Some(op) = self.tx.write_for(id) {
            return Ok(match (&op.kind, &op.data) {
                (WriteKind::Delete, _) | (_, None) => None,
                (_, Some(data)) => Some(ObjectView {
                    id,
                    version: 0,
                    class: Arc::clone(data.class()),
                    data: Arc::from(data.bytes().to_vec().into_boxed_slice()),
                    strings: Arc::clone(&self.stores.strings),
                    blobs: Arc::clone(&self.stores.blobs),
                }),
            });
        }
        let Some(store) = self.stores.classes.get(&id.class_id()) else {
            return Err(DbError::InvalidClass {
                class: id.class_id(),
            });
        };
        let observed = store.read_any(id, self.tx.snapshot);
        self.tx
            .record_read(id, observed.as_ref().map(|v| v.commit_version));
        match observed {
            None => Ok(None),
            Some(view) if view.deleted => Ok(None),
            Some(view) => {
                store.mark_read(view.handle, self.tx.slot.mask());
                Ok(Some(ObjectView {
                    id,
                    version: view.commit_version,
                    class: store.desc(),
                    data: view.data,
                    strings: Arc::clone(&self.stores.strings),
                    blobs: Arc::clone(&self.stores.blobs),
                }))
            }
        }
    }

    /// Write one property of an object.
    pub fn set(&mut self, id: ObjectId, property: PropertyId, value: &PropertyValue) -> Result<()> {
        self.tx.ensure_writable()?;
        self.ensure_model_current()?;
        self.ensure_buffer(id)?;
        let op = self.tx.write_for_mut(id).expect("buffered above");
        op.data
            .as_mut()
            .expect("non-delete buffer")
            .set_value(property, value, &self.stores.strings, &self.stores.blobs)
    }

    /// Delete an object, resolving delete-target actions synchronously.
    pub fn delete(&mut self, id: ObjectId) -> Result<()> {
        self.tx.ensure_writable()?;
        self.ensure_model_current()?;
        let mut visited = FxHashSet::default();
        self.delete_inner(id, &mut visited)
    }

    /// Ids of all live objects of a class and its descendants, at the
    /// transaction's snapshot.
    pub fn get_all(&mut self, class: ClassId) -> Result<Vec<ObjectId>> {
        self.tx.ensure_active()?;
        self.ensure_model_current()?;
        let desc = Arc::clone(self.model.expect_class(class)?);
        let mut out = Vec::new();
        for concrete in &desc.descendants {
            let locker = self.db.lockers.class(*concrete);
            let _guard = locker.read();
            let Some(store) = self.stores.classes.get(concrete) else {
                continue; // abstract classes hold no objects
            };
            self.tx.record_class_read(*concrete);
            let mut candidates = Vec::new();
            for chunk in store.scan_chunks() {
                store.for_each_object(chunk, |id| candidates.push(id));
            }
            for id in candidates {
                if let Some(op) = self.tx.write_for(id) {
                    if op.kind != WriteKind::Delete {
                        out.push(id);
                    }
                    continue;
                }
                if let Some(view) = store.read(id, self.tx.snapshot) {
                    self.tx.record_read(id, Some(view.commit_version));
                    out.push(id);
                }
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Sources referencing `target` through a tracked reference property,
    /// as visible to this transaction (own writes overlaid).
    ///
    /// Reading through a property that does not track inverses is a usage
    /// error.
    pub fn get_referencing(
        &mut self,
        target: ObjectId,
        property: PropertyId,
    ) -> Result<Vec<ObjectId>> {
        self.tx.ensure_active()?;
        let locker = self.db.lockers.class(target.class_id());
        let _guard = locker.read();
        self.ensure_model_current()?;
        let class = self.model.expect_class(target.class_id())?;
        let inbound = class
            .inbound_refs
            .iter()
            .find(|r| r.property == property)
            .ok_or(DbError::UnknownProperty {
                class: class.id,
                property,
            })?;
        if !inbound.track_inverse {
            return Err(DbError::UntrackedInverseReference { property });
        }
        // the result depends on every object of the declaring hierarchy
        let source_classes: Vec<ClassId> = self
            .model
            .class(inbound.source_class)
            .map(|c| c.descendants.clone())
            .unwrap_or_default();
        for source_class in source_classes {
            self.tx.record_class_read(source_class);
        }

        let committed: Vec<ObjectId> = self
            .stores
            .inverse_for(target)
            .map(|m| m.get_inverse(target, property, self.tx.snapshot))
            .unwrap_or_default();
        let mut out = Vec::new();
        for source in committed {
            if self.still_references(source, property, target)? {
                out.push(source);
            }
        }
        for (source, prop) in self.buffered_references_to(target) {
            if prop == property && !out.contains(&source) {
                out.push(source);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// A point-lookup reader over a hash index.
    pub fn get_hash_index<'a>(&'a mut self, index: IndexId) -> Result<HashIndexReader<'a, 'db>> {
        self.tx.ensure_active()?;
        self.ensure_model_current()?;
        let ix = self
            .stores
            .index(index)
            .ok_or(DbError::NotApplicable)?
            .clone();
        if ix.desc().kind != IndexKind::Hash {
            return Err(DbError::NotApplicable);
        }
        Ok(HashIndexReader { handle: self, index: ix })
    }

    /// Commit the buffered changes; the handle is finished afterwards.
    pub fn apply_changes(&mut self) -> Result<u64> {
        if self.finished {
            return Err(DbError::TransactionNotAllowed);
        }
        self.finished = true;
        let expected_version = self.model.version;
        self.db.manager.commit(
            &mut self.tx,
            &self.model,
            &self.stores,
            &self.db.lockers,
            &self.db.log,
            // re-checked under the commit locks: a schema update published
            // since begin means this write set targets a stale layout
            &|| self.db.model.read().version == expected_version,
        )
    }

    /// Roll back the transaction; terminal.
    pub fn rollback(&mut self) {
        if !self.finished {
            self.db
                .manager
                .rollback(&mut self.tx, &self.stores, "rolled back by caller");
            self.finished = true;
        }
    }

    // ---- internals ----

    /// Make sure a mutable buffer exists for an object.
    fn ensure_buffer(&mut self, id: ObjectId) -> Result<()> {
        match self.tx.write_for(id) {
            Some(op) if op.kind == WriteKind::Delete => {
                return Err(DbError::ObjectDeleted { id })
            }
            Some(_) => return Ok(()),
            None => {}
        }
        let locker = self.db.lockers.class(id.class_id());
        let _guard = locker.read();
        self.ensure_model_current()?;
        let store = self.stores.class(id.class_id())?;
        let observed = store.read_any(id, self.tx.snapshot);
        self.tx
            .record_read(id, observed.as_ref().map(|v| v.commit_version));
        let Some(view) = observed.filter(|v| !v.deleted) else {
            return Err(DbError::ObjectDeleted { id });
        };
        store.mark_read(view.handle, self.tx.slot.mask());
        let data = ObjectData::from_existing(
            store.desc(),
            &view.data,
            &self.stores.strings,
            &self.stores.blobs,
        );
        self.tx.push_update(id, view.commit_version, data);
        Ok(())
    }

    fn delete_inner(&mut self, id: ObjectId, visited: &mut FxHashSet<ObjectId>) -> Result<()> {
        if !visited.insert(id) {
            return Ok(());
        }
        let base_version = match self.tx.write_for(id) {
            Some(op) if op.kind == WriteKind::Delete => {
                return Err(DbError::ObjectDeleted { id })
            }
            Some(op) => op.base_version,
            None => {
                let locker = self.db.lockers.class(id.class_id());
                let _guard = locker.read();
                self.ensure_model_current()?;
                let store = self.stores.class(id.class_id())?;
                let observed = store.read_any(id, self.tx.snapshot);
                self.tx
                    .record_read(id, observed.as_ref().map(|v| v.commit_version));
                let Some(view) = observed.filter(|v| !v.deleted) else {
                    return Err(DbError::ObjectDeleted { id });
                };
                view.commit_version
            }
        };

        // Observers of this object, via the inverse map plus this
        // transaction's own buffered references.
        let mut inbound: Vec<(ObjectId, PropertyId)> = self
            .stores
            .inverse_for(id)
            .map(|m| m.all_inbound(id, self.tx.snapshot))
            .unwrap_or_default();
        inbound.extend(self.buffered_references_to(id));
        inbound.sort_unstable();
        inbound.dedup();

        for (source, property) in inbound {
            if source == id || visited.contains(&source) {
                continue;
            }
            // the map may lag this transaction's own rewrites
            if !self.still_references(source, property, id)? {
                continue;
            }
            let reference = self
                .model
                .class(source.class_id())
                .and_then(|c| c.property(property))
                .and_then(|p| p.reference());
            let Some(reference) = reference else {
                continue;
            };
            match reference.on_delete {
                velox_model::DeleteTargetAction::Prevent => {
                    return Err(DbError::DeleteReferenced {
                        id,
                        referencing: source,
                    });
                }
                velox_model::DeleteTargetAction::SetNull => {
                    self.null_out_reference(source, property, id)?;
                }
                velox_model::DeleteTargetAction::Cascade => {
                    self.delete_inner(source, visited)?;
                }
            }
        }

        self.tx
            .push_delete(id, base_version, &self.stores.strings, &self.stores.blobs);
        Ok(())
    }

    /// `(source, property)` pairs of buffered writes referencing `target`.
    fn buffered_references_to(&self, target: ObjectId) -> Vec<(ObjectId, PropertyId)> {
        let mut out = Vec::new();
        for op in self.tx.writes() {
            let Some(data) = op.data.as_ref() else {
                continue;
            };
            let desc = data.class();
            for (pos, prop) in desc.properties.iter().enumerate() {
                let Some(reference) = prop.reference() else {
                    continue;
                };
                let offset = desc.offsets[pos] as usize;
                let reader = ObjectReader::new(op.id, 0, desc, data.bytes());
                let hit = if reference.multiplicity == Multiplicity::Many {
                    reader
                        .get_long_array_optimized(offset, &self.stores.blobs)
                        .iter()
                        .any(|raw| *raw as u64 == target.as_u64())
                } else {
                    reader.reference_at(offset) == target
                };
                if hit {
                    out.push((op.id, prop.id));
                }
            }
        }
        out
    }

    /// Whether `source.property` still holds `target` in this
    /// transaction's view.
    fn still_references(
        &mut self,
        source: ObjectId,
        property: PropertyId,
        target: ObjectId,
    ) -> Result<bool> {
        let bytes: Option<Vec<u8>> = match self.tx.write_for(source) {
            Some(op) if op.kind == WriteKind::Delete => return Ok(false),
            Some(op) => op.data.as_ref().map(|d| d.bytes().to_vec()),
            None => self
                .stores
                .classes
                .get(&source.class_id())
                .and_then(|s| s.read(source, self.tx.snapshot))
                .map(|v| v.data.to_vec()),
        };
        let Some(bytes) = bytes else {
            return Ok(false);
        };
        let Some(class) = self.model.class(source.class_id()) else {
            return Ok(false);
        };
        let Some(pos) = class.property_pos(property) else {
            return Ok(false);
        };
        let offset = class.offsets[pos] as usize;
        let reference = class.properties[pos].reference();
        let reader = ObjectReader::new(source, 0, class, &bytes);
        Ok(match reference.map(|r| r.multiplicity) {
            Some(Multiplicity::Many) => reader
                .get_long_array_optimized(offset, &self.stores.blobs)
                .iter()
                .any(|raw| *raw as u64 == target.as_u64()),
            Some(_) => reader.reference_at(offset) == target,
            None => false,
        })
    }

    /// Null out (or remove from the array) one reference to `target`.
    fn null_out_reference(
        &mut self,
        source: ObjectId,
        property: PropertyId,
        target: ObjectId,
    ) -> Result<()> {
        self.ensure_buffer(source)?;
        let class = self
            .model
            .class(source.class_id())
            .ok_or(DbError::InvalidClass {
                class: source.class_id(),
            })?;
        let reference = class
            .property(property)
            .and_then(|p| p.reference())
            .ok_or(DbError::UnknownProperty {
                class: class.id,
                property,
            })?;
        if reference.multiplicity == Multiplicity::Many {
            let current = {
                let op = self.tx.write_for(source).expect("buffered above");
                op.data.as_ref().expect("non-delete buffer").read_value(
                    source,
                    property,
                    &self.stores.strings,
                    &self.stores.blobs,
                )?
            };
            let PropertyValue::ReferenceArray(ids) = current else {
                return Ok(());
            };
            let remaining: Vec<ObjectId> = ids.into_iter().filter(|t| *t != target).collect();
            self.set(source, property, &PropertyValue::ReferenceArray(remaining))
        } else {
            self.set(source, property, &PropertyValue::Reference(ObjectId::NULL))
        }
    }
}

impl Drop for TxHandle<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.db
                .manager
                .rollback(&mut self.tx, &self.stores, "dropped without commit");
        }
    }
}

/// Point-lookup reader over one hash index, registered against the owning
/// transaction for phantom protection.
pub struct HashIndexReader<'a, 'db> {
    handle: &'a mut TxHandle<'db>,
    index: Arc<SecondaryIndex>,
}

impl HashIndexReader<'_, '_> {
    /// All ids under the key, the transaction's own writes merged in.
    pub fn lookup(&mut self, values: &[PropertyValue]) -> Result<Vec<ObjectId>> {
        let key = self.index.lookup_key(values)?;
        let index_id = self.index.desc().id;
        self.handle.tx.record_key_read(index_id, &key);

        let snapshot = self.handle.tx.snapshot;
        let mut ids: Vec<ObjectId> = if self.index.is_pending_refill() {
            self.base_scan(&key)
        } else {
            self.index.lookup(&key, snapshot)
        };

        // overlay this transaction's buffered writes
        ids.retain(|id| match self.handle.tx.write_for(*id) {
            None => true,
            Some(op) => match (&op.kind, &op.data) {
                (WriteKind::Delete, _) | (_, None) => false,
                (_, Some(data)) => {
                    self.index
                        .key_for(data.class().id, data.bytes(), &self.handle.stores.strings)
                        == Some(key.clone())
                }
            },
        });
        for op in self.handle.tx.writes() {
            if op.kind == WriteKind::Delete {
                continue;
            }
            let Some(data) = op.data.as_ref() else {
                continue;
            };
            if ids.contains(&op.id) {
                continue;
            }
            if self
                .index
                .key_for(data.class().id, data.bytes(), &self.handle.stores.strings)
                == Some(key.clone())
            {
                ids.push(op.id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Sole id under the key of a unique index.
    pub fn lookup_unique(&mut self, values: &[PropertyValue]) -> Result<Option<ObjectId>> {
        Ok(self.lookup(values)?.into_iter().next())
    }

    /// Filtered base scan while the index is pending refill.
    fn base_scan(&mut self, key: &velox_storage::IndexKey) -> Vec<ObjectId> {
        let snapshot = self.handle.tx.snapshot;
        let mut out = Vec::new();
        for class in &self.index.desc().classes {
            let Some(store) = self.handle.stores.classes.get(class) else {
                continue;
            };
            for chunk in store.scan_chunks() {
                store.for_each_head(chunk, |view| {
                    if view.commit_version <= snapshot
                        && self
                            .index
                            .key_for(*class, &view.data, &self.handle.stores.strings)
                            .as_ref()
                            == Some(key)
                    {
                        out.push(view.id);
                    }
                });
            }
        }
        out
    }
}
