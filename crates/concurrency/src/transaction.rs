//! Transaction context
//!
//! Tracks one transaction's snapshot, read set, buffered write set, and
//! key/range read intents. All mutation is buffered in [`ObjectData`]
//! buffers and applied to the version chains at commit; reads see the
//! transaction's own writes first.

use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use std::hash::{Hash, Hasher};
use velox_core::{ClassId, DbError, IndexId, ObjectId, Result, TxSlot};
use velox_storage::{IndexKey, ObjectData, RefPool};

/// Transaction type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Snapshot reads only; write attempts fail fast.
    Read,
    /// Reads and buffered writes.
    ReadWrite,
}

/// Lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Accepting operations.
    Active,
    /// Committed at the carried version.
    Committed {
        /// Assigned commit version.
        version: u64,
    },
    /// Terminal abort.
    Aborted {
        /// Why the transaction aborted.
        reason: String,
    },
}

/// Kind of a buffered write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// New object; its record is already linked, uncommitted.
    Insert,
    /// New version of an existing object.
    Update,
    /// Tombstone.
    Delete,
}

/// One buffered write.
#[derive(Debug)]
pub struct WriteOp {
    /// Target object.
    pub id: ObjectId,
    /// Insert / update / delete.
    pub kind: WriteKind,
    /// The edited buffer; `None` for deletes.
    pub data: Option<ObjectData>,
    /// Committed head version this write was derived from (updates and
    /// deletes), for reader-info bookkeeping.
    pub base_version: u64,
    /// Arena handle of the pending record (inserts only).
    pub insert_handle: Option<u64>,
}

/// A transaction.
#[derive(Debug)]
pub struct Transaction {
    /// Transaction id.
    pub id: u64,
    /// Slot in per-version reader bitmaps.
    pub slot: TxSlot,
    /// Read or read-write.
    pub kind: TransactionKind,
    /// Global commit version at first read; all visibility is
    /// `commit_version <= snapshot`.
    pub snapshot: u64,
    /// Lifecycle state.
    pub status: TransactionStatus,
    /// Rollback-with-retryable-error past this instant.
    pub deadline: Option<DateTime<Utc>>,

    /// Object id → committed head version observed (`None` = absent).
    reads: FxHashMap<ObjectId, Option<u64>>,
    writes: Vec<WriteOp>,
    write_index: FxHashMap<ObjectId, usize>,
    key_reads: Vec<(IndexId, u64)>,
    range_reads: FxHashSet<IndexId>,
    class_reads: FxHashSet<ClassId>,
}

impl Transaction {
    /// New active transaction at the given snapshot.
    pub fn new(
        id: u64,
        slot: TxSlot,
        kind: TransactionKind,
        snapshot: u64,
        deadline: Option<DateTime<Utc>>,
    ) -> Self {
        Transaction {
            id,
            slot,
            kind,
            snapshot,
            status: TransactionStatus::Active,
            deadline,
            reads: FxHashMap::default(),
            writes: Vec::new(),
            write_index: FxHashMap::default(),
            key_reads: Vec::new(),
            range_reads: FxHashSet::default(),
            class_reads: FxHashSet::default(),
        }
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        self.deadline.map(|d| Utc::now() > d).unwrap_or(false)
    }

    /// Fail unless the transaction is active and within its deadline.
    pub fn ensure_active(&self) -> Result<()> {
        match &self.status {
            TransactionStatus::Active => {
                if self.expired() {
                    Err(DbError::TransactionTimeout)
                } else {
                    Ok(())
                }
            }
            _ => Err(DbError::TransactionNotAllowed),
        }
    }

    /// Fail unless writes are permitted.
    pub fn ensure_writable(&self) -> Result<()> {
        self.ensure_active()?;
        match self.kind {
            TransactionKind::ReadWrite => Ok(()),
            TransactionKind::Read => Err(DbError::TransactionNotAllowed),
        }
    }

    /// Record an object read and the head version it observed.
    pub fn record_read(&mut self, id: ObjectId, observed: Option<u64>) {
        self.reads.entry(id).or_insert(observed);
    }

    /// Record a point read through an index key.
    pub fn record_key_read(&mut self, index: IndexId, key: &IndexKey) {
        self.key_reads.push((index, hash_key(key)));
    }

    /// Record a range read over a sorted index.
    pub fn record_range_read(&mut self, index: IndexId) {
        self.range_reads.insert(index);
    }

    /// Record a class-wide scan (polymorphic `get_all`).
    pub fn record_class_read(&mut self, class: ClassId) {
        self.class_reads.insert(class);
    }

    /// The buffered write for an object, if any.
    pub fn write_for(&self, id: ObjectId) -> Option<&WriteOp> {
        self.write_index.get(&id).map(|i| &self.writes[*i])
    }

    /// Mutable access to the buffered write for an object.
    pub fn write_for_mut(&mut self, id: ObjectId) -> Option<&mut WriteOp> {
        let index = *self.write_index.get(&id)?;
        Some(&mut self.writes[index])
    }

    /// Buffer a create.
    pub fn push_insert(&mut self, id: ObjectId, handle: u64, data: ObjectData) {
        self.write_index.insert(id, self.writes.len());
        self.writes.push(WriteOp {
            id,
            kind: WriteKind::Insert,
            data: Some(data),
            base_version: 0,
            insert_handle: Some(handle),
        });
    }

    /// Buffer an update derived from the committed head `base_version`.
    pub fn push_update(&mut self, id: ObjectId, base_version: u64, data: ObjectData) {
        self.write_index.insert(id, self.writes.len());
        self.writes.push(WriteOp {
            id,
            kind: WriteKind::Update,
            data: Some(data),
            base_version,
            insert_handle: None,
        });
    }

    /// Turn an object's buffered state into a delete.
    ///
    /// Any existing buffer is released into the pools first.
    pub fn push_delete(
        &mut self,
        id: ObjectId,
        base_version: u64,
        strings: &RefPool,
        blobs: &RefPool,
    ) {
        if let Some(index) = self.write_index.get(&id).copied() {
            let op = &mut self.writes[index];
            if let Some(data) = op.data.take() {
                data.release_handles(strings, blobs);
            }
            op.kind = WriteKind::Delete;
            return;
        }
        self.write_index.insert(id, self.writes.len());
        self.writes.push(WriteOp {
            id,
            kind: WriteKind::Delete,
            data: None,
            base_version,
            insert_handle: None,
        });
    }

    /// Buffered writes in operation order.
    pub fn writes(&self) -> &[WriteOp] {
        &self.writes
    }

    /// Mutable buffered writes (commit installation).
    pub fn writes_mut(&mut self) -> &mut [WriteOp] {
        &mut self.writes
    }

    /// Whether the transaction buffered any mutation.
    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    /// The observed read set.
    pub fn reads(&self) -> &FxHashMap<ObjectId, Option<u64>> {
        &self.reads
    }

    /// Registered key read intents as `(index, key hash)` pairs.
    pub fn key_reads(&self) -> &[(IndexId, u64)] {
        &self.key_reads
    }

    /// Indexes range-read by this transaction.
    pub fn range_reads(&self) -> &FxHashSet<IndexId> {
        &self.range_reads
    }

    /// Classes scanned by this transaction.
    pub fn class_reads(&self) -> &FxHashSet<ClassId> {
        &self.class_reads
    }

    /// Classes touched by buffered writes, ascending (lock order).
    pub fn write_classes(&self) -> Vec<ClassId> {
        let mut classes: Vec<ClassId> = self
            .writes
            .iter()
            .map(|w| w.id.class_id())
            .collect::<FxHashSet<_>>()
            .into_iter()
            .collect();
        classes.sort_unstable();
        classes
    }

    /// Release every buffered handle back to the pools (abort path).
    pub fn release_buffers(&mut self, strings: &RefPool, blobs: &RefPool) {
        for op in &mut self.writes {
            if let Some(data) = op.data.take() {
                data.release_handles(strings, blobs);
            }
        }
    }
}

/// Stable hash of an index key for the key-read locker table.
pub fn hash_key(key: &IndexKey) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    // transactions move across worker threads with their write sets
    assert_impl_all!(Transaction: Send);

    fn tx(kind: TransactionKind) -> Transaction {
        Transaction::new(1, TxSlot(1), kind, 100, None)
    }

    #[test]
    fn test_read_transaction_rejects_writes() {
        let t = tx(TransactionKind::Read);
        assert_eq!(t.ensure_writable(), Err(DbError::TransactionNotAllowed));
        assert!(t.ensure_active().is_ok());
    }

    #[test]
    fn test_expired_deadline_times_out() {
        let mut t = tx(TransactionKind::ReadWrite);
        t.deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        assert_eq!(t.ensure_active(), Err(DbError::TransactionTimeout));
    }

    #[test]
    fn test_first_read_wins_in_read_set() {
        let mut t = tx(TransactionKind::ReadWrite);
        let id = ObjectId::new(ClassId(1), 1);
        t.record_read(id, Some(50));
        t.record_read(id, Some(60));
        assert_eq!(t.reads()[&id], Some(50));
    }

    #[test]
    fn test_delete_supersedes_buffered_update() {
        let strings = RefPool::new();
        let blobs = RefPool::new();
        let mut t = tx(TransactionKind::ReadWrite);
        let id = ObjectId::new(ClassId(1), 1);
        t.push_delete(id, 42, &strings, &blobs);
        let op = t.write_for(id).unwrap();
        assert_eq!(op.kind, WriteKind::Delete);
        assert_eq!(op.base_version, 42);
        assert!(op.data.is_none());
    }

    #[test]
    fn test_write_classes_sorted_unique() {
        let strings = RefPool::new();
        let blobs = RefPool::new();
        let mut t = tx(TransactionKind::ReadWrite);
        t.push_delete(ObjectId::new(ClassId(5), 1), 1, &strings, &blobs);
        t.push_delete(ObjectId::new(ClassId(2), 1), 1, &strings, &blobs);
        t.push_delete(ObjectId::new(ClassId(5), 2), 1, &strings, &blobs);
        assert_eq!(t.write_classes(), vec![ClassId(2), ClassId(5)]);
    }

    #[test]
    fn test_key_hash_stability() {
        use velox_storage::key_from_values;
        use velox_core::PropertyValue;
        let a = key_from_values(&[PropertyValue::Long(7)], true).unwrap();
        let b = key_from_values(&[PropertyValue::Long(7)], true).unwrap();
        assert_eq!(hash_key(&a), hash_key(&b));
    }
}
