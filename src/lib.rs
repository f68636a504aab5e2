//! # VeloxDB Core
//!
//! An in-memory, transactional object database: user-written procedures
//! manipulate strongly-typed objects through a small runtime embedded in
//! the database process. This crate bundles the core engine — object
//! storage with MVCC version chains, secondary indexes, the
//! inverse-reference map, serializable transactions, and online schema
//! evolution.
//!
//! # Quick Start
//!
//! ```no_run
//! use veloxdb::{Database, ModelScheme, PropertyValue, TransactionKind};
//! use veloxdb::{ClassId, PropertyId};
//!
//! fn main() -> veloxdb::Result<()> {
//!     let scheme: ModelScheme = serde_json::from_str(r#"{
//!         "classes": [{
//!             "id": 1, "name": "Person",
//!             "properties": [
//!                 {"id": 10, "name": "user_name", "kind": "simple", "type": "string"}
//!             ]
//!         }],
//!         "indexes": [{
//!             "id": 1, "name": "person_by_name", "kind": "hash",
//!             "key_property_ids": [10], "is_unique": true, "class_ids": [1]
//!         }]
//!     }"#).unwrap();
//!
//!     let db = Database::in_memory(&scheme)?;
//!
//!     let person = db.transaction(TransactionKind::ReadWrite, |tx| {
//!         let id = tx.create(ClassId(1))?;
//!         tx.set(id, PropertyId(10), &PropertyValue::String(Some("john".into())))?;
//!         Ok(id)
//!     })?;
//!
//!     db.transaction(TransactionKind::Read, |tx| {
//!         let mut index = tx.get_hash_index(veloxdb::IndexId(1))?;
//!         let found = index.lookup_unique(&[PropertyValue::String(Some("john".into()))])?;
//!         assert_eq!(found, Some(person));
//!         Ok(())
//!     })?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! | Crate | Responsibility |
//! |-------|----------------|
//! | `velox-core` | ids, property values, the banded error model |
//! | `velox-model` | compiled descriptors, layouts, the diff planner |
//! | `velox-storage` | object heaps, pools, indexes, inverse references |
//! | `velox-concurrency` | transactions, conflict detection, lockers, GC |
//! | `velox-engine` | database facade, WAL emission, schema evolution |
//!
//! Visibility everywhere is `commit_version <= snapshot`; commits are
//! serializable (read-set validation plus key/range phantom checks), and
//! schema updates run as a staged, parallel plan that leaves the previous
//! model active if validation fails.

pub use velox_core::{
    ClassId, CommitVersion, DbError, IndexId, ObjectId, PropertyId, PropertyType, PropertyValue,
    Result,
};
pub use velox_model::{
    ClassScheme, DeleteTargetAction, IndexKind, IndexScheme, Model, ModelDiff, ModelScheme,
    Multiplicity, PropertyScheme, PropertySchemeKind, SortDirection,
};
pub use velox_concurrency::{TransactionKind, TransactionStatus};
pub use velox_engine::{
    decode_record, encode_record, Database, DecodedRecord, HashIndexReader, LogSet, LogWriter,
    ObjectView, TxHandle, VecLogWriter,
};

/// Storage-level building blocks, re-exported for embedders and tests.
pub mod storage {
    pub use velox_storage::{
        ClassStore, IndexKey, InverseRefMap, ObjectData, ObjectReader, RefPool, ScanDirection,
        SecondaryIndex, StoreSet, NULL_HANDLE,
    };
}
