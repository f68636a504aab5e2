//! Concurrency layer for the VeloxDB engine
//!
//! This crate implements the MVCC transaction machinery:
//! - Transaction: snapshot, read set, buffered write set, intents
//! - TransactionManager: serializable commit protocol and version counter
//! - ClassLocker / KeyReadLocker: structural and phantom protection
//! - GarbageCollector: floor-snapshot version reclamation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod gc;
pub mod locker;
pub mod manager;
pub mod transaction;

pub use gc::{GarbageCollector, GcStats};
pub use locker::{ClassLocker, KeyReadLocker, LockerSet};
pub use manager::{CommitLog, LogOperation, LogRecord, NullCommitLog, TransactionManager};
pub use transaction::{
    hash_key, Transaction, TransactionKind, TransactionStatus, WriteKind, WriteOp,
};
