//! Storage layer for the VeloxDB engine
//!
//! This crate implements the physical structures:
//! - RefPool: refcounted, sharded string/blob interning
//! - ClassStore: per-class object arenas with collision and version chains
//! - ObjectReader / ObjectData: raw-byte views parameterised by descriptors
//! - InverseRefMap: reverse adjacency over tracked references
//! - SecondaryIndex: hash and sorted indexes with versioned entries
//! - StoreSet: the full structure set of one model version

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod class_store;
pub mod index;
pub mod inverse;
pub mod object;
pub mod refpool;
pub mod store_set;

pub use class_store::{ClassStore, ObjectRecord, VersionView, INVALID_HANDLE, UNCOMMITTED_VERSION};
pub use index::{key_from_values, IndexKey, KeyValue, ScanDirection, SecondaryIndex};
pub use inverse::InverseRefMap;
pub use object::{release_record_handles, ObjectData, ObjectReader};
pub use refpool::{decode_longs, encode_longs, RefPool, NULL_HANDLE};
pub use store_set::StoreSet;
