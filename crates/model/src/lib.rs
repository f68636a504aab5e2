//! Model layer for the VeloxDB engine
//!
//! This crate implements the immutable schema descriptors:
//! - ClassDesc / PropertyDesc / IndexDesc: compiled descriptors with fixed
//!   byte layouts and derived descendant sets
//! - ModelScheme: the serde ingestion document handed in by the host
//! - Model: a validated, versioned, immutable model
//! - ModelDiff: the schema-evolution planner

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod class;
pub mod diff;
pub mod index;
pub mod model;
pub mod property;
pub mod scheme;

pub use class::{ClassDesc, HandleSlot, InboundRef};
pub use diff::{
    ClassUpdate, IndexUpdate, InverseRefChange, InverseRefUpdate, ModelDiff, PropertyUpdate,
};
pub use index::{IndexDesc, IndexKind, SortDirection, StringCompare};
pub use model::Model;
pub use property::{
    DeleteTargetAction, HandleKind, Multiplicity, PropertyDesc, PropertyKind, ReferenceDesc,
};
pub use scheme::{ClassScheme, IndexScheme, ModelScheme, PropertyScheme, PropertySchemeKind};
