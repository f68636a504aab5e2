//! Core types for the VeloxDB engine
//!
//! This crate defines the foundational vocabulary shared by every layer:
//! - ObjectId: 64-bit composite object identifier (class id + counter)
//! - PropertyType / PropertyValue: the simple-type system and its widths
//! - DbError: the banded error model (programmer / data / transient)
//! - limits: engine-wide constants

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod limits;
pub mod types;
pub mod value;

pub use error::{DbError, Result};
pub use types::{ClassId, CommitVersion, IndexId, ObjectId, PropertyId, TxSlot};
pub use value::{PropertyType, PropertyValue};
