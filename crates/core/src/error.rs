//! Error types for the VeloxDB engine
//!
//! All failures surface as [`DbError`], which carries a numeric error code
//! in one of three bands:
//!
//! - **0–5000**: programmer/usage errors. Fail fast, propagated unchanged.
//! - **5001–10000**: data-dependent integrity errors. The transaction
//!   aborts; the caller presents a domain-specific reason.
//! - **>10000**: transient errors, retryable with exponential backoff
//!   (`Conflict` is the canonical member).
//!
//! `detail()` yields the structured `{error_type, detail}` form crossing the
//! engine boundary.

use crate::types::{ClassId, IndexId, ObjectId, PropertyId};
use std::collections::BTreeMap;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, DbError>;

/// Error type for the VeloxDB engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DbError {
    // ---- programmer/usage errors (0-5000) ----
    /// A stored procedure panicked; the transaction was rolled back.
    #[error("unknown error")]
    Unknown,

    /// Operation referenced a class the current model does not define,
    /// or tried to instantiate an abstract class.
    #[error("invalid class {class}")]
    InvalidClass {
        /// The offending class id.
        class: ClassId,
    },

    /// Operation targeted an object that is deleted in this transaction's view.
    #[error("object {id} is deleted")]
    ObjectDeleted {
        /// The deleted object.
        id: ObjectId,
    },

    /// Inverse-reference read on a property that does not track inverses.
    #[error("property {property} does not track inverse references")]
    UntrackedInverseReference {
        /// The untracked reference property.
        property: PropertyId,
    },

    /// A value's type does not match the property's declared type.
    #[error("value type mismatch for property {property}")]
    TypeMismatch {
        /// The property written with the wrong type.
        property: PropertyId,
    },

    /// Operation referenced a property the class does not define.
    #[error("unknown property {property} on class {class}")]
    UnknownProperty {
        /// Class being accessed.
        class: ClassId,
        /// Property that is not defined on it.
        property: PropertyId,
    },

    /// Malformed model descriptor document.
    #[error("invalid model: {reason}")]
    InvalidModel {
        /// Human-readable reason.
        reason: String,
    },

    // ---- data-dependent errors (5001-10000) ----
    /// Deleting the object would dangle a `prevent` reference.
    #[error("object {id} is referenced by {referencing}")]
    DeleteReferenced {
        /// Object whose deletion was blocked.
        id: ObjectId,
        /// One referencing object (first found).
        referencing: ObjectId,
    },

    /// A reference resolves to an instance of the wrong class.
    #[error("reference {property} of {source_id} points to {target} of the wrong class")]
    InvalidReferencedClass {
        /// Referencing object.
        source_id: ObjectId,
        /// The reference property.
        property: PropertyId,
        /// The mistyped target.
        target: ObjectId,
    },

    /// A unique index already contains the key at a visible version.
    #[error("uniqueness violation on index {index}")]
    UniquenessViolation {
        /// The violated index.
        index: IndexId,
    },

    /// A reference with `exactly-one` multiplicity is null.
    #[error("reference {property} of {source_id} must not be null")]
    NullReferenceNotAllowed {
        /// Object holding the null reference (first offending id).
        source_id: ObjectId,
        /// The non-nullable property.
        property: PropertyId,
    },

    /// A reference points at an object id that does not exist.
    #[error("reference {property} of {source_id} points to unknown object {target}")]
    UnknownReference {
        /// Referencing object.
        source_id: ObjectId,
        /// The reference property.
        property: PropertyId,
        /// The dangling target id.
        target: ObjectId,
    },

    /// A pre-existing class was added to an index whose key contains a
    /// property inserted by the same model update.
    #[error("class {class} added to index {index} keyed by inserted property {property}")]
    InsertedPropertyClassAddedToIndex {
        /// The rejected index.
        index: IndexId,
        /// The inserted key property.
        property: PropertyId,
        /// The pre-existing class.
        class: ClassId,
    },

    /// A reference property with `exactly-one` multiplicity was inserted
    /// into a class that already has live objects.
    #[error("inserted reference property {property} requires exactly-one multiplicity")]
    InsertedReferencePropertyMultiplicity {
        /// The rejected property.
        property: PropertyId,
    },

    /// A property's type or kind changed between model versions.
    #[error("property {property} changed type or kind")]
    InvalidPropertyTypeModification {
        /// The rejected property.
        property: PropertyId,
    },

    // ---- transient errors (>10000) ----
    /// Concurrent read/write overlap; retry from a fresh snapshot.
    #[error("transaction conflict")]
    Conflict,

    /// Commit was initiated but its outcome is unknown.
    #[error("commit result unavailable")]
    UnavailableCommitResult,

    /// Write attempted on a read transaction, or operation not permitted
    /// in the transaction's current state.
    #[error("operation not allowed in this transaction")]
    TransactionNotAllowed,

    /// Operation is momentarily not applicable (e.g. index mid-refill).
    #[error("operation not applicable")]
    NotApplicable,

    /// The transaction's deadline expired; retry with a fresh deadline.
    #[error("transaction timeout")]
    TransactionTimeout,
}

impl DbError {
    /// Numeric error code in the banded space.
    pub fn error_code(&self) -> u32 {
        match self {
            DbError::Unknown => 1,
            DbError::InvalidClass { .. } => 1001,
            DbError::ObjectDeleted { .. } => 1002,
            DbError::UntrackedInverseReference { .. } => 1003,
            DbError::TypeMismatch { .. } => 1004,
            DbError::UnknownProperty { .. } => 1005,
            DbError::InvalidModel { .. } => 1006,
            DbError::DeleteReferenced { .. } => 5001,
            DbError::InvalidReferencedClass { .. } => 5002,
            DbError::UniquenessViolation { .. } => 5003,
            DbError::NullReferenceNotAllowed { .. } => 5004,
            DbError::UnknownReference { .. } => 5005,
            DbError::InsertedPropertyClassAddedToIndex { .. } => 5006,
            DbError::InsertedReferencePropertyMultiplicity { .. } => 5007,
            DbError::InvalidPropertyTypeModification { .. } => 5008,
            DbError::Conflict => 10001,
            DbError::UnavailableCommitResult => 10002,
            DbError::TransactionNotAllowed => 10003,
            DbError::NotApplicable => 10004,
            DbError::TransactionTimeout => 10005,
        }
    }

    /// Whether callers should retry with backoff.
    ///
    /// True exactly for the transient band (>10000).
    pub fn is_retryable(&self) -> bool {
        self.error_code() > 10_000
    }

    /// Whether this is a data-dependent integrity error (5001-10000).
    pub fn is_data_error(&self) -> bool {
        let code = self.error_code();
        (5001..=10_000).contains(&code)
    }

    /// Structured detail map for the error-reporting boundary.
    pub fn detail(&self) -> BTreeMap<&'static str, String> {
        let mut map = BTreeMap::new();
        match self {
            DbError::InvalidClass { class } => {
                map.insert("class", class.to_string());
            }
            DbError::ObjectDeleted { id } => {
                map.insert("id", id.to_string());
            }
            DbError::UntrackedInverseReference { property }
            | DbError::TypeMismatch { property }
            | DbError::InsertedReferencePropertyMultiplicity { property }
            | DbError::InvalidPropertyTypeModification { property } => {
                map.insert("property", property.to_string());
            }
            DbError::UnknownProperty { class, property } => {
                map.insert("class", class.to_string());
                map.insert("property", property.to_string());
            }
            DbError::InvalidModel { reason } => {
                map.insert("reason", reason.clone());
            }
            DbError::DeleteReferenced { id, referencing } => {
                map.insert("id", id.to_string());
                map.insert("referencing", referencing.to_string());
            }
            DbError::InvalidReferencedClass { source_id,
                property,
                target,
            }
            | DbError::UnknownReference { source_id,
                property,
                target,
            } => {
                map.insert("source", source_id.to_string());
                map.insert("property", property.to_string());
                map.insert("target", target.to_string());
            }
            DbError::UniquenessViolation { index } => {
                map.insert("index", index.to_string());
            }
            DbError::NullReferenceNotAllowed { source_id, property } => {
                map.insert("source", source_id.to_string());
                map.insert("property", property.to_string());
            }
            DbError::InsertedPropertyClassAddedToIndex {
                index,
                property,
                class,
            } => {
                map.insert("index", index.to_string());
                map.insert("property", property.to_string());
                map.insert("class", class.to_string());
            }
            _ => {}
        }
        map
    }
}
