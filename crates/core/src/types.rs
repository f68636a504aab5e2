//! Core identifier types
//!
//! This module defines the foundational identifiers:
//! - ClassId / PropertyId / IndexId: 16-bit model element ids
//! - ObjectId: 64-bit composite id (class id in the upper 16 bits,
//!   per-class counter in the lower 48 bits)
//! - CommitVersion: monotonic 64-bit commit counter

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic 64-bit counter assigned at successful commit.
///
/// Totally orders committed transactions. A snapshot is simply the commit
/// version current at a transaction's first read.
pub type CommitVersion = u64;

/// Identifier of a class within a model version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(pub u16);

impl ClassId {
    /// Raw 16-bit value.
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Identifier of a property within a model version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyId(pub u16);

impl PropertyId {
    /// Raw 16-bit value.
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Identifier of an index within a model version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexId(pub u16);

impl IndexId {
    /// Raw 16-bit value.
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// Number of bits of an [`ObjectId`] occupied by the per-class counter.
pub const COUNTER_BITS: u32 = 48;

/// Mask selecting the counter bits of an [`ObjectId`].
pub const COUNTER_MASK: u64 = (1u64 << COUNTER_BITS) - 1;

/// 64-bit object identifier.
///
/// The upper 16 bits carry the class id, the lower 48 bits the per-class
/// counter. Class-id extraction is a constant-time shift used pervasively
/// for dispatch. Ids are unique database-wide because the class id is
/// embedded and counters never repeat within a class.
///
/// `ObjectId::NULL` (all zero bits) is the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    /// The null reference.
    pub const NULL: ObjectId = ObjectId(0);

    /// Compose an id from a class id and per-class counter.
    ///
    /// Counters above 48 bits wrap into the class field and are rejected by
    /// the caller (`limits::MAX_OBJECT_COUNTER`); this constructor masks
    /// defensively so the class field stays authoritative.
    pub const fn new(class: ClassId, counter: u64) -> Self {
        ObjectId(((class.0 as u64) << COUNTER_BITS) | (counter & COUNTER_MASK))
    }

    /// Rebuild an id from its raw 64-bit form.
    pub const fn from_u64(raw: u64) -> Self {
        ObjectId(raw)
    }

    /// Raw 64-bit form, as stored in object slots and the WAL.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Class id embedded in the upper 16 bits.
    pub const fn class_id(self) -> ClassId {
        ClassId((self.0 >> COUNTER_BITS) as u16)
    }

    /// Per-class counter in the lower 48 bits.
    pub const fn counter(self) -> u64 {
        self.0 & COUNTER_MASK
    }

    /// Whether this is the null reference.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class_id().as_u16(), self.counter())
    }
}

/// Slot of a transaction in the per-version reader bitmap.
///
/// The reader-info word of an object version is a 64-slot bitmap; an active
/// transaction is assigned one slot for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSlot(pub u32);

impl TxSlot {
    /// Bit mask for this slot in a reader-info word.
    pub const fn mask(self) -> u64 {
        1u64 << (self.0 % 64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::{assert_eq_size, assert_impl_all};

    assert_eq_size!(ObjectId, u64);
    assert_eq_size!(ClassId, u16);
    assert_impl_all!(ObjectId: Send, Sync, Copy);

    #[test]
    fn test_object_id_round_trip() {
        let id = ObjectId::new(ClassId(7), 123_456);
        assert_eq!(id.class_id(), ClassId(7));
        assert_eq!(id.counter(), 123_456);
        assert_eq!(ObjectId::from_u64(id.as_u64()), id);
    }

    #[test]
    fn test_object_id_null() {
        assert!(ObjectId::NULL.is_null());
        assert!(!ObjectId::new(ClassId(1), 1).is_null());
        assert_eq!(ObjectId::NULL.counter(), 0);
    }

    #[test]
    fn test_object_id_class_extraction_is_upper_bits() {
        let id = ObjectId::new(ClassId(u16::MAX), COUNTER_MASK);
        assert_eq!(id.class_id(), ClassId(u16::MAX));
        assert_eq!(id.counter(), COUNTER_MASK);
    }

    #[test]
    fn test_object_id_counter_overflow_masked() {
        // A counter above 48 bits must not leak into the class field.
        let id = ObjectId::new(ClassId(3), COUNTER_MASK + 5);
        assert_eq!(id.class_id(), ClassId(3));
        assert_eq!(id.counter(), 4);
    }

    #[test]
    fn test_display() {
        let id = ObjectId::new(ClassId(2), 9);
        assert_eq!(id.to_string(), "2:9");
        assert_eq!(ClassId(2).to_string(), "c2");
    }

    #[test]
    fn test_tx_slot_mask() {
        assert_eq!(TxSlot(0).mask(), 1);
        assert_eq!(TxSlot(63).mask(), 1 << 63);
        assert_eq!(TxSlot(64).mask(), 1);
    }
}
