//! Property descriptors
//!
//! A property is simple, array-of-simple, or a reference. References carry
//! a target class, multiplicity, inverse-tracking flag, and the action taken
//! when their target is deleted.

use serde::{Deserialize, Serialize};
use velox_core::{ClassId, PropertyId, PropertyType, PropertyValue};

/// How many targets a reference property may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Multiplicity {
    /// Null or a single target.
    ZeroOrOne,
    /// A set of targets, stored as an id array.
    Many,
    /// Exactly one target; null is an integrity error.
    One,
}

/// Action taken on a referencing object when its target is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteTargetAction {
    /// Block the target's deletion while references exist.
    Prevent,
    /// Null out (or remove from the array) the reference, synchronously.
    SetNull,
    /// Delete the referencing object too, synchronously.
    Cascade,
}

/// Reference-specific descriptor fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceDesc {
    /// Class the reference points at (instances of its subtree are valid).
    pub target_class: ClassId,
    /// Multiplicity of the reference.
    pub multiplicity: Multiplicity,
    /// Whether the inverse-reference map indexes this property.
    pub track_inverse: bool,
    /// Action on the source when the target is deleted.
    pub on_delete: DeleteTargetAction,
}

/// The kind of a property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    /// Inline scalar (strings are pool handles).
    Simple(PropertyType),
    /// Array of simple scalars, stored as a blob handle.
    Array(PropertyType),
    /// Object reference (single slot) or reference array (blob handle).
    Reference(ReferenceDesc),
}

/// Pool a handle-valued record slot points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Interned string pool.
    String,
    /// Variable-length blob pool (arrays, reference arrays).
    Blob,
}

/// Immutable property descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDesc {
    /// Model-wide property id.
    pub id: PropertyId,
    /// Property name, unique within its class.
    pub name: String,
    /// Kind and type information.
    pub kind: PropertyKind,
    /// Declared default, written to inserted simple properties on schema
    /// change. Strings and arrays default to the null handle.
    pub default: Option<PropertyValue>,
}

impl PropertyDesc {
    /// Width in bytes of this property's record slot.
    ///
    /// Arrays and `many` references occupy one 64-bit blob handle; single
    /// references occupy one 64-bit object id.
    pub fn width(&self) -> usize {
        match &self.kind {
            PropertyKind::Simple(t) => t.width(),
            PropertyKind::Array(_) => 8,
            PropertyKind::Reference(_) => 8,
        }
    }

    /// The pool this property's slot points into, if handle-valued.
    pub fn handle_kind(&self) -> Option<HandleKind> {
        match &self.kind {
            PropertyKind::Simple(PropertyType::String) => Some(HandleKind::String),
            PropertyKind::Array(_) => Some(HandleKind::Blob),
            PropertyKind::Reference(r) if r.multiplicity == Multiplicity::Many => {
                Some(HandleKind::Blob)
            }
            _ => None,
        }
    }

    /// Reference descriptor, if this is a reference property.
    pub fn reference(&self) -> Option<&ReferenceDesc> {
        match &self.kind {
            PropertyKind::Reference(r) => Some(r),
            _ => None,
        }
    }

    /// Whether two descriptors agree on kind and underlying type.
    ///
    /// Reference detail (target, multiplicity, tracking, delete action) may
    /// differ; a kind or simple-type change is a rejected modification.
    pub fn same_shape(&self, other: &PropertyDesc) -> bool {
        match (&self.kind, &other.kind) {
            (PropertyKind::Simple(a), PropertyKind::Simple(b)) => a == b,
            (PropertyKind::Array(a), PropertyKind::Array(b)) => a == b,
            (PropertyKind::Reference(a), PropertyKind::Reference(b)) => {
                // A many-reference packs differently from a single one.
                (a.multiplicity == Multiplicity::Many) == (b.multiplicity == Multiplicity::Many)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple(id: u16, t: PropertyType) -> PropertyDesc {
        PropertyDesc {
            id: PropertyId(id),
            name: format!("p{id}"),
            kind: PropertyKind::Simple(t),
            default: None,
        }
    }

    #[test]
    fn test_widths() {
        assert_eq!(simple(1, PropertyType::Byte).width(), 1);
        assert_eq!(simple(2, PropertyType::String).width(), 8);
        let arr = PropertyDesc {
            id: PropertyId(3),
            name: "tags".into(),
            kind: PropertyKind::Array(PropertyType::Int),
            default: None,
        };
        assert_eq!(arr.width(), 8);
    }

    #[test]
    fn test_handle_kinds() {
        assert_eq!(
            simple(1, PropertyType::String).handle_kind(),
            Some(HandleKind::String)
        );
        assert_eq!(simple(2, PropertyType::Long).handle_kind(), None);
        let many = PropertyDesc {
            id: PropertyId(3),
            name: "items".into(),
            kind: PropertyKind::Reference(ReferenceDesc {
                target_class: ClassId(1),
                multiplicity: Multiplicity::Many,
                track_inverse: true,
                on_delete: DeleteTargetAction::Prevent,
            }),
            default: None,
        };
        assert_eq!(many.handle_kind(), Some(HandleKind::Blob));
    }

    #[test]
    fn test_same_shape_rejects_type_change() {
        assert!(simple(1, PropertyType::Int).same_shape(&simple(1, PropertyType::Int)));
        assert!(!simple(1, PropertyType::Int).same_shape(&simple(1, PropertyType::Long)));
        let r = |m| PropertyDesc {
            id: PropertyId(9),
            name: "r".into(),
            kind: PropertyKind::Reference(ReferenceDesc {
                target_class: ClassId(1),
                multiplicity: m,
                track_inverse: false,
                on_delete: DeleteTargetAction::SetNull,
            }),
            default: None,
        };
        // single <-> single detail changes keep the shape
        assert!(r(Multiplicity::ZeroOrOne).same_shape(&r(Multiplicity::One)));
        // single <-> many changes the physical slot
        assert!(!r(Multiplicity::ZeroOrOne).same_shape(&r(Multiplicity::Many)));
    }
}
