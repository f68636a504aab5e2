//! Index descriptors

use serde::{Deserialize, Serialize};
use velox_core::{ClassId, IndexId, PropertyId};

/// Kind of secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Chained-bucket hash index; point lookups only.
    Hash,
    /// Ordered index; point and directional range queries.
    Sorted,
}

/// Per-key-property sort direction (sorted indexes only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    /// Ascending order.
    Ascending,
    /// Descending order.
    Descending,
}

/// String comparison rule for string key properties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StringCompare {
    /// Compare case-sensitively when true.
    pub case_sensitive: bool,
    /// Optional culture tag (carried through; comparison is Unicode
    /// simple-fold when case-insensitive).
    pub culture: Option<String>,
}

impl Default for StringCompare {
    fn default() -> Self {
        StringCompare {
            case_sensitive: true,
            culture: None,
        }
    }
}

/// Immutable index descriptor.
///
/// Composite keys compare lexicographically in `key_properties` order;
/// string fields compare under `string_compare`, numeric fields naturally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDesc {
    /// Model-wide index id.
    pub id: IndexId,
    /// Index name.
    pub name: String,
    /// Hash or sorted.
    pub kind: IndexKind,
    /// Ordered key property ids.
    pub key_properties: Vec<PropertyId>,
    /// Sort directions, parallel to `key_properties` (sorted only).
    pub sort_directions: Vec<SortDirection>,
    /// Whether key sets are unique across all covered classes.
    pub is_unique: bool,
    /// String comparison rule for string key fields.
    pub string_compare: StringCompare,
    /// Classes covered by this index.
    pub classes: Vec<ClassId>,
}

impl IndexDesc {
    /// Whether the index covers the given class directly.
    pub fn covers(&self, class: ClassId) -> bool {
        self.classes.contains(&class)
    }

    /// Whether two descriptors build identical key structures.
    ///
    /// Divergence in key properties, sort directions, or string rules
    /// means the index must be rebuilt rather than updated in place.
    pub fn same_key_structure(&self, other: &IndexDesc) -> bool {
        self.kind == other.kind
            && self.key_properties == other.key_properties
            && self.sort_directions == other.sort_directions
            && self.string_compare == other.string_compare
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(keys: &[u16], unique: bool) -> IndexDesc {
        IndexDesc {
            id: IndexId(1),
            name: "ix".into(),
            kind: IndexKind::Hash,
            key_properties: keys.iter().map(|k| PropertyId(*k)).collect(),
            sort_directions: vec![],
            is_unique: unique,
            string_compare: StringCompare::default(),
            classes: vec![ClassId(1)],
        }
    }

    #[test]
    fn test_same_key_structure() {
        assert!(desc(&[1, 2], false).same_key_structure(&desc(&[1, 2], true)));
        assert!(!desc(&[1, 2], false).same_key_structure(&desc(&[2, 1], false)));
        let mut insensitive = desc(&[1], false);
        insensitive.string_compare.case_sensitive = false;
        assert!(!desc(&[1], false).same_key_structure(&insensitive));
    }

    #[test]
    fn test_covers() {
        assert!(desc(&[1], false).covers(ClassId(1)));
        assert!(!desc(&[1], false).covers(ClassId(2)));
    }
}
