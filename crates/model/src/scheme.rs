//! Model descriptor ingestion document
//!
//! The structured document handed to the engine by its host: classes with
//! their properties, and indexes. Ids are 16-bit shorts. The document is
//! plain data; [`crate::Model::from_scheme`] validates and compiles it.

use crate::index::{IndexKind, SortDirection};
use crate::property::{DeleteTargetAction, Multiplicity};
use serde::{Deserialize, Serialize};
use velox_core::{PropertyType, PropertyValue};

/// Top-level ingestion document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelScheme {
    /// Class declarations.
    #[serde(default)]
    pub classes: Vec<ClassScheme>,
    /// Index declarations.
    #[serde(default)]
    pub indexes: Vec<IndexScheme>,
}

/// A class declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassScheme {
    /// Class id (16-bit).
    pub id: u16,
    /// Class name.
    pub name: String,
    /// Base class id, if any.
    #[serde(default)]
    pub base_id: Option<u16>,
    /// Abstract classes cannot be instantiated.
    #[serde(default)]
    pub is_abstract: bool,
    /// Named write-ahead-log partition; unnamed classes share partition 0.
    #[serde(default)]
    pub log_name: Option<String>,
    /// Properties declared directly on this class (inherited ones are not
    /// repeated).
    #[serde(default)]
    pub properties: Vec<PropertyScheme>,
}

/// Kind discriminator of a property declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertySchemeKind {
    /// Simple scalar.
    Simple,
    /// Array of simple scalars.
    Array,
    /// Object reference.
    Reference,
}

/// A property declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyScheme {
    /// Property id (16-bit, unique model-wide).
    pub id: u16,
    /// Property name, unique within the class hierarchy.
    pub name: String,
    /// Simple, array, or reference.
    pub kind: PropertySchemeKind,
    /// Element type for simple and array properties.
    #[serde(rename = "type", default)]
    pub value_type: Option<PropertyType>,
    /// Reference multiplicity.
    #[serde(default)]
    pub multiplicity: Option<Multiplicity>,
    /// Reference target class id.
    #[serde(default)]
    pub target_class_id: Option<u16>,
    /// Whether the inverse-reference map indexes this reference.
    #[serde(default)]
    pub track_inverse: bool,
    /// Action on the source when the reference's target is deleted.
    #[serde(default)]
    pub delete_target_action: Option<DeleteTargetAction>,
    /// Declared default for simple properties.
    #[serde(default)]
    pub default_value: Option<PropertyValue>,
}

/// An index declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexScheme {
    /// Index id (16-bit).
    pub id: u16,
    /// Index name.
    pub name: String,
    /// Hash or sorted.
    pub kind: IndexKind,
    /// Ordered key property ids.
    pub key_property_ids: Vec<u16>,
    /// Sort directions, parallel to the key (sorted only); empty means
    /// all ascending.
    #[serde(default)]
    pub sort_directions: Vec<SortDirection>,
    /// Whether key sets must be unique across covered classes.
    #[serde(default)]
    pub is_unique: bool,
    /// String comparison case rule; defaults to case-sensitive.
    #[serde(default = "default_case_sensitive")]
    pub case_sensitive: bool,
    /// Optional culture tag for string comparison.
    #[serde(default)]
    pub culture: Option<String>,
    /// Covered class ids.
    pub class_ids: Vec<u16>,
}

fn default_case_sensitive() -> bool {
    true
}
