//! Property types and values
//!
//! A property is either a simple scalar, an array of simple scalars, or an
//! object reference. Simple values are packed into object records at fixed
//! byte offsets; strings and arrays are stored as 64-bit handles into the
//! interned string/blob pools.

use crate::types::ObjectId;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Simple property type.
///
/// `DateTime` is carried as UTC microseconds in an `i64` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    /// Unsigned 8-bit integer.
    Byte,
    /// Signed 16-bit integer.
    Short,
    /// Signed 32-bit integer.
    Int,
    /// Signed 64-bit integer.
    Long,
    /// 32-bit IEEE float.
    Float,
    /// 64-bit IEEE float.
    Double,
    /// Boolean, one byte in the record.
    Bool,
    /// UTC timestamp, microseconds since the epoch.
    #[serde(rename = "datetime")]
    DateTime,
    /// Interned string; the record slot holds a 64-bit pool handle.
    String,
}

impl PropertyType {
    /// Width in bytes of this type's record slot.
    pub const fn width(self) -> usize {
        match self {
            PropertyType::Byte | PropertyType::Bool => 1,
            PropertyType::Short => 2,
            PropertyType::Int | PropertyType::Float => 4,
            PropertyType::Long
            | PropertyType::Double
            | PropertyType::DateTime
            | PropertyType::String => 8,
        }
    }

    /// Whether this type stores a pool handle rather than an inline scalar.
    pub const fn is_handle(self) -> bool {
        matches!(self, PropertyType::String)
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyType::Byte => "byte",
            PropertyType::Short => "short",
            PropertyType::Int => "int",
            PropertyType::Long => "long",
            PropertyType::Float => "float",
            PropertyType::Double => "double",
            PropertyType::Bool => "bool",
            PropertyType::DateTime => "datetime",
            PropertyType::String => "string",
        };
        f.write_str(name)
    }
}

/// A property value as seen by stored procedures and defaults.
///
/// Record slots hold the packed form; this enum is the unpacked, owned form
/// used at the API boundary and for declared default values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyValue {
    /// Unsigned 8-bit integer.
    Byte(u8),
    /// Signed 16-bit integer.
    Short(i16),
    /// Signed 32-bit integer.
    Int(i32),
    /// Signed 64-bit integer.
    Long(i64),
    /// 32-bit IEEE float.
    Float(f32),
    /// 64-bit IEEE float.
    Double(f64),
    /// Boolean.
    Bool(bool),
    /// UTC microseconds since the epoch.
    #[serde(rename = "datetime")]
    DateTime(i64),
    /// Optional string; `None` packs as the null handle.
    String(Option<String>),
    /// Array of simple scalars; packs as a blob handle.
    Array(Vec<PropertyValue>),
    /// Object reference; `ObjectId::NULL` is the null reference.
    Reference(ObjectId),
    /// Reference with `many` multiplicity; packs as a blob of raw ids.
    ReferenceArray(Vec<ObjectId>),
}

impl PropertyValue {
    /// The simple type this value packs as, or `None` for arrays/references.
    pub fn simple_type(&self) -> Option<PropertyType> {
        match self {
            PropertyValue::Byte(_) => Some(PropertyType::Byte),
            PropertyValue::Short(_) => Some(PropertyType::Short),
            PropertyValue::Int(_) => Some(PropertyType::Int),
            PropertyValue::Long(_) => Some(PropertyType::Long),
            PropertyValue::Float(_) => Some(PropertyType::Float),
            PropertyValue::Double(_) => Some(PropertyType::Double),
            PropertyValue::Bool(_) => Some(PropertyType::Bool),
            PropertyValue::DateTime(_) => Some(PropertyType::DateTime),
            PropertyValue::String(_) => Some(PropertyType::String),
            _ => None,
        }
    }

    /// Build a datetime value from a `chrono` timestamp.
    pub fn from_datetime(ts: DateTime<Utc>) -> Self {
        PropertyValue::DateTime(ts.timestamp_micros())
    }

    /// Interpret a datetime value as a `chrono` timestamp.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            PropertyValue::DateTime(micros) => Utc.timestamp_micros(*micros).single(),
            _ => None,
        }
    }
}
