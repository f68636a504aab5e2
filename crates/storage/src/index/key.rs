//! Index keys and extraction
//!
//! A key is a short vector of normalised values. Numeric fields widen to
//! 64 bits and compare naturally; strings compare under the index's case
//! rule (normalised at extraction time); composite keys compare
//! lexicographically in the descriptor's property order.

use crate::refpool::RefPool;
use byteorder::{ByteOrder, LittleEndian};
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use velox_core::{DbError, PropertyType, PropertyValue, Result};
use velox_model::{ClassDesc, IndexDesc, PropertyKind};

/// One normalised key field.
#[derive(Debug, Clone)]
pub enum KeyValue {
    /// Null string field.
    Null,
    /// Boolean field.
    Bool(bool),
    /// Any integer or datetime field, widened.
    Long(i64),
    /// Any float field, widened.
    Double(f64),
    /// String field, case-normalised per the index descriptor.
    Str(String),
}

impl KeyValue {
    fn rank(&self) -> u8 {
        match self {
            KeyValue::Null => 0,
            KeyValue::Bool(_) => 1,
            KeyValue::Long(_) => 2,
            KeyValue::Double(_) => 3,
            KeyValue::Str(_) => 4,
        }
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyValue::Bool(a), KeyValue::Bool(b)) => a.cmp(b),
            (KeyValue::Long(a), KeyValue::Long(b)) => a.cmp(b),
            (KeyValue::Double(a), KeyValue::Double(b)) => a.total_cmp(b),
            (KeyValue::Str(a), KeyValue::Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for KeyValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            KeyValue::Null => {}
            KeyValue::Bool(v) => v.hash(state),
            KeyValue::Long(v) => v.hash(state),
            KeyValue::Double(v) => v.to_bits().hash(state),
            KeyValue::Str(v) => v.hash(state),
        }
    }
}

/// A composite index key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexKey(pub SmallVec<[KeyValue; 2]>);

impl IndexKey {
    /// Build a key from field values.
    pub fn new(fields: impl IntoIterator<Item = KeyValue>) -> Self {
        IndexKey(fields.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy)]
struct KeyField {
    offset: u32,
    ty: PropertyType,
}

/// Extracts an [`IndexKey`] from raw record bytes of one class.
///
/// Built once per `(index, covered class)` pair from the index descriptor
/// and the class's property offsets.
#[derive(Debug, Clone)]
pub struct KeyExtractor {
    fields: SmallVec<[KeyField; 2]>,
    case_sensitive: bool,
}

impl KeyExtractor {
    /// Derive the extractor; `None` if the class lacks a key property.
    pub fn new(index: &IndexDesc, class: &ClassDesc) -> Option<Self> {
        let mut fields = SmallVec::new();
        for prop_id in &index.key_properties {
            let pos = class.property_pos(*prop_id)?;
            let ty = match &class.properties[pos].kind {
                PropertyKind::Simple(t) => *t,
                _ => return None,
            };
            fields.push(KeyField {
                offset: class.offsets[pos],
                ty,
            });
        }
        Some(KeyExtractor {
            fields,
            case_sensitive: index.string_compare.case_sensitive,
        })
    }

    /// Extract the key from packed record bytes.
    pub fn extract(&self, data: &[u8], strings: &RefPool) -> IndexKey {
        let mut out = SmallVec::with_capacity(self.fields.len());
        for field in &self.fields {
            let at = field.offset as usize;
            let value = match field.ty {
                PropertyType::Byte => KeyValue::Long(data[at] as i64),
                PropertyType::Short => KeyValue::Long(LittleEndian::read_i16(&data[at..]) as i64),
                PropertyType::Int => KeyValue::Long(LittleEndian::read_i32(&data[at..]) as i64),
                PropertyType::Long | PropertyType::DateTime => {
                    KeyValue::Long(LittleEndian::read_i64(&data[at..]))
                }
                PropertyType::Float => {
                    KeyValue::Double(LittleEndian::read_f32(&data[at..]) as f64)
                }
                PropertyType::Double => KeyValue::Double(LittleEndian::read_f64(&data[at..])),
                PropertyType::Bool => KeyValue::Bool(data[at] != 0),
                PropertyType::String => {
                    let handle = LittleEndian::read_u64(&data[at..]);
                    match strings.get(handle) {
                        None => KeyValue::Null,
                        Some(bytes) => {
                            let s = String::from_utf8_lossy(&bytes);
                            KeyValue::Str(normalise(&s, self.case_sensitive))
                        }
                    }
                }
            };
            out.push(value);
        }
        IndexKey(out)
    }
}

/// Build a lookup key from caller-supplied values, applying the index's
/// case rule to strings.
pub fn key_from_values(values: &[PropertyValue], case_sensitive: bool) -> Result<IndexKey> {
    let mut out = SmallVec::with_capacity(values.len());
    for value in values {
        let field = match value {
            PropertyValue::Byte(v) => KeyValue::Long(*v as i64),
            PropertyValue::Short(v) => KeyValue::Long(*v as i64),
            PropertyValue::Int(v) => KeyValue::Long(*v as i64),
            PropertyValue::Long(v) => KeyValue::Long(*v),
            PropertyValue::DateTime(v) => KeyValue::Long(*v),
            PropertyValue::Float(v) => KeyValue::Double(*v as f64),
            PropertyValue::Double(v) => KeyValue::Double(*v),
            PropertyValue::Bool(v) => KeyValue::Bool(*v),
            PropertyValue::String(None) => KeyValue::Null,
            PropertyValue::String(Some(s)) => KeyValue::Str(normalise(s, case_sensitive)),
            _ => {
                return Err(DbError::TypeMismatch {
                    property: velox_core::PropertyId(0),
                })
            }
        };
        out.push(field);
    }
    Ok(IndexKey(out))
}

fn normalise(s: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        s.to_owned()
    } else {
        s.to_lowercase()
    }
}
