//! Object record views
//!
//! Object records carry no schema information, only raw bytes; these views
//! are parameterised by the class descriptor. [`ObjectReader`] is the
//! read-only view over a visible version; [`ObjectData`] is the owned,
//! mutable buffer a transaction edits before commit.
//!
//! An [`ObjectData`] co-owns every handle it holds: building one from an
//! existing version increments the handle refcounts, and releasing it
//! (rollback) decrements them. A committed buffer's handles transfer to the
//! installed version, whose counts are released only when garbage
//! collection reclaims the version.

use crate::refpool::{decode_longs, encode_longs, RefPool, NULL_HANDLE};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::Arc;
use velox_core::{DbError, ObjectId, PropertyId, PropertyType, PropertyValue, Result};
use velox_model::{ClassDesc, HandleKind, Multiplicity, PropertyKind};

/// Read-only view of one visible object version.
#[derive(Debug, Clone)]
pub struct ObjectReader<'a> {
    /// The object's id.
    pub id: ObjectId,
    /// Commit version of the viewed version.
    pub version: u64,
    class: &'a ClassDesc,
    data: &'a [u8],
}

impl<'a> ObjectReader<'a> {
    /// Wrap raw record bytes with their class descriptor.
    pub fn new(id: ObjectId, version: u64, class: &'a ClassDesc, data: &'a [u8]) -> Self {
        ObjectReader {
            id,
            version,
            class,
            data,
        }
    }

    /// Raw bytes of a field at `offset` of the given width.
    pub fn get_simple(&self, offset: usize, width: usize) -> &[u8] {
        &self.data[offset..offset + width]
    }

    /// Read a 64-bit field without type dispatch; used by validators.
    pub fn get_long_optimized(&self, offset: usize) -> i64 {
        LittleEndian::read_i64(&self.data[offset..offset + 8])
    }

    /// The object's own id as a raw 64-bit value.
    pub fn get_id_optimized(&self) -> i64 {
        self.id.as_u64() as i64
    }

    /// Read a reference-array field: resolve the blob handle at `offset`
    /// and decode it as raw 64-bit ids.
    pub fn get_long_array_optimized(&self, offset: usize, blobs: &RefPool) -> Vec<i64> {
        let handle = LittleEndian::read_u64(&self.data[offset..offset + 8]);
        match blobs.get(handle) {
            Some(bytes) => decode_longs(&bytes),
            None => Vec::new(),
        }
    }

    /// The 64-bit handle stored at `offset`.
    pub fn handle_at(&self, offset: usize) -> u64 {
        LittleEndian::read_u64(&self.data[offset..offset + 8])
    }

    /// Unpack a property into its owned value form.
    pub fn read_value(
        &self,
        property: PropertyId,
        strings: &RefPool,
        blobs: &RefPool,
    ) -> Result<PropertyValue> {
        let pos = self
            .class
            .property_pos(property)
            .ok_or(DbError::UnknownProperty {
                class: self.class.id,
                property,
            })?;
        let offset = self.class.offsets[pos] as usize;
        let prop = &self.class.properties[pos];
        Ok(match &prop.kind {
            PropertyKind::Simple(t) => read_simple(self.data, offset, *t, strings),
            PropertyKind::Array(t) => {
                let handle = self.handle_at(offset);
                match blobs.get(handle) {
                    None => PropertyValue::Array(Vec::new()),
                    Some(bytes) => PropertyValue::Array(decode_array(&bytes, *t)),
                }
            }
            PropertyKind::Reference(r) => {
                if r.multiplicity == Multiplicity::Many {
                    let ids = self
                        .get_long_array_optimized(offset, blobs)
                        .into_iter()
                        .map(|v| ObjectId::from_u64(v as u64))
                        .collect();
                    PropertyValue::ReferenceArray(ids)
                } else {
                    PropertyValue::Reference(ObjectId::from_u64(
                        self.get_long_optimized(offset) as u64,
                    ))
                }
            }
        })
    }

    /// The single-reference value at a property, bypassing value boxing.
    pub fn reference_at(&self, offset: usize) -> ObjectId {
        ObjectId::from_u64(self.get_long_optimized(offset) as u64)
    }
}

fn read_simple(data: &[u8], offset: usize, ty: PropertyType, strings: &RefPool) -> PropertyValue {
    match ty {
        PropertyType::Byte => PropertyValue::Byte(data[offset]),
        PropertyType::Short => PropertyValue::Short(LittleEndian::read_i16(&data[offset..])),
        PropertyType::Int => PropertyValue::Int(LittleEndian::read_i32(&data[offset..])),
        PropertyType::Long => PropertyValue::Long(LittleEndian::read_i64(&data[offset..])),
        PropertyType::Float => PropertyValue::Float(LittleEndian::read_f32(&data[offset..])),
        PropertyType::Double => PropertyValue::Double(LittleEndian::read_f64(&data[offset..])),
        PropertyType::Bool => PropertyValue::Bool(data[offset] != 0),
        PropertyType::DateTime => {
            PropertyValue::DateTime(LittleEndian::read_i64(&data[offset..]))
        }
        PropertyType::String => {
            let handle = LittleEndian::read_u64(&data[offset..]);
            match strings.get(handle) {
                None => PropertyValue::String(None),
                Some(bytes) => {
                    PropertyValue::String(Some(String::from_utf8_lossy(&bytes).into_owned()))
                }
            }
        }
    }
}

fn decode_array(bytes: &[u8], ty: PropertyType) -> Vec<PropertyValue> {
    let width = ty.width();
    bytes
        .chunks_exact(width)
        .map(|chunk| match ty {
            PropertyType::Byte => PropertyValue::Byte(chunk[0]),
            PropertyType::Short => PropertyValue::Short(LittleEndian::read_i16(chunk)),
            PropertyType::Int => PropertyValue::Int(LittleEndian::read_i32(chunk)),
            PropertyType::Long => PropertyValue::Long(LittleEndian::read_i64(chunk)),
            PropertyType::Float => PropertyValue::Float(LittleEndian::read_f32(chunk)),
            PropertyType::Double => PropertyValue::Double(LittleEndian::read_f64(chunk)),
            PropertyType::Bool => PropertyValue::Bool(chunk[0] != 0),
            PropertyType::DateTime => PropertyValue::DateTime(LittleEndian::read_i64(chunk)),
            // string arrays are not representable; validated at model build
            PropertyType::String => PropertyValue::String(None),
        })
        .collect()
}

fn encode_array(values: &[PropertyValue], ty: PropertyType) -> Result<Vec<u8>> {
    let width = ty.width();
    let mut out = vec![0u8; values.len() * width];
    for (i, value) in values.iter().enumerate() {
        let chunk = &mut out[i * width..(i + 1) * width];
        match (ty, value) {
            (PropertyType::Byte, PropertyValue::Byte(v)) => chunk[0] = *v,
            (PropertyType::Short, PropertyValue::Short(v)) => LittleEndian::write_i16(chunk, *v),
            (PropertyType::Int, PropertyValue::Int(v)) => LittleEndian::write_i32(chunk, *v),
            (PropertyType::Long, PropertyValue::Long(v)) => LittleEndian::write_i64(chunk, *v),
            (PropertyType::Float, PropertyValue::Float(v)) => LittleEndian::write_f32(chunk, *v),
            (PropertyType::Double, PropertyValue::Double(v)) => {
                LittleEndian::write_f64(chunk, *v)
            }
            (PropertyType::Bool, PropertyValue::Bool(v)) => chunk[0] = *v as u8,
            (PropertyType::DateTime, PropertyValue::DateTime(v)) => {
                LittleEndian::write_i64(chunk, *v)
            }
            _ => {
                return Err(DbError::TypeMismatch {
                    property: PropertyId(0),
                })
            }
        }
    }
    Ok(out)
}

/// Owned, mutable object buffer edited inside a transaction.
#[derive(Debug)]
pub struct ObjectData {
    class: Arc<ClassDesc>,
    bytes: Box<[u8]>,
}

impl ObjectData {
    /// Fresh buffer: zeroed slots, then declared simple defaults applied.
    /// Strings and arrays start at the null handle.
    pub fn new_default(class: Arc<ClassDesc>, strings: &RefPool, blobs: &RefPool) -> Result<Self> {
        let mut data = ObjectData {
            bytes: vec![0u8; class.record_size as usize].into_boxed_slice(),
            class,
        };
        let defaults: Vec<(PropertyId, PropertyValue)> = data
            .class
            .properties
            .iter()
            .filter_map(|p| p.default.clone().map(|d| (p.id, d)))
            .collect();
        for (prop, value) in defaults {
            data.set_value(prop, &value, strings, blobs)?;
        }
        Ok(data)
    }

    /// Buffer seeded from an existing version's bytes. Every handle slot is
    /// `inc_ref`'d: the buffer co-owns the values alongside the source
    /// version.
    pub fn from_existing(
        class: Arc<ClassDesc>,
        bytes: &[u8],
        strings: &RefPool,
        blobs: &RefPool,
    ) -> Self {
        let data = ObjectData {
            bytes: bytes.into(),
            class,
        };
        for slot in &data.class.handle_slots {
            let handle = LittleEndian::read_u64(&data.bytes[slot.offset as usize..]);
            match slot.kind {
                HandleKind::String => strings.inc_ref(handle),
                HandleKind::Blob => blobs.inc_ref(handle),
            }
        }
        data
    }

    /// The buffer's class descriptor.
    pub fn class(&self) -> &Arc<ClassDesc> {
        &self.class
    }

    /// Raw bytes of the buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Read a property back out of the buffer.
    pub fn read_value(
        &self,
        id: ObjectId,
        property: PropertyId,
        strings: &RefPool,
        blobs: &RefPool,
    ) -> Result<PropertyValue> {
        ObjectReader::new(id, 0, &self.class, &self.bytes).read_value(property, strings, blobs)
    }

    /// Write a property value, type-checked against the descriptor.
    ///
    /// Assigning over a handle-valued slot releases the replaced value and
    /// acquires the new one.
    pub fn set_value(
        &mut self,
        property: PropertyId,
        value: &PropertyValue,
        strings: &RefPool,
        blobs: &RefPool,
    ) -> Result<()> {
        let pos = self
            .class
            .property_pos(property)
            .ok_or(DbError::UnknownProperty {
                class: self.class.id,
                property,
            })?;
        let offset = self.class.offsets[pos] as usize;
        let kind = self.class.properties[pos].kind.clone();
        let mismatch = DbError::TypeMismatch { property };

        match (&kind, value) {
            (PropertyKind::Simple(t), v) => {
                if v.simple_type() != Some(*t) {
                    return Err(mismatch);
                }
                self.write_simple(offset, v, strings);
            }
            (PropertyKind::Array(t), PropertyValue::Array(items)) => {
                let encoded =
                    encode_array(items, *t).map_err(|_| DbError::TypeMismatch { property })?;
                let handle = if items.is_empty() {
                    NULL_HANDLE
                } else {
                    blobs.acquire(&encoded, false)
                };
                self.replace_handle(offset, handle, blobs);
            }
            (PropertyKind::Reference(r), PropertyValue::Reference(id))
                if r.multiplicity != Multiplicity::Many =>
            {
                LittleEndian::write_i64(&mut self.bytes[offset..], id.as_u64() as i64);
            }
            (PropertyKind::Reference(r), PropertyValue::ReferenceArray(ids))
                if r.multiplicity == Multiplicity::Many =>
            {
                let raw: Vec<i64> = ids.iter().map(|id| id.as_u64() as i64).collect();
                let handle = if raw.is_empty() {
                    NULL_HANDLE
                } else {
                    blobs.acquire(&encode_longs(&raw), false)
                };
                self.replace_handle(offset, handle, blobs);
            }
            _ => return Err(mismatch),
        }
        Ok(())
    }

    fn write_simple(&mut self, offset: usize, value: &PropertyValue, strings: &RefPool) {
        if let PropertyValue::String(s) = value {
            let handle = match s {
                None => NULL_HANDLE,
                Some(s) => strings.acquire(s.as_bytes(), true),
            };
            let old = LittleEndian::read_u64(&self.bytes[offset..]);
            LittleEndian::write_u64(&mut self.bytes[offset..], handle);
            strings.dec_ref(old);
            return;
        }
        let bytes = &mut self.bytes[offset..];
        match value {
            PropertyValue::Byte(v) => bytes[0] = *v,
            PropertyValue::Short(v) => LittleEndian::write_i16(bytes, *v),
            PropertyValue::Int(v) => LittleEndian::write_i32(bytes, *v),
            PropertyValue::Long(v) => LittleEndian::write_i64(bytes, *v),
            PropertyValue::Float(v) => LittleEndian::write_f32(bytes, *v),
            PropertyValue::Double(v) => LittleEndian::write_f64(bytes, *v),
            PropertyValue::Bool(v) => bytes[0] = *v as u8,
            PropertyValue::DateTime(v) => LittleEndian::write_i64(bytes, *v),
            _ => unreachable!("checked by set_value"),
        }
    }

    fn replace_handle(&mut self, offset: usize, handle: u64, pool: &RefPool) {
        let old = LittleEndian::read_u64(&self.bytes[offset..]);
        LittleEndian::write_u64(&mut self.bytes[offset..], handle);
        pool.dec_ref(old);
    }

    /// Single-reference value at a property position, for integrity checks.
    pub fn reference_value(&self, property: PropertyId) -> Option<ObjectId> {
        let pos = self.class.property_pos(property)?;
        let offset = self.class.offsets[pos] as usize;
        Some(ObjectId::from_u64(
            LittleEndian::read_i64(&self.bytes[offset..]) as u64,
        ))
    }

    /// Release every handle the buffer owns (rollback / discard path).
    pub fn release_handles(&self, strings: &RefPool, blobs: &RefPool) {
        for slot in &self.class.handle_slots {
            let handle = LittleEndian::read_u64(&self.bytes[slot.offset as usize..]);
            match slot.kind {
                HandleKind::String => strings.dec_ref(handle),
                HandleKind::Blob => blobs.dec_ref(handle),
            }
        }
    }

    /// Consume the buffer, transferring handle ownership to the caller.
    pub fn into_bytes(self) -> Arc<[u8]> {
        Arc::from(self.bytes)
    }
}

/// Release the handle slots of raw record bytes (version reclamation).
pub fn release_record_handles(
    class: &ClassDesc,
    data: &[u8],
    strings: &RefPool,
    blobs: &RefPool,
) {
    for slot in &class.handle_slots {
        let handle = LittleEndian::read_u64(&data[slot.offset as usize..]);
        match slot.kind {
            HandleKind::String => strings.dec_ref(handle),
            HandleKind::Blob => blobs.dec_ref(handle),
        }
    }
}
