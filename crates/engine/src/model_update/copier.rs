//! Generated object copier
//!
//! A schema update that inserts or deletes properties changes a class's
//! physical layout; every live record (all versions) is rewritten through
//! a copier generated once per class at plan time:
//!
//! - surviving properties copy raw bytes from the source offset to the
//!   destination offset at the correct width,
//! - deleted string/array properties release their pool handle before the
//!   source bytes are dropped,
//! - inserted simple properties receive their declared default (strings
//!   and arrays default to the null handle).
//!
//! Record headers (`next_collision`, `next_version`, `reader_info`) live
//! outside the data area and are untouched, preserving identity and
//! transactional visibility.

use byteorder::{ByteOrder, LittleEndian};
use smallvec::SmallVec;
use std::sync::Arc;
use velox_core::PropertyValue;
use velox_model::{ClassDesc, HandleKind, HandleSlot};
use velox_storage::RefPool;

#[derive(Debug, Clone, Copy)]
struct CopySpec {
    src: u32,
    dst: u32,
    width: u32,
}

/// Byte-level rewrite plan from one class layout to its successor.
#[derive(Debug)]
pub struct ClassCopier {
    copies: Vec<CopySpec>,
    drops: Vec<HandleSlot>,
    defaults: Vec<(u32, SmallVec<[u8; 8]>)>,
    old_size: usize,
    new_size: usize,
}

impl ClassCopier {
    /// Generate the copier for a class transition.
    pub fn generate(old: &ClassDesc, new: &ClassDesc) -> ClassCopier {
        let mut copies = Vec::new();
        let mut defaults = Vec::new();
        for (pos, prop) in new.properties.iter().enumerate() {
            let dst = new.offsets[pos];
            match old.property_pos(prop.id) {
                Some(old_pos) => copies.push(CopySpec {
                    src: old.offsets[old_pos],
                    dst,
                    width: prop.width() as u32,
                }),
                None => {
                    let bytes = prop
                        .default
                        .as_ref()
                        .map(encode_default)
                        .unwrap_or_else(|| SmallVec::from_slice(&vec![0u8; prop.width()]));
                    if bytes.iter().any(|b| *b != 0) {
                        defaults.push((dst, bytes));
                    }
                }
            }
        }
        let drops = old
            .properties
            .iter()
            .enumerate()
            .filter(|(_, p)| !new.has_property(p.id))
            .filter_map(|(pos, p)| {
                p.handle_kind().map(|kind| HandleSlot {
                    offset: old.offsets[pos],
                    kind,
                })
            })
            .collect();
        ClassCopier {
            copies,
            drops,
            defaults,
            old_size: old.record_size as usize,
            new_size: new.record_size as usize,
        }
    }

    /// Rewrite one record's data area.
    ///
    /// Tombstones (empty data) pass through unchanged; they own nothing.
    pub fn apply(&self, src: &[u8], strings: &RefPool, blobs: &RefPool) -> Arc<[u8]> {
        if src.len() < self.old_size {
            return Arc::from(src.to_vec().into_boxed_slice());
        }
        let mut dst = vec![0u8; self.new_size];
        for copy in &self.copies {
            let (s, d, w) = (copy.src as usize, copy.dst as usize, copy.width as usize);
            dst[d..d + w].copy_from_slice(&src[s..s + w]);
        }
        for (offset, bytes) in &self.defaults {
            let d = *offset as usize;
            dst[d..d + bytes.len()].copy_from_slice(bytes);
        }
        for drop in &self.drops {
            let handle = LittleEndian::read_u64(&src[drop.offset as usize..]);
            match drop.kind {
                HandleKind::String => strings.dec_ref(handle),
                HandleKind::Blob => blobs.dec_ref(handle),
            }
        }
        Arc::from(dst.into_boxed_slice())
    }
}

fn encode_default(value: &PropertyValue) -> SmallVec<[u8; 8]> {
    let mut out = SmallVec::new();
    match value {
        PropertyValue::Byte(v) => out.push(*v),
        PropertyValue::Bool(v) => out.push(*v as u8),
        PropertyValue::Short(v) => out.extend_from_slice(&v.to_le_bytes()),
        PropertyValue::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
        PropertyValue::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
        PropertyValue::Long(v) | PropertyValue::DateTime(v) => {
            out.extend_from_slice(&v.to_le_bytes())
        }
        PropertyValue::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
        // strings, arrays, and references start at the null handle
        _ => out.extend_from_slice(&0u64.to_le_bytes()),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use velox_core::{ClassId, PropertyId, PropertyType};
    use velox_model::{PropertyDesc, PropertyKind};

    fn class(props: Vec<(u16, PropertyKind, Option<PropertyValue>)>) -> ClassDesc {
        ClassDesc::new(
            ClassId(1),
            "Teacher".into(),
            None,
            false,
            0,
            None,
            props
                .into_iter()
                .map(|(id, kind, default)| PropertyDesc {
                    id: PropertyId(id),
                    name: format!("p{id}"),
                    kind,
                    default,
                })
                .collect(),
        )
    }

    #[test]
    fn test_surviving_fields_copied_at_new_offsets() {
        let old = class(vec![
            (1, PropertyKind::Simple(PropertyType::Int), None),
            (2, PropertyKind::Simple(PropertyType::Long), None),
        ]);
        let new = class(vec![(2, PropertyKind::Simple(PropertyType::Long), None)]);
        let copier = ClassCopier::generate(&old, &new);

        let strings = RefPool::new();
        let blobs = RefPool::new();
        let mut src = vec![0u8; old.record_size as usize];
        src[4..12].copy_from_slice(&77i64.to_le_bytes());
        let dst = copier.apply(&src, &strings, &blobs);
        assert_eq!(dst.len(), 8);
        assert_eq!(LittleEndian::read_i64(&dst[0..8]), 77);
    }

    #[test]
    fn test_inserted_property_gets_default() {
        let old = class(vec![(1, PropertyKind::Simple(PropertyType::Int), None)]);
        let new = class(vec![
            (1, PropertyKind::Simple(PropertyType::Int), None),
            (
                2,
                PropertyKind::Simple(PropertyType::Long),
                Some(PropertyValue::Long(42)),
            ),
            (3, PropertyKind::Simple(PropertyType::String), None),
        ]);
        let copier = ClassCopier::generate(&old, &new);

        let strings = RefPool::new();
        let blobs = RefPool::new();
        let src = vec![0u8; old.record_size as usize];
        let dst = copier.apply(&src, &strings, &blobs);
        assert_eq!(LittleEndian::read_i64(&dst[4..12]), 42);
        // the inserted string defaults to the null handle
        assert_eq!(LittleEndian::read_u64(&dst[12..20]), 0);
    }

    #[test]
    fn test_deleted_string_property_releases_handle() {
        let old = class(vec![
            (1, PropertyKind::Simple(PropertyType::String), None),
            (2, PropertyKind::Simple(PropertyType::Int), None),
        ]);
        let new = class(vec![(2, PropertyKind::Simple(PropertyType::Int), None)]);
        let copier = ClassCopier::generate(&old, &new);

        let strings = RefPool::new();
        let blobs = RefPool::new();
        let handle = strings.acquire(b"bye", true);
        let mut src = vec![0u8; old.record_size as usize];
        src[0..8].copy_from_slice(&handle.to_le_bytes());
        src[8..12].copy_from_slice(&5i32.to_le_bytes());

        let dst = copier.apply(&src, &strings, &blobs);
        assert_eq!(LittleEndian::read_i32(&dst[0..4]), 5);
        assert_eq!(strings.refs(handle), 0);
    }

    #[test]
    fn test_tombstone_passes_through() {
        let old = class(vec![(1, PropertyKind::Simple(PropertyType::Long), None)]);
        let new = class(vec![]);
        let copier = ClassCopier::generate(&old, &new);
        let strings = RefPool::new();
        let blobs = RefPool::new();
        let dst = copier.apply(&[], &strings, &blobs);
        assert!(dst.is_empty());
    }
}
