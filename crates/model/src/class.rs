//! Class descriptors and physical layout
//!
//! A compiled class descriptor carries the flattened property list
//! (inherited properties first), the fixed byte offset of every property
//! slot, the derived descendant set, and the arrays of indexes and inbound
//! tracked references that point into the class. Object records hold raw
//! bytes only; all schema knowledge lives here.

use crate::property::{DeleteTargetAction, HandleKind, PropertyDesc};
use rustc_hash::FxHashMap;
use velox_core::{ClassId, IndexId, PropertyId};

/// A handle-valued slot in the class layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleSlot {
    /// Byte offset of the 64-bit handle within the record data.
    pub offset: u32,
    /// Pool the handle points into.
    pub kind: HandleKind,
}

/// A reference property pointing into this class (or an ancestor of it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRef {
    /// Class that declares the reference.
    pub source_class: ClassId,
    /// The reference property.
    pub property: PropertyId,
    /// Whether the inverse-reference map indexes it.
    pub track_inverse: bool,
    /// Action taken on sources when a target is deleted.
    pub on_delete: DeleteTargetAction,
}

/// Immutable compiled class descriptor.
#[derive(Debug, Clone)]
pub struct ClassDesc {
    /// Model-wide class id.
    pub id: ClassId,
    /// Class name.
    pub name: String,
    /// Base class, if any.
    pub base: Option<ClassId>,
    /// Abstract classes cannot be instantiated.
    pub is_abstract: bool,
    /// Write-ahead-log partition this class's records append to.
    pub log_index: u32,
    /// Log partition name as declared, if any.
    pub log_name: Option<String>,
    /// Flattened property list, inherited properties first.
    pub properties: Vec<PropertyDesc>,
    /// Byte offset of each property slot, parallel to `properties`.
    pub offsets: Vec<u32>,
    /// Total size in bytes of the packed data area.
    pub record_size: u32,
    /// Derived descendant class ids, self included, in id order.
    pub descendants: Vec<ClassId>,
    /// Indexes covering this class.
    pub indexes: Vec<IndexId>,
    /// Reference properties whose target is this class or an ancestor.
    pub inbound_refs: Vec<InboundRef>,
    /// Handle-valued slots, in offset order.
    pub handle_slots: Vec<HandleSlot>,

    lookup: FxHashMap<PropertyId, usize>,
}

impl ClassDesc {
    /// Compile the layout for a flattened property list.
    ///
    /// `descendants`, `indexes`, and `inbound_refs` are derived model-wide
    /// and filled in by the model builder.
    pub fn new(
        id: ClassId,
        name: String,
        base: Option<ClassId>,
        is_abstract: bool,
        log_index: u32,
        log_name: Option<String>,
        properties: Vec<PropertyDesc>,
    ) -> Self {
        let mut offsets = Vec::with_capacity(properties.len());
        let mut handle_slots = Vec::new();
        let mut lookup = FxHashMap::default();
        let mut at: u32 = 0;
        for (i, prop) in properties.iter().enumerate() {
            offsets.push(at);
            if let Some(kind) = prop.handle_kind() {
                handle_slots.push(HandleSlot { offset: at, kind });
            }
            lookup.insert(prop.id, i);
            at += prop.width() as u32;
        }
        ClassDesc {
            id,
            name,
            base,
            is_abstract,
            log_index,
            log_name,
            properties,
            offsets,
            record_size: at,
            descendants: vec![id],
            indexes: Vec::new(),
            inbound_refs: Vec::new(),
            handle_slots,
            lookup,
        }
    }

    /// Position of a property in the flattened list.
    pub fn property_pos(&self, id: PropertyId) -> Option<usize> {
        self.lookup.get(&id).copied()
    }

    /// Descriptor of a property by id.
    pub fn property(&self, id: PropertyId) -> Option<&PropertyDesc> {
        self.property_pos(id).map(|i| &self.properties[i])
    }

    /// Byte offset of a property's slot.
    pub fn offset_of(&self, id: PropertyId) -> Option<u32> {
        self.property_pos(id).map(|i| self.offsets[i])
    }

    /// Whether the class (or hierarchy above it) defines the property.
    pub fn has_property(&self, id: PropertyId) -> bool {
        self.lookup.contains_key(&id)
    }

    /// Reference properties declared by this class (flattened view).
    pub fn reference_properties(&self) -> impl Iterator<Item = &PropertyDesc> {
        self.properties.iter().filter(|p| p.reference().is_some())
    }
}
