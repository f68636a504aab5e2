//! Compiled, immutable model
//!
//! `Model::from_scheme` validates an ingestion document and compiles it:
//! base chains are resolved, properties flattened (inherited first), byte
//! offsets fixed, descendant sets derived, and index / inbound-reference
//! arrays attached to every class. A compiled model never changes; schema
//! evolution builds a new one and swaps it in atomically.

use crate::class::{ClassDesc, InboundRef};
use crate::index::{IndexDesc, SortDirection, StringCompare};
use crate::property::{
    DeleteTargetAction, Multiplicity, PropertyDesc, PropertyKind, ReferenceDesc,
};
use crate::scheme::{ClassScheme, ModelScheme, PropertyScheme, PropertySchemeKind};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use velox_core::{ClassId, DbError, IndexId, PropertyId, Result};

/// An immutable, versioned model.
#[derive(Debug, Clone)]
pub struct Model {
    /// Model version; bumped by every schema update.
    pub version: u64,
    classes: FxHashMap<ClassId, Arc<ClassDesc>>,
    indexes: FxHashMap<IndexId, Arc<IndexDesc>>,
    class_order: Vec<ClassId>,
    index_order: Vec<IndexId>,
    log_partitions: u32,
}

impl Model {
    /// The model with no classes, used before the first schema update.
    pub fn empty(version: u64) -> Self {
        Model {
            version,
            classes: FxHashMap::default(),
            indexes: FxHashMap::default(),
            class_order: Vec::new(),
            index_order: Vec::new(),
            log_partitions: 1,
        }
    }

    /// Validate and compile an ingestion document.
    pub fn from_scheme(scheme: &ModelScheme, version: u64) -> Result<Model> {
        let mut builder = ModelBuilder::new(scheme)?;
        builder.compile(version)
    }

    /// Look up a class descriptor.
    pub fn class(&self, id: ClassId) -> Option<&Arc<ClassDesc>> {
        self.classes.get(&id)
    }

    /// Class descriptor or an `InvalidClass` error.
    pub fn expect_class(&self, id: ClassId) -> Result<&Arc<ClassDesc>> {
        self.classes.get(&id).ok_or(DbError::InvalidClass { class: id })
    }

    /// Look up an index descriptor.
    pub fn index(&self, id: IndexId) -> Option<&Arc<IndexDesc>> {
        self.indexes.get(&id)
    }

    /// Classes in declaration order.
    pub fn classes(&self) -> impl Iterator<Item = &Arc<ClassDesc>> {
        self.class_order.iter().map(|id| &self.classes[id])
    }

    /// Indexes in declaration order.
    pub fn indexes(&self) -> impl Iterator<Item = &Arc<IndexDesc>> {
        self.index_order.iter().map(|id| &self.indexes[id])
    }

    /// Number of write-ahead-log partitions the model assigns.
    pub fn log_partitions(&self) -> u32 {
        self.log_partitions
    }

    /// Whether `concrete` is `declared` or one of its descendants.
    pub fn is_instance_of(&self, concrete: ClassId, declared: ClassId) -> bool {
        self.classes
            .get(&declared)
            .map(|c| c.descendants.binary_search(&concrete).is_ok())
            .unwrap_or(false)
    }

    /// The reference descriptor of a property, resolved via its owning class.
    pub fn reference_of(&self, class: ClassId, property: PropertyId) -> Option<&ReferenceDesc> {
        self.classes
            .get(&class)
            .and_then(|c| c.property(property))
            .and_then(|p| p.reference())
    }
}

struct ModelBuilder<'a> {
    scheme: &'a ModelScheme,
    by_id: FxHashMap<ClassId, &'a ClassScheme>,
    children: FxHashMap<ClassId, Vec<ClassId>>,
}

impl<'a> ModelBuilder<'a> {
    fn new(scheme: &'a ModelScheme) -> Result<Self> {
        let mut by_id = FxHashMap::default();
        let mut children: FxHashMap<ClassId, Vec<ClassId>> = FxHashMap::default();
        for class in &scheme.classes {
            let id = ClassId(class.id);
            if by_id.insert(id, class).is_some() {
                return Err(invalid(format!("duplicate class id {}", class.id)));
            }
        }
        for class in &scheme.classes {
            if let Some(base) = class.base_id {
                let base = ClassId(base);
                if !by_id.contains_key(&base) {
                    return Err(invalid(format!(
                        "class {} has unknown base {}",
                        class.id, base.as_u16()
                    )));
                }
                children.entry(base).or_default().push(ClassId(class.id));
            }
        }
        Ok(ModelBuilder {
            scheme,
            by_id,
            children,
        })
    }

    fn compile(&mut self, version: u64) -> Result<Model> {
        let mut model = Model::empty(version);
        let mut seen_props: FxHashSet<PropertyId> = FxHashSet::default();
        let mut log_names: Vec<String> = Vec::new();

        // Compile classes in declaration order; flattening walks base chains
        // (cycle detection rides along).
        for class in &self.scheme.classes {
            let id = ClassId(class.id);
            let flattened = self.flatten_properties(id)?;
            for prop in flattened.iter().skip(self.inherited_count(id)?) {
                if !seen_props.insert(prop.id) {
                    return Err(invalid(format!(
                        "duplicate property id {}",
                        prop.id.as_u16()
                    )));
                }
            }
            let log_index = match &class.log_name {
                None => 0,
                Some(name) => match log_names.iter().position(|n| n == name) {
                    Some(pos) => pos as u32 + 1,
                    None => {
                        log_names.push(name.clone());
                        log_names.len() as u32
                    }
                },
            };
            let desc = ClassDesc::new(
                id,
                class.name.clone(),
                class.base_id.map(ClassId),
                class.is_abstract,
                log_index,
                class.log_name.clone(),
                flattened,
            );
            model.classes.insert(id, Arc::new(desc));
            model.class_order.push(id);
        }
        model.log_partitions = log_names.len() as u32 + 1;

        self.derive_descendants(&mut model);
        self.validate_references(&model)?;
        self.compile_indexes(&mut model)?;
        self.derive_inbound_refs(&mut model)?;
        Ok(model)
    }

    /// Properties of the base chain (root first) followed by the class's own.
    fn flatten_properties(&self, id: ClassId) -> Result<Vec<PropertyDesc>> {
        let mut chain = Vec::new();
        let mut at = Some(id);
        let mut guard = 0usize;
        while let Some(current) = at {
            let class = self.by_id.get(&current).ok_or_else(|| {
                invalid(format!("unknown class {}", current.as_u16()))
            })?;
            chain.push(*class);
            at = class.base_id.map(ClassId);
            guard += 1;
            if guard > self.by_id.len() {
                return Err(invalid(format!(
                    "base-class cycle through class {}",
                    id.as_u16()
                )));
            }
        }
        chain.reverse();
        let mut props = Vec::new();
        let mut names: FxHashSet<&str> = FxHashSet::default();
        for class in chain {
            for prop in &class.properties {
                if !names.insert(prop.name.as_str()) {
                    return Err(invalid(format!(
                        "duplicate property name '{}' in hierarchy of class {}",
                        prop.name,
                        id.as_u16()
                    )));
                }
                props.push(compile_property(prop)?);
            }
        }
        Ok(props)
    }

    fn inherited_count(&self, id: ClassId) -> Result<usize> {
        let class = self.by_id.get(&id).expect("validated above");
        let flattened = self.flatten_properties(id)?;
        Ok(flattened.len() - class.properties.len())
    }

    fn derive_descendants(&self, model: &mut Model) {
        let order = model.class_order.clone();
        for id in order {
            let mut set = Vec::new();
            let mut stack = vec![id];
            while let Some(current) = stack.pop() {
                set.push(current);
                if let Some(kids) = self.children.get(&current) {
                    stack.extend(kids.iter().copied());
                }
            }
            set.sort_unstable();
            let desc = model.classes.get_mut(&id).expect("class compiled");
            Arc::get_mut(desc).expect("model under construction").descendants = set;
        }
    }

    fn validate_references(&self, model: &Model) -> Result<()> {
        for class in model.classes() {
            for prop in class.reference_properties() {
                let r = prop.reference().expect("filtered to references");
                if model.class(r.target_class).is_none() {
                    return Err(invalid(format!(
                        "property {} targets unknown class {}",
                        prop.id.as_u16(),
                        r.target_class.as_u16()
                    )));
                }
            }
            for prop in &class.properties {
                if let Some(default) = &prop.default {
                    let matches = match &prop.kind {
                        PropertyKind::Simple(t) => default.simple_type() == Some(*t),
                        _ => false,
                    };
                    if !matches {
                        return Err(invalid(format!(
                            "default of property {} does not match its type",
                            prop.id.as_u16()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn compile_indexes(&self, model: &mut Model) -> Result<()> {
        let mut seen: FxHashSet<IndexId> = FxHashSet::default();
        for ix in &self.scheme.indexes {
            let id = IndexId(ix.id);
            if !seen.insert(id) {
                return Err(invalid(format!("duplicate index id {}", ix.id)));
            }
            if ix.key_property_ids.is_empty() {
                return Err(invalid(format!("index {} has an empty key", ix.id)));
            }
            let key_properties: Vec<PropertyId> =
                ix.key_property_ids.iter().map(|p| PropertyId(*p)).collect();
            let sort_directions = if ix.sort_directions.is_empty() {
                vec![SortDirection::Ascending; key_properties.len()]
            } else if ix.sort_directions.len() == key_properties.len() {
                ix.sort_directions.clone()
            } else {
                return Err(invalid(format!(
                    "index {} sort directions do not match its key",
                    ix.id
                )));
            };
            let mut classes = Vec::new();
            for cid in &ix.class_ids {
                let cid = ClassId(*cid);
                let class = model
                    .class(cid)
                    .ok_or_else(|| invalid(format!("index {} covers unknown class {}", ix.id, cid.as_u16())))?;
                for key in &key_properties {
                    match class.property(*key).map(|p| &p.kind) {
                        Some(PropertyKind::Simple(_)) => {}
                        Some(_) => {
                            return Err(invalid(format!(
                                "index {} key property {} is not simple",
                                ix.id,
                                key.as_u16()
                            )))
                        }
                        None => {
                            return Err(invalid(format!(
                                "index {} key property {} missing on class {}",
                                ix.id,
                                key.as_u16(),
                                cid.as_u16()
                            )))
                        }
                    }
                }
                classes.push(cid);
            }
            let desc = IndexDesc {
                id,
                name: ix.name.clone(),
                kind: ix.kind,
                key_properties,
                sort_directions,
                is_unique: ix.is_unique,
                string_compare: StringCompare {
                    case_sensitive: ix.case_sensitive,
                    culture: ix.culture.clone(),
                },
                classes,
            };
            for cid in &desc.classes {
                let class = model.classes.get_mut(cid).expect("validated");
                Arc::get_mut(class).expect("model under construction").indexes.push(id);
            }
            model.indexes.insert(id, Arc::new(desc));
            model.index_order.push(id);
        }
        Ok(())
    }

    fn derive_inbound_refs(&self, model: &mut Model) -> Result<()> {
        let mut inbound: FxHashMap<ClassId, Vec<InboundRef>> = FxHashMap::default();
        for class in model.classes() {
            // Only properties declared on this class (not inherited copies),
            // so each reference is recorded once per declaring class.
            let inherited = self.inherited_count(class.id)?;
            for prop in class.properties.iter().skip(inherited) {
                if let Some(r) = prop.reference() {
                    let targets = model
                        .class(r.target_class)
                        .expect("validated")
                        .descendants
                        .clone();
                    for target in targets {
                        inbound.entry(target).or_default().push(InboundRef {
                            source_class: class.id,
                            property: prop.id,
                            track_inverse: r.track_inverse,
                            on_delete: r.on_delete,
                        });
                    }
                }
            }
        }
        for (class, refs) in inbound {
            let desc = model.classes.get_mut(&class).expect("validated");
            Arc::get_mut(desc).expect("model under construction").inbound_refs = refs;
        }
        Ok(())
    }
}

fn compile_property(scheme: &PropertyScheme) -> Result<PropertyDesc> {
    let id = PropertyId(scheme.id);
    let kind = match scheme.kind {
        PropertySchemeKind::Simple => {
            let t = scheme
                .value_type
                .ok_or_else(|| invalid(format!("property {} is missing its type", scheme.id)))?;
            PropertyKind::Simple(t)
        }
        PropertySchemeKind::Array => {
            let t = scheme
                .value_type
                .ok_or_else(|| invalid(format!("property {} is missing its type", scheme.id)))?;
            PropertyKind::Array(t)
        }
        PropertySchemeKind::Reference => {
            let target = scheme.target_class_id.ok_or_else(|| {
                invalid(format!("reference property {} has no target class", scheme.id))
            })?;
            PropertyKind::Reference(ReferenceDesc {
                target_class: ClassId(target),
                multiplicity: scheme.multiplicity.unwrap_or(Multiplicity::ZeroOrOne),
                track_inverse: scheme.track_inverse,
                on_delete: scheme
                    .delete_target_action
                    .unwrap_or(DeleteTargetAction::Prevent),
            })
        }
    };
    Ok(PropertyDesc {
        id,
        name: scheme.name.clone(),
        kind,
        default: scheme.default_value.clone(),
    })
}

fn invalid(reason: String) -> DbError {
    DbError::InvalidModel { reason }
}
