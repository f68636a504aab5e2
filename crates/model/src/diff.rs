//! Model diff planner
//!
//! Compares two compiled models and produces the change set a schema update
//! executes: class/property/index/inverse-map inserts, deletes, and updates
//! with per-element modification flags, plus the set of classes whose
//! inbound references must be re-validated.
//!
//! The planner rejects outright:
//! - a property whose type or kind changed between versions,
//! - a reference property with `exactly-one` multiplicity inserted into a
//!   pre-existing class (live objects could not produce a value),
//! - a pre-existing class covered by an index whose key contains a property
//!   the class did not carry in the previous model,
//! - a tracked reference whose multiplicity and inverse-tracking state both
//!   change in the same update (ambiguous transition).

use crate::class::ClassDesc;
use crate::model::Model;
use crate::property::{Multiplicity, ReferenceDesc};
use rustc_hash::{FxHashMap, FxHashSet};
use velox_core::{ClassId, DbError, IndexId, PropertyId, Result};

/// Flags describing how a surviving class changed.
#[derive(Debug, Clone, Default)]
pub struct ClassUpdate {
    /// The class.
    pub class: ClassId,
    /// `is_abstract` flipped.
    pub is_abstract_modified: bool,
    /// The class moved to a different log partition.
    pub is_log_modified: bool,
    /// The descendant set changed.
    pub is_hierarchy_type_modified: bool,
    /// The set of properties covered by indexes changed.
    pub indexed_properties_modified: bool,
    /// The base class changed.
    pub is_base_class_modified: bool,
    /// Properties present only in the new version (flattened view).
    pub inserted_properties: Vec<PropertyId>,
    /// Properties present only in the old version (flattened view).
    pub deleted_properties: Vec<PropertyId>,
    /// Properties whose reference detail or default changed.
    pub updated_properties: Vec<PropertyUpdate>,
}

impl ClassUpdate {
    /// Whether live objects must be rewritten into a new physical layout.
    pub fn requires_rewrite(&self) -> bool {
        !self.inserted_properties.is_empty() || !self.deleted_properties.is_empty()
    }

    fn is_noop(&self) -> bool {
        !self.is_abstract_modified
            && !self.is_log_modified
            && !self.is_hierarchy_type_modified
            && !self.indexed_properties_modified
            && !self.is_base_class_modified
            && self.inserted_properties.is_empty()
            && self.deleted_properties.is_empty()
            && self.updated_properties.is_empty()
    }
}

/// Flags describing how a surviving property changed.
#[derive(Debug, Clone, Default)]
pub struct PropertyUpdate {
    /// The property.
    pub property: PropertyId,
    /// The reference target class changed.
    pub target_class_modified: bool,
    /// The reference multiplicity changed.
    pub multiplicity_modified: bool,
    /// The multiplicity tightened to `exactly-one`; existing objects must
    /// pass a full-scan validation before the update may commit.
    pub became_required: bool,
    /// Inverse tracking switched on or off.
    pub inv_ref_tracking_modified: bool,
    /// The declared default changed.
    pub default_value_changed: bool,
    /// The delete-target action changed.
    pub delete_target_action_changed: bool,
}

impl PropertyUpdate {
    fn is_noop(&self) -> bool {
        !self.target_class_modified
            && !self.multiplicity_modified
            && !self.inv_ref_tracking_modified
            && !self.default_value_changed
            && !self.delete_target_action_changed
    }
}

/// In-place structural change of a surviving index.
#[derive(Debug, Clone, Default)]
pub struct IndexUpdate {
    /// The index.
    pub index: IndexId,
    /// Turned unique; a uniqueness scan must pass before commit.
    pub has_become_unique: bool,
    /// Classes newly covered.
    pub inserted_classes: Vec<ClassId>,
    /// Classes no longer covered.
    pub deleted_classes: Vec<ClassId>,
}

/// How an inverse-reference property transitions across the update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InverseRefChange {
    /// Tracking switched on for an existing reference.
    Tracked,
    /// Tracking switched off; entries are compacted away.
    Untracked,
    /// The property was deleted.
    Deleted,
    /// The property was inserted with tracking on.
    Inserted,
    /// The owning hierarchy shrank; sources of these classes no longer
    /// define the reference and their entries must be purged.
    PartiallyDeleted {
        /// Classes that stopped defining the property.
        removed_classes: Vec<ClassId>,
    },
}

/// A change to the inverse-reference map of one tracked property.
#[derive(Debug, Clone)]
pub struct InverseRefUpdate {
    /// Class declaring the reference.
    pub source_class: ClassId,
    /// The reference property.
    pub property: PropertyId,
    /// Class the reference targets (map location).
    pub target_class: ClassId,
    /// Transition kind.
    pub change: InverseRefChange,
}

/// The full change set between two model versions.
#[derive(Debug, Clone, Default)]
pub struct ModelDiff {
    /// Classes only in the new model.
    pub inserted_classes: Vec<ClassId>,
    /// Classes only in the old model.
    pub deleted_classes: Vec<ClassId>,
    /// Surviving classes with modifications.
    pub updated_classes: Vec<ClassUpdate>,
    /// Indexes to create (includes rebuilds).
    pub inserted_indexes: Vec<IndexId>,
    /// Indexes to drop (includes rebuilds).
    pub deleted_indexes: Vec<IndexId>,
    /// Indexes whose key structure changed and are dropped + recreated.
    pub rebuilt_indexes: Vec<IndexId>,
    /// Surviving indexes with in-place structural changes.
    pub updated_indexes: Vec<IndexUpdate>,
    /// Inverse-reference transitions.
    pub inverse_updates: Vec<InverseRefUpdate>,
    /// Classes whose descendant set shrank or which became abstract; any
    /// inbound reference targeting them must be re-validated.
    pub modified_targets: FxHashSet<ClassId>,
}

impl ModelDiff {
    /// Diff two compiled models, rejecting invalid transitions.
    pub fn compute(prev: &Model, next: &Model) -> Result<ModelDiff> {
        let mut diff = ModelDiff::default();
        diff.diff_classes(prev, next)?;
        diff.diff_indexes(prev, next)?;
        diff.diff_inverse_refs(prev, next)?;
        diff.check_index_key_availability(prev, next)?;
        Ok(diff)
    }

    /// Reference properties of the new model that need a full-scan
    /// validation pass: target or required-ness changed, or the target
    /// class is in the modified-targets set.
    pub fn properties_needing_revalidation(&self, next: &Model) -> Vec<(ClassId, PropertyId)> {
        let mut flagged: FxHashSet<PropertyId> = FxHashSet::default();
        for cu in &self.updated_classes {
            for pu in &cu.updated_properties {
                if pu.target_class_modified || pu.became_required {
                    flagged.insert(pu.property);
                }
            }
        }
        let mut out = Vec::new();
        for class in next.classes() {
            for prop in class.reference_properties() {
                let r = prop.reference().expect("reference property");
                if flagged.contains(&prop.id) || self.modified_targets.contains(&r.target_class)
                {
                    out.push((class.id, prop.id));
                }
            }
        }
        out
    }

    /// Whether the update changes anything at all.
    pub fn is_empty(&self) -> bool {
        self.inserted_classes.is_empty()
            && self.deleted_classes.is_empty()
            && self.updated_classes.is_empty()
            && self.inserted_indexes.is_empty()
            && self.deleted_indexes.is_empty()
            && self.updated_indexes.is_empty()
            && self.inverse_updates.is_empty()
    }

    fn diff_classes(&mut self, prev: &Model, next: &Model) -> Result<()> {
        for class in next.classes() {
            if prev.class(class.id).is_none() {
                self.inserted_classes.push(class.id);
            }
        }
        for class in prev.classes() {
            let Some(new_class) = next.class(class.id) else {
                self.deleted_classes.push(class.id);
                continue;
            };
            let update = self.diff_class(prev, next, class, new_class)?;
            if !update.is_noop() {
                self.updated_classes.push(update);
            }
            if class.descendants.iter().any(|d| !new_class.descendants.contains(d))
                || (!class.is_abstract && new_class.is_abstract)
            {
                self.modified_targets.insert(class.id);
            }
        }
        Ok(())
    }

    fn diff_class(
        &mut self,
        prev_model: &Model,
        next_model: &Model,
        prev: &ClassDesc,
        next: &ClassDesc,
    ) -> Result<ClassUpdate> {
        let mut update = ClassUpdate {
            class: prev.id,
            is_abstract_modified: prev.is_abstract != next.is_abstract,
            is_log_modified: prev.log_name != next.log_name,
            is_hierarchy_type_modified: prev.descendants != next.descendants,
            is_base_class_modified: prev.base != next.base,
            ..ClassUpdate::default()
        };

        let prev_ids: FxHashSet<PropertyId> = prev.properties.iter().map(|p| p.id).collect();
        for prop in &next.properties {
            if prev_ids.contains(&prop.id) {
                continue;
            }
            if let Some(r) = prop.reference() {
                // Pre-existing classes may already hold objects, which
                // could never satisfy an exactly-one reference.
                if r.multiplicity == Multiplicity::One {
                    return Err(DbError::InsertedReferencePropertyMultiplicity {
                        property: prop.id,
                    });
                }
            }
            update.inserted_properties.push(prop.id);
        }
        for prop in &prev.properties {
            let Some(new_prop) = next.property(prop.id) else {
                update.deleted_properties.push(prop.id);
                continue;
            };
            if !prop.same_shape(new_prop) {
                return Err(DbError::InvalidPropertyTypeModification { property: prop.id });
            }
            let mut pu = PropertyUpdate {
                property: prop.id,
                default_value_changed: prop.default != new_prop.default,
                ..PropertyUpdate::default()
            };
            if let (Some(a), Some(b)) = (prop.reference(), new_prop.reference()) {
                pu.target_class_modified = a.target_class != b.target_class;
                pu.multiplicity_modified = a.multiplicity != b.multiplicity;
                pu.became_required =
                    a.multiplicity != Multiplicity::One && b.multiplicity == Multiplicity::One;
                pu.inv_ref_tracking_modified = a.track_inverse != b.track_inverse;
                pu.delete_target_action_changed = a.on_delete != b.on_delete;
            }
            if !pu.is_noop() {
                update.updated_properties.push(pu);
            }
        }

        update.indexed_properties_modified =
            indexed_property_set(prev_model, prev) != indexed_property_set(next_model, next);
        Ok(update)
    }

    fn diff_indexes(&mut self, prev: &Model, next: &Model) -> Result<()> {
        for ix in next.indexes() {
            if prev.index(ix.id).is_none() {
                self.inserted_indexes.push(ix.id);
            }
        }
        for ix in prev.indexes() {
            let Some(new_ix) = next.index(ix.id) else {
                self.deleted_indexes.push(ix.id);
                continue;
            };
            if !ix.same_key_structure(new_ix) {
                self.rebuilt_indexes.push(ix.id);
                self.deleted_indexes.push(ix.id);
                self.inserted_indexes.push(ix.id);
                continue;
            }
            let mut update = IndexUpdate {
                index: ix.id,
                has_become_unique: !ix.is_unique && new_ix.is_unique,
                ..IndexUpdate::default()
            };
            for class in &new_ix.classes {
                if !ix.classes.contains(class) {
                    update.inserted_classes.push(*class);
                }
            }
            for class in &ix.classes {
                if !new_ix.classes.contains(class) {
                    update.deleted_classes.push(*class);
                }
            }
            if update.has_become_unique
                || !update.inserted_classes.is_empty()
                || !update.deleted_classes.is_empty()
            {
                self.updated_indexes.push(update);
            }
        }
        Ok(())
    }

    fn diff_inverse_refs(&mut self, prev: &Model, next: &Model) -> Result<()> {
        let prev_refs = declared_references(prev);
        let next_refs = declared_references(next);

        for (prop, (class, r, _defining)) in &next_refs {
            if prev_refs.contains_key(prop) {
                continue;
            }
            if r.track_inverse {
                self.inverse_updates.push(InverseRefUpdate {
                    source_class: *class,
                    property: *prop,
                    target_class: r.target_class,
                    change: InverseRefChange::Inserted,
                });
            }
        }
        for (prop, (class, prev_ref, prev_defining)) in &prev_refs {
            let Some((_, next_ref, next_defining)) = next_refs.get(prop) else {
                if prev_ref.track_inverse {
                    self.inverse_updates.push(InverseRefUpdate {
                        source_class: *class,
                        property: *prop,
                        target_class: prev_ref.target_class,
                        change: InverseRefChange::Deleted,
                    });
                }
                continue;
            };
            if prev_ref.track_inverse != next_ref.track_inverse
                && prev_ref.multiplicity != next_ref.multiplicity
            {
                // Tracking and multiplicity cannot transition together; the
                // resulting map state would be ambiguous.
                return Err(DbError::InvalidPropertyTypeModification { property: *prop });
            }
            if !prev_ref.track_inverse && next_ref.track_inverse {
                self.inverse_updates.push(InverseRefUpdate {
                    source_class: *class,
                    property: *prop,
                    target_class: next_ref.target_class,
                    change: InverseRefChange::Tracked,
                });
            } else if prev_ref.track_inverse && !next_ref.track_inverse {
                self.inverse_updates.push(InverseRefUpdate {
                    source_class: *class,
                    property: *prop,
                    target_class: prev_ref.target_class,
                    change: InverseRefChange::Untracked,
                });
            } else if prev_ref.track_inverse && next_ref.track_inverse {
                let removed: Vec<ClassId> = prev_defining
                    .iter()
                    .filter(|c| !next_defining.contains(*c))
                    .copied()
                    .collect();
                if !removed.is_empty() {
                    self.inverse_updates.push(InverseRefUpdate {
                        source_class: *class,
                        property: *prop,
                        target_class: next_ref.target_class,
                        change: InverseRefChange::PartiallyDeleted {
                            removed_classes: removed,
                        },
                    });
                }
            }
        }
        Ok(())
    }

    /// Every key property of every next-model index must have existed on
    /// each covered pre-existing class in the previous model; otherwise
    /// live objects cannot produce key values.
    fn check_index_key_availability(&self, prev: &Model, next: &Model) -> Result<()> {
        for ix in next.indexes() {
            for class_id in &ix.classes {
                let Some(prev_class) = prev.class(*class_id) else {
                    continue; // new class, necessarily empty
                };
                for key in &ix.key_properties {
                    if !prev_class.has_property(*key) {
                        return Err(DbError::InsertedPropertyClassAddedToIndex {
                            index: ix.id,
                            property: *key,
                            class: *class_id,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Set of `(index, property)` pairs covering a class, for change detection.
fn indexed_property_set(model: &Model, class: &ClassDesc) -> FxHashSet<(IndexId, PropertyId)> {
    let mut set = FxHashSet::default();
    for ix_id in &class.indexes {
        if let Some(ix) = model.index(*ix_id) {
            for key in &ix.key_properties {
                set.insert((*ix_id, *key));
            }
        }
    }
    set
}

/// Map of declared reference properties: id → (declaring class, descriptor,
/// defining class set).
type DeclaredRefs<'a> = FxHashMap<PropertyId, (ClassId, &'a ReferenceDesc, Vec<ClassId>)>;

fn declared_references(model: &Model) -> DeclaredRefs<'_> {
    let mut out = DeclaredRefs::default();
    for class in model.classes() {
        for prop in class.reference_properties() {
            let declared_here = match class.base {
                None => true,
                Some(base) => model
                    .class(base)
                    .map(|b| !b.has_property(prop.id))
                    .unwrap_or(true),
            };
            if declared_here {
                let defining = class.descendants.clone();
                out.insert(
                    prop.id,
                    (class.id, prop.reference().expect("reference"), defining),
                );
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::ModelScheme;
    use serde_json::json;

    fn model(doc: serde_json::Value, version: u64) -> Model {
        let scheme: ModelScheme = serde_json::from_value(doc).unwrap();
        Model::from_scheme(&scheme, version).unwrap()
    }

    fn person_v1() -> serde_json::Value {
        json!({
            "classes": [
                {"id": 1, "name": "Person", "properties": [
                    {"id": 10, "name": "user_name", "kind": "simple", "type": "string"},
                    {"id": 11, "name": "age", "kind": "simple", "type": "int"}
                ]},
                {"id": 2, "name": "Blog", "properties": [
                    {"id": 20, "name": "title", "kind": "simple", "type": "string"}
                ]},
                {"id": 3, "name": "Post", "properties": [
                    {"id": 30, "name": "blog", "kind": "reference",
                     "multiplicity": "zero_or_one", "target_class_id": 2,
                     "track_inverse": true, "delete_target_action": "cascade"}
                ]}
            ],
            "indexes": [
                {"id": 1, "name": "person_name", "kind": "hash",
                 "key_property_ids": [10], "is_unique": true, "class_ids": [1]}
            ]
        })
    }

    #[test]
    fn test_identical_models_diff_to_empty() {
        let a = model(person_v1(), 1);
        let b = model(person_v1(), 2);
        let diff = ModelDiff::compute(&a, &b).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn test_property_insert_and_delete() {
        let a = model(person_v1(), 1);
        let mut doc = person_v1();
        let props = doc["classes"][0]["properties"].as_array_mut().unwrap();
        props.remove(1); // drop age
        props.push(json!({"id": 12, "name": "email", "kind": "simple", "type": "string"}));
        let b = model(doc, 2);
        let diff = ModelDiff::compute(&a, &b).unwrap();
        let update = diff
            .updated_classes
            .iter()
            .find(|u| u.class == ClassId(1))
            .unwrap();
        assert_eq!(update.inserted_properties, vec![PropertyId(12)]);
        assert_eq!(update.deleted_properties, vec![PropertyId(11)]);
        assert!(update.requires_rewrite());
    }

    #[test]
    fn test_type_change_rejected() {
        let a = model(person_v1(), 1);
        let mut doc = person_v1();
        doc["classes"][0]["properties"][1]["type"] = json!("long");
        let b = model(doc, 2);
        let err = ModelDiff::compute(&a, &b).unwrap_err();
        assert_eq!(
            err,
            DbError::InvalidPropertyTypeModification {
                property: PropertyId(11)
            }
        );
    }

    #[test]
    fn test_inserted_exactly_one_reference_rejected() {
        let a = model(person_v1(), 1);
        let mut doc = person_v1();
        doc["classes"][0]["properties"]
            .as_array_mut()
            .unwrap()
            .push(json!({"id": 13, "name": "team", "kind": "reference",
                         "multiplicity": "one", "target_class_id": 2,
                         "track_inverse": false}));
        let b = model(doc, 2);
        let err = ModelDiff::compute(&a, &b).unwrap_err();
        assert_eq!(
            err,
            DbError::InsertedReferencePropertyMultiplicity {
                property: PropertyId(13)
            }
        );
    }

    #[test]
    fn test_existing_class_added_to_index_on_inserted_property_rejected() {
        // Teacher gains employee_no and is simultaneously covered by an
        // index keyed on it: live teachers cannot produce key values.
        let a = model(person_v1(), 1);
        let mut doc = person_v1();
        doc["classes"][0]["properties"]
            .as_array_mut()
            .unwrap()
            .push(json!({"id": 14, "name": "employee_no", "kind": "simple", "type": "long"}));
        doc["indexes"].as_array_mut().unwrap().push(json!({
            "id": 2, "name": "by_employee_no", "kind": "hash",
            "key_property_ids": [14], "is_unique": false, "class_ids": [1]
        }));
        let b = model(doc, 2);
        let err = ModelDiff::compute(&a, &b).unwrap_err();
        assert_eq!(
            err,
            DbError::InsertedPropertyClassAddedToIndex {
                index: IndexId(2),
                property: PropertyId(14),
                class: ClassId(1)
            }
        );
    }

    #[test]
    fn test_multiplicity_tightening_flags_validation() {
        let a = model(person_v1(), 1);
        let mut doc = person_v1();
        doc["classes"][2]["properties"][0]["multiplicity"] = json!("one");
        let b = model(doc, 2);
        let diff = ModelDiff::compute(&a, &b).unwrap();
        let update = diff
            .updated_classes
            .iter()
            .find(|u| u.class == ClassId(3))
            .unwrap();
        let pu = &update.updated_properties[0];
        assert!(pu.multiplicity_modified);
        assert!(pu.became_required);
        let targets = diff.properties_needing_revalidation(&b);
        assert!(targets.contains(&(ClassId(3), PropertyId(30))));
    }

    #[test]
    fn test_untracking_classified() {
        let a = model(person_v1(), 1);
        let mut doc = person_v1();
        doc["classes"][2]["properties"][0]["track_inverse"] = json!(false);
        let b = model(doc, 2);
        let diff = ModelDiff::compute(&a, &b).unwrap();
        assert_eq!(diff.inverse_updates.len(), 1);
        assert_eq!(diff.inverse_updates[0].change, InverseRefChange::Untracked);
        assert_eq!(diff.inverse_updates[0].target_class, ClassId(2));
    }

    #[test]
    fn test_tracking_and_multiplicity_together_rejected() {
        let a = model(person_v1(), 1);
        let mut doc = person_v1();
        doc["classes"][2]["properties"][0]["track_inverse"] = json!(false);
        doc["classes"][2]["properties"][0]["multiplicity"] = json!("many");
        let b = model(doc, 2);
        let err = ModelDiff::compute(&a, &b).unwrap_err();
        assert_eq!(
            err,
            DbError::InvalidPropertyTypeModification {
                property: PropertyId(30)
            }
        );
    }

    #[test]
    fn test_index_key_change_is_rebuild() {
        let a = model(person_v1(), 1);
        let mut doc = person_v1();
        doc["indexes"][0]["key_property_ids"] = json!([10, 11]);
        let b = model(doc, 2);
        let diff = ModelDiff::compute(&a, &b).unwrap();
        assert_eq!(diff.rebuilt_indexes, vec![IndexId(1)]);
        assert!(diff.deleted_indexes.contains(&IndexId(1)));
        assert!(diff.inserted_indexes.contains(&IndexId(1)));
    }

    #[test]
    fn test_has_become_unique_recorded_in_place() {
        let mut doc = person_v1();
        doc["indexes"][0]["is_unique"] = json!(false);
        let a = model(doc, 1);
        let b = model(person_v1(), 2);
        let diff = ModelDiff::compute(&a, &b).unwrap();
        assert!(diff.rebuilt_indexes.is_empty());
        assert_eq!(diff.updated_indexes.len(), 1);
        assert!(diff.updated_indexes[0].has_become_unique);
    }

    #[test]
    fn test_became_abstract_marks_modified_target() {
        let a = model(person_v1(), 1);
        let mut doc = person_v1();
        doc["classes"][1]["is_abstract"] = json!(true);
        let b = model(doc, 2);
        let diff = ModelDiff::compute(&a, &b).unwrap();
        assert!(diff.modified_targets.contains(&ClassId(2)));
        // Post.blog targets Blog, so it must be re-validated.
        let targets = diff.properties_needing_revalidation(&b);
        assert!(targets.contains(&(ClassId(3), PropertyId(30))));
    }

    #[test]
    fn test_class_insert_and_delete() {
        let a = model(person_v1(), 1);
        let mut doc = person_v1();
        doc["classes"].as_array_mut().unwrap().remove(2);
        doc["classes"].as_array_mut().unwrap().push(json!({
            "id": 4, "name": "Comment", "properties": []
        }));
        let b = model(doc, 2);
        let diff = ModelDiff::compute(&a, &b).unwrap();
        assert_eq!(diff.inserted_classes, vec![ClassId(4)]);
        assert_eq!(diff.deleted_classes, vec![ClassId(3)]);
        // deleting Post also deletes its tracked reference
        assert_eq!(diff.inverse_updates.len(), 1);
        assert_eq!(diff.inverse_updates[0].change, InverseRefChange::Deleted);
    }
}
