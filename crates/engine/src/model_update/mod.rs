//! Model-update coordinator
//!
//! Executes a schema change as a staged plan over the worker pool:
//!
//! 1. **Validate** (skipped in alignment mode): full-scan re-validation of
//!    references whose target or multiplicity changed, and shadow-index
//!    population with uniqueness checks for indexes that become unique or
//!    receive classes. Any validator error aborts the update with the
//!    previous model left active.
//! 2. **Delete**: drop removed indexes, purge deleted classes from
//!    retained indexes, drop inverse maps that are no longer needed.
//! 3. **Insert**: create empty class stores, inverse maps, and indexes
//!    (capacity = Σ class counts × 1.2; alignment marks new indexes
//!    pending-refill).
//! 4. **Populate** (parallel): fill refilling indexes, purge untracked /
//!    partially-deleted inverse entries, compact.
//! 5. **Rebuild inverse references** for properties whose tracking or
//!    target changed.
//! 6. **Class property update** (parallel): rewrite every record through
//!    the generated copier, then swap descriptors and extractors.
//! 7. **Commit**: publish the new model and storage set atomically.
//!
//! The coordinator holds every class locker exclusively for the duration,
//! so no transaction commits against a half-updated layout; pinned
//! transactions fail their model-version re-check and retry.

pub mod copier;

pub use copier::ClassCopier;

use crate::database::Database;
use crate::workers::WorkerPool;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tracing::info;
use velox_core::{ClassId, DbError, IndexId, ObjectId, PropertyId, Result};
use velox_model::{
    ClassDesc, InverseRefChange, Model, ModelDiff, ModelScheme, Multiplicity, ReferenceDesc,
};
use velox_storage::{ClassStore, InverseRefMap, RefPool, SecondaryIndex, StoreSet};

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

impl Database {
    /// Apply a schema update, atomically moving the database from its
    /// current model to the one described by `scheme`.
    ///
    /// With `is_alignment` set the update trusts its peer: validation is
    /// skipped and new indexes are marked pending-refill while they
    /// populate.
    pub fn update_model(&self, scheme: &ModelScheme, is_alignment: bool) -> Result<()> {
        let prev = self.model();
        let next = Arc::new(Model::from_scheme(scheme, prev.version + 1)?);
        let diff = ModelDiff::compute(&prev, &next)?;

        // every class locker, exclusively, in id order: commits drain and
        // none starts against a half-updated layout
        let mut class_ids: Vec<ClassId> = prev
            .classes()
            .map(|c| c.id)
            .chain(next.classes().map(|c| c.id))
            .collect();
        class_ids.sort_unstable();
        class_ids.dedup();
        let lockers: Vec<_> = class_ids.iter().map(|c| self.lockers.class(*c)).collect();
        let _guards: Vec<_> = lockers.iter().map(|l| l.write_all()).collect();

        let stores = self.stores.read().clone();

        // ---- stage 1: validate ----
        let mut shadows: FxHashMap<IndexId, Arc<SecondaryIndex>> = FxHashMap::default();
        if !is_alignment {
            info!(target: "velox::model_update", version = next.version, "validate stage");
            validate_references(&self.pool, &prev, &next, &diff, &stores)?;
            shadows = build_shadows(&self.pool, &prev, &next, &diff, &stores)?;
        }

        // ---- stage 2: delete phase ----
        info!(target: "velox::model_update", version = next.version, "delete stage");
        let mut next_stores = stores.clone();
        for ix in &diff.deleted_indexes {
            next_stores.indexes.remove(ix);
            self.lockers.keys.forget_index(*ix);
        }
        let deleted_classes: FxHashSet<ClassId> = diff.deleted_classes.iter().copied().collect();
        if !deleted_classes.is_empty() {
            let jobs: Vec<Job> = next_stores
                .indexes
                .values()
                .map(|ix| {
                    let ix = Arc::clone(ix);
                    let deleted = deleted_classes.clone();
                    Box::new(move || {
                        ix.purge_classes(&deleted);
                        Ok(())
                    }) as Job
                })
                .collect();
            self.pool.run_parallel(jobs)?;
            for class in &diff.deleted_classes {
                next_stores.classes.remove(class);
                next_stores.inverse.remove(class);
                self.lockers.remove_class(*class);
            }
        }
        let needed_inverse: FxHashSet<ClassId> = next
            .classes()
            .filter(|c| !c.is_abstract && c.inbound_refs.iter().any(|r| r.track_inverse))
            .map(|c| c.id)
            .collect();
        next_stores
            .inverse
            .retain(|class, _| needed_inverse.contains(class));

        // ---- stage 3: insert phase ----
        info!(target: "velox::model_update", version = next.version, "insert stage");
        for class in next.classes() {
            if !class.is_abstract && !next_stores.classes.contains_key(&class.id) {
                next_stores
                    .classes
                    .insert(class.id, Arc::new(ClassStore::new(Arc::clone(class))));
            }
            if needed_inverse.contains(&class.id) && !next_stores.inverse.contains_key(&class.id)
            {
                next_stores
                    .inverse
                    .insert(class.id, Arc::new(InverseRefMap::new()));
            }
        }
        for ix_id in &diff.inserted_indexes {
            if let Some(shadow) = shadows.remove(ix_id) {
                next_stores.indexes.insert(*ix_id, shadow);
                continue;
            }
            let desc = next.index(*ix_id).expect("diff came from this model");
            let read_classes = population_layouts(&prev, &next, &desc.classes);
            let capacity = next_stores.estimated_index_capacity(&desc.classes);
            let index = Arc::new(SecondaryIndex::new(
                Arc::clone(desc),
                &read_classes,
                capacity,
            )?);
            if is_alignment {
                index.prepare_for_pending_refill();
            }
            next_stores.indexes.insert(*ix_id, index);
        }
        for iu in &diff.updated_indexes {
            if let Some(shadow) = shadows.remove(&iu.index) {
                next_stores.indexes.insert(iu.index, shadow);
                continue;
            }
            let Some(index) = next_stores.indexes.get(&iu.index) else {
                continue;
            };
            index.set_desc(Arc::clone(next.index(iu.index).expect("surviving index")));
            for class in &iu.inserted_classes {
                for layout in population_layouts(&prev, &next, &[*class]) {
                    index.add_class(&layout)?;
                }
            }
            for class in &iu.deleted_classes {
                index.remove_class(*class);
                let single: FxHashSet<ClassId> = [*class].into_iter().collect();
                index.purge_classes(&single);
            }
        }

        // ---- stage 4: populate phase ----
        info!(target: "velox::model_update", version = next.version, "populate stage");
        let mut jobs: Vec<Job> = Vec::new();
        for ix_id in &diff.inserted_indexes {
            let index = &next_stores.indexes[ix_id];
            if index.is_pending_refill() {
                jobs.extend(populate_jobs(index, &index.desc().classes, &next_stores));
            }
        }
        if is_alignment {
            for iu in &diff.updated_indexes {
                if let Some(index) = next_stores.indexes.get(&iu.index) {
                    jobs.extend(populate_jobs(index, &iu.inserted_classes, &next_stores));
                }
            }
        }
        self.pool.run_parallel(jobs)?;
        for ix_id in &diff.inserted_indexes {
            let index = &next_stores.indexes[ix_id];
            if index.is_pending_refill() {
                index.finish_refill();
            }
        }

        let mut purge_props: FxHashSet<PropertyId> = FxHashSet::default();
        let mut jobs: Vec<Job> = Vec::new();
        for iu in &diff.inverse_updates {
            match &iu.change {
                InverseRefChange::Deleted | InverseRefChange::Untracked => {
                    purge_props.insert(iu.property);
                }
                InverseRefChange::PartiallyDeleted { removed_classes } => {
                    let removed: FxHashSet<ClassId> = removed_classes.iter().copied().collect();
                    for map in next_stores.inverse.values() {
                        for partition in 0..map.partition_count() {
                            let map = Arc::clone(map);
                            let removed = removed.clone();
                            let property = iu.property;
                            jobs.push(Box::new(move || {
                                map.delete_source_classes(partition, property, &removed);
                                Ok(())
                            }));
                        }
                    }
                }
                _ => {}
            }
        }
        if !purge_props.is_empty() {
            for map in next_stores.inverse.values() {
                for partition in 0..map.partition_count() {
                    let map = Arc::clone(map);
                    let props = purge_props.clone();
                    jobs.push(Box::new(move || {
                        map.delete_properties(partition, &props);
                        Ok(())
                    }));
                }
            }
        }
        let floor = self.manager.lowest_active_snapshot();
        for map in next_stores.inverse.values() {
            for partition in 0..map.partition_count() {
                let map = Arc::clone(map);
                jobs.push(Box::new(move || {
                    map.compact(partition, floor);
                    Ok(())
                }));
            }
        }
        self.pool.run_parallel(jobs)?;

        // ---- stage 5: rebuild inverse references ----
        info!(target: "velox::model_update", version = next.version, "inverse rebuild stage");
        let mut rebuild: Vec<(ClassId, PropertyId)> = Vec::new();
        for iu in &diff.inverse_updates {
            if iu.change == InverseRefChange::Tracked {
                rebuild.push((iu.source_class, iu.property));
            }
        }
        for cu in &diff.updated_classes {
            for pu in &cu.updated_properties {
                if pu.target_class_modified {
                    let tracked = next
                        .class(cu.class)
                        .and_then(|c| c.property(pu.property))
                        .and_then(|p| p.reference())
                        .map(|r| r.track_inverse)
                        .unwrap_or(false);
                    if tracked {
                        rebuild.push((cu.class, pu.property));
                    }
                }
            }
        }
        rebuild.sort_unstable();
        rebuild.dedup();
        if !rebuild.is_empty() {
            // clean slate for the rebuilt properties, then re-scan sources
            let props: FxHashSet<PropertyId> = rebuild.iter().map(|(_, p)| *p).collect();
            let mut jobs: Vec<Job> = Vec::new();
            for map in next_stores.inverse.values() {
                for partition in 0..map.partition_count() {
                    let map = Arc::clone(map);
                    let props = props.clone();
                    jobs.push(Box::new(move || {
                        map.delete_properties(partition, &props);
                        Ok(())
                    }));
                }
            }
            self.pool.run_parallel(jobs)?;
            let jobs = rebuild_jobs(&prev, &next, &next_stores, &rebuild);
            self.pool.run_parallel(jobs)?;
        }

        // ---- stage 6: class property update ----
        info!(target: "velox::model_update", version = next.version, "rewrite stage");
        for cu in &diff.updated_classes {
            if !cu.requires_rewrite() {
                continue;
            }
            let Some(store) = next_stores.classes.get(&cu.class) else {
                continue;
            };
            let (Some(old_desc), Some(new_desc)) = (prev.class(cu.class), next.class(cu.class))
            else {
                continue;
            };
            let copier = Arc::new(ClassCopier::generate(old_desc, new_desc));
            let jobs: Vec<Job> = store
                .scan_chunks()
                .into_iter()
                .map(|chunk| {
                    let store = Arc::clone(store);
                    let copier = Arc::clone(&copier);
                    let strings = Arc::clone(&next_stores.strings);
                    let blobs = Arc::clone(&next_stores.blobs);
                    Box::new(move || {
                        store.rewrite_records(chunk, |rec| {
                            copier.apply(&rec.data, &strings, &blobs)
                        });
                        Ok(())
                    }) as Job
                })
                .collect();
            self.pool.run_parallel(jobs)?;
        }
        for class in next.classes() {
            if let Some(store) = next_stores.classes.get(&class.id) {
                store.set_desc(Arc::clone(class));
            }
        }
        for desc in next.indexes() {
            if let Some(index) = next_stores.indexes.get(&desc.id) {
                for class_id in &desc.classes {
                    if let Some(class) = next.class(*class_id) {
                        index.add_class(class)?;
                    }
                }
            }
        }

        // ---- stage 7: commit ----
        self.log.ensure_partitions(next.log_partitions());
        *self.stores.write() = next_stores;
        *self.model.write() = Arc::clone(&next);
        info!(target: "velox::model_update", version = next.version, "model published");
        Ok(())
    }
}

/// Class layouts to read *current* records with: the previous model's
/// descriptors where the class already existed, the new one otherwise.
fn population_layouts(prev: &Model, next: &Model, classes: &[ClassId]) -> Vec<Arc<ClassDesc>> {
    classes
        .iter()
        .filter_map(|c| prev.class(*c).or_else(|| next.class(*c)).cloned())
        .collect()
}

/// Parallel jobs inserting every live object of `classes` into `index`.
fn populate_jobs(
    index: &Arc<SecondaryIndex>,
    classes: &[ClassId],
    stores: &StoreSet,
) -> Vec<Job> {
    let mut jobs = Vec::new();
    for class in classes {
        let Some(store) = stores.classes.get(class) else {
            continue;
        };
        for chunk in store.scan_chunks() {
            let index = Arc::clone(index);
            let store = Arc::clone(store);
            let strings = Arc::clone(&stores.strings);
            let class = *class;
            jobs.push(Box::new(move || {
                store.for_each_head(chunk, |view| {
                    if let Some(key) = index.key_for(class, &view.data, &strings) {
                        index.insert(key, view.id, view.commit_version);
                    }
                });
                Ok(())
            }) as Job);
        }
    }
    jobs
}

/// Parallel jobs re-deriving inverse entries for `(owning class,
/// property)` pairs from current record bytes.
fn rebuild_jobs(
    prev: &Model,
    next: &Model,
    stores: &StoreSet,
    rebuild: &[(ClassId, PropertyId)],
) -> Vec<Job> {
    let mut jobs = Vec::new();
    for (owning, property) in rebuild {
        let Some(owner) = next.class(*owning) else {
            continue;
        };
        for concrete in &owner.descendants {
            let Some(store) = stores.classes.get(concrete) else {
                continue;
            };
            // records still carry the previous layout at this stage
            let Some(layout) = prev.class(*concrete).cloned() else {
                continue;
            };
            let Some(pos) = layout.property_pos(*property) else {
                continue;
            };
            let offset = layout.offsets[pos] as usize;
            let many = layout.properties[pos]
                .reference()
                .map(|r| r.multiplicity == Multiplicity::Many)
                .unwrap_or(false);
            for chunk in store.scan_chunks() {
                let store = Arc::clone(store);
                let stores = stores.clone();
                let property = *property;
                jobs.push(Box::new(move || {
                    store.for_each_head(chunk, |view| {
                        let targets = targets_at(&view.data, offset, many, &stores.blobs);
                        for target in targets {
                            if let Some(map) = stores.inverse_for(target) {
                                map.insert(target, view.id, property, view.commit_version);
                            }
                        }
                    });
                    Ok(())
                }) as Job);
            }
        }
    }
    jobs
}

fn targets_at(data: &[u8], offset: usize, many: bool, blobs: &RefPool) -> Vec<ObjectId> {
    if data.len() < offset + 8 {
        return Vec::new();
    }
    let raw: Vec<i64> = if many {
        let handle = u64::from_le_bytes(data[offset..offset + 8].try_into().expect("8 bytes"));
        blobs
            .get(handle)
            .map(|b| velox_storage::decode_longs(&b))
            .unwrap_or_default()
    } else {
        vec![i64::from_le_bytes(
            data[offset..offset + 8].try_into().expect("8 bytes"),
        )]
    };
    raw.into_iter()
        .map(|v| ObjectId::from_u64(v as u64))
        .filter(|id| !id.is_null())
        .collect()
}

/// Full-scan validation of references whose rules or targets changed.
fn validate_references(
    pool: &WorkerPool,
    prev: &Arc<Model>,
    next: &Arc<Model>,
    diff: &ModelDiff,
    stores: &StoreSet,
) -> Result<()> {
    let pairs = diff.properties_needing_revalidation(next);
    let mut jobs: Vec<Job> = Vec::new();
    for (owning, property) in pairs {
        let Some(owner) = next.class(owning) else {
            continue;
        };
        let Some(reference) = owner.property(property).and_then(|p| p.reference()).cloned()
        else {
            continue;
        };
        for concrete in &owner.descendants {
            let Some(store) = stores.classes.get(concrete) else {
                continue;
            };
            let Some(layout) = prev.class(*concrete).cloned() else {
                continue;
            };
            let Some(pos) = layout.property_pos(property) else {
                continue;
            };
            let offset = layout.offsets[pos] as usize;
            let many = layout.properties[pos]
                .reference()
                .map(|r| r.multiplicity == Multiplicity::Many)
                .unwrap_or(false);
            for chunk in store.scan_chunks() {
                let store = Arc::clone(store);
                let stores = stores.clone();
                let next = Arc::clone(next);
                let reference = reference.clone();
                jobs.push(Box::new(move || {
                    validate_chunk(
                        &store, chunk, offset, many, property, &reference, &next, &stores,
                    )
                }) as Job);
            }
        }
    }
    pool.run_parallel(jobs)
}

#[allow(clippy::too_many_arguments)]
fn validate_chunk(
    store: &Arc<ClassStore>,
    chunk: std::ops::Range<u64>,
    offset: usize,
    many: bool,
    property: PropertyId,
    reference: &ReferenceDesc,
    next: &Arc<Model>,
    stores: &StoreSet,
) -> Result<()> {
    let mut failure: Option<DbError> = None;
    store.for_each_head(chunk, |view| {
        if failure.is_some() {
            return;
        }
        let targets = targets_at(&view.data, offset, many, &stores.blobs);
        if targets.is_empty() && reference.multiplicity == Multiplicity::One {
            failure = Some(DbError::NullReferenceNotAllowed {
                source_id: view.id,
                property,
            });
            return;
        }
        for target in targets {
            let live = stores
                .classes
                .get(&target.class_id())
                .and_then(|s| s.head_version(target))
                .map(|(_, deleted)| !deleted)
                .unwrap_or(false);
            if !live {
                failure = Some(DbError::UnknownReference {
                    source_id: view.id,
                    property,
                    target,
                });
                return;
            }
            if !next.is_instance_of(target.class_id(), reference.target_class) {
                failure = Some(DbError::InvalidReferencedClass {
                    source_id: view.id,
                    property,
                    target,
                });
                return;
            }
        }
    });
    match failure {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

/// Build and populate shadow indexes for indexes that become unique or
/// receive classes; a uniqueness violation aborts the whole update.
fn build_shadows(
    pool: &WorkerPool,
    prev: &Arc<Model>,
    next: &Arc<Model>,
    diff: &ModelDiff,
    stores: &StoreSet,
) -> Result<FxHashMap<IndexId, Arc<SecondaryIndex>>> {
    let mut targets: Vec<IndexId> = diff.inserted_indexes.clone();
    for iu in &diff.updated_indexes {
        if iu.has_become_unique || !iu.inserted_classes.is_empty() {
            targets.push(iu.index);
        }
    }
    targets.sort_unstable();
    targets.dedup();

    let mut shadows = FxHashMap::default();
    for ix_id in targets {
        let desc = next.index(ix_id).expect("diff came from this model");
        let read_classes = population_layouts(prev, next, &desc.classes);
        let capacity = stores.estimated_index_capacity(&desc.classes);
        let shadow = Arc::new(SecondaryIndex::new(
            Arc::clone(desc),
            &read_classes,
            capacity,
        )?);
        let jobs = populate_jobs(&shadow, &desc.classes, stores);
        pool.run_parallel(jobs)?;
        if desc.is_unique {
            shadow.check_uniqueness()?;
        }
        shadows.insert(ix_id, shadow);
    }
    Ok(shadows)
}
