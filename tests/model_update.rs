//! Online schema-evolution scenarios: validation failures leave the
//! previous model active; successful updates rewrite records, rebuild
//! indexes and inverse maps, and publish atomically.

mod common;

use common::*;
use veloxdb::{
    ClassId, Database, DbError, IndexId, ModelScheme, ObjectId, PropertyId, PropertyValue,
    TransactionKind,
};

fn s(v: &str) -> PropertyValue {
    PropertyValue::String(Some(v.into()))
}

fn scheme_of(doc: serde_json::Value) -> ModelScheme {
    serde_json::from_value(doc).expect("scheme variant is well-formed")
}

fn create_person(db: &Database, name: &str) -> ObjectId {
    db.transaction(TransactionKind::ReadWrite, |tx| {
        let id = tx.create(ClassId(PERSON))?;
        tx.set(id, PropertyId(USER_NAME), &s(name))?;
        Ok(id)
    })
    .unwrap()
}

#[test]
fn multiplicity_tightening_fails_on_null_rows() {
    let db = blog_db();
    let person = create_person(&db, "buyer");
    let orders: Vec<ObjectId> = db
        .transaction(TransactionKind::ReadWrite, |tx| {
            let with_ref = tx.create(ClassId(ORDER))?;
            tx.set(
                with_ref,
                PropertyId(ORDERED_BY),
                &PropertyValue::Reference(person),
            )?;
            let without_ref = tx.create(ClassId(ORDER))?;
            Ok(vec![with_ref, without_ref])
        })
        .unwrap();

    let mut doc = blog_scheme_json();
    doc["classes"][3]["properties"][0]["multiplicity"] = serde_json::json!("one");
    let err = db.update_model(&scheme_of(doc), false).unwrap_err();
    match err {
        DbError::NullReferenceNotAllowed { source_id, property } => {
            assert_eq!(source_id, orders[1]);
            assert_eq!(property, PropertyId(ORDERED_BY));
        }
        other => panic!("expected null-reference failure, got {other:?}"),
    }

    // the live model is unchanged and still accepts null references
    assert_eq!(db.model().version, 1);
    db.transaction(TransactionKind::ReadWrite, |tx| tx.create(ClassId(ORDER)))
        .unwrap();
}

#[test]
fn planner_rejects_index_over_inserted_property() {
    let db = blog_db();
    create_person(&db, "teacher");

    let mut doc = blog_scheme_json();
    doc["classes"][0]["properties"]
        .as_array_mut()
        .unwrap()
        .push(serde_json::json!({
            "id": 13, "name": "employee_no", "kind": "simple", "type": "long"
        }));
    doc["indexes"].as_array_mut().unwrap().push(serde_json::json!({
        "id": 2, "name": "person_by_employee_no", "kind": "hash",
        "key_property_ids": [13], "is_unique": false, "class_ids": [PERSON]
    }));

    let err = db.update_model(&scheme_of(doc), false).unwrap_err();
    assert_eq!(
        err,
        DbError::InsertedPropertyClassAddedToIndex {
            index: IndexId(2),
            property: PropertyId(13),
            class: ClassId(PERSON)
        }
    );
    assert_eq!(db.model().version, 1);
}

#[test]
fn inserted_property_defaults_into_live_objects() {
    let db = blog_db();
    let person = create_person(&db, "upgraded");

    let mut doc = blog_scheme_json();
    doc["classes"][0]["properties"]
        .as_array_mut()
        .unwrap()
        .push(serde_json::json!({
            "id": 14, "name": "score", "kind": "simple", "type": "long",
            "default_value": {"long": 5}
        }));
    db.update_model(&scheme_of(doc), false).unwrap();
    assert_eq!(db.model().version, 2);

    db.transaction(TransactionKind::Read, |tx| {
        let view = tx.get(person)?.expect("person survives the rewrite");
        assert_eq!(view.get(PropertyId(14))?, PropertyValue::Long(5));
        // surviving fields kept their values and the same id
        assert_eq!(view.get(PropertyId(USER_NAME))?, s("upgraded"));
        Ok(())
    })
    .unwrap();
}

#[test]
fn deleted_string_property_releases_handles() {
    let db = blog_db();
    let person = create_person(&db, "keeper");
    db.transaction(TransactionKind::ReadWrite, |tx| {
        tx.set(person, PropertyId(EMAIL), &s("unique-address@example"))
    })
    .unwrap();
    db.collect_garbage();
    let before = db.stores().strings.len();

    let mut doc = blog_scheme_json();
    doc["classes"][0]["properties"]
        .as_array_mut()
        .unwrap()
        .remove(1); // drop email
    db.update_model(&scheme_of(doc), false).unwrap();

    // the email value's handle was released by the copier
    assert_eq!(db.stores().strings.len(), before - 1);

    db.transaction(TransactionKind::Read, |tx| {
        let view = tx.get(person)?.expect("person survives");
        assert_eq!(view.get(PropertyId(USER_NAME))?, s("keeper"));
        assert!(view.get(PropertyId(EMAIL)).is_err());
        Ok(())
    })
    .unwrap();
}

#[test]
fn index_becoming_unique_validates_existing_keys() {
    // start from a non-unique index over user_name
    let mut doc = blog_scheme_json();
    doc["indexes"][0]["is_unique"] = serde_json::json!(false);
    let db = Database::in_memory(&scheme_of(doc.clone())).unwrap();
    create_person(&db, "dup");
    create_person(&db, "dup");

    let unique = blog_scheme_json();
    let err = db.update_model(&scheme_of(unique.clone()), false).unwrap_err();
    assert_eq!(
        err,
        DbError::UniquenessViolation {
            index: IndexId(IX_USER_NAME)
        }
    );
    assert_eq!(db.model().version, 1);

    // resolve the duplicate, then the same update goes through
    db.transaction(TransactionKind::ReadWrite, |tx| {
        let dups = {
            let mut index = tx.get_hash_index(IndexId(IX_USER_NAME))?;
            index.lookup(&[s("dup")])?
        };
        tx.set(dups[0], PropertyId(USER_NAME), &s("renamed"))
    })
    .unwrap();
    db.update_model(&scheme_of(unique), false).unwrap();
    assert_eq!(db.model().version, 2);

    // uniqueness is now enforced
    let err = db
        .transaction(TransactionKind::ReadWrite, |tx| {
            let id = tx.create(ClassId(PERSON))?;
            tx.set(id, PropertyId(USER_NAME), &s("dup"))
        })
        .unwrap_err();
    assert_eq!(
        err,
        DbError::UniquenessViolation {
            index: IndexId(IX_USER_NAME)
        }
    );
}

#[test]
fn untracking_drops_inverse_entries() {
    let db = blog_db();
    let (blog, _post) = db
        .transaction(TransactionKind::ReadWrite, |tx| {
            let blog = tx.create(ClassId(BLOG))?;
            let post = tx.create(ClassId(POST))?;
            tx.set(post, PropertyId(POST_BLOG), &PropertyValue::Reference(blog))?;
            Ok((blog, post))
        })
        .unwrap();
    assert!(db.stores().inverse_for(blog).is_some());

    let mut doc = blog_scheme_json();
    doc["classes"][2]["properties"][0]["track_inverse"] = serde_json::json!(false);
    db.update_model(&scheme_of(doc), false).unwrap();

    // the blog's inverse map is gone along with its entries
    assert!(db.stores().inverse_for(blog).is_none());
}

#[test]
fn tracking_rebuilds_from_live_references() {
    // start untracked, with delete action set_null so untracked deletes work
    let mut doc = blog_scheme_json();
    doc["classes"][2]["properties"][0]["track_inverse"] = serde_json::json!(false);
    let db = Database::in_memory(&scheme_of(doc.clone())).unwrap();

    let (blog, post) = db
        .transaction(TransactionKind::ReadWrite, |tx| {
            let blog = tx.create(ClassId(BLOG))?;
            let post = tx.create(ClassId(POST))?;
            tx.set(post, PropertyId(POST_BLOG), &PropertyValue::Reference(blog))?;
            Ok((blog, post))
        })
        .unwrap();
    assert!(db.stores().inverse_for(blog).is_none());

    // switch tracking on; entries are rebuilt from live objects
    db.update_model(&scheme_of(blog_scheme_json()), false).unwrap();
    let stores = db.stores();
    let map = stores.inverse_for(blog).expect("map created");
    assert_eq!(
        map.get_inverse(blog, PropertyId(POST_BLOG), db.current_version()),
        vec![post]
    );
}

#[test]
fn alignment_mode_refills_new_indexes() {
    let db = blog_db();
    create_person(&db, "aligned");

    let mut doc = blog_scheme_json();
    doc["indexes"].as_array_mut().unwrap().push(serde_json::json!({
        "id": 3, "name": "person_by_email", "kind": "hash",
        "key_property_ids": [EMAIL], "is_unique": false, "class_ids": [PERSON]
    }));
    db.update_model(&scheme_of(doc), true).unwrap();

    // refill completed within the update; the index answers queries
    let stores = db.stores();
    let index = stores.index(IndexId(3)).expect("new index exists");
    assert!(!index.is_pending_refill());
    db.transaction(TransactionKind::Read, |tx| {
        let mut reader = tx.get_hash_index(IndexId(3))?;
        // every fixture person has a null email
        assert_eq!(
            reader.lookup(&[PropertyValue::String(None)])?.len(),
            1
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn class_insert_and_delete_round_trip() {
    let db = blog_db();
    create_person(&db, "stable");

    // forward: add a Tag class
    let mut forward = blog_scheme_json();
    forward["classes"].as_array_mut().unwrap().push(serde_json::json!({
        "id": 9, "name": "Tag", "properties": [
            {"id": 90, "name": "label", "kind": "simple", "type": "string"}
        ]
    }));
    db.update_model(&scheme_of(forward), false).unwrap();
    let tag = db
        .transaction(TransactionKind::ReadWrite, |tx| tx.create(ClassId(9)))
        .unwrap();
    assert!(db
        .transaction(TransactionKind::Read, |tx| tx.get(tag))
        .unwrap()
        .is_some());

    // reverse: drop it again; the surviving data is untouched
    db.update_model(&scheme_of(blog_scheme_json()), false).unwrap();
    assert_eq!(db.model().version, 3);
    db.transaction(TransactionKind::Read, |tx| {
        assert_eq!(tx.get_all(ClassId(PERSON))?.len(), 1);
        Ok(())
    })
    .unwrap();
}

#[test]
fn property_add_then_remove_is_noop() {
    let db = blog_db();
    let person = create_person(&db, "round");

    let mut forward = blog_scheme_json();
    forward["classes"][0]["properties"]
        .as_array_mut()
        .unwrap()
        .push(serde_json::json!({
            "id": 15, "name": "nickname", "kind": "simple", "type": "string"
        }));
    db.update_model(&scheme_of(forward), false).unwrap();
    db.update_model(&scheme_of(blog_scheme_json()), false).unwrap();

    db.transaction(TransactionKind::Read, |tx| {
        let view = tx.get(person)?.expect("person survives both rewrites");
        assert_eq!(view.get(PropertyId(USER_NAME))?, s("round"));
        assert_eq!(view.get(PropertyId(AGE))?, PropertyValue::Int(0));
        assert!(view.get(PropertyId(15)).is_err());
        Ok(())
    })
    .unwrap();
}

#[test]
fn pinned_transaction_conflicts_after_update() {
    let db = blog_db();
    let person = create_person(&db, "pinned");

    let mut stale = db.begin(TransactionKind::ReadWrite);
    assert!(stale.get(person).unwrap().is_some());

    let mut doc = blog_scheme_json();
    doc["classes"][0]["properties"]
        .as_array_mut()
        .unwrap()
        .push(serde_json::json!({
            "id": 16, "name": "extra", "kind": "simple", "type": "int"
        }));
    db.update_model(&scheme_of(doc), false).unwrap();

    // the pinned handle now targets a stale layout
    let err = stale
        .set(person, PropertyId(AGE), &PropertyValue::Int(9))
        .unwrap_err();
    assert_eq!(err, DbError::Conflict);
}
