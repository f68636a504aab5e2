//! End-to-end engine scenarios: uniqueness at commit, inverse-reference
//! visibility, delete actions, schema-update rejections, and conflict
//! retry.

mod common;

use common::*;
use std::sync::{Arc, Mutex};
use veloxdb::{
    ClassId, Database, DbError, IndexId, LogSet, ObjectId, PropertyId, PropertyValue,
    TransactionKind, VecLogWriter,
};

fn s(v: &str) -> PropertyValue {
    PropertyValue::String(Some(v.into()))
}

fn create_person(db: &Database, name: &str) -> ObjectId {
    db.transaction(TransactionKind::ReadWrite, |tx| {
        let id = tx.create(ClassId(PERSON))?;
        tx.set(id, PropertyId(USER_NAME), &s(name))?;
        Ok(id)
    })
    .expect("person commits")
}

#[test]
fn uniqueness_decided_at_commit() {
    let db = blog_db();
    let mut t1 = db.begin(TransactionKind::ReadWrite);
    let mut t2 = db.begin(TransactionKind::ReadWrite);

    // both transactions see an empty unique index at their snapshots
    {
        let mut index = t1.get_hash_index(IndexId(IX_USER_NAME)).unwrap();
        assert_eq!(index.lookup_unique(&[s("john")]).unwrap(), None);
    }
    {
        let mut index = t2.get_hash_index(IndexId(IX_USER_NAME)).unwrap();
        assert_eq!(index.lookup_unique(&[s("john")]).unwrap(), None);
    }

    let a = t1.create(ClassId(PERSON)).unwrap();
    t1.set(a, PropertyId(USER_NAME), &s("john")).unwrap();
    let b = t2.create(ClassId(PERSON)).unwrap();
    t2.set(b, PropertyId(USER_NAME), &s("john")).unwrap();

    t1.apply_changes().unwrap();
    let err = t2.apply_changes().unwrap_err();
    assert_eq!(
        err,
        DbError::UniquenessViolation {
            index: IndexId(IX_USER_NAME)
        }
    );

    // the earlier committer owns the key
    db.transaction(TransactionKind::Read, |tx| {
        let mut index = tx.get_hash_index(IndexId(IX_USER_NAME))?;
        assert_eq!(index.lookup_unique(&[s("john")])?, Some(a));
        Ok(())
    })
    .unwrap();
}

#[test]
fn inverse_reference_visible_only_after_commit() {
    let db = blog_db();
    let blog = db
        .transaction(TransactionKind::ReadWrite, |tx| tx.create(ClassId(BLOG)))
        .unwrap();

    let mut t1 = db.begin(TransactionKind::ReadWrite);
    let post = t1.create(ClassId(POST)).unwrap();
    t1.set(post, PropertyId(POST_BLOG), &PropertyValue::Reference(blog))
        .unwrap();

    // a concurrent snapshot sees no inverse entry while t1 is pending
    let stores = db.stores();
    let map = stores.inverse_for(blog).expect("blog map exists");
    assert!(map
        .get_inverse(blog, PropertyId(POST_BLOG), db.current_version())
        .is_empty());

    let commit_version = t1.apply_changes().unwrap();

    // visible exactly from the commit version on
    assert!(map
        .get_inverse(blog, PropertyId(POST_BLOG), commit_version - 1)
        .is_empty());
    assert_eq!(
        map.get_inverse(blog, PropertyId(POST_BLOG), commit_version),
        vec![post]
    );
}

#[test]
fn cascade_delete_removes_posts() {
    let db = blog_db();
    let (blog, posts) = db
        .transaction(TransactionKind::ReadWrite, |tx| {
            let blog = tx.create(ClassId(BLOG))?;
            let mut posts = Vec::new();
            for title in ["first", "second"] {
                let post = tx.create(ClassId(POST))?;
                tx.set(post, PropertyId(POST_BLOG), &PropertyValue::Reference(blog))?;
                tx.set(post, PropertyId(POST_TITLE), &s(title))?;
                posts.push(post);
            }
            Ok((blog, posts))
        })
        .unwrap();

    let deleted_at = db
        .transaction(TransactionKind::ReadWrite, |tx| {
            tx.delete(blog)?;
            Ok(())
        })
        .map(|_| db.current_version())
        .unwrap();

    db.transaction(TransactionKind::Read, |tx| {
        assert!(tx.snapshot() >= deleted_at);
        assert!(tx.get(blog)?.is_none());
        for post in &posts {
            assert!(tx.get(*post)?.is_none(), "post {post} survived the cascade");
        }
        assert!(tx.get_all(ClassId(POST))?.is_empty());
        Ok(())
    })
    .unwrap();
}

#[test]
fn prevent_delete_while_referenced() {
    let db = blog_db();
    let person = create_person(&db, "ann");
    let _order = db
        .transaction(TransactionKind::ReadWrite, |tx| {
            let order = tx.create(ClassId(ORDER))?;
            tx.set(
                order,
                PropertyId(ORDERED_BY),
                &PropertyValue::Reference(person),
            )?;
            Ok(order)
        })
        .unwrap();

    let err = db
        .transaction(TransactionKind::ReadWrite, |tx| tx.delete(person))
        .unwrap_err();
    assert!(matches!(err, DbError::DeleteReferenced { id, .. } if id == person));

    // the person is still there
    db.transaction(TransactionKind::Read, |tx| {
        assert!(tx.get(person)?.is_some());
        Ok(())
    })
    .unwrap();
}

#[test]
fn set_null_detaches_observers() {
    let scheme: veloxdb::ModelScheme = serde_json::from_value(serde_json::json!({
        "classes": [
            {"id": 1, "name": "Author", "properties": [
                {"id": 10, "name": "name", "kind": "simple", "type": "string"}
            ]},
            {"id": 2, "name": "Draft", "properties": [
                {"id": 20, "name": "author", "kind": "reference",
                 "multiplicity": "zero_or_one", "target_class_id": 1,
                 "track_inverse": true, "delete_target_action": "set_null"}
            ]}
        ],
        "indexes": []
    }))
    .unwrap();
    let db = Database::in_memory(&scheme).unwrap();

    let (author, draft) = db
        .transaction(TransactionKind::ReadWrite, |tx| {
            let author = tx.create(ClassId(1))?;
            let draft = tx.create(ClassId(2))?;
            tx.set(draft, PropertyId(20), &PropertyValue::Reference(author))?;
            Ok((author, draft))
        })
        .unwrap();

    db.transaction(TransactionKind::ReadWrite, |tx| tx.delete(author))
        .unwrap();

    db.transaction(TransactionKind::Read, |tx| {
        assert!(tx.get(author)?.is_none());
        let draft_view = tx.get(draft)?.expect("draft survives");
        assert_eq!(
            draft_view.get(PropertyId(20))?,
            PropertyValue::Reference(ObjectId::NULL)
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn conflict_detected_and_retry_succeeds() {
    let db = blog_db();
    let person = create_person(&db, "john");

    // t1 reads the person
    let mut t1 = db.begin(TransactionKind::ReadWrite);
    assert!(t1.get(person).unwrap().is_some());

    // t2 updates the email concurrently and commits first
    db.transaction(TransactionKind::ReadWrite, |tx| {
        tx.set(person, PropertyId(EMAIL), &s("john@new.example"))
    })
    .unwrap();

    // t1 writes based on its stale read and must conflict
    t1.set(person, PropertyId(AGE), &PropertyValue::Int(31))
        .unwrap();
    assert_eq!(t1.apply_changes().unwrap_err(), DbError::Conflict);

    // the automatic retry path observes t2's email and succeeds
    db.transaction(TransactionKind::ReadWrite, |tx| {
        let view = tx.get(person)?.expect("person exists");
        assert_eq!(view.get(PropertyId(EMAIL))?, s("john@new.example"));
        tx.set(person, PropertyId(AGE), &PropertyValue::Int(31))
    })
    .unwrap();

    db.transaction(TransactionKind::Read, |tx| {
        let view = tx.get(person)?.expect("person exists");
        assert_eq!(view.get(PropertyId(AGE))?, PropertyValue::Int(31));
        assert_eq!(view.get(PropertyId(EMAIL))?, s("john@new.example"));
        Ok(())
    })
    .unwrap();
}

#[test]
fn read_transactions_reject_writes() {
    let db = blog_db();
    let mut tx = db.begin(TransactionKind::Read);
    let err = tx.create(ClassId(PERSON)).unwrap_err();
    assert_eq!(err, DbError::TransactionNotAllowed);
    tx.rollback();
}

#[test]
fn polymorphic_get_all_spans_descendants() {
    let scheme: veloxdb::ModelScheme = serde_json::from_value(serde_json::json!({
        "classes": [
            {"id": 1, "name": "Party", "is_abstract": true, "properties": [
                {"id": 10, "name": "name", "kind": "simple", "type": "string"}
            ]},
            {"id": 2, "name": "Company", "base_id": 1, "properties": []},
            {"id": 3, "name": "Person", "base_id": 1, "properties": []}
        ],
        "indexes": []
    }))
    .unwrap();
    let db = Database::in_memory(&scheme).unwrap();

    let (company, person) = db
        .transaction(TransactionKind::ReadWrite, |tx| {
            Ok((tx.create(ClassId(2))?, tx.create(ClassId(3))?))
        })
        .unwrap();

    db.transaction(TransactionKind::Read, |tx| {
        let mut all = tx.get_all(ClassId(1))?;
        all.sort_unstable();
        let mut expected = vec![company, person];
        expected.sort_unstable();
        assert_eq!(all, expected);
        assert_eq!(tx.get_all(ClassId(2))?, vec![company]);
        Ok(())
    })
    .unwrap();

    // abstract classes cannot be instantiated
    let err = db
        .transaction(TransactionKind::ReadWrite, |tx| tx.create(ClassId(1)))
        .unwrap_err();
    assert_eq!(err, DbError::InvalidClass { class: ClassId(1) });
}

#[test]
fn panic_in_procedure_rolls_back_as_unknown() {
    let db = blog_db();
    let err = db
        .transaction::<()>(TransactionKind::ReadWrite, |tx| {
            let id = tx.create(ClassId(PERSON))?;
            tx.set(id, PropertyId(USER_NAME), &s("ghost"))?;
            panic!("stored procedure bug");
        })
        .unwrap_err();
    assert_eq!(err, DbError::Unknown);

    // nothing leaked into visible state
    db.transaction(TransactionKind::Read, |tx| {
        assert!(tx.get_all(ClassId(PERSON))?.is_empty());
        Ok(())
    })
    .unwrap();
}

#[test]
fn wal_records_partitioned_by_log() {
    let writers: Arc<Mutex<Vec<Arc<VecLogWriter>>>> = Arc::default();
    let sink = Arc::clone(&writers);
    let log = LogSet::new(Box::new(move || {
        let writer = Arc::new(VecLogWriter::new());
        sink.lock().unwrap().push(Arc::clone(&writer));
        writer as Arc<dyn veloxdb::LogWriter>
    }));
    let db = Database::open(&blog_scheme(), log).unwrap();

    let person = create_person(&db, "logged");
    let blog = db
        .transaction(TransactionKind::ReadWrite, |tx| tx.create(ClassId(BLOG)))
        .unwrap();

    let writers = writers.lock().unwrap();
    assert!(writers.len() >= 2, "default and content partitions exist");

    // Person lives in partition 0, Blog in the named "content" partition
    let person_records = writers[0].records();
    assert_eq!(person_records.len(), 1);
    let decoded = veloxdb::decode_record(&person_records[0]).expect("valid record");
    assert_eq!(decoded.class, ClassId(PERSON));
    assert_eq!(decoded.id, person);
    assert_eq!(decoded.op, 0); // insert

    let blog_records = writers[1].records();
    assert_eq!(blog_records.len(), 1);
    let decoded = veloxdb::decode_record(&blog_records[0]).expect("valid record");
    assert_eq!(decoded.class, ClassId(BLOG));
    assert_eq!(decoded.id, blog);
}

#[test]
fn inverse_reads_through_the_handle() {
    let db = blog_db();
    let (blog, post) = db
        .transaction(TransactionKind::ReadWrite, |tx| {
            let blog = tx.create(ClassId(BLOG))?;
            let post = tx.create(ClassId(POST))?;
            tx.set(post, PropertyId(POST_BLOG), &PropertyValue::Reference(blog))?;
            Ok((blog, post))
        })
        .unwrap();

    db.transaction(TransactionKind::ReadWrite, |tx| {
        assert_eq!(tx.get_referencing(blog, PropertyId(POST_BLOG))?, vec![post]);
        // a buffered retarget is reflected immediately
        tx.set(
            post,
            PropertyId(POST_BLOG),
            &PropertyValue::Reference(ObjectId::NULL),
        )?;
        assert!(tx.get_referencing(blog, PropertyId(POST_BLOG))?.is_empty());
        tx.rollback();
        Ok(())
    })
    .unwrap();
}

#[test]
fn untracked_inverse_read_fails_fast() {
    let scheme: veloxdb::ModelScheme = serde_json::from_value(serde_json::json!({
        "classes": [
            {"id": 1, "name": "Topic", "properties": []},
            {"id": 2, "name": "Note", "properties": [
                {"id": 20, "name": "topic", "kind": "reference",
                 "multiplicity": "zero_or_one", "target_class_id": 1,
                 "track_inverse": false, "delete_target_action": "set_null"}
            ]}
        ],
        "indexes": []
    }))
    .unwrap();
    let db = Database::in_memory(&scheme).unwrap();
    let topic = db
        .transaction(TransactionKind::ReadWrite, |tx| tx.create(ClassId(1)))
        .unwrap();

    let err = db
        .transaction(TransactionKind::Read, |tx| {
            tx.get_referencing(topic, PropertyId(20))
        })
        .unwrap_err();
    assert_eq!(
        err,
        DbError::UntrackedInverseReference {
            property: PropertyId(20)
        }
    );
}
