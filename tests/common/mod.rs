//! Shared fixtures for the end-to-end test suite.

#![allow(dead_code)]

use once_cell::sync::Lazy;
use veloxdb::{Database, ModelScheme};

/// Capture engine logs into the test harness, once per process.
static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
});

/// Class ids of the blog fixture.
pub const PERSON: u16 = 1;
pub const BLOG: u16 = 2;
pub const POST: u16 = 3;
pub const ORDER: u16 = 4;

/// Property ids of the blog fixture.
pub const USER_NAME: u16 = 10;
pub const EMAIL: u16 = 11;
pub const AGE: u16 = 12;
pub const BLOG_TITLE: u16 = 20;
pub const POST_BLOG: u16 = 30;
pub const POST_TITLE: u16 = 31;
pub const ORDERED_BY: u16 = 40;

/// Index ids.
pub const IX_USER_NAME: u16 = 1;

/// The baseline model: a unique-indexed `Person`, a `Blog` with cascading
/// `Post`s, and an `Order` with an optional tracked reference to `Person`.
pub fn blog_scheme() -> ModelScheme {
    serde_json::from_value(blog_scheme_json()).expect("fixture scheme is well-formed")
}

/// The baseline model as a mutable document, for schema-update variants.
pub fn blog_scheme_json() -> serde_json::Value {
    serde_json::json!({
        "classes": [
            {"id": PERSON, "name": "Person", "properties": [
                {"id": USER_NAME, "name": "user_name", "kind": "simple", "type": "string"},
                {"id": EMAIL, "name": "email", "kind": "simple", "type": "string"},
                {"id": AGE, "name": "age", "kind": "simple", "type": "int",
                 "default_value": {"int": 0}}
            ]},
            {"id": BLOG, "name": "Blog", "log_name": "content", "properties": [
                {"id": BLOG_TITLE, "name": "title", "kind": "simple", "type": "string"}
            ]},
            {"id": POST, "name": "Post", "log_name": "content", "properties": [
                {"id": POST_BLOG, "name": "blog", "kind": "reference",
                 "multiplicity": "zero_or_one", "target_class_id": BLOG,
                 "track_inverse": true, "delete_target_action": "cascade"},
                {"id": POST_TITLE, "name": "title", "kind": "simple", "type": "string"}
            ]},
            {"id": ORDER, "name": "Order", "properties": [
                {"id": ORDERED_BY, "name": "ordered_by", "kind": "reference",
                 "multiplicity": "zero_or_one", "target_class_id": PERSON,
                 "track_inverse": true, "delete_target_action": "prevent"}
            ]}
        ],
        "indexes": [
            {"id": IX_USER_NAME, "name": "person_by_user_name", "kind": "hash",
             "key_property_ids": [USER_NAME], "is_unique": true, "class_ids": [PERSON]}
        ]
    })
}

/// Ephemeral database over the blog fixture.
pub fn blog_db() -> Database {
    Lazy::force(&TRACING);
    Database::in_memory(&blog_scheme()).expect("fixture model compiles")
}
