//! Shared unit-test fixtures

use crate::schema::Model;
use std::sync::Arc;

pub(crate) const TEST_MODEL_JSON: &str = r#"{
    "schemas": [
        {"name": "testschema", "prefix": "tst", "fields": [
            {"name": "title", "type": "string"},
            {"name": "description", "type": "string"},
            {"name": "count", "type": "long"},
            {"name": "date", "type": "date"},
            {"name": "file", "type": "binary"},
            {"name": "subjects", "type": "string", "collection": true}
        ]},
        {"name": "person", "prefix": "pers", "fields": [
            {"name": "firstname", "type": "string"},
            {"name": "lastname", "type": "string"}
        ]},
        {"name": "age", "prefix": "age", "fields": [{"name": "age", "type": "long"}]}
    ],
    "facets": [{"name": "Aged", "schemas": ["age"]}],
    "types": [
        {"name": "TestDoc", "schemas": ["testschema"], "prefetch": ["testschema"]},
        {"name": "Folder", "facets": ["Folderish"]},
        {"name": "OFolder", "facets": ["Folderish", "Orderable"]},
        {"name": "Person", "schemas": ["person"]}
    ]
}"#;

pub(crate) fn test_model() -> Arc<Model> {
    Arc::new(Model::from_json(TEST_MODEL_JSON).expect("test model"))
}
