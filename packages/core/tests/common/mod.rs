//! Shared helpers for the integration tests
#![allow(dead_code)]

use anyhow::Result;
use docspace_core::{MemoryRowStore, Model, Repository, RepositoryConfig};
use std::sync::Arc;

pub const MODEL_JSON: &str = r#"{
    "schemas": [
        {"name": "testschema", "prefix": "tst", "fields": [
            {"name": "title", "type": "string"},
            {"name": "description", "type": "string"},
            {"name": "count", "type": "long"},
            {"name": "file", "type": "binary"},
            {"name": "subjects", "type": "string", "collection": true}
        ]},
        {"name": "age", "prefix": "age", "fields": [{"name": "age", "type": "long"}]}
    ],
    "facets": [{"name": "Aged", "schemas": ["age"]}],
    "types": [
        {"name": "TestDoc", "schemas": ["testschema"], "prefetch": ["testschema"]},
        {"name": "Folder", "facets": ["Folderish"]},
        {"name": "OFolder", "facets": ["Folderish", "Orderable"]}
    ]
}"#;

pub fn model() -> Arc<Model> {
    Arc::new(Model::from_json(MODEL_JSON).expect("test model"))
}

/// Repository over a fresh in-memory store
pub async fn create_test_env() -> Result<(Repository, Arc<MemoryRowStore>)> {
    create_test_env_with(RepositoryConfig::default()).await
}

pub async fn create_test_env_with(
    config: RepositoryConfig,
) -> Result<(Repository, Arc<MemoryRowStore>)> {
    let store = Arc::new(MemoryRowStore::new());
    let repository = Repository::open(config, model(), store.clone()).await?;
    Ok((repository, store))
}
