//! Integration tests running sessions over the libsql row store
//!
//! Tests cover:
//! - Documents, collections and versions surviving a repository reopen
//! - Transaction rollback on a real database
//! - Sequence ids staying unique across rolled back transactions

#![cfg(feature = "libsql-store")]

mod common;

use anyhow::Result;
use common::model;
use docspace_core::{IdStrategy, LibsqlRowStore, Repository, RepositoryConfig};
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

async fn open_repository(path: &Path) -> Result<Repository> {
    open_repository_with(path, RepositoryConfig::default()).await
}

async fn open_repository_with(path: &Path, config: RepositoryConfig) -> Result<Repository> {
    let store = Arc::new(LibsqlRowStore::open(path.join("repo.db")).await?);
    Ok(Repository::open(config, model(), store).await?)
}

#[tokio::test]
async fn test_documents_survive_reopen() -> Result<()> {
    let temp_dir = TempDir::new()?;

    let (root_id, doc_id) = {
        let repository = open_repository(temp_dir.path()).await?;
        let mut session = repository.get_session().await?;
        let root = session.get_root_node().await?;
        let folder = session
            .add_child_node(&root, "folder", None, "Folder", false)
            .await?;
        let doc = session
            .add_child_node(&folder, "doc", None, "TestDoc", false)
            .await?;
        session.set_property(&doc, "tst:title", json!("on disk")).await?;
        session
            .set_property(&doc, "tst:subjects", json!(["rust", "sql"]))
            .await?;
        session.check_in(&doc, None, None).await?;
        session.save().await?;
        session.close().await?;
        (root.id, doc.id)
    };

    let repository = open_repository(temp_dir.path()).await?;
    assert_eq!(repository.root_id(), &root_id);
    let mut session = repository.get_session().await?;
    let doc = session
        .get_node_by_path("/folder/doc", None)
        .await?
        .expect("persisted document");
    assert_eq!(doc.id, doc_id);
    assert!(doc.is_checked_in);
    assert_eq!(session.get_string(&doc, "tst:title").await?.as_deref(), Some("on disk"));
    assert_eq!(
        session.get_property(&doc, "tst:subjects").await?,
        json!(["rust", "sql"])
    );
    let versions = session.get_versions(&doc.id).await?;
    assert_eq!(versions.len(), 1);
    assert_eq!(
        session.get_string(&versions[0], "tst:title").await?.as_deref(),
        Some("on disk")
    );
    Ok(())
}

#[tokio::test]
async fn test_rollback_on_libsql() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let repository = open_repository(temp_dir.path()).await?;
    let mut session = repository.get_session().await?;
    let root = session.get_root_node().await?;

    session.begin_transaction().await?;
    session.add_child_node(&root, "tx", None, "TestDoc", false).await?;
    session.save().await?;
    session.rollback().await?;

    assert!(session.get_child_node(&root, "tx", false).await?.is_none());

    session.begin_transaction().await?;
    session.add_child_node(&root, "kept", None, "TestDoc", false).await?;
    session.commit().await?;

    let mut other = repository.get_session().await?;
    assert!(other.get_child_node(&root, "kept", false).await?.is_some());
    assert!(other.get_child_node(&root, "tx", false).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_sequence_ids_survive_rollback() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = RepositoryConfig {
        id_strategy: IdStrategy::Sequence,
        ..Default::default()
    };
    let repository = open_repository_with(temp_dir.path(), config).await?;
    let mut session = repository.get_session().await?;
    let root = session.get_root_node().await?;

    let mut ids = HashSet::new();
    for i in 0..99 {
        let doc = session
            .add_child_node(&root, &format!("before-{}", i), None, "TestDoc", false)
            .await?;
        assert!(ids.insert(doc.id));
    }
    session.save().await?;

    // the first block is used up inside the transaction
    session.begin_transaction().await?;
    let rolled_back = session
        .add_child_node(&root, "tx", None, "TestDoc", false)
        .await?;
    session.save().await?;
    session.rollback().await?;
    assert!(ids.insert(rolled_back.id));

    for i in 0..150 {
        let doc = session
            .add_child_node(&root, &format!("after-{}", i), None, "TestDoc", false)
            .await?;
        assert!(ids.insert(doc.id.clone()), "id {} handed out twice", doc.id);
    }
    session.save().await?;

    let mut other = repository.get_session().await?;
    assert_eq!(other.get_children(&root, false).await?.len(), 249);
    Ok(())
}
