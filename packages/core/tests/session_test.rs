//! Integration tests for the session API
//!
//! Tests cover:
//! - Creating, saving and reading documents across sessions
//! - Path resolution
//! - Cross-session visibility at synchronization points
//! - Move, copy and remove laws
//! - Ordering of orderable folders
//! - Property typing, collections and instance facets
//! - Transactions

mod common;

use anyhow::Result;
use common::create_test_env;
use docspace_core::schema::HIERARCHY_TABLE;
use docspace_core::{MemoryRowStore, Row, RowData, RowStore, StorageError, StoreError};
use serde_json::json;

// =========================================================================
// Create / Read Tests
// =========================================================================

#[tokio::test]
async fn test_hello_world_persists_across_sessions() -> Result<()> {
    let (repository, _store) = create_test_env().await?;

    let mut session = repository.get_session().await?;
    let root = session.get_root_node().await?;
    let doc = session
        .add_child_node(&root, "foo", None, "TestDoc", false)
        .await?;
    session
        .set_property(&doc, "tst:title", json!("hello world"))
        .await?;
    session.save().await?;
    session.close().await?;

    let mut other = repository.get_session().await?;
    let found = other
        .get_node_by_path("/foo", None)
        .await?
        .expect("document saved by the first session");
    assert_eq!(found.id, doc.id);
    assert_eq!(
        other.get_string(&found, "tst:title").await?.as_deref(),
        Some("hello world")
    );
    Ok(())
}

#[tokio::test]
async fn test_paths() -> Result<()> {
    let (repository, _store) = create_test_env().await?;
    let mut session = repository.get_session().await?;
    let root = session.get_root_node().await?;
    let folder = session
        .add_child_node(&root, "folder", None, "Folder", false)
        .await?;
    let doc = session
        .add_child_node(&folder, "doc", None, "TestDoc", false)
        .await?;

    assert_eq!(session.get_path(&root).await?.as_deref(), Some("/"));
    assert_eq!(session.get_path(&doc).await?.as_deref(), Some("/folder/doc"));

    let relative = session.get_node_by_path("doc", Some(&folder)).await?;
    assert_eq!(relative.map(|n| n.id), Some(doc.id.clone()));
    assert!(session.get_node_by_path("/folder/nope", None).await?.is_none());
    assert!(matches!(
        session.get_node_by_path("/folder/../doc", None).await,
        Err(StorageError::IllegalArgument(_))
    ));
    assert!(matches!(
        session.get_node_by_path("doc", None).await,
        Err(StorageError::IllegalArgument(_))
    ));

    let parent = session.get_parent_node(&doc).await?;
    assert_eq!(parent.map(|n| n.id), Some(folder.id));
    Ok(())
}

#[tokio::test]
async fn test_unknown_type_and_illegal_names_rejected() -> Result<()> {
    let (repository, _store) = create_test_env().await?;
    let mut session = repository.get_session().await?;
    let root = session.get_root_node().await?;

    assert!(matches!(
        session.add_child_node(&root, "x", None, "NoSuchType", false).await,
        Err(StorageError::InvalidType(_))
    ));
    for name in ["", "a/b", ".", ".."] {
        assert!(matches!(
            session.add_child_node(&root, name, None, "TestDoc", false).await,
            Err(StorageError::IllegalArgument(_))
        ));
    }
    Ok(())
}

#[tokio::test]
async fn test_get_nodes_by_ids_preserves_order() -> Result<()> {
    let (repository, _store) = create_test_env().await?;
    let mut session = repository.get_session().await?;
    let root = session.get_root_node().await?;
    let a = session.add_child_node(&root, "a", None, "TestDoc", false).await?;
    let b = session.add_child_node(&root, "b", None, "TestDoc", false).await?;
    session.save().await?;

    let mut other = repository.get_session().await?;
    let missing = docspace_core::NodeId::new("missing");
    let nodes = other
        .get_nodes_by_ids(&[b.id.clone(), missing, a.id.clone()])
        .await?;
    assert_eq!(nodes.len(), 3);
    assert_eq!(nodes[0].as_ref().map(|n| n.name.as_str()), Some("b"));
    assert!(nodes[1].is_none());
    assert_eq!(nodes[2].as_ref().map(|n| n.name.as_str()), Some("a"));
    Ok(())
}

// =========================================================================
// Cross-Session Visibility Tests
// =========================================================================

#[tokio::test]
async fn test_other_session_sees_changes_after_its_save() -> Result<()> {
    let (repository, _store) = create_test_env().await?;
    let mut s1 = repository.get_session().await?;
    let mut s2 = repository.get_session().await?;

    let root2 = s2.get_root_node().await?;
    assert!(s2.get_children(&root2, false).await?.is_empty());

    let root1 = s1.get_root_node().await?;
    s1.add_child_node(&root1, "foo", None, "TestDoc", false).await?;
    s1.save().await?;

    // cached listing until the next synchronization point
    assert!(s2.get_children(&root2, false).await?.is_empty());
    s2.save().await?;
    let children = s2.get_children(&root2, false).await?;
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].name, "foo");
    Ok(())
}

#[tokio::test]
async fn test_property_change_visible_after_save() -> Result<()> {
    let (repository, _store) = create_test_env().await?;
    let mut s1 = repository.get_session().await?;
    let root = s1.get_root_node().await?;
    let doc = s1.add_child_node(&root, "doc", None, "TestDoc", false).await?;
    s1.set_property(&doc, "tst:title", json!("one")).await?;
    s1.save().await?;

    let mut s2 = repository.get_session().await?;
    assert_eq!(s2.get_string(&doc, "tst:title").await?.as_deref(), Some("one"));

    s1.set_property(&doc, "tst:title", json!("two")).await?;
    s1.save().await?;

    assert_eq!(s2.get_string(&doc, "tst:title").await?.as_deref(), Some("one"));
    s2.save().await?;
    assert_eq!(s2.get_string(&doc, "tst:title").await?.as_deref(), Some("two"));
    Ok(())
}

#[tokio::test]
async fn test_two_sessions_create_same_name() -> Result<()> {
    let (repository, _store) = create_test_env().await?;
    let mut s1 = repository.get_session().await?;
    let mut s2 = repository.get_session().await?;

    let root = s1.get_root_node().await?;
    s1.add_child_node(&root, "foo", None, "TestDoc", false).await?;
    s2.add_child_node(&root, "foo", None, "TestDoc", false).await?;
    s1.save().await?;
    s2.save().await?;

    let mut s3 = repository.get_session().await?;
    assert_eq!(s3.get_children(&root, false).await?.len(), 2);
    assert!(s3.has_child_node(&root, "foo", false).await?);
    Ok(())
}

#[tokio::test]
async fn test_save_without_changes_writes_nothing() -> Result<()> {
    let (repository, store) = create_test_env().await?;
    let mut session = repository.get_session().await?;
    let root = session.get_root_node().await?;
    let doc = session.add_child_node(&root, "doc", None, "TestDoc", false).await?;
    session.set_property(&doc, "tst:title", json!("same")).await?;
    session.save().await?;

    let writes = store.stats().writes();
    session.set_property(&doc, "tst:title", json!("same")).await?;
    session.save().await?;
    assert_eq!(store.stats().writes(), writes);
    assert!(!session.has_pending_changes());
    Ok(())
}

// =========================================================================
// Move / Copy / Remove Tests
// =========================================================================

#[tokio::test]
async fn test_move_keeps_identity() -> Result<()> {
    let (repository, _store) = create_test_env().await?;
    let mut s1 = repository.get_session().await?;
    let root = s1.get_root_node().await?;
    let folder = s1.add_child_node(&root, "folder", None, "Folder", false).await?;
    let doc = s1.add_child_node(&root, "doc", None, "TestDoc", false).await?;
    s1.save().await?;

    let mut s2 = repository.get_session().await?;
    assert!(s2.get_node_by_path("/doc", None).await?.is_some());

    let moved = s1.move_node(&doc, &folder, "renamed").await?;
    assert_eq!(moved.id, doc.id);
    assert_eq!(moved.parent_id.as_ref(), Some(&folder.id));
    s1.save().await?;

    s2.save().await?;
    assert!(s2.get_node_by_path("/doc", None).await?.is_none());
    let found = s2.get_node_by_path("/folder/renamed", None).await?;
    assert_eq!(found.map(|n| n.id), Some(doc.id));
    assert!(s2.get_children(&root, false).await?.iter().all(|n| n.name != "doc"));
    Ok(())
}

#[tokio::test]
async fn test_move_under_itself_rejected() -> Result<()> {
    let (repository, _store) = create_test_env().await?;
    let mut session = repository.get_session().await?;
    let root = session.get_root_node().await?;
    let folder = session.add_child_node(&root, "folder", None, "Folder", false).await?;
    let sub = session.add_child_node(&folder, "sub", None, "Folder", false).await?;

    assert!(matches!(
        session.move_node(&folder, &sub, "loop").await,
        Err(StorageError::CannotMoveUnderItself(_))
    ));
    assert!(matches!(
        session.move_node(&folder, &folder, "loop").await,
        Err(StorageError::CannotMoveUnderItself(_))
    ));
    // nothing changed
    assert_eq!(session.get_path(&sub).await?.as_deref(), Some("/folder/sub"));
    Ok(())
}

#[tokio::test]
async fn test_move_onto_existing_name_rejected() -> Result<()> {
    let (repository, _store) = create_test_env().await?;
    let mut session = repository.get_session().await?;
    let root = session.get_root_node().await?;
    let a = session.add_child_node(&root, "a", None, "TestDoc", false).await?;
    session.add_child_node(&root, "b", None, "TestDoc", false).await?;

    assert!(matches!(
        session.move_node(&a, &root, "b").await,
        Err(StorageError::NameExists(name)) if name == "b"
    ));
    Ok(())
}

#[tokio::test]
async fn test_copy_is_deep_with_fresh_ids() -> Result<()> {
    let (repository, _store) = create_test_env().await?;
    let mut session = repository.get_session().await?;
    let root = session.get_root_node().await?;
    let folder = session.add_child_node(&root, "folder", None, "Folder", false).await?;
    let doc = session.add_child_node(&folder, "doc", None, "TestDoc", false).await?;
    session.set_property(&doc, "tst:title", json!("original")).await?;
    session
        .set_property(&doc, "tst:subjects", json!(["a", "b"]))
        .await?;
    session.save().await?;

    let copy = session.copy(&folder, &root, "folder2").await?;
    assert_ne!(copy.id, folder.id);
    session.save().await?;

    let mut other = repository.get_session().await?;
    let copied = other
        .get_node_by_path("/folder2/doc", None)
        .await?
        .expect("copied child");
    assert_ne!(copied.id, doc.id);
    assert_eq!(
        other.get_string(&copied, "tst:title").await?.as_deref(),
        Some("original")
    );
    assert_eq!(other.get_property(&copied, "tst:subjects").await?, json!(["a", "b"]));

    // the source is untouched
    let source = other.get_node_by_path("/folder/doc", None).await?;
    assert_eq!(source.map(|n| n.id), Some(doc.id));

    assert!(matches!(
        session.copy(&folder, &root, "folder2").await,
        Err(StorageError::NameExists(_))
    ));
    assert!(matches!(
        session.copy(&folder, &folder, "inside").await,
        Err(StorageError::CannotMoveUnderItself(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_remove_deletes_subtree() -> Result<()> {
    let (repository, store) = create_test_env().await?;
    let mut s1 = repository.get_session().await?;
    let root = s1.get_root_node().await?;
    let folder = s1.add_child_node(&root, "folder", None, "Folder", false).await?;
    let doc = s1.add_child_node(&folder, "doc", None, "TestDoc", false).await?;
    s1.set_property(&doc, "tst:title", json!("bye")).await?;
    s1.save().await?;

    let mut s2 = repository.get_session().await?;
    assert!(s2.get_node_by_id(&doc.id).await?.is_some());

    s1.remove_node(&folder).await?;
    assert!(s1.get_node_by_id(&doc.id).await?.is_none());
    s1.save().await?;
    assert_eq!(row_count(&store, "testschema"), 0);

    s2.save().await?;
    assert!(s2.get_node_by_id(&doc.id).await?.is_none());
    assert!(s2.get_node_by_id(&folder.id).await?.is_none());
    assert!(!s2.has_children(&root, false).await?);

    assert!(matches!(
        s1.remove_node(&root).await,
        Err(StorageError::IllegalArgument(_))
    ));
    Ok(())
}

fn row_count(store: &MemoryRowStore, table: &str) -> usize {
    store.row_count(table)
}

#[tokio::test]
async fn test_created_then_removed_before_save_writes_nothing() -> Result<()> {
    let (repository, store) = create_test_env().await?;
    let mut session = repository.get_session().await?;
    let root = session.get_root_node().await?;
    let before = store.stats().writes();

    let doc = session.add_child_node(&root, "tmp", None, "TestDoc", false).await?;
    session.set_property(&doc, "tst:title", json!("t")).await?;
    session.remove_node(&doc).await?;
    session.save().await?;

    assert_eq!(store.stats().writes(), before);
    Ok(())
}

// =========================================================================
// Ordering Tests
// =========================================================================

async fn names(session: &mut docspace_core::Session, parent: &docspace_core::Node) -> Result<Vec<String>> {
    Ok(session
        .get_children(parent, false)
        .await?
        .into_iter()
        .map(|n| n.name)
        .collect())
}

#[tokio::test]
async fn test_order_before() -> Result<()> {
    let (repository, _store) = create_test_env().await?;
    let mut session = repository.get_session().await?;
    let root = session.get_root_node().await?;
    let folder = session.add_child_node(&root, "of", None, "OFolder", false).await?;
    let a = session.add_child_node(&folder, "a", None, "TestDoc", false).await?;
    let _b = session.add_child_node(&folder, "b", None, "TestDoc", false).await?;
    let c = session.add_child_node(&folder, "c", None, "TestDoc", false).await?;
    assert_eq!(a.pos, Some(0));
    assert_eq!(c.pos, Some(2));
    session.save().await?;

    session.order_before(&folder, &c, Some(&a)).await?;
    assert_eq!(names(&mut session, &folder).await?, ["c", "a", "b"]);
    session.order_before(&folder, &a, None).await?;
    assert_eq!(names(&mut session, &folder).await?, ["c", "b", "a"]);
    session.save().await?;

    let mut other = repository.get_session().await?;
    assert_eq!(names(&mut other, &folder).await?, ["c", "b", "a"]);

    assert!(matches!(
        session.order_before(&root, &folder, None).await,
        Err(StorageError::InvalidState(_))
    ));
    Ok(())
}

// =========================================================================
// Property / Facet Tests
// =========================================================================

#[tokio::test]
async fn test_property_typing() -> Result<()> {
    let (repository, _store) = create_test_env().await?;
    let mut session = repository.get_session().await?;
    let root = session.get_root_node().await?;
    let doc = session.add_child_node(&root, "doc", None, "TestDoc", false).await?;

    session.set_property(&doc, "tst:count", json!(3)).await?;
    assert_eq!(session.get_property(&doc, "tst:count").await?, json!(3));
    assert!(matches!(
        session.set_property(&doc, "tst:count", json!("three")).await,
        Err(StorageError::IllegalArgument(_))
    ));
    assert!(matches!(
        session.set_property(&doc, "age:age", json!(3)).await,
        Err(StorageError::IllegalProperty { .. })
    ));
    assert!(matches!(
        session.get_property(&doc, "nope:nothing").await,
        Err(StorageError::IllegalProperty { .. })
    ));

    session.set_property(&doc, "tst:count", json!(null)).await?;
    assert_eq!(session.get_property(&doc, "tst:count").await?, json!(null));
    Ok(())
}

#[tokio::test]
async fn test_collection_property() -> Result<()> {
    let (repository, _store) = create_test_env().await?;
    let mut session = repository.get_session().await?;
    let root = session.get_root_node().await?;
    let doc = session.add_child_node(&root, "doc", None, "TestDoc", false).await?;

    assert_eq!(session.get_property(&doc, "tst:subjects").await?, json!([]));
    session
        .set_property(&doc, "tst:subjects", json!(["x", "y", "z"]))
        .await?;
    session.save().await?;

    let mut other = repository.get_session().await?;
    assert_eq!(
        other.get_property(&doc, "tst:subjects").await?,
        json!(["x", "y", "z"])
    );

    session.set_property(&doc, "tst:subjects", json!(null)).await?;
    assert_eq!(session.get_property(&doc, "tst:subjects").await?, json!([]));
    assert!(matches!(
        session.set_property(&doc, "tst:subjects", json!([1])).await,
        Err(StorageError::IllegalArgument(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_mixins() -> Result<()> {
    let (repository, _store) = create_test_env().await?;
    let mut session = repository.get_session().await?;
    let root = session.get_root_node().await?;
    let doc = session.add_child_node(&root, "doc", None, "TestDoc", false).await?;

    assert!(!session.has_mixin(&doc, "Aged").await?);
    assert!(session.add_mixin(&doc, "Aged").await?);
    assert!(!session.add_mixin(&doc, "Aged").await?);
    session.set_property(&doc, "age:age", json!(42)).await?;
    session.save().await?;

    let mut other = repository.get_session().await?;
    let reloaded = other.get_node_by_id(&doc.id).await?.expect("doc");
    assert!(reloaded.has_mixin("Aged"));
    assert_eq!(other.get_property(&reloaded, "age:age").await?, json!(42));

    assert!(session.remove_mixin(&doc, "Aged").await?);
    assert!(!session.remove_mixin(&doc, "Aged").await?);
    assert!(matches!(
        session.get_property(&doc, "age:age").await,
        Err(StorageError::IllegalProperty { .. })
    ));
    assert!(matches!(
        session.add_mixin(&doc, "NoSuchFacet").await,
        Err(StorageError::IllegalArgument(_))
    ));
    // type facets count as present
    let folder = session.add_child_node(&root, "f", None, "Folder", false).await?;
    assert!(session.has_mixin(&folder, "Folderish").await?);
    Ok(())
}

// =========================================================================
// Transaction Tests
// =========================================================================

#[tokio::test]
async fn test_rollback_discards_flushed_changes() -> Result<()> {
    let (repository, _store) = create_test_env().await?;
    let mut session = repository.get_session().await?;
    let root = session.get_root_node().await?;

    session.begin_transaction().await?;
    assert!(session.in_transaction());
    session.add_child_node(&root, "tx", None, "TestDoc", false).await?;
    session.save().await?;
    session.rollback().await?;
    assert!(!session.in_transaction());

    assert!(session.get_child_node(&root, "tx", false).await?.is_none());
    let mut other = repository.get_session().await?;
    assert!(other.get_child_node(&root, "tx", false).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_dropped_session_rolls_back_flushed_changes() -> Result<()> {
    let (repository, store) = create_test_env().await?;
    let root_id = {
        let mut session = repository.get_session().await?;
        let root = session.get_root_node().await?;
        session.begin_transaction().await?;
        session.add_child_node(&root, "tx", None, "TestDoc", false).await?;
        session.save().await?;
        assert_eq!(row_count(&store, HIERARCHY_TABLE), 2);
        root.id
    };

    assert_eq!(row_count(&store, HIERARCHY_TABLE), 1);
    let mut other = repository.get_session().await?;
    let root = other.get_node_by_id(&root_id).await?.expect("root");
    assert!(other.get_child_node(&root, "tx", false).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_commit_reports_flush_error() -> Result<()> {
    let (repository, store) = create_test_env().await?;
    let mut session = repository.get_session().await?;
    let root = session.get_root_node().await?;

    session.begin_transaction().await?;
    let doc = session.add_child_node(&root, "tx", None, "TestDoc", false).await?;
    // a row with the same id makes the flush fail
    let mapper = store.connect().await?;
    mapper
        .insert(
            HIERARCHY_TABLE,
            &[Row::new(HIERARCHY_TABLE, doc.id.clone(), RowData::empty_simple())],
        )
        .await?;

    assert!(matches!(
        session.commit().await,
        Err(StorageError::Store(StoreError::SqlExecutionError { .. }))
    ));
    assert!(!session.in_transaction());
    Ok(())
}

#[tokio::test]
async fn test_commit_publishes() -> Result<()> {
    let (repository, _store) = create_test_env().await?;
    let mut s1 = repository.get_session().await?;
    let mut s2 = repository.get_session().await?;
    let root = s2.get_root_node().await?;
    assert!(!s2.has_children(&root, false).await?);

    s1.begin_transaction().await?;
    s1.add_child_node(&root, "tx", None, "TestDoc", false).await?;
    s1.commit().await?;

    s2.save().await?;
    assert!(s2.has_child_node(&root, "tx", false).await?);

    assert!(matches!(
        s1.commit().await,
        Err(StorageError::InvalidState(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_closed_session_rejects_calls() -> Result<()> {
    let (repository, _store) = create_test_env().await?;
    let mut session = repository.get_session().await?;
    session.close().await?;
    assert!(!session.is_live());
    assert!(matches!(
        session.get_root_node().await,
        Err(StorageError::SessionClosed)
    ));
    // closing twice is fine
    session.close().await?;
    Ok(())
}
