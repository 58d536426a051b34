//! Tests for the persistence context
//!
//! Tests cover:
//! - Fragment state transitions through the context
//! - Save batching, update grouping and no-op elision
//! - Order-preserving bulk reads across IN-list chunks
//! - Invalidation of pristine vs dirty fragments
//! - Children selection tiers

#[cfg(test)]
mod tests {
    use crate::context::{ContextCapacity, PersistenceContext, SelectionKind};
    use crate::db::{MemoryRowStore, RowMapper, RowStore};
    use crate::fixtures::test_model;
    use crate::models::{FragmentState, NodeId, Row, RowData, RowId};
    use crate::schema::{columns, HIERARCHY_TABLE};
    use crate::services::StorageError;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::num::NonZeroUsize;

    fn capacity() -> ContextCapacity {
        ContextCapacity {
            fragments: NonZeroUsize::new(10_000).unwrap(),
            selections: NonZeroUsize::new(100).unwrap(),
        }
    }

    async fn create_context(store: &MemoryRowStore) -> PersistenceContext {
        PersistenceContext::new(test_model(), store.connect().await.unwrap(), capacity())
    }

    fn hierarchy(parent: &str, name: &str, type_name: &str) -> RowData {
        let mut map = BTreeMap::new();
        map.insert(columns::PARENT_ID.to_string(), json!(parent));
        map.insert(columns::NAME.to_string(), json!(name));
        map.insert(columns::PRIMARY_TYPE.to_string(), json!(type_name));
        map.insert(columns::IS_COMPLEX.to_string(), json!(false));
        RowData::Simple(map)
    }

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    #[tokio::test]
    async fn test_save_twice_writes_nothing_the_second_time() {
        let store = MemoryRowStore::new();
        let mut ctx = create_context(&store).await;
        ctx.create_row(HIERARCHY_TABLE, &id("1"), hierarchy("0", "doc", "TestDoc"))
            .await
            .unwrap();
        ctx.set_column("testschema", &id("1"), "title", json!("hello"))
            .await
            .unwrap();

        let invalidations = ctx.save(true).await.unwrap();
        assert_eq!(invalidations.modified.len(), 2);
        let after_first = store.stats().writes();
        assert_eq!(after_first, 2);

        ctx.save(true).await.unwrap();
        assert_eq!(store.stats().writes(), after_first);

        // Same value again: the update is elided
        ctx.set_column("testschema", &id("1"), "title", json!("hello"))
            .await
            .unwrap();
        let invalidations = ctx.save(true).await.unwrap();
        assert!(invalidations.is_empty());
        assert_eq!(store.stats().writes(), after_first);
    }

    #[tokio::test]
    async fn test_updates_grouped_by_column_set() {
        let store = MemoryRowStore::new();
        let mut ctx = create_context(&store).await;
        for n in ["1", "2", "3"] {
            ctx.set_column("testschema", &id(n), "title", json!("t"))
                .await
                .unwrap();
        }
        ctx.save(true).await.unwrap();

        let before = store.stats();
        ctx.set_column("testschema", &id("1"), "title", json!("a"))
            .await
            .unwrap();
        ctx.set_column("testschema", &id("2"), "title", json!("b"))
            .await
            .unwrap();
        ctx.set_column("testschema", &id("3"), "description", json!("c"))
            .await
            .unwrap();
        ctx.save(true).await.unwrap();

        let after = store.stats();
        assert_eq!(after.update_batches - before.update_batches, 2);
        assert_eq!(after.updated_rows - before.updated_rows, 3);
    }

    #[tokio::test]
    async fn test_get_multi_across_in_list_chunks() {
        let store = MemoryRowStore::with_max_in_list(2000);
        let mapper = store.connect().await.unwrap();
        let rows: Vec<Row> = (0..2000)
            .map(|n| Row::new(HIERARCHY_TABLE, id(&n.to_string()), hierarchy("0", &format!("d{}", n), "Folder")))
            .collect();
        mapper.insert(HIERARCHY_TABLE, &rows).await.unwrap();

        let mut ids: Vec<NodeId> = (0..2000).map(|n| id(&n.to_string())).collect();
        ids.insert(5, id("missing-a"));
        ids.insert(1500, id("missing-b"));
        assert_eq!(ids.len(), 2002);

        let mut ctx = create_context(&store).await;
        let before = store.stats().selects;
        let nodes = ctx.get_multi(&ids).await.unwrap();

        assert_eq!(nodes.len(), 2002);
        for (requested, node) in ids.iter().zip(&nodes) {
            match node {
                Some(node) => assert_eq!(&node.id, requested),
                None => assert!(requested.as_str().starts_with("missing")),
            }
        }
        assert!(nodes[5].is_none());
        assert!(nodes[1500].is_none());
        assert_eq!(nodes.iter().filter(|n| n.is_none()).count(), 2);
        // two hierarchy chunks, one misc prefetch chunk
        assert_eq!(store.stats().selects - before, 3);
    }

    #[tokio::test]
    async fn test_invalidation_evicts_pristine_keeps_dirty() {
        let store = MemoryRowStore::new();
        let mut writer = create_context(&store).await;
        let mut reader = create_context(&store).await;
        writer
            .set_column("testschema", &id("1"), "title", json!("v1"))
            .await
            .unwrap();
        writer.save(true).await.unwrap();

        let data = reader.get_row("testschema", &id("1")).await.unwrap().unwrap();
        assert_eq!(data.get("title"), &json!("v1"));

        writer
            .set_column("testschema", &id("1"), "title", json!("v2"))
            .await
            .unwrap();
        let batch = writer.save(true).await.unwrap();

        // Stale until the batch is applied
        let data = reader.get_row("testschema", &id("1")).await.unwrap().unwrap();
        assert_eq!(data.get("title"), &json!("v1"));
        reader.invalidate(&batch);
        let data = reader.get_row("testschema", &id("1")).await.unwrap().unwrap();
        assert_eq!(data.get("title"), &json!("v2"));

        // A dirty fragment survives invalidation and is fully rewritten
        reader
            .set_column("testschema", &id("1"), "description", json!("mine"))
            .await
            .unwrap();
        writer
            .set_column("testschema", &id("1"), "title", json!("v3"))
            .await
            .unwrap();
        let batch = writer.save(true).await.unwrap();
        reader.invalidate(&batch);
        let data = reader.get_row("testschema", &id("1")).await.unwrap().unwrap();
        assert_eq!(data.get("description"), &json!("mine"));
        reader.save(true).await.unwrap();

        let mut fresh = create_context(&store).await;
        let data = fresh.get_row("testschema", &id("1")).await.unwrap().unwrap();
        // last save wins
        assert_eq!(data.get("title"), &json!("v2"));
        assert_eq!(data.get("description"), &json!("mine"));
    }

    #[tokio::test]
    async fn test_deleted_fragment_rejects_writes() {
        let store = MemoryRowStore::new();
        let mut ctx = create_context(&store).await;
        ctx.set_column("testschema", &id("1"), "title", json!("x"))
            .await
            .unwrap();
        ctx.save(true).await.unwrap();

        ctx.delete_row("testschema", &id("1")).await.unwrap();
        let result = ctx
            .mark_dirty(&RowId::new("testschema", id("1")), FragmentState::Modified)
            .await;
        assert!(matches!(result, Err(StorageError::InvalidState(_))));
        assert!(ctx.get_row("testschema", &id("1")).await.unwrap().is_none());

        ctx.save(true).await.unwrap();
        assert_eq!(store.row_count("testschema"), 0);
    }

    #[tokio::test]
    async fn test_created_then_deleted_never_reaches_store() {
        let store = MemoryRowStore::new();
        let mut ctx = create_context(&store).await;
        ctx.create_row(HIERARCHY_TABLE, &id("1"), hierarchy("0", "tmp", "Folder"))
            .await
            .unwrap();
        ctx.delete_row(HIERARCHY_TABLE, &id("1")).await.unwrap();
        assert!(!ctx.has_pending_changes());
        ctx.save(true).await.unwrap();
        assert_eq!(store.stats().writes(), 0);
    }

    #[tokio::test]
    async fn test_replace_row_writes_explicit_nulls() {
        let store = MemoryRowStore::new();
        let mut ctx = create_context(&store).await;
        ctx.set_column("testschema", &id("1"), "date", json!("2024-05-01T00:00:00Z"))
            .await
            .unwrap();
        ctx.save(true).await.unwrap();

        ctx.replace_row("testschema", &id("1"), RowData::empty_simple())
            .await
            .unwrap();
        ctx.save(true).await.unwrap();

        let mut fresh = create_context(&store).await;
        let data = fresh.get_row("testschema", &id("1")).await.unwrap().unwrap();
        assert_eq!(data.get("date"), &Value::Null);
    }

    #[tokio::test]
    async fn test_children_selection_hard_until_save() {
        let store = MemoryRowStore::new();
        let mut ctx = create_context(&store).await;
        ctx.create_row(HIERARCHY_TABLE, &id("1"), hierarchy("0", "a", "Folder"))
            .await
            .unwrap();
        ctx.record_created(SelectionKind::Children, &id("0"), &id("1"));
        assert_eq!(ctx.stats().hard_selections, 1);

        let children = ctx.get_selection(SelectionKind::Children, &id("0")).await.unwrap();
        assert_eq!(children, vec![id("1")]);
        assert_eq!(ctx.get_child_id(&id("0"), "a", false).await.unwrap(), Some(id("1")));

        let batch = ctx.save(true).await.unwrap();
        assert!(batch
            .modified
            .contains(&RowId::new(SelectionKind::Children.table(), id("0"))));
        assert_eq!(ctx.stats().hard_selections, 0);
        assert_eq!(ctx.stats().modified, 0);
    }

    #[tokio::test]
    async fn test_child_lookup_goes_to_store_when_partial() {
        let store = MemoryRowStore::new();
        let mapper = store.connect().await.unwrap();
        mapper
            .insert(HIERARCHY_TABLE, &[Row::new(HIERARCHY_TABLE, id("7"), hierarchy("0", "foo", "Folder"))])
            .await
            .unwrap();

        let mut ctx = create_context(&store).await;
        assert_eq!(ctx.get_child_id(&id("0"), "foo", false).await.unwrap(), Some(id("7")));
        assert_eq!(ctx.get_child_id(&id("0"), "bar", false).await.unwrap(), None);
        assert_eq!(ctx.get_child_id(&id("0"), "foo", true).await.unwrap(), None);
        assert!(ctx.is_deleted(&id("missing")).await.unwrap());
    }
}
