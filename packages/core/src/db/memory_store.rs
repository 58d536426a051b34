//! In-Memory Row Store
//!
//! Process-local implementation of [`RowStore`] used by tests, benchmarks
//! and single-process embedding.
//!
//! # Architecture
//!
//! - **Shared tables**: all connections see one set of tables behind a mutex
//! - **Undo log transactions**: writes apply immediately; `rollback` replays
//!   the prior row images in reverse. Uncommitted writes are therefore
//!   visible to other connections (read-uncommitted isolation). Dropping a
//!   connection inside a transaction rolls it back.
//! - **IN-list limit**: bulk reads are split into chunks of `max_in_list`
//!   ids, each chunk counted as one SELECT

use super::row_store::{RowMapper, RowStore, StatsCounters, StoreStats, DEFAULT_MAX_IN_LIST};
use super::StoreError;
use crate::models::{Lock, NodeId, Row, RowData, RowUpdate};
use crate::schema::{columns, HIERARCHY_TABLE};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct StoredRow {
    seq: u64,
    data: RowData,
}

#[derive(Debug, Default)]
struct MemoryData {
    tables: HashMap<String, HashMap<NodeId, StoredRow>>,
    next_seq: u64,
    roots: HashMap<String, NodeId>,
    sequence: u64,
    locks: HashMap<NodeId, Lock>,
    cluster_nodes: Vec<String>,
    cluster_queues: HashMap<String, VecDeque<String>>,
}

impl MemoryData {
    fn sorted_rows(&self, table: &str, filter: impl Fn(&RowData) -> bool) -> Vec<Row> {
        let Some(rows) = self.tables.get(table) else {
            return Vec::new();
        };
        let mut matching: Vec<(&NodeId, &StoredRow)> =
            rows.iter().filter(|(_, row)| filter(&row.data)).collect();
        matching.sort_by_key(|(_, row)| row.seq);
        matching
            .into_iter()
            .map(|(id, row)| Row::new(table, id.clone(), row.data.clone()))
            .collect()
    }
}

#[derive(Debug)]
struct MemoryInner {
    data: Mutex<MemoryData>,
    stats: StatsCounters,
    max_in_list: usize,
}

/// In-memory row store
#[derive(Debug, Clone)]
pub struct MemoryRowStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryRowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::with_max_in_list(DEFAULT_MAX_IN_LIST)
    }

    /// Store whose bulk reads are chunked by `max_in_list` ids
    pub fn with_max_in_list(max_in_list: usize) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                data: Mutex::new(MemoryData::default()),
                stats: StatsCounters::default(),
                max_in_list: max_in_list.max(1),
            }),
        }
    }

    /// Number of rows currently stored in `table`
    pub fn row_count(&self, table: &str) -> usize {
        let data = lock(&self.inner.data);
        data.tables.get(table).map(|t| t.len()).unwrap_or(0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

#[async_trait]
impl RowStore for MemoryRowStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<Box<dyn RowMapper>, StoreError> {
        Ok(Box::new(MemoryRowMapper {
            inner: Arc::clone(&self.inner),
            undo: Mutex::new(None),
        }))
    }

    fn stats(&self) -> StoreStats {
        self.inner.stats.snapshot()
    }
}

/// Prior image of a row touched inside a transaction
#[derive(Debug)]
struct UndoEntry {
    table: String,
    id: NodeId,
    previous: Option<StoredRow>,
}

/// One connection to a [`MemoryRowStore`]
#[derive(Debug)]
pub struct MemoryRowMapper {
    inner: Arc<MemoryInner>,
    undo: Mutex<Option<Vec<UndoEntry>>>,
}

impl MemoryRowMapper {
    fn record_undo(&self, table: &str, id: &NodeId, previous: Option<StoredRow>) {
        if let Some(log) = lock(&self.undo).as_mut() {
            log.push(UndoEntry {
                table: table.to_string(),
                id: id.clone(),
                previous,
            });
        }
    }

    /// Restore the prior row images of `log`, newest first
    fn replay_undo(&self, log: Vec<UndoEntry>) {
        let mut data = lock(&self.inner.data);
        for entry in log.into_iter().rev() {
            let table = data.tables.entry(entry.table).or_default();
            match entry.previous {
                Some(previous) => {
                    table.insert(entry.id, previous);
                }
                None => {
                    table.remove(&entry.id);
                }
            }
        }
    }

    fn is_hierarchy_child(data: &RowData, parent_id: &NodeId, complex: Option<bool>) -> bool {
        data.get_str(columns::PARENT_ID) == Some(parent_id.as_str())
            && complex.map_or(true, |c| data.get_bool(columns::IS_COMPLEX) == c)
    }
}

/// A connection closed inside a transaction rolls it back
impl Drop for MemoryRowMapper {
    fn drop(&mut self) {
        let pending = self
            .undo
            .get_mut()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(log) = pending {
            tracing::debug!("rolling back {} pending writes of a dropped connection", log.len());
            self.replay_undo(log);
        }
    }
}

#[async_trait]
impl RowMapper for MemoryRowMapper {
    async fn read_by_id(&self, table: &str, id: &NodeId) -> Result<Option<Row>, StoreError> {
        self.inner.stats.record_select();
        let data = lock(&self.inner.data);
        Ok(data
            .tables
            .get(table)
            .and_then(|rows| rows.get(id))
            .map(|row| Row::new(table, id.clone(), row.data.clone())))
    }

    async fn read_by_ids(
        &self,
        table: &str,
        ids: &[NodeId],
    ) -> Result<Vec<Option<Row>>, StoreError> {
        let mut result = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.inner.max_in_list) {
            self.inner.stats.record_select();
            let data = lock(&self.inner.data);
            let rows = data.tables.get(table);
            for id in chunk {
                result.push(
                    rows.and_then(|r| r.get(id))
                        .map(|row| Row::new(table, id.clone(), row.data.clone())),
                );
            }
        }
        Ok(result)
    }

    async fn read_by_parent(
        &self,
        parent_id: &NodeId,
        complex: Option<bool>,
    ) -> Result<Vec<Row>, StoreError> {
        self.inner.stats.record_select();
        let data = lock(&self.inner.data);
        Ok(data.sorted_rows(HIERARCHY_TABLE, |d| {
            Self::is_hierarchy_child(d, parent_id, complex)
        }))
    }

    async fn read_child_by_name(
        &self,
        parent_id: &NodeId,
        name: &str,
        complex: bool,
    ) -> Result<Option<Row>, StoreError> {
        self.inner.stats.record_select();
        let data = lock(&self.inner.data);
        Ok(data
            .sorted_rows(HIERARCHY_TABLE, |d| {
                Self::is_hierarchy_child(d, parent_id, Some(complex))
                    && d.get_str(columns::NAME) == Some(name)
                    && !d.get_bool(columns::IS_DELETED)
            })
            .into_iter()
            .next())
    }

    async fn read_by_column(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<Vec<Row>, StoreError> {
        self.inner.stats.record_select();
        let data = lock(&self.inner.data);
        Ok(data.sorted_rows(table, |d| d.get_str(column) == Some(value)))
    }

    async fn scan(&self, table: &str) -> Result<Vec<Row>, StoreError> {
        self.inner.stats.record_select();
        let data = lock(&self.inner.data);
        Ok(data.sorted_rows(table, |_| true))
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut data = lock(&self.inner.data);
        if let Some(existing) = data.tables.get(table) {
            if let Some(dup) = rows.iter().find(|r| existing.contains_key(&r.id)) {
                return Err(StoreError::sql_execution(format!(
                    "duplicate primary key {}/{}",
                    table, dup.id
                )));
            }
        }
        for row in rows {
            data.next_seq += 1;
            let seq = data.next_seq;
            data.tables.entry(table.to_string()).or_default().insert(
                row.id.clone(),
                StoredRow {
                    seq,
                    data: row.data.clone(),
                },
            );
            self.record_undo(table, &row.id, None);
        }
        self.inner.stats.record_insert(rows.len());
        Ok(())
    }

    async fn update(&self, table: &str, updates: &[RowUpdate]) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut data = lock(&self.inner.data);
        let mut touched = 0;
        if let Some(rows) = data.tables.get_mut(table) {
            for update in updates {
                let Some(row) = rows.get_mut(update.id()) else {
                    continue;
                };
                let previous = row.clone();
                match (update, &mut row.data) {
                    (RowUpdate::Columns { values, .. }, RowData::Simple(map)) => {
                        for (column, value) in values {
                            map.insert(column.clone(), value.clone());
                        }
                    }
                    (RowUpdate::Collection { values, .. }, stored) => {
                        *stored = RowData::Collection(values.clone());
                    }
                    (RowUpdate::Columns { id, .. }, RowData::Collection(_)) => {
                        return Err(StoreError::corrupt_row(
                            table,
                            id.as_str(),
                            "column update on a collection row",
                        ));
                    }
                }
                touched += 1;
                self.record_undo(table, update.id(), Some(previous));
            }
        }
        self.inner.stats.record_update(touched);
        Ok(())
    }

    async fn delete(&self, table: &str, ids: &[NodeId]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut data = lock(&self.inner.data);
        let mut removed = 0;
        if let Some(rows) = data.tables.get_mut(table) {
            for id in ids {
                if let Some(previous) = rows.remove(id) {
                    removed += 1;
                    self.record_undo(table, id, Some(previous));
                }
            }
        }
        self.inner.stats.record_delete(removed);
        Ok(())
    }

    async fn begin(&self) -> Result<(), StoreError> {
        let mut undo = lock(&self.undo);
        if undo.is_some() {
            return Err(StoreError::transaction("transaction already started"));
        }
        *undo = Some(Vec::new());
        Ok(())
    }

    async fn commit(&self) -> Result<(), StoreError> {
        lock(&self.undo)
            .take()
            .map(|_| ())
            .ok_or_else(|| StoreError::transaction("commit without transaction"))
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        let Some(log) = lock(&self.undo).take() else {
            return Err(StoreError::transaction("rollback without transaction"));
        };
        self.replay_undo(log);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        lock(&self.undo).is_some()
    }

    async fn get_root_id(&self, repository: &str) -> Result<Option<NodeId>, StoreError> {
        Ok(lock(&self.inner.data).roots.get(repository).cloned())
    }

    async fn set_root_id(&self, repository: &str, id: &NodeId) -> Result<(), StoreError> {
        lock(&self.inner.data)
            .roots
            .insert(repository.to_string(), id.clone());
        Ok(())
    }

    async fn reserve_ids(&self, count: u64) -> Result<u64, StoreError> {
        let mut data = lock(&self.inner.data);
        let first = data.sequence + 1;
        data.sequence += count;
        Ok(first)
    }

    async fn get_lock(&self, id: &NodeId) -> Result<Option<Lock>, StoreError> {
        Ok(lock(&self.inner.data).locks.get(id).cloned())
    }

    async fn set_lock(&self, id: &NodeId, new_lock: &Lock) -> Result<Option<Lock>, StoreError> {
        let mut data = lock(&self.inner.data);
        if let Some(existing) = data.locks.get(id) {
            return Ok(Some(existing.clone()));
        }
        data.locks.insert(id.clone(), new_lock.clone());
        Ok(None)
    }

    async fn delete_lock(&self, id: &NodeId) -> Result<Option<Lock>, StoreError> {
        Ok(lock(&self.inner.data).locks.remove(id))
    }

    async fn cluster_register(&self, node_id: &str) -> Result<(), StoreError> {
        let mut data = lock(&self.inner.data);
        if !data.cluster_nodes.iter().any(|n| n == node_id) {
            data.cluster_nodes.push(node_id.to_string());
        }
        data.cluster_queues.entry(node_id.to_string()).or_default();
        Ok(())
    }

    async fn cluster_unregister(&self, node_id: &str) -> Result<(), StoreError> {
        let mut data = lock(&self.inner.data);
        data.cluster_nodes.retain(|n| n != node_id);
        data.cluster_queues.remove(node_id);
        Ok(())
    }

    async fn cluster_nodes(&self) -> Result<Vec<String>, StoreError> {
        Ok(lock(&self.inner.data).cluster_nodes.clone())
    }

    async fn cluster_send(&self, from: &str, payload: &str) -> Result<(), StoreError> {
        let mut data = lock(&self.inner.data);
        let targets: Vec<String> = data
            .cluster_nodes
            .iter()
            .filter(|n| n.as_str() != from)
            .cloned()
            .collect();
        for target in targets {
            data.cluster_queues
                .entry(target)
                .or_default()
                .push_back(payload.to_string());
        }
        Ok(())
    }

    async fn cluster_receive(&self, node_id: &str) -> Result<Vec<String>, StoreError> {
        let mut data = lock(&self.inner.data);
        Ok(data
            .cluster_queues
            .get_mut(node_id)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn hierarchy_row(id: &str, parent: &str, name: &str) -> Row {
        let mut map = BTreeMap::new();
        map.insert(columns::PARENT_ID.to_string(), json!(parent));
        map.insert(columns::NAME.to_string(), json!(name));
        map.insert(columns::IS_COMPLEX.to_string(), json!(false));
        Row::new(HIERARCHY_TABLE, NodeId::from(id), RowData::Simple(map))
    }

    #[tokio::test]
    async fn test_read_by_ids_preserves_order_and_chunks() {
        let store = MemoryRowStore::with_max_in_list(2);
        let mapper = store.connect().await.unwrap();
        mapper
            .insert(
                HIERARCHY_TABLE,
                &[hierarchy_row("a", "r", "a"), hierarchy_row("c", "r", "c")],
            )
            .await
            .unwrap();

        let before = store.stats().selects;
        let ids: Vec<NodeId> = ["c", "missing", "a"].iter().map(|s| NodeId::from(*s)).collect();
        let rows = mapper.read_by_ids(HIERARCHY_TABLE, &ids).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].as_ref().unwrap().id.as_str(), "c");
        assert!(rows[1].is_none());
        assert_eq!(rows[2].as_ref().unwrap().id.as_str(), "a");
        assert_eq!(store.stats().selects - before, 2);
    }

    #[tokio::test]
    async fn test_rollback_restores_prior_images() {
        let store = MemoryRowStore::new();
        let mapper = store.connect().await.unwrap();
        mapper
            .insert(HIERARCHY_TABLE, &[hierarchy_row("a", "r", "a")])
            .await
            .unwrap();

        mapper.begin().await.unwrap();
        mapper
            .insert(HIERARCHY_TABLE, &[hierarchy_row("b", "r", "b")])
            .await
            .unwrap();
        let mut values = BTreeMap::new();
        values.insert(columns::NAME.to_string(), json!("renamed"));
        mapper
            .update(
                HIERARCHY_TABLE,
                &[RowUpdate::Columns {
                    id: NodeId::from("a"),
                    values,
                }],
            )
            .await
            .unwrap();
        mapper.rollback().await.unwrap();

        assert_eq!(store.row_count(HIERARCHY_TABLE), 1);
        let a = mapper
            .read_by_id(HIERARCHY_TABLE, &NodeId::from("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.data.get_str(columns::NAME), Some("a"));
    }

    #[tokio::test]
    async fn test_read_child_by_name_returns_first_in_natural_order() {
        let store = MemoryRowStore::new();
        let mapper = store.connect().await.unwrap();
        mapper
            .insert(
                HIERARCHY_TABLE,
                &[hierarchy_row("1", "r", "foo"), hierarchy_row("2", "r", "foo")],
            )
            .await
            .unwrap();
        let row = mapper
            .read_child_by_name(&NodeId::from("r"), "foo", false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.id.as_str(), "1");
        assert_eq!(mapper.read_by_parent(&NodeId::from("r"), None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_read_child_by_name_skips_soft_deleted_rows() {
        let store = MemoryRowStore::new();
        let mapper = store.connect().await.unwrap();
        let mut tombstone = hierarchy_row("1", "r", "foo");
        if let RowData::Simple(map) = &mut tombstone.data {
            map.insert(columns::IS_DELETED.to_string(), json!(true));
        }
        mapper
            .insert(HIERARCHY_TABLE, &[tombstone, hierarchy_row("2", "r", "foo")])
            .await
            .unwrap();
        let row = mapper
            .read_child_by_name(&NodeId::from("r"), "foo", false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.id.as_str(), "2");
    }

    #[tokio::test]
    async fn test_dropped_connection_rolls_back() {
        let store = MemoryRowStore::new();
        let mapper = store.connect().await.unwrap();
        mapper
            .insert(HIERARCHY_TABLE, &[hierarchy_row("a", "r", "a")])
            .await
            .unwrap();
        mapper.begin().await.unwrap();
        mapper
            .insert(HIERARCHY_TABLE, &[hierarchy_row("b", "r", "b")])
            .await
            .unwrap();
        mapper
            .delete(HIERARCHY_TABLE, &[NodeId::from("a")])
            .await
            .unwrap();
        assert_eq!(store.row_count(HIERARCHY_TABLE), 1);

        drop(mapper);
        let other = store.connect().await.unwrap();
        assert!(other
            .read_by_id(HIERARCHY_TABLE, &NodeId::from("a"))
            .await
            .unwrap()
            .is_some());
        assert!(other
            .read_by_id(HIERARCHY_TABLE, &NodeId::from("b"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cluster_send_skips_sender() {
        let store = MemoryRowStore::new();
        let mapper = store.connect().await.unwrap();
        mapper.cluster_register("n1").await.unwrap();
        mapper.cluster_register("n2").await.unwrap();
        mapper.cluster_send("n1", "{}").await.unwrap();
        assert!(mapper.cluster_receive("n1").await.unwrap().is_empty());
        assert_eq!(mapper.cluster_receive("n2").await.unwrap(), vec!["{}".to_string()]);
        assert!(mapper.cluster_receive("n2").await.unwrap().is_empty());
    }
}
