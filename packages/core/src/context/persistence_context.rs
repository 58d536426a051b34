//! Persistence Context
//!
//! Per-session working set: what this session currently believes is true
//! about fragments and selections, whether or not the store agrees yet.
//!
//! # Architecture
//!
//! - **pristine**: bounded LRU of fragments equal to the store (`Pristine`)
//!   or known to be missing from it (`Absent`)
//! - **modified**: unbounded map of dirty fragments (`Created`, `Modified`,
//!   `Deleted`); never evicted before `save()`
//! - **selections**: one [`SelectionContext`] per index (children, complex
//!   children, series versions, series proxies, target proxies)
//! - **pending**: selection invalidations produced by local structural
//!   changes, published with the next save
//!
//! `save()` turns dirty fragments into INSERT/UPDATE/DELETE batches. Updates
//! are grouped by their exact set of touched columns, and an update whose
//! values equal the last persisted ones is dropped.

use super::selections::{SelectionContext, SelectionKind};
use crate::db::RowMapper;
use crate::models::{
    Fragment, FragmentState, Invalidations, Node, NodeId, Row, RowData, RowId, RowUpdate,
};
use crate::schema::{columns, Model, HIERARCHY_TABLE, PROXIES_TABLE, VERSIONS_TABLE};
use crate::services::error::{StorageError, StorageResult};
use lru::LruCache;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Cache capacities of a persistence context
#[derive(Debug, Clone, Copy)]
pub struct ContextCapacity {
    pub fragments: NonZeroUsize,
    pub selections: NonZeroUsize,
}

/// Per-table write plan computed by `save()`
#[derive(Debug, Default)]
struct SavePlan {
    inserts: Vec<(String, Vec<Row>)>,
    updates: Vec<(String, Vec<RowUpdate>)>,
    deletes: Vec<(String, Vec<NodeId>)>,
    elided: usize,
}

/// Counters describing the current cache contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextStats {
    pub pristine: usize,
    pub modified: usize,
    pub hard_selections: usize,
    pub soft_selections: usize,
}

pub struct PersistenceContext {
    model: Arc<Model>,
    mapper: Box<dyn RowMapper>,
    pristine: LruCache<RowId, Fragment>,
    modified: HashMap<RowId, Fragment>,
    /// Creation order of `Created` fragments, for INSERT ordering
    created_order: Vec<RowId>,
    selections: HashMap<SelectionKind, SelectionContext>,
    pending: Invalidations,
}

impl PersistenceContext {
    pub fn new(model: Arc<Model>, mapper: Box<dyn RowMapper>, capacity: ContextCapacity) -> Self {
        let selections = SelectionKind::ALL
            .into_iter()
            .map(|kind| (kind, SelectionContext::new(kind, capacity.selections)))
            .collect();
        Self {
            model,
            mapper,
            pristine: LruCache::new(capacity.fragments),
            modified: HashMap::new(),
            created_order: Vec::new(),
            selections,
            pending: Invalidations::new(),
        }
    }

    pub fn mapper(&self) -> &dyn RowMapper {
        self.mapper.as_ref()
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.modified.is_empty() || !self.pending.is_empty()
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            pristine: self.pristine.len(),
            modified: self.modified.len(),
            hard_selections: self.selections.values().map(|s| s.hard_len()).sum(),
            soft_selections: self.selections.values().map(|s| s.soft_len()).sum(),
        }
    }

    fn empty_data(&self, table: &str) -> RowData {
        if self.model.is_collection_table(table) {
            RowData::empty_collection()
        } else {
            RowData::empty_simple()
        }
    }

    fn selection(&mut self, kind: SelectionKind) -> &mut SelectionContext {
        self.selections
            .entry(kind)
            .or_insert_with(|| SelectionContext::new(kind, NonZeroUsize::MIN))
    }

    // ------------------------------------------------------------------
    // Fragment access
    // ------------------------------------------------------------------

    fn cached(&mut self, row_id: &RowId) -> Option<Fragment> {
        if let Some(fragment) = self.modified.get(row_id) {
            return Some(fragment.clone());
        }
        self.pristine.get(row_id).cloned()
    }

    fn is_cached(&self, row_id: &RowId) -> bool {
        self.modified.contains_key(row_id) || self.pristine.contains(row_id)
    }

    /// Cache a row read from the store unless a dirty copy exists
    fn remember(&mut self, row_id: RowId, row: Option<Row>) {
        if self.modified.contains_key(&row_id) {
            return;
        }
        let fragment = match row {
            Some(row) => Fragment::pristine(row),
            None => {
                let data = self.empty_data(&row_id.table);
                Fragment::absent(row_id.clone(), data)
            }
        };
        self.pristine.put(row_id, fragment);
    }

    /// Fragment for a row, reading it from the store on a miss
    pub async fn load(&mut self, row_id: &RowId) -> StorageResult<Fragment> {
        if let Some(fragment) = self.cached(row_id) {
            return Ok(fragment);
        }
        let row = self.mapper.read_by_id(&row_id.table, &row_id.id).await?;
        self.remember(row_id.clone(), row);
        self.cached(row_id)
            .ok_or_else(|| StorageError::invalid_state(format!("fragment {} not cached", row_id)))
    }

    /// Current row data, `None` when the row does not exist (or is deleted)
    pub async fn get_row(&mut self, table: &str, id: &NodeId) -> StorageResult<Option<RowData>> {
        let fragment = self.load(&RowId::new(table, id.clone())).await?;
        Ok(match fragment.state {
            FragmentState::Absent | FragmentState::Deleted => None,
            _ => Some(fragment.data),
        })
    }

    /// Current row data, empty when the row does not exist
    pub async fn get_row_or_empty(&mut self, table: &str, id: &NodeId) -> StorageResult<RowData> {
        Ok(match self.get_row(table, id).await? {
            Some(data) => data,
            None => self.empty_data(table),
        })
    }

    /// Transition a fragment to `to`, moving it between the pristine and
    /// modified sets as needed
    pub async fn mark_dirty(&mut self, row_id: &RowId, to: FragmentState) -> StorageResult<()> {
        let mut fragment = match self.modified.remove(row_id) {
            Some(fragment) => fragment,
            None => match self.pristine.pop(row_id) {
                Some(fragment) => fragment,
                None if to == FragmentState::Deleted => {
                    // Blind delete of a row never loaded
                    let data = self.empty_data(&row_id.table);
                    let mut fragment = Fragment::absent(row_id.clone(), data);
                    fragment.state = FragmentState::Pristine;
                    fragment
                }
                None => {
                    self.load(row_id).await?;
                    self.pristine.pop(row_id).ok_or_else(|| {
                        StorageError::invalid_state(format!("fragment {} vanished", row_id))
                    })?
                }
            },
        };
        let was_created = fragment.state == FragmentState::Created;
        match fragment.mark(to) {
            Ok(true) => {
                if fragment.state == FragmentState::Created && !was_created {
                    self.created_order.push(row_id.clone());
                }
                if fragment.state != FragmentState::Created && was_created {
                    self.created_order.retain(|r| r != row_id);
                }
                self.modified.insert(row_id.clone(), fragment);
                Ok(())
            }
            Ok(false) => {
                // Never persisted: forget it entirely
                self.created_order.retain(|r| r != row_id);
                if to == FragmentState::Deleted && !was_created {
                    let data = self.empty_data(&row_id.table);
                    self.pristine
                        .put(row_id.clone(), Fragment::absent(row_id.clone(), data));
                }
                Ok(())
            }
            Err(e) => {
                // Put it back untouched
                if fragment.state.is_dirty() {
                    self.modified.insert(row_id.clone(), fragment);
                } else {
                    self.pristine.put(row_id.clone(), fragment);
                }
                Err(e.into())
            }
        }
    }

    fn dirty_mut(&mut self, row_id: &RowId) -> StorageResult<&mut Fragment> {
        self.modified
            .get_mut(row_id)
            .ok_or_else(|| StorageError::invalid_state(format!("fragment {} is not dirty", row_id)))
    }

    /// Write simple columns of a row, creating it if absent
    pub async fn set_columns(
        &mut self,
        table: &str,
        id: &NodeId,
        values: BTreeMap<String, Value>,
    ) -> StorageResult<()> {
        let row_id = RowId::new(table, id.clone());
        self.mark_dirty(&row_id, FragmentState::Modified).await?;
        let fragment = self.dirty_mut(&row_id)?;
        match &mut fragment.data {
            RowData::Simple(map) => {
                map.extend(values);
                Ok(())
            }
            RowData::Collection(_) => Err(StorageError::illegal_argument(format!(
                "{} is a collection table",
                table
            ))),
        }
    }

    pub async fn set_column(
        &mut self,
        table: &str,
        id: &NodeId,
        column: &str,
        value: Value,
    ) -> StorageResult<()> {
        self.set_columns(table, id, BTreeMap::from([(column.to_string(), value)]))
            .await
    }

    /// Replace the whole content of a row, creating it if absent
    ///
    /// Simple columns present before and missing from `data` are written as
    /// explicit nulls.
    pub async fn replace_row(&mut self, table: &str, id: &NodeId, data: RowData) -> StorageResult<()> {
        let row_id = RowId::new(table, id.clone());
        self.mark_dirty(&row_id, FragmentState::Modified).await?;
        let fragment = self.dirty_mut(&row_id)?;
        fragment.data = match (&fragment.data, data) {
            (RowData::Simple(old), RowData::Simple(mut new)) => {
                for key in old.keys() {
                    new.entry(key.clone()).or_insert(Value::Null);
                }
                RowData::Simple(new)
            }
            (_, new) => new,
        };
        Ok(())
    }

    /// Register a brand new row
    pub async fn create_row(&mut self, table: &str, id: &NodeId, data: RowData) -> StorageResult<()> {
        let row_id = RowId::new(table, id.clone());
        if !self.is_cached(&row_id) {
            // New ids are never in the store
            let empty = self.empty_data(table);
            self.pristine
                .put(row_id.clone(), Fragment::absent(row_id.clone(), empty));
        }
        self.mark_dirty(&row_id, FragmentState::Created).await?;
        self.dirty_mut(&row_id)?.data = data;
        Ok(())
    }

    /// Whether the row was created by this session and not saved yet
    pub fn is_unsaved(&self, table: &str, id: &NodeId) -> bool {
        self.modified
            .get(&RowId::new(table, id.clone()))
            .is_some_and(|f| f.state == FragmentState::Created)
    }

    pub async fn delete_row(&mut self, table: &str, id: &NodeId) -> StorageResult<()> {
        let row_id = RowId::new(table, id.clone());
        if let Some(fragment) = self.modified.get(&row_id) {
            if fragment.state == FragmentState::Deleted {
                return Ok(());
            }
        }
        if let Some(fragment) = self.pristine.peek(&row_id) {
            if fragment.state == FragmentState::Absent {
                return Ok(());
            }
        }
        self.mark_dirty(&row_id, FragmentState::Deleted).await
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    /// Hierarchy data of a live (not deleted, not soft-deleted) node
    pub async fn hierarchy(&mut self, id: &NodeId) -> StorageResult<Option<RowData>> {
        Ok(self
            .get_row(HIERARCHY_TABLE, id)
            .await?
            .filter(|data| !data.get_bool(columns::IS_DELETED)))
    }

    pub async fn get_node(&mut self, id: &NodeId) -> StorageResult<Option<Node>> {
        match self.hierarchy(id).await? {
            Some(data) => Ok(Some(self.build_node(id, &data).await?)),
            None => Ok(None),
        }
    }

    async fn build_node(&mut self, id: &NodeId, data: &RowData) -> StorageResult<Node> {
        let is_version = data.get_bool(columns::IS_VERSION);
        let is_proxy = data.get_bool(columns::IS_PROXY);
        let mut version_series_id = None;
        let mut target_id = None;
        if is_version {
            let version = self.get_row_or_empty(VERSIONS_TABLE, id).await?;
            version_series_id = version.get_id(columns::VERSIONABLE_ID);
        } else if is_proxy {
            let proxy = self.get_row_or_empty(PROXIES_TABLE, id).await?;
            version_series_id = proxy.get_id(columns::VERSIONABLE_ID);
            target_id = proxy.get_id(columns::TARGET_ID);
        } else if !data.get_bool(columns::IS_COMPLEX) && data.get_str(columns::PARENT_ID).is_some() {
            version_series_id = Some(id.clone());
        }
        let mixin_types = data
            .get(columns::MIXIN_TYPES)
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        Ok(Node {
            id: id.clone(),
            parent_id: data.get_id(columns::PARENT_ID),
            name: data.get_str(columns::NAME).unwrap_or_default().to_string(),
            pos: data.get_i64(columns::POS),
            primary_type: data.get_str(columns::PRIMARY_TYPE).unwrap_or_default().to_string(),
            mixin_types,
            is_complex: data.get_bool(columns::IS_COMPLEX),
            is_version,
            is_proxy,
            is_checked_in: data.get_bool(columns::IS_CHECKED_IN),
            base_version_id: data.get_id(columns::BASE_VERSION_ID),
            version_series_id,
            target_id,
        })
    }

    /// Bulk node fetch preserving input order, `None` for missing ids
    ///
    /// Missing hierarchy rows are read with one batched call (chunked by
    /// the store), then the prefetched fragments of the loaded types are
    /// read the same way.
    pub async fn get_multi(&mut self, ids: &[NodeId]) -> StorageResult<Vec<Option<Node>>> {
        let mut missing = Vec::new();
        let mut seen = HashSet::new();
        for id in ids {
            let row_id = RowId::new(HIERARCHY_TABLE, id.clone());
            if !self.is_cached(&row_id) && seen.insert(id.clone()) {
                missing.push(id.clone());
            }
        }

        let mut loaded: HashMap<NodeId, RowData> = HashMap::new();
        if !missing.is_empty() {
            tracing::debug!("get_multi: fetching {} hierarchy rows", missing.len());
            let rows = self.mapper.read_by_ids(HIERARCHY_TABLE, &missing).await?;
            let mut by_table: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
            for (id, row) in missing.iter().zip(rows) {
                if let Some(row) = &row {
                    let type_name = row.data.get_str(columns::PRIMARY_TYPE).unwrap_or_default();
                    for table in self.model.prefetched_fragments(type_name) {
                        by_table.entry(table).or_default().push(id.clone());
                    }
                    if row.data.get_bool(columns::IS_VERSION) {
                        by_table.entry(VERSIONS_TABLE.to_string()).or_default().push(id.clone());
                    }
                    if row.data.get_bool(columns::IS_PROXY) {
                        by_table.entry(PROXIES_TABLE.to_string()).or_default().push(id.clone());
                    }
                    loaded.insert(id.clone(), row.data.clone());
                }
                self.remember(RowId::new(HIERARCHY_TABLE, id.clone()), row);
            }
            for (table, table_ids) in by_table {
                let wanted: Vec<NodeId> = table_ids
                    .into_iter()
                    .filter(|id| !self.is_cached(&RowId::new(table.as_str(), id.clone())))
                    .collect();
                if wanted.is_empty() {
                    continue;
                }
                let rows = self.mapper.read_by_ids(&table, &wanted).await?;
                for (id, row) in wanted.into_iter().zip(rows) {
                    self.remember(RowId::new(table.as_str(), id), row);
                }
            }
        }

        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            let node = match loaded.get(id) {
                Some(data) if !data.get_bool(columns::IS_DELETED) => {
                    let data = data.clone();
                    Some(self.build_node(id, &data).await?)
                }
                Some(_) => None,
                None => self.get_node(id).await?,
            };
            result.push(node);
        }
        Ok(result)
    }

    /// Whether the node or any ancestor is deleted in this session's view
    pub async fn is_deleted(&mut self, id: &NodeId) -> StorageResult<bool> {
        let mut current = Some(id.clone());
        let mut visited = HashSet::new();
        while let Some(node_id) = current {
            if !visited.insert(node_id.clone()) {
                break;
            }
            match self.hierarchy(&node_id).await? {
                Some(data) => current = data.get_id(columns::PARENT_ID),
                None => return Ok(true),
            }
        }
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Selections
    // ------------------------------------------------------------------

    fn note_selection_change(&mut self, kind: SelectionKind, key: &NodeId) {
        self.pending.add_modified(kind.table(), key);
    }

    pub fn record_created(&mut self, kind: SelectionKind, key: &NodeId, id: &NodeId) {
        self.selection(kind).record_created(key.clone(), id.clone());
        self.note_selection_change(kind, key);
    }

    pub fn record_removed(&mut self, kind: SelectionKind, key: &NodeId, id: &NodeId) {
        self.selection(kind).record_removed(key.clone(), id.clone());
        self.note_selection_change(kind, key);
    }

    /// Whether `id` currently belongs to selection `key` of `kind`
    async fn selection_matches(
        &mut self,
        kind: SelectionKind,
        key: &NodeId,
        id: &NodeId,
    ) -> StorageResult<bool> {
        let Some(hierarchy) = self.hierarchy(id).await? else {
            return Ok(false);
        };
        let key = Some(key.as_str());
        Ok(match kind {
            SelectionKind::Children | SelectionKind::ComplexChildren => {
                hierarchy.get_str(columns::PARENT_ID) == key
                    && hierarchy.get_bool(columns::IS_COMPLEX)
                        == (kind == SelectionKind::ComplexChildren)
            }
            SelectionKind::SeriesVersions => {
                let version = self.get_row_or_empty(VERSIONS_TABLE, id).await?;
                version.get_str(columns::VERSIONABLE_ID) == key
            }
            SelectionKind::SeriesProxies => {
                let proxy = self.get_row_or_empty(PROXIES_TABLE, id).await?;
                proxy.get_str(columns::VERSIONABLE_ID) == key
            }
            SelectionKind::TargetProxies => {
                let proxy = self.get_row_or_empty(PROXIES_TABLE, id).await?;
                proxy.get_str(columns::TARGET_ID) == key
            }
        })
    }

    async fn read_selection(
        &mut self,
        kind: SelectionKind,
        key: &NodeId,
    ) -> StorageResult<Vec<NodeId>> {
        let rows = match kind {
            SelectionKind::Children => self.mapper.read_by_parent(key, Some(false)).await?,
            SelectionKind::ComplexChildren => self.mapper.read_by_parent(key, Some(true)).await?,
            SelectionKind::SeriesVersions => {
                self.mapper
                    .read_by_column(VERSIONS_TABLE, columns::VERSIONABLE_ID, key.as_str())
                    .await?
            }
            SelectionKind::SeriesProxies => {
                self.mapper
                    .read_by_column(PROXIES_TABLE, columns::VERSIONABLE_ID, key.as_str())
                    .await?
            }
            SelectionKind::TargetProxies => {
                self.mapper
                    .read_by_column(PROXIES_TABLE, columns::TARGET_ID, key.as_str())
                    .await?
            }
        };
        let ids = rows.iter().map(|r| r.id.clone()).collect();
        for row in rows {
            self.remember(row.row_id(), Some(row));
        }
        Ok(ids)
    }

    /// Complete member list of a selection, filled from the store on a miss
    pub async fn get_selection(
        &mut self,
        kind: SelectionKind,
        key: &NodeId,
    ) -> StorageResult<Vec<NodeId>> {
        let ids = match self.selection(kind).get_complete(key) {
            Some(ids) => ids,
            None => {
                let store_ids = self.read_selection(kind, key).await?;
                self.selection(kind).set_complete(key.clone(), store_ids);
                self.selection(kind).get_complete(key).unwrap_or_default()
            }
        };

        let mut result = Vec::with_capacity(ids.len());
        let mut any_dirty = false;
        for id in ids {
            if self.selection_matches(kind, key, &id).await? {
                any_dirty |= self
                    .modified
                    .contains_key(&RowId::new(HIERARCHY_TABLE, id.clone()));
                result.push(id);
            }
        }
        if any_dirty {
            self.selection(kind).pin(key);
        }
        Ok(result)
    }

    /// Child of `parent` named `name`, consulting the cache first
    pub async fn get_child_id(
        &mut self,
        parent: &NodeId,
        name: &str,
        complex: bool,
    ) -> StorageResult<Option<NodeId>> {
        let kind = SelectionKind::children(complex);
        let (known, complete) = self.selection(kind).known(parent);
        for id in known {
            if self.selection_matches(kind, parent, &id).await? {
                let data = self.get_row_or_empty(HIERARCHY_TABLE, &id).await?;
                if data.get_str(columns::NAME) == Some(name) {
                    return Ok(Some(id));
                }
            }
        }
        if complete {
            return Ok(None);
        }

        let Some(row) = self.mapper.read_child_by_name(parent, name, complex).await? else {
            return Ok(None);
        };
        let id = row.id.clone();
        if self.selection(kind).is_removed(parent, &id) {
            return Ok(None);
        }
        self.remember(row.row_id(), Some(row));
        if !self.selection_matches(kind, parent, &id).await? {
            return Ok(None);
        }
        let data = self.get_row_or_empty(HIERARCHY_TABLE, &id).await?;
        if data.get_str(columns::NAME) != Some(name) {
            return Ok(None);
        }
        self.selection(kind).record_existing(parent.clone(), id.clone());
        Ok(Some(id))
    }

    /// Children of `parent` sorted by position, unpositioned ones last in
    /// natural order
    pub async fn get_ordered_children(
        &mut self,
        parent: &NodeId,
        complex: bool,
    ) -> StorageResult<Vec<(NodeId, Option<i64>)>> {
        let ids = self.get_selection(SelectionKind::children(complex), parent).await?;
        let mut children = Vec::with_capacity(ids.len());
        for id in ids {
            let pos = self.get_row_or_empty(HIERARCHY_TABLE, &id).await?.get_i64(columns::POS);
            children.push((id, pos));
        }
        // stable: equal keys keep natural order
        children.sort_by_key(|(_, pos)| (pos.is_none(), pos.unwrap_or_default()));
        Ok(children)
    }

    /// Position for a new last child of `parent`
    pub async fn get_next_pos(&mut self, parent: &NodeId, complex: bool) -> StorageResult<i64> {
        let children = self.get_ordered_children(parent, complex).await?;
        Ok(children
            .iter()
            .filter_map(|(_, pos)| *pos)
            .max()
            .map_or(0, |max| max + 1))
    }

    /// Move `source` just before `dest` (or last when `dest` is `None`)
    /// among the ordered children of `parent`, renumbering positions
    pub async fn order_before(
        &mut self,
        parent: &NodeId,
        source: &NodeId,
        dest: Option<&NodeId>,
    ) -> StorageResult<()> {
        if dest == Some(source) {
            return Ok(());
        }
        let mut order: Vec<NodeId> = self
            .get_ordered_children(parent, false)
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let Some(from) = order.iter().position(|id| id == source) else {
            return Err(StorageError::illegal_argument(format!(
                "{} is not a child of {}",
                source, parent
            )));
        };
        order.remove(from);
        let to = match dest {
            None => order.len(),
            Some(dest) => order.iter().position(|id| id == dest).ok_or_else(|| {
                StorageError::illegal_argument(format!("{} is not a child of {}", dest, parent))
            })?,
        };
        order.insert(to, source.clone());
        for (pos, id) in order.iter().enumerate() {
            self.set_column(HIERARCHY_TABLE, id, columns::POS, Value::from(pos as i64))
                .await?;
        }
        self.note_selection_change(SelectionKind::Children, parent);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Save and invalidation
    // ------------------------------------------------------------------

    fn build_save_plan(&self) -> (SavePlan, Invalidations) {
        let mut plan = SavePlan::default();
        let mut invalidations = Invalidations::new();

        // Inserts in creation order, grouped per table, hierarchy first
        let mut inserts: BTreeMap<(bool, String), Vec<Row>> = BTreeMap::new();
        let mut inserted = HashSet::new();
        for row_id in &self.created_order {
            if let Some(fragment) = self.modified.get(row_id) {
                if fragment.state == FragmentState::Created && inserted.insert(row_id.clone()) {
                    inserts
                        .entry((row_id.table != HIERARCHY_TABLE, row_id.table.clone()))
                        .or_default()
                        .push(fragment.to_row());
                    invalidations.modified.insert(row_id.clone());
                }
            }
        }
        plan.inserts = inserts.into_iter().map(|((_, t), rows)| (t, rows)).collect();

        let mut updates: BTreeMap<(String, Vec<String>), Vec<RowUpdate>> = BTreeMap::new();
        let mut deletes: BTreeMap<(bool, String), Vec<NodeId>> = BTreeMap::new();
        for (row_id, fragment) in &self.modified {
            match fragment.state {
                FragmentState::Modified => {
                    let changed: BTreeSet<String> = match (&fragment.persisted, &fragment.data) {
                        (Some(persisted), data) => data.changed_columns(persisted),
                        (None, RowData::Simple(map)) => map.keys().cloned().collect(),
                        (None, RowData::Collection(_)) => BTreeSet::from(["*".to_string()]),
                    };
                    if changed.is_empty() {
                        plan.elided += 1;
                        continue;
                    }
                    let update = match &fragment.data {
                        RowData::Simple(map) => RowUpdate::Columns {
                            id: row_id.id.clone(),
                            values: changed
                                .iter()
                                .map(|c| (c.clone(), map.get(c).cloned().unwrap_or(Value::Null)))
                                .collect(),
                        },
                        RowData::Collection(values) => RowUpdate::Collection {
                            id: row_id.id.clone(),
                            values: values.clone(),
                        },
                    };
                    updates
                        .entry((row_id.table.clone(), changed.into_iter().collect()))
                        .or_default()
                        .push(update);
                    invalidations.modified.insert(row_id.clone());
                }
                FragmentState::Deleted => {
                    // Hierarchy rows go last
                    deletes
                        .entry((row_id.table == HIERARCHY_TABLE, row_id.table.clone()))
                        .or_default()
                        .push(row_id.id.clone());
                    invalidations.deleted.insert(row_id.clone());
                }
                _ => {}
            }
        }
        plan.updates = updates
            .into_iter()
            .map(|((table, _), mut rows)| {
                rows.sort_by(|a, b| a.id().cmp(b.id()));
                (table, rows)
            })
            .collect();
        plan.deletes = deletes
            .into_iter()
            .map(|((_, table), mut ids)| {
                ids.sort();
                (table, ids)
            })
            .collect();
        (plan, invalidations)
    }

    async fn execute_plan(&self, plan: &SavePlan) -> StorageResult<()> {
        for (table, rows) in &plan.inserts {
            self.mapper.insert(table, rows).await?;
        }
        for (table, updates) in &plan.updates {
            self.mapper.update(table, updates).await?;
        }
        for (table, ids) in &plan.deletes {
            self.mapper.delete(table, ids).await?;
        }
        Ok(())
    }

    /// Flush dirty fragments to the store
    ///
    /// When `own_transaction` is set the writes are wrapped in a store
    /// transaction of their own; otherwise they join the caller's.
    /// Returns the invalidations other sessions must apply.
    pub async fn save(&mut self, own_transaction: bool) -> StorageResult<Invalidations> {
        if !self.has_pending_changes() {
            return Ok(Invalidations::new());
        }
        let (plan, mut invalidations) = self.build_save_plan();
        tracing::debug!(
            "save: {} insert batches, {} update batches, {} delete batches, {} elided",
            plan.inserts.len(),
            plan.updates.len(),
            plan.deletes.len(),
            plan.elided
        );

        if own_transaction {
            self.mapper.begin().await?;
        }
        if let Err(e) = self.execute_plan(&plan).await {
            if own_transaction {
                if let Err(rollback_err) = self.mapper.rollback().await {
                    tracing::warn!("rollback after failed save also failed: {}", rollback_err);
                }
            }
            return Err(e);
        }
        if own_transaction {
            self.mapper.commit().await?;
        }

        for (row_id, mut fragment) in self.modified.drain() {
            match fragment.state {
                FragmentState::Deleted => {
                    let data = if self.model.is_collection_table(&row_id.table) {
                        RowData::empty_collection()
                    } else {
                        RowData::empty_simple()
                    };
                    self.pristine
                        .put(row_id.clone(), Fragment::absent(row_id, data));
                }
                _ => {
                    fragment.state = FragmentState::Pristine;
                    fragment.persisted = Some(fragment.data.clone());
                    self.pristine.put(row_id, fragment);
                }
            }
        }
        self.created_order.clear();
        for selection in self.selections.values_mut() {
            selection.post_save();
        }
        invalidations.merge(std::mem::take(&mut self.pending));
        Ok(invalidations)
    }

    /// Apply invalidations received from other sessions
    ///
    /// Pristine copies are evicted. Dirty copies stay (last save wins) but
    /// lose their persisted snapshot so the next save writes every column.
    pub fn invalidate(&mut self, invalidations: &Invalidations) {
        for (row_id, _) in invalidations.entries() {
            if let Some(kind) = SelectionKind::from_table(&row_id.table) {
                self.selection(kind).invalidate(&row_id.id);
                continue;
            }
            self.pristine.pop(row_id);
            if let Some(fragment) = self.modified.get_mut(row_id) {
                tracing::debug!("concurrent change on dirty fragment {}", row_id);
                fragment.persisted = None;
            }
        }
    }

    /// Evict everything that is not dirty
    pub fn clear_caches(&mut self) {
        self.pristine.clear();
        for selection in self.selections.values_mut() {
            selection.clear_soft();
        }
    }

    /// Discard everything, including pending changes
    pub fn clear_all(&mut self) {
        self.pristine.clear();
        self.modified.clear();
        self.created_order.clear();
        self.pending = Invalidations::new();
        for selection in self.selections.values_mut() {
            selection.clear();
        }
    }
}

#[cfg(test)]
#[path = "persistence_context_test.rs"]
mod persistence_context_test;
