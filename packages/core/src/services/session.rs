//! Session
//!
//! The unit of work over the document tree. A session stages every write in
//! its [`PersistenceContext`] and only touches the store on `save()` (or
//! `on_before_commit()` inside a transaction). Saved batches are published
//! to the other sessions, which apply them at their own next
//! synchronization point.
//!
//! # Synchronization points
//!
//! - `save()` outside a transaction: flush, publish, then drain
//! - `begin_transaction()`: drain
//! - `commit()`: flush, store commit, publish
//!
//! A session is used by one task at a time; share a [`Repository`] and open
//! one session per task instead.

use crate::context::{ContextCapacity, ContextStats, PersistenceContext, SelectionKind};
use crate::db::{RowMapper, StoreError};
use crate::models::{AclEntry, Invalidations, Lock, Node, NodeId, RowData};
use crate::schema::{
    columns, PropertyInfo, ACLS_TABLE, HIERARCHY_TABLE, MISC_TABLE, PROXIES_TABLE,
    READ_ACLS_TABLE, VERSIONS_TABLE,
};
use crate::services::error::{StorageError, StorageResult};
use crate::services::invalidation::SessionId;
use crate::services::query::{PartialList, Query, QueryEngine, QueryFilter, QueryResultIter};
use crate::services::repository::{Repository, RepositoryInner};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

const DEFAULT_LIFECYCLE_STATE: &str = "project";

pub struct Session {
    id: SessionId,
    repository: Repository,
    context: PersistenceContext,
    _permit: OwnedSemaphorePermit,
    /// Invalidations flushed in the current transaction, published on commit
    transaction: Option<Invalidations>,
    closed: bool,
}

fn mixins_of(data: &RowData) -> Vec<String> {
    data.get(columns::MIXIN_TYPES)
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

fn primary_type_of(data: &RowData) -> String {
    data.get_str(columns::PRIMARY_TYPE).unwrap_or_default().to_string()
}

fn check_name(name: &str) -> StorageResult<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(StorageError::illegal_argument(format!("illegal node name '{}'", name)));
    }
    Ok(())
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        repository: Repository,
        mapper: Box<dyn RowMapper>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        let config = repository.config();
        let capacity = ContextCapacity {
            fragments: config.fragment_capacity(),
            selections: config.children_capacity(),
        };
        let context = PersistenceContext::new(Arc::clone(repository.model()), mapper, capacity);
        Self {
            id,
            repository,
            context,
            _permit: permit,
            transaction: None,
            closed: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn is_live(&self) -> bool {
        !self.closed
    }

    pub fn context_stats(&self) -> ContextStats {
        self.context.stats()
    }

    pub fn has_pending_changes(&self) -> bool {
        self.context.has_pending_changes()
    }

    fn inner(&self) -> Arc<RepositoryInner> {
        Arc::clone(self.repository.inner())
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::SessionClosed);
        }
        Ok(())
    }

    async fn new_id(&self) -> StorageResult<NodeId> {
        self.repository.inner().ids.next_id().await
    }

    /// Hierarchy data of a live node, `NotFound` otherwise
    async fn hierarchy_of(&mut self, id: &NodeId) -> StorageResult<RowData> {
        self.context
            .hierarchy(id)
            .await?
            .ok_or_else(|| StorageError::not_found(id))
    }

    async fn node(&mut self, id: &NodeId) -> StorageResult<Node> {
        self.context
            .get_node(id)
            .await?
            .ok_or_else(|| StorageError::not_found(id))
    }

    fn is_orderable(&self, data: &RowData) -> bool {
        self.context.model().is_orderable(&primary_type_of(data))
    }

    fn empty_data(&self, table: &str) -> RowData {
        if self.context.model().is_collection_table(table) {
            RowData::empty_collection()
        } else {
            RowData::empty_simple()
        }
    }

    // ------------------------------------------------------------------
    // Synchronization and transactions
    // ------------------------------------------------------------------

    /// Apply the invalidations other sessions (and cluster nodes) queued
    /// for this session
    async fn process_invalidations(&mut self) -> StorageResult<()> {
        let inner = self.inner();
        inner.receive_cluster_invalidations().await?;
        let batch = inner.propagator.drain(self.id);
        if !batch.is_empty() {
            tracing::debug!("{} applying {} invalidations", self.id, batch.len());
            self.context.invalidate(&batch);
        }
        Ok(())
    }

    /// Flush pending changes
    ///
    /// Outside a transaction the flush is committed immediately, published
    /// to the other sessions, and this session then applies what others
    /// published. Inside a transaction the flush joins the transaction and
    /// is published on commit.
    pub async fn save(&mut self) -> StorageResult<()> {
        self.check_open()?;
        if self.transaction.is_some() {
            return self.on_before_commit().await;
        }
        let batch = self.context.save(true).await?;
        self.inner().publish(Some(self.id), &batch).await?;
        self.process_invalidations().await
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub async fn begin_transaction(&mut self) -> StorageResult<()> {
        self.check_open()?;
        if self.transaction.is_some() {
            return Err(StorageError::invalid_state("transaction already started"));
        }
        self.context.mapper().begin().await?;
        self.transaction = Some(Invalidations::new());
        self.process_invalidations().await
    }

    /// Flush into the running transaction
    pub async fn on_before_commit(&mut self) -> StorageResult<()> {
        self.check_open()?;
        let batch = self.context.save(false).await?;
        match self.transaction.as_mut() {
            Some(pending) => {
                pending.merge(batch);
                Ok(())
            }
            None => Err(StorageError::invalid_state("no transaction in progress")),
        }
    }

    pub async fn commit(&mut self) -> StorageResult<()> {
        self.check_open()?;
        if self.transaction.is_none() {
            return Err(StorageError::invalid_state("no transaction in progress"));
        }
        if let Err(e) = self.on_before_commit().await {
            if let Err(rollback_error) = self.rollback().await {
                tracing::warn!(
                    "rollback after failed flush of {} failed: {}",
                    self.id,
                    rollback_error
                );
            }
            return Err(e);
        }
        if let Err(e) = self.context.mapper().commit().await {
            self.on_after_rollback();
            return Err(e.into());
        }
        let batch = self.transaction.take().unwrap_or_default();
        self.inner().publish(Some(self.id), &batch).await
    }

    /// Forget everything cached: the store no longer matches what was
    /// flushed during the transaction
    pub fn on_after_rollback(&mut self) {
        self.transaction = None;
        self.context.clear_all();
    }

    pub async fn rollback(&mut self) -> StorageResult<()> {
        self.check_open()?;
        if self.transaction.is_none() {
            return Err(StorageError::invalid_state("no transaction in progress"));
        }
        let result = self.context.mapper().rollback().await;
        self.on_after_rollback();
        tracing::debug!("{} rolled back", self.id);
        Ok(result?)
    }

    /// Close the session, rolling back any running transaction
    pub async fn close(&mut self) -> StorageResult<()> {
        if self.closed {
            return Ok(());
        }
        if self.transaction.is_some() {
            if let Err(e) = self.rollback().await {
                tracing::warn!("rollback on close of {} failed: {}", self.id, e);
            }
        }
        self.closed = true;
        self.context.clear_all();
        self.repository.inner().propagator.remove_queue(self.id);
        tracing::debug!("{} closed", self.id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Navigation
    // ------------------------------------------------------------------

    pub async fn get_root_node(&mut self) -> StorageResult<Node> {
        self.check_open()?;
        let root_id = self.repository.root_id().clone();
        self.node(&root_id).await
    }

    pub async fn get_node_by_id(&mut self, id: &NodeId) -> StorageResult<Option<Node>> {
        self.check_open()?;
        self.context.get_node(id).await
    }

    /// Bulk fetch: one result per id, `None` for missing ones
    pub async fn get_nodes_by_ids(&mut self, ids: &[NodeId]) -> StorageResult<Vec<Option<Node>>> {
        self.check_open()?;
        self.context.get_multi(ids).await
    }

    pub async fn get_parent_node(&mut self, node: &Node) -> StorageResult<Option<Node>> {
        self.check_open()?;
        let data = self.hierarchy_of(&node.id).await?;
        match data.get_id(columns::PARENT_ID) {
            Some(parent) => self.context.get_node(&parent).await,
            None => Ok(None),
        }
    }

    /// Absolute path of a node; `None` for versions, which live outside
    /// the tree
    pub async fn get_path(&mut self, node: &Node) -> StorageResult<Option<String>> {
        self.check_open()?;
        let mut names = Vec::new();
        let mut visited = HashSet::new();
        let mut current = node.id.clone();
        loop {
            if !visited.insert(current.clone()) {
                return Err(StorageError::invalid_state(format!("cycle above {}", node.id)));
            }
            let data = self.hierarchy_of(&current).await?;
            match data.get_id(columns::PARENT_ID) {
                Some(parent) => {
                    names.push(data.get_str(columns::NAME).unwrap_or_default().to_string());
                    current = parent;
                }
                None if data.get_bool(columns::IS_VERSION) => return Ok(None),
                None => break,
            }
        }
        names.reverse();
        Ok(Some(format!("/{}", names.join("/"))))
    }

    /// Resolve an absolute path, or a relative one from `base`
    pub async fn get_node_by_path(
        &mut self,
        path: &str,
        base: Option<&Node>,
    ) -> StorageResult<Option<Node>> {
        self.check_open()?;
        let (mut current, rest) = match path.strip_prefix('/') {
            Some(rest) => (self.repository.root_id().clone(), rest),
            None => match base {
                Some(base) => (base.id.clone(), path),
                None => {
                    return Err(StorageError::illegal_argument(format!(
                        "relative path '{}' without a base node",
                        path
                    )))
                }
            },
        };
        for part in rest.split('/').filter(|p| !p.is_empty()) {
            if part == "." || part == ".." {
                return Err(StorageError::illegal_argument(format!(
                    "illegal path segment '{}' in '{}'",
                    part, path
                )));
            }
            match self.context.get_child_id(&current, part, false).await? {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
        self.context.get_node(&current).await
    }

    pub async fn get_child_node(
        &mut self,
        parent: &Node,
        name: &str,
        complex: bool,
    ) -> StorageResult<Option<Node>> {
        self.check_open()?;
        match self.context.get_child_id(&parent.id, name, complex).await? {
            Some(id) => self.context.get_node(&id).await,
            None => Ok(None),
        }
    }

    pub async fn has_child_node(
        &mut self,
        parent: &Node,
        name: &str,
        complex: bool,
    ) -> StorageResult<bool> {
        self.check_open()?;
        Ok(self.context.get_child_id(&parent.id, name, complex).await?.is_some())
    }

    pub async fn has_children(&mut self, parent: &Node, complex: bool) -> StorageResult<bool> {
        self.check_open()?;
        let ids = self
            .context
            .get_selection(SelectionKind::children(complex), &parent.id)
            .await?;
        Ok(!ids.is_empty())
    }

    /// Children of a node; ordered by position for orderable parents and
    /// complex properties, natural store order otherwise
    pub async fn get_children(&mut self, parent: &Node, complex: bool) -> StorageResult<Vec<Node>> {
        self.check_open()?;
        let data = self.hierarchy_of(&parent.id).await?;
        let ids: Vec<NodeId> = if complex || self.is_orderable(&data) {
            self.context
                .get_ordered_children(&parent.id, complex)
                .await?
                .into_iter()
                .map(|(id, _)| id)
                .collect()
        } else {
            self.context
                .get_selection(SelectionKind::children(complex), &parent.id)
                .await?
        };
        Ok(self.context.get_multi(&ids).await?.into_iter().flatten().collect())
    }

    /// Fail when `dest` is `node` or one of its descendants
    async fn check_not_under(&mut self, node: &NodeId, dest: &NodeId) -> StorageResult<()> {
        let mut visited = HashSet::new();
        let mut current = Some(dest.clone());
        while let Some(id) = current {
            if &id == node {
                return Err(StorageError::CannotMoveUnderItself(node.clone()));
            }
            if !visited.insert(id.clone()) {
                break;
            }
            current = self.hierarchy_of(&id).await?.get_id(columns::PARENT_ID);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    fn hierarchy_values(
        parent: &NodeId,
        name: &str,
        pos: Option<i64>,
        type_name: &str,
        complex: bool,
    ) -> BTreeMap<String, Value> {
        BTreeMap::from([
            (columns::PARENT_ID.to_string(), json!(parent)),
            (columns::NAME.to_string(), json!(name)),
            (columns::POS.to_string(), json!(pos)),
            (columns::PRIMARY_TYPE.to_string(), json!(type_name)),
            (columns::IS_COMPLEX.to_string(), json!(complex)),
        ])
    }

    /// Create a child node
    ///
    /// Same-named siblings are not rejected here: two sessions may create
    /// them concurrently and lookups then return the first in store order.
    pub async fn add_child_node(
        &mut self,
        parent: &Node,
        name: &str,
        pos: Option<i64>,
        type_name: &str,
        complex: bool,
    ) -> StorageResult<Node> {
        self.check_open()?;
        check_name(name)?;
        if !self.context.model().is_valid_type(type_name) {
            return Err(StorageError::invalid_type(type_name));
        }
        let parent_data = self.hierarchy_of(&parent.id).await?;
        if parent_data.get_bool(columns::IS_PROXY) {
            return Err(StorageError::invalid_state("cannot add children to a proxy"));
        }
        let pos = match pos {
            Some(pos) => Some(pos),
            None if complex || self.is_orderable(&parent_data) => {
                Some(self.context.get_next_pos(&parent.id, complex).await?)
            }
            None => None,
        };

        let id = self.new_id().await?;
        let values = Self::hierarchy_values(&parent.id, name, pos, type_name, complex);
        self.context
            .create_row(HIERARCHY_TABLE, &id, RowData::Simple(values))
            .await?;
        if !complex {
            let misc = BTreeMap::from([(
                columns::LIFECYCLE_STATE.to_string(),
                json!(DEFAULT_LIFECYCLE_STATE),
            )]);
            self.context
                .create_row(MISC_TABLE, &id, RowData::Simple(misc))
                .await?;
        }
        self.context
            .record_created(SelectionKind::children(complex), &parent.id, &id);
        tracing::debug!("{} created {} '{}' ({})", self.id, id, name, type_name);
        self.node(&id).await
    }

    /// Move and/or rename a node; its id is unchanged
    pub async fn move_node(&mut self, node: &Node, new_parent: &Node, name: &str) -> StorageResult<Node> {
        self.check_open()?;
        check_name(name)?;
        let source = self.hierarchy_of(&node.id).await?;
        let Some(old_parent) = source.get_id(columns::PARENT_ID) else {
            return Err(StorageError::illegal_argument("cannot move the root or a version"));
        };
        let complex = source.get_bool(columns::IS_COMPLEX);
        self.check_not_under(&node.id, &new_parent.id).await?;
        let dest = self.hierarchy_of(&new_parent.id).await?;

        let same_parent = old_parent == new_parent.id;
        if same_parent && source.get_str(columns::NAME) == Some(name) {
            return self.node(&node.id).await;
        }
        if let Some(existing) = self.context.get_child_id(&new_parent.id, name, complex).await? {
            if existing != node.id {
                return Err(StorageError::name_exists(name));
            }
        }

        let mut values = BTreeMap::from([
            (columns::PARENT_ID.to_string(), json!(new_parent.id)),
            (columns::NAME.to_string(), json!(name)),
        ]);
        if !same_parent {
            let pos = if complex || self.is_orderable(&dest) {
                Some(self.context.get_next_pos(&new_parent.id, complex).await?)
            } else {
                None
            };
            values.insert(columns::POS.to_string(), json!(pos));
        }
        self.context
            .set_columns(HIERARCHY_TABLE, &node.id, values)
            .await?;
        if !same_parent {
            let kind = SelectionKind::children(complex);
            self.context.record_removed(kind, &old_parent, &node.id);
            self.context.record_created(kind, &new_parent.id, &node.id);
        }
        self.node(&node.id).await
    }

    /// Deep copy under `dest_parent` with fresh ids
    pub async fn copy(&mut self, node: &Node, dest_parent: &Node, name: &str) -> StorageResult<Node> {
        self.check_open()?;
        check_name(name)?;
        let source = self.hierarchy_of(&node.id).await?;
        let complex = source.get_bool(columns::IS_COMPLEX);
        self.check_not_under(&node.id, &dest_parent.id).await?;
        let dest = self.hierarchy_of(&dest_parent.id).await?;
        if dest.get_bool(columns::IS_PROXY) {
            return Err(StorageError::invalid_state("cannot copy under a proxy"));
        }
        if self
            .context
            .get_child_id(&dest_parent.id, name, complex)
            .await?
            .is_some()
        {
            return Err(StorageError::name_exists(name));
        }
        let pos = if complex || self.is_orderable(&dest) {
            Some(self.context.get_next_pos(&dest_parent.id, complex).await?)
        } else {
            None
        };
        let id = self.copy_subtree(&node.id, &dest_parent.id, name, pos).await?;
        self.node(&id).await
    }

    /// Copy one node's rows under `parent`, clearing versioning markers
    async fn copy_node(
        &mut self,
        source: &NodeId,
        parent: &NodeId,
        name: &str,
        pos: Option<i64>,
    ) -> StorageResult<NodeId> {
        let data = self.hierarchy_of(source).await?;
        let complex = data.get_bool(columns::IS_COMPLEX);
        let type_name = primary_type_of(&data);
        let mixins = mixins_of(&data);
        let id = self.new_id().await?;

        let mut values = match &data {
            RowData::Simple(map) => map.clone(),
            RowData::Collection(_) => BTreeMap::new(),
        };
        values.insert(columns::PARENT_ID.to_string(), json!(parent));
        values.insert(columns::NAME.to_string(), json!(name));
        values.insert(columns::POS.to_string(), json!(pos));
        for column in [
            columns::IS_VERSION,
            columns::IS_CHECKED_IN,
            columns::BASE_VERSION_ID,
            columns::IS_DELETED,
            columns::DELETED_TIME,
        ] {
            values.remove(column);
        }
        self.context
            .create_row(HIERARCHY_TABLE, &id, RowData::Simple(values))
            .await?;
        self.context
            .record_created(SelectionKind::children(complex), parent, &id);

        let tables = self.context.model().fragments_for_instance(&type_name, &mixins);
        for table in tables {
            if table == HIERARCHY_TABLE || table == READ_ACLS_TABLE {
                continue;
            }
            if let Some(row) = self.context.get_row(&table, source).await? {
                self.context.create_row(&table, &id, row).await?;
            }
        }
        if data.get_bool(columns::IS_PROXY) {
            let proxy = self.context.get_row_or_empty(PROXIES_TABLE, source).await?;
            if let Some(series) = proxy.get_id(columns::VERSIONABLE_ID) {
                self.context
                    .record_created(SelectionKind::SeriesProxies, &series, &id);
            }
            if let Some(target) = proxy.get_id(columns::TARGET_ID) {
                self.context
                    .record_created(SelectionKind::TargetProxies, &target, &id);
            }
            self.context.create_row(PROXIES_TABLE, &id, proxy).await?;
        }
        Ok(id)
    }

    /// Copy `source` and its descendants under `parent`, returning the new
    /// id of `source`
    async fn copy_subtree(
        &mut self,
        source: &NodeId,
        parent: &NodeId,
        name: &str,
        pos: Option<i64>,
    ) -> StorageResult<NodeId> {
        let mut work = vec![(source.clone(), parent.clone(), name.to_string(), pos)];
        let mut top = None;
        while let Some((src, dest, name, pos)) = work.pop() {
            let id = self.copy_node(&src, &dest, &name, pos).await?;
            if top.is_none() {
                top = Some(id.clone());
            }
            for complex in [true, false] {
                for (child, child_pos) in self.context.get_ordered_children(&src, complex).await? {
                    let child_name = self
                        .hierarchy_of(&child)
                        .await?
                        .get_str(columns::NAME)
                        .unwrap_or_default()
                        .to_string();
                    work.push((child, id.clone(), child_name, child_pos));
                }
            }
        }
        top.ok_or_else(|| StorageError::invalid_state("nothing copied"))
    }

    /// `id` and all its descendants, parents before children
    async fn collect_subtree(&mut self, id: &NodeId) -> StorageResult<Vec<NodeId>> {
        let mut result = Vec::new();
        let mut queue = VecDeque::from([id.clone()]);
        let mut seen = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            for complex in [true, false] {
                let children = self
                    .context
                    .get_selection(SelectionKind::children(complex), &current)
                    .await?;
                queue.extend(children);
            }
            result.push(current);
        }
        Ok(result)
    }

    /// Mark every row of one node deleted and update the version/proxy
    /// indices it belongs to
    async fn delete_node_rows(&mut self, id: &NodeId) -> StorageResult<()> {
        let Some(data) = self.context.hierarchy(id).await? else {
            return Ok(());
        };
        if data.get_bool(columns::IS_VERSION) {
            let version = self.context.get_row_or_empty(VERSIONS_TABLE, id).await?;
            if let Some(series) = version.get_id(columns::VERSIONABLE_ID) {
                self.context
                    .record_removed(SelectionKind::SeriesVersions, &series, id);
            }
            self.context.delete_row(VERSIONS_TABLE, id).await?;
        }
        if data.get_bool(columns::IS_PROXY) {
            let proxy = self.context.get_row_or_empty(PROXIES_TABLE, id).await?;
            if let Some(series) = proxy.get_id(columns::VERSIONABLE_ID) {
                self.context
                    .record_removed(SelectionKind::SeriesProxies, &series, id);
            }
            if let Some(target) = proxy.get_id(columns::TARGET_ID) {
                self.context
                    .record_removed(SelectionKind::TargetProxies, &target, id);
            }
            self.context.delete_row(PROXIES_TABLE, id).await?;
        }
        // rows of an unsaved node exist only if this session created them
        let unsaved = self.context.is_unsaved(HIERARCHY_TABLE, id);
        let tables = self
            .context
            .model()
            .fragments_for_instance(&primary_type_of(&data), &mixins_of(&data));
        for table in tables.iter().filter(|t| t.as_str() != HIERARCHY_TABLE) {
            if unsaved && !self.context.is_unsaved(table, id) {
                continue;
            }
            self.context.delete_row(table, id).await?;
        }
        // hierarchy last so parent lookups above still resolve
        self.context.delete_row(HIERARCHY_TABLE, id).await
    }

    /// Remove a node and its whole subtree
    ///
    /// With proxies enabled, proxies of a removed live document's series
    /// and proxies targeting a removed version go too. With soft delete the
    /// subtree is only tombstoned until `cleanup_deleted_documents`.
    pub async fn remove_node(&mut self, node: &Node) -> StorageResult<()> {
        self.check_open()?;
        let data = self.hierarchy_of(&node.id).await?;
        let parent = data.get_id(columns::PARENT_ID);
        if parent.is_none() && !data.get_bool(columns::IS_VERSION) {
            return Err(StorageError::illegal_argument("cannot remove the root"));
        }
        let complex = data.get_bool(columns::IS_COMPLEX);
        let subtree = self.collect_subtree(&node.id).await?;
        let inner = self.inner();

        if inner.config.soft_delete {
            let values = BTreeMap::from([
                (columns::IS_DELETED.to_string(), json!(true)),
                (columns::DELETED_TIME.to_string(), json!(now())),
            ]);
            for id in &subtree {
                self.context
                    .set_columns(HIERARCHY_TABLE, id, values.clone())
                    .await?;
            }
        } else {
            let mut doomed: Vec<NodeId> = subtree.clone();
            if inner.config.proxies_enabled {
                for id in &subtree {
                    let data = self.hierarchy_of(id).await?;
                    if data.get_bool(columns::IS_COMPLEX) || data.get_bool(columns::IS_PROXY) {
                        continue;
                    }
                    let kind = if data.get_bool(columns::IS_VERSION) {
                        SelectionKind::TargetProxies
                    } else {
                        SelectionKind::SeriesProxies
                    };
                    doomed.extend(self.context.get_selection(kind, id).await?);
                }
            }
            let members: HashSet<NodeId> = doomed.iter().cloned().collect();
            let mut done = HashSet::new();
            for id in &doomed {
                if !done.insert(id.clone()) {
                    continue;
                }
                if let Some(data) = self.context.hierarchy(id).await? {
                    if let Some(p) = data.get_id(columns::PARENT_ID) {
                        if !members.contains(&p) {
                            let kind = SelectionKind::children(data.get_bool(columns::IS_COMPLEX));
                            self.context.record_removed(kind, &p, id);
                        }
                    }
                }
                self.delete_node_rows(id).await?;
            }
        }
        if let Some(parent) = parent {
            self.context
                .record_removed(SelectionKind::children(complex), &parent, &node.id);
        }
        inner.lock_manager.remove_lock(&node.id, None, true).await?;
        tracing::debug!("{} removed {} ({} nodes)", self.id, node.id, subtree.len());
        Ok(())
    }

    /// Reorder `source` just before `dest` (or last) among the children of
    /// an orderable parent
    pub async fn order_before(
        &mut self,
        parent: &Node,
        source: &Node,
        dest: Option<&Node>,
    ) -> StorageResult<()> {
        self.check_open()?;
        let data = self.hierarchy_of(&parent.id).await?;
        if !self.is_orderable(&data) {
            return Err(StorageError::invalid_state(format!(
                "{} does not have orderable children",
                parent.id
            )));
        }
        self.context
            .order_before(&parent.id, &source.id, dest.map(|d| &d.id))
            .await
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    /// Node whose content answers property reads: the target for proxies
    async fn content_node(&mut self, id: &NodeId) -> StorageResult<(NodeId, RowData)> {
        let data = self.hierarchy_of(id).await?;
        if !data.get_bool(columns::IS_PROXY) {
            return Ok((id.clone(), data));
        }
        let proxy = self.context.get_row_or_empty(PROXIES_TABLE, id).await?;
        let target = proxy
            .get_id(columns::TARGET_ID)
            .ok_or_else(|| StorageError::invalid_state(format!("proxy {} has no target", id)))?;
        let target_data = self.hierarchy_of(&target).await?;
        Ok((target, target_data))
    }

    fn check_field(&self, data: &RowData, key: &str) -> StorageResult<PropertyInfo> {
        let type_name = primary_type_of(data);
        let model = self.context.model();
        match model.property_info(key) {
            Some(info) if model.is_valid_field_for(&type_name, &mixins_of(data), key) => {
                Ok(info.clone())
            }
            _ => Err(StorageError::illegal_property(key, type_name)),
        }
    }

    /// Property value; collection properties are returned as arrays
    pub async fn get_property(&mut self, node: &Node, key: &str) -> StorageResult<Value> {
        self.check_open()?;
        let (id, data) = self.content_node(&node.id).await?;
        let info = self.check_field(&data, key)?;
        let row = self.context.get_row_or_empty(&info.table, &id).await?;
        Ok(if info.collection {
            Value::Array(row.values().to_vec())
        } else {
            row.get(&info.column).clone()
        })
    }

    pub async fn get_string(&mut self, node: &Node, key: &str) -> StorageResult<Option<String>> {
        Ok(self
            .get_property(node, key)
            .await?
            .as_str()
            .map(String::from))
    }

    fn check_writable(data: &RowData, id: &NodeId) -> StorageResult<()> {
        if data.get_bool(columns::IS_PROXY) {
            return Err(StorageError::invalid_state(format!("proxy {} is read-only", id)));
        }
        if data.get_bool(columns::IS_VERSION) {
            return Err(StorageError::invalid_state(format!("version {} is read-only", id)));
        }
        Ok(())
    }

    /// Set a property; `null` clears a simple property or empties a
    /// collection
    pub async fn set_property(&mut self, node: &Node, key: &str, value: Value) -> StorageResult<()> {
        self.check_open()?;
        let data = self.hierarchy_of(&node.id).await?;
        Self::check_writable(&data, &node.id)?;
        let info = self.check_field(&data, key)?;
        let type_error = || {
            StorageError::illegal_argument(format!(
                "value for '{}' is not a {:?}",
                key, info.field_type
            ))
        };
        if info.collection {
            let items = match value {
                Value::Null => Vec::new(),
                Value::Array(items) => items,
                _ => return Err(type_error()),
            };
            if items.iter().any(|v| v.is_null() || !info.field_type.accepts(v)) {
                return Err(type_error());
            }
            self.context
                .replace_row(&info.table, &node.id, RowData::Collection(items))
                .await
        } else {
            if !info.field_type.accepts(&value) {
                return Err(type_error());
            }
            self.context
                .set_column(&info.table, &node.id, &info.column, value)
                .await
        }
    }

    pub async fn get_acl(&mut self, node: &Node) -> StorageResult<Vec<AclEntry>> {
        self.check_open()?;
        self.hierarchy_of(&node.id).await?;
        let row = self.context.get_row_or_empty(ACLS_TABLE, &node.id).await?;
        row.values()
            .iter()
            .map(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| StorageError::from(StoreError::from(e)))
            })
            .collect()
    }

    /// Replace the node's ACL; call `update_read_acls` to make it visible
    /// to filtered queries
    pub async fn set_acl(&mut self, node: &Node, entries: &[AclEntry]) -> StorageResult<()> {
        self.check_open()?;
        self.hierarchy_of(&node.id).await?;
        let values = entries
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        self.context
            .replace_row(ACLS_TABLE, &node.id, RowData::Collection(values))
            .await
    }

    // ------------------------------------------------------------------
    // Mixins
    // ------------------------------------------------------------------

    pub async fn has_mixin(&mut self, node: &Node, mixin: &str) -> StorageResult<bool> {
        self.check_open()?;
        let data = self.hierarchy_of(&node.id).await?;
        Ok(self.context.model().has_facet(&primary_type_of(&data), mixin)
            || mixins_of(&data).iter().any(|m| m == mixin))
    }

    /// Add an instance facet; `false` when the node already has it
    pub async fn add_mixin(&mut self, node: &Node, mixin: &str) -> StorageResult<bool> {
        self.check_open()?;
        if !self.context.model().is_valid_facet(mixin) {
            return Err(StorageError::illegal_argument(format!("unknown facet '{}'", mixin)));
        }
        let data = self.hierarchy_of(&node.id).await?;
        Self::check_writable(&data, &node.id)?;
        if self.has_mixin(node, mixin).await? {
            return Ok(false);
        }
        let mut mixins = mixins_of(&data);
        mixins.push(mixin.to_string());
        self.context
            .set_column(HIERARCHY_TABLE, &node.id, columns::MIXIN_TYPES, json!(mixins))
            .await?;
        Ok(true)
    }

    /// Remove an instance facet and the fragments only it made legal
    pub async fn remove_mixin(&mut self, node: &Node, mixin: &str) -> StorageResult<bool> {
        self.check_open()?;
        let data = self.hierarchy_of(&node.id).await?;
        Self::check_writable(&data, &node.id)?;
        let before = mixins_of(&data);
        if !before.iter().any(|m| m == mixin) {
            return Ok(false);
        }
        let after: Vec<String> = before.iter().filter(|m| *m != mixin).cloned().collect();
        let type_name = primary_type_of(&data);
        let model = self.context.model();
        let old_tables = model.content_fragments(&type_name, &before);
        let new_tables = model.content_fragments(&type_name, &after);
        for table in old_tables.difference(&new_tables) {
            self.context.delete_row(table, &node.id).await?;
        }
        self.context
            .set_column(HIERARCHY_TABLE, &node.id, columns::MIXIN_TYPES, json!(after))
            .await?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Versioning
    // ------------------------------------------------------------------

    /// Snapshot a live document into a new version
    ///
    /// The label defaults to the next ordinal of the series.
    pub async fn check_in(
        &mut self,
        node: &Node,
        label: Option<&str>,
        description: Option<&str>,
    ) -> StorageResult<Node> {
        self.check_open()?;
        let data = self.hierarchy_of(&node.id).await?;
        if data.get_bool(columns::IS_VERSION)
            || data.get_bool(columns::IS_PROXY)
            || data.get_bool(columns::IS_COMPLEX)
            || data.get_str(columns::PARENT_ID).is_none()
        {
            return Err(StorageError::invalid_state(format!("{} is not versionable", node.id)));
        }
        if data.get_bool(columns::IS_CHECKED_IN) {
            return Err(StorageError::invalid_state(format!("{} is already checked in", node.id)));
        }
        let series = node.id.clone();
        let previous = self
            .context
            .get_selection(SelectionKind::SeriesVersions, &series)
            .await?;
        let label = match label {
            Some(label) => label.to_string(),
            None => (previous.len() + 1).to_string(),
        };
        let version_id = self.new_id().await?;

        let mut values = match &data {
            RowData::Simple(map) => map.clone(),
            RowData::Collection(_) => BTreeMap::new(),
        };
        values.insert(columns::PARENT_ID.to_string(), Value::Null);
        values.insert(columns::POS.to_string(), Value::Null);
        values.insert(columns::IS_VERSION.to_string(), json!(true));
        values.remove(columns::IS_CHECKED_IN);
        values.remove(columns::BASE_VERSION_ID);
        self.context
            .create_row(HIERARCHY_TABLE, &version_id, RowData::Simple(values))
            .await?;

        let tables = self
            .context
            .model()
            .fragments_for_instance(&primary_type_of(&data), &mixins_of(&data));
        for table in tables {
            if table == HIERARCHY_TABLE || table == READ_ACLS_TABLE {
                continue;
            }
            if let Some(row) = self.context.get_row(&table, &node.id).await? {
                self.context.create_row(&table, &version_id, row).await?;
            }
        }

        for id in &previous {
            let version = self.context.get_row_or_empty(VERSIONS_TABLE, id).await?;
            if version.get_bool(columns::IS_LATEST) {
                self.context
                    .set_column(VERSIONS_TABLE, id, columns::IS_LATEST, json!(false))
                    .await?;
            }
        }
        let version_values = BTreeMap::from([
            (columns::VERSIONABLE_ID.to_string(), json!(series)),
            (columns::LABEL.to_string(), json!(label)),
            (columns::DESCRIPTION.to_string(), json!(description)),
            (columns::CREATED.to_string(), json!(now())),
            (columns::IS_LATEST.to_string(), json!(true)),
        ]);
        self.context
            .create_row(VERSIONS_TABLE, &version_id, RowData::Simple(version_values))
            .await?;
        self.context
            .record_created(SelectionKind::SeriesVersions, &series, &version_id);

        for (child, pos) in self.context.get_ordered_children(&node.id, true).await? {
            let name = self
                .hierarchy_of(&child)
                .await?
                .get_str(columns::NAME)
                .unwrap_or_default()
                .to_string();
            self.copy_subtree(&child, &version_id, &name, pos).await?;
        }

        let live = BTreeMap::from([
            (columns::IS_CHECKED_IN.to_string(), json!(true)),
            (columns::BASE_VERSION_ID.to_string(), json!(version_id)),
        ]);
        self.context.set_columns(HIERARCHY_TABLE, &node.id, live).await?;
        tracing::debug!("{} checked in {} as {} '{}'", self.id, node.id, version_id, label);
        self.node(&version_id).await
    }

    pub async fn check_out(&mut self, node: &Node) -> StorageResult<()> {
        self.check_open()?;
        let data = self.hierarchy_of(&node.id).await?;
        Self::check_writable(&data, &node.id)?;
        if !data.get_bool(columns::IS_CHECKED_IN) {
            return Err(StorageError::invalid_state(format!("{} is already checked out", node.id)));
        }
        self.context
            .set_column(HIERARCHY_TABLE, &node.id, columns::IS_CHECKED_IN, json!(false))
            .await
    }

    /// Overwrite a live document with a version of its series
    ///
    /// Content fragments (explicit nulls included), complex children and
    /// instance facets are taken from the version; the document ends up
    /// checked in on that version.
    pub async fn restore(&mut self, node: &Node, version: &Node) -> StorageResult<Node> {
        self.check_open()?;
        let data = self.hierarchy_of(&node.id).await?;
        Self::check_writable(&data, &node.id)?;
        let version_data = self.hierarchy_of(&version.id).await?;
        if !version_data.get_bool(columns::IS_VERSION) {
            return Err(StorageError::illegal_argument(format!("{} is not a version", version.id)));
        }
        let series = self
            .context
            .get_row_or_empty(VERSIONS_TABLE, &version.id)
            .await?
            .get_id(columns::VERSIONABLE_ID);
        if series.as_ref() != Some(&node.id) {
            return Err(StorageError::illegal_argument(format!(
                "{} is not a version of {}",
                version.id, node.id
            )));
        }

        let model = self.context.model();
        let version_mixins = mixins_of(&version_data);
        let mut tables: BTreeSet<String> =
            model.content_fragments(&primary_type_of(&data), &mixins_of(&data));
        tables.extend(model.content_fragments(&primary_type_of(&version_data), &version_mixins));
        for table in tables {
            match self.context.get_row(&table, &version.id).await? {
                Some(row) => self.context.replace_row(&table, &node.id, row).await?,
                None => {
                    if self.context.get_row(&table, &node.id).await?.is_some() {
                        let empty = self.empty_data(&table);
                        self.context.replace_row(&table, &node.id, empty).await?;
                    }
                }
            }
        }

        for (child, _) in self.context.get_ordered_children(&node.id, true).await? {
            for id in self.collect_subtree(&child).await? {
                self.delete_node_rows(&id).await?;
            }
            self.context
                .record_removed(SelectionKind::ComplexChildren, &node.id, &child);
        }
        for (child, pos) in self.context.get_ordered_children(&version.id, true).await? {
            let name = self
                .hierarchy_of(&child)
                .await?
                .get_str(columns::NAME)
                .unwrap_or_default()
                .to_string();
            self.copy_subtree(&child, &node.id, &name, pos).await?;
        }

        let live = BTreeMap::from([
            (columns::MIXIN_TYPES.to_string(), json!(version_mixins)),
            (columns::IS_CHECKED_IN.to_string(), json!(true)),
            (columns::BASE_VERSION_ID.to_string(), json!(version.id)),
        ]);
        self.context.set_columns(HIERARCHY_TABLE, &node.id, live).await?;
        tracing::debug!("{} restored {} to {}", self.id, node.id, version.id);
        self.node(&node.id).await
    }

    pub async fn restore_by_label(&mut self, node: &Node, label: &str) -> StorageResult<Node> {
        let version = self
            .get_version_by_label(&node.id, label)
            .await?
            .ok_or_else(|| {
                StorageError::illegal_argument(format!("no version '{}' for {}", label, node.id))
            })?;
        self.restore(node, &version).await
    }

    /// Versions of a series, oldest first
    pub async fn get_versions(&mut self, series: &NodeId) -> StorageResult<Vec<Node>> {
        self.check_open()?;
        let ids = self
            .context
            .get_selection(SelectionKind::SeriesVersions, series)
            .await?;
        let mut keyed = Vec::with_capacity(ids.len());
        for id in ids {
            let created = self
                .context
                .get_row_or_empty(VERSIONS_TABLE, &id)
                .await?
                .get_str(columns::CREATED)
                .unwrap_or_default()
                .to_string();
            keyed.push((created, id));
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        let ids: Vec<NodeId> = keyed.into_iter().map(|(_, id)| id).collect();
        Ok(self.context.get_multi(&ids).await?.into_iter().flatten().collect())
    }

    pub async fn get_last_version(&mut self, series: &NodeId) -> StorageResult<Option<Node>> {
        let versions = self.get_versions(series).await?;
        for version in versions.iter().rev() {
            let row = self.context.get_row_or_empty(VERSIONS_TABLE, &version.id).await?;
            if row.get_bool(columns::IS_LATEST) {
                return Ok(Some(version.clone()));
            }
        }
        Ok(versions.last().cloned())
    }

    pub async fn get_version_by_label(
        &mut self,
        series: &NodeId,
        label: &str,
    ) -> StorageResult<Option<Node>> {
        for version in self.get_versions(series).await? {
            let row = self.context.get_row_or_empty(VERSIONS_TABLE, &version.id).await?;
            if row.get_str(columns::LABEL) == Some(label) {
                return Ok(Some(version));
            }
        }
        Ok(None)
    }

    /// Label and description of a version
    pub async fn get_version_info(
        &mut self,
        version: &Node,
    ) -> StorageResult<(Option<String>, Option<String>)> {
        self.check_open()?;
        let row = self.context.get_row_or_empty(VERSIONS_TABLE, &version.id).await?;
        Ok((
            row.get_str(columns::LABEL).map(String::from),
            row.get_str(columns::DESCRIPTION).map(String::from),
        ))
    }

    // ------------------------------------------------------------------
    // Proxies
    // ------------------------------------------------------------------

    /// Series a node belongs to, from the node's role
    async fn series_of(&mut self, id: &NodeId, data: &RowData) -> StorageResult<Option<NodeId>> {
        Ok(if data.get_bool(columns::IS_VERSION) {
            self.context
                .get_row_or_empty(VERSIONS_TABLE, id)
                .await?
                .get_id(columns::VERSIONABLE_ID)
        } else if data.get_bool(columns::IS_PROXY) {
            self.context
                .get_row_or_empty(PROXIES_TABLE, id)
                .await?
                .get_id(columns::VERSIONABLE_ID)
        } else {
            Some(id.clone())
        })
    }

    pub async fn add_proxy(
        &mut self,
        target_id: &NodeId,
        series_id: &NodeId,
        parent: &Node,
        name: &str,
        pos: Option<i64>,
    ) -> StorageResult<Node> {
        self.check_open()?;
        if !self.inner().config.proxies_enabled {
            return Err(StorageError::ProxiesDisabled);
        }
        check_name(name)?;
        let target = self.hierarchy_of(target_id).await?;
        let parent_data = self.hierarchy_of(&parent.id).await?;
        let pos = match pos {
            Some(pos) => Some(pos),
            None if self.is_orderable(&parent_data) => {
                Some(self.context.get_next_pos(&parent.id, false).await?)
            }
            None => None,
        };
        let id = self.new_id().await?;
        let mut values =
            Self::hierarchy_values(&parent.id, name, pos, &primary_type_of(&target), false);
        values.insert(columns::MIXIN_TYPES.to_string(), json!(mixins_of(&target)));
        values.insert(columns::IS_PROXY.to_string(), json!(true));
        self.context
            .create_row(HIERARCHY_TABLE, &id, RowData::Simple(values))
            .await?;
        let proxy = BTreeMap::from([
            (columns::TARGET_ID.to_string(), json!(target_id)),
            (columns::VERSIONABLE_ID.to_string(), json!(series_id)),
        ]);
        self.context
            .create_row(PROXIES_TABLE, &id, RowData::Simple(proxy))
            .await?;
        self.context
            .record_created(SelectionKind::Children, &parent.id, &id);
        self.context
            .record_created(SelectionKind::SeriesProxies, series_id, &id);
        self.context
            .record_created(SelectionKind::TargetProxies, target_id, &id);
        self.node(&id).await
    }

    /// Point a proxy at another member of its series
    pub async fn set_proxy_target(&mut self, proxy: &Node, target_id: &NodeId) -> StorageResult<()> {
        self.check_open()?;
        if !self.inner().config.proxies_enabled {
            return Err(StorageError::ProxiesDisabled);
        }
        let data = self.hierarchy_of(&proxy.id).await?;
        if !data.get_bool(columns::IS_PROXY) {
            return Err(StorageError::illegal_argument(format!("{} is not a proxy", proxy.id)));
        }
        let row = self.context.get_row_or_empty(PROXIES_TABLE, &proxy.id).await?;
        let series = row.get_id(columns::VERSIONABLE_ID);
        let old_target = row.get_id(columns::TARGET_ID);
        let target = self.hierarchy_of(target_id).await?;
        if self.series_of(target_id, &target).await? != series {
            return Err(StorageError::illegal_argument(format!(
                "{} is not in the series of proxy {}",
                target_id, proxy.id
            )));
        }
        self.context
            .set_column(PROXIES_TABLE, &proxy.id, columns::TARGET_ID, json!(target_id))
            .await?;
        if let Some(old) = old_target {
            self.context
                .record_removed(SelectionKind::TargetProxies, &old, &proxy.id);
        }
        self.context
            .record_created(SelectionKind::TargetProxies, target_id, &proxy.id);
        Ok(())
    }

    /// Proxies related to a node: by target for a version, by series for a
    /// live document or a proxy; optionally restricted to one parent
    pub async fn get_proxies(&mut self, node: &Node, parent: Option<&Node>) -> StorageResult<Vec<Node>> {
        self.check_open()?;
        if !self.inner().config.proxies_enabled {
            return Ok(Vec::new());
        }
        let data = self.hierarchy_of(&node.id).await?;
        let (kind, key) = if data.get_bool(columns::IS_VERSION) {
            (SelectionKind::TargetProxies, Some(node.id.clone()))
        } else {
            (SelectionKind::SeriesProxies, self.series_of(&node.id, &data).await?)
        };
        let Some(key) = key else {
            return Ok(Vec::new());
        };
        let ids = self.context.get_selection(kind, &key).await?;
        Ok(self
            .context
            .get_multi(&ids)
            .await?
            .into_iter()
            .flatten()
            .filter(|proxy| parent.map_or(true, |p| proxy.parent_id.as_ref() == Some(&p.id)))
            .collect())
    }

    // ------------------------------------------------------------------
    // Security
    // ------------------------------------------------------------------

    /// Recompute the flattened read ACL of every document in the tree
    ///
    /// Flushes pending changes first and again afterwards. Returns the
    /// number of documents whose read ACL changed.
    pub async fn update_read_acls(&mut self) -> StorageResult<usize> {
        self.check_open()?;
        self.save().await?;
        let root = self.repository.root_id().clone();
        let mut stack: Vec<(NodeId, Vec<String>)> = vec![(root, Vec::new())];
        let mut changed = 0;
        while let Some((id, inherited)) = stack.pop() {
            let acl = self.context.get_row_or_empty(ACLS_TABLE, &id).await?;
            let mut principals = BTreeSet::new();
            let mut inherit = true;
            for value in acl.values() {
                let Ok(entry) = serde_json::from_value::<AclEntry>(value.clone()) else {
                    tracing::warn!("ignoring malformed ACL entry on {}", id);
                    continue;
                };
                if entry.grants_read() {
                    principals.insert(entry.user.clone());
                }
                if entry.blocks_inheritance() {
                    inherit = false;
                    break;
                }
            }
            if inherit {
                principals.extend(inherited);
            }
            let principals: Vec<String> = principals.into_iter().collect();
            let values: Vec<Value> = principals.iter().map(|p| json!(p)).collect();
            let current = self.context.get_row(READ_ACLS_TABLE, &id).await?;
            if current.as_ref().map(|r| r.values()) != Some(values.as_slice()) {
                self.context
                    .replace_row(READ_ACLS_TABLE, &id, RowData::Collection(values))
                    .await?;
                changed += 1;
            }
            for child in self
                .context
                .get_selection(SelectionKind::Children, &id)
                .await?
            {
                stack.push((child, principals.clone()));
            }
        }
        self.save().await?;
        tracing::debug!("{} updated {} read ACLs", self.id, changed);
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    pub async fn get_lock(&self, id: &NodeId) -> StorageResult<Option<Lock>> {
        self.check_open()?;
        self.repository.lock_manager().get_lock(id).await
    }

    /// `None` when acquired, the current lock otherwise
    pub async fn set_lock(&self, id: &NodeId, lock: Lock) -> StorageResult<Option<Lock>> {
        self.check_open()?;
        self.repository.lock_manager().set_lock(id, lock).await
    }

    pub async fn remove_lock(
        &self,
        id: &NodeId,
        owner: Option<&str>,
        force: bool,
    ) -> StorageResult<Option<Lock>> {
        self.check_open()?;
        self.repository
            .lock_manager()
            .remove_lock(id, owner, force)
            .await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Run a structured query against saved state
    pub async fn query(
        &self,
        query: &Query,
        filter: &QueryFilter,
        count_total: bool,
    ) -> StorageResult<PartialList> {
        self.check_open()?;
        let engine = QueryEngine::load(self.context.mapper(), self.context.model()).await?;
        engine.query(query, filter, count_total).await
    }

    pub async fn query_and_fetch(
        &self,
        query: &Query,
        filter: &QueryFilter,
        keys: &[&str],
    ) -> StorageResult<QueryResultIter> {
        self.check_open()?;
        let engine = QueryEngine::load(self.context.mapper(), self.context.model()).await?;
        engine.query_and_fetch(query, filter, keys).await
    }

    // ------------------------------------------------------------------
    // Binaries
    // ------------------------------------------------------------------

    /// Store binary content, returning the digest to put in a binary field
    pub async fn put_binary(&self, bytes: &[u8]) -> StorageResult<String> {
        self.check_open()?;
        let manager = self
            .repository
            .binary_manager()
            .ok_or(StorageError::BinariesDisabled)?;
        manager.put(bytes).await
    }

    pub async fn get_binary(&self, digest: &str) -> StorageResult<Option<Vec<u8>>> {
        self.check_open()?;
        let manager = self
            .repository
            .binary_manager()
            .ok_or(StorageError::BinariesDisabled)?;
        manager.get(digest).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if self.transaction.is_some() {
            // the store connection rolls back when it is dropped with us
            tracing::warn!("{} dropped inside a transaction", self.id);
        }
        self.repository.inner().propagator.remove_queue(self.id);
    }
}
