//! Repository
//!
//! Owns everything sessions share: the model, the row store and its
//! connection pool, the invalidation propagator, the optional cluster node,
//! the lock manager and the binary manager.
//!
//! # Lifecycle
//!
//! 1. `open()` validates the configuration, creates the root document on
//!    first use and records its id in the store
//! 2. `get_session()` hands out sessions, bounded by the pool size
//! 3. `close()` unregisters the cluster node; open sessions stay usable
//!    until dropped

use crate::db::{RowMapper, RowStore};
use crate::models::{AclEntry, Invalidations, NodeId, Row, RowData, EVERYTHING, READ};
use crate::schema::{columns, Model, ACLS_TABLE, HIERARCHY_TABLE, ROOT_TYPE};
use crate::services::binary::{BinaryGarbageCollector, BinaryManager};
use crate::services::cluster::ClusterNode;
use crate::services::config::{IdStrategy, RepositoryConfig};
use crate::services::error::{StorageError, StorageResult};
use crate::services::invalidation::{InvalidationPropagator, SessionId};
use crate::services::lock_manager::LockManager;
use crate::services::session::Session;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Ids reserved from the store sequence per round trip
const ID_BLOCK_SIZE: u64 = 100;

#[derive(Debug, Default)]
struct IdBlock {
    next: u64,
    end: u64,
}

/// Allocates node ids according to the configured strategy
///
/// Sequence blocks are reserved through a dedicated autocommit connection,
/// so a rolled back session transaction never returns a reserved range to
/// the store.
pub(crate) struct IdGenerator {
    strategy: IdStrategy,
    sequence: Option<tokio::sync::Mutex<(Box<dyn RowMapper>, IdBlock)>>,
}

impl IdGenerator {
    async fn open(strategy: IdStrategy, store: &dyn RowStore) -> StorageResult<Self> {
        let sequence = match strategy {
            IdStrategy::Uuid => None,
            IdStrategy::Sequence => {
                let mapper = store.connect().await?;
                Some(tokio::sync::Mutex::new((mapper, IdBlock::default())))
            }
        };
        Ok(Self { strategy, sequence })
    }

    pub async fn next_id(&self) -> StorageResult<NodeId> {
        match (&self.strategy, &self.sequence) {
            (IdStrategy::Sequence, Some(sequence)) => {
                let mut guard = sequence.lock().await;
                let (mapper, block) = &mut *guard;
                if block.next >= block.end {
                    let first = mapper.reserve_ids(ID_BLOCK_SIZE).await?;
                    block.next = first;
                    block.end = first + ID_BLOCK_SIZE;
                }
                let id = block.next;
                block.next += 1;
                Ok(NodeId::new(id.to_string()))
            }
            _ => Ok(NodeId::new(uuid::Uuid::new_v4().to_string())),
        }
    }
}

pub(crate) struct RepositoryInner {
    pub config: RepositoryConfig,
    pub model: Arc<Model>,
    pub store: Arc<dyn RowStore>,
    pub pool: Arc<Semaphore>,
    pub propagator: InvalidationPropagator,
    pub cluster: Option<ClusterNode>,
    pub lock_manager: LockManager,
    pub binaries: Option<Arc<BinaryManager>>,
    pub root_id: NodeId,
    pub ids: IdGenerator,
    next_session: AtomicU64,
    closed: AtomicBool,
}

impl RepositoryInner {
    /// Publish a saved batch to local sessions and, when clustered, to the
    /// other nodes
    pub async fn publish(&self, from: Option<SessionId>, batch: &Invalidations) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.propagator.publish(from, batch);
        if let Some(cluster) = &self.cluster {
            cluster.send(batch).await?;
        }
        Ok(())
    }

    /// Pull cluster batches into the local queues
    pub async fn receive_cluster_invalidations(&self) -> StorageResult<()> {
        if let Some(cluster) = &self.cluster {
            let batch = cluster.receive().await?;
            self.propagator.publish(None, &batch);
        }
        Ok(())
    }
}

/// Handle to an open repository; cheap to clone
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepositoryInner>,
}

impl Repository {
    pub async fn open(
        config: RepositoryConfig,
        model: Arc<Model>,
        store: Arc<dyn RowStore>,
    ) -> StorageResult<Self> {
        config.validate()?;
        tracing::info!(
            "opening repository '{}' on {} store",
            config.name,
            store.name()
        );

        let ids = IdGenerator::open(config.id_strategy, store.as_ref()).await?;
        let mapper = store.connect().await?;
        let root_id = match mapper.get_root_id(&config.name).await? {
            Some(id) => id,
            None => Self::create_root(&config, mapper.as_ref(), &ids).await?,
        };

        let cluster = match &config.clustering {
            Some(cluster_config) => Some(ClusterNode::open(store.as_ref(), cluster_config).await?),
            None => None,
        };
        let lock_cache = if config.is_clustered() {
            None
        } else {
            Some(config.lock_capacity())
        };
        let lock_manager = LockManager::open(store.as_ref(), lock_cache).await?;
        let binaries = match &config.binaries_path {
            Some(path) => Some(Arc::new(BinaryManager::open(path.clone()).await?)),
            None => None,
        };

        let pool = Arc::new(Semaphore::new(config.pool.max_sessions));
        Ok(Self {
            inner: Arc::new(RepositoryInner {
                config,
                model,
                store,
                pool,
                propagator: InvalidationPropagator::new(),
                cluster,
                lock_manager,
                binaries,
                root_id,
                ids,
                next_session: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        })
    }

    async fn create_root(
        config: &RepositoryConfig,
        mapper: &dyn RowMapper,
        ids: &IdGenerator,
    ) -> StorageResult<NodeId> {
        let root_id = ids.next_id().await?;
        let mut hierarchy = BTreeMap::new();
        hierarchy.insert(columns::PARENT_ID.to_string(), Value::Null);
        hierarchy.insert(columns::NAME.to_string(), json!(""));
        hierarchy.insert(columns::PRIMARY_TYPE.to_string(), json!(ROOT_TYPE));
        hierarchy.insert(columns::IS_COMPLEX.to_string(), json!(false));
        let acl = vec![
            serde_json::to_value(AclEntry::grant("administrators", EVERYTHING))
                .map_err(crate::db::StoreError::from)?,
            serde_json::to_value(AclEntry::grant("members", READ))
                .map_err(crate::db::StoreError::from)?,
        ];

        mapper.begin().await?;
        let result = async {
            mapper
                .insert(
                    HIERARCHY_TABLE,
                    &[Row::new(HIERARCHY_TABLE, root_id.clone(), RowData::Simple(hierarchy))],
                )
                .await?;
            mapper
                .insert(
                    ACLS_TABLE,
                    &[Row::new(ACLS_TABLE, root_id.clone(), RowData::Collection(acl))],
                )
                .await?;
            mapper.set_root_id(&config.name, &root_id).await
        }
        .await;
        match result {
            Ok(()) => mapper.commit().await?,
            Err(e) => {
                mapper.rollback().await?;
                return Err(e.into());
            }
        }
        tracing::info!("created root {} for repository '{}'", root_id, config.name);
        Ok(root_id)
    }

    pub(crate) fn inner(&self) -> &Arc<RepositoryInner> {
        &self.inner
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.inner.config
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.inner.model
    }

    pub fn root_id(&self) -> &NodeId {
        &self.inner.root_id
    }

    /// Open a session, waiting up to the pool blocking timeout for a free
    /// connection
    pub async fn get_session(&self) -> StorageResult<Session> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StorageError::invalid_state("repository is closed"));
        }
        let timeout_ms = self.inner.config.pool.blocking_timeout_ms;
        let permit = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            Arc::clone(&self.inner.pool).acquire_owned(),
        )
        .await
        .map_err(|_| StorageError::PoolTimeout { timeout_ms })?
        .map_err(|_| StorageError::invalid_state("connection pool closed"))?;

        let mapper = self.inner.store.connect().await?;
        let id = SessionId(self.inner.next_session.fetch_add(1, Ordering::SeqCst));
        self.inner.propagator.add_queue(id);
        tracing::debug!("opened {} on repository '{}'", id, self.name());
        Ok(Session::new(id, self.clone(), mapper, permit))
    }

    /// Sessions currently holding a pooled connection
    pub fn active_connection_count(&self) -> usize {
        self.inner.config.pool.max_sessions - self.inner.pool.available_permits()
    }

    pub fn propagator(&self) -> &InvalidationPropagator {
        &self.inner.propagator
    }

    /// Cluster node, `None` for an unclustered repository
    pub fn cluster_node(&self) -> Option<&ClusterNode> {
        self.inner.cluster.as_ref()
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.inner.lock_manager
    }

    pub fn binary_manager(&self) -> Option<&Arc<BinaryManager>> {
        self.inner.binaries.as_ref()
    }

    pub fn binary_garbage_collector(&self) -> StorageResult<BinaryGarbageCollector> {
        let manager = self.inner.binaries.as_ref().ok_or(StorageError::BinariesDisabled)?;
        Ok(BinaryGarbageCollector::new(Arc::clone(manager)))
    }

    /// Mark every binary referenced by a stored document, soft-deleted
    /// documents included
    pub async fn mark_referenced_binaries(&self, gc: &BinaryGarbageCollector) -> StorageResult<usize> {
        let mapper = self.inner.store.connect().await?;
        let mut marked = HashSet::new();
        for (table, column) in self.inner.model.binary_columns() {
            for row in mapper.scan(&table).await? {
                let values: Vec<Value> = match &column {
                    Some(column) => vec![row.data.get(column).clone()],
                    None => row.data.values().to_vec(),
                };
                for value in values {
                    if let Value::String(digest) = value {
                        if marked.insert(digest.clone()) {
                            gc.mark(&digest);
                        }
                    }
                }
            }
        }
        tracing::info!("marked {} referenced binaries", marked.len());
        Ok(marked.len())
    }

    /// Hard-delete soft-deleted documents
    ///
    /// `max` bounds the number of documents removed (0 = unlimited);
    /// `before` keeps documents deleted after that instant. Returns the
    /// number of documents removed.
    pub async fn cleanup_deleted_documents(
        &self,
        max: usize,
        before: Option<DateTime<Utc>>,
    ) -> StorageResult<usize> {
        let mapper = self.inner.store.connect().await?;
        let mut ids: Vec<NodeId> = mapper
            .scan(HIERARCHY_TABLE)
            .await?
            .into_iter()
            .filter(|row| row.data.get_bool(columns::IS_DELETED))
            .filter(|row| match before {
                None => true,
                Some(cutoff) => row
                    .data
                    .get_str(columns::DELETED_TIME)
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map_or(true, |t| t.with_timezone(&Utc) < cutoff),
            })
            .map(|row| row.id)
            .collect();
        if max > 0 {
            ids.truncate(max);
        }
        if ids.is_empty() {
            return Ok(0);
        }

        let mut batch = Invalidations::new();
        mapper.begin().await?;
        let result = async {
            for table in self.inner.model.all_tables() {
                mapper.delete(&table, &ids).await?;
                for id in &ids {
                    batch.add_deleted(&table, id);
                }
            }
            Ok::<_, StorageError>(())
        }
        .await;
        match result {
            Ok(()) => mapper.commit().await?,
            Err(e) => {
                mapper.rollback().await?;
                return Err(e);
            }
        }
        self.inner.publish(None, &batch).await?;
        tracing::info!("cleaned up {} soft-deleted documents", ids.len());
        Ok(ids.len())
    }

    pub async fn close(&self) -> StorageResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(cluster) = &self.inner.cluster {
            cluster.unregister().await?;
        }
        tracing::info!("repository '{}' closed", self.name());
        Ok(())
    }
}
