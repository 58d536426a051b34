//! Row Store Boundary
//!
//! Traits the session core consumes to reach durable storage:
//!
//! - [`RowStore`] is the data source shared by a repository; it hands out
//!   connections.
//! - [`RowMapper`] is one connection: row reads and writes by table + id,
//!   transaction control, and the dedicated lock / cluster / sequence
//!   operations.
//!
//! # Design Decisions
//!
//! 1. **Async-First**: every call may hit disk or network
//! 2. **`&self` receivers**: connections keep their own interior state so a
//!    mapper can sit behind an `Arc` or a `tokio::sync::Mutex`
//! 3. **Order-preserving bulk reads**: `read_by_ids` returns one slot per
//!    requested id and chunks internally by the store's IN-list limit
//! 4. **Outside a transaction every write is immediately durable**

use super::StoreError;
use crate::models::{Lock, NodeId, Row, RowUpdate};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default maximum number of ids per IN (...) list
pub const DEFAULT_MAX_IN_LIST: usize = 2000;

/// Data source shared by all sessions of a repository
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Open a new connection
    async fn connect(&self) -> Result<Box<dyn RowMapper>, StoreError>;

    /// Execution counters shared by every connection of this store
    fn stats(&self) -> StoreStats;
}

/// One connection to the row store
#[async_trait]
pub trait RowMapper: Send + Sync {
    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    async fn read_by_id(&self, table: &str, id: &NodeId) -> Result<Option<Row>, StoreError>;

    /// One result per requested id, in request order, `None` for missing rows
    async fn read_by_ids(&self, table: &str, ids: &[NodeId])
        -> Result<Vec<Option<Row>>, StoreError>;

    /// Hierarchy rows whose parent is `parent_id`, in natural row order.
    /// `complex` filters on the complex-property flag when given.
    async fn read_by_parent(
        &self,
        parent_id: &NodeId,
        complex: Option<bool>,
    ) -> Result<Vec<Row>, StoreError>;

    /// First hierarchy row (natural order) with the given parent, name and
    /// complex flag. Soft-deleted rows are skipped.
    async fn read_child_by_name(
        &self,
        parent_id: &NodeId,
        name: &str,
        complex: bool,
    ) -> Result<Option<Row>, StoreError>;

    /// Rows of a simple table whose `column` holds the string `value`
    async fn read_by_column(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<Vec<Row>, StoreError>;

    /// Every row of a table
    async fn scan(&self, table: &str) -> Result<Vec<Row>, StoreError>;

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Insert rows (all of one table)
    async fn insert(&self, table: &str, rows: &[Row]) -> Result<(), StoreError>;

    /// Apply updates sharing one column set as a single batch
    async fn update(&self, table: &str, updates: &[RowUpdate]) -> Result<(), StoreError>;

    async fn delete(&self, table: &str, ids: &[NodeId]) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    async fn begin(&self) -> Result<(), StoreError>;
    async fn commit(&self) -> Result<(), StoreError>;
    async fn rollback(&self) -> Result<(), StoreError>;
    fn in_transaction(&self) -> bool;

    // ------------------------------------------------------------------
    // Repository bookkeeping
    // ------------------------------------------------------------------

    async fn get_root_id(&self, repository: &str) -> Result<Option<NodeId>, StoreError>;
    async fn set_root_id(&self, repository: &str, id: &NodeId) -> Result<(), StoreError>;

    /// Reserve `count` consecutive sequence ids, returning the first one
    async fn reserve_ids(&self, count: u64) -> Result<u64, StoreError>;

    // ------------------------------------------------------------------
    // Locks (always autocommit)
    // ------------------------------------------------------------------

    async fn get_lock(&self, id: &NodeId) -> Result<Option<Lock>, StoreError>;

    /// Atomically store `lock` if none exists; otherwise return the
    /// existing lock unchanged
    async fn set_lock(&self, id: &NodeId, lock: &Lock) -> Result<Option<Lock>, StoreError>;

    /// Delete the lock row, returning what was there
    async fn delete_lock(&self, id: &NodeId) -> Result<Option<Lock>, StoreError>;

    // ------------------------------------------------------------------
    // Cluster invalidation log
    // ------------------------------------------------------------------

    async fn cluster_register(&self, node_id: &str) -> Result<(), StoreError>;
    async fn cluster_unregister(&self, node_id: &str) -> Result<(), StoreError>;
    async fn cluster_nodes(&self) -> Result<Vec<String>, StoreError>;

    /// Append a serialized batch for every registered node except `from`
    async fn cluster_send(&self, from: &str, payload: &str) -> Result<(), StoreError>;

    /// Take (and remove) the batches queued for `node_id`, oldest first
    async fn cluster_receive(&self, node_id: &str) -> Result<Vec<String>, StoreError>;
}

/// Snapshot of execution counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// SELECT statements issued (one per IN-list chunk for bulk reads)
    pub selects: u64,
    pub inserted_rows: u64,
    pub updated_rows: u64,
    pub deleted_rows: u64,
    pub insert_batches: u64,
    pub update_batches: u64,
    pub delete_batches: u64,
}

impl StoreStats {
    /// Total row writes
    pub fn writes(&self) -> u64 {
        self.inserted_rows + self.updated_rows + self.deleted_rows
    }

    pub fn batches(&self) -> u64 {
        self.insert_batches + self.update_batches + self.delete_batches
    }
}

/// Shared atomic counters behind [`StoreStats`]
#[derive(Debug, Default)]
pub struct StatsCounters {
    selects: AtomicU64,
    inserted_rows: AtomicU64,
    updated_rows: AtomicU64,
    deleted_rows: AtomicU64,
    insert_batches: AtomicU64,
    update_batches: AtomicU64,
    delete_batches: AtomicU64,
}

impl StatsCounters {
    pub fn record_select(&self) {
        self.selects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert(&self, rows: usize) {
        self.insert_batches.fetch_add(1, Ordering::Relaxed);
        self.inserted_rows.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn record_update(&self, rows: usize) {
        self.update_batches.fetch_add(1, Ordering::Relaxed);
        self.updated_rows.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn record_delete(&self, rows: usize) {
        self.delete_batches.fetch_add(1, Ordering::Relaxed);
        self.deleted_rows.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StoreStats {
        StoreStats {
            selects: self.selects.load(Ordering::Relaxed),
            inserted_rows: self.inserted_rows.load(Ordering::Relaxed),
            updated_rows: self.updated_rows.load(Ordering::Relaxed),
            deleted_rows: self.deleted_rows.load(Ordering::Relaxed),
            insert_batches: self.insert_batches.load(Ordering::Relaxed),
            update_batches: self.update_batches.load(Ordering::Relaxed),
            delete_batches: self.delete_batches.load(Ordering::Relaxed),
        }
    }
}
