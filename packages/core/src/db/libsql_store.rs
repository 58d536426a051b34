//! libsql Row Store
//!
//! Embedded SQLite-compatible implementation of [`RowStore`].
//!
//! # Architecture
//!
//! - **Generic rows table**: every fragment table is stored in one `rows`
//!   table keyed by `(tbl, id)` with the payload as JSON text. Hierarchy
//!   rows denormalize `parent_id`, `name` and `is_complex` for child lookups.
//! - **Natural order**: the `seq` autoincrement column gives the insertion
//!   order used for child listings and same-name resolution
//! - **Column-set batches**: updates of one batch share a single SQL text
//!   (`json_set` over the touched columns)
//! - **Busy timeout**: every connection waits up to 5s on lock contention
//! - **Control database**: the id sequence and document locks live in a
//!   sibling `<file>.control` database with its own write lock, so they are
//!   written in autocommit even while a row transaction holds the main file
//!
//! Use a file path rather than `:memory:`; each connection opens its own
//! handle and in-memory databases are not shared between handles.

use super::row_store::{RowMapper, RowStore, StatsCounters, StoreStats, DEFAULT_MAX_IN_LIST};
use super::StoreError;
use crate::models::{Lock, NodeId, Row, RowData, RowUpdate};
use crate::schema::{columns, HIERARCHY_TABLE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Database, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const SCHEMA: &[(&str, &str)] = &[
    (
        "rows",
        "CREATE TABLE IF NOT EXISTS rows (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            tbl TEXT NOT NULL,
            id TEXT NOT NULL,
            parent_id TEXT,
            name TEXT,
            is_complex INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL
        )",
    ),
    (
        "idx_rows_id",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_rows_id ON rows(tbl, id)",
    ),
    (
        "idx_rows_parent",
        "CREATE INDEX IF NOT EXISTS idx_rows_parent ON rows(tbl, parent_id, name)",
    ),
    (
        "repositories",
        "CREATE TABLE IF NOT EXISTS repositories (
            name TEXT PRIMARY KEY,
            root_id TEXT NOT NULL
        )",
    ),
    (
        "cluster_nodes",
        "CREATE TABLE IF NOT EXISTS cluster_nodes (
            node_id TEXT PRIMARY KEY,
            created TEXT NOT NULL
        )",
    ),
    (
        "cluster_invals",
        "CREATE TABLE IF NOT EXISTS cluster_invals (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            node_id TEXT NOT NULL,
            payload TEXT NOT NULL
        )",
    ),
];

const CONTROL_SCHEMA: &[(&str, &str)] = &[
    (
        "sequences",
        "CREATE TABLE IF NOT EXISTS sequences (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        )",
    ),
    (
        "locks",
        "CREATE TABLE IF NOT EXISTS locks (
            id TEXT PRIMARY KEY,
            owner TEXT,
            created TEXT NOT NULL
        )",
    ),
];

/// libsql-backed row store
pub struct LibsqlRowStore {
    db: Arc<Database>,
    control: Arc<Database>,
    db_path: PathBuf,
    stats: Arc<StatsCounters>,
    max_in_list: usize,
}

impl LibsqlRowStore {
    /// Open (or create) the database file and initialize the schema
    pub async fn open(db_path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| {
                    StoreError::DirectoryCreationFailed {
                        path: db_path.clone(),
                        source,
                    }
                })?;
            }
        }

        let db = Builder::new_local(&db_path)
            .build()
            .await
            .map_err(|e| StoreError::connection_failed(db_path.clone(), e))?;
        let control_file = control_path(&db_path);
        let control = Builder::new_local(&control_file)
            .build()
            .await
            .map_err(|e| StoreError::connection_failed(control_file, e))?;

        let store = Self {
            db: Arc::new(db),
            control: Arc::new(control),
            db_path,
            stats: Arc::new(StatsCounters::default()),
            max_in_list: DEFAULT_MAX_IN_LIST,
        };
        store.initialize_schema().await?;
        tracing::info!("Opened libsql row store at {:?}", store.db_path);
        Ok(store)
    }

    pub fn with_max_in_list(mut self, max_in_list: usize) -> Self {
        self.max_in_list = max_in_list.max(1);
        self
    }

    pub fn path(&self) -> &PathBuf {
        &self.db_path
    }

    async fn connect_with_timeout(db: &Database) -> Result<Connection, StoreError> {
        let conn = db.connect()?;
        execute_pragma(&conn, "PRAGMA busy_timeout = 5000").await?;
        Ok(conn)
    }

    async fn initialize_schema(&self) -> Result<(), StoreError> {
        let conn = Self::connect_with_timeout(&self.db).await?;
        create_tables(&conn, SCHEMA).await?;
        let conn = Self::connect_with_timeout(&self.control).await?;
        create_tables(&conn, CONTROL_SCHEMA).await?;
        conn.execute(
            "INSERT INTO sequences (name, value) VALUES ('ids', 0) ON CONFLICT(name) DO NOTHING",
            (),
        )
        .await
        .map_err(|e| StoreError::initialization_failed(format!("Failed to seed sequence: {}", e)))?;
        Ok(())
    }
}

/// Path of the control database next to `db_path`
fn control_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".control");
    PathBuf::from(name)
}

async fn create_tables(conn: &Connection, schema: &[(&str, &str)]) -> Result<(), StoreError> {
    execute_pragma(conn, "PRAGMA journal_mode = WAL").await?;
    for (name, ddl) in schema {
        conn.execute(ddl, ()).await.map_err(|e| {
            StoreError::initialization_failed(format!("Failed to create '{}': {}", name, e))
        })?;
    }
    Ok(())
}

/// PRAGMA statements return rows, so they go through query() rather than execute()
async fn execute_pragma(conn: &Connection, pragma: &str) -> Result<(), StoreError> {
    let mut stmt = conn
        .prepare(pragma)
        .await
        .map_err(|e| StoreError::sql_execution(format!("Failed to execute '{}': {}", pragma, e)))?;
    let _ = stmt
        .query(())
        .await
        .map_err(|e| StoreError::sql_execution(format!("Failed to execute '{}': {}", pragma, e)))?;
    Ok(())
}

#[async_trait]
impl RowStore for LibsqlRowStore {
    fn name(&self) -> &str {
        "libsql"
    }

    async fn connect(&self) -> Result<Box<dyn RowMapper>, StoreError> {
        let conn = Self::connect_with_timeout(&self.db).await?;
        let control = Self::connect_with_timeout(&self.control).await?;
        Ok(Box::new(LibsqlRowMapper {
            conn,
            control,
            stats: Arc::clone(&self.stats),
            max_in_list: self.max_in_list,
            in_transaction: AtomicBool::new(false),
        }))
    }

    fn stats(&self) -> StoreStats {
        self.stats.snapshot()
    }
}

/// One libsql connection
pub struct LibsqlRowMapper {
    conn: Connection,
    /// Autocommit connection to the control database
    control: Connection,
    stats: Arc<StatsCounters>,
    max_in_list: usize,
    in_transaction: AtomicBool,
}

fn decode_data(table: &str, id: &str, json: &str) -> Result<RowData, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::corrupt_row(table, id, e.to_string()))
}

fn text(value: impl Into<String>) -> Value {
    Value::Text(value.into())
}

fn optional_text(value: Option<&str>) -> Value {
    value.map(text).unwrap_or(Value::Null)
}

/// Denormalized hierarchy columns of a row payload
fn hierarchy_columns(table: &str, data: &RowData) -> (Value, Value, i64) {
    if table != HIERARCHY_TABLE {
        return (Value::Null, Value::Null, 0);
    }
    (
        optional_text(data.get_str(columns::PARENT_ID)),
        optional_text(data.get_str(columns::NAME)),
        i64::from(data.get_bool(columns::IS_COMPLEX)),
    )
}

async fn exec_on(conn: &Connection, sql: &str, params: Vec<Value>) -> Result<u64, StoreError> {
    conn.execute(sql, params)
        .await
        .map_err(|e| StoreError::sql_execution(format!("{}: {}", sql.trim(), e)))
}

impl LibsqlRowMapper {
    async fn query_rows(
        &self,
        table: &str,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Vec<Row>, StoreError> {
        self.stats.record_select();
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(|e| StoreError::sql_execution(format!("Failed to query {}: {}", table, e)))?;
        let mut result = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::sql_execution(e.to_string()))?
        {
            let id: String = row.get(0)?;
            let json: String = row.get(1)?;
            let data = decode_data(table, &id, &json)?;
            result.push(Row::new(table, NodeId::from(id), data));
        }
        Ok(result)
    }

    async fn exec(&self, sql: &str, params: Vec<Value>) -> Result<u64, StoreError> {
        exec_on(&self.conn, sql, params).await
    }

    async fn exec_control(&self, sql: &str, params: Vec<Value>) -> Result<u64, StoreError> {
        exec_on(&self.control, sql, params).await
    }

    async fn sync_hierarchy_columns(&self, id: &NodeId) -> Result<(), StoreError> {
        self.exec(
            "UPDATE rows SET parent_id = json_extract(data, '$.parentid'),
                             name = json_extract(data, '$.name'),
                             is_complex = coalesce(json_extract(data, '$.iscomplex'), 0)
             WHERE tbl = ? AND id = ?",
            vec![text(HIERARCHY_TABLE), text(id.as_str())],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RowMapper for LibsqlRowMapper {
    async fn read_by_id(&self, table: &str, id: &NodeId) -> Result<Option<Row>, StoreError> {
        let rows = self
            .query_rows(
                table,
                "SELECT id, data FROM rows WHERE tbl = ? AND id = ?",
                vec![text(table), text(id.as_str())],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn read_by_ids(
        &self,
        table: &str,
        ids: &[NodeId],
    ) -> Result<Vec<Option<Row>>, StoreError> {
        let mut found: HashMap<NodeId, Row> = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(self.max_in_list) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT id, data FROM rows WHERE tbl = ? AND id IN ({})",
                placeholders
            );
            let mut params = Vec::with_capacity(chunk.len() + 1);
            params.push(text(table));
            params.extend(chunk.iter().map(|id| text(id.as_str())));
            for row in self.query_rows(table, &sql, params).await? {
                found.insert(row.id.clone(), row);
            }
        }
        Ok(ids.iter().map(|id| found.get(id).cloned()).collect())
    }

    async fn read_by_parent(
        &self,
        parent_id: &NodeId,
        complex: Option<bool>,
    ) -> Result<Vec<Row>, StoreError> {
        match complex {
            Some(complex) => {
                self.query_rows(
                    HIERARCHY_TABLE,
                    "SELECT id, data FROM rows WHERE tbl = ? AND parent_id = ? AND is_complex = ? ORDER BY seq",
                    vec![
                        text(HIERARCHY_TABLE),
                        text(parent_id.as_str()),
                        Value::Integer(i64::from(complex)),
                    ],
                )
                .await
            }
            None => {
                self.query_rows(
                    HIERARCHY_TABLE,
                    "SELECT id, data FROM rows WHERE tbl = ? AND parent_id = ? ORDER BY seq",
                    vec![text(HIERARCHY_TABLE), text(parent_id.as_str())],
                )
                .await
            }
        }
    }

    async fn read_child_by_name(
        &self,
        parent_id: &NodeId,
        name: &str,
        complex: bool,
    ) -> Result<Option<Row>, StoreError> {
        let rows = self
            .query_rows(
                HIERARCHY_TABLE,
                "SELECT id, data FROM rows
                 WHERE tbl = ? AND parent_id = ? AND name = ? AND is_complex = ?
                   AND coalesce(json_extract(data, '$.isdeleted'), 0) = 0
                 ORDER BY seq LIMIT 1",
                vec![
                    text(HIERARCHY_TABLE),
                    text(parent_id.as_str()),
                    text(name),
                    Value::Integer(i64::from(complex)),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn read_by_column(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<Vec<Row>, StoreError> {
        self.query_rows(
            table,
            "SELECT id, data FROM rows WHERE tbl = ? AND json_extract(data, ?) = ? ORDER BY seq",
            vec![text(table), text(format!("$.{}", column)), text(value)],
        )
        .await
    }

    async fn scan(&self, table: &str) -> Result<Vec<Row>, StoreError> {
        self.query_rows(
            table,
            "SELECT id, data FROM rows WHERE tbl = ? ORDER BY seq",
            vec![text(table)],
        )
        .await
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        for row in rows {
            let (parent_id, name, is_complex) = hierarchy_columns(table, &row.data);
            let json = serde_json::to_string(&row.data)?;
            self.exec(
                "INSERT INTO rows (tbl, id, parent_id, name, is_complex, data) VALUES (?, ?, ?, ?, ?, ?)",
                vec![
                    text(table),
                    text(row.id.as_str()),
                    parent_id,
                    name,
                    Value::Integer(is_complex),
                    text(json),
                ],
            )
            .await?;
        }
        self.stats.record_insert(rows.len());
        Ok(())
    }

    async fn update(&self, table: &str, updates: &[RowUpdate]) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut touched = 0;
        for update in updates {
            let affected = match update {
                RowUpdate::Columns { id, values } => {
                    let setters = vec!["?, json(?)"; values.len()].join(", ");
                    let sql = format!(
                        "UPDATE rows SET data = json_set(data, {}) WHERE tbl = ? AND id = ?",
                        setters
                    );
                    let mut params = Vec::with_capacity(values.len() * 2 + 2);
                    for (column, value) in values {
                        params.push(text(format!("$.{}", column)));
                        params.push(text(serde_json::to_string(value)?));
                    }
                    params.push(text(table));
                    params.push(text(id.as_str()));
                    let affected = self.exec(&sql, params).await?;
                    if table == HIERARCHY_TABLE && affected > 0 {
                        self.sync_hierarchy_columns(id).await?;
                    }
                    affected
                }
                RowUpdate::Collection { id, values } => {
                    let json = serde_json::to_string(values)?;
                    self.exec(
                        "UPDATE rows SET data = ? WHERE tbl = ? AND id = ?",
                        vec![text(json), text(table), text(id.as_str())],
                    )
                    .await?
                }
            };
            touched += affected as usize;
        }
        self.stats.record_update(touched);
        Ok(())
    }

    async fn delete(&self, table: &str, ids: &[NodeId]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut removed = 0;
        for chunk in ids.chunks(self.max_in_list) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!("DELETE FROM rows WHERE tbl = ? AND id IN ({})", placeholders);
            let mut params = Vec::with_capacity(chunk.len() + 1);
            params.push(text(table));
            params.extend(chunk.iter().map(|id| text(id.as_str())));
            removed += self.exec(&sql, params).await? as usize;
        }
        self.stats.record_delete(removed);
        Ok(())
    }

    async fn begin(&self) -> Result<(), StoreError> {
        if self.in_transaction.swap(true, Ordering::SeqCst) {
            return Err(StoreError::transaction("transaction already started"));
        }
        if let Err(e) = self.conn.execute("BEGIN IMMEDIATE", ()).await {
            self.in_transaction.store(false, Ordering::SeqCst);
            return Err(StoreError::sql_execution(format!(
                "Failed to begin transaction: {}",
                e
            )));
        }
        Ok(())
    }

    async fn commit(&self) -> Result<(), StoreError> {
        if !self.in_transaction.swap(false, Ordering::SeqCst) {
            return Err(StoreError::transaction("commit without transaction"));
        }
        if let Err(e) = self.conn.execute("COMMIT", ()).await {
            let _rollback = self.conn.execute("ROLLBACK", ()).await;
            return Err(StoreError::sql_execution(format!(
                "Failed to commit transaction: {}",
                e
            )));
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        if !self.in_transaction.swap(false, Ordering::SeqCst) {
            return Err(StoreError::transaction("rollback without transaction"));
        }
        self.conn
            .execute("ROLLBACK", ())
            .await
            .map_err(|e| StoreError::sql_execution(format!("Failed to rollback: {}", e)))?;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    async fn get_root_id(&self, repository: &str) -> Result<Option<NodeId>, StoreError> {
        self.stats.record_select();
        let mut rows = self
            .conn
            .query(
                "SELECT root_id FROM repositories WHERE name = ?",
                vec![text(repository)],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(NodeId::from(row.get::<String>(0)?))),
            None => Ok(None),
        }
    }

    async fn set_root_id(&self, repository: &str, id: &NodeId) -> Result<(), StoreError> {
        self.exec(
            "INSERT INTO repositories (name, root_id) VALUES (?, ?)
             ON CONFLICT(name) DO UPDATE SET root_id = excluded.root_id",
            vec![text(repository), text(id.as_str())],
        )
        .await?;
        Ok(())
    }

    async fn reserve_ids(&self, count: u64) -> Result<u64, StoreError> {
        let mut rows = self
            .control
            .query(
                "UPDATE sequences SET value = value + ? WHERE name = 'ids' RETURNING value",
                vec![Value::Integer(count as i64)],
            )
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| StoreError::sql_execution("id sequence missing"))?;
        let last: i64 = row.get(0)?;
        Ok(last as u64 - count + 1)
    }

    async fn get_lock(&self, id: &NodeId) -> Result<Option<Lock>, StoreError> {
        self.stats.record_select();
        let mut rows = self
            .control
            .query(
                "SELECT owner, created FROM locks WHERE id = ?",
                vec![text(id.as_str())],
            )
            .await?;
        match rows.next().await? {
            Some(row) => {
                let owner: Option<String> = row.get(0)?;
                let created: String = row.get(1)?;
                let created = DateTime::parse_from_rfc3339(&created)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| StoreError::corrupt_row("locks", id.as_str(), e.to_string()))?;
                Ok(Some(Lock::with_created(owner, created)))
            }
            None => Ok(None),
        }
    }

    async fn set_lock(&self, id: &NodeId, lock: &Lock) -> Result<Option<Lock>, StoreError> {
        // The existing row can vanish between the failed insert and the read
        for _ in 0..3 {
            let inserted = self
                .exec_control(
                    "INSERT INTO locks (id, owner, created) VALUES (?, ?, ?) ON CONFLICT(id) DO NOTHING",
                    vec![
                        text(id.as_str()),
                        optional_text(lock.owner.as_deref()),
                        text(lock.created.to_rfc3339()),
                    ],
                )
                .await?;
            if inserted > 0 {
                return Ok(None);
            }
            if let Some(existing) = self.get_lock(id).await? {
                return Ok(Some(existing));
            }
        }
        Err(StoreError::sql_execution(format!(
            "lock contention on {} did not settle",
            id
        )))
    }

    async fn delete_lock(&self, id: &NodeId) -> Result<Option<Lock>, StoreError> {
        let existing = self.get_lock(id).await?;
        if existing.is_some() {
            self.exec_control("DELETE FROM locks WHERE id = ?", vec![text(id.as_str())])
                .await?;
        }
        Ok(existing)
    }

    async fn cluster_register(&self, node_id: &str) -> Result<(), StoreError> {
        self.exec(
            "INSERT INTO cluster_nodes (node_id, created) VALUES (?, ?) ON CONFLICT(node_id) DO NOTHING",
            vec![text(node_id), text(Utc::now().to_rfc3339())],
        )
        .await?;
        Ok(())
    }

    async fn cluster_unregister(&self, node_id: &str) -> Result<(), StoreError> {
        self.exec(
            "DELETE FROM cluster_invals WHERE node_id = ?",
            vec![text(node_id)],
        )
        .await?;
        self.exec(
            "DELETE FROM cluster_nodes WHERE node_id = ?",
            vec![text(node_id)],
        )
        .await?;
        Ok(())
    }

    async fn cluster_nodes(&self) -> Result<Vec<String>, StoreError> {
        let mut rows = self
            .conn
            .query("SELECT node_id FROM cluster_nodes ORDER BY created, node_id", ())
            .await?;
        let mut nodes = Vec::new();
        while let Some(row) = rows.next().await? {
            nodes.push(row.get::<String>(0)?);
        }
        Ok(nodes)
    }

    async fn cluster_send(&self, from: &str, payload: &str) -> Result<(), StoreError> {
        self.exec(
            "INSERT INTO cluster_invals (node_id, payload)
             SELECT node_id, ? FROM cluster_nodes WHERE node_id <> ?",
            vec![text(payload), text(from)],
        )
        .await?;
        Ok(())
    }

    async fn cluster_receive(&self, node_id: &str) -> Result<Vec<String>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT seq, payload FROM cluster_invals WHERE node_id = ? ORDER BY seq",
                vec![text(node_id)],
            )
            .await?;
        let mut payloads = Vec::new();
        let mut max_seq = None;
        while let Some(row) = rows.next().await? {
            max_seq = Some(row.get::<i64>(0)?);
            payloads.push(row.get::<String>(1)?);
        }
        if let Some(max_seq) = max_seq {
            self.exec(
                "DELETE FROM cluster_invals WHERE node_id = ? AND seq <= ?",
                vec![text(node_id), Value::Integer(max_seq)],
            )
            .await?;
        }
        Ok(payloads)
    }
}
