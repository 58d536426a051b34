//! DocSpace Core Storage Layer
//!
//! This crate provides the session-level storage core of a hierarchical
//! document repository: typed documents in a tree, stored as rows of
//! per-schema fragment tables, with versioning, proxies, locks, ACLs and
//! content-addressed binaries.
//!
//! # Architecture
//!
//! - **Fragments**: every document is a set of rows keyed by node id, one per
//!   table its type and facets need (hierarchy, misc, ACLs, schema tables)
//! - **Persistence context**: each session caches fragments and child
//!   listings, stages writes, and flushes them in grouped batches on save
//! - **Invalidations**: saved changes are queued to every other session and
//!   applied at its next synchronization point; clustered repositories
//!   exchange them through the store
//! - **Row store**: in-memory tables or an embedded libsql database
//!
//! # Modules
//!
//! - [`models`] - Nodes, rows, fragments, invalidations, locks, ACL entries
//! - [`schema`] - Document types, schemas, facets and table mapping
//! - [`db`] - Row store traits and backends
//! - [`context`] - Per-session persistence context and selection caches
//! - [`services`] - Repository, sessions and shared services

pub mod context;
pub mod db;
pub mod models;
pub mod schema;
pub mod services;

#[cfg(test)]
mod fixtures;

// Re-export commonly used types
pub use db::{MemoryRowStore, RowMapper, RowStore, StoreError};
#[cfg(feature = "libsql-store")]
pub use db::LibsqlRowStore;
pub use models::*;
pub use schema::Model;
pub use services::*;
