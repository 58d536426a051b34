//! Database Layer
//!
//! The row store boundary consumed by the session core:
//!
//! - [`RowStore`] / [`RowMapper`] - data source and connection traits
//! - [`MemoryRowStore`] - shared in-process tables with undo-log rollback
//! - [`LibsqlRowStore`] - embedded libsql database (feature `libsql-store`)
//!
//! # Architecture
//!
//! Every fragment table maps to rows keyed by `(table, node id)`. Hierarchy
//! rows additionally expose parent id, name and complex flag so child
//! listings and name lookups can be answered by the store. Locks, the
//! cluster invalidation log, the root registry and the id sequence have
//! dedicated operations so they never go through a session's cache.

mod error;
#[cfg(feature = "libsql-store")]
mod libsql_store;
mod memory_store;
mod row_store;

pub use error::StoreError;
#[cfg(feature = "libsql-store")]
pub use libsql_store::{LibsqlRowMapper, LibsqlRowStore};
pub use memory_store::{MemoryRowMapper, MemoryRowStore};
pub use row_store::{RowMapper, RowStore, StatsCounters, StoreStats, DEFAULT_MAX_IN_LIST};
