//! Repository Services
//!
//! This module contains the session core and the services it coordinates:
//!
//! - `Repository` - shared state, connection pool, root bootstrap
//! - `Session` - node, property, versioning, proxy and transaction API
//! - `InvalidationPropagator` - per-session invalidation queues
//! - `ClusterNode` - invalidation exchange between repository instances
//! - `LockManager` - document locks on a dedicated connection
//! - `BinaryManager` - content-addressed binaries and their GC
//! - `Query` - structured queries over saved documents
//!
//! Sessions stage writes in their persistence context; the other services
//! are shared by every session of a repository.

pub mod binary;
pub mod cluster;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod lock_manager;
pub mod query;
pub mod repository;
pub mod session;

pub use binary::{BinaryGarbageCollector, BinaryManager, BinaryManagerStatus};
pub use cluster::ClusterNode;
pub use config::{ClusterConfig, IdStrategy, PoolConfig, RepositoryConfig};
pub use error::{StorageError, StorageResult};
pub use invalidation::{InvalidationPropagator, SessionId};
pub use lock_manager::LockManager;
pub use query::{OrderBy, PartialList, Query, QueryFilter, QueryResultIter, ID_KEY, TYPE_KEY};
pub use repository::Repository;
pub use session::Session;
