//! Repository configuration
//!
//! Every behavior switch of a repository is a field here and is injected at
//! [`Repository::open`](crate::services::Repository::open) time.

use crate::services::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::PathBuf;

/// How new node ids are allocated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdStrategy {
    /// Random v4 UUID strings
    #[default]
    Uuid,
    /// Decimal values from the store sequence, reserved in blocks
    Sequence,
}

/// Connection pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of concurrently open sessions
    pub max_sessions: usize,
    /// How long `get_session` waits for a free connection
    pub blocking_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 20,
            blocking_timeout_ms: 5000,
        }
    }
}

/// Cross-process invalidation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Identifier of this process in the shared cluster registry
    pub node_id: String,
    /// Minimum interval between two polls of the shared invalidation log
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub name: String,
    pub pool: PoolConfig,
    pub clustering: Option<ClusterConfig>,
    /// Tombstone removed documents instead of deleting their rows
    pub soft_delete: bool,
    pub proxies_enabled: bool,
    /// Evictable children/selection entries per session
    pub children_cache_size: usize,
    /// Pristine fragments per session
    pub fragment_cache_size: usize,
    /// Root directory of the binary store, binaries disabled when unset
    pub binaries_path: Option<PathBuf>,
    /// Lock states cached by an unclustered lock manager
    pub lock_cache_size: usize,
    pub id_strategy: IdStrategy,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            pool: PoolConfig::default(),
            clustering: None,
            soft_delete: false,
            proxies_enabled: true,
            children_cache_size: 1000,
            fragment_cache_size: 10_000,
            binaries_path: None,
            lock_cache_size: 1000,
            id_strategy: IdStrategy::Uuid,
        }
    }
}

impl RepositoryConfig {
    pub fn from_json(json: &str) -> StorageResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            StorageError::illegal_argument(format!("invalid repository configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.name.is_empty() {
            return Err(StorageError::illegal_argument("repository name is empty"));
        }
        if self.pool.max_sessions == 0 {
            return Err(StorageError::illegal_argument("pool.max_sessions must be > 0"));
        }
        if let Some(cluster) = &self.clustering {
            if cluster.node_id.is_empty() {
                return Err(StorageError::illegal_argument("clustering.node_id is empty"));
            }
        }
        Ok(())
    }

    pub fn is_clustered(&self) -> bool {
        self.clustering.is_some()
    }

    pub(crate) fn fragment_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.fragment_cache_size).unwrap_or(NonZeroUsize::MIN)
    }

    pub(crate) fn children_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.children_cache_size).unwrap_or(NonZeroUsize::MIN)
    }

    pub(crate) fn lock_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.lock_cache_size).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RepositoryConfig::default();
        assert_eq!(config.name, "default");
        assert_eq!(config.pool.max_sessions, 20);
        assert_eq!(config.pool.blocking_timeout_ms, 5000);
        assert!(!config.is_clustered());
        assert!(config.proxies_enabled);
        assert!(!config.soft_delete);
    }

    #[test]
    fn test_from_json_partial() {
        let config = RepositoryConfig::from_json(
            r#"{
                "name": "test",
                "pool": {"max_sessions": 2},
                "clustering": {"node_id": "n1", "delay_ms": 250},
                "id_strategy": "sequence"
            }"#,
        )
        .unwrap();
        assert_eq!(config.name, "test");
        assert_eq!(config.pool.max_sessions, 2);
        assert_eq!(config.pool.blocking_timeout_ms, 5000);
        assert_eq!(config.clustering.unwrap().delay_ms, 250);
        assert_eq!(config.id_strategy, IdStrategy::Sequence);
    }

    #[test]
    fn test_rejects_zero_pool() {
        let result = RepositoryConfig::from_json(r#"{"pool": {"max_sessions": 0}}"#);
        assert!(matches!(result, Err(StorageError::IllegalArgument(_))));
    }
}
