//! Lock Manager
//!
//! Serves document locks through a dedicated store connection, outside any
//! session transaction, so lock changes are durable and visible to every
//! session as soon as the call returns.
//!
//! Unclustered repositories route every lock change through this one
//! manager, so lock states (including "no lock") are cached in an LRU.
//! Clustered repositories always read the store.

use crate::db::{RowMapper, RowStore};
use crate::models::{Lock, NodeId};
use crate::services::error::StorageResult;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

pub struct LockManager {
    mapper: tokio::sync::Mutex<Box<dyn RowMapper>>,
    cache: Option<Mutex<LruCache<NodeId, Option<Lock>>>>,
}

impl LockManager {
    /// Open the dedicated connection; `cache_size` of `None` disables caching
    pub async fn open(store: &dyn RowStore, cache_size: Option<NonZeroUsize>) -> StorageResult<Self> {
        let mapper = store.connect().await?;
        Ok(Self {
            mapper: tokio::sync::Mutex::new(mapper),
            cache: cache_size.map(|size| Mutex::new(LruCache::new(size))),
        })
    }

    pub fn is_caching(&self) -> bool {
        self.cache.is_some()
    }

    fn cache(&self) -> Option<MutexGuard<'_, LruCache<NodeId, Option<Lock>>>> {
        self.cache
            .as_ref()
            .map(|c| c.lock().unwrap_or_else(|p| p.into_inner()))
    }

    fn remember(&self, id: &NodeId, lock: Option<Lock>) {
        if let Some(mut cache) = self.cache() {
            cache.put(id.clone(), lock);
        }
    }

    pub async fn get_lock(&self, id: &NodeId) -> StorageResult<Option<Lock>> {
        if let Some(mut cache) = self.cache() {
            if let Some(lock) = cache.get(id) {
                return Ok(lock.clone());
            }
        }
        let mapper = self.mapper.lock().await;
        let lock = mapper.get_lock(id).await?;
        self.remember(id, lock.clone());
        Ok(lock)
    }

    /// Atomically acquire a lock
    ///
    /// Returns `None` on success. When the document is already locked the
    /// existing lock is returned unchanged and nothing is written.
    pub async fn set_lock(&self, id: &NodeId, lock: Lock) -> StorageResult<Option<Lock>> {
        let mapper = self.mapper.lock().await;
        let existing = mapper.set_lock(id, &lock).await?;
        match &existing {
            Some(held) => {
                tracing::debug!("lock on {} denied, held by {:?}", id, held.owner);
                self.remember(id, Some(held.clone()));
            }
            None => self.remember(id, Some(lock)),
        }
        Ok(existing)
    }

    /// Release a lock
    ///
    /// - `force`: delete the lock row without inspecting it, returns `None`
    /// - `owner` given and not the holder: nothing is removed and the
    ///   current lock is returned with `failed` set
    /// - otherwise the removed lock (or `None` if there was none)
    pub async fn remove_lock(
        &self,
        id: &NodeId,
        owner: Option<&str>,
        force: bool,
    ) -> StorageResult<Option<Lock>> {
        let mapper = self.mapper.lock().await;
        if force {
            mapper.delete_lock(id).await?;
            self.remember(id, None);
            return Ok(None);
        }
        let Some(current) = mapper.get_lock(id).await? else {
            self.remember(id, None);
            return Ok(None);
        };
        if !current.can_be_removed_by(owner) {
            self.remember(id, Some(current.clone()));
            return Ok(Some(current.into_failed()));
        }
        let removed = mapper.delete_lock(id).await?;
        self.remember(id, None);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryRowStore;

    #[tokio::test]
    async fn test_set_lock_is_compare_and_set() {
        let store = MemoryRowStore::new();
        let manager = LockManager::open(&store, NonZeroUsize::new(10)).await.unwrap();
        let id = NodeId::from("doc");

        assert!(manager.set_lock(&id, Lock::new("bob")).await.unwrap().is_none());
        let held = manager.set_lock(&id, Lock::new("alice")).await.unwrap().unwrap();
        assert_eq!(held.owner.as_deref(), Some("bob"));
        assert!(!held.failed);
    }

    #[tokio::test]
    async fn test_remove_lock_owner_rules() {
        let store = MemoryRowStore::new();
        let manager = LockManager::open(&store, None).await.unwrap();
        let id = NodeId::from("doc");
        manager.set_lock(&id, Lock::new("bob")).await.unwrap();

        let denied = manager.remove_lock(&id, Some("alice"), false).await.unwrap().unwrap();
        assert!(denied.failed);
        assert!(manager.get_lock(&id).await.unwrap().is_some());

        let removed = manager.remove_lock(&id, None, false).await.unwrap().unwrap();
        assert_eq!(removed.owner.as_deref(), Some("bob"));
        assert!(manager.get_lock(&id).await.unwrap().is_none());
        assert!(manager.remove_lock(&id, None, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_force_remove_returns_none() {
        let store = MemoryRowStore::new();
        let manager = LockManager::open(&store, NonZeroUsize::new(10)).await.unwrap();
        let id = NodeId::from("doc");
        manager.set_lock(&id, Lock::new("bob")).await.unwrap();
        assert!(manager.remove_lock(&id, Some("alice"), true).await.unwrap().is_none());
        assert!(manager.get_lock(&id).await.unwrap().is_none());
    }

    #[test]
    fn test_cached_state_hides_writes_from_other_connections() {
        tokio_test::block_on(async {
            let store = MemoryRowStore::new();
            let cached = LockManager::open(&store, NonZeroUsize::new(10)).await.unwrap();
            let uncached = LockManager::open(&store, None).await.unwrap();
            let id = NodeId::from("doc");
            assert!(cached.get_lock(&id).await.unwrap().is_none());

            let other = store.connect().await.unwrap();
            other.set_lock(&id, &Lock::new("bob")).await.unwrap();

            assert!(cached.get_lock(&id).await.unwrap().is_none());
            assert!(uncached.get_lock(&id).await.unwrap().is_some());
        });
    }
}
