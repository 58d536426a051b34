//! Cluster Node
//!
//! Mirrors invalidation batches between repository processes sharing one
//! store. Batches are serialized to JSON and appended to the store's
//! cluster log for every other registered node; each node polls its own
//! entries at session synchronization points, at most once per `delay`.

use crate::db::{RowMapper, RowStore};
use crate::models::Invalidations;
use crate::services::config::ClusterConfig;
use crate::services::error::StorageResult;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub struct ClusterNode {
    node_id: String,
    delay: Duration,
    mapper: tokio::sync::Mutex<Box<dyn RowMapper>>,
    last_poll: Mutex<Option<Instant>>,
}

impl ClusterNode {
    /// Open a dedicated connection and register this node
    pub async fn open(store: &dyn RowStore, config: &ClusterConfig) -> StorageResult<Self> {
        let mapper = store.connect().await?;
        mapper.cluster_register(&config.node_id).await?;
        tracing::info!(
            "cluster node {} registered (delay {} ms)",
            config.node_id,
            config.delay_ms
        );
        Ok(Self {
            node_id: config.node_id.clone(),
            delay: Duration::from_millis(config.delay_ms),
            mapper: tokio::sync::Mutex::new(mapper),
            last_poll: Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    fn last_poll(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_poll.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queue a locally produced batch for every other node
    pub async fn send(&self, batch: &Invalidations) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_string(batch).map_err(crate::db::StoreError::from)?;
        self.mapper
            .lock()
            .await
            .cluster_send(&self.node_id, &payload)
            .await?;
        Ok(())
    }

    /// Fetch batches queued for this node since the last poll
    ///
    /// Returns an empty batch without touching the store when the previous
    /// poll happened less than `delay` ago.
    pub async fn receive(&self) -> StorageResult<Invalidations> {
        {
            let mut last = self.last_poll();
            if let Some(at) = *last {
                if at.elapsed() < self.delay {
                    return Ok(Invalidations::new());
                }
            }
            *last = Some(Instant::now());
        }
        let payloads = self.mapper.lock().await.cluster_receive(&self.node_id).await?;
        let mut merged = Invalidations::new();
        for payload in payloads {
            match serde_json::from_str::<Invalidations>(&payload) {
                Ok(batch) => merged.merge(batch),
                Err(e) => tracing::warn!("dropping unreadable cluster invalidation: {}", e),
            }
        }
        if !merged.is_empty() {
            tracing::debug!("cluster node {} received {} invalidations", self.node_id, merged.len());
        }
        Ok(merged)
    }

    /// Node ids currently registered in the shared store
    pub async fn members(&self) -> StorageResult<Vec<String>> {
        Ok(self.mapper.lock().await.cluster_nodes().await?)
    }

    pub async fn unregister(&self) -> StorageResult<()> {
        self.mapper.lock().await.cluster_unregister(&self.node_id).await?;
        tracing::info!("cluster node {} unregistered", self.node_id);
        Ok(())
    }
}
