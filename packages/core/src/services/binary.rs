//! Binary Manager
//!
//! Content-addressed file store for binary property values. A binary is
//! stored once under its SHA-256 hex digest, fanned out over two directory
//! levels (`ab/cd/abcd...`); documents reference it by digest.
//!
//! The garbage collector works in three steps driven by the repository:
//! `start()`, `mark()` for every digest still referenced by a document, then
//! `stop(delete)`. Files modified after `start()` are never collected by
//! that run, so concurrent uploads are safe.

use crate::services::error::{StorageError, StorageResult};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

pub struct BinaryManager {
    root: PathBuf,
}

impl BinaryManager {
    pub async fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        tracing::info!("binary store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn digest(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    fn is_digest(name: &str) -> bool {
        name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit())
    }

    /// File holding the content of `digest`
    pub fn path_for(&self, digest: &str) -> StorageResult<PathBuf> {
        if !Self::is_digest(digest) {
            return Err(StorageError::illegal_argument(format!(
                "not a binary digest: {}",
                digest
            )));
        }
        Ok(self.root.join(&digest[0..2]).join(&digest[2..4]).join(digest))
    }

    /// Store content, returning its digest
    pub async fn put(&self, bytes: &[u8]) -> StorageResult<String> {
        let digest = Self::digest(bytes);
        let path = self.path_for(&digest)?;
        if tokio::fs::try_exists(&path).await? {
            return Ok(digest);
        }
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        // Write then rename so readers never see a partial file
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!("stored binary {} ({} bytes)", digest, bytes.len());
        Ok(digest)
    }

    pub async fn get(&self, digest: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path_for(digest)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, digest: &str) -> StorageResult<bool> {
        Ok(tokio::fs::try_exists(self.path_for(digest)?).await?)
    }

    /// Every stored binary as (digest, size, modification time)
    async fn list(&self) -> StorageResult<Vec<(String, u64, SystemTime)>> {
        let mut result = Vec::new();
        let mut dirs = vec![self.root.clone()];
        while let Some(dir) = dirs.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    dirs.push(entry.path());
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if Self::is_digest(&name) {
                    result.push((name, metadata.len(), metadata.modified()?));
                }
            }
        }
        Ok(result)
    }
}

/// Outcome of the last (or current) GC run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinaryManagerStatus {
    /// Binaries kept
    pub num_binaries: u64,
    pub size_binaries: u64,
    /// Binaries unreferenced (deleted when the run was destructive)
    pub num_binaries_gc: u64,
    pub size_binaries_gc: u64,
}

#[derive(Debug, Default)]
struct GcState {
    started: Option<SystemTime>,
    marked: HashSet<String>,
    status: BinaryManagerStatus,
}

/// Mark-and-sweep collector for one [`BinaryManager`]
pub struct BinaryGarbageCollector {
    manager: Arc<BinaryManager>,
    state: Mutex<GcState>,
}

impl BinaryGarbageCollector {
    pub fn new(manager: Arc<BinaryManager>) -> Self {
        Self {
            manager,
            state: Mutex::new(GcState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, GcState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn start(&self) -> StorageResult<()> {
        let mut state = self.state();
        if state.started.is_some() {
            return Err(StorageError::invalid_state("binary GC already in progress"));
        }
        state.started = Some(SystemTime::now());
        state.marked.clear();
        state.status = BinaryManagerStatus::default();
        tracing::info!("binary GC started on {}", self.manager.root().display());
        Ok(())
    }

    /// Record a digest as still referenced
    pub fn mark(&self, digest: &str) {
        self.state().marked.insert(digest.to_string());
    }

    pub fn is_in_progress(&self) -> bool {
        self.state().started.is_some()
    }

    pub fn status(&self) -> BinaryManagerStatus {
        self.state().status
    }

    /// Sweep: count (and with `delete`, remove) unmarked binaries older
    /// than the start of the run
    pub async fn stop(&self, delete: bool) -> StorageResult<BinaryManagerStatus> {
        let (started, marked) = {
            let state = self.state();
            let Some(started) = state.started else {
                return Err(StorageError::invalid_state("binary GC not started"));
            };
            (started, state.marked.clone())
        };

        let mut status = BinaryManagerStatus::default();
        let result = self.sweep(started, &marked, delete, &mut status).await;

        let mut state = self.state();
        state.started = None;
        state.marked.clear();
        result?;
        state.status = status;
        tracing::info!(
            "binary GC done: {} kept ({} bytes), {} {} ({} bytes)",
            status.num_binaries,
            status.size_binaries,
            status.num_binaries_gc,
            if delete { "deleted" } else { "unreferenced" },
            status.size_binaries_gc
        );
        Ok(status)
    }

    async fn sweep(
        &self,
        started: SystemTime,
        marked: &HashSet<String>,
        delete: bool,
        status: &mut BinaryManagerStatus,
    ) -> StorageResult<()> {
        for (digest, size, modified) in self.manager.list().await? {
            if marked.contains(&digest) || modified > started {
                status.num_binaries += 1;
                status.size_binaries += size;
                continue;
            }
            status.num_binaries_gc += 1;
            status.size_binaries_gc += size;
            if delete {
                tokio::fs::remove_file(self.manager.path_for(&digest)?).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_is_content_addressed() {
        let dir = TempDir::new().unwrap();
        let manager = BinaryManager::open(dir.path()).await.unwrap();
        let a = manager.put(b"hello").await.unwrap();
        let b = manager.put(b"hello").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(
            a,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(manager.path_for(&a).unwrap().starts_with(dir.path().join("2c").join("f2")));
        assert_eq!(manager.get(&a).await.unwrap().unwrap(), b"hello");
        assert!(manager.get(&BinaryManager::digest(b"other")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_gc_keeps_marked() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(BinaryManager::open(dir.path()).await.unwrap());
        let keep = manager.put(b"keep").await.unwrap();
        let drop = manager.put(b"drop").await.unwrap();

        let gc = BinaryGarbageCollector::new(Arc::clone(&manager));
        gc.start().unwrap();
        assert!(gc.start().is_err());
        gc.mark(&keep);
        let status = gc.stop(true).await.unwrap();

        assert_eq!(status.num_binaries, 1);
        assert_eq!(status.num_binaries_gc, 1);
        assert_eq!(status.size_binaries_gc, 4);
        assert!(!gc.is_in_progress());
        assert!(manager.exists(&keep).await.unwrap());
        assert!(!manager.exists(&drop).await.unwrap());
    }

    #[test]
    fn test_path_for_rejects_non_digest() {
        let manager = BinaryManager {
            root: PathBuf::from("/tmp/x"),
        };
        assert!(manager.path_for("../etc/passwd").is_err());
    }
}
