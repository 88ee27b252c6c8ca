use crate::kv::{BatchOp, InMemoryKvStore, KvStore, Snapshot};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use taskmesh_core::{TaskmeshError, TaskmeshResult};
use tokio::sync::Mutex;

/// File-backed [`KvStore`] that persists a JSON snapshot on disk.
///
/// Loads the snapshot into memory on open and rewrites it after every
/// mutation, so agent state and memory survive a process restart. Expiry is
/// stored as an absolute timestamp and keeps counting while the process is
/// down.
pub struct FileKvStore {
    path: PathBuf,
    inner: InMemoryKvStore,
    write_lock: Mutex<()>,
}

impl FileKvStore {
    /// Open the store at `path`, loading an existing snapshot if present.
    pub async fn open(path: PathBuf) -> TaskmeshResult<Self> {
        let inner = if tokio::fs::try_exists(&path).await? {
            let data = tokio::fs::read_to_string(&path).await.map_err(|e| {
                TaskmeshError::StateStore(format!("Failed to read store file: {e}"))
            })?;
            if data.trim().is_empty() {
                InMemoryKvStore::new()
            } else {
                let snapshot: Snapshot = serde_json::from_str(&data).map_err(|e| {
                    TaskmeshError::StateStore(format!("Corrupt store file: {e}"))
                })?;
                InMemoryKvStore::from_snapshot(snapshot)
            }
        } else {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    TaskmeshError::StateStore(format!("Failed to create dir: {e}"))
                })?;
            }
            InMemoryKvStore::new()
        };

        tracing::debug!(path = %path.display(), keys = inner.len(), "Opened file store");
        Ok(Self {
            path,
            inner,
            write_lock: Mutex::new(()),
        })
    }

    /// A private copy of the current contents for the next write.
    fn stage(&self) -> InMemoryKvStore {
        InMemoryKvStore::from_snapshot(self.inner.snapshot())
    }

    /// Persist `staged`, then make it the visible contents. A failed write
    /// leaves both the file and the visible contents as they were.
    async fn commit(&self, staged: InMemoryKvStore) -> TaskmeshResult<()> {
        let snapshot = staged.into_snapshot();
        self.persist(&snapshot).await?;
        self.inner.replace(snapshot);
        Ok(())
    }

    /// Rewrite the snapshot file. Writes to a sibling temp file first and
    /// renames it into place so readers never see a half-written file.
    async fn persist(&self, snapshot: &Snapshot) -> TaskmeshResult<()> {
        let data = serde_json::to_vec(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| TaskmeshError::StateStore(format!("Failed to write store file: {e}")))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| TaskmeshError::StateStore(format!("Failed to replace store file: {e}")))?;
        Ok(())
    }
}

/// Mutations run against a staged copy under the write lock; reads go
/// straight to the published contents.
#[async_trait]
impl KvStore for FileKvStore {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> TaskmeshResult<()> {
        let _guard = self.write_lock.lock().await;
        let staged = self.stage();
        staged.set(key, value, ttl).await?;
        self.commit(staged).await
    }

    async fn get(&self, key: &str) -> TaskmeshResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> TaskmeshResult<bool> {
        let _guard = self.write_lock.lock().await;
        let staged = self.stage();
        let existed = staged.delete(key).await?;
        if existed {
            self.commit(staged).await?;
        }
        Ok(existed)
    }

    async fn zadd(&self, key: &str, score: f64, member: String) -> TaskmeshResult<()> {
        let _guard = self.write_lock.lock().await;
        let staged = self.stage();
        staged.zadd(key, score, member).await?;
        self.commit(staged).await
    }

    async fn zrange(&self, key: &str, limit: usize, reverse: bool) -> TaskmeshResult<Vec<String>> {
        self.inner.zrange(key, limit, reverse).await
    }

    async fn sadd(&self, key: &str, member: String) -> TaskmeshResult<()> {
        let _guard = self.write_lock.lock().await;
        let staged = self.stage();
        staged.sadd(key, member).await?;
        self.commit(staged).await
    }

    async fn smembers(&self, key: &str) -> TaskmeshResult<Vec<String>> {
        self.inner.smembers(key).await
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> TaskmeshResult<()> {
        let _guard = self.write_lock.lock().await;
        let staged = self.stage();
        staged.batch(ops).await?;
        self.commit(staged).await
    }

    async fn ping(&self) -> TaskmeshResult<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::metadata(&dir)
            .await
            .map(|_| ())
            .map_err(|e| TaskmeshError::StateStore(format!("Store directory unavailable: {e}")))
    }
}
