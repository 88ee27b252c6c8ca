use crate::file::FileKvStore;
use crate::kv::{InMemoryKvStore, KvStore};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use taskmesh_core::{RetryPolicy, TaskmeshError, TaskmeshResult};

/// Which [`KvStore`] implementation backs the agent store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local, lost on exit.
    #[default]
    Memory,
    /// JSON snapshot on disk at [`StoreConfig::path`].
    File,
}

/// `[store]` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Snapshot location for the file backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// TTL applied to agent state when the caller passes none.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Upper bound on a single backend call.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_ttl_secs() -> u64 {
    3600
}
fn default_op_timeout_ms() -> u64 {
    2_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: None,
            default_ttl_secs: default_ttl_secs(),
            op_timeout_ms: default_op_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Build the key-value store described by `config`.
pub async fn open_store(config: &StoreConfig) -> TaskmeshResult<Arc<dyn KvStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryKvStore::new())),
        StoreBackend::File => {
            let path = config.path.clone().ok_or_else(|| {
                TaskmeshError::Config("store.path is required for the file backend".into())
            })?;
            Ok(Arc::new(FileKvStore::open(path).await?))
        }
    }
}
