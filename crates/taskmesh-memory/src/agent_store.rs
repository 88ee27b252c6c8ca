use crate::config::StoreConfig;
use crate::kv::{BatchOp, KvStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskmesh_core::{retry, TaskmeshError, TaskmeshResult};
use tracing::{debug, warn};

/// Entry type used by the single-blob memory adapter.
pub const LEGACY_MEMORY_TYPE: &str = "legacy";

/// Durable state blob for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Arbitrary agent-defined state.
    pub data: serde_json::Value,
    /// Server-assigned time of the last write.
    pub last_updated: DateTime<Utc>,
}

/// One entry in an agent's time-ordered memory log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Timestamp rendered with microsecond precision, unique per store.
    pub id: String,
    /// Entry type tag, e.g. `observation` or `message`.
    #[serde(rename = "type")]
    pub entry_type: String,
    /// Seconds since the Unix epoch, used directly as the sort score.
    pub timestamp: f64,
    /// Entry payload.
    pub data: serde_json::Value,
}

/// Which memory logs [`AgentStore::clear_memory`] removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryScope {
    /// A single entry type.
    Type(String),
    /// Every type plus the type index, atomically.
    All,
}

fn state_key(agent_id: &str) -> String {
    format!("agent:{agent_id}:state")
}

fn memory_key(agent_id: &str, entry_type: &str) -> String {
    format!("agent:{agent_id}:memory:{entry_type}")
}

fn types_key(agent_id: &str) -> String {
    format!("agent:{agent_id}:memory:types")
}

/// Agent state and memory over a [`KvStore`].
///
/// Every backend call is bounded by the configured operation timeout and
/// retried with backoff on transient failure. Timeouts surface as
/// [`TaskmeshError::StateStore`].
pub struct AgentStore {
    kv: Arc<dyn KvStore>,
    default_ttl: Duration,
    op_timeout: Duration,
    retry: taskmesh_core::RetryPolicy,
    last_score_micros: AtomicI64,
}

impl AgentStore {
    pub fn new(kv: Arc<dyn KvStore>, config: &StoreConfig) -> Self {
        Self {
            kv,
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            op_timeout: Duration::from_millis(config.op_timeout_ms),
            retry: config.retry.clone(),
            last_score_micros: AtomicI64::new(0),
        }
    }

    /// The backing key-value store.
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    async fn call<T, F, Fut>(&self, what: &str, mut op: F) -> TaskmeshResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TaskmeshResult<T>>,
    {
        let timeout = self.op_timeout;
        retry(&self.retry, what, || {
            let fut = op();
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(TaskmeshError::StateStore(format!(
                        "{what} timed out after {timeout:?}"
                    ))),
                }
            }
        })
        .await
    }

    /// Strictly increasing microsecond score, so burst writes never collide.
    fn next_score_micros(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let mut last = self.last_score_micros.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self.last_score_micros.compare_exchange(
                last,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }

    // --- Agent state ---

    /// Overwrite an agent's state. `ttl` defaults to the configured TTL; a
    /// zero TTL stores the state without expiry.
    pub async fn set_state(
        &self,
        agent_id: &str,
        data: serde_json::Value,
        ttl: Option<Duration>,
    ) -> TaskmeshResult<AgentState> {
        let state = AgentState {
            data,
            last_updated: Utc::now(),
        };
        let json = serde_json::to_string(&state)?;
        let key = state_key(agent_id);
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.call("set_state", || self.kv.set(&key, json.clone(), Some(ttl)))
            .await?;
        debug!(agent = agent_id, ttl_secs = ttl.as_secs(), "Agent state stored");
        Ok(state)
    }

    /// Fetch an agent's state, or `None` if absent or expired.
    pub async fn get_state(&self, agent_id: &str) -> TaskmeshResult<Option<AgentState>> {
        let key = state_key(agent_id);
        let raw = self.call("get_state", || self.kv.get(&key)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Delete an agent's state. Returns whether it existed.
    pub async fn delete_state(&self, agent_id: &str) -> TaskmeshResult<bool> {
        let key = state_key(agent_id);
        self.call("delete_state", || self.kv.delete(&key)).await
    }

    // --- Agent memory ---

    /// Append an entry to the agent's log for `entry_type` and register the
    /// type in the agent's type index, in one atomic batch.
    pub async fn append_memory(
        &self,
        agent_id: &str,
        entry_type: &str,
        data: serde_json::Value,
    ) -> TaskmeshResult<MemoryEntry> {
        let micros = self.next_score_micros();
        let timestamp = micros as f64 / 1_000_000.0;
        let entry = MemoryEntry {
            id: format!("{timestamp:.6}"),
            entry_type: entry_type.to_string(),
            timestamp,
            data,
        };
        let ops = vec![
            BatchOp::ZAdd {
                key: memory_key(agent_id, entry_type),
                score: timestamp,
                member: serde_json::to_string(&entry)?,
            },
            BatchOp::SAdd {
                key: types_key(agent_id),
                member: entry_type.to_string(),
            },
        ];
        self.call("append_memory", || self.kv.batch(ops.clone()))
            .await?;
        Ok(entry)
    }

    /// Up to `limit` entries of one type, newest first when `newest_first`.
    pub async fn query_memory(
        &self,
        agent_id: &str,
        entry_type: &str,
        limit: usize,
        newest_first: bool,
    ) -> TaskmeshResult<Vec<MemoryEntry>> {
        let key = memory_key(agent_id, entry_type);
        let raw = self
            .call("query_memory", || self.kv.zrange(&key, limit, newest_first))
            .await?;
        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(TaskmeshError::from))
            .collect()
    }

    /// Newest entries of every known type, keyed by type. Types whose log is
    /// empty are left out.
    pub async fn get_all_memory(
        &self,
        agent_id: &str,
        limit_per_type: usize,
    ) -> TaskmeshResult<BTreeMap<String, Vec<MemoryEntry>>> {
        let key = types_key(agent_id);
        let types = self.call("memory_types", || self.kv.smembers(&key)).await?;
        let mut all = BTreeMap::new();
        for entry_type in types {
            let entries = self
                .query_memory(agent_id, &entry_type, limit_per_type, true)
                .await?;
            if !entries.is_empty() {
                all.insert(entry_type, entries);
            }
        }
        Ok(all)
    }

    /// Clear one type's log, or every log plus the type index.
    ///
    /// Returns whether anything was removed for a single type; `All` always
    /// returns `true` once the batch is applied.
    pub async fn clear_memory(&self, agent_id: &str, scope: MemoryScope) -> TaskmeshResult<bool> {
        match scope {
            MemoryScope::Type(entry_type) => {
                let key = memory_key(agent_id, &entry_type);
                self.call("clear_memory", || self.kv.delete(&key)).await
            }
            MemoryScope::All => {
                let op = BatchOp::DeleteIndexed {
                    index: types_key(agent_id),
                    prefix: memory_key(agent_id, ""),
                };
                self.call("clear_all_memory", || self.kv.batch(vec![op.clone()]))
                    .await?;
                debug!(agent = agent_id, "Cleared all agent memory");
                Ok(true)
            }
        }
    }

    // --- Single-blob adapter ---

    /// Record a whole-memory blob. Stored as a `legacy` log entry so it
    /// shares the type index and atomic clear with every other type.
    pub async fn update_agent_memory(
        &self,
        agent_id: &str,
        memory: serde_json::Value,
    ) -> TaskmeshResult<()> {
        self.append_memory(agent_id, LEGACY_MEMORY_TYPE, memory)
            .await
            .map(|_| ())
    }

    /// The most recent whole-memory blob, if any.
    pub async fn get_agent_memory(&self, agent_id: &str) -> TaskmeshResult<Option<serde_json::Value>> {
        let latest = self
            .query_memory(agent_id, LEGACY_MEMORY_TYPE, 1, true)
            .await?;
        Ok(latest.into_iter().next().map(|e| e.data))
    }

    /// Reachability of the backing store, bounded by the operation timeout.
    pub async fn ping(&self) -> TaskmeshResult<()> {
        match tokio::time::timeout(self.op_timeout, self.kv.ping()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("State store ping timed out");
                Err(TaskmeshError::StateStore("ping timed out".into()))
            }
        }
    }
}
