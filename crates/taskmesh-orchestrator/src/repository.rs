use crate::types::{Dag, Query};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use taskmesh_core::{TaskmeshError, TaskmeshResult};
use taskmesh_memory::{BatchOp, KvStore};
use tracing::warn;
use uuid::Uuid;

/// Set of DAG ids whose query is still in flight.
pub const ACTIVE_DAGS_KEY: &str = "dags:active";

fn dag_key(dag_id: Uuid) -> String {
    format!("dag:{dag_id}")
}

/// A query and its DAG as written to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagRecord {
    pub query: Query,
    pub dag: Dag,
    /// Set once the query was cancelled; late reports are ignored.
    #[serde(default)]
    pub cancelled: bool,
}

impl DagRecord {
    /// Whether the query still needs scheduling after a restart.
    pub fn is_active(&self) -> bool {
        !self.query.status.is_terminal()
    }
}

/// Durable home for DAGs, so a restarted engine can pick up where the
/// previous one stopped.
#[async_trait]
pub trait DagRepository: Send + Sync {
    /// Write `record`, listing it as active until its query is terminal.
    async fn save(&self, record: &DagRecord) -> TaskmeshResult<()>;

    async fn load(&self, dag_id: Uuid) -> TaskmeshResult<Option<DagRecord>>;

    /// Every stored record whose query is not terminal.
    async fn list_active(&self) -> TaskmeshResult<Vec<DagRecord>>;

    /// Drop the record and its active listing.
    async fn remove(&self, dag_id: Uuid) -> TaskmeshResult<()>;
}

/// [`DagRepository`] over a [`KvStore`].
///
/// Each record is one JSON string under `dag:{id}`; the `dags:active` set
/// lists the unfinished ones. Record and listing change in one batch.
pub struct KvDagRepository {
    kv: Arc<dyn KvStore>,
    op_timeout: Duration,
}

impl KvDagRepository {
    pub fn new(kv: Arc<dyn KvStore>, op_timeout: Duration) -> Self {
        Self { kv, op_timeout }
    }

    async fn bounded<T>(
        &self,
        what: &str,
        fut: impl Future<Output = TaskmeshResult<T>>,
    ) -> TaskmeshResult<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TaskmeshError::StateStore(format!(
                "{what} timed out after {:?}",
                self.op_timeout
            ))),
        }
    }
}

#[async_trait]
impl DagRepository for KvDagRepository {
    async fn save(&self, record: &DagRecord) -> TaskmeshResult<()> {
        let dag_id = record.dag.id;
        let listing = if record.is_active() {
            BatchOp::SAdd {
                key: ACTIVE_DAGS_KEY.to_string(),
                member: dag_id.to_string(),
            }
        } else {
            BatchOp::SRem {
                key: ACTIVE_DAGS_KEY.to_string(),
                member: dag_id.to_string(),
            }
        };
        let ops = vec![
            BatchOp::Set {
                key: dag_key(dag_id),
                value: serde_json::to_string(record)?,
            },
            listing,
        ];
        self.bounded("save_dag", self.kv.batch(ops)).await
    }

    async fn load(&self, dag_id: Uuid) -> TaskmeshResult<Option<DagRecord>> {
        let raw = self.bounded("load_dag", self.kv.get(&dag_key(dag_id))).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(TaskmeshError::from))
            .transpose()
    }

    async fn list_active(&self) -> TaskmeshResult<Vec<DagRecord>> {
        let ids = self
            .bounded("list_active_dags", self.kv.smembers(ACTIVE_DAGS_KEY))
            .await?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(dag_id) = Uuid::parse_str(&id) else {
                warn!(member = %id, "Skipping malformed active DAG id");
                continue;
            };
            match self.load(dag_id).await {
                Ok(Some(record)) if record.is_active() => records.push(record),
                Ok(Some(_)) => {}
                Ok(None) => warn!(dag_id = %dag_id, "Active DAG has no stored record"),
                Err(e @ TaskmeshError::Json(_)) => {
                    warn!(dag_id = %dag_id, error = %e, "Skipping unreadable DAG record")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn remove(&self, dag_id: Uuid) -> TaskmeshResult<()> {
        let ops = vec![
            BatchOp::Delete(dag_key(dag_id)),
            BatchOp::SRem {
                key: ACTIVE_DAGS_KEY.to_string(),
                member: dag_id.to_string(),
            },
        ];
        self.bounded("remove_dag", self.kv.batch(ops)).await
    }
}
