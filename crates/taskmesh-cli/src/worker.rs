use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskmesh_channels::{AgentEndpoint, MessageBus};
use taskmesh_core::{TaskDispatch, TaskmeshResult};
use taskmesh_memory::AgentStore;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{info, warn};

/// In-process agent that completes every assignment after a fixed delay,
/// recording each one in its memory log.
pub struct SimulatedAgent {
    endpoint: AgentEndpoint,
    store: Arc<AgentStore>,
    fail: Arc<HashSet<String>>,
    work: Duration,
}

impl SimulatedAgent {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: Arc<AgentStore>,
        agent_id: impl Into<String>,
        capabilities: Vec<String>,
        fail: Arc<HashSet<String>>,
        work: Duration,
    ) -> Self {
        Self {
            endpoint: AgentEndpoint::new(bus, agent_id, capabilities),
            store,
            fail,
            work,
        }
    }

    /// Subscribe, then serve assignments and heartbeat until aborted.
    pub async fn spawn(self, heartbeat: Duration) -> TaskmeshResult<Vec<JoinHandle<()>>> {
        let mut assignments = self.endpoint.assignments().await?;
        let beats = self.endpoint.spawn_heartbeat(heartbeat);
        let agent = Arc::new(self);
        let serve = tokio::spawn(async move {
            while let Some(dispatch) = assignments.next().await {
                let agent = agent.clone();
                tokio::spawn(async move { agent.handle(dispatch).await });
            }
        });
        Ok(vec![beats, serve])
    }

    async fn handle(&self, dispatch: TaskDispatch) {
        let agent_id = self.endpoint.agent_id();
        if let Err(e) = self.endpoint.acknowledge(dispatch.task_id).await {
            warn!(agent = agent_id, task = %dispatch.name, error = %e, "Acknowledge failed");
            return;
        }
        let started = Instant::now();
        tokio::time::sleep(self.work / 2).await;
        if let Err(e) = self.endpoint.progress(dispatch.task_id, 50.0).await {
            warn!(agent = agent_id, task = %dispatch.name, error = %e, "Progress report failed");
        }
        tokio::time::sleep(self.work / 2).await;

        if let Err(e) = self
            .store
            .append_memory(
                agent_id,
                "task",
                json!({ "task": dispatch.name, "type": dispatch.task_type }),
            )
            .await
        {
            warn!(agent = agent_id, error = %e, "Could not record task in memory");
        }

        let elapsed = started.elapsed().as_millis() as u64;
        let outcome = if self.fail.contains(&dispatch.name) {
            self.endpoint
                .fail(dispatch.task_id, format!("simulated failure of '{}'", dispatch.name))
                .await
        } else {
            let result = json!({
                "task": dispatch.name,
                "agent": agent_id,
                "parameters": dispatch.parameters,
            });
            self.endpoint
                .complete(dispatch.task_id, result, Some(elapsed))
                .await
        };
        if let Err(e) = outcome {
            warn!(agent = agent_id, task = %dispatch.name, error = %e, "Report failed");
            return;
        }

        let state = json!({ "last_task": dispatch.name, "load": self.endpoint.load() });
        if let Err(e) = self.store.set_state(agent_id, state, None).await {
            warn!(agent = agent_id, error = %e, "Could not store agent state");
        }
        info!(agent = agent_id, task = %dispatch.name, elapsed_ms = elapsed, "Simulated task done");
    }
}
