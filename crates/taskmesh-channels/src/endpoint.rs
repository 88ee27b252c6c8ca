use crate::bus::{publish_json, MessageBus};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskmesh_core::{
    Heartbeat, StatusUpdate, TaskDispatch, TaskmeshResult, TOPIC_DISPATCH, TOPIC_HEARTBEAT,
    TOPIC_STATUS,
};
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

/// Stream of task assignments addressed to one agent.
pub type AssignmentStream = Pin<Box<dyn Stream<Item = TaskDispatch> + Send>>;

/// Agent-side view of the bus.
///
/// Filters dispatches down to this agent, publishes heartbeats carrying the
/// current in-flight count, and reports status transitions attributed to
/// this agent.
#[derive(Clone)]
pub struct AgentEndpoint {
    agent_id: String,
    capabilities: Vec<String>,
    bus: Arc<dyn MessageBus>,
    load: Arc<AtomicU32>,
}

impl AgentEndpoint {
    pub fn new(bus: Arc<dyn MessageBus>, agent_id: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities,
            bus,
            load: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Tasks currently acknowledged but not yet finished.
    pub fn load(&self) -> u32 {
        self.load.load(Ordering::SeqCst)
    }

    /// Subscribe to dispatches for this agent.
    pub async fn assignments(&self) -> TaskmeshResult<AssignmentStream> {
        let agent_id = self.agent_id.clone();
        let stream = self
            .bus
            .subscribe(TOPIC_DISPATCH)
            .await?
            .into_stream()
            .filter_map(move |env| match env.decode::<TaskDispatch>() {
                Ok(dispatch) if dispatch.agent_id == agent_id => Some(dispatch),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(agent = %agent_id, error = %e, "Malformed dispatch");
                    None
                }
            });
        Ok(Box::pin(stream))
    }

    pub async fn heartbeat(&self) -> TaskmeshResult<()> {
        let hb = Heartbeat::new(self.agent_id.clone(), self.capabilities.clone(), self.load());
        publish_json(self.bus.as_ref(), TOPIC_HEARTBEAT, &hb).await
    }

    /// Publish a heartbeat every `interval` until the handle is aborted.
    /// Failed publishes are logged and retried on the next tick.
    pub fn spawn_heartbeat(&self, interval: Duration) -> JoinHandle<()> {
        let endpoint = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = endpoint.heartbeat().await {
                    tracing::warn!(agent = %endpoint.agent_id, error = %e, "Heartbeat failed");
                }
            }
        })
    }

    /// Acknowledge pickup: reports `running` and counts the task as load.
    pub async fn acknowledge(&self, task_id: Uuid) -> TaskmeshResult<()> {
        self.report(StatusUpdate::running(task_id, self.agent_id.clone()))
            .await?;
        self.load.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub async fn progress(&self, task_id: Uuid, percent: f32) -> TaskmeshResult<()> {
        let mut update = StatusUpdate::running(task_id, self.agent_id.clone());
        update.progress = Some(percent.clamp(0.0, 100.0));
        self.report(update).await
    }

    pub async fn complete(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
        duration_ms: Option<u64>,
    ) -> TaskmeshResult<()> {
        let mut update = StatusUpdate::completed(task_id, result).from_agent(self.agent_id.clone());
        update.duration_ms = duration_ms;
        self.finish(update).await
    }

    pub async fn fail(&self, task_id: Uuid, error: impl Into<String>) -> TaskmeshResult<()> {
        let update = StatusUpdate::failed(task_id, error).from_agent(self.agent_id.clone());
        self.finish(update).await
    }

    async fn finish(&self, update: StatusUpdate) -> TaskmeshResult<()> {
        self.report(update).await?;
        let _ = self
            .load
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        Ok(())
    }

    /// Publish an arbitrary status update on [`TOPIC_STATUS`].
    pub async fn report(&self, update: StatusUpdate) -> TaskmeshResult<()> {
        publish_json(self.bus.as_ref(), TOPIC_STATUS, &update).await
    }
}
