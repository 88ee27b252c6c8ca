use crate::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topic the dispatcher publishes task assignments on.
pub const TOPIC_DISPATCH: &str = "task.dispatch";
/// Topic agents publish task status updates on.
pub const TOPIC_STATUS: &str = "task.status";
/// Topic agents publish liveness/capability/load reports on.
pub const TOPIC_HEARTBEAT: &str = "agent.heartbeat";

/// Assignment of one task to one agent, published on [`TOPIC_DISPATCH`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDispatch {
    /// The task being handed out.
    pub task_id: Uuid,
    /// DAG the task belongs to.
    pub dag_id: Uuid,
    /// Agent selected to run the task.
    pub agent_id: String,
    /// Human-readable task name.
    pub name: String,
    /// Task-type tag used by agents to pick a handler.
    pub task_type: String,
    /// Free-form parameters, validated by the agent's handler, not the core.
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Capabilities the task requires.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Upper bound on execution time before the task is failed.
    pub timeout_secs: u64,
}

/// Status report from an agent, published on [`TOPIC_STATUS`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// The task the report is about.
    pub task_id: Uuid,
    /// Reporting agent. When present it must match the current assignee.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// New status requested by the agent.
    pub status: TaskStatus,
    /// Result payload for completed tasks.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Error description for failed tasks.
    #[serde(default)]
    pub error: Option<String>,
    /// Optional progress percentage (0-100).
    #[serde(default)]
    pub progress: Option<f32>,
    /// Optional execution duration in milliseconds.
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl StatusUpdate {
    /// Creates a bare update with no result, error or progress.
    pub fn new(task_id: Uuid, status: TaskStatus) -> Self {
        Self {
            task_id,
            agent_id: None,
            status,
            result: None,
            error: None,
            progress: None,
            duration_ms: None,
        }
    }

    /// Creates a `running` update from the given agent.
    pub fn running(task_id: Uuid, agent_id: impl Into<String>) -> Self {
        Self::new(task_id, TaskStatus::Running).from_agent(agent_id)
    }

    /// Creates a `completed` update carrying a result payload.
    pub fn completed(task_id: Uuid, result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::new(task_id, TaskStatus::Completed)
        }
    }

    /// Creates a `failed` update carrying an error description.
    pub fn failed(task_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(task_id, TaskStatus::Failed)
        }
    }

    /// Attributes the update to an agent.
    pub fn from_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

/// Periodic liveness report, published on [`TOPIC_HEARTBEAT`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Reporting agent.
    pub agent_id: String,
    /// Capability tags the agent offers.
    pub capabilities: Vec<String>,
    /// Number of tasks the agent currently has in flight.
    pub load: u32,
    /// When the agent produced the report.
    pub timestamp: DateTime<Utc>,
}

impl Heartbeat {
    /// Creates a heartbeat stamped with the current time.
    pub fn new(agent_id: impl Into<String>, capabilities: Vec<String>, load: u32) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities,
            load,
            timestamp: Utc::now(),
        }
    }
}
