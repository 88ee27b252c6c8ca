//! Core types and error definitions for the taskmesh orchestration engine.
//!
//! This crate holds what every other taskmesh crate agrees on: the error
//! kinds, the task status lifecycle, retry/backoff policy, and the payloads
//! exchanged over the message bus.
//!
//! # Main types
//!
//! - [`TaskmeshError`] — Unified error enum, one variant per failure kind.
//! - [`ValidationError`] — Structural problems found while building a DAG.
//! - [`TaskmeshResult`] — Convenience alias for `Result<T, TaskmeshError>`.
//! - [`TaskStatus`] — Lifecycle state of a task inside a DAG.
//! - [`RetryPolicy`] — Capped exponential backoff for transient failures.

/// Payloads published on the message bus topics.
pub mod message;
/// Retry policy and backoff helpers.
pub mod retry;

pub use message::{
    Heartbeat, StatusUpdate, TaskDispatch, TOPIC_DISPATCH, TOPIC_HEARTBEAT, TOPIC_STATUS,
};
pub use retry::{retry, RetryPolicy};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Error types ---

/// Structural problems detected while turning a task list into a DAG.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The dependency relation contains at least one cycle.
    #[error("dependency cycle among tasks: {}", .tasks.join(", "))]
    Cycle {
        /// Names of every task left with unresolved in-degree.
        tasks: Vec<String>,
    },

    /// Two task specifications share a name.
    #[error("duplicate task name '{0}'")]
    DuplicateName(String),

    /// An upstream reference names a task that does not exist.
    #[error("task '{task}' references unknown upstream '{reference}'")]
    DanglingReference {
        /// The task that declared the reference.
        task: String,
        /// The unresolved reference as written.
        reference: String,
    },

    /// A task lists itself as an upstream dependency.
    #[error("task '{0}' depends on itself")]
    SelfReference(String),

    /// A structural edit named a task id not present in the DAG.
    #[error("task {0} is not part of this DAG")]
    UnknownTask(Uuid),
}

/// Top-level error type for taskmesh.
///
/// Each variant corresponds to one failure kind the orchestrator
/// distinguishes when deciding whether to retry, ignore, or fail a query.
#[derive(Debug, thiserror::Error)]
pub enum TaskmeshError {
    /// A malformed or cyclic DAG was rejected at build time.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A status update would move a task backwards or sideways.
    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        /// The task the update targeted.
        task: Uuid,
        /// Status at the time the update arrived.
        from: TaskStatus,
        /// Status the update asked for.
        to: TaskStatus,
    },

    /// No eligible agent could be found within the retry budget.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// The state store was unreachable or an operation failed.
    #[error("State store error: {0}")]
    StateStore(String),

    /// Publishing to or subscribing on the message bus failed.
    #[error("Channel error: {0}")]
    Channel(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A query, DAG or task lookup came up empty.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskmeshError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Store, channel and I/O failures are transient. Everything else is
    /// structural and should surface to the owning query instead.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TaskmeshError::StateStore(_) | TaskmeshError::Channel(_) | TaskmeshError::Io(_)
        )
    }
}

/// A convenience `Result` alias using [`TaskmeshError`].
pub type TaskmeshResult<T> = Result<T, TaskmeshError>;

// --- Task status ---

/// Lifecycle state of a task.
///
/// Forward order is `pending → assigned → running → completed | failed`.
/// `skipped` is reached only from a non-terminal state through cascade or
/// cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for upstream tasks or for an eligible agent.
    Pending,
    /// Published to an agent, pickup not yet acknowledged.
    Assigned,
    /// The agent acknowledged and is executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Never ran because an upstream failed or the query was cancelled.
    Skipped,
}

impl TaskStatus {
    /// Position along the forward lifecycle. Terminal states share the top rank.
    pub fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Assigned => 1,
            TaskStatus::Running => 2,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped => 3,
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}
