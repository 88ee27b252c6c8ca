//! Query orchestration: DAG construction, scheduling and agent dispatch.
//!
//! A query is decomposed by a [`Planner`] into task specifications, which
//! [`DagBuilder`] validates into a [`Dag`]. The [`Scheduler`] owns every
//! status change on that DAG, the [`Dispatcher`] places ready tasks on
//! agents tracked by the [`AgentRegistry`], and the [`Orchestrator`] ties
//! them together with the message bus consumers.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Query lifecycle, inbound messages and dispatch loop.
//! - [`DagBuilder`] / [`TaskSpec`] — Validated DAG construction.
//! - [`Scheduler`] — Ready-set computation and status transitions.
//! - [`Dispatcher`] — Capability matching and assignment publishing.
//! - [`HealthAggregator`] — Store and bus checks rolled into one status.
//! - [`DagRepository`] — Durable DAGs for resuming after a restart.

/// DAG construction from task specifications.
pub mod builder;
/// `[orchestrator]` configuration section.
pub mod config;
/// Dispatch passes and pacing.
pub mod dispatcher;
/// The orchestration engine.
pub mod engine;
/// Component health aggregation.
pub mod health;
/// Heartbeat-driven agent registry.
pub mod registry;
/// DAG persistence for restart recovery.
pub mod repository;
/// Task state machine and ready-set computation.
pub mod scheduler;
/// Queries, tasks and DAGs.
pub mod types;

pub use builder::{DagBuilder, TaskSpec, UpstreamRef};
pub use config::OrchestratorConfig;
pub use dispatcher::{DispatchBackoff, Dispatcher, PassReport};
pub use engine::{EngineHandle, Orchestrator, Planner, QuerySubmission, StaticPlanner, SubmitMode};
pub use health::{ComponentHealth, HealthAggregator, HealthReport, HealthStatus, DATABASE_COMPONENT};
pub use registry::{AgentInfo, AgentRegistry};
pub use repository::{DagRecord, DagRepository, KvDagRepository, ACTIVE_DAGS_KEY};
pub use scheduler::{Applied, FailurePolicy, Scheduler};
pub use types::{Dag, Query, QueryStatus, Task, DEFAULT_TASK_TIMEOUT_SECS};
