use crate::config::OrchestratorConfig;
use crate::registry::AgentRegistry;
use crate::scheduler::Scheduler;
use crate::types::Dag;
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use taskmesh_channels::{publish_json, MessageBus};
use taskmesh_core::{TaskDispatch, TaskStatus, TaskmeshError, TOPIC_DISPATCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Paces dispatch passes. Passes that fail to place ready work double the
/// delay up to a cap; any progress resets it. Tasks themselves are never
/// delayed beyond the pass rate.
#[derive(Debug, Clone)]
pub struct DispatchBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl DispatchBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    pub fn current(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Feed back the result of a pass and get the delay before the next.
    pub fn record(&mut self, report: &PassReport) -> Duration {
        if report.stalled() {
            if self.current() < self.max {
                self.attempt += 1;
            }
        } else {
            self.attempt = 0;
        }
        self.current()
    }
}

/// What one dispatch pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub dispatched: usize,
    /// Ready tasks with no eligible agent this pass.
    pub unassignable: usize,
    /// Tasks failed because their pass budget ran out.
    pub exhausted: usize,
    pub publish_failures: usize,
    /// Assignments returned to pending after the ack timeout.
    pub reclaimed: usize,
    /// Running tasks failed for exceeding their own timeout.
    pub timed_out: usize,
}

impl PassReport {
    /// Ready work existed but none of it could be placed.
    pub fn stalled(&self) -> bool {
        self.dispatched == 0 && (self.unassignable > 0 || self.publish_failures > 0)
    }

    /// Whether the pass moved any task to a new status.
    pub fn changed(&self) -> bool {
        self.dispatched + self.exhausted + self.reclaimed + self.timed_out > 0
    }

    pub fn merge(&mut self, other: &PassReport) {
        self.dispatched += other.dispatched;
        self.unassignable += other.unassignable;
        self.exhausted += other.exhausted;
        self.publish_failures += other.publish_failures;
        self.reclaimed += other.reclaimed;
        self.timed_out += other.timed_out;
    }
}

/// Matches ready tasks to agents and publishes assignments.
pub struct Dispatcher {
    bus: Arc<dyn MessageBus>,
    registry: Arc<AgentRegistry>,
    scheduler: Scheduler,
    ack_timeout: Duration,
    io_timeout: Duration,
    max_passes: u32,
    /// Consecutive passes each ready task went without an eligible agent.
    misses: Mutex<HashMap<Uuid, u32>>,
}

impl Dispatcher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<AgentRegistry>,
        scheduler: Scheduler,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            bus,
            registry,
            scheduler,
            ack_timeout: config.ack_timeout(),
            io_timeout: config.io_timeout(),
            max_passes: config.max_dispatch_passes,
            misses: Mutex::new(HashMap::new()),
        }
    }

    /// Run one pass over `dag`: reclaim stale assignments, fail overdue
    /// tasks, then place and publish every ready task.
    ///
    /// The caller holds the DAG exclusively for the whole pass, so agent
    /// acknowledgements are applied only after the assignment is recorded.
    pub async fn run_pass(&self, dag: &mut Dag) -> PassReport {
        let mut report = PassReport::default();
        self.reclaim_unacknowledged(dag, &mut report).await;
        self.fail_overdue(dag, &mut report).await;

        let mut planned: Vec<TaskDispatch> = Vec::new();
        for task_id in self.scheduler.compute_ready(dag) {
            let Some(task) = dag.task(task_id) else { continue };
            match self.registry.reserve(&task.capabilities).await {
                Some(agent_id) => {
                    self.misses.lock().remove(&task_id);
                    planned.push(TaskDispatch {
                        task_id,
                        dag_id: dag.id,
                        agent_id,
                        name: task.name.clone(),
                        task_type: task.task_type.clone(),
                        parameters: task.parameters.clone(),
                        capabilities: task.capabilities.iter().cloned().collect(),
                        timeout_secs: task.timeout_secs,
                    });
                }
                None => {
                    let misses = {
                        let mut map = self.misses.lock();
                        let n = map.entry(task_id).or_insert(0);
                        *n += 1;
                        *n
                    };
                    if misses >= self.max_passes {
                        self.misses.lock().remove(&task_id);
                        let err = TaskmeshError::Dispatch(format!(
                            "no eligible agent for task '{}' (requires {:?}) after {misses} passes",
                            task.name, task.capabilities
                        ));
                        warn!(task_id = %task_id, error = %err, "Dispatch budget exhausted");
                        if self.scheduler.fail_task(dag, task_id, err.to_string()).is_ok() {
                            report.exhausted += 1;
                        }
                    } else {
                        debug!(task_id = %task_id, misses, "No eligible agent");
                        report.unassignable += 1;
                    }
                }
            }
        }

        if planned.is_empty() {
            return report;
        }

        let bus = self.bus.as_ref();
        let io_timeout = self.io_timeout;
        let results = join_all(planned.iter().map(|d| async move {
            match tokio::time::timeout(io_timeout, publish_json(bus, TOPIC_DISPATCH, d)).await {
                Ok(result) => result,
                Err(_) => Err(TaskmeshError::Channel(format!(
                    "publish timed out after {io_timeout:?}"
                ))),
            }
        }))
        .await;

        for (dispatch, result) in planned.iter().zip(results) {
            match result {
                Ok(()) => match self.scheduler.mark_assigned(dag, dispatch.task_id, &dispatch.agent_id) {
                    Ok(()) => {
                        info!(
                            task_id = %dispatch.task_id,
                            agent = %dispatch.agent_id,
                            task = %dispatch.name,
                            "Task dispatched"
                        );
                        report.dispatched += 1;
                    }
                    Err(e) => {
                        warn!(task_id = %dispatch.task_id, error = %e, "Dispatched task no longer assignable");
                        self.registry.release(&dispatch.agent_id).await;
                    }
                },
                Err(e) => {
                    warn!(task_id = %dispatch.task_id, agent = %dispatch.agent_id, error = %e, "Dispatch publish failed");
                    self.registry.release(&dispatch.agent_id).await;
                    report.publish_failures += 1;
                }
            }
        }
        report
    }

    async fn reclaim_unacknowledged(&self, dag: &mut Dag, report: &mut PassReport) {
        let Ok(ack_timeout) = chrono::Duration::from_std(self.ack_timeout) else {
            return;
        };
        let cutoff = Utc::now() - ack_timeout;
        let overdue: Vec<Uuid> = dag
            .tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Assigned && t.assigned_at.is_some_and(|at| at < cutoff))
            .map(|t| t.id)
            .collect();
        for task_id in overdue {
            if let Ok(agent) = self.scheduler.reclaim(dag, task_id) {
                warn!(task_id = %task_id, agent = ?agent, "Assignment not acknowledged, returning task to pool");
                if let Some(agent) = agent {
                    self.registry.release(&agent).await;
                }
                report.reclaimed += 1;
            }
        }
    }

    async fn fail_overdue(&self, dag: &mut Dag, report: &mut PassReport) {
        let now = Utc::now();
        let overdue: Vec<(Uuid, u64)> = dag
            .tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Running)
            .filter_map(|t| {
                let started = t.started_at.or(t.assigned_at)?;
                let limit = chrono::Duration::try_seconds(i64::try_from(t.timeout_secs).ok()?)?;
                (now - started > limit).then_some((t.id, t.timeout_secs))
            })
            .collect();
        for (task_id, secs) in overdue {
            if let Ok(applied) = self
                .scheduler
                .fail_task(dag, task_id, format!("task timed out after {secs}s"))
            {
                warn!(task_id = %task_id, timeout_secs = secs, "Running task timed out");
                if let Some(agent) = applied.agent {
                    self.registry.release(&agent).await;
                }
                report.timed_out += 1;
            }
        }
    }

    /// Forget per-task bookkeeping, e.g. after the DAG is finished.
    pub fn forget(&self, task_ids: impl IntoIterator<Item = Uuid>) {
        let mut misses = self.misses.lock();
        for id in task_ids {
            misses.remove(&id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::builder::{DagBuilder, TaskSpec};
    use taskmesh_channels::InMemoryBus;
    use taskmesh_core::{Heartbeat, StatusUpdate};

    struct Fixture {
        bus: Arc<InMemoryBus>,
        registry: Arc<AgentRegistry>,
        dispatcher: Dispatcher,
        scheduler: Scheduler,
    }

    fn fixture(config: OrchestratorConfig) -> Fixture {
        let bus = Arc::new(InMemoryBus::new());
        let registry = Arc::new(AgentRegistry::new());
        let scheduler = Scheduler::new(config.failure_policy);
        let dispatcher = Dispatcher::new(bus.clone(), registry.clone(), scheduler, &config);
        Fixture {
            bus,
            registry,
            dispatcher,
            scheduler,
        }
    }

    fn fan_out() -> Dag {
        DagBuilder::new("q")
            .task(TaskSpec::new("a", "search").requires("web"))
            .task(TaskSpec::new("b", "llm").after("a").requires("llm"))
            .task(TaskSpec::new("c", "llm").after("a").requires("llm"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_dispatches_ready_task_to_capable_agent() {
        let f = fixture(OrchestratorConfig::default());
        f.registry
            .record_heartbeat(&Heartbeat::new("llm-1", vec!["llm".into()], 0))
            .await;
        f.registry
            .record_heartbeat(&Heartbeat::new("web-1", vec!["web".into()], 0))
            .await;
        let mut dispatches = f.bus.subscribe(TOPIC_DISPATCH).await.unwrap();
        let mut dag = fan_out();

        let report = f.dispatcher.run_pass(&mut dag).await;
        assert_eq!(report.dispatched, 1);

        let a = dag.task_by_name("a").unwrap();
        assert_eq!(a.status, TaskStatus::Assigned);
        assert_eq!(a.assigned_agent.as_deref(), Some("web-1"));

        let msg: TaskDispatch = dispatches.recv_as().await.unwrap();
        assert_eq!(msg.task_id, a.id);
        assert_eq!(msg.agent_id, "web-1");
        assert_eq!(msg.capabilities, vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn test_parallel_ready_tasks_spread_over_agents() {
        let f = fixture(OrchestratorConfig::default());
        for id in ["llm-1", "llm-2"] {
            f.registry
                .record_heartbeat(&Heartbeat::new(id, vec!["llm".into(), "web".into()], 0))
                .await;
        }
        let mut dag = fan_out();
        f.dispatcher.run_pass(&mut dag).await;
        let a = dag.task_by_name("a").unwrap().id;
        f.scheduler
            .apply_status_update(&mut dag, &StatusUpdate::completed(a, serde_json::json!(1)))
            .unwrap();

        let report = f.dispatcher.run_pass(&mut dag).await;
        assert_eq!(report.dispatched, 2);
        let b = dag.task_by_name("b").unwrap().assigned_agent.clone().unwrap();
        let c = dag.task_by_name("c").unwrap().assigned_agent.clone().unwrap();
        assert_ne!(b, c);
    }

    #[tokio::test]
    async fn test_no_agent_keeps_task_pending_then_fails() {
        let config = OrchestratorConfig {
            max_dispatch_passes: 3,
            ..OrchestratorConfig::default()
        };
        let f = fixture(config);
        let mut dag = fan_out();

        for _ in 0..2 {
            let report = f.dispatcher.run_pass(&mut dag).await;
            assert_eq!(report.unassignable, 1);
            assert!(report.stalled());
            assert_eq!(dag.task_by_name("a").unwrap().status, TaskStatus::Pending);
        }

        let report = f.dispatcher.run_pass(&mut dag).await;
        assert_eq!(report.exhausted, 1);
        let a = dag.task_by_name("a").unwrap();
        assert_eq!(a.status, TaskStatus::Failed);
        assert!(a.error.as_deref().unwrap().starts_with("Dispatch error"));
        assert_eq!(dag.task_by_name("b").unwrap().status, TaskStatus::Skipped);
        assert_eq!(dag.task_by_name("c").unwrap().status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn test_unacknowledged_assignment_is_reclaimed() {
        let config = OrchestratorConfig {
            ack_timeout_secs: 0,
            ..OrchestratorConfig::default()
        };
        let f = fixture(config);
        f.registry
            .record_heartbeat(&Heartbeat::new("web-1", vec!["web".into()], 0))
            .await;
        let mut dag = fan_out();
        f.dispatcher.run_pass(&mut dag).await;
        assert_eq!(dag.task_by_name("a").unwrap().status, TaskStatus::Assigned);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = f.dispatcher.run_pass(&mut dag).await;
        assert_eq!(report.reclaimed, 1);
        // Reclaimed and immediately handed out again in the same pass.
        assert_eq!(report.dispatched, 1);
        assert_eq!(f.registry.get("web-1").await.unwrap().load(), 1);
    }

    #[tokio::test]
    async fn test_running_task_past_timeout_fails() {
        let f = fixture(OrchestratorConfig::default());
        f.registry
            .record_heartbeat(&Heartbeat::new("web-1", vec!["web".into()], 0))
            .await;
        let mut dag = DagBuilder::new("q")
            .task(TaskSpec::new("slow", "search").requires("web").timeout_secs(0))
            .task(TaskSpec::new("next", "search").after("slow"))
            .build()
            .unwrap();
        f.dispatcher.run_pass(&mut dag).await;
        let slow = dag.task_by_name("slow").unwrap().id;
        f.scheduler
            .apply_status_update(&mut dag, &StatusUpdate::running(slow, "web-1"))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = f.dispatcher.run_pass(&mut dag).await;
        assert_eq!(report.timed_out, 1);
        let task = dag.task(slow).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(dag.task_by_name("next").unwrap().status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_task_pending() {
        let f = fixture(OrchestratorConfig::default());
        f.registry
            .record_heartbeat(&Heartbeat::new("web-1", vec!["web".into()], 0))
            .await;
        f.bus.set_online(false);
        let mut dag = fan_out();

        let report = f.dispatcher.run_pass(&mut dag).await;
        assert_eq!(report.publish_failures, 1);
        assert!(report.stalled());
        assert_eq!(dag.task_by_name("a").unwrap().status, TaskStatus::Pending);
        assert_eq!(f.registry.get("web-1").await.unwrap().load(), 0);
    }

    #[test]
    fn test_backoff_grows_on_stall_and_resets_on_progress() {
        let mut backoff = DispatchBackoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let stalled = PassReport {
            unassignable: 1,
            ..PassReport::default()
        };
        assert_eq!(backoff.record(&stalled), Duration::from_millis(200));
        assert_eq!(backoff.record(&stalled), Duration::from_millis(350));
        assert_eq!(backoff.record(&stalled), Duration::from_millis(350));

        let progressed = PassReport {
            dispatched: 1,
            unassignable: 1,
            ..PassReport::default()
        };
        assert_eq!(backoff.record(&progressed), Duration::from_millis(100));
        assert_eq!(backoff.record(&PassReport::default()), Duration::from_millis(100));
    }
}
