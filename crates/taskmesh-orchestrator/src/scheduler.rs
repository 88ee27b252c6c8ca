use crate::types::{Dag, QueryStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use taskmesh_core::{StatusUpdate, TaskStatus, TaskmeshError, TaskmeshResult};
use tracing::{debug, info};
use uuid::Uuid;

/// What happens to the rest of a DAG when one task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip every pending task downstream of the failure. Independent
    /// branches keep running.
    #[default]
    Cascade,
    /// Skip every pending task in the DAG.
    Halt,
}

/// Outcome of a status change the scheduler accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub task_id: Uuid,
    pub from: TaskStatus,
    pub to: TaskStatus,
    /// Agent that held the task when the change was applied.
    pub agent: Option<String>,
    /// Tasks moved to `skipped` as a consequence.
    pub skipped: Vec<Uuid>,
}

/// Computes readiness and applies status transitions for a DAG.
///
/// Holds no DAG state of its own; callers serialize access per DAG.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduler {
    policy: FailurePolicy,
}

impl Scheduler {
    pub fn new(policy: FailurePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Pending tasks whose upstream tasks have all completed, cheapest
    /// first, then in creation order.
    pub fn compute_ready(&self, dag: &Dag) -> Vec<Uuid> {
        let mut ready: Vec<_> = dag
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && upstream_completed(dag, t.id))
            .collect();
        ready.sort_by(|a, b| {
            a.complexity
                .total_cmp(&b.complexity)
                .then(a.seq.cmp(&b.seq))
        });
        ready.into_iter().map(|t| t.id).collect()
    }

    /// Apply an agent-reported status.
    ///
    /// Accepts `assigned -> running | completed | failed`,
    /// `running -> completed | failed`, and repeated `running` reports as
    /// progress. Everything else, including reports from an agent other
    /// than the assignee, is rejected with
    /// [`TaskmeshError::InvalidTransition`] and leaves the DAG untouched.
    pub fn apply_status_update(
        &self,
        dag: &mut Dag,
        update: &StatusUpdate,
    ) -> TaskmeshResult<Applied> {
        let task = dag
            .task_mut(update.task_id)
            .ok_or_else(|| TaskmeshError::NotFound(format!("task {}", update.task_id)))?;
        let from = task.status;
        let to = update.status;

        let stale = || TaskmeshError::InvalidTransition {
            task: update.task_id,
            from,
            to,
        };

        if let (Some(reporter), Some(assignee)) = (&update.agent_id, &task.assigned_agent) {
            if reporter != assignee {
                return Err(stale());
            }
        }

        let allowed = matches!(
            (from, to),
            (TaskStatus::Assigned, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Running)
                | (
                    TaskStatus::Assigned | TaskStatus::Running,
                    TaskStatus::Completed | TaskStatus::Failed
                )
        );
        if !allowed {
            return Err(stale());
        }

        if let Some(p) = update.progress {
            task.progress = Some(p.clamp(0.0, 100.0));
        }
        if update.duration_ms.is_some() {
            task.duration_ms = update.duration_ms;
        }
        match to {
            TaskStatus::Running => {
                if task.started_at.is_none() {
                    task.started_at = Some(Utc::now());
                }
            }
            TaskStatus::Completed => {
                task.result = update.result.clone();
                task.progress = Some(100.0);
            }
            TaskStatus::Failed => {
                task.error = Some(
                    update
                        .error
                        .clone()
                        .unwrap_or_else(|| "task failed without an error message".into()),
                );
            }
            _ => {}
        }
        task.set_status(to);
        let agent = task.assigned_agent.clone();

        let skipped = if to == TaskStatus::Failed {
            self.propagate_failure(dag, update.task_id)
        } else {
            Vec::new()
        };

        debug!(task_id = %update.task_id, %from, %to, skipped = skipped.len(), "Status applied");
        Ok(Applied {
            task_id: update.task_id,
            from,
            to,
            agent,
            skipped,
        })
    }

    /// Record a successful dispatch: `pending -> assigned`.
    ///
    /// Re-checks readiness so a task whose upstream regressed between the
    /// ready computation and the publish is never marked assigned.
    pub fn mark_assigned(&self, dag: &mut Dag, task_id: Uuid, agent_id: &str) -> TaskmeshResult<()> {
        let ready = upstream_completed(dag, task_id);
        let task = dag
            .task_mut(task_id)
            .ok_or_else(|| TaskmeshError::NotFound(format!("task {task_id}")))?;
        if task.status != TaskStatus::Pending || !ready {
            return Err(TaskmeshError::InvalidTransition {
                task: task_id,
                from: task.status,
                to: TaskStatus::Assigned,
            });
        }
        task.assigned_agent = Some(agent_id.to_string());
        task.assigned_at = Some(Utc::now());
        task.set_status(TaskStatus::Assigned);
        Ok(())
    }

    /// Return an unacknowledged assignment to the pool: `assigned -> pending`.
    ///
    /// The only backwards move, and only the dispatcher makes it.
    pub fn reclaim(&self, dag: &mut Dag, task_id: Uuid) -> TaskmeshResult<Option<String>> {
        let task = dag
            .task_mut(task_id)
            .ok_or_else(|| TaskmeshError::NotFound(format!("task {task_id}")))?;
        if task.status != TaskStatus::Assigned {
            return Err(TaskmeshError::InvalidTransition {
                task: task_id,
                from: task.status,
                to: TaskStatus::Pending,
            });
        }
        task.assigned_at = None;
        task.set_status(TaskStatus::Pending);
        Ok(task.assigned_agent.take())
    }

    /// Fail a non-terminal task on the orchestrator's own authority, e.g.
    /// dispatch exhaustion or an execution timeout, and propagate.
    pub fn fail_task(&self, dag: &mut Dag, task_id: Uuid, error: impl Into<String>) -> TaskmeshResult<Applied> {
        let task = dag
            .task_mut(task_id)
            .ok_or_else(|| TaskmeshError::NotFound(format!("task {task_id}")))?;
        let from = task.status;
        if from.is_terminal() {
            return Err(TaskmeshError::InvalidTransition {
                task: task_id,
                from,
                to: TaskStatus::Failed,
            });
        }
        task.error = Some(error.into());
        task.set_status(TaskStatus::Failed);
        let agent = task.assigned_agent.clone();
        let skipped = self.propagate_failure(dag, task_id);
        Ok(Applied {
            task_id,
            from,
            to: TaskStatus::Failed,
            agent,
            skipped,
        })
    }

    fn propagate_failure(&self, dag: &mut Dag, failed: Uuid) -> Vec<Uuid> {
        let name = dag.task(failed).map(|t| t.name.clone()).unwrap_or_default();
        let (targets, note) = match self.policy {
            FailurePolicy::Cascade => (
                dag.descendants(failed),
                format!("skipped: upstream task '{name}' failed"),
            ),
            FailurePolicy::Halt => (
                dag.tasks.keys().copied().filter(|id| *id != failed).collect(),
                format!("skipped: DAG halted after task '{name}' failed"),
            ),
        };

        let mut skipped = Vec::new();
        for id in targets {
            if let Some(task) = dag.task_mut(id) {
                if task.status == TaskStatus::Pending {
                    task.error = Some(note.clone());
                    task.set_status(TaskStatus::Skipped);
                    skipped.push(id);
                }
            }
        }
        if !skipped.is_empty() {
            info!(task_id = %failed, policy = ?self.policy, skipped = skipped.len(), "Propagated task failure");
        }
        skipped
    }

    /// Skip every non-terminal task. Work already running on an agent is
    /// not interrupted; its later report is rejected as stale.
    pub fn cancel(&self, dag: &mut Dag) -> Vec<Uuid> {
        let mut skipped = Vec::new();
        for task in dag.tasks.values_mut() {
            if !task.status.is_terminal() {
                task.error = Some("skipped: query cancelled".into());
                task.set_status(TaskStatus::Skipped);
                skipped.push(task.id);
            }
        }
        skipped
    }

    /// Terminal outcome for the owning query, or `None` while work remains.
    pub fn outcome(&self, dag: &Dag) -> Option<QueryStatus> {
        if !dag.is_terminal() {
            return None;
        }
        if dag.tasks.values().all(|t| t.status == TaskStatus::Completed) {
            Some(QueryStatus::Completed)
        } else {
            Some(QueryStatus::Failed)
        }
    }
}

fn upstream_completed(dag: &Dag, task_id: Uuid) -> bool {
    dag.task(task_id).is_some_and(|t| {
        t.upstream
            .iter()
            .all(|u| dag.task(*u).is_some_and(|up| up.status == TaskStatus::Completed))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::builder::{DagBuilder, TaskSpec};
    use serde_json::json;

    fn fan_out() -> Dag {
        DagBuilder::new("q")
            .task(TaskSpec::new("a", "t"))
            .task(TaskSpec::new("b", "t").after("a"))
            .task(TaskSpec::new("c", "t").after("a"))
            .build()
            .unwrap()
    }

    fn id(dag: &Dag, name: &str) -> Uuid {
        dag.task_by_name(name).unwrap().id
    }

    /// Drive a task through assigned, running and completed.
    fn complete(s: &Scheduler, dag: &mut Dag, name: &str) {
        let t = id(dag, name);
        s.mark_assigned(dag, t, "agent-1").unwrap();
        s.apply_status_update(dag, &StatusUpdate::running(t, "agent-1"))
            .unwrap();
        s.apply_status_update(dag, &StatusUpdate::completed(t, json!(name)).from_agent("agent-1"))
            .unwrap();
    }

    fn fail(s: &Scheduler, dag: &mut Dag, name: &str) -> Applied {
        let t = id(dag, name);
        s.mark_assigned(dag, t, "agent-1").unwrap();
        s.apply_status_update(dag, &StatusUpdate::failed(t, "boom").from_agent("agent-1"))
            .unwrap()
    }

    #[test]
    fn test_ready_follows_completion() {
        let s = Scheduler::default();
        let mut dag = fan_out();
        assert_eq!(s.compute_ready(&dag), vec![id(&dag, "a")]);

        complete(&s, &mut dag, "a");
        assert_eq!(s.compute_ready(&dag), vec![id(&dag, "b"), id(&dag, "c")]);
    }

    #[test]
    fn test_ready_never_includes_unfinished_upstream() {
        let s = Scheduler::default();
        let mut dag = fan_out();
        let a = id(&dag, "a");
        s.mark_assigned(&mut dag, a, "agent-1").unwrap();
        s.apply_status_update(&mut dag, &StatusUpdate::running(a, "agent-1"))
            .unwrap();
        assert!(s.compute_ready(&dag).is_empty());

        for t in s.compute_ready(&dag) {
            let task = dag.task(t).unwrap();
            assert!(task
                .upstream
                .iter()
                .all(|u| dag.task(*u).unwrap().status == TaskStatus::Completed));
        }
    }

    #[test]
    fn test_ready_sorted_by_complexity_then_creation() {
        let s = Scheduler::default();
        let dag = DagBuilder::new("q")
            .task(TaskSpec::new("heavy", "t").complexity(5.0))
            .task(TaskSpec::new("light", "t").complexity(0.5))
            .task(TaskSpec::new("mid-1", "t").complexity(2.0))
            .task(TaskSpec::new("mid-2", "t").complexity(2.0))
            .build()
            .unwrap();
        let names: Vec<_> = s
            .compute_ready(&dag)
            .into_iter()
            .map(|t| dag.task(t).unwrap().name.clone())
            .collect();
        assert_eq!(names, vec!["light", "mid-1", "mid-2", "heavy"]);
    }

    #[test]
    fn test_duplicate_completion_is_rejected_without_change() {
        let s = Scheduler::default();
        let mut dag = fan_out();
        complete(&s, &mut dag, "a");
        let a = id(&dag, "a");
        let before = dag.task(a).unwrap().clone();

        let err = s
            .apply_status_update(&mut dag, &StatusUpdate::completed(a, json!("again")))
            .unwrap_err();
        assert!(matches!(
            err,
            TaskmeshError::InvalidTransition {
                from: TaskStatus::Completed,
                to: TaskStatus::Completed,
                ..
            }
        ));
        let after = dag.task(a).unwrap();
        assert_eq!(after.result, before.result);
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[test]
    fn test_backwards_and_unassigned_transitions_rejected() {
        let s = Scheduler::default();
        let mut dag = fan_out();
        let a = id(&dag, "a");
        assert!(s
            .apply_status_update(&mut dag, &StatusUpdate::running(a, "agent-1"))
            .is_err());
        complete(&s, &mut dag, "a");
        assert!(s
            .apply_status_update(&mut dag, &StatusUpdate::new(a, TaskStatus::Pending))
            .is_err());
        assert_eq!(dag.task(a).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_report_from_other_agent_rejected() {
        let s = Scheduler::default();
        let mut dag = fan_out();
        let a = id(&dag, "a");
        s.mark_assigned(&mut dag, a, "agent-1").unwrap();
        let err = s
            .apply_status_update(&mut dag, &StatusUpdate::running(a, "agent-2"))
            .unwrap_err();
        assert!(matches!(err, TaskmeshError::InvalidTransition { .. }));
        assert_eq!(dag.task(a).unwrap().status, TaskStatus::Assigned);
    }

    #[test]
    fn test_assigned_may_jump_to_completed() {
        let s = Scheduler::default();
        let mut dag = fan_out();
        let a = id(&dag, "a");
        s.mark_assigned(&mut dag, a, "agent-1").unwrap();
        let applied = s
            .apply_status_update(&mut dag, &StatusUpdate::completed(a, json!(1)))
            .unwrap();
        assert_eq!(applied.from, TaskStatus::Assigned);
        assert_eq!(applied.agent.as_deref(), Some("agent-1"));
    }

    #[test]
    fn test_progress_reports_while_running() {
        let s = Scheduler::default();
        let mut dag = fan_out();
        let a = id(&dag, "a");
        s.mark_assigned(&mut dag, a, "agent-1").unwrap();
        s.apply_status_update(&mut dag, &StatusUpdate::running(a, "agent-1"))
            .unwrap();
        let mut update = StatusUpdate::running(a, "agent-1");
        update.progress = Some(140.0);
        s.apply_status_update(&mut dag, &update).unwrap();
        assert_eq!(dag.task(a).unwrap().progress, Some(100.0));
        assert!(dag.task(a).unwrap().started_at.is_some());
    }

    #[test]
    fn test_cascade_skips_transitive_pending_only() {
        let s = Scheduler::default();
        let mut dag = DagBuilder::new("q")
            .task(TaskSpec::new("root", "t"))
            .task(TaskSpec::new("child", "t").after("root"))
            .task(TaskSpec::new("grandchild", "t").after("child"))
            .task(TaskSpec::new("other", "t"))
            .task(TaskSpec::new("other-child", "t").after("other"))
            .build()
            .unwrap();

        let applied = fail(&s, &mut dag, "root");
        let mut skipped = applied.skipped.clone();
        skipped.sort();
        let mut expected = vec![id(&dag, "child"), id(&dag, "grandchild")];
        expected.sort();
        assert_eq!(skipped, expected);

        let gc = dag.task_by_name("grandchild").unwrap();
        assert_eq!(gc.status, TaskStatus::Skipped);
        assert!(gc.error.as_deref().unwrap().contains("'root'"));
        assert_eq!(dag.task_by_name("other").unwrap().status, TaskStatus::Pending);
        assert_eq!(
            dag.task_by_name("other-child").unwrap().status,
            TaskStatus::Pending
        );
    }

    #[test]
    fn test_cascade_leaves_in_flight_downstream_alone() {
        let s = Scheduler::default();
        let mut dag = DagBuilder::new("q")
            .task(TaskSpec::new("a", "t"))
            .task(TaskSpec::new("b", "t"))
            .task(TaskSpec::new("c", "t").after("b"))
            .build()
            .unwrap();
        complete(&s, &mut dag, "b");
        let c = id(&dag, "c");
        s.mark_assigned(&mut dag, c, "agent-1").unwrap();
        dag.add_dependency(id(&dag, "a"), c).unwrap();

        let applied = fail(&s, &mut dag, "a");
        assert!(applied.skipped.is_empty());
        assert_eq!(dag.task(c).unwrap().status, TaskStatus::Assigned);
    }

    #[test]
    fn test_halt_policy_skips_everything_pending() {
        let s = Scheduler::new(FailurePolicy::Halt);
        let mut dag = fan_out();
        let extra = dag
            .add_task(crate::types::Task::new("independent", "t"))
            .unwrap();
        complete(&s, &mut dag, "a");
        let applied = fail(&s, &mut dag, "b");
        assert_eq!(applied.skipped.len(), 2);
        assert_eq!(dag.task(extra).unwrap().status, TaskStatus::Skipped);
        assert_eq!(s.outcome(&dag), Some(QueryStatus::Failed));
    }

    #[test]
    fn test_fan_out_scenario_terminal_state() {
        let s = Scheduler::default();
        let mut dag = fan_out();
        complete(&s, &mut dag, "a");

        let applied = fail(&s, &mut dag, "b");
        assert!(applied.skipped.is_empty());
        assert_eq!(s.compute_ready(&dag), vec![id(&dag, "c")]);
        assert_eq!(s.outcome(&dag), None);

        complete(&s, &mut dag, "c");
        assert_eq!(s.outcome(&dag), Some(QueryStatus::Failed));
    }

    #[test]
    fn test_all_completed_outcome() {
        let s = Scheduler::default();
        let mut dag = fan_out();
        for name in ["a", "b", "c"] {
            complete(&s, &mut dag, name);
        }
        assert_eq!(s.outcome(&dag), Some(QueryStatus::Completed));
    }

    #[test]
    fn test_reclaim_returns_task_to_pool() {
        let s = Scheduler::default();
        let mut dag = fan_out();
        let a = id(&dag, "a");
        s.mark_assigned(&mut dag, a, "agent-1").unwrap();
        assert_eq!(s.reclaim(&mut dag, a).unwrap().as_deref(), Some("agent-1"));
        assert_eq!(s.compute_ready(&dag), vec![a]);
        assert!(s.reclaim(&mut dag, a).is_err());
        assert!(s
            .apply_status_update(&mut dag, &StatusUpdate::running(a, "agent-1"))
            .is_err());
    }

    #[test]
    fn test_mark_assigned_rechecks_upstream() {
        let s = Scheduler::default();
        let mut dag = fan_out();
        let b = id(&dag, "b");
        assert!(s.mark_assigned(&mut dag, b, "agent-1").is_err());
        assert_eq!(dag.task(b).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_cancel_skips_non_terminal() {
        let s = Scheduler::default();
        let mut dag = fan_out();
        complete(&s, &mut dag, "a");
        let b = id(&dag, "b");
        s.mark_assigned(&mut dag, b, "agent-1").unwrap();

        let skipped = s.cancel(&mut dag);
        assert_eq!(skipped.len(), 2);
        assert_eq!(dag.task(b).unwrap().status, TaskStatus::Skipped);
        assert!(s
            .apply_status_update(&mut dag, &StatusUpdate::completed(b, json!(1)))
            .is_err());
        assert_eq!(s.outcome(&dag), Some(QueryStatus::Failed));
    }

    #[test]
    fn test_fail_task_with_dispatch_error() {
        let s = Scheduler::default();
        let mut dag = fan_out();
        let a = id(&dag, "a");
        let msg = TaskmeshError::Dispatch("no eligible agent".into()).to_string();
        let applied = s.fail_task(&mut dag, a, msg).unwrap();
        assert_eq!(applied.from, TaskStatus::Pending);
        assert_eq!(applied.skipped.len(), 2);
        assert!(dag
            .task(a)
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .starts_with("Dispatch error"));
        assert!(s.fail_task(&mut dag, a, "again").is_err());
    }
}
