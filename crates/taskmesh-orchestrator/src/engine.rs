use crate::builder::{DagBuilder, TaskSpec};
use crate::config::OrchestratorConfig;
use crate::dispatcher::{DispatchBackoff, Dispatcher, PassReport};
use crate::health::{HealthAggregator, HealthReport};
use crate::registry::AgentRegistry;
use crate::repository::{DagRecord, DagRepository, KvDagRepository};
use crate::scheduler::Scheduler;
use crate::types::{Dag, Query, QueryStatus};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use taskmesh_channels::MessageBus;
use taskmesh_core::{
    Heartbeat, StatusUpdate, TaskStatus, TaskmeshError, TaskmeshResult, TOPIC_HEARTBEAT,
    TOPIC_STATUS,
};
use taskmesh_memory::KvStore;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Turns a query into task specifications. Decomposition itself lives
/// outside the engine.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, query: &Query) -> TaskmeshResult<Vec<TaskSpec>>;
}

/// Planner that hands back the same task list for every query.
pub struct StaticPlanner {
    specs: Vec<TaskSpec>,
}

impl StaticPlanner {
    pub fn new(specs: Vec<TaskSpec>) -> Self {
        Self { specs }
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, _query: &Query) -> TaskmeshResult<Vec<TaskSpec>> {
        Ok(self.specs.clone())
    }
}

/// Whether [`Orchestrator::submit`] waits for the query to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitMode {
    Sync,
    #[default]
    Async,
}

/// Input accepted from the presentation layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuerySubmission {
    pub content: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub mode: SubmitMode,
}

impl QuerySubmission {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn sync(mut self) -> Self {
        self.mode = SubmitMode::Sync;
        self
    }
}

struct DagRun {
    dag: Dag,
    query_id: Uuid,
    cancelled: bool,
    finished: bool,
}

struct QueryRecord {
    query: Query,
    done: watch::Sender<QueryStatus>,
}

/// The orchestration engine.
///
/// Owns every query and its DAG. Each DAG sits behind its own mutex, so
/// status updates and dispatch passes for one DAG are applied one at a
/// time while different DAGs progress in parallel. Every DAG change is
/// written through to the [`DagRepository`], and [`restore`](Self::restore)
/// reloads unfinished DAGs after a restart.
///
/// Lock order: `queries`, then `task_index` and `runs`. A DAG mutex may be
/// held while taking `queries`, never the other way round.
pub struct Orchestrator {
    config: OrchestratorConfig,
    planner: Arc<dyn Planner>,
    bus: Arc<dyn MessageBus>,
    registry: Arc<AgentRegistry>,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    health: HealthAggregator,
    repository: Arc<dyn DagRepository>,
    queries: RwLock<HashMap<Uuid, QueryRecord>>,
    runs: RwLock<HashMap<Uuid, Arc<Mutex<DagRun>>>>,
    /// Task id to owning DAG id.
    task_index: RwLock<HashMap<Uuid, Uuid>>,
    /// DAGs still being scheduled; the only ones a tick visits.
    active: parking_lot::Mutex<HashSet<Uuid>>,
    backoff: parking_lot::Mutex<DispatchBackoff>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        planner: Arc<dyn Planner>,
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn KvStore>,
    ) -> TaskmeshResult<Self> {
        config.validate()?;
        let registry = Arc::new(AgentRegistry::new());
        let scheduler = Scheduler::new(config.failure_policy);
        let dispatcher = Dispatcher::new(bus.clone(), registry.clone(), scheduler, &config);
        let repository: Arc<dyn DagRepository> =
            Arc::new(KvDagRepository::new(store.clone(), config.io_timeout()));
        let health = HealthAggregator::new(store, bus.clone(), config.io_timeout());
        let backoff = DispatchBackoff::new(config.dispatch_interval(), config.dispatch_backoff_max());
        Ok(Self {
            config,
            planner,
            bus,
            registry,
            scheduler,
            dispatcher,
            health,
            repository,
            queries: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            task_index: RwLock::new(HashMap::new()),
            active: parking_lot::Mutex::new(HashSet::new()),
            backoff: parking_lot::Mutex::new(backoff),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    // --- Queries ---

    /// Accept a query, decompose it and start scheduling its DAG.
    ///
    /// Returns as soon as the DAG is registered in async mode. In sync mode
    /// waits until the query is terminal, which requires [`start`](Self::start)
    /// to be running. A planner or validation failure is reported on the
    /// returned query as `failed`, not as an `Err`.
    pub async fn submit(&self, submission: QuerySubmission) -> TaskmeshResult<Query> {
        let mut query = Query::new(submission.content);
        query.user_id = submission.user_id;
        query.metadata = submission.metadata;
        let query_id = query.id;
        let (done, mut done_rx) = watch::channel(QueryStatus::Received);
        self.queries.write().await.insert(
            query_id,
            QueryRecord {
                query: query.clone(),
                done,
            },
        );
        info!(query_id = %query_id, "Query received");

        self.set_query_status(query_id, QueryStatus::Decomposing, None).await;
        query.advance(QueryStatus::Decomposing);

        let built = match self.planner.plan(&query).await {
            Ok(specs) => DagBuilder::new(format!("query-{query_id}"))
                .description(query.content.clone())
                .tasks(specs)
                .build()
                .map_err(TaskmeshError::from),
            Err(e) => Err(e),
        };

        let dag = match built {
            Ok(dag) => dag,
            Err(e) => {
                warn!(query_id = %query_id, error = %e, "Query rejected");
                self.set_query_status(query_id, QueryStatus::Failed, Some(e.to_string()))
                    .await;
                return self.query_or_missing(query_id).await;
            }
        };

        let dag_id = dag.id;
        let task_ids: Vec<Uuid> = dag.tasks().iter().map(|t| t.id).collect();
        let run = Arc::new(Mutex::new(DagRun {
            dag,
            query_id,
            cancelled: false,
            finished: false,
        }));
        // A cancel that landed while the planner ran has already made the
        // query terminal; its DAG is never registered.
        let registered = {
            let mut queries = self.queries.write().await;
            match queries.get_mut(&query_id) {
                Some(record) if !record.query.status.is_terminal() => {
                    let mut index = self.task_index.write().await;
                    for id in &task_ids {
                        index.insert(*id, dag_id);
                    }
                    drop(index);
                    self.runs.write().await.insert(dag_id, run.clone());
                    self.active.lock().insert(dag_id);
                    record.query.dag_id = Some(dag_id);
                    transition(record, QueryStatus::Running, None);
                    true
                }
                _ => false,
            }
        };
        if !registered {
            info!(query_id = %query_id, dag_id = %dag_id, "Query ended while decomposing, dropping its DAG");
            return self.query_or_missing(query_id).await;
        }

        {
            let mut run = run.lock().await;
            info!(query_id = %query_id, dag_id = %dag_id, tasks = run.dag.len(), "Query running");
            self.finish_if_terminal(&mut run).await;
            self.persist(&run).await;
        }

        if submission.mode == SubmitMode::Sync {
            while !done_rx.borrow_and_update().is_terminal() {
                if done_rx.changed().await.is_err() {
                    break;
                }
            }
        }
        self.query_or_missing(query_id).await
    }

    pub async fn get_query(&self, query_id: Uuid) -> Option<Query> {
        self.queries
            .read()
            .await
            .get(&query_id)
            .map(|r| r.query.clone())
    }

    /// Queries newest first, optionally filtered by status.
    pub async fn list_queries(&self, status: Option<QueryStatus>, limit: usize) -> Vec<Query> {
        let queries = self.queries.read().await;
        let mut list: Vec<Query> = queries
            .values()
            .map(|r| &r.query)
            .filter(|q| status.map_or(true, |s| q.status == s))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list.truncate(limit);
        list
    }

    /// Snapshot of the DAG owned by `query_id`.
    pub async fn dag(&self, query_id: Uuid) -> Option<Dag> {
        let dag_id = self.get_query(query_id).await?.dag_id?;
        let run = self.runs.read().await.get(&dag_id).cloned()?;
        let run = run.lock().await;
        Some(run.dag.clone())
    }

    /// Wait until `query_id` is terminal.
    pub async fn wait(&self, query_id: Uuid) -> TaskmeshResult<Query> {
        let mut rx = {
            let queries = self.queries.read().await;
            let record = queries
                .get(&query_id)
                .ok_or_else(|| TaskmeshError::NotFound(format!("query {query_id}")))?;
            record.done.subscribe()
        };
        while !rx.borrow_and_update().is_terminal() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.query_or_missing(query_id).await
    }

    /// Skip every unfinished task and stop dispatching for the query.
    /// Agents already working are not interrupted; their reports are ignored.
    /// A query still decomposing fails at once and its plan is discarded.
    pub async fn cancel(&self, query_id: Uuid) -> TaskmeshResult<Query> {
        let dag_id = {
            let mut queries = self.queries.write().await;
            let record = queries
                .get_mut(&query_id)
                .ok_or_else(|| TaskmeshError::NotFound(format!("query {query_id}")))?;
            if record.query.status.is_terminal() {
                return Ok(record.query.clone());
            }
            match record.query.dag_id {
                Some(dag_id) => dag_id,
                None => {
                    transition(record, QueryStatus::Failed, Some("query cancelled".into()));
                    info!(query_id = %query_id, "Query cancelled while decomposing");
                    return Ok(record.query.clone());
                }
            }
        };
        let run = self.runs.read().await.get(&dag_id).cloned();
        if let Some(run) = run {
            let mut run = run.lock().await;
            run.cancelled = true;
            let skipped = self.scheduler.cancel(&mut run.dag);
            for id in &skipped {
                if let Some(agent) = run.dag.task(*id).and_then(|t| t.assigned_agent.clone()) {
                    self.registry.release(&agent).await;
                }
            }
            info!(query_id = %query_id, skipped = skipped.len(), "Query cancelled");
            self.finish_if_terminal(&mut run).await;
            self.persist(&run).await;
        }
        self.query_or_missing(query_id).await
    }

    /// Forget a query and its DAG, in memory and in the store. A query
    /// still in flight is cancelled first. Returns the removed query.
    pub async fn delete_query(&self, query_id: Uuid) -> TaskmeshResult<Query> {
        self.cancel(query_id).await?;
        let removed = self.queries.write().await.remove(&query_id);
        let record = removed.ok_or_else(|| TaskmeshError::NotFound(format!("query {query_id}")))?;

        if let Some(dag_id) = record.query.dag_id {
            self.active.lock().remove(&dag_id);
            let run = self.runs.write().await.remove(&dag_id);
            if let Some(run) = run {
                let run = run.lock().await;
                let mut index = self.task_index.write().await;
                for task in run.dag.tasks() {
                    index.remove(&task.id);
                }
                self.dispatcher.forget(run.dag.tasks().iter().map(|t| t.id));
            }
            if let Err(e) = self.repository.remove(dag_id).await {
                warn!(query_id = %query_id, dag_id = %dag_id, error = %e, "Could not remove stored DAG");
            }
        }
        info!(query_id = %query_id, "Query deleted");
        Ok(record.query)
    }

    // --- Inbound messages ---

    /// Apply one agent status report.
    ///
    /// Stale or duplicate reports come back as
    /// [`TaskmeshError::InvalidTransition`] and change nothing.
    pub async fn handle_status_update(&self, update: &StatusUpdate) -> TaskmeshResult<()> {
        let dag_id = self
            .task_index
            .read()
            .await
            .get(&update.task_id)
            .copied()
            .ok_or_else(|| TaskmeshError::NotFound(format!("task {}", update.task_id)))?;
        let Some(run) = self.runs.read().await.get(&dag_id).cloned() else {
            return Err(TaskmeshError::NotFound(format!("dag {dag_id}")));
        };
        let mut run = run.lock().await;
        if run.cancelled {
            debug!(task_id = %update.task_id, "Ignoring report for cancelled query");
            return Ok(());
        }

        let applied = self.scheduler.apply_status_update(&mut run.dag, update)?;
        if applied.to.is_terminal() {
            if let Some(agent) = &applied.agent {
                self.registry.release(agent).await;
            }
            info!(
                task_id = %update.task_id,
                status = %applied.to,
                agent = ?applied.agent,
                skipped = applied.skipped.len(),
                "Task finished"
            );
        }
        self.finish_if_terminal(&mut run).await;
        self.persist(&run).await;
        Ok(())
    }

    pub async fn handle_heartbeat(&self, heartbeat: &Heartbeat) {
        self.registry.record_heartbeat(heartbeat).await;
    }

    // --- Dispatch ---

    /// One scheduling round over every unfinished DAG, DAGs in parallel.
    pub async fn tick(&self) -> PassReport {
        self.registry.evict_stale(self.config.heartbeat_stale()).await;

        let active: Vec<Uuid> = self.active.lock().iter().copied().collect();
        let runs: Vec<Arc<Mutex<DagRun>>> = {
            let runs = self.runs.read().await;
            active.iter().filter_map(|id| runs.get(id).cloned()).collect()
        };
        let reports = join_all(runs.iter().map(|run| async move {
            let mut run = run.lock().await;
            if run.finished || run.cancelled {
                return PassReport::default();
            }
            let report = self.dispatcher.run_pass(&mut run.dag).await;
            let finished = self.finish_if_terminal(&mut run).await;
            if finished || report.changed() {
                self.persist(&run).await;
            }
            report
        }))
        .await;

        let mut total = PassReport::default();
        for r in &reports {
            total.merge(r);
        }
        total
    }

    /// Current component health.
    pub async fn health(&self) -> HealthReport {
        self.health.check().await
    }

    /// Reload every unfinished DAG from the repository. DAGs this engine
    /// already holds are left alone. Returns how many were restored.
    pub async fn restore(&self) -> TaskmeshResult<usize> {
        let records = self.repository.list_active().await?;
        let mut restored = Vec::new();
        for DagRecord {
            query,
            dag,
            cancelled,
        } in records
        {
            let (query_id, dag_id) = (query.id, dag.id);
            let mut queries = self.queries.write().await;
            if queries.contains_key(&query_id) {
                continue;
            }
            let mut index = self.task_index.write().await;
            for task in dag.tasks() {
                index.insert(task.id, dag_id);
            }
            drop(index);
            let run = Arc::new(Mutex::new(DagRun {
                dag,
                query_id,
                cancelled,
                finished: false,
            }));
            self.runs.write().await.insert(dag_id, run.clone());
            self.active.lock().insert(dag_id);
            let (done, _) = watch::channel(query.status);
            queries.insert(query_id, QueryRecord { query, done });
            info!(query_id = %query_id, dag_id = %dag_id, "Query restored");
            restored.push(run);
        }

        for run in &restored {
            let mut run = run.lock().await;
            if self.finish_if_terminal(&mut run).await {
                self.persist(&run).await;
            }
        }
        Ok(restored.len())
    }

    /// Restore unfinished DAGs, subscribe to agent topics and spawn the
    /// consumer and dispatch loops.
    pub async fn start(self: &Arc<Self>) -> TaskmeshResult<EngineHandle> {
        match self.restore().await {
            Ok(0) => {}
            Ok(n) => info!(restored = n, "Resumed unfinished queries"),
            Err(e) => warn!(error = %e, "Could not restore stored DAGs"),
        }
        let mut statuses = self.bus.subscribe(TOPIC_STATUS).await?;
        let mut heartbeats = self.bus.subscribe(TOPIC_HEARTBEAT).await?;
        let (shutdown, _) = watch::channel(false);

        let engine = self.clone();
        let mut stop = shutdown.subscribe();
        let status_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    update = statuses.recv_as::<StatusUpdate>() => {
                        let Some(update) = update else { break };
                        match engine.handle_status_update(&update).await {
                            Ok(()) => {}
                            Err(e @ TaskmeshError::InvalidTransition { .. }) => {
                                warn!(task_id = %update.task_id, error = %e, "Ignoring stale or duplicate status update");
                            }
                            Err(e) => warn!(task_id = %update.task_id, error = %e, "Status update rejected"),
                        }
                    }
                }
            }
            debug!("Status consumer stopped");
        });

        let engine = self.clone();
        let mut stop = shutdown.subscribe();
        let heartbeat_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    hb = heartbeats.recv_as::<Heartbeat>() => {
                        let Some(hb) = hb else { break };
                        engine.handle_heartbeat(&hb).await;
                    }
                }
            }
            debug!("Heartbeat consumer stopped");
        });

        let engine = self.clone();
        let mut stop = shutdown.subscribe();
        let dispatch_loop = tokio::spawn(async move {
            let mut delay = engine.config.dispatch_interval();
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(delay) => {
                        let report = engine.tick().await;
                        delay = engine.backoff.lock().record(&report);
                        if report.stalled() {
                            debug!(delay_ms = delay.as_millis() as u64, "Dispatch stalled, backing off");
                        }
                    }
                }
            }
            debug!("Dispatch loop stopped");
        });

        info!("Orchestrator started");
        Ok(EngineHandle {
            shutdown,
            tasks: vec![status_loop, heartbeat_loop, dispatch_loop],
        })
    }

    // --- Internals ---

    /// Settle the query once its DAG is terminal. Returns whether this call
    /// finished it.
    async fn finish_if_terminal(&self, run: &mut DagRun) -> bool {
        if run.finished {
            return false;
        }
        let Some(outcome) = self.scheduler.outcome(&run.dag) else {
            return false;
        };
        run.finished = true;
        self.active.lock().remove(&run.dag.id);
        self.dispatcher.forget(run.dag.tasks().iter().map(|t| t.id));

        let error = (outcome == QueryStatus::Failed).then(|| failure_summary(&run.dag));
        self.set_query_status(run.query_id, outcome, error).await;
        info!(
            query_id = %run.query_id,
            dag_id = %run.dag.id,
            status = %outcome,
            completed = run.dag.count(TaskStatus::Completed),
            failed = run.dag.count(TaskStatus::Failed),
            skipped = run.dag.count(TaskStatus::Skipped),
            "Query finished"
        );
        true
    }

    /// Write the run and its query through to the repository. Store
    /// failures are logged and scheduling carries on.
    async fn persist(&self, run: &DagRun) {
        let Some(query) = self.get_query(run.query_id).await else {
            return;
        };
        let record = DagRecord {
            query,
            dag: run.dag.clone(),
            cancelled: run.cancelled,
        };
        if let Err(e) = self.repository.save(&record).await {
            warn!(query_id = %run.query_id, dag_id = %run.dag.id, error = %e, "Could not persist DAG");
        }
    }

    async fn set_query_status(&self, query_id: Uuid, status: QueryStatus, error: Option<String>) {
        let mut queries = self.queries.write().await;
        let Some(record) = queries.get_mut(&query_id) else {
            debug!(query_id = %query_id, "Status change for unknown query");
            return;
        };
        if !transition(record, status, error) {
            debug!(query_id = %query_id, status = %status, current = %record.query.status, "Query already finished, status change ignored");
        }
    }

    async fn query_or_missing(&self, query_id: Uuid) -> TaskmeshResult<Query> {
        self.get_query(query_id)
            .await
            .ok_or_else(|| TaskmeshError::NotFound(format!("query {query_id}")))
    }
}

/// Move a query that is not yet terminal. Terminal queries never change;
/// returns whether the status was applied.
fn transition(record: &mut QueryRecord, status: QueryStatus, error: Option<String>) -> bool {
    if record.query.status.is_terminal() {
        return false;
    }
    record.query.advance(status);
    if error.is_some() {
        record.query.error = error;
    }
    record.done.send_replace(status);
    true
}

/// First failure in creation order, for the query's error message.
fn failure_summary(dag: &Dag) -> String {
    let failed: Vec<_> = dag
        .tasks()
        .into_iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .collect();
    match failed.first() {
        Some(t) => {
            let reason = t.error.as_deref().unwrap_or("unknown error");
            if failed.len() > 1 {
                format!("task '{}' failed: {reason} (and {} more)", t.name, failed.len() - 1)
            } else {
                format!("task '{}' failed: {reason}", t.name)
            }
        }
        None => "query cancelled".to_string(),
    }
}

/// Running engine loops. Dropping the handle leaves them running; call
/// [`shutdown`](Self::shutdown) to stop them.
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Engine loop panicked");
            }
        }
        info!("Orchestrator stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskmesh_channels::InMemoryBus;
    use crate::repository::ACTIVE_DAGS_KEY;
    use std::time::Duration;
    use taskmesh_memory::InMemoryKvStore;

    fn engine_with(
        planner: Arc<dyn Planner>,
        store: Arc<dyn KvStore>,
    ) -> (Arc<Orchestrator>, Arc<InMemoryBus>) {
        let bus = Arc::new(InMemoryBus::new());
        let engine =
            Orchestrator::new(OrchestratorConfig::default(), planner, bus.clone(), store).unwrap();
        (Arc::new(engine), bus)
    }

    fn engine(specs: Vec<TaskSpec>) -> (Arc<Orchestrator>, Arc<InMemoryBus>) {
        engine_with(
            Arc::new(StaticPlanner::new(specs)),
            Arc::new(InMemoryKvStore::new()),
        )
    }

    fn fan_out() -> Vec<TaskSpec> {
        vec![
            TaskSpec::new("a", "t").requires("x"),
            TaskSpec::new("b", "t").after("a").requires("x"),
            TaskSpec::new("c", "t").after("a").requires("x"),
        ]
    }

    async fn task_id(engine: &Orchestrator, query: Uuid, name: &str) -> Uuid {
        engine.dag(query).await.unwrap().task_by_name(name).unwrap().id
    }

    async fn finish(engine: &Orchestrator, task: Uuid, ok: bool) {
        engine
            .handle_status_update(&StatusUpdate::running(task, "agent-1"))
            .await
            .unwrap();
        let update = if ok {
            StatusUpdate::completed(task, json!("done"))
        } else {
            StatusUpdate::failed(task, "boom")
        };
        engine
            .handle_status_update(&update.from_agent("agent-1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_async_submit_returns_running_query() {
        let (engine, _) = engine(fan_out());
        let query = engine.submit(QuerySubmission::new("hello")).await.unwrap();
        assert_eq!(query.status, QueryStatus::Running);
        assert!(query.dag_id.is_some());
        assert_eq!(engine.dag(query.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cyclic_plan_fails_query_immediately() {
        let (engine, _) = engine(vec![
            TaskSpec::new("a", "t").after("b"),
            TaskSpec::new("b", "t").after("a"),
        ]);
        let query = engine.submit(QuerySubmission::new("loop")).await.unwrap();
        assert_eq!(query.status, QueryStatus::Failed);
        assert!(query.dag_id.is_none());
        assert!(query.error.unwrap().contains("cycle"));
    }

    #[tokio::test]
    async fn test_empty_plan_completes() {
        let (engine, _) = engine(vec![]);
        let query = engine
            .submit(QuerySubmission::new("nothing").sync())
            .await
            .unwrap();
        assert_eq!(query.status, QueryStatus::Completed);
    }

    #[tokio::test]
    async fn test_status_updates_drive_query_to_failed() {
        let (engine, _) = engine(fan_out());
        engine
            .handle_heartbeat(&Heartbeat::new("agent-1", vec!["x".into()], 0))
            .await;
        let query = engine.submit(QuerySubmission::new("q")).await.unwrap();

        assert_eq!(engine.tick().await.dispatched, 1);
        let a = task_id(&engine, query.id, "a").await;
        finish(&engine, a, true).await;

        assert_eq!(engine.tick().await.dispatched, 2);
        let b = task_id(&engine, query.id, "b").await;
        let c = task_id(&engine, query.id, "c").await;
        finish(&engine, b, false).await;
        assert_eq!(
            engine.get_query(query.id).await.unwrap().status,
            QueryStatus::Running
        );
        finish(&engine, c, true).await;

        let query = engine.wait(query.id).await.unwrap();
        assert_eq!(query.status, QueryStatus::Failed);
        assert_eq!(query.error.as_deref(), Some("task 'b' failed: boom"));
    }

    #[tokio::test]
    async fn test_duplicate_update_is_rejected_as_stale() {
        let (engine, _) = engine(vec![TaskSpec::new("a", "t")]);
        engine
            .handle_heartbeat(&Heartbeat::new("agent-1", vec![], 0))
            .await;
        let query = engine.submit(QuerySubmission::new("q")).await.unwrap();
        engine.tick().await;
        let a = task_id(&engine, query.id, "a").await;
        finish(&engine, a, true).await;

        let err = engine
            .handle_status_update(&StatusUpdate::completed(a, json!("late")))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskmeshError::InvalidTransition { .. }));
        let dag = engine.dag(query.id).await.unwrap();
        assert_eq!(dag.task(a).unwrap().result, Some(json!("done")));
        assert_eq!(
            engine.get_query(query.id).await.unwrap().status,
            QueryStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_cancel_skips_and_ignores_late_reports() {
        let (engine, _) = engine(fan_out());
        engine
            .handle_heartbeat(&Heartbeat::new("agent-1", vec!["x".into()], 0))
            .await;
        let query = engine.submit(QuerySubmission::new("q")).await.unwrap();
        engine.tick().await;
        let a = task_id(&engine, query.id, "a").await;

        let cancelled = engine.cancel(query.id).await.unwrap();
        assert_eq!(cancelled.status, QueryStatus::Failed);
        let dag = engine.dag(query.id).await.unwrap();
        assert_eq!(dag.count(TaskStatus::Skipped), 3);

        engine
            .handle_status_update(&StatusUpdate::completed(a, json!(1)).from_agent("agent-1"))
            .await
            .unwrap();
        assert_eq!(engine.tick().await, PassReport::default());
        assert_eq!(
            engine.dag(query.id).await.unwrap().task(a).unwrap().status,
            TaskStatus::Skipped
        );
        assert_eq!(engine.registry().get("agent-1").await.unwrap().load(), 0);
    }

    #[tokio::test]
    async fn test_unknown_task_update_is_not_found() {
        let (engine, _) = engine(vec![]);
        let err = engine
            .handle_status_update(&StatusUpdate::running(Uuid::new_v4(), "agent-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskmeshError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_queries_filters_and_orders() {
        let (engine, _) = engine(vec![TaskSpec::new("a", "t")]);
        let first = engine.submit(QuerySubmission::new("one")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = engine.submit(QuerySubmission::new("two")).await.unwrap();

        let all = engine.list_queries(None, 10).await;
        assert_eq!(all.iter().map(|q| q.id).collect::<Vec<_>>(), vec![second.id, first.id]);
        assert_eq!(engine.list_queries(None, 1).await.len(), 1);
        assert_eq!(engine.list_queries(Some(QueryStatus::Running), 10).await.len(), 2);
        assert!(engine
            .list_queries(Some(QueryStatus::Completed), 10)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_submission_metadata_is_kept() {
        let (engine, _) = engine(vec![]);
        let mut submission = QuerySubmission::new("with meta");
        submission.user_id = Some("user-1".into());
        submission.metadata.insert("source".into(), json!("cli"));
        let query = engine.submit(submission).await.unwrap();
        assert_eq!(query.user_id.as_deref(), Some("user-1"));
        assert_eq!(query.metadata["source"], "cli");
    }

    #[tokio::test]
    async fn test_health_reflects_bus_outage() {
        let (engine, bus) = engine(vec![]);
        assert_eq!(engine.health().await.status, crate::health::HealthStatus::Healthy);
        bus.set_online(false);
        assert_eq!(engine.health().await.status, crate::health::HealthStatus::Degraded);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = OrchestratorConfig {
            max_dispatch_passes: 0,
            ..OrchestratorConfig::default()
        };
        let result = Orchestrator::new(
            config,
            Arc::new(StaticPlanner::new(vec![])),
            Arc::new(InMemoryBus::new()),
            Arc::new(InMemoryKvStore::new()),
        );
        assert!(matches!(result, Err(TaskmeshError::Config(_))));
    }

    /// Hands back its task list after a delay.
    struct SlowPlanner {
        delay: Duration,
        specs: Vec<TaskSpec>,
    }

    #[async_trait]
    impl Planner for SlowPlanner {
        async fn plan(&self, _query: &Query) -> TaskmeshResult<Vec<TaskSpec>> {
            tokio::time::sleep(self.delay).await;
            Ok(self.specs.clone())
        }
    }

    #[tokio::test]
    async fn test_cancel_while_decomposing_discards_the_plan() {
        let planner = Arc::new(SlowPlanner {
            delay: Duration::from_millis(100),
            specs: fan_out(),
        });
        let (engine, _) = engine_with(planner, Arc::new(InMemoryKvStore::new()));
        engine
            .handle_heartbeat(&Heartbeat::new("agent-1", vec!["x".into()], 0))
            .await;

        let submitting = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.submit(QuerySubmission::new("slow")).await })
        };
        let query_id = loop {
            if let Some(q) = engine
                .list_queries(Some(QueryStatus::Decomposing), 1)
                .await
                .pop()
            {
                break q.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let cancelled = engine.cancel(query_id).await.unwrap();
        assert_eq!(cancelled.status, QueryStatus::Failed);

        let query = submitting.await.unwrap().unwrap();
        assert_eq!(query.status, QueryStatus::Failed);
        assert_eq!(query.error.as_deref(), Some("query cancelled"));
        assert!(query.dag_id.is_none());
        assert!(engine.dag(query_id).await.is_none());
        assert!(engine.runs.read().await.is_empty());
        assert_eq!(engine.tick().await, PassReport::default());
        assert_eq!(engine.registry().get("agent-1").await.unwrap().load(), 0);
    }

    #[tokio::test]
    async fn test_terminal_query_status_never_changes() {
        let (engine, _) = engine(vec![]);
        let query = engine.submit(QuerySubmission::new("done")).await.unwrap();
        assert_eq!(query.status, QueryStatus::Completed);

        engine
            .set_query_status(query.id, QueryStatus::Running, None)
            .await;
        engine
            .set_query_status(query.id, QueryStatus::Failed, Some("late".into()))
            .await;
        let query = engine.get_query(query.id).await.unwrap();
        assert_eq!(query.status, QueryStatus::Completed);
        assert!(query.error.is_none());
    }

    #[tokio::test]
    async fn test_delete_query_forgets_query_and_dag() {
        let kv = Arc::new(InMemoryKvStore::new());
        let (engine, _) = engine_with(Arc::new(StaticPlanner::new(fan_out())), kv.clone());
        engine
            .handle_heartbeat(&Heartbeat::new("agent-1", vec!["x".into()], 0))
            .await;
        let query = engine.submit(QuerySubmission::new("q")).await.unwrap();
        assert_eq!(engine.tick().await.dispatched, 1);
        let a = task_id(&engine, query.id, "a").await;

        let deleted = engine.delete_query(query.id).await.unwrap();
        assert_eq!(deleted.status, QueryStatus::Failed);
        assert!(engine.get_query(query.id).await.is_none());
        assert!(engine.dag(query.id).await.is_none());
        assert!(engine.runs.read().await.is_empty());
        assert!(engine.task_index.read().await.is_empty());
        assert!(engine.active.lock().is_empty());
        assert!(kv.is_empty());
        assert_eq!(engine.registry().get("agent-1").await.unwrap().load(), 0);

        let err = engine
            .handle_status_update(&StatusUpdate::completed(a, json!(1)).from_agent("agent-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskmeshError::NotFound(_)));
        assert!(matches!(
            engine.delete_query(query.id).await,
            Err(TaskmeshError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_finished_dags_leave_the_active_set() {
        let kv = Arc::new(InMemoryKvStore::new());
        let (engine, _) = engine_with(
            Arc::new(StaticPlanner::new(vec![TaskSpec::new("a", "t")])),
            kv.clone(),
        );
        engine
            .handle_heartbeat(&Heartbeat::new("agent-1", vec![], 0))
            .await;
        let done = engine.submit(QuerySubmission::new("one")).await.unwrap();
        let open = engine.submit(QuerySubmission::new("two")).await.unwrap();
        let open_dag = open.dag_id.unwrap();
        assert_eq!(engine.active.lock().len(), 2);
        assert_eq!(kv.smembers(ACTIVE_DAGS_KEY).await.unwrap().len(), 2);

        engine.tick().await;
        let a = task_id(&engine, done.id, "a").await;
        finish(&engine, a, true).await;

        assert_eq!(engine.active.lock().iter().copied().collect::<Vec<_>>(), vec![open_dag]);
        assert_eq!(
            kv.smembers(ACTIVE_DAGS_KEY).await.unwrap(),
            vec![open_dag.to_string()]
        );
        assert!(engine.dag(done.id).await.is_some());
    }
}
