use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use taskmesh_core::{TaskStatus, ValidationError};
use uuid::Uuid;

/// Default upper bound on a task's execution time.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 3600;

/// Lifecycle of a user query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Received,
    Decomposing,
    Running,
    Completed,
    Failed,
}

impl QueryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueryStatus::Completed | QueryStatus::Failed)
    }
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryStatus::Received => write!(f, "received"),
            QueryStatus::Decomposing => write!(f, "decomposing"),
            QueryStatus::Running => write!(f, "running"),
            QueryStatus::Completed => write!(f, "completed"),
            QueryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One user request and the DAG it decomposed into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: Uuid,
    pub content: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub status: QueryStatus,
    /// Set once decomposition produced a valid DAG.
    #[serde(default)]
    pub dag_id: Option<Uuid>,
    /// Human-readable reason for a failed query.
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Query {
    pub fn new(content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            user_id: None,
            metadata: serde_json::Map::new(),
            status: QueryStatus::Received,
            dag_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `status`, stamping `updated_at`.
    pub fn advance(&mut self, status: QueryStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// A unit of work inside a DAG.
///
/// Only the scheduler changes `status` and `assigned_agent`. Edges are kept
/// in both directions so neighbours are available without scanning the DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub dag_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub task_type: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub status: TaskStatus,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    /// Estimated cost; cheaper tasks are dispatched first.
    pub complexity: f64,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub upstream: Vec<Uuid>,
    #[serde(default)]
    pub downstream: Vec<Uuid>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub progress: Option<f32>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub timeout_secs: u64,
    /// Insertion position within the DAG, used as creation order.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            dag_id: Uuid::nil(),
            name: name.into(),
            description: String::new(),
            task_type: task_type.into(),
            parameters: serde_json::Map::new(),
            status: TaskStatus::Pending,
            assigned_agent: None,
            complexity: 1.0,
            capabilities: BTreeSet::new(),
            upstream: Vec::new(),
            downstream: Vec::new(),
            result: None,
            error: None,
            progress: None,
            duration_ms: None,
            timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            seq: 0,
            created_at: now,
            updated_at: now,
            assigned_at: None,
            started_at: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_upstream(mut self, upstream: Vec<Uuid>) -> Self {
        self.upstream = upstream;
        self
    }

    pub(crate) fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Directed acyclic graph of tasks belonging to one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dag {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Incremented on every structural edit.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub(crate) tasks: HashMap<Uuid, Task>,
    pub(crate) next_seq: u64,
}

impl Dag {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            version: 1,
            created_at: now,
            updated_at: now,
            tasks: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn task(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub(crate) fn task_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn task_by_name(&self, name: &str) -> Option<&Task> {
        self.tasks.values().find(|t| t.name == name)
    }

    /// All tasks in creation order.
    pub fn tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Every task is completed, failed or skipped.
    pub fn is_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    fn bump_version(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Insert without touching the version. Used while building.
    pub(crate) fn insert_raw(&mut self, mut task: Task) -> Uuid {
        task.dag_id = self.id;
        task.seq = self.next_seq;
        self.next_seq += 1;
        let id = task.id;
        self.tasks.insert(id, task);
        id
    }

    /// Add a task whose declared upstream tasks already exist in this DAG.
    ///
    /// A new task has no downstream yet, so this can never close a cycle.
    pub fn add_task(&mut self, mut task: Task) -> Result<Uuid, ValidationError> {
        if self.tasks.contains_key(&task.id) || self.task_by_name(&task.name).is_some() {
            return Err(ValidationError::DuplicateName(task.name));
        }
        let mut seen = HashSet::new();
        task.upstream.retain(|id| seen.insert(*id));
        if task.upstream.contains(&task.id) {
            return Err(ValidationError::SelfReference(task.name));
        }
        if let Some(missing) = task.upstream.iter().find(|id| !self.tasks.contains_key(id)) {
            return Err(ValidationError::UnknownTask(*missing));
        }
        task.downstream.clear();

        let upstream = task.upstream.clone();
        let id = self.insert_raw(task);
        for up in upstream {
            if let Some(parent) = self.tasks.get_mut(&up) {
                parent.downstream.push(id);
            }
        }
        self.bump_version();
        Ok(id)
    }

    /// Add the edge `upstream -> downstream`.
    ///
    /// Rejects the edit, leaving the DAG untouched, if it would close a
    /// cycle. Adding an existing edge is a no-op and does not bump the
    /// version.
    pub fn add_dependency(&mut self, upstream: Uuid, downstream: Uuid) -> Result<(), ValidationError> {
        let down_name = match self.tasks.get(&downstream) {
            Some(t) => t.name.clone(),
            None => return Err(ValidationError::UnknownTask(downstream)),
        };
        if !self.tasks.contains_key(&upstream) {
            return Err(ValidationError::UnknownTask(upstream));
        }
        if upstream == downstream {
            return Err(ValidationError::SelfReference(down_name));
        }
        if self.tasks[&downstream].upstream.contains(&upstream) {
            return Ok(());
        }
        if let Some(path) = self.path(downstream, upstream) {
            let tasks = path
                .iter()
                .filter_map(|id| self.tasks.get(id).map(|t| t.name.clone()))
                .collect();
            return Err(ValidationError::Cycle { tasks });
        }

        if let Some(t) = self.tasks.get_mut(&downstream) {
            t.upstream.push(upstream);
        }
        if let Some(t) = self.tasks.get_mut(&upstream) {
            t.downstream.push(downstream);
        }
        self.bump_version();
        Ok(())
    }

    /// A downstream path `from -> ... -> to`, if one exists.
    fn path(&self, from: Uuid, to: Uuid) -> Option<Vec<Uuid>> {
        let mut parent: HashMap<Uuid, Uuid> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        let mut seen = HashSet::from([from]);
        while let Some(id) = queue.pop_front() {
            if id == to {
                let mut path = vec![to];
                let mut cur = to;
                while let Some(p) = parent.get(&cur) {
                    path.push(*p);
                    cur = *p;
                }
                path.reverse();
                return Some(path);
            }
            for next in self.tasks.get(&id).map(|t| t.downstream.as_slice()).unwrap_or_default() {
                if seen.insert(*next) {
                    parent.insert(*next, id);
                    queue.push_back(*next);
                }
            }
        }
        None
    }

    /// Every task reachable through downstream edges, excluding `id`.
    pub fn descendants(&self, id: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut queue = VecDeque::from([id]);
        while let Some(cur) = queue.pop_front() {
            for next in self.tasks.get(&cur).map(|t| t.downstream.as_slice()).unwrap_or_default() {
                if seen.insert(*next) {
                    out.push(*next);
                    queue.push_back(*next);
                }
            }
        }
        out
    }

    /// Tasks in a dependency-respecting order, ties broken by creation order.
    pub fn topological_order(&self) -> Vec<Uuid> {
        let mut indegree: HashMap<Uuid, usize> =
            self.tasks.values().map(|t| (t.id, t.upstream.len())).collect();
        let mut frontier: Vec<&Task> = self.tasks.values().filter(|t| t.upstream.is_empty()).collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        while !frontier.is_empty() {
            frontier.sort_by_key(|t| std::cmp::Reverse(t.seq));
            let Some(task) = frontier.pop() else { break };
            order.push(task.id);
            for next in &task.downstream {
                if let Some(d) = indegree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        if let Some(t) = self.tasks.get(next) {
                            frontier.push(t);
                        }
                    }
                }
            }
        }
        order
    }
}
