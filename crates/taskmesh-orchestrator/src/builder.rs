use crate::types::{Dag, Task, DEFAULT_TASK_TIMEOUT_SECS};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use taskmesh_core::ValidationError;

/// Reference to another task spec in the same list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UpstreamRef {
    /// Zero-based position in the spec list.
    Index(usize),
    /// Task name.
    Name(String),
}

impl std::fmt::Display for UpstreamRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamRef::Index(i) => write!(f, "#{i}"),
            UpstreamRef::Name(n) => f.write_str(n),
        }
    }
}

impl From<&str> for UpstreamRef {
    fn from(name: &str) -> Self {
        UpstreamRef::Name(name.to_string())
    }
}

impl From<usize> for UpstreamRef {
    fn from(index: usize) -> Self {
        UpstreamRef::Index(index)
    }
}

/// Flat description of one task, as produced by query decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_complexity")]
    pub complexity: f64,
    #[serde(default)]
    pub upstream: Vec<UpstreamRef>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_complexity() -> f64 {
    1.0
}
fn default_timeout_secs() -> u64 {
    DEFAULT_TASK_TIMEOUT_SECS
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            task_type: task_type.into(),
            parameters: serde_json::Map::new(),
            capabilities: Vec::new(),
            complexity: default_complexity(),
            upstream: Vec::new(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn after<R: Into<UpstreamRef>>(mut self, upstream: R) -> Self {
        self.upstream.push(upstream.into());
        self
    }

    pub fn requires<S: Into<String>>(mut self, capability: S) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn complexity(mut self, complexity: f64) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Turns an ordered list of [`TaskSpec`]s into a validated [`Dag`].
///
/// Never touches the store or the bus.
pub struct DagBuilder {
    name: String,
    description: String,
    specs: Vec<TaskSpec>,
}

impl DagBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            specs: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn task(mut self, spec: TaskSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn tasks(mut self, specs: impl IntoIterator<Item = TaskSpec>) -> Self {
        self.specs.extend(specs);
        self
    }

    /// Resolve references, check for duplicates, and order topologically.
    pub fn build(self) -> Result<Dag, ValidationError> {
        let specs = self.specs;

        let mut by_name: HashMap<&str, usize> = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if by_name.insert(spec.name.as_str(), i).is_some() {
                return Err(ValidationError::DuplicateName(spec.name.clone()));
            }
        }

        // Resolve to indices, dropping repeated references to the same task.
        let mut upstream: Vec<Vec<usize>> = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let mut resolved = Vec::with_capacity(spec.upstream.len());
            for reference in &spec.upstream {
                let target = match reference {
                    UpstreamRef::Index(j) if *j < specs.len() => Some(*j),
                    UpstreamRef::Index(_) => None,
                    UpstreamRef::Name(n) => by_name.get(n.as_str()).copied(),
                };
                let Some(j) = target else {
                    return Err(ValidationError::DanglingReference {
                        task: spec.name.clone(),
                        reference: reference.to_string(),
                    });
                };
                if j == i {
                    return Err(ValidationError::SelfReference(spec.name.clone()));
                }
                if !resolved.contains(&j) {
                    resolved.push(j);
                }
            }
            upstream.push(resolved);
        }

        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
        for (i, ups) in upstream.iter().enumerate() {
            for &u in ups {
                downstream[u].push(i);
            }
        }

        let cyclic = kahn_leftover(&upstream, &downstream);
        if !cyclic.is_empty() {
            let tasks = cyclic.iter().map(|&i| specs[i].name.clone()).collect();
            return Err(ValidationError::Cycle { tasks });
        }

        let mut dag = Dag::new(self.name, self.description);
        let tasks: Vec<Task> = specs
            .into_iter()
            .map(|spec| {
                let mut task = Task::new(spec.name, spec.task_type);
                task.description = spec.description;
                task.parameters = spec.parameters;
                task.capabilities = spec.capabilities.into_iter().collect::<BTreeSet<_>>();
                task.complexity = spec.complexity;
                task.timeout_secs = spec.timeout_secs;
                task
            })
            .collect();
        let ids: Vec<_> = tasks.iter().map(|t| t.id).collect();
        for (i, mut task) in tasks.into_iter().enumerate() {
            task.upstream = upstream[i].iter().map(|&u| ids[u]).collect();
            task.downstream = downstream[i].iter().map(|&d| ids[d]).collect();
            dag.insert_raw(task);
        }

        tracing::debug!(dag = %dag.id, tasks = dag.len(), "DAG built");
        Ok(dag)
    }
}

/// Run Kahn's algorithm and return the tasks it could not order, narrowed
/// to the ones that sit on a cycle.
fn kahn_leftover(upstream: &[Vec<usize>], downstream: &[Vec<usize>]) -> Vec<usize> {
    let n = upstream.len();
    let mut indegree: Vec<usize> = upstream.iter().map(Vec::len).collect();
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut removed = vec![false; n];
    while let Some(i) = queue.pop_front() {
        removed[i] = true;
        for &d in &downstream[i] {
            indegree[d] -= 1;
            if indegree[d] == 0 {
                queue.push_back(d);
            }
        }
    }

    // Leftovers also include tasks that merely hang off a cycle. Peel away
    // those with no leftover downstream until only cycle members remain.
    let mut outdegree: Vec<usize> = (0..n)
        .map(|i| downstream[i].iter().filter(|&&d| !removed[d]).count())
        .collect();
    let mut peel: VecDeque<usize> = (0..n).filter(|&i| !removed[i] && outdegree[i] == 0).collect();
    while let Some(i) = peel.pop_front() {
        removed[i] = true;
        for &u in &upstream[i] {
            if !removed[u] {
                outdegree[u] -= 1;
                if outdegree[u] == 0 {
                    peel.push_back(u);
                }
            }
        }
    }

    (0..n).filter(|&i| !removed[i]).collect()
}
