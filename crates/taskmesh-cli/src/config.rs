use serde::Deserialize;
use std::path::Path;
use taskmesh_memory::StoreConfig;
use taskmesh_orchestrator::{OrchestratorConfig, TaskSpec};
use tracing_subscriber::EnvFilter;

/// Top-level `taskmesh.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct TaskmeshConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_level(),
        }
    }
}

/// Settings for the simulated agents started by `taskmesh run`.
#[derive(Debug, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_work_ms")]
    pub work_ms: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat_ms(),
            work_ms: default_work_ms(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_heartbeat_ms() -> u64 {
    1_000
}
fn default_work_ms() -> u64 {
    50
}

impl TaskmeshConfig {
    /// Read `path`, falling back to defaults when the file does not exist.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let config: TaskmeshConfig = match tokio::fs::read_to_string(path).await {
            Ok(raw) => toml::from_str(&raw).map_err(|e| {
                anyhow::anyhow!("Failed to parse config file '{}': {e}", path.display())
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TaskmeshConfig::default(),
            Err(e) => {
                anyhow::bail!("Failed to read config file '{}': {e}", path.display())
            }
        };
        config.orchestrator.validate()?;
        Ok(config)
    }
}

/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

/// A pre-decomposed query: the query text plus its task list.
#[derive(Debug, Deserialize)]
pub struct PlanFile {
    #[serde(default = "default_plan_name")]
    pub name: String,
    pub query: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

fn default_plan_name() -> String {
    "plan".to_string()
}

impl PlanFile {
    /// Load a plan from TOML, or JSON when the extension is `.json`.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read plan file '{}': {e}", path.display())
        })?;
        let plan = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&raw)?
        } else {
            toml::from_str(&raw)?
        };
        Ok(plan)
    }

    /// Every capability some task requires, deduplicated and sorted.
    pub fn capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self
            .tasks
            .iter()
            .flat_map(|t| t.capabilities.iter().cloned())
            .collect();
        caps.sort();
        caps.dedup();
        caps
    }
}
