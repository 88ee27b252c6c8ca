mod config;
mod worker;

use clap::{Parser, Subcommand};
use config::{init_tracing, PlanFile, TaskmeshConfig};
use serde_json::json;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taskmesh_channels::InMemoryBus;
use taskmesh_memory::{open_store, AgentStore};
use taskmesh_orchestrator::{
    DagBuilder, HealthAggregator, HealthStatus, Orchestrator, QueryStatus, QuerySubmission,
    StaticPlanner,
};
use tracing::info;
use worker::SimulatedAgent;

#[derive(Parser)]
#[command(name = "taskmesh", about = "Taskmesh — DAG task orchestration over a message bus")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "taskmesh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a plan file and print its execution order
    Validate {
        /// Plan file (TOML, or JSON with a .json extension)
        plan: PathBuf,
    },
    /// Run a plan to completion against simulated in-process agents
    Run {
        plan: PathBuf,
        /// Number of simulated agents
        #[arg(short, long, default_value_t = 2)]
        agents: usize,
        /// Task names the agents should report as failed
        #[arg(long)]
        fail: Vec<String>,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
    /// Check the state store and message bus
    Health,
    /// Show an agent's stored state and memory
    Memory {
        agent: String,
        /// Entries per memory type
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TaskmeshConfig::load(&cli.config).await?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Validate { plan } => {
            let plan = PlanFile::load(&plan).await?;
            let dag = DagBuilder::new(plan.name)
                .description(plan.query)
                .tasks(plan.tasks)
                .build()?;
            let order: Vec<&str> = dag
                .topological_order()
                .into_iter()
                .filter_map(|id| dag.task(id).map(|t| t.name.as_str()))
                .collect();
            print_json(&json!({ "dag": dag.name, "tasks": dag.len(), "order": order }))?;
        }
        Commands::Run {
            plan,
            agents,
            fail,
            timeout_secs,
        } => {
            let plan = PlanFile::load(&plan).await?;
            let bus = Arc::new(InMemoryBus::new());
            let kv = open_store(&config.store).await?;
            let store = Arc::new(AgentStore::new(kv.clone(), &config.store));

            let capabilities = plan.capabilities();
            let engine = Arc::new(Orchestrator::new(
                config.orchestrator,
                Arc::new(StaticPlanner::new(plan.tasks)),
                bus.clone(),
                kv,
            )?);
            let handle = engine.start().await?;

            let fail: Arc<HashSet<String>> = Arc::new(fail.into_iter().collect());
            let mut workers = Vec::new();
            for i in 1..=agents {
                let agent = SimulatedAgent::new(
                    bus.clone(),
                    store.clone(),
                    format!("agent-{i}"),
                    capabilities.clone(),
                    fail.clone(),
                    Duration::from_millis(config.agents.work_ms),
                );
                workers.extend(agent.spawn(Duration::from_millis(config.agents.heartbeat_ms)).await?);
            }
            info!(agents, capabilities = ?capabilities, "Simulated agents started");

            let mut submission = QuerySubmission::new(plan.query).sync();
            submission.user_id = plan.user_id;
            let outcome = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                engine.submit(submission),
            )
            .await;

            for w in &workers {
                w.abort();
            }
            handle.shutdown().await;

            let query = outcome
                .map_err(|_| anyhow::anyhow!("query did not finish within {timeout_secs}s"))??;
            let tasks = engine
                .dag(query.id)
                .await
                .map(|dag| dag.tasks().into_iter().cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            print_json(&json!({ "query": query, "tasks": tasks }))?;

            if query.status == QueryStatus::Failed {
                anyhow::bail!(
                    "query failed: {}",
                    query.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::Health => {
            let kv = open_store(&config.store).await?;
            let bus = Arc::new(InMemoryBus::new());
            let report = HealthAggregator::new(kv, bus, config.orchestrator.io_timeout())
                .check()
                .await;
            print_json(&report)?;
            if report.status == HealthStatus::Unhealthy {
                anyhow::bail!("all components are down");
            }
        }
        Commands::Memory { agent, limit } => {
            let kv = open_store(&config.store).await?;
            let store = AgentStore::new(kv, &config.store);
            let state = store.get_state(&agent).await?;
            let memory = store.get_all_memory(&agent, limit).await?;
            print_json(&json!({ "agent": agent, "state": state, "memory": memory }))?;
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
