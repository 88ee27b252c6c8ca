use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use taskmesh_core::Heartbeat;
use tokio::sync::RwLock;

/// What the dispatcher knows about one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub capabilities: BTreeSet<String>,
    /// Load the agent reported in its last heartbeat.
    pub reported_load: u32,
    /// Assignments made since that heartbeat.
    pub reserved: u32,
    /// Timestamp carried by the last heartbeat.
    pub reported_at: DateTime<Utc>,
    /// When the last heartbeat was received. Staleness is measured from here.
    pub last_seen: DateTime<Utc>,
}

impl AgentInfo {
    pub fn load(&self) -> u32 {
        self.reported_load.saturating_add(self.reserved)
    }

    pub fn can_run(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

/// Live view of agents built from heartbeats.
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, AgentInfo>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert or refresh an agent. The reported load replaces any local
    /// reservations made since the previous heartbeat.
    pub async fn record_heartbeat(&self, hb: &Heartbeat) {
        let mut agents = self.agents.write().await;
        let now = Utc::now();
        let is_new = !agents.contains_key(&hb.agent_id);
        agents.insert(
            hb.agent_id.clone(),
            AgentInfo {
                agent_id: hb.agent_id.clone(),
                capabilities: hb.capabilities.iter().cloned().collect(),
                reported_load: hb.load,
                reserved: 0,
                reported_at: hb.timestamp,
                last_seen: now,
            },
        );
        if is_new {
            tracing::info!(agent = %hb.agent_id, capabilities = ?hb.capabilities, "Agent joined");
        }
    }

    /// Drop agents silent for longer than `window`. Returns their ids.
    pub async fn evict_stale(&self, window: Duration) -> Vec<String> {
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(3650));
        let mut agents = self.agents.write().await;
        let stale: Vec<String> = agents
            .values()
            .filter(|a| a.last_seen < cutoff)
            .map(|a| a.agent_id.clone())
            .collect();
        for id in &stale {
            agents.remove(id);
            tracing::warn!(agent = %id, "Evicted agent with stale heartbeat");
        }
        stale
    }

    /// The eligible agent with the lowest load, ties broken by id.
    pub async fn select(&self, required: &BTreeSet<String>) -> Option<String> {
        let agents = self.agents.read().await;
        pick(&agents, required).map(|a| a.agent_id.clone())
    }

    /// Like [`select`](Self::select), but also counts the assignment against
    /// the chosen agent so the next pick in the same pass sees it.
    pub async fn reserve(&self, required: &BTreeSet<String>) -> Option<String> {
        let mut agents = self.agents.write().await;
        let id = pick(&agents, required)?.agent_id.clone();
        if let Some(agent) = agents.get_mut(&id) {
            agent.reserved += 1;
        }
        Some(id)
    }

    /// Undo one reservation or account for one finished task.
    pub async fn release(&self, agent_id: &str) {
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(agent_id) {
            if agent.reserved > 0 {
                agent.reserved -= 1;
            } else {
                agent.reported_load = agent.reported_load.saturating_sub(1);
            }
        }
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentInfo> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// All known agents, sorted by id.
    pub async fn snapshot(&self) -> Vec<AgentInfo> {
        let agents = self.agents.read().await;
        let mut all: Vec<AgentInfo> = agents.values().cloned().collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn pick<'a>(agents: &'a HashMap<String, AgentInfo>, required: &BTreeSet<String>) -> Option<&'a AgentInfo> {
    agents
        .values()
        .filter(|a| a.can_run(required))
        .min_by(|a, b| a.load().cmp(&b.load()).then_with(|| a.agent_id.cmp(&b.agent_id)))
}
