use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskmesh_channels::MessageBus;
use taskmesh_core::TaskmeshResult;
use taskmesh_memory::KvStore;
use tracing::warn;

/// Component name reported for the state store.
pub const DATABASE_COMPONENT: &str = "database";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Some components are down; partial progress is still possible.
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Healthy if every component is, unhealthy if none is, degraded
    /// otherwise.
    pub fn aggregate<'a>(components: impl IntoIterator<Item = &'a ComponentHealth>) -> Self {
        let (mut up, mut total) = (0usize, 0usize);
        for c in components {
            total += 1;
            if c.status == HealthStatus::Healthy {
                up += 1;
            }
        }
        if up == total {
            HealthStatus::Healthy
        } else if up == 0 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

impl ComponentHealth {
    fn from_ping(result: TaskmeshResult<()>, elapsed: Duration) -> Self {
        let latency_ms = elapsed.as_millis() as u64;
        match result {
            Ok(()) => Self {
                status: HealthStatus::Healthy,
                error: None,
                latency_ms,
            },
            Err(e) => Self {
                status: HealthStatus::Unhealthy,
                error: Some(e.to_string()),
                latency_ms,
            },
        }
    }
}

/// Overall status plus per-component detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    pub checked_at: DateTime<Utc>,
}

/// Pings the state store and the message bus.
pub struct HealthAggregator {
    store: Arc<dyn KvStore>,
    bus: Arc<dyn MessageBus>,
    timeout: Duration,
}

impl HealthAggregator {
    pub fn new(store: Arc<dyn KvStore>, bus: Arc<dyn MessageBus>, timeout: Duration) -> Self {
        Self {
            store,
            bus,
            timeout,
        }
    }

    /// Ping both components concurrently, each bounded by the timeout.
    pub async fn check(&self) -> HealthReport {
        let (database, bus) = tokio::join!(
            timed_ping(self.timeout, self.store.ping()),
            timed_ping(self.timeout, self.bus.ping()),
        );

        let mut components = BTreeMap::new();
        components.insert(DATABASE_COMPONENT.to_string(), database);
        components.insert(self.bus.name().to_string(), bus);

        for (name, c) in &components {
            if let Some(error) = &c.error {
                warn!(component = %name, error = %error, "Health check failed");
            }
        }

        HealthReport {
            status: HealthStatus::aggregate(components.values()),
            components,
            checked_at: Utc::now(),
        }
    }
}

async fn timed_ping<F>(timeout: Duration, fut: F) -> ComponentHealth
where
    F: std::future::Future<Output = TaskmeshResult<()>>,
{
    let start = Instant::now();
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => ComponentHealth::from_ping(result, start.elapsed()),
        Err(_) => ComponentHealth {
            status: HealthStatus::Unhealthy,
            error: Some(format!("no response within {timeout:?}")),
            latency_ms: start.elapsed().as_millis() as u64,
        },
    }
}
