use crate::scheduler::FailurePolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use taskmesh_core::{TaskmeshError, TaskmeshResult};

/// `[orchestrator]` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Delay between dispatch passes while work is flowing.
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    /// Cap on the pass delay when passes keep failing to place work.
    #[serde(default = "default_dispatch_backoff_max_ms")]
    pub dispatch_backoff_max_ms: u64,
    /// How long an assignment may go unacknowledged before it is reclaimed.
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    /// Agents silent for longer than this are no longer eligible.
    #[serde(default = "default_heartbeat_stale_secs")]
    pub heartbeat_stale_secs: u64,
    /// Passes a ready task may go without an eligible agent before it fails.
    #[serde(default = "default_max_dispatch_passes")]
    pub max_dispatch_passes: u32,
    /// Bound on a single publish or health check.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_dispatch_interval_ms() -> u64 {
    500
}
fn default_dispatch_backoff_max_ms() -> u64 {
    8_000
}
fn default_ack_timeout_secs() -> u64 {
    60
}
fn default_heartbeat_stale_secs() -> u64 {
    90
}
fn default_max_dispatch_passes() -> u32 {
    20
}
fn default_io_timeout_ms() -> u64 {
    2_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: default_dispatch_interval_ms(),
            dispatch_backoff_max_ms: default_dispatch_backoff_max_ms(),
            ack_timeout_secs: default_ack_timeout_secs(),
            heartbeat_stale_secs: default_heartbeat_stale_secs(),
            max_dispatch_passes: default_max_dispatch_passes(),
            io_timeout_ms: default_io_timeout_ms(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> TaskmeshResult<()> {
        if self.dispatch_interval_ms == 0 {
            return Err(TaskmeshError::Config(
                "orchestrator.dispatch_interval_ms must be positive".into(),
            ));
        }
        if self.dispatch_backoff_max_ms < self.dispatch_interval_ms {
            return Err(TaskmeshError::Config(
                "orchestrator.dispatch_backoff_max_ms must be >= dispatch_interval_ms".into(),
            ));
        }
        if self.max_dispatch_passes == 0 {
            return Err(TaskmeshError::Config(
                "orchestrator.max_dispatch_passes must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn dispatch_backoff_max(&self) -> Duration {
        Duration::from_millis(self.dispatch_backoff_max_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn heartbeat_stale(&self) -> Duration {
        Duration::from_secs(self.heartbeat_stale_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_section_uses_defaults() {
        let config: OrchestratorConfig = toml::from_str("").unwrap();
        assert_eq!(config.dispatch_interval_ms, 500);
        assert_eq!(config.ack_timeout_secs, 60);
        assert_eq!(config.heartbeat_stale_secs, 90);
        assert_eq!(config.max_dispatch_passes, 20);
        assert_eq!(config.failure_policy, FailurePolicy::Cascade);
        config.validate().unwrap();
    }

    #[test]
    fn test_halt_policy_parses() {
        let config: OrchestratorConfig = toml::from_str(r#"failure_policy = "halt""#).unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::Halt);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = OrchestratorConfig {
            dispatch_interval_ms: 0,
            ..OrchestratorConfig::default()
        };
        assert!(config.validate().is_err());

        let config = OrchestratorConfig {
            dispatch_backoff_max_ms: 10,
            ..OrchestratorConfig::default()
        };
        assert!(config.validate().is_err());

        let config = OrchestratorConfig {
            max_dispatch_passes: 0,
            ..OrchestratorConfig::default()
        };
        assert!(matches!(config.validate(), Err(TaskmeshError::Config(_))));
    }
}
