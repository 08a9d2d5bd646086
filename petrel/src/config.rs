use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identity of this orchestrator instance in the coordination namespace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Component name under `/servers` (one per deployed service kind).
    pub component: String,
    /// Unique instance name under the component node.
    pub instance_name: String,
    /// `host:port` advertised at the instance node.
    pub host_port: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            component: "petrel".to_string(),
            instance_name: format!("petrel-{}", std::process::id()),
            host_port: "localhost:8950".to_string(),
        }
    }
}

/// Worker pool sizing for task-pipeline dispatch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Maximum concurrently running pipelines.
    pub size: usize,
    /// Seconds to wait for in-flight pipelines during shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            size: 8,
            shutdown_grace_secs: 30,
        }
    }
}

/// Job status polling cadence for the execution stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Seconds between status-command invocations.
    pub interval_secs: u64,
    /// Seconds after which an unterminated job fails the execution stage.
    pub timeout_secs: u64,
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 60 * 60 * 24,
        }
    }
}

/// Top-level orchestrator settings. Loading these from files or the
/// environment is the bootstrap's concern, not this crate's.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub instance: InstanceConfig,
    pub worker_pool: WorkerPoolConfig,
    pub polling: PollingConfig,
}
