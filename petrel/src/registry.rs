use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::process::{ExperimentId, ProcessId, ProcessStatus};

/// Failure report attached to a process or experiment.
///
/// `user_message` is the short operator-safe summary surfaced to end users;
/// `diagnostic` carries the full wrapped error chain for auditing and is
/// never shown outside operator tooling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorReport {
    pub user_message: String,
    pub diagnostic: String,
    pub recorded_at: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(user_message: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            diagnostic: diagnostic.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// Interface boundary to the persistent registry/catalog collaborator.
///
/// Storage lives outside this core; the orchestration engine only reads the
/// last known status (crash-recovery on redelivery), appends transitions,
/// and records failure reports. Status history is append-only on the
/// registry side.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Last recorded status of a process, if the registry knows it.
    async fn process_status(&self, process_id: &ProcessId)
    -> anyhow::Result<Option<ProcessStatus>>;

    /// Append a status transition for a process.
    async fn update_process_status(
        &self,
        process_id: &ProcessId,
        status: ProcessStatus,
    ) -> anyhow::Result<()>;

    /// Attach a failure report to a process.
    async fn record_process_error(
        &self,
        process_id: &ProcessId,
        report: ErrorReport,
    ) -> anyhow::Result<()>;

    /// Attach a failure report to the experiment owning a failed process.
    async fn record_experiment_error(
        &self,
        experiment_id: &ExperimentId,
        report: ErrorReport,
    ) -> anyhow::Result<()>;
}
