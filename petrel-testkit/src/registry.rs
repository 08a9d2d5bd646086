use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use petrel::{ErrorReport, ExperimentId, ProcessId, ProcessState, ProcessStatus, Registry};

/// In-memory registry collaborator with assertion helpers.
///
/// Status history is append-only per process, like the real catalog.
#[derive(Default)]
pub struct InMemoryRegistry {
    statuses: Mutex<HashMap<String, Vec<ProcessStatus>>>,
    process_errors: Mutex<Vec<(String, ErrorReport)>>,
    experiment_errors: Mutex<Vec<(String, ErrorReport)>>,
}

impl std::fmt::Debug for InMemoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRegistry")
            .field("processes", &self.statuses.lock().len())
            .finish_non_exhaustive()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a prior status, emulating state persisted by a crashed instance.
    pub fn seed_status(&self, process_id: &str, status: ProcessStatus) {
        self.statuses
            .lock()
            .entry(process_id.to_string())
            .or_default()
            .push(status);
    }

    /// Full state history of a process, in persistence order.
    pub fn states_of(&self, process_id: &str) -> Vec<ProcessState> {
        self.statuses
            .lock()
            .get(process_id)
            .map(|history| history.iter().map(|status| status.state).collect())
            .unwrap_or_default()
    }

    pub fn process_errors(&self) -> Vec<(String, ErrorReport)> {
        self.process_errors.lock().clone()
    }

    pub fn experiment_errors(&self) -> Vec<(String, ErrorReport)> {
        self.experiment_errors.lock().clone()
    }

    pub fn assert_terminal_state_eq(&self, process_id: &str, expected: ProcessState) {
        let states = self.states_of(process_id);
        assert_eq!(
            states.last().copied(),
            Some(expected),
            "process {process_id} history: {states:?}"
        );
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn process_status(
        &self,
        process_id: &ProcessId,
    ) -> anyhow::Result<Option<ProcessStatus>> {
        Ok(self
            .statuses
            .lock()
            .get(process_id.as_str())
            .and_then(|history| history.last().cloned()))
    }

    async fn update_process_status(
        &self,
        process_id: &ProcessId,
        status: ProcessStatus,
    ) -> anyhow::Result<()> {
        tracing::debug!(process_id = %process_id, state = %status.state, "status persisted");
        self.statuses
            .lock()
            .entry(process_id.as_str().to_string())
            .or_default()
            .push(status);
        Ok(())
    }

    async fn record_process_error(
        &self,
        process_id: &ProcessId,
        report: ErrorReport,
    ) -> anyhow::Result<()> {
        self.process_errors
            .lock()
            .push((process_id.as_str().to_string(), report));
        Ok(())
    }

    async fn record_experiment_error(
        &self,
        experiment_id: &ExperimentId,
        report: ErrorReport,
    ) -> anyhow::Result<()> {
        self.experiment_errors
            .lock()
            .push((experiment_id.as_str().to_string(), report));
        Ok(())
    }
}
