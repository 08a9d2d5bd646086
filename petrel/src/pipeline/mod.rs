//! Task pipeline: the ordered, independently retryable units a launch is
//! driven through: environment setup, input staging, execution, output
//! staging and completion.
//!
//! Cancellation is cooperative: every stage boundary re-checks the shared
//! cancel flag and short-circuits to a `Canceled` outcome. Partial remote
//! state is not rolled back; remote schedulers own job termination.

mod execution;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::adaptor::{AdaptorError, RemoteExecution};
use crate::config::PollingConfig;
use crate::events::{ProcessStatusEvent, StatusPublisher};
use crate::parsers::SchedulerKind;
use crate::process::{ProcessLaunchEvent, ProcessState, ProcessStatus};
use crate::registry::Registry;
use crate::telemetry;

/// Shared cancellation flag for one pipeline run.
///
/// Set by the cancel-watch callback; observed at stage boundaries and
/// between status polls.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    inner: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

/// The ordered pipeline stages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StageKind {
    EnvironmentSetup,
    InputStaging,
    Execution,
    OutputStaging,
    Completing,
}

impl StageKind {
    pub const ORDERED: [StageKind; 5] = [
        StageKind::EnvironmentSetup,
        StageKind::InputStaging,
        StageKind::Execution,
        StageKind::OutputStaging,
        StageKind::Completing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::EnvironmentSetup => "environment-setup",
            StageKind::InputStaging => "input-staging",
            StageKind::Execution => "execution",
            StageKind::OutputStaging => "output-staging",
            StageKind::Completing => "completing",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure details carried out of a stage.
#[derive(Clone, Debug)]
pub struct StageFailure {
    /// Fatal failures cannot be retried by an outer workflow engine.
    pub fatal: bool,
    /// Short operator-safe summary.
    pub user_message: String,
    /// Full diagnostic for audit storage.
    pub diagnostic: String,
}

impl StageFailure {
    fn fatal(user_message: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            fatal: true,
            user_message: user_message.into(),
            diagnostic: diagnostic.into(),
        }
    }

    fn retryable(user_message: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            fatal: false,
            user_message: user_message.into(),
            diagnostic: diagnostic.into(),
        }
    }

    fn from_adaptor(stage: StageKind, err: &AdaptorError) -> Self {
        // Connection, protocol and command failures are all fatal for the
        // run that hit them; nothing downstream can proceed.
        Self::fatal(format!("{stage} failed"), format!("{err}"))
    }
}

/// Tri-state result of one stage.
#[derive(Clone, Debug)]
pub enum StageOutcome {
    Completed,
    Canceled,
    Failed(StageFailure),
}

/// Terminal result of a pipeline run.
#[derive(Clone, Debug)]
pub enum PipelineOutcome {
    Completed,
    Canceled,
    Failed(StageFailure),
}

/// One file to move between the storage and compute resources.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataStagingItem {
    /// File name; staging fails pre-flight when empty.
    pub name: String,
    /// Path on the storage resource.
    pub storage_path: String,
    /// Path on the compute resource.
    pub compute_path: String,
}

/// Everything the pipeline needs to drive one process, resolved upstream
/// from the application catalog and resource preferences.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessPlan {
    /// Remote working directory on the compute resource.
    pub working_directory: String,
    /// Local scratch directory for staging hops.
    pub scratch_directory: PathBuf,
    pub inputs: Vec<DataStagingItem>,
    pub outputs: Vec<DataStagingItem>,
    pub scheduler: SchedulerKind,
    /// Scheduler submit invocation, run inside the working directory.
    pub submit_command: String,
    /// Scheduler status-query invocation.
    pub status_command: String,
    /// Name the job was submitted under, for id recovery.
    pub job_name: String,
    /// Login account on the compute resource.
    pub login_username: String,
    /// Task identifier the job's status stream is attributed to.
    pub task_id: String,
}

/// Supplies the per-process plan. Resource selection and queue policy live
/// upstream; this core only consumes the result.
#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn plan_for(&self, event: &ProcessLaunchEvent) -> anyhow::Result<ProcessPlan>;
}

/// Seam the message handler dispatches through; lets handler tests run
/// without remote endpoints.
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    async fn run(&self, event: &ProcessLaunchEvent, cancel: &CancelFlag) -> PipelineOutcome;
}

/// The production pipeline over two remote-execution endpoints.
pub struct TaskPipeline {
    compute: Arc<dyn RemoteExecution>,
    storage: Arc<dyn RemoteExecution>,
    registry: Arc<dyn Registry>,
    publisher: Arc<dyn StatusPublisher>,
    plans: Arc<dyn PlanSource>,
    polling: PollingConfig,
}

impl std::fmt::Debug for TaskPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPipeline")
            .field("polling", &self.polling)
            .finish_non_exhaustive()
    }
}

impl TaskPipeline {
    pub fn new(
        compute: Arc<dyn RemoteExecution>,
        storage: Arc<dyn RemoteExecution>,
        registry: Arc<dyn Registry>,
        publisher: Arc<dyn StatusPublisher>,
        plans: Arc<dyn PlanSource>,
        polling: PollingConfig,
    ) -> Self {
        Self {
            compute,
            storage,
            registry,
            publisher,
            plans,
            polling,
        }
    }

    /// Drive one process through all stages.
    pub async fn run_plan(
        &self,
        event: &ProcessLaunchEvent,
        plan: &ProcessPlan,
        cancel: &CancelFlag,
    ) -> PipelineOutcome {
        for stage in StageKind::ORDERED {
            if cancel.is_set() {
                tracing::info!(
                    process_id = %event.process_id,
                    stage = %stage,
                    "cancellation observed at stage boundary"
                );
                return PipelineOutcome::Canceled;
            }

            let outcome = async {
                match stage {
                    StageKind::EnvironmentSetup => self.environment_setup(plan).await,
                    StageKind::InputStaging => self.input_staging(cancel, plan).await,
                    StageKind::Execution => self.execution(event, plan, cancel).await,
                    StageKind::OutputStaging => self.output_staging(cancel, plan).await,
                    StageKind::Completing => self.completing(event).await,
                }
            }
            .instrument(telemetry::stage_span(
                event.process_id.as_str(),
                stage.as_str(),
            ))
            .await;

            match outcome {
                StageOutcome::Completed => {}
                StageOutcome::Canceled => return PipelineOutcome::Canceled,
                StageOutcome::Failed(failure) => {
                    tracing::error!(
                        process_id = %event.process_id,
                        stage = %stage,
                        fatal = failure.fatal,
                        "stage failed: {}",
                        failure.diagnostic
                    );
                    return PipelineOutcome::Failed(failure);
                }
            }
        }
        PipelineOutcome::Completed
    }

    /// Create the remote working directory. Nothing downstream can proceed
    /// without it.
    async fn environment_setup(&self, plan: &ProcessPlan) -> StageOutcome {
        match self.compute.create_directory(&plan.working_directory).await {
            Ok(()) => StageOutcome::Completed,
            Err(err) => StageOutcome::Failed(StageFailure::from_adaptor(
                StageKind::EnvironmentSetup,
                &err,
            )),
        }
    }

    /// Stage declared inputs: storage resource -> local scratch -> compute
    /// resource. Validation of file names happens before any network use.
    async fn input_staging(&self, cancel: &CancelFlag, plan: &ProcessPlan) -> StageOutcome {
        for item in &plan.inputs {
            if item.name.trim().is_empty() {
                return StageOutcome::Failed(StageFailure::fatal(
                    "a required input file has no name",
                    format!("input staging item with empty name: {item:?}"),
                ));
            }
        }

        for item in &plan.inputs {
            if cancel.is_set() {
                return StageOutcome::Canceled;
            }
            let scratch = plan.scratch_directory.join(&item.name);
            if let Err(err) = self.storage.download_file(&item.storage_path, &scratch).await {
                return StageOutcome::Failed(StageFailure::from_adaptor(
                    StageKind::InputStaging,
                    &err,
                ));
            }
            if let Err(err) = self.compute.upload_file(&scratch, &item.compute_path).await {
                return StageOutcome::Failed(StageFailure::from_adaptor(
                    StageKind::InputStaging,
                    &err,
                ));
            }
            tracing::debug!(file = %item.name, "input staged to compute resource");
        }
        StageOutcome::Completed
    }

    /// Mirror of input staging: compute resource -> local scratch -> storage
    /// resource.
    async fn output_staging(&self, cancel: &CancelFlag, plan: &ProcessPlan) -> StageOutcome {
        for item in &plan.outputs {
            if cancel.is_set() {
                return StageOutcome::Canceled;
            }
            let scratch = plan.scratch_directory.join(&item.name);
            if let Err(err) = self.compute.download_file(&item.compute_path, &scratch).await {
                return StageOutcome::Failed(StageFailure::from_adaptor(
                    StageKind::OutputStaging,
                    &err,
                ));
            }
            if let Err(err) = self.storage.upload_file(&scratch, &item.storage_path).await {
                return StageOutcome::Failed(StageFailure::from_adaptor(
                    StageKind::OutputStaging,
                    &err,
                ));
            }
            tracing::debug!(file = %item.name, "output staged to storage resource");
        }
        StageOutcome::Completed
    }

    /// Persist final success; the handler's success continuation publishes
    /// the acknowledgement.
    async fn completing(&self, event: &ProcessLaunchEvent) -> StageOutcome {
        let status = ProcessStatus::new(ProcessState::Completed);
        if let Err(err) = self
            .registry
            .update_process_status(&event.process_id, status.clone())
            .await
        {
            return StageOutcome::Failed(StageFailure::retryable(
                "recording completion failed",
                format!("{err:#}"),
            ));
        }
        if let Err(err) = self
            .publisher
            .publish_process(ProcessStatusEvent::new(event, &status))
            .await
        {
            tracing::warn!(
                process_id = %event.process_id,
                "completed status publish failed: {err:#}"
            );
        }
        StageOutcome::Completed
    }
}

#[async_trait]
impl ProcessExecutor for TaskPipeline {
    async fn run(&self, event: &ProcessLaunchEvent, cancel: &CancelFlag) -> PipelineOutcome {
        let plan = match self.plans.plan_for(event).await {
            Ok(plan) => plan,
            Err(err) => {
                return PipelineOutcome::Failed(StageFailure::fatal(
                    "no execution plan available for process",
                    format!("{err:#}"),
                ));
            }
        };
        self.run_plan(event, &plan, cancel).await
    }
}
