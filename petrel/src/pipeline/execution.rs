//! Execution stage: submit the job, then poll the scheduler until the job
//! reaches a terminal state or the polling window closes.

use crate::adaptor::CommandOutput;
use crate::events::{JobStatusEvent, ProcessStatusEvent};
use crate::pipeline::{CancelFlag, ProcessPlan, StageFailure, StageKind, StageOutcome, TaskPipeline};
use crate::process::{JobState, JobStatus, ProcessLaunchEvent, ProcessState, ProcessStatus};

fn combined_output(output: &CommandOutput) -> String {
    if output.stderr.is_empty() {
        output.stdout.clone()
    } else {
        format!("{}\n{}", output.stdout, output.stderr)
    }
}

impl TaskPipeline {
    pub(super) async fn execution(
        &self,
        event: &ProcessLaunchEvent,
        plan: &ProcessPlan,
        cancel: &CancelFlag,
    ) -> StageOutcome {
        let submit_output = match self
            .compute
            .execute(&plan.submit_command, Some(&plan.working_directory))
            .await
        {
            Ok(output) => output,
            Err(err) => {
                return StageOutcome::Failed(StageFailure::from_adaptor(StageKind::Execution, &err));
            }
        };

        let combined = combined_output(&submit_output);
        if plan.scheduler.submission_failed(&combined) {
            return StageOutcome::Failed(StageFailure::fatal(
                "the scheduler rejected the job submission",
                format!("submit output: {combined}"),
            ));
        }

        let job_id = match self.resolve_job_id(plan, &submit_output).await {
            Ok(job_id) => job_id,
            Err(failure) => return StageOutcome::Failed(failure),
        };
        tracing::info!(
            process_id = %event.process_id,
            job_id,
            scheduler = %plan.scheduler,
            "job submitted"
        );
        self.publish_job_status(event, plan, &JobStatus::new(&job_id, JobState::Submitted))
            .await;

        let executing = ProcessStatus::new(ProcessState::Executing);
        if let Err(err) = self
            .registry
            .update_process_status(&event.process_id, executing.clone())
            .await
        {
            tracing::warn!(
                process_id = %event.process_id,
                "recording EXECUTING transition failed: {err:#}"
            );
        }
        if let Err(err) = self
            .publisher
            .publish_process(ProcessStatusEvent::new(event, &executing))
            .await
        {
            tracing::warn!(process_id = %event.process_id, "EXECUTING publish failed: {err:#}");
        }

        self.poll_until_terminal(event, plan, cancel, &job_id).await
    }

    /// The submit output is not always trustworthy; when it yields no id,
    /// one status listing is consulted to recover the id by job name.
    async fn resolve_job_id(
        &self,
        plan: &ProcessPlan,
        submit_output: &CommandOutput,
    ) -> Result<String, StageFailure> {
        if let Some(job_id) = plan.scheduler.parse_submission_id(&submit_output.stdout) {
            if !job_id.is_empty() {
                return Ok(job_id);
            }
        }

        tracing::warn!(
            job_name = %plan.job_name,
            "submit output carried no job id; recovering by job name"
        );
        let listing = self
            .compute
            .execute(&plan.status_command, None)
            .await
            .map_err(|err| StageFailure::from_adaptor(StageKind::Execution, &err))?;
        plan.scheduler
            .parse_job_id_by_name(&plan.job_name, &listing.stdout)
            .ok_or_else(|| {
                StageFailure::fatal(
                    "the scheduler returned no job id for the submission",
                    format!(
                        "submit output: {}; status listing: {}",
                        combined_output(submit_output),
                        listing.stdout
                    ),
                )
            })
    }

    async fn poll_until_terminal(
        &self,
        event: &ProcessLaunchEvent,
        plan: &ProcessPlan,
        cancel: &CancelFlag,
        job_id: &str,
    ) -> StageOutcome {
        let deadline = tokio::time::Instant::now() + self.polling.timeout();
        let mut last_state = JobState::Submitted;

        loop {
            if cancel.is_set() {
                tracing::info!(job_id, "cancellation observed between status polls");
                return StageOutcome::Canceled;
            }

            match self.compute.execute(&plan.status_command, None).await {
                Err(err) => {
                    return StageOutcome::Failed(StageFailure::retryable(
                        "querying job status failed",
                        format!("{err}"),
                    ));
                }
                Ok(output) => {
                    match plan.scheduler.parse_job_status(job_id, &output.stdout) {
                        Some(status) => {
                            if status.state != last_state {
                                tracing::info!(job_id, state = %status.state, "job state change");
                                self.publish_job_status(event, plan, &status).await;
                                last_state = status.state;
                            }
                            if status.state.is_terminal() {
                                return match status.state {
                                    JobState::Complete => StageOutcome::Completed,
                                    JobState::Canceled => StageOutcome::Canceled,
                                    _ => StageOutcome::Failed(StageFailure::fatal(
                                        format!("job {job_id} ended in state {}", status.state),
                                        format!("status listing: {}", output.stdout),
                                    )),
                                };
                            }
                        }
                        // A momentarily absent job id is not an error; it
                        // may not have appeared in the listing yet.
                        None => tracing::trace!(job_id, "job not visible in status listing"),
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return StageOutcome::Failed(StageFailure::retryable(
                    format!("job {job_id} did not reach a terminal state in time"),
                    format!(
                        "no terminal status after {}s of polling",
                        self.polling.timeout_secs
                    ),
                ));
            }
            tokio::time::sleep(self.polling.interval()).await;
        }
    }

    async fn publish_job_status(
        &self,
        event: &ProcessLaunchEvent,
        plan: &ProcessPlan,
        status: &JobStatus,
    ) {
        let job_event = JobStatusEvent::new(event, plan.task_id.clone(), status);
        if let Err(err) = self.publisher.publish_job(job_event).await {
            tracing::warn!(job_id = %status.job_id, "job status publish failed: {err:#}");
        }
    }
}
