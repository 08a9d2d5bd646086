//! Process-launch message handler: the state machine tying the inbound bus,
//! the coordination namespace, the registry and the worker pool together.
//!
//! `handle` is idempotent with respect to at-least-once delivery, and every
//! code path, error paths included, reaches a message acknowledgement. Unrecoverable failures become terminal FAILED states
//! rather than broker redeliveries; only transport-level redelivery
//! re-enters the handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::InstanceConfig;
use crate::coordination::CoordinationStore;
use crate::events::{ProcessStatusEvent, StatusPublisher};
use crate::messaging::{AckChannel, DeliveryEnvelope, LaunchMessage, ProcessTerminateEvent};
use crate::pipeline::{CancelFlag, PipelineOutcome, ProcessExecutor, StageFailure};
use crate::process::{ProcessLaunchEvent, ProcessState, ProcessStatus};
use crate::registry::{ErrorReport, Registry};
use crate::runtime::{ShutdownToken, WorkerPool};
use crate::telemetry;

/// Whether a launch was fully handled inline or must be dispatched to a
/// pipeline run that acknowledges it on completion.
enum Handled {
    AckNow,
    Dispatch { cancel: CancelFlag },
}

pub struct ProcessLaunchHandler {
    instance: InstanceConfig,
    coordination: Arc<dyn CoordinationStore>,
    registry: Arc<dyn Registry>,
    publisher: Arc<dyn StatusPublisher>,
    executor: Arc<dyn ProcessExecutor>,
    pool: Arc<WorkerPool>,
    acks: Arc<dyn AckChannel>,
    requests_handled: AtomicU64,
}

impl std::fmt::Debug for ProcessLaunchHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLaunchHandler")
            .field("instance", &self.instance.instance_name)
            .field("requests_handled", &self.requests_handled.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ProcessLaunchHandler {
    pub fn new(
        instance: InstanceConfig,
        coordination: Arc<dyn CoordinationStore>,
        registry: Arc<dyn Registry>,
        publisher: Arc<dyn StatusPublisher>,
        executor: Arc<dyn ProcessExecutor>,
        pool: Arc<WorkerPool>,
        acks: Arc<dyn AckChannel>,
    ) -> Self {
        Self {
            instance,
            coordination,
            registry,
            publisher,
            executor,
            pool,
            acks,
            requests_handled: AtomicU64::new(0),
        }
    }

    /// Register this instance in the coordination namespace. Call once
    /// before consuming messages.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.coordination
            .register_instance(
                &self.instance.component,
                &self.instance.instance_name,
                &self.instance.host_port,
            )
            .await?;
        tracing::info!(
            instance = %self.instance.instance_name,
            host_port = %self.instance.host_port,
            "orchestrator instance registered"
        );
        Ok(())
    }

    /// Launches and terminations handled by this instance so far.
    pub fn requests_handled(&self) -> u64 {
        self.requests_handled.load(Ordering::SeqCst)
    }

    /// Entry point for one delivery. Never leaves the message unacknowledged.
    pub async fn handle(self: Arc<Self>, envelope: DeliveryEnvelope) {
        self.requests_handled.fetch_add(1, Ordering::SeqCst);
        telemetry::record_message_received(envelope.redelivered);

        match envelope.message.clone() {
            LaunchMessage::Launch(event) => {
                let span = telemetry::launch_span(
                    event.process_id.as_str(),
                    event.experiment_id.as_str(),
                    envelope.redelivered,
                );
                match self
                    .on_launch(&event, envelope.delivery_tag, envelope.redelivered)
                    .instrument(span)
                    .await
                {
                    Ok(Handled::AckNow) => self.ack(envelope.delivery_tag).await,
                    Ok(Handled::Dispatch { cancel }) => {
                        self.dispatch(event, envelope.delivery_tag, cancel).await;
                    }
                    Err(err) => {
                        tracing::error!(
                            process_id = %event.process_id,
                            "launch handling failed: {err:#}"
                        );
                        self.fail_process(
                            &event,
                            &StageFailure {
                                fatal: true,
                                user_message: "process launch handling failed".to_string(),
                                diagnostic: format!("{err:#}"),
                            },
                        )
                        .await;
                        let _ = self
                            .coordination
                            .delete_process_node(&event.experiment_id, &event.process_id)
                            .await;
                        self.ack(envelope.delivery_tag).await;
                    }
                }
            }
            LaunchMessage::Terminate(event) => {
                self.on_terminate(&event).await;
                self.ack(envelope.delivery_tag).await;
            }
        }
    }

    async fn on_launch(
        &self,
        event: &ProcessLaunchEvent,
        delivery_tag: u64,
        redelivered: bool,
    ) -> anyhow::Result<Handled> {
        // Duplicate suppression: a redelivery for a process with a live
        // owner only refreshes the stored tag.
        if redelivered {
            if let Some(owner) = self
                .coordination
                .process_owner(&event.experiment_id, &event.process_id)
                .await?
            {
                let live = self
                    .coordination
                    .live_instances(&self.instance.component)
                    .await?
                    .contains(&owner);
                if live {
                    self.coordination
                        .update_delivery_tag(&event.experiment_id, &event.process_id, delivery_tag)
                        .await?;
                    tracing::info!(
                        process_id = %event.process_id,
                        owner,
                        "redelivery absorbed; delivery tag refreshed"
                    );
                    telemetry::record_redelivery_absorbed();
                    return Ok(Handled::AckNow);
                }
                tracing::warn!(
                    process_id = %event.process_id,
                    owner,
                    "recorded owner is not live; resuming the process here"
                );
            }
        }

        // The owning instance may have crashed mid-flight; the registry has
        // the last persisted state to resume from.
        let mut state = ProcessState::Started;
        if redelivered {
            if let Some(prior) = self.registry.process_status(&event.process_id).await? {
                if prior.state.is_terminal() {
                    tracing::info!(
                        process_id = %event.process_id,
                        state = %prior.state,
                        "redelivery for a terminal process; nothing to do"
                    );
                    return Ok(Handled::AckNow);
                }
                state = prior.state;
            }
        }

        self.transition(event, ProcessStatus::new(state)).await?;

        self.coordination
            .create_process_node(
                &event.experiment_id,
                &event.process_id,
                &self.instance.instance_name,
                delivery_tag,
                &event.token_id,
            )
            .await?;

        // Cancel requested before dispatch: terminal CANCELED without ever
        // creating an adaptor session.
        if self
            .coordination
            .cancel_requested(&event.experiment_id, &event.process_id)
            .await?
        {
            tracing::info!(process_id = %event.process_id, "cancel requested before dispatch");
            self.cancel_process(event).await;
            self.coordination
                .delete_process_node(&event.experiment_id, &event.process_id)
                .await?;
            return Ok(Handled::AckNow);
        }

        let cancel = CancelFlag::new();
        let watch = self
            .coordination
            .watch_cancel(&event.experiment_id, &event.process_id)
            .await?;
        {
            let cancel = cancel.clone();
            let process_id = event.process_id.clone();
            tokio::spawn(async move {
                if watch.fired().await {
                    tracing::info!(%process_id, "cancel watch fired");
                    cancel.set();
                }
            });
        }

        Ok(Handled::Dispatch { cancel })
    }

    /// Hand the pipeline run to the worker pool; the run's continuation
    /// acknowledges the message.
    async fn dispatch(
        self: Arc<Self>,
        event: ProcessLaunchEvent,
        delivery_tag: u64,
        cancel: CancelFlag,
    ) {
        let this = Arc::clone(&self);
        let label = format!("process-{}", event.process_id);
        let submitted = self
            .pool
            .submit(label, async move {
                let outcome = this.executor.run(&event, &cancel).await;
                this.finish(&event, delivery_tag, outcome).await;
            })
            .await;
        if let Err(err) = submitted {
            tracing::error!("pipeline dispatch rejected: {err:#}");
            self.ack(delivery_tag).await;
        }
    }

    /// Success continuation of a pipeline run. Always acknowledges.
    async fn finish(
        &self,
        event: &ProcessLaunchEvent,
        delivery_tag: u64,
        outcome: PipelineOutcome,
    ) {
        match outcome {
            PipelineOutcome::Completed => {
                // The completing stage persisted and published COMPLETED.
                tracing::info!(process_id = %event.process_id, "process completed");
                telemetry::record_process_finished("completed");
            }
            PipelineOutcome::Canceled => {
                self.cancel_process(event).await;
            }
            PipelineOutcome::Failed(failure) => {
                self.fail_process(event, &failure).await;
            }
        }

        if let Err(err) = self
            .coordination
            .delete_process_node(&event.experiment_id, &event.process_id)
            .await
        {
            tracing::warn!(
                process_id = %event.process_id,
                "deleting coordination record failed: {err:#}"
            );
        }
        self.ack(delivery_tag).await;
    }

    /// Termination request: record the cancel sentinel and let the watch or
    /// the next stage boundary pick it up. Cancelling a process with no
    /// in-flight record is a logged no-op.
    async fn on_terminate(&self, event: &ProcessTerminateEvent) {
        match self
            .coordination
            .request_cancel(&event.experiment_id, &event.process_id)
            .await
        {
            Ok(true) => {
                tracing::info!(
                    process_id = %event.process_id,
                    "process cancel request recorded"
                );
            }
            Ok(false) => {
                tracing::info!(
                    process_id = %event.process_id,
                    "cancel requested for a process with no in-flight record"
                );
            }
            Err(err) => {
                tracing::error!(
                    process_id = %event.process_id,
                    "recording cancel request failed: {err:#}"
                );
            }
        }
    }

    /// CANCELLING then CANCELED, persisted and published.
    async fn cancel_process(&self, event: &ProcessLaunchEvent) {
        let cancelling =
            ProcessStatus::with_reason(ProcessState::Cancelling, "process cancel is triggered");
        if let Err(err) = self.transition(event, cancelling).await {
            tracing::error!(process_id = %event.process_id, "CANCELLING transition failed: {err:#}");
        }
        let canceled = ProcessStatus::new(ProcessState::Canceled);
        if let Err(err) = self.transition(event, canceled).await {
            tracing::error!(process_id = %event.process_id, "CANCELED transition failed: {err:#}");
        }
        telemetry::record_process_finished("canceled");
    }

    /// Record the failure against both the process and its experiment, then
    /// transition to FAILED.
    async fn fail_process(&self, event: &ProcessLaunchEvent, failure: &StageFailure) {
        let report = ErrorReport::new(&failure.user_message, &failure.diagnostic);
        if let Err(err) = self
            .registry
            .record_process_error(&event.process_id, report.clone())
            .await
        {
            tracing::error!(process_id = %event.process_id, "recording process error failed: {err:#}");
        }
        if let Err(err) = self
            .registry
            .record_experiment_error(&event.experiment_id, report)
            .await
        {
            tracing::error!(
                experiment_id = %event.experiment_id,
                "recording experiment error failed: {err:#}"
            );
        }

        let status =
            ProcessStatus::with_reason(ProcessState::Failed, failure.user_message.clone());
        if let Err(err) = self.transition(event, status).await {
            tracing::error!(process_id = %event.process_id, "FAILED transition failed: {err:#}");
        }
        telemetry::record_process_finished("failed");
    }

    async fn transition(
        &self,
        event: &ProcessLaunchEvent,
        status: ProcessStatus,
    ) -> anyhow::Result<()> {
        self.registry
            .update_process_status(&event.process_id, status.clone())
            .await?;
        self.publisher
            .publish_process(ProcessStatusEvent::new(event, &status))
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) {
        if let Err(err) = self.acks.ack(delivery_tag).await {
            tracing::error!(delivery_tag, "acknowledgement failed: {err:#}");
        }
    }
}

/// Consume envelopes from the inbound channel, one at a time per consumer
/// slot, until shutdown or channel close.
pub fn spawn_consumer(
    handler: Arc<ProcessLaunchHandler>,
    mut receiver: mpsc::Receiver<DeliveryEnvelope>,
    shutdown: ShutdownToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("launch consumer shutting down");
                    break;
                }
                envelope = receiver.recv() => match envelope {
                    Some(envelope) => Arc::clone(&handler).handle(envelope).await,
                    None => {
                        tracing::info!("launch channel closed");
                        break;
                    }
                }
            }
        }
    })
}
