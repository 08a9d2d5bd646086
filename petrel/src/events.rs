use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::process::{
    ExperimentId, GatewayId, JobState, JobStatus, ProcessId, ProcessLaunchEvent, ProcessState,
    ProcessStatus,
};

/// Status-change event published for every persisted process transition.
///
/// Routed by `gatewayId.experimentId.processId` so listeners can subscribe at
/// gateway, experiment or process granularity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessStatusEvent {
    /// Unique id of this event instance on the bus.
    pub event_id: Uuid,
    pub process_id: ProcessId,
    pub experiment_id: ExperimentId,
    pub gateway_id: GatewayId,
    pub state: ProcessState,
    pub reason: Option<String>,
    pub changed_at: DateTime<Utc>,
}

impl ProcessStatusEvent {
    pub fn new(event: &ProcessLaunchEvent, status: &ProcessStatus) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            process_id: event.process_id.clone(),
            experiment_id: event.experiment_id.clone(),
            gateway_id: event.gateway_id.clone(),
            state: status.state,
            reason: status.reason.clone(),
            changed_at: status.changed_at,
        }
    }

    pub fn routing_key(&self) -> String {
        format!(
            "{}.{}.{}",
            self.gateway_id, self.experiment_id, self.process_id
        )
    }
}

/// Status-change event for one remote scheduler submission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobStatusEvent {
    /// Unique id of this event instance on the bus.
    pub event_id: Uuid,
    pub process_id: ProcessId,
    pub experiment_id: ExperimentId,
    pub gateway_id: GatewayId,
    pub task_id: String,
    pub job_id: String,
    pub state: JobState,
    pub changed_at: DateTime<Utc>,
}

impl JobStatusEvent {
    pub fn new(event: &ProcessLaunchEvent, task_id: impl Into<String>, status: &JobStatus) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            process_id: event.process_id.clone(),
            experiment_id: event.experiment_id.clone(),
            gateway_id: event.gateway_id.clone(),
            task_id: task_id.into(),
            job_id: status.job_id.clone(),
            state: status.state,
            changed_at: status.changed_at,
        }
    }

    pub fn routing_key(&self) -> String {
        format!(
            "{}.{}.{}.{}.{}",
            self.gateway_id, self.experiment_id, self.process_id, self.task_id, self.job_id
        )
    }
}

/// Outbound side of the message bus: fire-and-forget status publication.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    /// Publish a process status transition.
    async fn publish_process(&self, event: ProcessStatusEvent) -> anyhow::Result<()>;

    /// Publish a job status observation.
    async fn publish_job(&self, event: JobStatusEvent) -> anyhow::Result<()>;
}

/// In-process status bus using tokio broadcast channels.
///
/// Non-blocking publish with fan-out to all active subscribers; a subscriber
/// that lags past the channel capacity receives `RecvError::Lagged` without
/// blocking the publisher. Bridges to an external broker implement
/// [`StatusPublisher`] instead.
pub struct InProcStatusBus {
    process_sender: broadcast::Sender<ProcessStatusEvent>,
    job_sender: broadcast::Sender<JobStatusEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcStatusBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcStatusBus")
            .field("capacity", &self.capacity)
            .field("process_subscribers", &self.process_sender.receiver_count())
            .field("job_subscribers", &self.job_sender.receiver_count())
            .finish()
    }
}

impl InProcStatusBus {
    /// Create a bus buffering up to `capacity` events per channel.
    pub fn new(capacity: usize) -> Self {
        let (process_sender, _) = broadcast::channel(capacity);
        let (job_sender, _) = broadcast::channel(capacity);
        Self {
            process_sender,
            job_sender,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe to process status transitions.
    pub fn subscribe_process_events(&self) -> broadcast::Receiver<ProcessStatusEvent> {
        self.process_sender.subscribe()
    }

    /// Subscribe to job status observations.
    pub fn subscribe_job_events(&self) -> broadcast::Receiver<JobStatusEvent> {
        self.job_sender.subscribe()
    }
}

#[async_trait]
impl StatusPublisher for InProcStatusBus {
    async fn publish_process(&self, event: ProcessStatusEvent) -> anyhow::Result<()> {
        let _ = self.process_sender.send(event);
        Ok(())
    }

    async fn publish_job(&self, event: JobStatusEvent) -> anyhow::Result<()> {
        let _ = self.job_sender.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::TokenId;
    use std::time::Duration;
    use tokio::time::timeout;

    fn launch_event(n: u32) -> ProcessLaunchEvent {
        ProcessLaunchEvent {
            process_id: ProcessId::new(format!("proc-{n}")),
            experiment_id: ExperimentId::new("exp-1"),
            gateway_id: GatewayId::new("gw"),
            token_id: TokenId::new("token"),
        }
    }

    #[test]
    fn test_routing_key_shape() {
        let event = launch_event(7);
        let status = ProcessStatus::new(ProcessState::Started);
        let published = ProcessStatusEvent::new(&event, &status);
        assert_eq!(published.routing_key(), "gw.exp-1.proc-7");

        let job = JobStatus::new("1234.cluster", JobState::Queued);
        let published = JobStatusEvent::new(&event, "task-1", &job);
        assert_eq!(
            published.routing_key(),
            "gw.exp-1.proc-7.task-1.1234.cluster"
        );
    }

    #[tokio::test]
    async fn test_status_bus_fans_out_to_all_subscribers() {
        let bus = InProcStatusBus::new(16);
        let mut rx1 = bus.subscribe_process_events();
        let mut rx2 = bus.subscribe_process_events();

        for n in 0..3 {
            let event = launch_event(n);
            let status = ProcessStatus::new(ProcessState::Started);
            bus.publish_process(ProcessStatusEvent::new(&event, &status))
                .await
                .unwrap();
        }

        for _ in 0..3 {
            assert!(timeout(Duration::from_millis(100), rx1.recv()).await.is_ok());
            assert!(timeout(Duration::from_millis(100), rx2.recv()).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_does_not_block_publisher() {
        let bus = InProcStatusBus::new(2);
        let mut rx = bus.subscribe_process_events();

        for n in 0..5 {
            let event = launch_event(n);
            let status = ProcessStatus::new(ProcessState::Started);
            bus.publish_process(ProcessStatusEvent::new(&event, &status))
                .await
                .unwrap();
        }

        match timeout(Duration::from_millis(100), rx.recv()).await.unwrap() {
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => panic!("channel should not be closed"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let bus = InProcStatusBus::new(4);
        let event = launch_event(1);
        let status = ProcessStatus::new(ProcessState::Completed);
        bus.publish_process(ProcessStatusEvent::new(&event, &status))
            .await
            .unwrap();
    }
}
