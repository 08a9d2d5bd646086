use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::process::{ExperimentId, GatewayId, ProcessId, ProcessLaunchEvent};

/// Request to stop a process, carried on the same inbound channel as
/// launches. Setting the coordination cancel flag is the only effect; the
/// running pipeline observes it at its next stage boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessTerminateEvent {
    pub process_id: ProcessId,
    pub experiment_id: ExperimentId,
    pub gateway_id: GatewayId,
}

/// Payload variants of the inbound launch channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LaunchMessage {
    Launch(ProcessLaunchEvent),
    Terminate(ProcessTerminateEvent),
}

/// Transport framing handed to the message handler.
///
/// `delivery_tag` is assigned monotonically per consumer connection;
/// `redelivered` is set by the broker when the same payload is delivered
/// again after an unacknowledged prior delivery.
#[derive(Clone, Debug)]
pub struct DeliveryEnvelope {
    pub message: LaunchMessage,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// Manual-acknowledgement channel back to the inbound broker connection.
///
/// Every delivery must be acknowledged exactly once, on every handling path;
/// an unacknowledged slot is redelivered after the consumer connection drops.
#[async_trait]
pub trait AckChannel: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> anyhow::Result<()>;
}

/// In-process launch channel with broker-like framing.
///
/// Assigns monotonic delivery tags, supports marking a send as a redelivery,
/// and records acknowledgements so tests and examples can assert on them.
/// A broker-backed deployment replaces this with a real consumer connection
/// implementing [`AckChannel`].
pub struct InProcLaunchBus {
    sender: mpsc::Sender<DeliveryEnvelope>,
    receiver: Mutex<Option<mpsc::Receiver<DeliveryEnvelope>>>,
    next_tag: AtomicU64,
    acked: Arc<Mutex<Vec<u64>>>,
}

impl std::fmt::Debug for InProcLaunchBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcLaunchBus")
            .field("next_tag", &self.next_tag.load(Ordering::SeqCst))
            .field("acked", &self.acked.lock().len())
            .finish()
    }
}

impl InProcLaunchBus {
    /// Create a bus buffering up to `capacity` undelivered envelopes.
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            next_tag: AtomicU64::new(1),
            acked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Deliver a message with a fresh tag. Returns the assigned tag.
    pub async fn send(&self, message: LaunchMessage) -> anyhow::Result<u64> {
        self.deliver(message, false).await
    }

    /// Deliver a message flagged as a broker redelivery, with a fresh tag.
    pub async fn send_redelivery(&self, message: LaunchMessage) -> anyhow::Result<u64> {
        self.deliver(message, true).await
    }

    async fn deliver(&self, message: LaunchMessage, redelivered: bool) -> anyhow::Result<u64> {
        let delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        self.sender
            .send(DeliveryEnvelope {
                message,
                delivery_tag,
                redelivered,
            })
            .await
            .map_err(|_| anyhow::anyhow!("launch bus receiver dropped"))?;
        Ok(delivery_tag)
    }

    /// Take the consumer end. One consumer slot per bus; second call yields
    /// `None`.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<DeliveryEnvelope>> {
        self.receiver.lock().take()
    }

    /// Tags acknowledged so far, in acknowledgement order.
    pub fn acked_tags(&self) -> Vec<u64> {
        self.acked.lock().clone()
    }
}

#[async_trait]
impl AckChannel for InProcLaunchBus {
    async fn ack(&self, delivery_tag: u64) -> anyhow::Result<()> {
        self.acked.lock().push(delivery_tag);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::TokenId;

    fn launch(n: u32) -> LaunchMessage {
        LaunchMessage::Launch(ProcessLaunchEvent {
            process_id: ProcessId::new(format!("proc-{n}")),
            experiment_id: ExperimentId::new("exp-1"),
            gateway_id: GatewayId::new("gw"),
            token_id: TokenId::new("token"),
        })
    }

    #[tokio::test]
    async fn test_tags_are_monotonic() {
        let bus = InProcLaunchBus::new(8);
        let t1 = bus.send(launch(1)).await.unwrap();
        let t2 = bus.send(launch(2)).await.unwrap();
        let t3 = bus.send_redelivery(launch(2)).await.unwrap();
        assert!(t1 < t2 && t2 < t3);
    }

    #[tokio::test]
    async fn test_redelivery_flag_set_on_redeliveries_only() {
        let bus = InProcLaunchBus::new(8);
        bus.send(launch(1)).await.unwrap();
        bus.send_redelivery(launch(1)).await.unwrap();

        let mut rx = bus.take_receiver().unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(!first.redelivered);
        assert!(second.redelivered);
    }

    #[tokio::test]
    async fn test_receiver_can_only_be_taken_once() {
        let bus = InProcLaunchBus::new(8);
        assert!(bus.take_receiver().is_some());
        assert!(bus.take_receiver().is_none());
    }

    #[tokio::test]
    async fn test_ack_recording() {
        let bus = InProcLaunchBus::new(8);
        let tag = bus.send(launch(1)).await.unwrap();
        bus.ack(tag).await.unwrap();
        assert_eq!(bus.acked_tags(), vec![tag]);
    }
}
