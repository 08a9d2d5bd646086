use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::process::{ExperimentId, ProcessId, TokenId};

/// Sentinel stored at a process's cancel node when cancellation is requested.
pub const CANCEL_SENTINEL: &[u8] = b"CANCEL";

/// Path layout of the coordination namespace.
///
/// The layout is interoperable state: other orchestrator instances locate
/// ownership records and cancel flags by these exact paths.
pub mod paths {
    use super::{ExperimentId, ProcessId};

    pub const SERVERS: &str = "/servers";
    pub const EXPERIMENTS: &str = "/experiments";
    pub const DELIVERY_TAG_NODE: &str = "deliveryTag";
    pub const TOKEN_NODE: &str = "token";
    pub const CANCEL_LISTENER_NODE: &str = "cancelListener";

    pub fn component(component: &str) -> String {
        format!("{SERVERS}/{component}")
    }

    pub fn instance(component_name: &str, instance: &str) -> String {
        format!("{SERVERS}/{component_name}/{instance}")
    }

    pub fn experiment(experiment_id: &ExperimentId) -> String {
        format!("{EXPERIMENTS}/{experiment_id}")
    }

    pub fn process(experiment_id: &ExperimentId, process_id: &ProcessId) -> String {
        format!("{EXPERIMENTS}/{experiment_id}/{process_id}")
    }

    pub fn delivery_tag(experiment_id: &ExperimentId, process_id: &ProcessId) -> String {
        format!("{}/{DELIVERY_TAG_NODE}", process(experiment_id, process_id))
    }

    pub fn token(experiment_id: &ExperimentId, process_id: &ProcessId) -> String {
        format!("{}/{TOKEN_NODE}", process(experiment_id, process_id))
    }

    pub fn cancel_listener(experiment_id: &ExperimentId, process_id: &ProcessId) -> String {
        format!(
            "{}/{CANCEL_LISTENER_NODE}",
            process(experiment_id, process_id)
        )
    }
}

/// One-shot notification that cancellation was requested for a process.
///
/// Delivery is at-least-once and may race with pipeline execution; consumers
/// re-check the flag at stage boundaries rather than relying on the watch
/// arriving at any particular instruction.
#[derive(Debug)]
pub struct CancelWatch {
    receiver: oneshot::Receiver<()>,
}

impl CancelWatch {
    /// Resolve once cancellation is requested. Returns `false` if the watch
    /// was invalidated (process record deleted, store dropped) without a
    /// cancel ever being requested.
    pub async fn fired(self) -> bool {
        self.receiver.await.is_ok()
    }
}

/// Distributed coordination primitive: ephemeral liveness registration,
/// small-record writes on a hierarchical namespace, and push-notified
/// watches on the per-process cancel flag.
///
/// The in-memory implementation below serves single-instance deployments and
/// tests; a lock-service-backed store implements the same trait for
/// multi-instance deployments.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Register a live orchestrator instance under
    /// `/servers/<component>/<instance>` with its `host:port` as value.
    /// The registration is ephemeral: it does not survive the instance.
    async fn register_instance(
        &self,
        component: &str,
        instance: &str,
        host_port: &str,
    ) -> anyhow::Result<()>;

    /// Remove an instance registration.
    async fn deregister_instance(&self, component: &str, instance: &str) -> anyhow::Result<()>;

    /// Instance names currently registered under a component.
    async fn live_instances(&self, component: &str) -> anyhow::Result<Vec<String>>;

    /// Name of the instance owning the in-flight process, if any.
    async fn process_owner(
        &self,
        experiment_id: &ExperimentId,
        process_id: &ProcessId,
    ) -> anyhow::Result<Option<String>>;

    /// Create or refresh the per-process record: owner instance, delivery
    /// tag (8-byte big-endian), credential token and an empty cancel node.
    async fn create_process_node(
        &self,
        experiment_id: &ExperimentId,
        process_id: &ProcessId,
        owner: &str,
        delivery_tag: u64,
        token: &TokenId,
    ) -> anyhow::Result<()>;

    /// Refresh only the delivery tag. Returns `false` when no record exists
    /// for the process.
    async fn update_delivery_tag(
        &self,
        experiment_id: &ExperimentId,
        process_id: &ProcessId,
        delivery_tag: u64,
    ) -> anyhow::Result<bool>;

    /// Most recent unacknowledged delivery tag recorded for the process.
    async fn delivery_tag(
        &self,
        experiment_id: &ExperimentId,
        process_id: &ProcessId,
    ) -> anyhow::Result<Option<u64>>;

    /// Set the cancel sentinel for a process. The sentinel is recorded even
    /// when no process record exists yet, since a cancel may arrive before
    /// its launch. Returns whether a record existed.
    async fn request_cancel(
        &self,
        experiment_id: &ExperimentId,
        process_id: &ProcessId,
    ) -> anyhow::Result<bool>;

    /// Whether the cancel sentinel is currently set.
    async fn cancel_requested(
        &self,
        experiment_id: &ExperimentId,
        process_id: &ProcessId,
    ) -> anyhow::Result<bool>;

    /// Arm a one-shot watch on the process's cancel flag. Fires immediately
    /// when the flag is already set at arm time.
    async fn watch_cancel(
        &self,
        experiment_id: &ExperimentId,
        process_id: &ProcessId,
    ) -> anyhow::Result<CancelWatch>;

    /// Delete the process subtree (record reaches a terminal state).
    async fn delete_process_node(
        &self,
        experiment_id: &ExperimentId,
        process_id: &ProcessId,
    ) -> anyhow::Result<()>;
}

/// In-memory coordination store over a path-keyed byte map.
///
/// Values are stored exactly as a remote namespace would hold them (the
/// delivery tag as 8 big-endian bytes, the cancel flag as the `CANCEL`
/// sentinel), so the path layout stays interoperable.
pub struct InMemoryCoordinationStore {
    nodes: Mutex<BTreeMap<String, Vec<u8>>>,
    watchers: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
}

impl std::fmt::Debug for InMemoryCoordinationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCoordinationStore")
            .field("nodes", &self.nodes.lock().len())
            .field("watched_paths", &self.watchers.lock().len())
            .finish()
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(BTreeMap::new()),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Child node names directly under `parent`.
    fn children(nodes: &BTreeMap<String, Vec<u8>>, parent: &str) -> Vec<String> {
        let prefix = format!("{parent}/");
        nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter_map(|(path, _)| {
                let rest = &path[prefix.len()..];
                if rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect()
    }

    fn notify_cancel_watchers(&self, path: &str) {
        let senders = self.watchers.lock().remove(path).unwrap_or_default();
        for sender in senders {
            let _ = sender.send(());
        }
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn register_instance(
        &self,
        component: &str,
        instance: &str,
        host_port: &str,
    ) -> anyhow::Result<()> {
        let mut nodes = self.nodes.lock();
        nodes.insert(paths::SERVERS.to_string(), Vec::new());
        nodes.insert(paths::component(component), Vec::new());
        nodes.insert(
            paths::instance(component, instance),
            host_port.as_bytes().to_vec(),
        );
        Ok(())
    }

    async fn deregister_instance(&self, component: &str, instance: &str) -> anyhow::Result<()> {
        self.nodes.lock().remove(&paths::instance(component, instance));
        Ok(())
    }

    async fn live_instances(&self, component: &str) -> anyhow::Result<Vec<String>> {
        let nodes = self.nodes.lock();
        Ok(Self::children(&nodes, &paths::component(component)))
    }

    async fn process_owner(
        &self,
        experiment_id: &ExperimentId,
        process_id: &ProcessId,
    ) -> anyhow::Result<Option<String>> {
        let nodes = self.nodes.lock();
        Ok(nodes
            .get(&paths::process(experiment_id, process_id))
            .map(|value| String::from_utf8_lossy(value).into_owned()))
    }

    async fn create_process_node(
        &self,
        experiment_id: &ExperimentId,
        process_id: &ProcessId,
        owner: &str,
        delivery_tag: u64,
        token: &TokenId,
    ) -> anyhow::Result<()> {
        let mut nodes = self.nodes.lock();
        nodes.insert(paths::EXPERIMENTS.to_string(), Vec::new());
        nodes.insert(paths::experiment(experiment_id), Vec::new());
        nodes.insert(
            paths::process(experiment_id, process_id),
            owner.as_bytes().to_vec(),
        );
        nodes.insert(
            paths::delivery_tag(experiment_id, process_id),
            delivery_tag.to_be_bytes().to_vec(),
        );
        nodes.insert(
            paths::token(experiment_id, process_id),
            token.as_str().as_bytes().to_vec(),
        );
        // The cancel node is created empty; a later create must not clear an
        // already-requested cancel.
        nodes
            .entry(paths::cancel_listener(experiment_id, process_id))
            .or_default();
        Ok(())
    }

    async fn update_delivery_tag(
        &self,
        experiment_id: &ExperimentId,
        process_id: &ProcessId,
        delivery_tag: u64,
    ) -> anyhow::Result<bool> {
        let mut nodes = self.nodes.lock();
        if !nodes.contains_key(&paths::process(experiment_id, process_id)) {
            return Ok(false);
        }
        nodes.insert(
            paths::delivery_tag(experiment_id, process_id),
            delivery_tag.to_be_bytes().to_vec(),
        );
        Ok(true)
    }

    async fn delivery_tag(
        &self,
        experiment_id: &ExperimentId,
        process_id: &ProcessId,
    ) -> anyhow::Result<Option<u64>> {
        let nodes = self.nodes.lock();
        match nodes.get(&paths::delivery_tag(experiment_id, process_id)) {
            Some(value) => {
                let bytes: [u8; 8] = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("malformed delivery tag node"))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    async fn request_cancel(
        &self,
        experiment_id: &ExperimentId,
        process_id: &ProcessId,
    ) -> anyhow::Result<bool> {
        let path = paths::cancel_listener(experiment_id, process_id);
        let existed = {
            let mut nodes = self.nodes.lock();
            let existed = nodes.contains_key(&paths::process(experiment_id, process_id));
            nodes.insert(path.clone(), CANCEL_SENTINEL.to_vec());
            existed
        };
        self.notify_cancel_watchers(&path);
        Ok(existed)
    }

    async fn cancel_requested(
        &self,
        experiment_id: &ExperimentId,
        process_id: &ProcessId,
    ) -> anyhow::Result<bool> {
        let nodes = self.nodes.lock();
        Ok(nodes
            .get(&paths::cancel_listener(experiment_id, process_id))
            .is_some_and(|value| value == CANCEL_SENTINEL))
    }

    async fn watch_cancel(
        &self,
        experiment_id: &ExperimentId,
        process_id: &ProcessId,
    ) -> anyhow::Result<CancelWatch> {
        let path = paths::cancel_listener(experiment_id, process_id);
        let (sender, receiver) = oneshot::channel();
        let already_set = {
            let nodes = self.nodes.lock();
            nodes.get(&path).is_some_and(|value| value == CANCEL_SENTINEL)
        };
        if already_set {
            let _ = sender.send(());
        } else {
            self.watchers.lock().entry(path).or_default().push(sender);
        }
        Ok(CancelWatch { receiver })
    }

    async fn delete_process_node(
        &self,
        experiment_id: &ExperimentId,
        process_id: &ProcessId,
    ) -> anyhow::Result<()> {
        let base = paths::process(experiment_id, process_id);
        let prefix = format!("{base}/");
        let mut nodes = self.nodes.lock();
        let doomed: Vec<String> = nodes
            .range(base.clone()..)
            .take_while(|(path, _)| **path == base || path.starts_with(&prefix))
            .map(|(path, _)| path.clone())
            .collect();
        for path in doomed {
            nodes.remove(&path);
        }
        // Pending watches for this process can never fire now.
        self.watchers.lock().retain(|path, _| !path.starts_with(&prefix) && *path != base);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn ids() -> (ExperimentId, ProcessId) {
        (ExperimentId::new("exp-1"), ProcessId::new("proc-1"))
    }

    #[tokio::test]
    async fn test_instance_registration_and_listing() {
        let store = InMemoryCoordinationStore::new();
        store.register_instance("petrel", "node-0", "10.0.0.1:8950").await.unwrap();
        store.register_instance("petrel", "node-1", "10.0.0.2:8950").await.unwrap();

        let mut instances = store.live_instances("petrel").await.unwrap();
        instances.sort();
        assert_eq!(instances, vec!["node-0", "node-1"]);

        store.deregister_instance("petrel", "node-0").await.unwrap();
        assert_eq!(store.live_instances("petrel").await.unwrap(), vec!["node-1"]);
    }

    #[tokio::test]
    async fn test_process_node_holds_owner_tag_and_token() {
        let store = InMemoryCoordinationStore::new();
        let (experiment_id, process_id) = ids();

        store
            .create_process_node(&experiment_id, &process_id, "node-0", 42, &TokenId::new("tok"))
            .await
            .unwrap();

        assert_eq!(
            store.process_owner(&experiment_id, &process_id).await.unwrap(),
            Some("node-0".to_string())
        );
        assert_eq!(
            store.delivery_tag(&experiment_id, &process_id).await.unwrap(),
            Some(42)
        );

        // Stored tag is wire-format big-endian.
        let raw = store
            .nodes
            .lock()
            .get(&paths::delivery_tag(&experiment_id, &process_id))
            .cloned()
            .unwrap();
        assert_eq!(raw, 42u64.to_be_bytes().to_vec());
    }

    #[tokio::test]
    async fn test_update_delivery_tag_requires_record() {
        let store = InMemoryCoordinationStore::new();
        let (experiment_id, process_id) = ids();

        assert!(!store.update_delivery_tag(&experiment_id, &process_id, 7).await.unwrap());

        store
            .create_process_node(&experiment_id, &process_id, "node-0", 1, &TokenId::new("tok"))
            .await
            .unwrap();
        assert!(store.update_delivery_tag(&experiment_id, &process_id, 7).await.unwrap());
        assert_eq!(
            store.delivery_tag(&experiment_id, &process_id).await.unwrap(),
            Some(7)
        );
    }

    #[tokio::test]
    async fn test_create_does_not_clear_pending_cancel() {
        let store = InMemoryCoordinationStore::new();
        let (experiment_id, process_id) = ids();

        store
            .create_process_node(&experiment_id, &process_id, "node-0", 1, &TokenId::new("tok"))
            .await
            .unwrap();
        assert!(store.request_cancel(&experiment_id, &process_id).await.unwrap());

        // Redelivery refresh must not erase the sentinel.
        store
            .create_process_node(&experiment_id, &process_id, "node-0", 2, &TokenId::new("tok"))
            .await
            .unwrap();
        assert!(store.cancel_requested(&experiment_id, &process_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_before_launch_is_recorded() {
        let store = InMemoryCoordinationStore::new();
        let (experiment_id, process_id) = ids();

        // Cancel arrives before the launch: no record yet, but the sentinel
        // must survive for the launch-time check.
        assert!(!store.request_cancel(&experiment_id, &process_id).await.unwrap());
        assert!(store.cancel_requested(&experiment_id, &process_id).await.unwrap());

        store
            .create_process_node(&experiment_id, &process_id, "node-0", 1, &TokenId::new("tok"))
            .await
            .unwrap();
        assert!(store.cancel_requested(&experiment_id, &process_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_watch_fires_on_cancel_request() {
        let store = InMemoryCoordinationStore::new();
        let (experiment_id, process_id) = ids();
        store
            .create_process_node(&experiment_id, &process_id, "node-0", 1, &TokenId::new("tok"))
            .await
            .unwrap();

        let watch = store.watch_cancel(&experiment_id, &process_id).await.unwrap();
        store.request_cancel(&experiment_id, &process_id).await.unwrap();

        assert!(timeout(Duration::from_secs(1), watch.fired()).await.unwrap());
    }

    #[tokio::test]
    async fn test_watch_fires_immediately_when_already_canceled() {
        let store = InMemoryCoordinationStore::new();
        let (experiment_id, process_id) = ids();
        store
            .create_process_node(&experiment_id, &process_id, "node-0", 1, &TokenId::new("tok"))
            .await
            .unwrap();
        store.request_cancel(&experiment_id, &process_id).await.unwrap();

        let watch = store.watch_cancel(&experiment_id, &process_id).await.unwrap();
        assert!(timeout(Duration::from_secs(1), watch.fired()).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_removes_subtree_and_invalidates_watch() {
        let store = InMemoryCoordinationStore::new();
        let (experiment_id, process_id) = ids();
        store
            .create_process_node(&experiment_id, &process_id, "node-0", 1, &TokenId::new("tok"))
            .await
            .unwrap();
        let watch = store.watch_cancel(&experiment_id, &process_id).await.unwrap();

        store.delete_process_node(&experiment_id, &process_id).await.unwrap();

        assert_eq!(store.process_owner(&experiment_id, &process_id).await.unwrap(), None);
        assert_eq!(store.delivery_tag(&experiment_id, &process_id).await.unwrap(), None);
        assert!(!store.cancel_requested(&experiment_id, &process_id).await.unwrap());
        // Invalidated, not fired.
        assert!(!timeout(Duration::from_secs(1), watch.fired()).await.unwrap());

        // Sibling processes under the same experiment are untouched.
        let other = ProcessId::new("proc-2");
        store
            .create_process_node(&experiment_id, &other, "node-0", 2, &TokenId::new("tok"))
            .await
            .unwrap();
        store.delete_process_node(&experiment_id, &process_id).await.unwrap();
        assert_eq!(
            store.process_owner(&experiment_id, &other).await.unwrap(),
            Some("node-0".to_string())
        );
    }
}
