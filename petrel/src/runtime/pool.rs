use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify, Semaphore};

/// Token for signaling graceful shutdown to workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded worker pool running one task-pipeline invocation per process.
///
/// `submit` spawns immediately and returns; the spawned task waits for a
/// pool permit before the work future runs, so message handling never blocks
/// on pipeline execution.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
    shutdown: ShutdownToken,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("available_permits", &self.semaphore.available_permits())
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            shutdown: ShutdownToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers not currently occupied by a pipeline run.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Queue a pipeline run. Returns once the run is spawned, not once it
    /// executes; execution begins when a pool slot frees up.
    pub async fn submit<F>(&self, label: impl Into<String>, work: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        anyhow::ensure!(
            !self.shutdown.is_cancelled(),
            "worker pool is shutting down"
        );

        let label = label.into();
        let semaphore = Arc::clone(&self.semaphore);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if shutdown.is_cancelled() {
                tracing::info!(label, "dropping queued work during shutdown");
                return;
            }
            work.await;
        });

        let mut handles = self.handles.lock().await;
        handles.retain(|entry| !entry.is_finished());
        handles.push(handle);
        Ok(())
    }

    /// Gracefully shut down: stop accepting work and wait for in-flight
    /// runs, bounded by `grace`.
    pub async fn shutdown(&self, grace: std::time::Duration) -> anyhow::Result<()> {
        tracing::info!("initiating graceful shutdown of worker pool");
        self.shutdown.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!("worker task failed: {err:?}"),
                Err(_) => tracing::warn!("worker task timed out during shutdown"),
            }
        }

        tracing::info!("worker pool shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone1 = token.clone();
        let clone2 = token.clone();

        token.cancel();

        assert!(clone1.is_cancelled());
        assert!(clone2.is_cancelled());
        timeout(Duration::from_secs(1), clone1.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let clone = token.clone();
                tokio::spawn(async move { clone.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let results = timeout(
            Duration::from_secs(5),
            futures::future::join_all(waiters),
        )
        .await
        .expect("waiters did not observe cancellation");
        for result in results {
            result.expect("waiter panicked");
        }
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = Arc::new(WorkerPool::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for n in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.submit(format!("work-{n}"), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2, "pool exceeded its bound");
    }

    #[tokio::test]
    async fn test_submit_returns_before_execution() {
        let pool = WorkerPool::new(1);
        // Occupy the single slot.
        pool.submit("blocker", async {
            tokio::time::sleep(Duration::from_millis(200)).await;
        })
        .await
        .unwrap();

        // A full pool must not block submission.
        timeout(Duration::from_millis(50), pool.submit("queued", async {}))
            .await
            .expect("submit blocked on a full pool")
            .unwrap();
    }

    #[tokio::test]
    async fn test_submit_rejected_after_shutdown() {
        let pool = WorkerPool::new(1);
        pool.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(pool.submit("late", async {}).await.is_err());
    }
}
