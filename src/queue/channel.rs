//! Plain queue over a worker pool.

use std::any::type_name;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    Data, Flushable, HandlerFn, ManagedPool, ManagedQueue, Queue, QueueConfig, QueueError,
    QueueManager, QueueResult, QueueType, WorkerPool,
};
use crate::graceful::{callback, Callback};

/// Queue that hands items straight to its worker pool.
pub struct ChannelQueue<T: Data> {
    pool: WorkerPool<T>,
    config: QueueConfig,
    registry: QueueManager,
    shutdown_ctx: CancellationToken,
    terminate_ctx: CancellationToken,
    shutdown_once: AtomicBool,
    terminate_once: AtomicBool,
}

impl<T: Data> ChannelQueue<T> {
    /// Create the queue and register it.
    pub fn new(registry: &QueueManager, config: QueueConfig, handle: HandlerFn<T>) -> Arc<Self> {
        let queue = Arc::new(Self::unregistered(registry, config, handle));
        let qid = registry.add(
            Arc::clone(&queue) as Arc<dyn ManagedQueue>,
            QueueType::Channel,
            queue.config.clone(),
            type_name::<T>(),
        );
        queue.pool.set_qid(qid);
        queue
    }

    /// Create the queue without registering it, for wrapping queues.
    pub(crate) fn unregistered(registry: &QueueManager, config: QueueConfig, handle: HandlerFn<T>) -> Self {
        let config = config.normalized();
        let terminate_ctx = CancellationToken::new();
        let shutdown_ctx = terminate_ctx.child_token();
        Self {
            pool: WorkerPool::new(&config, handle),
            config,
            registry: registry.clone(),
            shutdown_ctx,
            terminate_ctx,
            shutdown_once: AtomicBool::new(false),
            terminate_once: AtomicBool::new(false),
        }
    }

    /// The underlying worker pool.
    pub fn worker_pool(&self) -> &WorkerPool<T> {
        &self.pool
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Cancelled when the queue starts shutting down.
    pub fn shutdown_context(&self) -> CancellationToken {
        self.shutdown_ctx.clone()
    }

    /// Start the configured workers.
    pub(crate) fn start_workers(&self) {
        debug!(queue = %self.config.name, workers = self.config.workers, "channel queue starting");
        if self.config.workers > 0 {
            self.pool.add_workers(self.config.workers, None);
        }
    }

    /// Cancel the shutdown token once; false if already shut down.
    pub(crate) fn mark_shutdown(&self) -> bool {
        if self.shutdown_once.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown_ctx.cancel();
        true
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminate_ctx.is_cancelled()
    }

    /// Cancel the terminate token once; false if already terminated.
    pub(crate) fn mark_terminated(&self) -> bool {
        if self.terminate_once.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.terminate_ctx.cancel();
        true
    }
}

#[async_trait]
impl<T: Data> Flushable for ChannelQueue<T> {
    async fn flush(&self, timeout: Option<Duration>) -> QueueResult<()> {
        self.pool.flush(timeout).await
    }

    async fn flush_with_context(&self, ctx: CancellationToken) -> QueueResult<()> {
        self.pool.flush_with_context(ctx).await
    }

    fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

impl<T: Data> ManagedQueue for ChannelQueue<T> {
    fn pool(&self) -> &dyn ManagedPool {
        &self.pool
    }
}

#[async_trait]
impl<T: Data> Queue<T> for ChannelQueue<T> {
    fn run(self: Arc<Self>, at_shutdown: &dyn Fn(Callback), at_terminate: &dyn Fn(Callback)) {
        let queue = Arc::clone(&self);
        at_shutdown(callback(move || async move { queue.shutdown().await }));
        let queue = Arc::clone(&self);
        at_terminate(callback(move || async move { queue.terminate().await }));
        self.start_workers();
    }

    async fn push(&self, data: T) -> QueueResult<()> {
        if self.is_terminated() {
            return Err(QueueError::Terminated);
        }
        self.pool.push(data).await;
        Ok(())
    }

    async fn shutdown(&self) {
        trace!(queue = %self.config.name, "channel queue shutting down");
        if !self.mark_shutdown() {
            return;
        }
        let pool = self.pool.clone();
        let ctx = self.terminate_ctx.clone();
        let name = self.config.name.clone();
        tokio::spawn(async move {
            trace!(queue = %name, "channel queue flushing");
            match pool.flush_with_context(ctx).await {
                Ok(()) => debug!(queue = %name, "channel queue flushed"),
                Err(e) => warn!(queue = %name, error = %e, "channel queue terminated before completed flushing"),
            }
        });
        debug!(queue = %self.config.name, "channel queue shutdown");
    }

    async fn terminate(&self) {
        trace!(queue = %self.config.name, "channel queue terminating");
        self.shutdown().await;
        if !self.mark_terminated() {
            return;
        }
        self.pool.cancel();
        self.registry.remove(self.pool.qid());
        debug!(queue = %self.config.name, "channel queue terminated");
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn qid(&self) -> u64 {
        self.pool.qid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::handler;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_push_and_flush() {
        let registry = QueueManager::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let queue = ChannelQueue::new(
            &registry,
            QueueConfig::new("channel").with_workers(0).without_boost(),
            handler(move |batch: Vec<i32>| {
                counter.fetch_add(batch.len(), Ordering::SeqCst);
                Vec::new()
            }),
        );
        for i in 0..10 {
            queue.push(i).await.unwrap();
        }
        assert!(!queue.is_empty());
        queue.flush(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 10);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_unregisters() {
        let registry = QueueManager::new();
        let queue = ChannelQueue::new(
            &registry,
            QueueConfig::new("idem").without_boost(),
            handler(|_: Vec<i32>| Vec::new()),
        );
        let qid = queue.qid();
        assert!(registry.get(qid).is_some());

        queue.shutdown().await;
        queue.shutdown().await;
        queue.terminate().await;
        queue.terminate().await;

        assert!(registry.get(qid).is_none());
        assert!(matches!(queue.push(1).await, Err(QueueError::Terminated)));
    }
}
