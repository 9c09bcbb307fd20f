//! Channel queue that spills to a byte FIFO across restarts.
//!
//! While running, items travel through the worker pool like a plain channel
//! queue. At shutdown the pool is torn down and everything it still holds is
//! written to the FIFO as JSON; the next `run` replays the FIFO into the
//! pool. Pushes that arrive after shutdown go straight to the FIFO.

use std::any::type_name;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::channel::ChannelQueue;
use super::{
    ByteFifo, Flushable, HandlerFn, ManagedPool, ManagedQueue, Queue, QueueConfig, QueueError,
    QueueItem, QueueManager, QueueResult, QueueType,
};
use crate::graceful::{callback, Callback};

pub struct PersistableChannelQueue<T: QueueItem> {
    channel: ChannelQueue<T>,
    fifo: Arc<dyn ByteFifo>,
    registry: QueueManager,
    spill_lock: Mutex<()>,
    /// Cancelled once shutdown has spilled the pool.
    spilled: CancellationToken,
}

impl<T: QueueItem> PersistableChannelQueue<T> {
    /// Create the queue over `fifo` and register it.
    pub fn new(
        registry: &QueueManager,
        config: QueueConfig,
        handle: HandlerFn<T>,
        fifo: Arc<dyn ByteFifo>,
    ) -> Arc<Self> {
        let queue = Arc::new(Self {
            channel: ChannelQueue::unregistered(registry, config, handle),
            fifo,
            registry: registry.clone(),
            spill_lock: Mutex::new(()),
            spilled: CancellationToken::new(),
        });
        let qid = registry.add(
            Arc::clone(&queue) as Arc<dyn ManagedQueue>,
            QueueType::PersistableChannel,
            queue.channel.config().clone(),
            type_name::<T>(),
        );
        queue.channel.worker_pool().set_qid(qid);
        queue
    }

    /// Records waiting in the FIFO.
    pub fn persisted(&self) -> usize {
        self.fifo.len()
    }

    fn spill(&self, item: &T) -> QueueResult<()> {
        let bytes = serde_json::to_vec(item)?;
        self.fifo.push_back(&bytes)?;
        Ok(())
    }

    /// Move everything the pool still holds into the FIFO.
    fn spill_remaining(&self) -> usize {
        let _guard = self.spill_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = self.channel.worker_pool().take_remaining();
        let mut spilled = 0;
        for item in remaining {
            match self.spill(&item) {
                Ok(()) => spilled += 1,
                Err(e) => error!(qid = self.qid(), error = %e, ?item, "unable to persist item, dropping"),
            }
        }
        spilled
    }

    /// Pop and decode the next FIFO record, skipping undecodable ones.
    fn next_persisted(&self) -> QueueResult<Option<T>> {
        while let Some(bytes) = self.fifo.pop_front()? {
            match serde_json::from_slice(&bytes) {
                Ok(item) => return Ok(Some(item)),
                Err(e) => error!(qid = self.qid(), error = %e, "dropping undecodable persisted item"),
            }
        }
        Ok(None)
    }

    /// Push into the pool, or into the FIFO once shutdown begins or `ctx` fires.
    ///
    /// Returns false when the item ended up in the FIFO.
    async fn push_or_spill(&self, item: T, ctx: &CancellationToken) -> QueueResult<bool> {
        let shutdown = self.channel.shutdown_context();
        if shutdown.is_cancelled() {
            self.spill(&item)?;
            return Ok(false);
        }

        let pushed = tokio::select! {
            biased;
            _ = self.channel.worker_pool().push(item.clone()) => true,
            _ = shutdown.cancelled() => false,
            _ = ctx.cancelled() => false,
        };
        if !pushed {
            self.spill(&item)?;
            return Ok(false);
        }

        // Landed after the shutdown drain
        if shutdown.is_cancelled() {
            self.spill_remaining();
        }
        Ok(true)
    }

    /// Feed persisted records back into the pool until shutdown.
    async fn replay(&self) -> QueueResult<usize> {
        let never = CancellationToken::new();
        let mut replayed = 0;
        while !self.channel.shutdown_context().is_cancelled() {
            let Some(item) = self.next_persisted()? else {
                break;
            };
            if !self.push_or_spill(item, &never).await? {
                break;
            }
            replayed += 1;
        }
        Ok(replayed)
    }
}

#[async_trait]
impl<T: QueueItem> Flushable for PersistableChannelQueue<T> {
    async fn flush(&self, timeout: Option<Duration>) -> QueueResult<()> {
        let ctx = CancellationToken::new();
        let timer = timeout.map(|timeout| {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                ctx.cancel();
            })
        });

        let result = self.flush_with_context(ctx).await;
        if let Some(timer) = timer {
            timer.abort();
        }
        match (result, timeout) {
            (Err(QueueError::FlushCancelled), Some(timeout)) => Err(QueueError::FlushTimeout(timeout)),
            (result, _) => result,
        }
    }

    async fn flush_with_context(&self, ctx: CancellationToken) -> QueueResult<()> {
        let pool = self.channel.worker_pool();
        loop {
            if self.channel.shutdown_context().is_cancelled() {
                return Err(QueueError::Terminated);
            }
            if pool.is_paused() {
                return Ok(());
            }

            let room = pool.capacity().saturating_sub(pool.backlog_len()).max(1);
            for _ in 0..room {
                let Some(item) = self.next_persisted()? else {
                    break;
                };
                if !self.push_or_spill(item, &ctx).await? {
                    return Err(if ctx.is_cancelled() {
                        QueueError::FlushCancelled
                    } else {
                        QueueError::Terminated
                    });
                }
            }

            self.channel.flush_with_context(ctx.clone()).await?;
            if self.fifo.is_empty() {
                return Ok(());
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.channel.is_empty() && self.fifo.is_empty()
    }
}

impl<T: QueueItem> ManagedQueue for PersistableChannelQueue<T> {
    fn pool(&self) -> &dyn ManagedPool {
        self.channel.worker_pool()
    }
}

#[async_trait]
impl<T: QueueItem> Queue<T> for PersistableChannelQueue<T> {
    fn run(self: Arc<Self>, at_shutdown: &dyn Fn(Callback), at_terminate: &dyn Fn(Callback)) {
        let queue = Arc::clone(&self);
        at_shutdown(callback(move || async move { queue.shutdown().await }));
        let queue = Arc::clone(&self);
        at_terminate(callback(move || async move { queue.terminate().await }));

        self.channel.start_workers();

        if self.fifo.is_empty() {
            return;
        }
        let queue = Arc::clone(&self);
        tokio::spawn(async move {
            match queue.replay().await {
                Ok(0) => {}
                Ok(replayed) => info!(queue = %queue.name(), replayed, "replayed persisted items"),
                Err(e) => error!(queue = %queue.name(), error = %e, "unable to replay persisted items"),
            }
        });
    }

    async fn push(&self, data: T) -> QueueResult<()> {
        if self.channel.is_terminated() {
            return Err(QueueError::Terminated);
        }
        let never = CancellationToken::new();
        self.push_or_spill(data, &never).await.map(|_| ())
    }

    async fn shutdown(&self) {
        trace!(queue = %self.name(), "persistable queue shutting down");
        if !self.channel.mark_shutdown() {
            self.spilled.cancelled().await;
            return;
        }
        let pool = self.channel.worker_pool();
        pool.cancel();
        pool.wait().await;
        let spilled = self.spill_remaining();
        self.spilled.cancel();
        debug!(queue = %self.name(), spilled, persisted = self.fifo.len(), "persistable queue shutdown");
    }

    async fn terminate(&self) {
        trace!(queue = %self.name(), "persistable queue terminating");
        self.shutdown().await;
        if !self.channel.mark_terminated() {
            return;
        }
        if let Err(e) = self.fifo.close() {
            warn!(queue = %self.name(), error = %e, "unable to close fifo");
        }
        self.registry.remove(self.qid());
        debug!(queue = %self.name(), "persistable queue terminated");
    }

    fn name(&self) -> &str {
        &self.channel.config().name
    }

    fn qid(&self) -> u64 {
        self.channel.worker_pool().qid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{handler, MemoryByteFifo};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> QueueConfig {
        QueueConfig::new("persist").with_workers(0).without_boost()
    }

    #[tokio::test]
    async fn test_shutdown_spills_backlog() {
        let registry = QueueManager::new();
        let fifo: Arc<dyn ByteFifo> = Arc::new(MemoryByteFifo::new());
        let queue = PersistableChannelQueue::new(
            &registry,
            config(),
            handler(|_: Vec<u32>| Vec::new()),
            Arc::clone(&fifo),
        );

        for i in 0..5 {
            queue.push(i).await.unwrap();
        }
        queue.shutdown().await;
        assert_eq!(fifo.len(), 5);

        // Later pushes bypass the pool
        queue.push(99).await.unwrap();
        assert_eq!(fifo.len(), 6);
        assert!(queue.worker_pool_is_empty());
    }

    #[tokio::test]
    async fn test_flush_replays_fifo() {
        let registry = QueueManager::new();
        let fifo: Arc<dyn ByteFifo> = Arc::new(MemoryByteFifo::new());
        for i in 0..30u32 {
            fifo.push_back(&serde_json::to_vec(&i).unwrap()).unwrap();
        }
        fifo.push_back(b"not json").unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let queue = PersistableChannelQueue::new(
            &registry,
            config(),
            handler(move |batch: Vec<u32>| {
                counter.fetch_add(batch.len(), Ordering::SeqCst);
                Vec::new()
            }),
            Arc::clone(&fifo),
        );

        assert!(!queue.is_empty());
        queue.flush(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 30);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_flush_after_shutdown_is_terminated() {
        let registry = QueueManager::new();
        let queue = PersistableChannelQueue::new(
            &registry,
            config(),
            handler(|_: Vec<u32>| Vec::new()),
            Arc::new(MemoryByteFifo::new()),
        );
        queue.shutdown().await;
        let err = queue.flush(None).await.unwrap_err();
        assert!(err.is_terminated());
    }

    #[tokio::test]
    async fn test_terminate_unregisters() {
        let registry = QueueManager::new();
        let queue = PersistableChannelQueue::new(
            &registry,
            config(),
            handler(|_: Vec<u32>| Vec::new()),
            Arc::new(MemoryByteFifo::new()),
        );
        let qid = queue.qid();
        assert!(registry.get(qid).is_some());
        queue.terminate().await;
        queue.terminate().await;
        assert!(registry.get(qid).is_none());
    }

    impl<T: QueueItem> PersistableChannelQueue<T> {
        fn worker_pool_is_empty(&self) -> bool {
            self.channel.is_empty()
        }
    }
}
