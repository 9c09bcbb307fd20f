//! Queue that refuses items already waiting.
//!
//! Uniqueness only holds while an item waits in the backlog: once a worker
//! takes it, an equal item may be pushed again and both can be processed
//! concurrently.

use std::any::type_name;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::channel::ChannelQueue;
use super::{
    handler, Data, Flushable, HandlerFn, ManagedPool, ManagedQueue, Queue, QueueConfig,
    QueueError, QueueManager, QueueResult, QueueType,
};
use crate::graceful::{callback, Callback};

/// Removes a recorded item whose push was abandoned before reaching the backlog.
struct TableEntry<'a, T: Eq + Hash> {
    table: &'a Mutex<HashSet<T>>,
    data: Option<T>,
}

impl<T: Eq + Hash> Drop for TableEntry<'_, T> {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.table
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&data);
        }
    }
}

/// Channel queue with a membership table of waiting items.
pub struct ChannelUniqueQueue<T: Data + Eq + Hash> {
    channel: ChannelQueue<T>,
    table: Mutex<HashSet<T>>,
}

impl<T: Data + Eq + Hash> ChannelUniqueQueue<T> {
    /// Create the queue and register it.
    pub fn new(registry: &QueueManager, config: QueueConfig, handle: HandlerFn<T>) -> Arc<Self> {
        let queue = Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let wrapped = handler(move |batch: Vec<T>| match weak.upgrade() {
                Some(queue) => queue.handle_batch(&handle, batch),
                None => handle(batch),
            });
            Self {
                channel: ChannelQueue::unregistered(registry, config, wrapped),
                table: Mutex::new(HashSet::new()),
            }
        });

        let qid = registry.add(
            Arc::clone(&queue) as Arc<dyn ManagedQueue>,
            QueueType::UniqueChannel,
            queue.channel.config().clone(),
            type_name::<T>(),
        );
        queue.channel.worker_pool().set_qid(qid);
        queue
    }

    fn table(&self) -> MutexGuard<'_, HashSet<T>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget the batch, then run the real handler on it.
    fn handle_batch(self: &Arc<Self>, handle: &HandlerFn<T>, batch: Vec<T>) -> Vec<T> {
        {
            let mut table = self.table();
            for item in &batch {
                table.remove(item);
            }
        }

        let unhandled = handle(batch);
        if unhandled.is_empty() || !self.channel.worker_pool().is_paused() {
            return unhandled;
        }

        // Paused: route the items back through the table
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => return unhandled,
        };
        for item in unhandled {
            let queue = Arc::clone(self);
            runtime.spawn(async move {
                if let Err(e) = queue.push_func(item, || Ok(())).await {
                    if !e.is_already_in_queue() {
                        error!(qid = queue.qid(), error = %e, "unable to push back to queue");
                    }
                }
            });
        }
        Vec::new()
    }

    /// Push `data` unless an equal item is waiting.
    ///
    /// `f` runs while the table lock is held, after the item is recorded;
    /// if it fails the record is rolled back and its error returned.
    pub async fn push_func<F>(&self, data: T, f: F) -> QueueResult<()>
    where
        F: FnOnce() -> QueueResult<()>,
    {
        if self.channel.is_terminated() {
            return Err(QueueError::Terminated);
        }
        {
            let mut table = self.table();
            if table.contains(&data) {
                return Err(QueueError::AlreadyInQueue);
            }
            table.insert(data.clone());
            if let Err(e) = f() {
                table.remove(&data);
                return Err(e);
            }
        }
        let mut entry = TableEntry {
            table: &self.table,
            data: Some(data.clone()),
        };
        self.channel.worker_pool().push(data).await;
        entry.data = None;
        Ok(())
    }

    /// Items currently recorded as waiting.
    pub fn waiting(&self) -> usize {
        self.table().len()
    }
}

#[async_trait]
impl<T: Data + Eq + Hash> Flushable for ChannelUniqueQueue<T> {
    async fn flush(&self, timeout: Option<Duration>) -> QueueResult<()> {
        self.channel.flush(timeout).await
    }

    async fn flush_with_context(&self, ctx: CancellationToken) -> QueueResult<()> {
        self.channel.flush_with_context(ctx).await
    }

    fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }
}

impl<T: Data + Eq + Hash> ManagedQueue for ChannelUniqueQueue<T> {
    fn pool(&self) -> &dyn ManagedPool {
        self.channel.worker_pool()
    }
}

#[async_trait]
impl<T: Data + Eq + Hash> Queue<T> for ChannelUniqueQueue<T> {
    fn run(self: Arc<Self>, at_shutdown: &dyn Fn(Callback), at_terminate: &dyn Fn(Callback)) {
        let queue = Arc::clone(&self);
        at_shutdown(callback(move || async move { queue.shutdown().await }));
        let queue = Arc::clone(&self);
        at_terminate(callback(move || async move { queue.terminate().await }));
        debug!(queue = %self.channel.config().name, "unique queue starting");
        self.channel.start_workers();
    }

    async fn push(&self, data: T) -> QueueResult<()> {
        self.push_func(data, || Ok(())).await
    }

    fn has(&self, data: &T) -> QueueResult<bool> {
        Ok(self.table().contains(data))
    }

    async fn shutdown(&self) {
        trace!(queue = %self.channel.config().name, "unique queue shutting down");
        self.channel.shutdown().await;
    }

    async fn terminate(&self) {
        self.channel.terminate().await;
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

    fn idle_queue(registry: &QueueManager) -> Arc<ChannelUniqueQueue<String>> {
        ChannelUniqueQueue::new(
            registry,
            QueueConfig::new("unique").with_workers(0).without_boost(),
            handler(|_: Vec<String>| Vec::new()),
        )
    }

    #[tokio::test]
    async fn test_duplicate_rejected_while_waiting() {
        let registry = QueueManager::new();
        let queue = idle_queue(&registry);

        queue.push("A".into()).await.unwrap();
        queue.push("B".into()).await.unwrap();
        let err = queue.push("A".into()).await.unwrap_err();
        assert!(err.is_already_in_queue());

        assert!(queue.has(&"A".into()).unwrap());
        assert!(!queue.has(&"C".into()).unwrap());
        assert_eq!(queue.worker_pool_len(), 2);
    }

    #[tokio::test]
    async fn test_push_func_rollback() {
        let registry = QueueManager::new();
        let queue = idle_queue(&registry);

        let err = queue
            .push_func("A".into(), || Err(QueueError::Rejected("nope".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Rejected(_)));
        assert!(!queue.has(&"A".into()).unwrap());

        // The rolled back key can be pushed again
        queue.push("A".into()).await.unwrap();
        assert!(queue.has(&"A".into()).unwrap());
    }

    #[tokio::test]
    async fn test_key_released_once_handled() {
        let registry = QueueManager::new();
        let queue = idle_queue(&registry);

        queue.push("A".into()).await.unwrap();
        queue.flush(Some(Duration::from_secs(5))).await.unwrap();
        assert!(!queue.has(&"A".into()).unwrap());
        assert_eq!(queue.waiting(), 0);
        queue.push("A".into()).await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_push_releases_key() {
        let registry = QueueManager::new();
        let queue = ChannelUniqueQueue::new(
            &registry,
            QueueConfig::new("unique-full")
                .with_workers(0)
                .with_queue_length(1)
                .without_boost(),
            handler(|_: Vec<String>| Vec::new()),
        );

        queue.push("A".into()).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.push("B".into())).await;
        assert!(blocked.is_err());
        assert!(!queue.has(&"B".into()).unwrap());

        queue.flush(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(queue.worker_pool_len(), 0);
        queue.push("B".into()).await.unwrap();
        assert!(queue.has(&"B".into()).unwrap());
    }

    impl<T: Data + Eq + Hash> ChannelUniqueQueue<T> {
        fn worker_pool_len(&self) -> usize {
            self.channel.worker_pool().backlog_len()
        }
    }
}
