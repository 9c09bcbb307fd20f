//! Generic task queues backed by resizable worker pools.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        QueueManager                          │
//! │      qid → (type, config, exemplar, managed handle)          │
//! └───────────────┬──────────────────────────────────────────────┘
//!                 │
//!   push ──▶ ┌────▼─────────────┐   ┌─────────────────────────┐
//!            │ Unique table     │──▶│       WorkerPool        │
//!            │ (unique queues)  │   │  bounded backlog        │
//!            └──────────────────┘   │  ┌───────┐ ┌───────┐    │
//!                                   │  │worker │ │worker │ …  │──▶ handler(batch)
//!   shutdown ──▶ ByteFifo  ◀────────│  └───────┘ └───────┘    │     on a blocking thread
//!   (persistable queues)            └─────────────────────────┘
//! ```
//!
//! Queues register their shutdown and terminate work with the
//! [`Manager`](crate::graceful::Manager) through [`Queue::run`].

mod backlog;
mod channel;
mod config;
mod error;
mod fifo;
mod manager;
mod persistable;
mod unique;
mod workerpool;

pub use channel::ChannelQueue;
pub use config::{QueueConfig, QueueType};
pub use error::{QueueError, QueueResult};
pub use fifo::{ByteFifo, FileByteFifo, MemoryByteFifo};
pub use manager::{ManagedQueueEntry, QueueManager, QueueSummary};
pub use persistable::PersistableChannelQueue;
pub use unique::ChannelUniqueQueue;
pub use workerpool::{PoolStats, WorkerGroupInfo, WorkerPool};

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::graceful::Callback;

/// Anything a queue can carry.
pub trait Data: Clone + Debug + Send + Sync + 'static {}

impl<T: Clone + Debug + Send + Sync + 'static> Data for T {}

/// Processes a batch and returns the items it could not handle.
pub type HandlerFn<T> = Arc<dyn Fn(Vec<T>) -> Vec<T> + Send + Sync>;

/// Wrap a closure as a [`HandlerFn`].
pub fn handler<T, F>(f: F) -> HandlerFn<T>
where
    F: Fn(Vec<T>) -> Vec<T> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Queues that can be drained on demand.
#[async_trait]
pub trait Flushable: Send + Sync {
    /// Drain queued items through the handler. `None` waits indefinitely.
    async fn flush(&self, timeout: Option<Duration>) -> QueueResult<()>;

    /// Drain until empty, paused, or `ctx` is cancelled.
    async fn flush_with_context(&self, ctx: CancellationToken) -> QueueResult<()>;

    /// Nothing queued and nothing in flight.
    fn is_empty(&self) -> bool;
}

/// Runtime controls of a worker pool.
pub trait ManagedPool: Send + Sync {
    /// Start `number` workers, stopped after `timeout` or when the token is cancelled.
    fn add_workers(&self, number: usize, timeout: Option<Duration>) -> CancellationToken;
    fn number_of_workers(&self) -> usize;
    fn max_number_of_workers(&self) -> Option<usize>;
    fn boost_workers(&self) -> usize;
    fn block_timeout(&self) -> Duration;
    fn boost_timeout(&self) -> Duration;
    fn set_pool_settings(&self, max_workers: Option<usize>, boost_workers: usize, boost_timeout: Duration);
    fn worker_groups(&self) -> Vec<WorkerGroupInfo>;
    /// Stop the worker group `pid`; false if there is no such group.
    fn cancel_workers(&self, pid: u64) -> bool;
    fn number_in_queue(&self) -> i64;
    fn is_paused(&self) -> bool;
    fn pause(&self);
    fn resume(&self);
    fn stats(&self) -> PoolStats;
}

/// What the registry needs from a queue.
pub trait ManagedQueue: Flushable {
    fn pool(&self) -> &dyn ManagedPool;
}

/// A typed queue front-end.
#[async_trait]
pub trait Queue<T: Data>: ManagedQueue {
    /// Register shutdown and terminate work, then start the workers.
    fn run(self: Arc<Self>, at_shutdown: &dyn Fn(Callback), at_terminate: &dyn Fn(Callback));

    /// Enqueue `data`, waiting while the backlog is full.
    async fn push(&self, data: T) -> QueueResult<()>;

    /// Whether an equal item is waiting. Only unique queues support this.
    fn has(&self, _data: &T) -> QueueResult<bool> {
        Err(QueueError::Unsupported("has"))
    }

    /// Stop taking new work and flush the rest in the background. Idempotent.
    async fn shutdown(&self);

    /// Final cleanup after shutdown; unregisters the queue. Idempotent.
    async fn terminate(&self);

    fn name(&self) -> &str;

    fn qid(&self) -> u64;
}

/// Bounds for items usable with every queue type.
pub trait QueueItem: Data + Eq + Hash + Serialize + DeserializeOwned {}

impl<T: Data + Eq + Hash + Serialize + DeserializeOwned> QueueItem for T {}

/// Build and register the queue type named in `config`.
///
/// Persistable queues spill to a file under `config.data_dir`, or to
/// memory when no directory is configured.
pub fn create_queue<T: QueueItem>(
    registry: &QueueManager,
    config: QueueConfig,
    handle: HandlerFn<T>,
) -> QueueResult<Arc<dyn Queue<T>>> {
    let queue: Arc<dyn Queue<T>> = match config.queue_type {
        QueueType::Channel => ChannelQueue::new(registry, config, handle),
        QueueType::UniqueChannel => ChannelUniqueQueue::new(registry, config, handle),
        QueueType::PersistableChannel => {
            let fifo: Arc<dyn ByteFifo> = match &config.data_dir {
                Some(dir) => Arc::new(FileByteFifo::open(dir.join(format!("{}.fifo", config.name)))?),
                None => Arc::new(MemoryByteFifo::new()),
            };
            PersistableChannelQueue::new(registry, config, handle, fifo)
        }
    };
    Ok(queue)
}

/// Like [`create_queue`] with the type given by name.
pub fn create_queue_by_type<T: QueueItem>(
    registry: &QueueManager,
    queue_type: &str,
    config: QueueConfig,
    handle: HandlerFn<T>,
) -> QueueResult<Arc<dyn Queue<T>>> {
    let queue_type: QueueType = queue_type.parse()?;
    create_queue(registry, config.with_type(queue_type), handle)
}
