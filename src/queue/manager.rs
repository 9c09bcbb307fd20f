//! Registry of running queues.
//!
//! Every queue registers itself on creation and is removed again when it
//! terminates. The admin server and the metrics collector read the registry;
//! nothing in it owns a queue's lifecycle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use super::{
    Flushable, ManagedPool, ManagedQueue, PoolStats, QueueConfig, QueueError, QueueResult, QueueType,
    WorkerGroupInfo,
};

/// Pause between passes of [`QueueManager::flush_all`].
const FLUSH_ALL_INTERVAL: Duration = Duration::from_millis(100);

/// One registered queue.
#[derive(Clone)]
pub struct ManagedQueueEntry {
    pub qid: u64,
    pub queue_type: QueueType,
    pub name: String,
    pub configuration: QueueConfig,
    /// Name of the item type the queue carries.
    pub exemplar: &'static str,
    managed: Arc<dyn ManagedQueue>,
}

impl ManagedQueueEntry {
    pub fn managed(&self) -> &Arc<dyn ManagedQueue> {
        &self.managed
    }

    pub fn pool(&self) -> &dyn ManagedPool {
        self.managed.pool()
    }

    /// Point-in-time view for the admin API.
    pub fn summary(&self) -> QueueSummary {
        let pool = self.pool();
        QueueSummary {
            qid: self.qid,
            name: self.name.clone(),
            queue_type: self.queue_type,
            exemplar: self.exemplar,
            workers: pool.number_of_workers(),
            max_workers: pool.max_number_of_workers(),
            boost_workers: pool.boost_workers(),
            block_timeout_ms: pool.block_timeout().as_millis() as u64,
            boost_timeout_ms: pool.boost_timeout().as_millis() as u64,
            in_queue: pool.number_in_queue(),
            paused: pool.is_paused(),
            stats: pool.stats(),
            groups: pool.worker_groups(),
            configuration: self.configuration.clone(),
        }
    }
}

impl std::fmt::Debug for ManagedQueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedQueueEntry")
            .field("qid", &self.qid)
            .field("queue_type", &self.queue_type)
            .field("name", &self.name)
            .field("exemplar", &self.exemplar)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSummary {
    pub qid: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub queue_type: QueueType,
    pub exemplar: &'static str,
    pub workers: usize,
    pub max_workers: Option<usize>,
    pub boost_workers: usize,
    pub block_timeout_ms: u64,
    pub boost_timeout_ms: u64,
    pub in_queue: i64,
    pub paused: bool,
    pub stats: PoolStats,
    pub groups: Vec<WorkerGroupInfo>,
    pub configuration: QueueConfig,
}

/// Shared registry handle. Clones see the same queues.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Registry>,
}

struct Registry {
    counter: AtomicU64,
    queues: Mutex<BTreeMap<u64, ManagedQueueEntry>>,
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Registry {
                counter: AtomicU64::new(0),
                queues: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    fn queues(&self) -> MutexGuard<'_, BTreeMap<u64, ManagedQueueEntry>> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a queue and return its id. Ids start at 1 and are never reused.
    pub fn add(
        &self,
        managed: Arc<dyn ManagedQueue>,
        queue_type: QueueType,
        configuration: QueueConfig,
        exemplar: &'static str,
    ) -> u64 {
        let qid = self.inner.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let name = configuration.name.clone();
        debug!(qid, queue = %name, %queue_type, exemplar, "registering queue");
        self.queues().insert(
            qid,
            ManagedQueueEntry {
                qid,
                queue_type,
                name,
                configuration,
                exemplar,
                managed,
            },
        );
        qid
    }

    pub fn remove(&self, qid: u64) {
        if let Some(entry) = self.queues().remove(&qid) {
            debug!(qid, queue = %entry.name, "unregistered queue");
        }
    }

    pub fn get(&self, qid: u64) -> Option<ManagedQueueEntry> {
        self.queues().get(&qid).cloned()
    }

    /// First queue registered under `name`.
    pub fn by_name(&self, name: &str) -> Option<ManagedQueueEntry> {
        self.queues().values().find(|e| e.name == name).cloned()
    }

    /// Registered queues ordered by name, then id.
    pub fn managed_queues(&self) -> Vec<ManagedQueueEntry> {
        let mut entries: Vec<_> = self.queues().values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name).then(a.qid.cmp(&b.qid)));
        entries
    }

    pub fn summaries(&self) -> Vec<QueueSummary> {
        self.managed_queues().iter().map(ManagedQueueEntry::summary).collect()
    }

    /// Flush every non-empty, unpaused queue until all are empty.
    ///
    /// Queues are flushed concurrently in passes. With a timeout, the
    /// queues still holding items when it expires are reported by name.
    pub async fn flush_all(&self, timeout: Option<Duration>) -> QueueResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(QueueError::NonEmptyQueues(self.non_empty_names()));
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            let pending: Vec<_> = self
                .managed_queues()
                .into_iter()
                .filter(|e| !e.pool().is_paused() && !e.managed.is_empty())
                .collect();
            if pending.is_empty() {
                return Ok(());
            }

            let results = join_all(pending.iter().map(|e| e.managed.flush(remaining))).await;
            for (entry, result) in pending.iter().zip(results) {
                if let Err(e) = result {
                    if !e.is_flush_interrupted() {
                        warn!(qid = entry.qid, queue = %entry.name, error = %e, "flushing queue failed");
                    }
                }
            }

            tokio::time::sleep(FLUSH_ALL_INTERVAL).await;
        }
    }

    fn non_empty_names(&self) -> Vec<String> {
        self.managed_queues()
            .into_iter()
            .filter(|e| !e.managed.is_empty())
            .map(|e| e.name)
            .collect()
    }
}
