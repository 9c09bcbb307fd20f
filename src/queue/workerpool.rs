//! Resizable worker pool over a bounded, batched backlog.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace, warn};

use super::backlog::Backlog;
use super::config::QueueConfig;
use super::error::{QueueError, QueueResult};
use super::{Data, HandlerFn, ManagedPool};
use crate::graceful::panic_message;

/// A partial batch is dispatched after this long without new items.
const BATCH_DELAY: Duration = Duration::from_millis(100);

/// How often a flush re-checks for batches still held by workers.
const FLUSH_POLL: Duration = Duration::from_millis(10);

/// Counters reported through the registry and `/metrics`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Items the handler accepted.
    pub handled: u64,
    /// Items the handler returned as unhandled (counted per attempt).
    pub unhandled: u64,
    /// Handler invocations that panicked.
    pub panics: u64,
    /// Boosts started because a push blocked.
    pub boosts: u64,
}

#[derive(Default)]
struct PoolCounters {
    handled: AtomicU64,
    unhandled: AtomicU64,
    panics: AtomicU64,
    boosts: AtomicU64,
}

/// Snapshot of one registered group of workers.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerGroupInfo {
    pub pid: u64,
    pub workers: usize,
    /// Start time, milliseconds since the UNIX epoch.
    pub started_ms: u64,
    /// Remaining lifetime in milliseconds; `None` runs until cancelled.
    pub remaining_ms: Option<u64>,
    pub is_flusher: bool,
    pub is_boost: bool,
}

struct WorkerGroup {
    pid: u64,
    workers: usize,
    started: SystemTime,
    deadline: Option<Instant>,
    is_flusher: bool,
    is_boost: bool,
    token: CancellationToken,
}

struct PoolSettings {
    number_of_workers: usize,
    max_workers: Option<usize>,
    boost_workers: usize,
    block_timeout: Duration,
    boost_timeout: Duration,
    next_pid: u64,
    groups: Vec<WorkerGroup>,
}

impl PoolSettings {
    fn below_max(&self) -> bool {
        self.max_workers
            .map(|max| self.number_of_workers <= max)
            .unwrap_or(true)
    }

    /// Workers a boost may add without exceeding the maximum.
    fn boost_size(&self) -> usize {
        match self.max_workers {
            Some(max) => self
                .boost_workers
                .min(max.saturating_sub(self.number_of_workers)),
            None => self.boost_workers,
        }
    }
}

/// Pool of async workers that feed batches to a blocking handler.
///
/// Cloning is cheap and yields another handle to the same pool.
pub struct WorkerPool<T: Data> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Data> Clone for WorkerPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<T: Data> {
    name: String,
    qid: AtomicU64,
    handle: HandlerFn<T>,
    backlog: Backlog<T>,
    batch_length: usize,
    num_in_queue: AtomicI64,
    settings: Mutex<PoolSettings>,
    paused: watch::Sender<bool>,
    base: CancellationToken,
    tracker: TaskTracker,
    counters: PoolCounters,
    /// Items that could not be handled once the pool was torn down.
    leftovers: Mutex<Vec<T>>,
}

/// Undoes the in-queue increment of a push that did not complete.
struct InQueueGuard<'a> {
    counter: &'a AtomicI64,
    armed: bool,
}

impl Drop for InQueueGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl<T: Data> WorkerPool<T> {
    /// Create a pool with no workers; `add_workers` starts them.
    pub fn new(config: &QueueConfig, handle: HandlerFn<T>) -> Self {
        let config = config.clone().normalized();
        let (paused, _) = watch::channel(false);
        let tracker = TaskTracker::new();
        tracker.close();

        Self {
            inner: Arc::new(PoolInner {
                name: config.name.clone(),
                qid: AtomicU64::new(0),
                handle,
                backlog: Backlog::new(config.queue_length),
                batch_length: config.batch_length,
                num_in_queue: AtomicI64::new(0),
                settings: Mutex::new(PoolSettings {
                    number_of_workers: 0,
                    max_workers: config.max_workers,
                    boost_workers: config.boost_workers,
                    block_timeout: config.block_timeout,
                    boost_timeout: config.boost_timeout,
                    next_pid: 0,
                    groups: Vec::new(),
                }),
                paused,
                base: CancellationToken::new(),
                tracker,
                counters: PoolCounters::default(),
                leftovers: Mutex::new(Vec::new()),
            }),
        }
    }

    fn settings(&self) -> MutexGuard<'_, PoolSettings> {
        self.inner
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn qid(&self) -> u64 {
        self.inner.qid.load(Ordering::Relaxed)
    }

    pub(crate) fn set_qid(&self, qid: u64) {
        self.inner.qid.store(qid, Ordering::Relaxed);
    }

    pub fn batch_length(&self) -> usize {
        self.inner.batch_length
    }

    pub fn capacity(&self) -> usize {
        self.inner.backlog.capacity()
    }

    /// Items waiting in the backlog (excludes batches held by workers).
    pub fn backlog_len(&self) -> usize {
        self.inner.backlog.len()
    }

    /// Token cancelled when the pool is torn down.
    pub fn base_context(&self) -> CancellationToken {
        self.inner.base.clone()
    }

    // ------------------------------------------------------------------
    // Push
    // ------------------------------------------------------------------

    /// Enqueue one item, waiting while the backlog is full.
    ///
    /// When a push blocks for the block timeout and the pool is below its
    /// worker limit, temporary boost workers are added.
    pub async fn push(&self, data: T) {
        self.inner.num_in_queue.fetch_add(1, Ordering::SeqCst);
        let mut guard = InQueueGuard {
            counter: &self.inner.num_in_queue,
            armed: true,
        };

        let boost = {
            let settings = self.settings();
            let enabled = !settings.block_timeout.is_zero()
                && !settings.boost_timeout.is_zero()
                && settings.below_max();
            if enabled && settings.number_of_workers == 0 {
                drop(settings);
                self.zero_boost();
            }
            enabled
        };

        if boost {
            self.push_boost(data).await;
        } else {
            self.inner.backlog.push(data).await;
        }
        guard.armed = false;
    }

    async fn push_boost(&self, data: T) {
        let data = match self.inner.backlog.try_push(data) {
            Ok(()) => return,
            Err(data) => data,
        };

        let our_timeout = self.settings().block_timeout;
        if our_timeout.is_zero() {
            self.inner.backlog.push(data).await;
            return;
        }

        let waited = tokio::time::timeout(our_timeout, self.inner.backlog.push(data.clone())).await;
        if waited.is_ok() {
            return;
        }

        let boost = {
            let mut settings = self.settings();
            // Someone else already boosted, or we are at the limit
            if settings.block_timeout > our_timeout || !settings.below_max() {
                None
            } else {
                settings.block_timeout *= 2;
                Some((settings.boost_size(), settings.boost_timeout, settings.block_timeout))
            }
        };

        if let Some((workers, boost_timeout, block_timeout)) = boost {
            warn!(
                queue = %self.inner.name,
                qid = self.qid(),
                blocked_ms = our_timeout.as_millis() as u64,
                workers,
                boost_ms = boost_timeout.as_millis() as u64,
                block_timeout_ms = block_timeout.as_millis() as u64,
                "backlog blocked, adding temporary workers"
            );
            self.inner.counters.boosts.fetch_add(1, Ordering::Relaxed);
            self.register_workers(workers, Some(boost_timeout), false, true);

            let pool = self.clone();
            self.inner.tracker.spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(boost_timeout) => {}
                    _ = pool.inner.base.cancelled() => return,
                }
                pool.settings().block_timeout /= 2;
            });
        }
        self.inner.backlog.push(data).await;
    }

    /// Start boost workers for a pool that has none.
    fn zero_boost(&self) {
        let (workers, boost_timeout) = {
            let settings = self.settings();
            (settings.boost_size().max(1), settings.boost_timeout)
        };
        debug!(
            queue = %self.inner.name,
            qid = self.qid(),
            workers,
            "no workers, adding temporary workers"
        );
        self.inner.counters.boosts.fetch_add(1, Ordering::Relaxed);
        self.register_workers(workers, Some(boost_timeout), false, true);
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    /// Register a group of workers bound to a child of the base token.
    ///
    /// Flusher groups are accounted for but spawn no workers: the flushing
    /// caller does the work itself.
    pub(crate) fn register_workers(
        &self,
        number: usize,
        timeout: Option<Duration>,
        is_flusher: bool,
        is_boost: bool,
    ) -> CancellationToken {
        let token = self.inner.base.child_token();
        let pid = {
            let mut settings = self.settings();
            settings.next_pid += 1;
            let pid = settings.next_pid;
            settings.number_of_workers += number;
            settings.groups.push(WorkerGroup {
                pid,
                workers: number,
                started: SystemTime::now(),
                deadline: timeout.map(|t| Instant::now() + t),
                is_flusher,
                is_boost,
                token: token.clone(),
            });
            pid
        };

        if !is_flusher {
            for _ in 0..number {
                let pool = self.clone();
                let ctx = token.clone();
                self.inner.tracker.spawn(async move { pool.do_work(ctx).await });
            }
        }

        let pool = self.clone();
        let watch = token.clone();
        self.inner.tracker.spawn(async move {
            match timeout {
                Some(timeout) => {
                    tokio::select! {
                        _ = watch.cancelled() => {}
                        _ = tokio::time::sleep(timeout) => watch.cancel(),
                    }
                }
                None => watch.cancelled().await,
            }
            pool.remove_group(pid);
        });

        trace!(queue = %self.inner.name, pid, number, is_flusher, is_boost, "registered workers");
        token
    }

    fn remove_group(&self, pid: u64) {
        let mut settings = self.settings();
        if let Some(idx) = settings.groups.iter().position(|g| g.pid == pid) {
            let group = settings.groups.remove(idx);
            settings.number_of_workers = settings.number_of_workers.saturating_sub(group.workers);
            trace!(queue = %self.inner.name, pid, "removed worker group");
        }
    }

    async fn do_work(self, ctx: CancellationToken) {
        let mut paused = self.inner.paused.subscribe();
        let mut batch: Vec<T> = Vec::with_capacity(self.inner.batch_length);

        loop {
            if *paused.borrow_and_update() {
                trace!(queue = %self.inner.name, "worker pausing");
                if !batch.is_empty() {
                    self.dispatch(std::mem::take(&mut batch), None).await;
                }
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    changed = paused.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            }

            let item = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    if !batch.is_empty() {
                        self.dispatch(batch, None).await;
                    }
                    return;
                }
                _ = paused.changed() => continue,
                item = self.inner.backlog.pop() => item,
                _ = tokio::time::sleep(BATCH_DELAY), if !batch.is_empty() => {
                    self.dispatch(std::mem::take(&mut batch), None).await;
                    continue;
                }
            };

            batch.push(item);
            if batch.len() >= self.inner.batch_length {
                self.dispatch(std::mem::take(&mut batch), None).await;
            }
        }
    }

    /// Hand `batch` to the handler until every item is handled, the pool is
    /// paused, or it is torn down.
    ///
    /// A flushing caller passes its token: once it is cancelled, unhandled
    /// items go back to the backlog instead of being retried.
    async fn dispatch(&self, batch: Vec<T>, flush: Option<&CancellationToken>) {
        let n = batch.len() as i64;
        let mut pending = batch;

        loop {
            let unhandled = self.invoke(pending).await;
            if unhandled.is_empty() {
                break;
            }

            if self.is_paused() {
                debug!(queue = %self.inner.name, count = unhandled.len(), "paused, returning unhandled items to the backlog");
                self.requeue(unhandled);
                break;
            }

            if self.inner.base.is_cancelled() {
                error!(
                    queue = %self.inner.name,
                    qid = self.qid(),
                    count = unhandled.len(),
                    "unhandled items at teardown"
                );
                self.lock_leftovers().extend(unhandled);
                break;
            }

            if flush.is_some_and(CancellationToken::is_cancelled) {
                debug!(queue = %self.inner.name, count = unhandled.len(), "flush interrupted, returning unhandled items to the backlog");
                self.requeue(unhandled);
                break;
            }

            debug!(queue = %self.inner.name, count = unhandled.len(), "retrying unhandled items");
            pending = unhandled;
        }

        self.inner.num_in_queue.fetch_sub(n, Ordering::SeqCst);
    }

    /// Run the handler on a blocking thread. A panic leaves the whole batch unhandled.
    async fn invoke(&self, batch: Vec<T>) -> Vec<T> {
        let backup = batch.clone();
        let total = batch.len() as u64;
        let handle = Arc::clone(&self.inner.handle);
        let counters = &self.inner.counters;

        match tokio::task::spawn_blocking(move || handle(batch)).await {
            Ok(unhandled) => {
                let failed = unhandled.len() as u64;
                counters
                    .handled
                    .fetch_add(total.saturating_sub(failed), Ordering::Relaxed);
                counters.unhandled.fetch_add(failed, Ordering::Relaxed);
                unhandled
            }
            Err(e) if e.is_panic() => {
                let panic = e.into_panic();
                error!(
                    queue = %self.inner.name,
                    qid = self.qid(),
                    panic = %panic_message(&*panic),
                    "panic in queue handler"
                );
                counters.panics.fetch_add(1, Ordering::Relaxed);
                counters.unhandled.fetch_add(total, Ordering::Relaxed);
                backup
            }
            Err(e) => {
                error!(queue = %self.inner.name, error = %e, "handler task cancelled");
                backup
            }
        }
    }

    fn requeue(&self, items: Vec<T>) {
        self.inner
            .num_in_queue
            .fetch_add(items.len() as i64, Ordering::SeqCst);
        let pool = self.clone();
        self.inner.tracker.spawn(async move {
            let mut items = items.into_iter();
            while let Some(item) = items.next() {
                tokio::select! {
                    _ = pool.inner.backlog.push(item.clone()) => {}
                    _ = pool.inner.base.cancelled() => {
                        let mut leftovers = pool.lock_leftovers();
                        leftovers.push(item);
                        leftovers.extend(items);
                        return;
                    }
                }
            }
        });
    }

    fn lock_leftovers(&self) -> MutexGuard<'_, Vec<T>> {
        self.inner
            .leftovers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Flush and teardown
    // ------------------------------------------------------------------

    /// Drain the backlog through the handler on the caller's task.
    ///
    /// Returns `Ok` at once when paused. `None` waits indefinitely.
    pub async fn flush(&self, timeout: Option<Duration>) -> QueueResult<()> {
        if self.is_paused() {
            return Ok(());
        }
        let ctx = self.register_workers(1, timeout, true, false);
        let result = self.flush_with_context(ctx.clone()).await;
        ctx.cancel();
        match (result, timeout) {
            (Err(QueueError::FlushCancelled), Some(timeout)) => Err(QueueError::FlushTimeout(timeout)),
            (result, _) => result,
        }
    }

    /// Drain until empty, paused, torn down, or `ctx` is cancelled.
    pub async fn flush_with_context(&self, ctx: CancellationToken) -> QueueResult<()> {
        trace!(queue = %self.inner.name, qid = self.qid(), "flushing");
        loop {
            if self.is_paused() {
                return Ok(());
            }
            if self.inner.base.is_cancelled() {
                return Err(QueueError::Terminated);
            }
            if ctx.is_cancelled() {
                return Err(QueueError::FlushCancelled);
            }

            let batch = self.inner.backlog.drain_up_to(self.inner.batch_length);
            if !batch.is_empty() {
                self.dispatch(batch, Some(&ctx)).await;
                continue;
            }

            if self.inner.num_in_queue.load(Ordering::SeqCst) <= 0 {
                return Ok(());
            }

            // Workers still hold batches in flight
            tokio::select! {
                _ = ctx.cancelled() => {}
                _ = self.inner.base.cancelled() => {}
                _ = tokio::time::sleep(FLUSH_POLL) => {}
            }
        }
    }

    /// Nothing queued and nothing in flight.
    pub fn is_empty(&self) -> bool {
        self.inner.num_in_queue.load(Ordering::SeqCst) == 0
    }

    /// Tear the pool down: every worker stops after its current batch.
    pub fn cancel(&self) {
        self.inner.base.cancel();
    }

    /// Wait for every worker and helper task to stop.
    pub async fn wait(&self) {
        self.inner.tracker.wait().await;
    }

    /// Take the items left in the backlog plus those dropped at teardown.
    pub(crate) fn take_remaining(&self) -> Vec<T> {
        let mut remaining = std::mem::take(&mut *self.lock_leftovers());
        loop {
            let batch = self.inner.backlog.drain_up_to(usize::MAX);
            if batch.is_empty() {
                break;
            }
            remaining.extend(batch);
        }
        self.inner
            .num_in_queue
            .fetch_sub(remaining.len() as i64, Ordering::SeqCst);
        remaining
    }
}

impl<T: Data> ManagedPool for WorkerPool<T> {
    fn add_workers(&self, number: usize, timeout: Option<Duration>) -> CancellationToken {
        self.register_workers(number, timeout, false, false)
    }

    fn number_of_workers(&self) -> usize {
        self.settings().number_of_workers
    }

    fn max_number_of_workers(&self) -> Option<usize> {
        self.settings().max_workers
    }

    fn boost_workers(&self) -> usize {
        self.settings().boost_workers
    }

    fn block_timeout(&self) -> Duration {
        self.settings().block_timeout
    }

    fn boost_timeout(&self) -> Duration {
        self.settings().boost_timeout
    }

    fn set_pool_settings(&self, max_workers: Option<usize>, boost_workers: usize, boost_timeout: Duration) {
        let mut settings = self.settings();
        settings.max_workers = max_workers;
        settings.boost_workers = boost_workers;
        settings.boost_timeout = boost_timeout;
    }

    fn worker_groups(&self) -> Vec<WorkerGroupInfo> {
        let now = Instant::now();
        self.settings()
            .groups
            .iter()
            .map(|g| WorkerGroupInfo {
                pid: g.pid,
                workers: g.workers,
                started_ms: g
                    .started
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0),
                remaining_ms: g
                    .deadline
                    .map(|d| d.saturating_duration_since(now).as_millis() as u64),
                is_flusher: g.is_flusher,
                is_boost: g.is_boost,
            })
            .collect()
    }

    fn cancel_workers(&self, pid: u64) -> bool {
        let token = self
            .settings()
            .groups
            .iter()
            .find(|g| g.pid == pid)
            .map(|g| g.token.clone());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn number_in_queue(&self) -> i64 {
        self.inner.num_in_queue.load(Ordering::SeqCst)
    }

    fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    fn pause(&self) {
        self.inner.paused.send_if_modified(|paused| !std::mem::replace(paused, true));
    }

    fn resume(&self) {
        self.inner.paused.send_if_modified(|paused| std::mem::replace(paused, false));
    }

    fn stats(&self) -> PoolStats {
        let c = &self.inner.counters;
        PoolStats {
            handled: c.handled.load(Ordering::Relaxed),
            unhandled: c.unhandled.load(Ordering::Relaxed),
            panics: c.panics.load(Ordering::Relaxed),
            boosts: c.boosts.load(Ordering::Relaxed),
        }
    }
}
