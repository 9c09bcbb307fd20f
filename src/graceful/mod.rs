//! Graceful lifecycle management for long-running servers.
//!
//! The [`Manager`] moves through four phases, each with its own
//! cancellation token and callback list:
//!
//! ```text
//! Init ──start()──▶ Running ──do_shutdown()──▶ ShuttingDown ──do_terminate()──▶ Terminate
//!                      │                            │
//!                 shutdown token              hammer token ─▶ terminate token ─▶ done token
//! ```
//!
//! Tokens are nested (`shutdown` is a child of `hammer`, which is a child of
//! `terminate`, which is a child of `done`), so a later phase always implies
//! the earlier ones. Callbacks run as independent tasks with panic recovery.
//!
//! The manager is a cheap handle: clone it into every subsystem that needs
//! to observe or drive the lifecycle.

mod error;
pub(crate) mod net;
mod signals;

pub use error::GracefulError;

use std::any::Any;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::GracefulConfig;
use net::Listeners;

/// A deferred unit of work run when a lifecycle phase begins.
pub type Callback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + 'static>;

/// Box an async closure as a [`Callback`].
pub fn callback<F, Fut>(f: F) -> Callback
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move || f().boxed())
}

/// Lifecycle phase of the manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Init,
    Running,
    ShuttingDown,
    Terminate,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Init => "init",
            State::Running => "running",
            State::ShuttingDown => "shutting-down",
            State::Terminate => "terminate",
        }
    }
}

/// Marks a running server; the server counts as finished when dropped.
#[must_use = "the server is considered done as soon as the guard is dropped"]
pub struct ServerGuard(#[allow(dead_code)] TaskTrackerToken);

impl ServerGuard {
    /// Declare the server finished.
    pub fn done(self) {}
}

/// Graceful shutdown coordinator.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: GracefulConfig,
    phases: Mutex<Phases>,

    done: CancellationToken,
    terminate: CancellationToken,
    hammer: CancellationToken,
    shutdown: CancellationToken,

    running_servers: TaskTracker,
    terminate_callbacks: TaskTracker,
    create_servers: TaskTracker,
    pending_servers: Mutex<Vec<TaskTrackerToken>>,

    listeners: Listeners,
    is_child: bool,
    forked: AtomicBool,
}

#[derive(Default)]
struct Phases {
    state: State,
    at_shutdown: Vec<Callback>,
    at_hammer: Vec<Callback>,
    at_terminate: Vec<Callback>,
}

impl Manager {
    /// Create a manager, picking up listeners inherited from a parent process.
    pub fn new(config: GracefulConfig) -> Self {
        Self::with_listeners(config, Listeners::from_env(), net::is_child())
    }

    fn with_listeners(config: GracefulConfig, listeners: Listeners, is_child: bool) -> Self {
        let done = CancellationToken::new();
        let terminate = done.child_token();
        let hammer = terminate.child_token();
        let shutdown = hammer.child_token();

        let running_servers = TaskTracker::new();
        running_servers.close();
        let terminate_callbacks = TaskTracker::new();
        terminate_callbacks.close();
        let create_servers = TaskTracker::new();
        create_servers.close();
        let pending_servers = (0..config.servers_to_create)
            .map(|_| create_servers.token())
            .collect();

        Self {
            inner: Arc::new(ManagerInner {
                config,
                phases: Mutex::new(Phases::default()),
                done,
                terminate,
                hammer,
                shutdown,
                running_servers,
                terminate_callbacks,
                create_servers,
                pending_servers: Mutex::new(pending_servers),
                listeners,
                is_child,
                forked: AtomicBool::new(false),
            }),
        }
    }

    fn phases(&self) -> MutexGuard<'_, Phases> {
        lock(&self.inner.phases)
    }

    pub fn config(&self) -> &GracefulConfig {
        &self.inner.config
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> State {
        self.phases().state
    }

    /// Move from `old` to `new`; false if the manager is not in `old`.
    pub fn set_state_transition(&self, old: State, new: State) -> bool {
        let mut phases = self.phases();
        if phases.state != old {
            return false;
        }
        phases.state = new;
        true
    }

    /// Enter `Running` and watch start-up.
    ///
    /// Once every expected server has taken a listener (or reported it will
    /// not), unclaimed inherited listeners are closed and, in a restarted
    /// child, the parent is told to shut down.
    pub fn start(&self) {
        if !self.set_state_transition(State::Init, State::Running) {
            warn!(state = self.state().as_str(), "graceful manager already started");
            return;
        }
        info!(pid = std::process::id(), child = self.inner.is_child, "graceful manager running");

        let manager = self.clone();
        tokio::spawn(async move {
            let inner = &manager.inner;
            let created = inner.create_servers.wait();
            let timeout = async {
                match inner.config.startup_timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = created => {}
                _ = inner.shutdown.cancelled() => return,
                _ = timeout => {
                    error!("startup took too long, shutting down");
                    manager.do_shutdown();
                    return;
                }
            }

            inner.listeners.close_provided();
            if inner.is_child {
                match net::kill_parent() {
                    Ok(()) => info!("asked parent process to shut down"),
                    Err(e) => warn!(error = %e, "unable to signal parent process"),
                }
            }
            debug!("all expected servers created");
        });
    }

    // ------------------------------------------------------------------
    // Running work under the manager
    // ------------------------------------------------------------------

    /// Count a server as running until the guard is dropped.
    pub fn register_server(&self) -> ServerGuard {
        ServerGuard(self.inner.running_servers.token())
    }

    /// Run `run` as a server with the shutdown token.
    ///
    /// `run` must return once the token is cancelled and its work is
    /// finished. A panic triggers a global shutdown.
    pub async fn run_with_shutdown_context<F, Fut>(&self, run: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        let _server = self.register_server();
        self.run_guarded(run).await;
    }

    /// Like [`Manager::run_with_shutdown_context`] on a new task, counted as
    /// running from the moment of the call.
    pub fn spawn_with_shutdown_context<F, Fut>(&self, run: F) -> JoinHandle<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let server = self.register_server();
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_guarded(run).await;
            server.done();
        })
    }

    async fn run_guarded<F, Fut>(&self, run: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        let ctx = self.shutdown_context();
        let result = AssertUnwindSafe(async move { run(ctx).await })
            .catch_unwind()
            .await;
        if let Err(panic) = result {
            error!(panic = %panic_message(&*panic), "panic in managed server, shutting down");
            self.do_shutdown();
        }
    }

    /// Run `run` with functions to register its shutdown and terminate work.
    ///
    /// Used by queues: `run` registers callbacks and returns.
    pub fn run_with_shutdown_fns<F>(&self, run: F)
    where
        F: FnOnce(&dyn Fn(Callback), &dyn Fn(Callback)),
    {
        let _server = self.register_server();
        let at_shutdown = |cb: Callback| self.register_shutdown(None, cb);
        let at_terminate = |cb: Callback| self.register_terminate(cb);
        let result =
            std::panic::catch_unwind(AssertUnwindSafe(|| run(&at_shutdown, &at_terminate)));
        if let Err(panic) = result {
            error!(panic = %panic_message(&*panic), "panic in managed runnable, shutting down");
            self.do_shutdown();
        }
    }

    /// Run `f` at shutdown unless `ctx` is cancelled by then.
    pub fn run_at_shutdown<F, Fut>(&self, ctx: &CancellationToken, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register_shutdown(Some(ctx.clone()), callback(f));
    }

    /// Run `f` at hammer.
    pub fn run_at_hammer<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cb = callback(f);
        let mut phases = self.phases();
        if self.inner.hammer.is_cancelled() {
            drop(phases);
            spawn_callback("hammer", cb);
        } else {
            phases.at_hammer.push(cb);
        }
    }

    /// Run `f` at terminate; `wait_for_terminate` waits for it.
    pub fn run_at_terminate<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register_terminate(callback(f));
    }

    fn register_shutdown(&self, ctx: Option<CancellationToken>, cb: Callback) {
        let cb: Callback = match ctx {
            Some(ctx) => Box::new(move || {
                async move {
                    if !ctx.is_cancelled() {
                        cb().await;
                    }
                }
                .boxed()
            }),
            None => cb,
        };

        let mut phases = self.phases();
        if self.inner.shutdown.is_cancelled() {
            drop(phases);
            spawn_callback("shutdown", cb);
        } else {
            phases.at_shutdown.push(cb);
        }
    }

    fn register_terminate(&self, cb: Callback) {
        let token = self.inner.terminate_callbacks.token();
        let cb: Callback = Box::new(move || {
            async move {
                let _token = token;
                cb().await;
            }
            .boxed()
        });

        let mut phases = self.phases();
        if self.inner.terminate.is_cancelled() {
            drop(phases);
            spawn_callback("terminate", cb);
        } else {
            phases.at_terminate.push(cb);
        }
    }

    // ------------------------------------------------------------------
    // Phase transitions
    // ------------------------------------------------------------------

    /// Begin shutdown: cancel the shutdown token, run shutdown callbacks,
    /// schedule the hammer, and terminate once every server has returned.
    pub fn do_shutdown(&self) {
        if !self.set_state_transition(State::Running, State::ShuttingDown) {
            return;
        }
        let callbacks = {
            let mut phases = self.phases();
            self.inner.shutdown.cancel();
            std::mem::take(&mut phases.at_shutdown)
        };
        info!(callbacks = callbacks.len(), "graceful shutdown started");
        fire("shutdown", callbacks);

        // Servers that never asked for a listener will not now
        lock(&self.inner.pending_servers).clear();

        if let Some(hammer_time) = self.inner.config.hammer_time {
            let manager = self.clone();
            tokio::spawn(async move { manager.do_hammer_time(hammer_time).await });
        }

        let manager = self.clone();
        tokio::spawn(async move {
            manager.wait_for_servers().await;
            // Mop up anything still waiting for the hammer
            manager.do_hammer_time(Duration::ZERO).await;
            tokio::time::sleep(manager.inner.config.terminate_delay).await;
            manager.do_terminate();
            manager.wait_for_terminate().await;
            {
                let _phases = manager.phases();
                manager.inner.done.cancel();
            }
            info!("graceful manager done");
        });
    }

    /// After `d`, cancel the hammer token and run hammer callbacks.
    pub async fn do_hammer_time(&self, d: Duration) {
        if !d.is_zero() {
            tokio::time::sleep(d).await;
        }
        self.hammer_now();
    }

    fn hammer_now(&self) {
        let (shutdown_callbacks, hammer_callbacks) = {
            let mut phases = self.phases();
            if self.inner.hammer.is_cancelled() {
                return;
            }
            // A hammer without a prior shutdown still runs the shutdown phase first
            let shutdown_callbacks = if self.inner.shutdown.is_cancelled() {
                Vec::new()
            } else {
                self.inner.shutdown.cancel();
                std::mem::take(&mut phases.at_shutdown)
            };
            self.inner.hammer.cancel();
            (shutdown_callbacks, std::mem::take(&mut phases.at_hammer))
        };
        warn!(callbacks = hammer_callbacks.len(), "setting hammer condition");
        fire("shutdown", shutdown_callbacks);
        fire("hammer", hammer_callbacks);
    }

    /// Enter `Terminate`: cancel the terminate token and run terminate callbacks.
    pub fn do_terminate(&self) {
        if !self.set_state_transition(State::ShuttingDown, State::Terminate) {
            return;
        }
        self.hammer_now();
        let callbacks = {
            let mut phases = self.phases();
            if self.inner.terminate.is_cancelled() {
                return;
            }
            self.inner.terminate.cancel();
            std::mem::take(&mut phases.at_terminate)
        };
        warn!(callbacks = callbacks.len(), "terminating");
        fire("terminate", callbacks);
    }

    /// Graceful shutdown (SIGINT/SIGTERM).
    pub fn do_graceful_shutdown(&self) {
        self.do_shutdown();
    }

    /// Hammer right away (SIGUSR2).
    pub fn do_immediate_hammer(&self) {
        self.hammer_now();
    }

    /// Fork a replacement that inherits the listeners (SIGHUP).
    ///
    /// The replacement asks this process to shut down once its servers are
    /// up. Without restart support this is a plain shutdown; a second
    /// request while a child is already starting hammers.
    pub fn do_graceful_restart(&self) {
        if !self.inner.config.restartable {
            info!(pid = std::process::id(), "not restartable, shutting down");
            self.do_shutdown();
            return;
        }

        info!(pid = std::process::id(), "forking");
        match self.fork() {
            Ok(child) => info!(child, "replacement started, waiting for it to take over"),
            Err(GracefulError::AlreadyForked) => {
                warn!("already forked, hammering");
                self.do_immediate_hammer();
            }
            Err(e) => error!(error = %e, "unable to fork replacement process"),
        }
    }

    fn fork(&self) -> Result<u32, GracefulError> {
        if self.inner.forked.swap(true, Ordering::SeqCst) {
            return Err(GracefulError::AlreadyForked);
        }
        self.inner.listeners.restart_process().map_err(|e| {
            self.inner.forked.store(false, Ordering::SeqCst);
            GracefulError::from(e)
        })
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Listener for `addr`, inherited from the parent when possible.
    ///
    /// Counts as this server's report to the start-up watcher.
    pub fn get_listener(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let result = self
            .inner
            .listeners
            .get_listener(addr)
            .and_then(TcpListener::from_std);
        self.inform_cleanup();
        result
    }

    /// Forget the listener bound to `addr` once its server stopped serving.
    ///
    /// Released listeners are no longer handed to a restarted process.
    pub fn release_listener(&self, addr: SocketAddr) {
        if self.inner.listeners.release(addr) {
            debug!(%addr, "released listener");
        }
    }

    /// Listeners currently held for servers.
    pub fn active_listeners(&self) -> usize {
        self.inner.listeners.active_count()
    }

    /// Report that one expected server has taken, or will not take, a listener.
    pub fn inform_cleanup(&self) {
        if lock(&self.inner.pending_servers).pop().is_none() {
            debug!("inform_cleanup called more often than servers were expected");
        }
    }

    /// True when started by a parent handing over its listeners.
    pub fn is_child(&self) -> bool {
        self.inner.is_child
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// Resolves at shutdown.
    pub fn is_shutdown(&self) -> WaitForCancellationFutureOwned {
        self.inner.shutdown.clone().cancelled_owned()
    }

    /// Resolves at hammer.
    pub fn is_hammer(&self) -> WaitForCancellationFutureOwned {
        self.inner.hammer.clone().cancelled_owned()
    }

    /// Resolves at terminate, after every running server returned.
    pub fn is_terminate(&self) -> WaitForCancellationFutureOwned {
        self.inner.terminate.clone().cancelled_owned()
    }

    /// Token cancelled at shutdown.
    pub fn shutdown_context(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Token cancelled at hammer.
    pub fn hammer_context(&self) -> CancellationToken {
        self.inner.hammer.clone()
    }

    /// Token cancelled at terminate.
    pub fn terminate_context(&self) -> CancellationToken {
        self.inner.terminate.clone()
    }

    pub(crate) fn done_token(&self) -> CancellationToken {
        self.inner.done.clone()
    }

    /// Wait for every running server to return.
    pub async fn wait_for_servers(&self) {
        self.inner.running_servers.wait().await;
    }

    /// Wait for every terminate callback to finish.
    pub async fn wait_for_terminate(&self) {
        self.inner.terminate_callbacks.wait().await;
    }

    /// Resolves once termination has fully completed.
    pub async fn done(&self) {
        self.inner.done.cancelled().await;
    }

    /// `Some` once the manager is done.
    pub fn err(&self) -> Option<GracefulError> {
        self.inner.done.is_cancelled().then_some(GracefulError::Done)
    }

    /// The manager has no fixed deadline.
    pub fn deadline(&self) -> Option<Instant> {
        None
    }

    /// Number of servers currently running under the manager.
    pub fn running_servers(&self) -> usize {
        self.inner.running_servers.len()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fire(phase: &'static str, callbacks: Vec<Callback>) {
    for cb in callbacks {
        spawn_callback(phase, cb);
    }
}

fn spawn_callback(phase: &'static str, cb: Callback) {
    tokio::spawn(async move {
        let result = AssertUnwindSafe(async move { cb().await })
            .catch_unwind()
            .await;
        if let Err(panic) = result {
            error!(phase, panic = %panic_message(&*panic), "panic in lifecycle callback");
        }
    });
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
