//! Admin HTTP server.
//!
//! Exposes health, Prometheus metrics and runtime controls of the queues
//! and the graceful manager:
//!
//! | Method | Path                                   | Action                        |
//! |--------|----------------------------------------|-------------------------------|
//! | GET    | `/health`                              | status and lifecycle state    |
//! | GET    | `/metrics`                             | Prometheus text format        |
//! | GET    | `/queues`                              | every registered queue        |
//! | GET    | `/queues/{qid}`                        | one queue                     |
//! | POST   | `/queues/{qid}/pause`, `/resume`       | pause or resume workers       |
//! | POST   | `/queues/{qid}/flush?timeout=`         | flush one queue               |
//! | POST   | `/queues/{qid}/add-workers?number=&timeout=` | start workers           |
//! | POST   | `/queues/{qid}/cancel-workers?pid=`    | stop a worker group           |
//! | POST   | `/queues/{qid}/settings?max_workers=&boost_workers=&boost_timeout=` | tune the pool |
//! | POST   | `/queues/flush-all?timeout=`           | flush every queue             |
//! | POST   | `/manager/shutdown`, `/restart`, `/hammer` | drive the manager         |

mod routes;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::graceful::Manager;
use crate::observability::Metrics;
use crate::queue::QueueManager;

/// Back-off after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything the admin routes act on.
pub struct AdminState {
    pub manager: Manager,
    pub queues: QueueManager,
    pub metrics: Arc<Metrics>,
}

/// Serve the admin API on `listener` until `shutdown` is cancelled.
///
/// Open connections are then drained; at `hammer` they are abandoned.
pub async fn run_admin_server(
    listener: TcpListener,
    state: Arc<AdminState>,
    shutdown: CancellationToken,
    hammer: CancellationToken,
) {
    let local_addr = listener.local_addr().ok();
    if let Some(addr) = local_addr {
        info!(%addr, "admin server listening");
    }
    let graceful = GracefulShutdown::new();

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "admin accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);

        let state = Arc::clone(&state);
        let service = service_fn(move |req| {
            let state = Arc::clone(&state);
            async move { Ok::<_, Infallible>(routes::handle(req, &state).await) }
        });

        let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
        let conn = graceful.watch(conn);
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(%peer, error = %e, "admin connection error");
            }
        });
    }

    drop(listener);
    if let Some(addr) = local_addr {
        state.manager.release_listener(addr);
    }
    debug!("admin server draining connections");
    tokio::select! {
        _ = graceful.shutdown() => info!("admin server stopped"),
        _ = hammer.cancelled() => warn!("admin server hammered, abandoning open connections"),
    }
}
