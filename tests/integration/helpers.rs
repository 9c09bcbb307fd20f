//! Test helpers and utilities

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_queue::config::GracefulConfig;
use tokio_queue::graceful::Manager;
use tokio_queue::queue::{handler, HandlerFn, QueueConfig, QueueType};

/// Queue config with no workers and no boosting, so items stay put until flushed.
pub fn idle_config(name: &str, queue_type: QueueType) -> QueueConfig {
    QueueConfig::new(name)
        .with_type(queue_type)
        .with_workers(0)
        .without_boost()
}

/// Handler that counts handled items.
pub fn counting_handler<T: Clone + std::fmt::Debug + Send + Sync + 'static>() -> (HandlerFn<T>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let handle = handler(move |batch: Vec<T>| {
        seen.fetch_add(batch.len(), Ordering::SeqCst);
        Vec::new()
    });
    (handle, count)
}

/// Manager that needs no listeners, never hammers on its own and terminates without delay.
pub fn test_manager(servers_to_create: usize) -> Manager {
    let config = GracefulConfig::default()
        .with_hammer_time(None)
        .with_servers_to_create(servers_to_create)
        .with_terminate_delay(Duration::ZERO)
        .with_restartable(false);
    let manager = Manager::new(config);
    manager.start();
    manager
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
