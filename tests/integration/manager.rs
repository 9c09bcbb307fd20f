//! Graceful manager lifecycle with queues attached.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_queue::graceful::State;
use tokio_queue::queue::{
    ByteFifo, MemoryByteFifo, PersistableChannelQueue, Queue, QueueConfig, QueueManager,
};

use crate::helpers::*;

type Events = Arc<Mutex<Vec<&'static str>>>;

fn record(events: &Events, event: &'static str) {
    events.lock().unwrap().push(event);
}

#[tokio::test]
async fn test_phases_run_in_order() {
    let manager = test_manager(0);
    let events: Events = Arc::default();

    let e = Arc::clone(&events);
    manager.run_at_shutdown(&CancellationToken::new(), move || async move { record(&e, "shutdown") });
    let e = Arc::clone(&events);
    manager.run_at_hammer(move || async move { record(&e, "hammer") });
    let e = Arc::clone(&events);
    manager.run_at_terminate(move || async move { record(&e, "terminate") });

    let e = Arc::clone(&events);
    manager.spawn_with_shutdown_context(move |ctx| async move {
        ctx.cancelled().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        record(&e, "server stopped");
    });

    assert_eq!(manager.state(), State::Running);
    manager.do_graceful_shutdown();
    tokio::time::timeout(Duration::from_secs(5), manager.done())
        .await
        .expect("manager did not finish");

    assert_eq!(manager.state(), State::Terminate);
    // Hammer callbacks are not awaited by done()
    let all_ran = wait_until(|| events.lock().unwrap().len() == 4, Duration::from_secs(2)).await;
    assert!(all_ran);
    let events = events.lock().unwrap().clone();
    assert_eq!(events.len(), 4, "{:?}", events);
    let position = |name| events.iter().position(|e| *e == name).unwrap();
    assert_eq!(position("shutdown"), 0);
    assert!(position("server stopped") < position("terminate"));
    assert!(position("server stopped") < position("hammer"));
}

#[tokio::test]
async fn test_terminate_callback_registered_after_done_still_runs() {
    let manager = test_manager(0);
    manager.do_graceful_shutdown();
    tokio::time::timeout(Duration::from_secs(5), manager.done())
        .await
        .expect("manager did not finish");

    let events: Events = Arc::default();
    let e = Arc::clone(&events);
    manager.run_at_terminate(move || async move { record(&e, "late") });
    let ran = wait_until(|| !events.lock().unwrap().is_empty(), Duration::from_secs(2)).await;
    assert!(ran);
}

#[tokio::test]
async fn test_persistable_queue_keeps_everything_across_manager_shutdown() {
    let manager = test_manager(0);
    let registry = QueueManager::new();
    let fifo: Arc<dyn ByteFifo> = Arc::new(MemoryByteFifo::new());
    let (handle, count) = counting_handler::<u32>();
    let config = QueueConfig::new("durable").with_workers(1).without_boost();
    let queue = PersistableChannelQueue::new(&registry, config, handle, Arc::clone(&fifo));
    manager.run_with_shutdown_fns(|s, t| Arc::clone(&queue).run(s, t));

    for i in 0..200 {
        queue.push(i).await.unwrap();
    }
    manager.do_graceful_shutdown();
    tokio::time::timeout(Duration::from_secs(5), manager.done())
        .await
        .expect("manager did not finish");

    // Whatever the worker did not reach was spilled
    assert_eq!(count.load(Ordering::SeqCst) + fifo.len(), 200);
    assert!(registry.managed_queues().is_empty());
}
