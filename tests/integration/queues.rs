//! Queue scenarios across queue types.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_queue::queue::{
    create_queue, handler, ByteFifo, Flushable, MemoryByteFifo, PersistableChannelQueue, Queue,
    QueueConfig, QueueError, QueueManager, QueueType,
};

use crate::helpers::*;

#[tokio::test]
async fn test_unique_queue_rejects_waiting_duplicate() {
    let registry = QueueManager::new();
    let (handle, count) = counting_handler::<String>();
    let queue = create_queue(&registry, idle_config("unique", QueueType::UniqueChannel), handle).unwrap();

    queue.push("A".to_string()).await.unwrap();
    queue.push("B".to_string()).await.unwrap();
    let err = queue.push("A".to_string()).await.unwrap_err();
    assert!(err.is_already_in_queue());

    queue.flush(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);

    // Handled items can be queued again
    queue.push("A".to_string()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_item_lost_under_boosting() {
    let registry = QueueManager::new();
    let (handle, count) = counting_handler::<u64>();
    let config = QueueConfig::new("busy")
        .with_type(QueueType::Channel)
        .with_workers(1)
        .with_max_workers(Some(4))
        .with_queue_length(4)
        .with_batch_length(3)
        .with_boost(2, Duration::from_millis(5), Duration::from_millis(200));
    let queue = create_queue(&registry, config, handle).unwrap();
    let manager = test_manager(0);
    manager.run_with_shutdown_fns(|s, t| Arc::clone(&queue).run(s, t));

    let mut pushers = Vec::new();
    for p in 0..4u64 {
        let queue = Arc::clone(&queue);
        pushers.push(tokio::spawn(async move {
            for i in 0..250u64 {
                queue.push(p * 1000 + i).await.unwrap();
            }
        }));
    }
    for pusher in pushers {
        pusher.await.unwrap();
    }

    queue.flush(Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1000);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_push_blocks_while_backlog_full() {
    let registry = QueueManager::new();
    let (handle, _count) = counting_handler::<u8>();
    let config = idle_config("full", QueueType::Channel).with_queue_length(1);
    let queue = create_queue(&registry, config, handle).unwrap();

    queue.push(1).await.unwrap();
    let mut blocked = tokio_test::task::spawn(queue.push(2));
    tokio_test::assert_pending!(blocked.poll());

    let timed_out = tokio::time::timeout(Duration::from_millis(50), queue.push(3)).await;
    assert!(timed_out.is_err());
}

#[tokio::test]
async fn test_persistable_queue_survives_restart() {
    let fifo: Arc<dyn ByteFifo> = Arc::new(MemoryByteFifo::new());

    // First life: items are queued but never handled
    {
        let registry = QueueManager::new();
        let (handle, count) = counting_handler::<u32>();
        let queue = PersistableChannelQueue::new(
            &registry,
            idle_config("durable", QueueType::PersistableChannel),
            handle,
            Arc::clone(&fifo),
        );
        for i in 0..10 {
            queue.push(i).await.unwrap();
        }
        queue.shutdown().await;
        queue.push(10).await.unwrap();
        queue.terminate().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(fifo.len(), 11);
    }

    // Second life: run replays the fifo into working pools
    let registry = QueueManager::new();
    let (handle, count) = counting_handler::<u32>();
    let config = QueueConfig::new("durable").with_workers(2).without_boost();
    let queue = PersistableChannelQueue::new(&registry, config, handle, Arc::clone(&fifo));
    let manager = test_manager(0);
    manager.run_with_shutdown_fns(|s, t| Arc::clone(&queue).run(s, t));

    let replayed = wait_until(|| count.load(Ordering::SeqCst) == 11, Duration::from_secs(5)).await;
    assert!(replayed, "handled {}", count.load(Ordering::SeqCst));
    assert!(fifo.is_empty());
}

#[tokio::test]
async fn test_registry_flush_all() {
    let registry = QueueManager::new();
    let (handle_a, count_a) = counting_handler::<u32>();
    let (handle_b, count_b) = counting_handler::<u32>();
    let a = create_queue(&registry, idle_config("a", QueueType::Channel), handle_a).unwrap();
    let b = create_queue(&registry, idle_config("b", QueueType::PersistableChannel), handle_b).unwrap();

    for i in 0..15 {
        a.push(i).await.unwrap();
        b.push(i).await.unwrap();
    }
    assert_eq!(registry.managed_queues().len(), 2);

    registry.flush_all(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(count_a.load(Ordering::SeqCst), 15);
    assert_eq!(count_b.load(Ordering::SeqCst), 15);
}

#[tokio::test]
async fn test_shutdown_and_terminate_are_idempotent() {
    let registry = QueueManager::new();
    for queue_type in [QueueType::Channel, QueueType::UniqueChannel, QueueType::PersistableChannel] {
        let (handle, _) = counting_handler::<u32>();
        let queue = create_queue(&registry, idle_config("twice", queue_type), handle).unwrap();
        queue.shutdown().await;
        queue.shutdown().await;
        queue.terminate().await;
        queue.terminate().await;
        assert!(registry.get(queue.qid()).is_none(), "{} still registered", queue_type);
    }
    assert!(registry.managed_queues().is_empty());
}

#[tokio::test]
async fn test_shutdown_then_flush_handles_every_item() {
    for queue_type in [QueueType::Channel, QueueType::UniqueChannel] {
        let registry = QueueManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let (record, attempts) = (Arc::clone(&seen), Arc::clone(&calls));
        // Every other call fails the whole batch
        let handle = handler(move |batch: Vec<u32>| {
            if attempts.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                return batch;
            }
            record.lock().unwrap().extend(batch);
            Vec::new()
        });
        let config = QueueConfig::new("drain")
            .with_type(queue_type)
            .with_workers(2)
            .with_queue_length(100)
            .with_batch_length(7)
            .without_boost();
        let queue = create_queue(&registry, config, handle).unwrap();
        let manager = test_manager(0);
        manager.run_with_shutdown_fns(|s, t| Arc::clone(&queue).run(s, t));

        for i in 0..60 {
            queue.push(i).await.unwrap();
        }
        queue.shutdown().await;
        queue.flush(Some(Duration::from_secs(10))).await.unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..60).collect::<Vec<_>>(), "{}", queue_type);
        assert!(calls.load(Ordering::SeqCst) > 1);
    }
}

#[tokio::test]
async fn test_unique_key_free_after_abandoned_push() {
    let registry = QueueManager::new();
    let (handle, count) = counting_handler::<String>();
    let config = idle_config("unique-full", QueueType::UniqueChannel).with_queue_length(1);
    let queue = create_queue(&registry, config, handle).unwrap();

    queue.push("A".to_string()).await.unwrap();
    let abandoned = tokio::time::timeout(Duration::from_millis(50), queue.push("B".to_string())).await;
    assert!(abandoned.is_err());
    assert!(!queue.has(&"B".to_string()).unwrap());

    queue.flush(Some(Duration::from_secs(5))).await.unwrap();
    queue.push("B".to_string()).await.unwrap();
    queue.flush(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_flush_timeout_with_failing_handler() {
    let registry = QueueManager::new();
    let config = idle_config("stuck", QueueType::Channel);
    let queue = create_queue(&registry, config, handler(|batch: Vec<u32>| batch)).unwrap();
    queue.push(1).await.unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        queue.flush(Some(Duration::from_millis(100))),
    )
    .await
    .expect("flush did not honour its timeout");
    assert!(matches!(result, Err(QueueError::FlushTimeout(_))));
    assert!(!queue.is_empty());
}
