//! Admin HTTP API against a live server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_queue::admin::{run_admin_server, AdminState};
use tokio_queue::graceful::{Manager, State};
use tokio_queue::observability::Metrics;
use tokio_queue::queue::{ChannelQueue, Flushable, Queue, QueueManager, QueueType};

use crate::helpers::*;

struct Harness {
    base: String,
    manager: Manager,
    client: reqwest::Client,
    queue: Arc<ChannelQueue<u32>>,
}

async fn start_admin() -> Harness {
    let manager = test_manager(1);
    let registry = QueueManager::new();
    let (handle, _count) = counting_handler::<u32>();
    let queue = ChannelQueue::new(&registry, idle_config("mail", QueueType::Channel), handle);
    manager.run_with_shutdown_fns(|s, t| Arc::clone(&queue).run(s, t));

    let listener = manager.get_listener("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(AdminState {
        manager: manager.clone(),
        queues: registry,
        metrics: Arc::new(Metrics::new().unwrap()),
    });
    let hammer = manager.hammer_context();
    manager.spawn_with_shutdown_context(move |shutdown| {
        run_admin_server(listener, state, shutdown, hammer)
    });

    Harness {
        base: format!("http://{}", addr),
        manager,
        client: reqwest::Client::new(),
        queue,
    }
}

impl Harness {
    async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(format!("{}{}", self.base, path)).send().await.unwrap()
    }

    async fn post(&self, path: &str) -> reqwest::Response {
        self.client.post(format!("{}{}", self.base, path)).send().await.unwrap()
    }
}

#[tokio::test]
async fn test_health_and_queue_listing() {
    let admin = start_admin().await;

    let health: Value = admin.get("/health").await.json().await.unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["state"], "running");
    assert_eq!(health["queues"], 1);
    assert_eq!(admin.manager.active_listeners(), 1);

    let queues: Value = admin.get("/queues").await.json().await.unwrap();
    let queues = queues.as_array().unwrap();
    assert_eq!(queues.len(), 1);
    assert_eq!(queues[0]["name"], "mail");
    assert_eq!(queues[0]["type"], "channel");

    let qid = admin.queue.qid();
    let one: Value = admin.get(&format!("/queues/{}", qid)).await.json().await.unwrap();
    assert_eq!(one["qid"], qid);
}

#[tokio::test]
async fn test_pause_flush_and_workers() {
    let admin = start_admin().await;
    let qid = admin.queue.qid();

    for i in 0..3 {
        admin.queue.push(i).await.unwrap();
    }

    let response = admin.post(&format!("/queues/{}/pause", qid)).await;
    assert_eq!(response.status(), 200);
    let summary: Value = admin.get(&format!("/queues/{}", qid)).await.json().await.unwrap();
    assert_eq!(summary["paused"], true);
    assert_eq!(summary["in_queue"], 3);

    admin.post(&format!("/queues/{}/resume", qid)).await;
    let response = admin.post(&format!("/queues/{}/flush?timeout=5s", qid)).await;
    assert_eq!(response.status(), 200);
    assert!(admin.queue.is_empty());

    let response = admin
        .post(&format!("/queues/{}/add-workers?number=2&timeout=1m", qid))
        .await;
    assert_eq!(response.status(), 200);
    let summary: Value = admin.get(&format!("/queues/{}", qid)).await.json().await.unwrap();
    assert_eq!(summary["workers"], 2);

    let response = admin.post(&format!("/queues/{}/add-workers?number=zero", qid)).await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_metrics_and_errors() {
    let admin = start_admin().await;
    admin.queue.push(7).await.unwrap();

    let response = admin.get("/metrics").await;
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("tokio_queue_items"));
    assert!(body.contains("queue=\"mail\""));

    assert_eq!(admin.get("/nowhere").await.status(), 404);
    assert_eq!(admin.get("/queues/999").await.status(), 404);
    assert_eq!(admin.post("/health").await.status(), 405);
    assert_eq!(admin.get("/queues/flush-all").await.status(), 405);
}

#[tokio::test]
async fn test_shutdown_through_api() {
    let admin = start_admin().await;

    let response = admin.post("/manager/shutdown").await;
    assert_eq!(response.status(), 202);

    tokio::time::timeout(Duration::from_secs(5), admin.manager.done())
        .await
        .expect("manager did not finish");
    assert_eq!(admin.manager.state(), State::Terminate);
    assert_eq!(admin.manager.active_listeners(), 0);
    assert!(admin.queue.push(1).await.is_err());
}
