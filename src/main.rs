use std::sync::Arc;

use tracing::info;

use tokio_queue::admin::{run_admin_server, AdminState};
use tokio_queue::config::Config;
use tokio_queue::graceful::Manager;
use tokio_queue::indexer::{indexer_handler, Indexer, MemoryIndexer};
use tokio_queue::observability::Metrics;
use tokio_queue::queue::{create_queue, QueueManager};

/// Name of the queue feeding the issue indexer.
const ISSUE_INDEXER_QUEUE: &str = "issue_indexer";

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::from_env()?;
    tokio_queue::logging::init(&config.logging)?;

    info!(version = tokio_queue::VERSION, pid = std::process::id(), "Starting tokio_queue...");
    config.log_summary();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(config))
}

async fn async_main(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // The admin server is the only listener-taking server
    let manager = Manager::new(config.graceful.clone().with_servers_to_create(1));
    manager.start();
    let _signals = manager.handle_signals()?;

    let registry = QueueManager::new();

    let indexer: Arc<dyn Indexer> = Arc::new(MemoryIndexer::new());
    let populated = indexer.init()?;
    info!(populated, "issue indexer ready");
    {
        let indexer = Arc::clone(&indexer);
        manager.run_at_terminate(move || async move { indexer.close() });
    }

    let queue_config = config.queue.queue(ISSUE_INDEXER_QUEUE)?;
    let queue = create_queue(&registry, queue_config, indexer_handler(Arc::clone(&indexer)))?;
    manager.run_with_shutdown_fns(|at_shutdown, at_terminate| {
        Arc::clone(&queue).run(at_shutdown, at_terminate)
    });
    info!(queue = ISSUE_INDEXER_QUEUE, qid = queue.qid(), "queue running");

    match config.admin.internal_addr {
        Some(addr) => {
            let listener = manager.get_listener(addr)?;
            let state = Arc::new(AdminState {
                manager: manager.clone(),
                queues: registry.clone(),
                metrics: Arc::new(Metrics::new()?),
            });
            let hammer = manager.hammer_context();
            manager.spawn_with_shutdown_context(move |shutdown| {
                run_admin_server(listener, state, shutdown, hammer)
            });
        }
        None => manager.inform_cleanup(),
    }

    manager.done().await;
    info!("tokio_queue stopped");
    Ok(())
}
