//! tokio_queue - generic task queues with graceful lifecycle management.
//!
//! This crate provides resizable worker pools behind several queue front-ends
//! and a manager that drives a process through shutdown, hammer and
//! terminate, including zero-downtime restarts that hand listening sockets
//! to a replacement process.
//!
//! # Features
//!
//! - **Worker pools**: bounded, batched backlogs with temporary boost workers
//! - **Queue types**: plain, unique (rejects waiting duplicates) and
//!   persistable (spills to a byte FIFO across restarts)
//! - **Graceful manager**: ordered shutdown, hammer and terminate phases
//! - **Admin API**: health, Prometheus metrics and runtime queue controls
//!
//! # Example
//!
//! ```rust,ignore
//! use tokio_queue::graceful::Manager;
//! use tokio_queue::queue::{create_queue, handler, QueueConfig, QueueManager};
//!
//! let manager = Manager::new(Default::default());
//! let registry = QueueManager::new();
//! let queue = create_queue(&registry, QueueConfig::new("mail"), handler(|batch: Vec<String>| {
//!     send_all(&batch);
//!     Vec::new()
//! }))?;
//! manager.run_with_shutdown_fns(|at_shutdown, at_terminate| queue.clone().run(at_shutdown, at_terminate));
//! queue.push("hello".to_string()).await?;
//! ```

/// Package version from Cargo.toml
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git commit hash (8 chars) with optional "-dirty" suffix
pub const BUILD_VERSION: &str = env!("BUILD_VERSION");

/// Full version string: "0.1.0 (abc12345)" or "0.1.0 (abc12345-dirty)"
pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("BUILD_VERSION"), ")");

pub mod admin;
pub mod config;
pub mod graceful;
pub mod indexer;
pub mod logging;
pub mod observability;
pub mod queue;

// Re-exports for convenience
pub use config::Config;
pub use graceful::Manager;
pub use queue::{Queue, QueueConfig, QueueManager};
