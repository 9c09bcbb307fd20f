//! Integration tests for tokio_queue
//!
//! Everything runs in-process against the library: queues and the registry,
//! the graceful manager, and the admin server over real sockets.
//! Run with: cargo test --test integration

mod helpers;

mod admin_server;
mod manager;
mod queues;
