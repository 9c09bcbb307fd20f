//! Observability: Prometheus metrics.
//!
//! Structured logging lives in [`crate::logging`].
//!
//! ```rust,ignore
//! use tokio_queue::observability::Metrics;
//!
//! let metrics = Metrics::new()?;
//! metrics.refresh(&queues.summaries());
//! println!("{}", metrics.export()?);
//! ```

pub mod metrics;

pub use metrics::Metrics;
