//! Configuration loaded from environment variables.
//!
//! # Example
//!
//! ```rust,ignore
//! use tokio_queue::config::Config;
//!
//! let config = Config::from_env()?;
//! let indexer = config.queue.queue("issue_indexer")?;
//! println!("Hammer time: {:?}", config.graceful.hammer_time);
//! ```

mod admin;
mod error;
mod graceful;
mod logging;
mod parse;
mod queue;

pub use admin::AdminConfig;
pub use error::ConfigError;
pub use graceful::GracefulConfig;
pub use logging::{LogFormat, LoggingConfig};
pub use parse::parse_duration;
pub use queue::QueueSettings;

/// Complete application configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub graceful: GracefulConfig,
    /// Defaults and per-queue overrides.
    pub queue: QueueSettings,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            graceful: GracefulConfig::from_env()?,
            queue: QueueSettings::from_env()?,
            admin: AdminConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
        })
    }

    /// Print configuration summary to log.
    pub fn log_summary(&self) {
        use tracing::info;

        let defaults = &self.queue.defaults;
        info!("Configuration loaded:");
        info!("  Restartable: {}", self.graceful.restartable);
        match self.graceful.hammer_time {
            Some(hammer) => info!("  Hammer time: {}s", hammer.as_secs()),
            None => info!("  Hammer time: disabled"),
        }
        if let Some(timeout) = self.graceful.startup_timeout {
            info!("  Startup timeout: {}s", timeout.as_secs());
        }
        info!("  Queue type: {}", defaults.queue_type);
        info!(
            "  Queue workers: {} (max {})",
            defaults.workers,
            defaults
                .max_workers
                .map(|m| m.to_string())
                .unwrap_or_else(|| "unlimited".into())
        );
        info!(
            "  Queue length: {}, batch: {}",
            defaults.queue_length, defaults.batch_length
        );
        if let Some(ref dir) = defaults.data_dir {
            info!("  Queue data dir: {}", dir.display());
        }
        match self.admin.internal_addr {
            Some(addr) => info!("  Internal server: {}", addr),
            None => info!("  Internal server: disabled"),
        }
    }
}
