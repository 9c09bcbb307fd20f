//! Queue types and per-queue configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Serialize, Serializer};

use super::error::QueueError;

/// The queue implementations a [`QueueConfig`] can select.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueType {
    /// Worker pool over an in-memory backlog.
    Channel,
    /// Channel queue that rejects items already waiting.
    UniqueChannel,
    /// Channel queue that spills to a durable fifo at shutdown.
    PersistableChannel,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Channel => "channel",
            QueueType::UniqueChannel => "unique-channel",
            QueueType::PersistableChannel => "persistable-channel",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueType {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "channel" => Ok(QueueType::Channel),
            "unique-channel" => Ok(QueueType::UniqueChannel),
            "persistable-channel" => Ok(QueueType::PersistableChannel),
            other => Err(QueueError::UnsupportedType(other.to_string())),
        }
    }
}

/// Configuration of one queue and its worker pool.
#[derive(Clone, Debug, Serialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub queue_type: QueueType,
    /// Workers started by `run`.
    pub workers: usize,
    /// Upper bound on workers including boosts. `None` is unlimited.
    pub max_workers: Option<usize>,
    /// Workers added per boost.
    pub boost_workers: usize,
    /// Items handed to the handler per call (at least 1).
    pub batch_length: usize,
    /// Backlog capacity (at least 1).
    pub queue_length: usize,
    /// How long a push may block before boosting. Zero disables boosting.
    #[serde(serialize_with = "as_millis")]
    pub block_timeout: Duration,
    /// Lifetime of boost workers. Zero disables boosting.
    #[serde(serialize_with = "as_millis")]
    pub boost_timeout: Duration,
    /// Directory for the durable fifo of persistable queues; in-memory when unset.
    pub data_dir: Option<PathBuf>,
}

impl QueueConfig {
    /// Defaults for a queue called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue_type: QueueType::PersistableChannel,
            workers: 1,
            max_workers: Some(num_cpus::get()),
            boost_workers: 1,
            batch_length: 20,
            queue_length: 20,
            block_timeout: Duration::from_secs(1),
            boost_timeout: Duration::from_secs(5 * 60),
            data_dir: None,
        }
    }

    pub fn with_type(mut self, queue_type: QueueType) -> Self {
        self.queue_type = queue_type;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_workers(mut self, max_workers: Option<usize>) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_boost(mut self, boost_workers: usize, block_timeout: Duration, boost_timeout: Duration) -> Self {
        self.boost_workers = boost_workers;
        self.block_timeout = block_timeout;
        self.boost_timeout = boost_timeout;
        self
    }

    /// Disable boosting entirely.
    pub fn without_boost(self) -> Self {
        self.with_boost(0, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_batch_length(mut self, batch_length: usize) -> Self {
        self.batch_length = batch_length;
        self
    }

    pub fn with_queue_length(mut self, queue_length: usize) -> Self {
        self.queue_length = queue_length;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Clamp values that would leave the pool unable to make progress.
    pub(crate) fn normalized(mut self) -> Self {
        self.batch_length = self.batch_length.max(1);
        self.queue_length = self.queue_length.max(1);
        self
    }
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}
