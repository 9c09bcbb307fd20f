//! Queue defaults and per-queue overrides.
//!
//! `QUEUE_<KEY>` sets a default for every queue; `QUEUE_<NAME>_<KEY>`
//! overrides it for the queue called `name` (upper-cased, with anything
//! other than ASCII letters and digits replaced by `_`).

use std::path::PathBuf;
use std::time::Duration;

use super::parse::{parse_duration, parse_value};
use super::ConfigError;
use crate::queue::{QueueConfig, QueueType};

/// Defaults applied to every queue created from configuration.
#[derive(Clone, Debug)]
pub struct QueueSettings {
    pub defaults: QueueConfig,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            defaults: QueueConfig::new(""),
        }
    }
}

impl QueueSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut defaults = QueueConfig::new("");
        apply("QUEUE_", &lookup, &mut defaults)?;
        Ok(Self { defaults })
    }

    /// Configuration for the queue `name` from the process environment.
    pub fn queue(&self, name: &str) -> Result<QueueConfig, ConfigError> {
        self.queue_with(name, |key| std::env::var(key).ok())
    }

    /// Configuration for the queue `name`, overrides read through `lookup`.
    pub fn queue_with<F>(&self, name: &str, lookup: F) -> Result<QueueConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = self.defaults.clone();
        config.name = name.to_string();
        apply(&format!("QUEUE_{}_", env_name(name)), &lookup, &mut config)?;
        Ok(config)
    }
}

fn env_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn apply<F>(prefix: &str, lookup: &F, config: &mut QueueConfig) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| {
        let key = format!("{}{}", prefix, key);
        lookup(&key).filter(|v| !v.trim().is_empty()).map(|v| (key, v))
    };

    if let Some((key, v)) = get("TYPE") {
        config.queue_type = v.parse::<QueueType>().map_err(|e| ConfigError::Invalid {
            key,
            message: e.to_string(),
        })?;
    }
    if let Some((key, v)) = get("LENGTH") {
        config.queue_length = parse_value(&key, &v)?;
    }
    if let Some((key, v)) = get("BATCH_LENGTH") {
        config.batch_length = parse_value(&key, &v)?;
    }
    if let Some((key, v)) = get("WORKERS") {
        config.workers = parse_value(&key, &v)?;
    }
    if let Some((key, v)) = get("MAX_WORKERS") {
        let v = v.trim();
        config.max_workers = if v == "-1" || v.eq_ignore_ascii_case("unlimited") {
            None
        } else {
            Some(parse_value(&key, v)?)
        };
    }
    if let Some((key, v)) = get("BOOST_WORKERS") {
        config.boost_workers = parse_value(&key, &v)?;
    }
    if let Some((key, v)) = get("BLOCK_TIMEOUT") {
        config.block_timeout = duration(&key, &v)?;
    }
    if let Some((key, v)) = get("BOOST_TIMEOUT") {
        config.boost_timeout = duration(&key, &v)?;
    }
    if let Some((_, v)) = get("DATA_DIR") {
        config.data_dir = Some(PathBuf::from(v));
    }
    Ok(())
}

/// "off" and "0" disable the timeout.
fn duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value)
        .map(Option::unwrap_or_default)
        .map_err(|error| ConfigError::Parse {
            key: key.into(),
            value: value.into(),
            error,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = QueueSettings::from_lookup(lookup(&[])).unwrap();
        let config = settings.queue_with("issue_indexer", lookup(&[])).unwrap();
        assert_eq!(config.name, "issue_indexer");
        assert_eq!(config.queue_type, QueueType::PersistableChannel);
        assert_eq!(config.queue_length, 20);
        assert_eq!(config.batch_length, 20);
        assert_eq!(config.workers, 1);
        assert_eq!(config.boost_workers, 1);
        assert_eq!(config.block_timeout, Duration::from_secs(1));
        assert_eq!(config.boost_timeout, Duration::from_secs(300));
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_global_and_per_queue_overrides() {
        let env = [
            ("QUEUE_TYPE", "channel"),
            ("QUEUE_WORKERS", "4"),
            ("QUEUE_MAX_WORKERS", "unlimited"),
            ("QUEUE_ISSUE_INDEXER_TYPE", "unique-channel"),
            ("QUEUE_ISSUE_INDEXER_BATCH_LENGTH", "5"),
            ("QUEUE_ISSUE_INDEXER_BLOCK_TIMEOUT", "off"),
            ("QUEUE_ISSUE_INDEXER_DATA_DIR", "/var/lib/queues"),
        ];
        let settings = QueueSettings::from_lookup(lookup(&env)).unwrap();

        let other = settings.queue_with("mail", lookup(&env)).unwrap();
        assert_eq!(other.queue_type, QueueType::Channel);
        assert_eq!(other.workers, 4);
        assert!(other.max_workers.is_none());
        assert_eq!(other.batch_length, 20);

        let indexer = settings.queue_with("issue-indexer", lookup(&env)).unwrap();
        assert_eq!(indexer.queue_type, QueueType::UniqueChannel);
        assert_eq!(indexer.workers, 4);
        assert_eq!(indexer.batch_length, 5);
        assert!(indexer.block_timeout.is_zero());
        assert_eq!(indexer.data_dir, Some(PathBuf::from("/var/lib/queues")));
    }

    #[test]
    fn test_invalid_values() {
        let err = QueueSettings::from_lookup(lookup(&[("QUEUE_TYPE", "level")])).unwrap_err();
        assert_eq!(err.key(), "QUEUE_TYPE");

        let err = QueueSettings::from_lookup(lookup(&[("QUEUE_WORKERS", "many")])).unwrap_err();
        assert_eq!(err.key(), "QUEUE_WORKERS");
    }
}
