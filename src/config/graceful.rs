//! Graceful manager configuration.

use std::time::Duration;

use super::parse::parse_duration;
use super::ConfigError;

/// Lifecycle timings and restart behaviour of the graceful manager.
#[derive(Clone, Debug)]
pub struct GracefulConfig {
    /// SIGHUP forks a child that inherits the listeners (GRACEFUL_RESTARTABLE).
    pub restartable: bool,
    /// Grace period between shutdown and hammer (GRACEFUL_HAMMER_TIME).
    /// `None` never hammers on its own.
    pub hammer_time: Option<Duration>,
    /// Abort start-up if the expected listeners are not created in time (STARTUP_TIMEOUT).
    pub startup_timeout: Option<Duration>,
    /// Number of listener-taking servers expected to report through
    /// `get_listener`/`inform_cleanup` before inherited sockets are released.
    pub servers_to_create: usize,
    /// Pause between the final hammer and terminate.
    pub terminate_delay: Duration,
}

impl Default for GracefulConfig {
    fn default() -> Self {
        Self {
            restartable: true,
            hammer_time: Some(Duration::from_secs(60)),
            startup_timeout: None,
            servers_to_create: 1,
            terminate_delay: Duration::from_secs(1),
        }
    }
}

impl GracefulConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("GRACEFUL_RESTARTABLE") {
            config.restartable = v == "1" || v.eq_ignore_ascii_case("true");
        }

        if let Some(v) = lookup("GRACEFUL_HAMMER_TIME") {
            let v = v.trim();
            if v == "-1" || v.eq_ignore_ascii_case("off") {
                config.hammer_time = None;
            } else if !v.is_empty() {
                // 0 hammers as soon as shutdown starts
                config.hammer_time =
                    Some(duration("GRACEFUL_HAMMER_TIME", v)?.unwrap_or(Duration::ZERO));
            }
        }

        if let Some(v) = lookup("STARTUP_TIMEOUT") {
            config.startup_timeout = duration("STARTUP_TIMEOUT", &v)?;
        }

        Ok(config)
    }

    /// Builder: set the hammer time.
    pub fn with_hammer_time(mut self, hammer_time: Option<Duration>) -> Self {
        self.hammer_time = hammer_time;
        self
    }

    /// Builder: set the number of listener-taking servers.
    pub fn with_servers_to_create(mut self, servers: usize) -> Self {
        self.servers_to_create = servers;
        self
    }

    /// Builder: set the delay between hammer and terminate.
    pub fn with_terminate_delay(mut self, delay: Duration) -> Self {
        self.terminate_delay = delay;
        self
    }

    /// Builder: enable or disable forking restarts.
    pub fn with_restartable(mut self, restartable: bool) -> Self {
        self.restartable = restartable;
        self
    }
}

fn duration(key: &str, value: &str) -> Result<Option<Duration>, ConfigError> {
    parse_duration(value).map_err(|error| ConfigError::Parse {
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
        let config = GracefulConfig::from_lookup(lookup(&[])).unwrap();
        assert!(config.restartable);
        assert_eq!(config.hammer_time, Some(Duration::from_secs(60)));
        assert!(config.startup_timeout.is_none());
        assert_eq!(config.terminate_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_overrides() {
        let config = GracefulConfig::from_lookup(lookup(&[
            ("GRACEFUL_RESTARTABLE", "false"),
            ("GRACEFUL_HAMMER_TIME", "-1"),
            ("STARTUP_TIMEOUT", "30s"),
        ]))
        .unwrap();
        assert!(!config.restartable);
        assert!(config.hammer_time.is_none());
        assert_eq!(config.startup_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_hammer_time_hammers_immediately() {
        let config = GracefulConfig::from_lookup(lookup(&[("GRACEFUL_HAMMER_TIME", "0")])).unwrap();
        assert_eq!(config.hammer_time, Some(Duration::ZERO));

        let config = GracefulConfig::from_lookup(lookup(&[("GRACEFUL_HAMMER_TIME", "off")])).unwrap();
        assert!(config.hammer_time.is_none());

        let config = GracefulConfig::from_lookup(lookup(&[("GRACEFUL_HAMMER_TIME", "90s")])).unwrap();
        assert_eq!(config.hammer_time, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_invalid_hammer_time() {
        let err = GracefulConfig::from_lookup(lookup(&[("GRACEFUL_HAMMER_TIME", "soon")]))
            .unwrap_err();
        assert_eq!(err.key(), "GRACEFUL_HAMMER_TIME");
    }
}
