//! Configuration error types.

use std::fmt;

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to parse environment variable.
    Parse {
        key: String,
        value: String,
        error: String,
    },
    /// Invalid value for environment variable.
    Invalid { key: String, message: String },
}

impl ConfigError {
    /// Name of the offending variable.
    pub fn key(&self) -> &str {
        match self {
            ConfigError::Parse { key, .. } | ConfigError::Invalid { key, .. } => key,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse { key, value, error } => {
                write!(f, "failed to parse {}='{}': {}", key, value, error)
            }
            ConfigError::Invalid { key, message } => {
                write!(f, "invalid value for {}: {}", key, message)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_key() {
        let err = ConfigError::Parse {
            key: "QUEUE_LENGTH".into(),
            value: "abc".into(),
            error: "invalid digit found in string".into(),
        };
        assert_eq!(err.key(), "QUEUE_LENGTH");
        assert!(err.to_string().contains("QUEUE_LENGTH='abc'"));
    }

    #[test]
    fn test_invalid_display() {
        let err = ConfigError::Invalid {
            key: "LOG_FORMAT".into(),
            message: "expected json or text".into(),
        };
        assert_eq!(err.key(), "LOG_FORMAT");
        assert_eq!(err.to_string(), "invalid value for LOG_FORMAT: expected json or text");
    }
}
