//! Admin server configuration.

use std::net::SocketAddr;

use super::parse::env_opt;
use super::ConfigError;

#[derive(Clone, Debug, Default)]
pub struct AdminConfig {
    /// Address of the admin HTTP server (INTERNAL_ADDR). Disabled when unset.
    pub internal_addr: Option<SocketAddr>,
}

impl AdminConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let internal_addr = env_opt("INTERNAL_ADDR")
            .map(|s| {
                s.parse::<SocketAddr>().map_err(|e| ConfigError::Parse {
                    key: "INTERNAL_ADDR".into(),
                    value: s,
                    error: e.to_string(),
                })
            })
            .transpose()?;

        Ok(Self { internal_addr })
    }

    pub fn is_enabled(&self) -> bool {
        self.internal_addr.is_some()
    }
}
