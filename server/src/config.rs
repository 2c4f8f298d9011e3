//! Relay configuration loaded from the environment.

use std::env;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind
    pub host: String,
    /// Port to bind
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
        }
    }
}

impl Config {
    /// Load configuration from `HOST` and `PORT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let host = env::var("HOST").unwrap_or(defaults.host);
        let port = match env::var("PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidPort(raw))?,
            Err(_) => defaults.port,
        };
        Ok(Self { host, port })
    }

    /// `host:port` for binding.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value: {0}")]
    InvalidPort(String),
}
