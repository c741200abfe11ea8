//! Server configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! - `WATCHMAN_BIND_ADDR`: HTTP listen address. Default: `0.0.0.0:3000`
//! - `WATCHMAN_BASE_URL`: Public base URL, used to compose webhook URLs.
//!   Default: `http://localhost:3000`
//! - `WATCHMAN_GATEWAY_URL`: Messaging gateway WebSocket URL.
//!   Default: `ws://localhost:8765/gateway`
//! - `WATCHMAN_DB_PATH`: SQLite database file. In-memory when unset.
//! - `WATCHMAN_CREDENTIALS_DIR`: Directory for the session credential blob.
//!   Default: `./data/session`
//! - `WATCHMAN_API_TOKEN`: Bearer token protecting the management API.
//!   The management API is open when unset (development only).

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {name}: {detail}")]
    Invalid { name: &'static str, detail: String },
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub base_url: String,
    pub gateway_url: Url,
    pub db_path: Option<String>,
    pub credentials_dir: PathBuf,
    pub api_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            base_url: "http://localhost:3000".to_string(),
            gateway_url: Url::parse("ws://localhost:8765/gateway")
                .expect("default gateway url is valid"),
            db_path: None,
            credentials_dir: PathBuf::from("./data/session"),
            api_token: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bind_addr = match std::env::var("WATCHMAN_BIND_ADDR") {
            Ok(value) => value.parse().map_err(|e| ConfigError::Invalid {
                name: "WATCHMAN_BIND_ADDR",
                detail: format!("{e}"),
            })?,
            Err(_) => defaults.bind_addr,
        };

        let base_url = std::env::var("WATCHMAN_BASE_URL")
            .unwrap_or(defaults.base_url)
            .trim_end_matches('/')
            .to_string();

        let gateway_url = match std::env::var("WATCHMAN_GATEWAY_URL") {
            Ok(value) => Url::parse(&value).map_err(|e| ConfigError::Invalid {
                name: "WATCHMAN_GATEWAY_URL",
                detail: format!("{e}"),
            })?,
            Err(_) => defaults.gateway_url,
        };

        let db_path = std::env::var("WATCHMAN_DB_PATH").ok();
        let credentials_dir = std::env::var("WATCHMAN_CREDENTIALS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.credentials_dir);
        let api_token = std::env::var("WATCHMAN_API_TOKEN").ok();

        Ok(Self {
            bind_addr,
            base_url,
            gateway_url,
            db_path,
            credentials_dir,
            api_token,
        })
    }

    /// Compose the public webhook URL for a rule's token.
    pub fn webhook_url(&self, token: &str) -> String {
        format!("{}/webhook/v1/{token}", self.base_url)
    }

    /// Log the current server configuration.
    pub fn log_config(&self) {
        info!("Listen address: {}", self.bind_addr);
        info!("Base URL: {}", self.base_url);
        info!("Gateway URL: {}", self.gateway_url);
        match &self.db_path {
            Some(path) => info!("Database: {}", path),
            None => info!("Database: in-memory"),
        }
        info!("Credentials directory: {}", self.credentials_dir.display());
        if self.api_token.is_none() {
            warn!("WATCHMAN_API_TOKEN not set, management API is unauthenticated");
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            api_token: Some("test-operator-token".to_string()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.base_url, "http://localhost:3000");
        assert!(config.db_path.is_none());
        assert!(config.api_token.is_none());
    }

    #[test]
    fn test_webhook_url_composition() {
        let config = ServerConfig::test();
        assert_eq!(
            config.webhook_url("abc123"),
            "http://localhost:3000/webhook/v1/abc123"
        );
    }
}
