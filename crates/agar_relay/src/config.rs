//! Configuration management for the relay launcher.
//!
//! This module handles loading, validation, and conversion of the relay
//! configuration from TOML files.

use agar_protocol::{HandshakeParams, TagTable, DEFAULT_KEY, PROTOCOL_VERSION};
use relay_server::{DiscoveryConfig, PoolConfig, RelayConfig, UpstreamConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub protocol: ProtocolSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Client-facing listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Network address to bind the listener to (e.g., "127.0.0.1:8080")
    pub bind_address: String,
    /// Maximum number of concurrent client sessions
    pub max_sessions: usize,
    /// Pass client frames through to the upstream
    pub forward_client_input: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            max_sessions: 64,
            forward_client_input: true,
        }
    }
}

/// Upstream pool policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Open connections one endpoint needs before clients are served
    pub ready_threshold: usize,
    /// Hard cap on upstream connections
    pub max_connections: usize,
    /// Delay before retrying a failed spawn, in seconds
    pub retry_delay_secs: u64,
    /// Bound on connect and handshake, in seconds
    pub handshake_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            ready_threshold: 2,
            max_connections: 10,
            retry_delay_secs: 7,
            handshake_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub url: String,
    pub region: String,
    pub timeout_secs: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            url: "http://m.agar.io".to_string(),
            region: "EU-London".to_string(),
            timeout_secs: 10,
        }
    }
}

/// Wire protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    pub version: u32,
    /// Rotating handshake key
    pub key: u32,
    /// `Origin` header for upstream requests; empty disables it
    pub origin: String,
    pub tags: TagTable,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            key: DEFAULT_KEY,
            origin: "http://agar.io".to_string(),
            tags: TagTable::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
    /// Seconds between pool health lines; 0 disables them
    pub health_interval_secs: u64,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            health_interval_secs: 60,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration to `path`
    /// and returns it.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Translates the file settings into the relay's runtime configuration.
    pub fn to_relay_config(&self) -> anyhow::Result<RelayConfig> {
        let origin = match self.protocol.origin.trim() {
            "" => None,
            origin => Some(origin.to_string()),
        };

        Ok(RelayConfig {
            bind_address: self.server.bind_address.parse()?,
            max_sessions: self.server.max_sessions,
            forward_client_input: self.server.forward_client_input,
            pool: PoolConfig {
                ready_threshold: self.pool.ready_threshold,
                max_connections: self.pool.max_connections,
                retry_delay: Duration::from_secs(self.pool.retry_delay_secs),
            },
            upstream: UpstreamConfig {
                handshake: HandshakeParams {
                    protocol_version: self.protocol.version,
                    key: self.protocol.key,
                },
                tags: self.protocol.tags,
                handshake_timeout: Duration::from_secs(self.pool.handshake_timeout_secs),
                origin,
            },
            discovery: DiscoveryConfig {
                url: self.discovery.url.clone(),
                region: self.discovery.region.clone(),
                timeout: Duration::from_secs(self.discovery.timeout_secs),
            },
        })
    }

    /// Checks the configuration for consistency.
    ///
    /// Returns an error string describing the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("Invalid bind address: {}", &self.server.bind_address));
        }
        if self.server.max_sessions == 0 {
            return Err("max_sessions must be at least 1".to_string());
        }

        if self.pool.ready_threshold == 0 {
            return Err("ready_threshold must be at least 1".to_string());
        }
        if self.pool.max_connections < self.pool.ready_threshold {
            return Err(format!(
                "max_connections ({}) cannot be below ready_threshold ({})",
                self.pool.max_connections, self.pool.ready_threshold
            ));
        }
        if self.pool.retry_delay_secs == 0 {
            return Err("retry_delay_secs must be positive".to_string());
        }
        if self.pool.handshake_timeout_secs == 0 {
            return Err("handshake_timeout_secs must be positive".to_string());
        }

        if !self.discovery.url.starts_with("http://") && !self.discovery.url.starts_with("https://") {
            return Err(format!("Invalid discovery url: {}", &self.discovery.url));
        }
        if self.discovery.region.trim().is_empty() {
            return Err("Discovery region cannot be empty".to_string());
        }

        if !self.protocol.tags.is_unambiguous() {
            return Err(format!("Protocol tags must be distinct: {:?}", self.protocol.tags));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}
