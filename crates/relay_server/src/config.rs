//! Relay configuration types and defaults.
//!
//! These are the runtime settings the library consumes. The launcher builds
//! them from its TOML file; tests build them directly.

use std::net::SocketAddr;
use std::time::Duration;

use agar_protocol::{HandshakeParams, ProtocolCodec, TagTable};

/// Top-level configuration for a [`RelayServer`](crate::RelayServer).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the client-facing WebSocket listener binds to
    pub bind_address: SocketAddr,

    /// Maximum number of concurrent client sessions
    pub max_sessions: usize,

    /// Pass client frames upstream. When false the client only observes.
    pub forward_client_input: bool,

    pub pool: PoolConfig,
    pub upstream: UpstreamConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_sessions: 64,
            forward_client_input: true,
            pool: PoolConfig::default(),
            upstream: UpstreamConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// Connection pool policy.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections that must share one origin endpoint before it is usable
    pub ready_threshold: usize,

    /// Hard cap on live plus in-flight upstream connections
    pub max_connections: usize,

    /// Constant delay before retrying a failed spawn
    pub retry_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            ready_threshold: 2,
            max_connections: 10,
            retry_delay: Duration::from_secs(7),
        }
    }
}

/// How upstream connections are opened and spoken to.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub handshake: HandshakeParams,
    pub tags: TagTable,

    /// Bound on transport open and on handshake completion
    pub handshake_timeout: Duration,

    /// `Origin` header sent with the upstream WebSocket request
    pub origin: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeParams::default(),
            tags: TagTable::default(),
            handshake_timeout: Duration::from_secs(10),
            origin: Some("http://agar.io".to_string()),
        }
    }
}

impl UpstreamConfig {
    pub fn codec(&self) -> ProtocolCodec {
        ProtocolCodec::new(self.tags, self.handshake)
    }
}

/// Where and how to ask for a new upstream target.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub url: String,
    /// Sent as the request body
    pub region: String,
    pub timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            url: "http://m.agar.io".to_string(),
            region: "EU-London".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}
