//! # Relay Server - Pooled Upstream Relay
//!
//! Keeps a pool of pre-handshaked connections to upstream game servers and
//! hands one to each incoming client, so a client starts receiving game
//! frames without paying for discovery and the handshake itself.
//!
//! ## Architecture
//!
//! * [`ConnectionPool`] discovers targets, opens [`UpstreamConnection`]s,
//!   groups them by origin endpoint and replaces any that are lost
//! * [`ProxySession`] binds one client transport to one pooled connection
//!   and shuttles frames both ways
//! * [`RelayServer`] accepts WebSocket clients and runs a session for each
//! * Every decoded inbound frame is published on the pool's event bus, see
//!   [`ConnectionPool::subscribe`]
//!
//! Transports are abstract ([`Connector`], [`Transport`]) and discovery is a
//! trait ([`Discovery`]), so the pool and sessions can run entirely in
//! memory.

pub mod config;
pub mod discovery;
pub mod error;
pub mod pool;
pub mod server;
pub mod session;
pub mod transport;
pub mod upstream;

pub use config::{DiscoveryConfig, PoolConfig, RelayConfig, UpstreamConfig};
pub use discovery::{Discovery, HttpDiscovery, Target};
pub use error::RelayError;
pub use pool::{ConnectionPool, GroupStatus, GrowOutcome, PoolStatus};
pub use server::RelayServer;
pub use session::{ProxySession, SessionEnd};
pub use transport::{memory_pair, Connector, Transport, TransportError, WsConnector};
pub use upstream::{
    ConnectionId, Downstream, PoolNotice, SessionId, SessionLink, SocketState, UpstreamConnection, UpstreamEvent,
    DOWNSTREAM_QUEUE,
};
