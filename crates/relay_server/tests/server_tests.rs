//! Relay server lifecycle.

mod common;

use std::time::Duration;

use common::{pool_config, MemoryConnector, ScriptedDiscovery};
use relay_server::{RelayConfig, RelayError, RelayServer};
use tokio::net::TcpListener;

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_bind_stops_the_pool() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = RelayConfig {
        bind_address: taken.local_addr().unwrap(),
        pool: pool_config(Duration::from_millis(50)),
        ..RelayConfig::default()
    };
    let discovery = ScriptedDiscovery::always_failing();
    let (connector, _remotes) = MemoryConnector::new();
    let server = RelayServer::with_parts(config, discovery.clone(), connector);

    assert!(matches!(server.start().await, Err(RelayError::Network(_))));

    // A running pool would retry discovery every 50ms.
    let calls = discovery.calls();
    assert!(calls <= 1);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(discovery.calls(), calls);
    assert!(server.pool().connections_snapshot().is_empty());
}
