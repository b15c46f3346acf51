//! Connection pool behaviour: warming, allocation, retries and replacement.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use agar_protocol::{encode_updates, DecodedMessage, Entity, HandshakeParams, TagTable};
use common::{pool_config, read_handshake, wait_until, MemoryConnector, ScriptedDiscovery};
use futures::SinkExt;
use relay_server::{
    ConnectionPool, GrowOutcome, PoolConfig, RelayError, SessionLink, SocketState, UpstreamConfig, DOWNSTREAM_QUEUE,
};
use tokio::sync::{mpsc, Barrier};
use uuid::Uuid;

fn link() -> (SessionLink, mpsc::Receiver<relay_server::Downstream>) {
    let (tx, rx) = mpsc::channel(DOWNSTREAM_QUEUE);
    (SessionLink::new(Uuid::new_v4(), tx), rx)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_connections_make_the_pool_warm() {
    let discovery = ScriptedDiscovery::new("10.0.0.5:443\nABCDEF");
    let (connector, _remotes) = MemoryConnector::new();
    let pool = ConnectionPool::new(
        pool_config(Duration::from_secs(7)),
        UpstreamConfig::default(),
        discovery.clone(),
        connector,
    );

    assert!(!pool.is_warm());
    assert!(matches!(
        pool.grow_toward_ready().await.unwrap(),
        GrowOutcome::Spawned { id: 1, warm: false, .. }
    ));
    assert!(matches!(
        pool.grow_toward_ready().await.unwrap(),
        GrowOutcome::Spawned { id: 2, warm: true, .. }
    ));
    assert!(pool.is_warm());

    // A warm pool does not grow further and does not ask discovery.
    assert_eq!(pool.grow_toward_ready().await.unwrap(), GrowOutcome::Warm);
    assert_eq!(discovery.calls(), 2);
    assert_eq!(pool.connections_snapshot().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handshake_bytes_on_the_wire() {
    let discovery = ScriptedDiscovery::new("10.0.0.5:443\nABCDEF");
    let (connector, mut remotes) = MemoryConnector::new();
    let upstream = UpstreamConfig {
        handshake: HandshakeParams::with_key(0x0102_0304),
        ..UpstreamConfig::default()
    };
    let pool = ConnectionPool::new(pool_config(Duration::from_secs(7)), upstream, discovery, connector.clone());

    assert!(pool.warm_up().await.unwrap());

    for _ in 0..2 {
        let mut remote = remotes.recv().await.unwrap();
        let frames = read_handshake(&mut remote).await;
        assert_eq!(&frames[0][..], &[254, 4, 0, 0, 0]);
        assert_eq!(&frames[1][..], &[255, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&frames[2][..], &[80, b'A', b'B', b'C', b'D', b'E', b'F']);
    }
    assert_eq!(connector.endpoints(), vec!["10.0.0.5:443", "10.0.0.5:443"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cold_pool_allocates_nothing() {
    let discovery = ScriptedDiscovery::new("10.0.0.5:443\nABCDEF");
    let (connector, _remotes) = MemoryConnector::new();
    let pool = ConnectionPool::new(pool_config(Duration::from_secs(7)), UpstreamConfig::default(), discovery, connector);

    let (session, _rx) = link();
    assert!(pool.allocate(session.clone()).is_none());

    pool.grow_toward_ready().await.unwrap();
    assert!(pool.allocate(session).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_allocation_is_exclusive() {
    let discovery = ScriptedDiscovery::new("10.0.0.5:443\nABCDEF");
    let (connector, _remotes) = MemoryConnector::new();
    let pool = ConnectionPool::new(pool_config(Duration::from_secs(7)), UpstreamConfig::default(), discovery, connector);
    pool.warm_up().await.unwrap();

    let (first, _first_rx) = link();
    let (second, _second_rx) = link();
    let (third, _third_rx) = link();

    let a = pool.allocate(first.clone()).unwrap();
    let b = pool.allocate(second.clone()).unwrap();
    assert_eq!(a.id(), 1);
    assert_eq!(b.id(), 2);
    assert_eq!(a.bound_session(), Some(first.session_id));
    assert_eq!(b.bound_session(), Some(second.session_id));

    // Both connections are busy.
    assert!(pool.allocate(third.clone()).is_none());

    pool.release(&a);
    pool.release(&a);
    assert!(!a.in_use());
    assert_eq!(a.state(), SocketState::Open);
    assert!(b.in_use());

    let c = pool.allocate(third.clone()).unwrap();
    assert_eq!(c.id(), 1);
    assert_eq!(c.bound_session(), Some(third.session_id));

    let status = pool.status();
    assert_eq!(status.total, 2);
    assert_eq!(status.busy, 2);
    assert_eq!(status.free, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_session_frees_its_connection() {
    let discovery = ScriptedDiscovery::new("10.0.0.5:443\nABCDEF");
    let (connector, _remotes) = MemoryConnector::new();
    let pool = ConnectionPool::new(pool_config(Duration::from_secs(7)), UpstreamConfig::default(), discovery, connector);
    pool.warm_up().await.unwrap();

    let (first, first_rx) = link();
    let a = pool.allocate(first).unwrap();
    drop(first_rx);
    assert!(!a.in_use());

    let (second, _second_rx) = link();
    assert_eq!(pool.allocate(second).unwrap().id(), a.id());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_largest_group_wins_and_ties_go_to_the_first() {
    let discovery = ScriptedDiscovery::sequence(&["a.example:1\nA", "b.example:1\nB", "b.example:1\nB"]);
    let (connector, _remotes) = MemoryConnector::new();
    let pool = ConnectionPool::new(pool_config(Duration::from_secs(7)), UpstreamConfig::default(), discovery, connector);

    pool.grow_toward_ready().await.unwrap();
    pool.grow_toward_ready().await.unwrap();
    assert!(!pool.is_warm());
    let groups = pool.status().groups;
    assert_eq!(groups[0].origin_endpoint, "a.example:1");
    assert_eq!(groups[1].origin_endpoint, "b.example:1");

    // The third spawn lands on b, which becomes the serving group.
    assert!(matches!(
        pool.grow_toward_ready().await.unwrap(),
        GrowOutcome::Spawned { warm: true, .. }
    ));
    let (session, _rx) = link();
    let allocated = pool.allocate(session).unwrap();
    assert_eq!(allocated.origin_endpoint(), "b.example:1");
    assert_eq!(allocated.id(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_capacity_stops_growth() {
    let discovery = ScriptedDiscovery::new("10.0.0.5:443\nABCDEF");
    let (connector, _remotes) = MemoryConnector::new();
    let config = PoolConfig {
        ready_threshold: 3,
        max_connections: 2,
        retry_delay: Duration::from_secs(7),
    };
    let pool = ConnectionPool::new(config, UpstreamConfig::default(), discovery.clone(), connector);

    assert!(!pool.warm_up().await.unwrap());
    assert_eq!(pool.grow_toward_ready().await.unwrap(), GrowOutcome::AtCapacity);
    assert_eq!(discovery.calls(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_open_schedules_one_retry() {
    let discovery = ScriptedDiscovery::new("10.0.0.5:443\nABCDEF");
    let (connector, _remotes) = MemoryConnector::failing_first(2);
    let pool = ConnectionPool::new(
        pool_config(Duration::from_millis(300)),
        UpstreamConfig::default(),
        discovery,
        connector,
    );

    let err = pool.grow_toward_ready().await.unwrap_err();
    assert!(matches!(err, RelayError::HandshakeFailure(_)));
    assert!(pool.retry_pending());

    // A second failure while the retry is pending does not add another.
    assert!(pool.grow_toward_ready().await.is_err());
    assert!(pool.retry_pending());

    // The retry runs without a maintenance task and warms the pool.
    assert!(wait_until(Duration::from_secs(2), || pool.is_warm()).await);
    assert_eq!(pool.connections_snapshot().len(), 2);
    assert!(!pool.retry_pending());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retry_runs_without_maintenance_task() {
    let discovery = ScriptedDiscovery::failing_first(1, "10.0.0.5:443\nABCDEF");
    let (connector, _remotes) = MemoryConnector::new();
    let pool = ConnectionPool::new(
        pool_config(Duration::from_millis(100)),
        UpstreamConfig::default(),
        discovery.clone(),
        connector,
    );

    assert!(matches!(pool.grow_toward_ready().await, Err(RelayError::Discovery(_))));
    assert!(pool.connections_snapshot().is_empty());

    assert!(wait_until(Duration::from_secs(2), || pool.is_warm()).await);
    assert_eq!(discovery.calls(), 3);
    assert_eq!(pool.connections_snapshot().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cold_pool_at_capacity_makes_room() {
    let discovery = ScriptedDiscovery::sequence(&["a.example:1\nA", "b.example:1\nB", "b.example:1\nB"]);
    let (connector, _remotes) = MemoryConnector::new();
    let config = PoolConfig {
        ready_threshold: 2,
        max_connections: 2,
        retry_delay: Duration::from_secs(7),
    };
    let pool = ConnectionPool::new(config, UpstreamConfig::default(), discovery.clone(), connector);

    pool.grow_toward_ready().await.unwrap();
    pool.grow_toward_ready().await.unwrap();
    let first = pool.connections_snapshot()[0].clone();
    assert_eq!(first.origin_endpoint(), "a.example:1");
    assert!(!pool.is_warm());

    // Discovery points at b again; the idle connection on a gives way.
    assert_eq!(
        pool.grow_toward_ready().await.unwrap(),
        GrowOutcome::Spawned {
            id: 3,
            origin_endpoint: "b.example:1".to_string(),
            evicted: Some(1),
            warm: true,
        }
    );
    assert_eq!(first.state(), SocketState::Closed);

    let ids: Vec<_> = pool.connections_snapshot().iter().map(|c| c.id()).collect();
    assert_eq!(ids, vec![2, 3]);
    assert_eq!(pool.group_sizes().get("b.example:1"), Some(&2));
    assert_eq!(discovery.calls(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_started_pool_warms_across_endpoints_at_capacity() {
    let discovery = ScriptedDiscovery::sequence(&["a.example:1\nA", "b.example:1\nB", "b.example:1\nB"]);
    let (connector, _remotes) = MemoryConnector::new();
    let config = PoolConfig {
        ready_threshold: 2,
        max_connections: 2,
        retry_delay: Duration::from_millis(100),
    };
    let pool = ConnectionPool::new(config, UpstreamConfig::default(), discovery, connector);

    pool.start();
    assert!(wait_until(Duration::from_secs(2), || pool.is_warm()).await);

    let (session, _rx) = link();
    assert_eq!(pool.allocate(session).unwrap().origin_endpoint(), "b.example:1");
    pool.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_growth_does_not_overshoot() {
    let discovery = ScriptedDiscovery::new("10.0.0.5:443\nABCDEF");
    let (connector, _remotes) = MemoryConnector::new();
    let pool = ConnectionPool::new(
        pool_config(Duration::from_secs(7)),
        UpstreamConfig::default(),
        discovery.clone(),
        connector,
    );

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.warm_up().await })
        })
        .collect();
    for caller in callers {
        caller.await.unwrap().unwrap();
    }

    // Callers that found growth in progress may return before the pool is warm.
    assert!(pool.warm_up().await.unwrap());
    assert_eq!(pool.connections_snapshot().len(), 2);
    assert_eq!(discovery.calls(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_allocations_never_share_a_connection() {
    let discovery = ScriptedDiscovery::new("10.0.0.5:443\nABCDEF");
    let (connector, _remotes) = MemoryConnector::new();
    let pool = ConnectionPool::new(pool_config(Duration::from_secs(7)), UpstreamConfig::default(), discovery, connector);
    assert!(pool.warm_up().await.unwrap());

    let barrier = Arc::new(Barrier::new(16));
    let sessions: Vec<_> = (0..16)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                let (session, rx) = link();
                barrier.wait().await;
                // The receiver is returned so the binding stays live.
                (pool.allocate(session).map(|connection| connection.id()), rx)
            })
        })
        .collect();

    let mut allocated = Vec::new();
    let mut receivers = Vec::new();
    for session in sessions {
        let (id, rx) = session.await.unwrap();
        allocated.extend(id);
        receivers.push(rx);
    }

    assert_eq!(allocated.len(), 2);
    let distinct: HashSet<_> = allocated.iter().copied().collect();
    assert_eq!(distinct, HashSet::from([1, 2]));
    assert_eq!(pool.status().busy, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retry_fires_once_per_delay() {
    let retry_delay = Duration::from_millis(400);
    let discovery = ScriptedDiscovery::always_failing();
    let (connector, _remotes) = MemoryConnector::new();
    let pool = ConnectionPool::new(pool_config(retry_delay), UpstreamConfig::default(), discovery.clone(), connector);

    pool.start();
    assert!(wait_until(Duration::from_secs(1), || discovery.calls() == 1).await);

    // Fails again while the first retry is pending.
    assert!(matches!(pool.warm_up().await, Err(RelayError::Discovery(_))));
    assert_eq!(discovery.calls(), 2);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(discovery.calls(), 3);

    let times = discovery.call_times();
    assert!(times[2].duration_since(times[0]) >= retry_delay);

    pool.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retry_recovers_from_discovery_outage() {
    let discovery = ScriptedDiscovery::failing_first(1, "10.0.0.5:443\nABCDEF");
    let (connector, _remotes) = MemoryConnector::new();
    let pool = ConnectionPool::new(
        pool_config(Duration::from_millis(100)),
        UpstreamConfig::default(),
        discovery.clone(),
        connector,
    );

    pool.start();
    assert!(wait_until(Duration::from_secs(3), || pool.is_warm()).await);
    assert_eq!(discovery.calls(), 3);

    pool.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lost_connection_is_replaced() {
    let discovery = ScriptedDiscovery::new("10.0.0.5:443\nABCDEF");
    let (connector, mut remotes) = MemoryConnector::new();
    let pool = ConnectionPool::new(pool_config(Duration::from_secs(7)), UpstreamConfig::default(), discovery.clone(), connector);

    pool.start();
    assert!(wait_until(Duration::from_secs(2), || pool.is_warm()).await);

    let first = remotes.recv().await.unwrap();
    let _second = remotes.recv().await.unwrap();

    let (session, mut session_rx) = link();
    let bound = pool.allocate(session).unwrap();
    assert_eq!(bound.id(), 1);

    // The upstream server hangs up on connection 1.
    drop(first);

    assert!(matches!(
        session_rx.recv().await.unwrap(),
        relay_server::Downstream::UpstreamLost {
            state: SocketState::Closed
        }
    ));
    assert!(
        wait_until(Duration::from_secs(2), || {
            let ids: Vec<_> = pool.connections_snapshot().iter().map(|c| c.id()).collect();
            ids == vec![2, 3]
        })
        .await
    );
    assert!(pool.is_warm());
    assert_eq!(discovery.calls(), 3);

    pool.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_end_to_end_scenario() {
    let discovery = ScriptedDiscovery::new("10.0.0.5:443\nABCDEF");
    let (connector, mut remotes) = MemoryConnector::new();
    let pool = ConnectionPool::new(
        pool_config(Duration::from_secs(7)),
        UpstreamConfig::default(),
        discovery.clone(),
        connector.clone(),
    );
    let mut events = pool.subscribe();

    pool.start();
    assert!(wait_until(Duration::from_secs(2), || pool.is_warm()).await);

    let status = pool.status();
    assert!(status.warm);
    assert_eq!(status.groups.len(), 1);
    assert_eq!(status.groups[0].origin_endpoint, "10.0.0.5:443");
    assert_eq!(status.groups[0].open, 2);
    assert_eq!(connector.endpoints(), vec!["10.0.0.5:443", "10.0.0.5:443"]);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["groups"][0]["open"], 2);
    assert_eq!(json["free"], 2);

    let mut remote = remotes.recv().await.unwrap();
    let handshake = read_handshake(&mut remote).await;
    assert_eq!(&handshake[2][..], b"PABCDEF");

    let blob = Entity {
        id: 9,
        x: 100,
        y: -50,
        size: 40,
        color: "#33cc33".to_string(),
        name: "cell".to_string(),
        flags: 0,
    };
    let frame = encode_updates(&TagTable::default(), &[], &[blob.clone()], &[4]).unwrap();
    remote.sink.send(frame).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.connection_id, 1);
    assert_eq!(
        event.message,
        DecodedMessage::Updates {
            consumptions: vec![],
            entities: vec![blob],
            destructions: vec![4],
        }
    );

    pool.shutdown();
    assert!(pool.connections_snapshot().is_empty());
}
