//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use relay_server::{
    memory_pair, Connector, Discovery, PoolConfig, RelayError, Target, Transport, TransportError,
};
use tokio::sync::mpsc;

/// Discovery that replays scripted response bodies.
///
/// Bodies are handed out in order; the last one repeats. The first
/// `failures` calls fail instead.
pub struct ScriptedDiscovery {
    bodies: Vec<String>,
    failures: usize,
    calls: Mutex<Vec<Instant>>,
}

impl ScriptedDiscovery {
    pub fn new(body: &str) -> Arc<Self> {
        Self::sequence(&[body])
    }

    pub fn sequence(bodies: &[&str]) -> Arc<Self> {
        Self::build(bodies, 0)
    }

    pub fn failing_first(failures: usize, body: &str) -> Arc<Self> {
        Self::build(&[body], failures)
    }

    pub fn always_failing() -> Arc<Self> {
        Self::build(&["unused\nunused"], usize::MAX)
    }

    fn build(bodies: &[&str], failures: usize) -> Arc<Self> {
        Arc::new(Self {
            bodies: bodies.iter().map(|body| body.to_string()).collect(),
            failures,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Discovery for ScriptedDiscovery {
    async fn discover(&self) -> Result<Target, RelayError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Instant::now());
            calls.len() - 1
        };

        if index < self.failures {
            return Err(RelayError::Discovery("scripted failure".to_string()));
        }

        let body_index = (index - self.failures.min(index)).min(self.bodies.len() - 1);
        Target::parse(&self.bodies[body_index])
    }
}

/// Connector that hands the remote end of every connection to the test.
pub struct MemoryConnector {
    remotes: mpsc::UnboundedSender<Transport>,
    failures_left: AtomicUsize,
    endpoints: Mutex<Vec<String>>,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Transport>) {
        Self::failing_first(0)
    }

    pub fn failing_first(failures: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Transport>) {
        let (remotes, remotes_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                remotes,
                failures_left: AtomicUsize::new(failures),
                endpoints: Mutex::new(Vec::new()),
            }),
            remotes_rx,
        )
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &str) -> Result<Transport, TransportError> {
        self.endpoints.lock().unwrap().push(endpoint.to_string());

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Other("connection refused".to_string()));
        }

        let (local, remote) = memory_pair();
        self.remotes.send(remote).map_err(|_| TransportError::Closed)?;
        Ok(local)
    }
}

pub fn pool_config(retry_delay: Duration) -> PoolConfig {
    PoolConfig {
        ready_threshold: 2,
        max_connections: 10,
        retry_delay,
    }
}

/// Reads the three handshake frames a connection sends first.
pub async fn read_handshake(remote: &mut Transport) -> Vec<Bytes> {
    let mut frames = Vec::new();
    for _ in 0..3 {
        let frame = tokio::time::timeout(Duration::from_secs(2), remote.stream.next())
            .await
            .expect("handshake frame timed out")
            .expect("stream ended during handshake")
            .expect("transport error during handshake");
        frames.push(frame);
    }
    frames
}

/// Polls `condition` until it holds or `within` elapses.
pub async fn wait_until<F: Fn() -> bool>(within: Duration, condition: F) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
