//! Client-facing WebSocket listener.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::discovery::{Discovery, HttpDiscovery};
use crate::error::RelayError;
use crate::pool::ConnectionPool;
use crate::session::ProxySession;
use crate::transport::{from_websocket, Connector, WsConnector};

/// The relay: a connection pool plus a listener that turns each accepted
/// client into a [`ProxySession`].
///
/// # Lifecycle
///
/// [`start`](Self::start) starts pool maintenance, binds the listener and
/// accepts clients until [`shutdown`](Self::shutdown) is called. Tests that
/// need an ephemeral port call [`bind`](Self::bind) and
/// [`serve`](Self::serve) separately.
pub struct RelayServer {
    config: RelayConfig,
    pool: Arc<ConnectionPool>,
    shutdown_sender: broadcast::Sender<()>,
    active_sessions: Arc<AtomicUsize>,
}

impl RelayServer {
    /// Creates a relay using HTTP discovery and WebSocket upstreams.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        let discovery = Arc::new(HttpDiscovery::new(config.discovery.clone())?);
        let connector = Arc::new(WsConnector::new(config.upstream.origin.clone()));
        Ok(Self::with_parts(config, discovery, connector))
    }

    /// Creates a relay with caller-supplied discovery and connector.
    pub fn with_parts(config: RelayConfig, discovery: Arc<dyn Discovery>, connector: Arc<dyn Connector>) -> Self {
        let pool = ConnectionPool::new(config.pool.clone(), config.upstream.clone(), discovery, connector);
        let (shutdown_sender, _) = broadcast::channel(1);

        Self {
            config,
            pool,
            shutdown_sender,
            active_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> Result<(), RelayError> {
        self.pool.start();
        let result = match self.bind() {
            Ok(listener) => self.serve(listener).await,
            Err(e) => Err(e),
        };
        self.pool.shutdown();
        result
    }

    /// Binds the client listener on the configured address.
    pub fn bind(&self) -> Result<TcpListener, RelayError> {
        let address = self.config.bind_address;

        let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| RelayError::Network(format!("Socket creation failed: {e}")))?;
        socket.set_reuse_address(true).ok();

        socket
            .bind(&address.into())
            .map_err(|e| RelayError::Network(format!("Bind failed: {e}")))?;
        socket
            .listen(1024)
            .map_err(|e| RelayError::Network(format!("Listen failed: {e}")))?;

        let std_listener: StdTcpListener = socket.into();
        std_listener
            .set_nonblocking(true)
            .map_err(|e| RelayError::Network(format!("Failed to set non-blocking: {e}")))?;

        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| RelayError::Network(format!("Tokio listener creation failed: {e}")))?;

        info!("✅ Listener bound on {}", address);
        Ok(listener)
    }

    /// Accepts clients on `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        let mut shutdown_receiver = self.shutdown_sender.subscribe();
        let local_addr = listener
            .local_addr()
            .map_err(|e| RelayError::Network(e.to_string()))?;
        info!("🚀 Relay accepting clients on {}", local_addr);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_session(stream, addr),
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                _ = shutdown_receiver.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        info!("Relay stopped");
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, addr: SocketAddr) {
        let Some(slot) = SessionSlot::acquire(&self.active_sessions, self.config.max_sessions) else {
            warn!("Rejecting {}: {} sessions already active", addr, self.config.max_sessions);
            return;
        };

        let pool = Arc::clone(&self.pool);
        let forward_client_input = self.config.forward_client_input;

        tokio::spawn(async move {
            let _slot = slot;

            let ws = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket upgrade from {} failed: {}", addr, e);
                    return;
                }
            };

            let session = ProxySession::new(pool, forward_client_input);
            debug!("Client {} is session {}", addr, session.id());

            if let Err(e) = session.run(from_websocket(ws)).await {
                warn!("Session for {} failed: {}", addr, e);
            }
        });
    }

    /// Stops the accept loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_sender.send(());
    }
}

/// Counts one active session for as long as it lives.
struct SessionSlot(Arc<AtomicUsize>);

impl SessionSlot {
    fn acquire(counter: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        let previous = counter.fetch_add(1, Ordering::SeqCst);
        if previous >= limit {
            counter.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(Self(Arc::clone(counter)))
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_slots_respect_limit() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = SessionSlot::acquire(&counter, 2).unwrap();
        let _second = SessionSlot::acquire(&counter, 2).unwrap();
        assert!(SessionSlot::acquire(&counter, 2).is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        drop(first);
        assert!(SessionSlot::acquire(&counter, 2).is_some());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = RelayConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            ..RelayConfig::default()
        };
        let server = RelayServer::new(config).unwrap();
        let listener = server.bind().unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
