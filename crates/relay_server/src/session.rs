//! Client sessions.
//!
//! A [`ProxySession`] pairs one client transport with one pooled upstream
//! connection for the lifetime of the client.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RelayError;
use crate::pool::ConnectionPool;
use crate::transport::Transport;
use crate::upstream::{Downstream, SessionId, SessionLink, DOWNSTREAM_QUEUE};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client went away; the upstream was released back to the pool.
    ClientClosed,
    /// The upstream went away; the client was closed.
    UpstreamLost,
    /// The client fell too far behind and the upstream dropped it. The
    /// client was closed; the upstream stays in the pool.
    Detached,
}

pub struct ProxySession {
    id: SessionId,
    pool: Arc<ConnectionPool>,
    forward_client_input: bool,
}

impl ProxySession {
    pub fn new(pool: Arc<ConnectionPool>, forward_client_input: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            pool,
            forward_client_input,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Relays between `client` and an allocated upstream until either side
    /// ends.
    ///
    /// # Errors
    ///
    /// [`RelayError::PoolExhausted`] if no upstream could be allocated. The
    /// client transport is closed before returning.
    pub async fn run(self, client: Transport) -> Result<SessionEnd, RelayError> {
        let Transport { mut sink, mut stream } = client;
        let (tx, mut downstream) = mpsc::channel(DOWNSTREAM_QUEUE);

        let Some(upstream) = self.pool.allocate(SessionLink::new(self.id, tx)) else {
            let _ = sink.close().await;
            return Err(RelayError::PoolExhausted(format!(
                "no free upstream for session {}",
                self.id
            )));
        };

        info!("🎮 Session {} started on upstream {}", self.id, upstream.id());

        let end = loop {
            tokio::select! {
                biased;

                inbound = stream.next() => match inbound {
                    Some(Ok(frame)) => {
                        if self.forward_client_input {
                            upstream.send(frame);
                        }
                    }
                    Some(Err(e)) => {
                        debug!("Session {} client error: {}", self.id, e);
                        break SessionEnd::ClientClosed;
                    }
                    None => break SessionEnd::ClientClosed,
                },

                item = downstream.recv() => match item {
                    Some(Downstream::Frame(frame)) => {
                        if let Err(e) = sink.send(frame).await {
                            debug!("Session {} client write failed: {}", self.id, e);
                            break SessionEnd::ClientClosed;
                        }
                    }
                    Some(Downstream::UpstreamLost { state }) => {
                        warn!("Session {} lost upstream {} ({:?})", self.id, upstream.id(), state);
                        break SessionEnd::UpstreamLost;
                    }
                    None if upstream.state().is_terminal() => break SessionEnd::UpstreamLost,
                    None => {
                        warn!("Session {} detached from upstream {}", self.id, upstream.id());
                        break SessionEnd::Detached;
                    }
                },
            }
        };

        match end {
            SessionEnd::ClientClosed => self.pool.release(&upstream),
            SessionEnd::UpstreamLost | SessionEnd::Detached => {
                let _ = sink.close().await;
            }
        }

        info!("Session {} ended: {:?}", self.id, end);
        Ok(end)
    }
}
