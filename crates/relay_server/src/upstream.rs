//! A single upstream game-server connection.
//!
//! Each [`UpstreamConnection`] owns one reader task and one writer task. The
//! reader forwards every inbound frame verbatim to the bound session, then
//! decodes it and publishes the result on the pool's event bus. Loss of the
//! socket is reported twice: to the bound session as
//! [`Downstream::UpstreamLost`] and to the pool as [`PoolNotice::Lost`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use agar_protocol::{DecodedMessage, ProtocolCodec};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RelayError;
use crate::transport::{Connector, FrameSink, FrameStream, Transport};

/// Pool-assigned connection identifier.
pub type ConnectionId = u64;

/// Identifier of a client session.
pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketState {
    Connecting,
    Open,
    /// Closed after having been open
    Closed,
    /// Never completed its handshake
    Failed,
}

impl SocketState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SocketState::Closed | SocketState::Failed)
    }
}

/// A decoded inbound message, tagged with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct UpstreamEvent {
    pub connection_id: ConnectionId,
    pub message: DecodedMessage,
}

/// Lifecycle notices sent from connections (and the retry timer) to the
/// pool's maintenance task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolNotice {
    /// An open connection went away and must be replaced.
    Lost { id: ConnectionId, state: SocketState },
    /// The retry delay after a failed spawn has elapsed.
    RetryDue,
}

/// What an upstream connection delivers to its bound session.
#[derive(Debug, Clone, PartialEq)]
pub enum Downstream {
    /// A raw inbound frame, forwarded before decoding.
    Frame(Bytes),
    /// The upstream socket is gone; the session must close its client.
    UpstreamLost { state: SocketState },
}

/// Frames a session may have queued before its upstream detaches it.
pub const DOWNSTREAM_QUEUE: usize = 1024;

/// The sending end a session registers when it binds to a connection.
///
/// A session that has dropped its receiver counts as unbound. The queue is
/// bounded; a session that lets it fill up is detached.
#[derive(Debug, Clone)]
pub struct SessionLink {
    pub session_id: SessionId,
    tx: mpsc::Sender<Downstream>,
}

impl SessionLink {
    pub fn new(session_id: SessionId, tx: mpsc::Sender<Downstream>) -> Self {
        Self { session_id, tx }
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    fn deliver(&self, item: Downstream) -> Result<(), TrySendError<Downstream>> {
        self.tx.try_send(item)
    }
}

/// Completion guard for [`UpstreamConnection::open`].
///
/// The reader and writer race to settle it; only the first call wins.
struct OpenSignal {
    tx: Mutex<Option<oneshot::Sender<bool>>>,
}

impl OpenSignal {
    fn new() -> (Arc<Self>, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    fn resolve(&self, opened: bool) {
        let sender = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sender) = sender {
            let _ = sender.send(opened);
        }
    }
}

struct Inner {
    state: SocketState,
    binding: Option<SessionLink>,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    reader: Option<AbortHandle>,
}

/// One socket to an upstream game server.
pub struct UpstreamConnection {
    id: ConnectionId,
    origin_endpoint: String,
    join_code: String,
    codec: ProtocolCodec,
    events: broadcast::Sender<UpstreamEvent>,
    notices: mpsc::UnboundedSender<PoolNotice>,
    inner: Mutex<Inner>,
}

impl UpstreamConnection {
    pub fn new(
        id: ConnectionId,
        origin_endpoint: String,
        join_code: String,
        codec: ProtocolCodec,
        events: broadcast::Sender<UpstreamEvent>,
        notices: mpsc::UnboundedSender<PoolNotice>,
    ) -> Self {
        Self {
            id,
            origin_endpoint,
            join_code,
            codec,
            events,
            notices,
            inner: Mutex::new(Inner {
                state: SocketState::Connecting,
                binding: None,
                outbound: None,
                reader: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn origin_endpoint(&self) -> &str {
        &self.origin_endpoint
    }

    pub fn join_code(&self) -> &str {
        &self.join_code
    }

    pub fn state(&self) -> SocketState {
        self.lock().state
    }

    /// True while a live session is bound.
    pub fn in_use(&self) -> bool {
        self.lock().binding.as_ref().is_some_and(SessionLink::is_alive)
    }

    pub fn bound_session(&self) -> Option<SessionId> {
        self.lock()
            .binding
            .as_ref()
            .filter(|link| link.is_alive())
            .map(|link| link.session_id)
    }

    /// Opens the transport and performs the handshake.
    ///
    /// The connect and the handshake are each bounded by `timeout`. The
    /// reader is running before the first handshake frame is written so no
    /// inbound frame is missed.
    ///
    /// # Errors
    ///
    /// * [`RelayError::Codec`] if the join code cannot be encoded
    /// * [`RelayError::HandshakeTimeout`] if connect or handshake stalls
    /// * [`RelayError::HandshakeFailure`] if the transport fails or closes
    ///   before any inbound data
    ///
    /// On error the connection ends in [`SocketState::Failed`].
    pub async fn open(self: &Arc<Self>, connector: &dyn Connector, timeout: Duration) -> Result<(), RelayError> {
        let handshake = match self.codec.handshake_frames(&self.join_code) {
            Ok(frames) => frames,
            Err(e) => {
                self.terminate(false);
                return Err(e.into());
            }
        };

        let transport = match tokio::time::timeout(timeout, connector.connect(&self.origin_endpoint)).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                self.terminate(false);
                return Err(RelayError::HandshakeFailure(format!(
                    "connect to {} failed: {}",
                    self.origin_endpoint, e
                )));
            }
            Err(_) => {
                self.terminate(false);
                return Err(RelayError::HandshakeTimeout(timeout));
            }
        };

        let Transport { sink, stream } = transport;
        let (signal, opened) = OpenSignal::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.lock().outbound = Some(outbound_tx);

        let reader = tokio::spawn(Arc::clone(self).read_loop(stream, Arc::clone(&signal)));
        self.lock().reader = Some(reader.abort_handle());
        tokio::spawn(Arc::clone(self).write_loop(sink, handshake, outbound_rx, signal));

        let result = match tokio::time::timeout(timeout, opened).await {
            Ok(Ok(true)) => {
                if self.mark_open() {
                    Ok(())
                } else {
                    Err(RelayError::HandshakeFailure(format!(
                        "{} closed during the handshake",
                        self.origin_endpoint
                    )))
                }
            }
            Ok(Ok(false)) | Ok(Err(_)) => Err(RelayError::HandshakeFailure(format!(
                "{} closed before the handshake completed",
                self.origin_endpoint
            ))),
            Err(_) => Err(RelayError::HandshakeTimeout(timeout)),
        };

        if result.is_err() {
            self.terminate(false);
        } else {
            info!("🔗 Upstream {} open to {}", self.id, self.origin_endpoint);
        }
        result
    }

    fn mark_open(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == SocketState::Connecting {
            inner.state = SocketState::Open;
            true
        } else {
            false
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream: FrameStream, signal: Arc<OpenSignal>) {
        while let Some(item) = stream.next().await {
            let frame = match item {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Upstream {} read error: {}", self.id, e);
                    break;
                }
            };
            signal.resolve(true);

            self.forward(frame.clone());

            match self.codec.decode(&frame) {
                Ok(message) => {
                    if let DecodedMessage::Unknown { tag, raw } = &message {
                        debug!("Upstream {} sent unknown tag {} ({} bytes)", self.id, tag, raw.len());
                    }
                    let _ = self.events.send(UpstreamEvent {
                        connection_id: self.id,
                        message,
                    });
                }
                Err(e) => {
                    warn!("Upstream {} sent a malformed frame, closing: {}", self.id, e);
                    break;
                }
            }
        }

        signal.resolve(false);
        self.terminate(true);
    }

    async fn write_loop(
        self: Arc<Self>,
        mut sink: FrameSink,
        handshake: [Bytes; 3],
        mut outbound: mpsc::UnboundedReceiver<Bytes>,
        signal: Arc<OpenSignal>,
    ) {
        for frame in handshake {
            if let Err(e) = sink.send(frame).await {
                warn!("Upstream {} handshake write failed: {}", self.id, e);
                signal.resolve(false);
                self.terminate(true);
                return;
            }
        }
        signal.resolve(true);

        while let Some(frame) = outbound.recv().await {
            if let Err(e) = sink.send(frame).await {
                warn!("Upstream {} write failed: {}", self.id, e);
                self.terminate(true);
                return;
            }
        }

        let _ = sink.close().await;
    }

    fn forward(&self, frame: Bytes) {
        let mut inner = self.lock();
        let Some(link) = &inner.binding else {
            return;
        };
        match link.deliver(Downstream::Frame(frame)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Upstream {} detaching session {}: {} frames behind",
                    self.id, link.session_id, DOWNSTREAM_QUEUE
                );
                inner.binding = None;
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Upstream {} dropping binding to a departed session", self.id);
                inner.binding = None;
            }
        }
    }

    /// Sends a raw frame upstream. Does nothing unless the socket is open.
    ///
    /// Returns whether the frame was queued.
    pub fn send(&self, frame: Bytes) -> bool {
        let inner = self.lock();
        if inner.state != SocketState::Open {
            return false;
        }
        inner.outbound.as_ref().is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// Binds `link` if the connection is open and free.
    pub fn try_bind(&self, link: SessionLink) -> bool {
        let mut inner = self.lock();
        if inner.state != SocketState::Open || inner.binding.as_ref().is_some_and(SessionLink::is_alive) {
            return false;
        }
        inner.binding = Some(link);
        true
    }

    /// Clears the binding, keeping the socket. Returns whether a session was
    /// bound.
    pub fn unbind(&self) -> bool {
        self.lock().binding.take().is_some()
    }

    /// Tears the connection down without notifying the pool.
    ///
    /// A bound session is still told that its upstream is gone.
    pub fn close(&self) {
        if let Some(state) = self.terminate(false) {
            debug!("Upstream {} closed ({:?})", self.id, state);
        }
    }

    /// Moves to a terminal state exactly once. Returns the new state, or
    /// `None` if the connection had already ended.
    fn terminate(&self, notify_pool: bool) -> Option<SocketState> {
        let (state, binding) = {
            let mut inner = self.lock();
            let state = match inner.state {
                SocketState::Open => SocketState::Closed,
                SocketState::Connecting => SocketState::Failed,
                SocketState::Closed | SocketState::Failed => return None,
            };
            inner.state = state;
            inner.outbound = None;
            if let Some(reader) = inner.reader.take() {
                reader.abort();
            }
            (state, inner.binding.take())
        };

        if let Some(link) = binding {
            let _ = link.deliver(Downstream::UpstreamLost { state });
        }

        if notify_pool && state == SocketState::Closed {
            warn!("⚠️ Upstream {} to {} lost", self.id, self.origin_endpoint);
            let _ = self.notices.send(PoolNotice::Lost { id: self.id, state });
        }

        Some(state)
    }
}

impl std::fmt::Debug for UpstreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnection")
            .field("id", &self.id)
            .field("origin_endpoint", &self.origin_endpoint)
            .field("state", &self.state())
            .finish()
    }
}
