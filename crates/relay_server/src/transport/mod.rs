//! Message-oriented duplex transports.
//!
//! Upstream connections and client sessions only ever see a [`Transport`]: a
//! sink of outbound frames and a stream of inbound frames. WebSocket is the
//! production implementation; [`memory_pair`] backs the tests.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;

pub mod websocket;

pub use websocket::{from_websocket, WsConnector};

/// Outbound half of a transport.
pub type FrameSink = Pin<Box<dyn Sink<Bytes, Error = TransportError> + Send>>;

/// Inbound half of a transport. The stream ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Transport closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// An open duplex connection split into its two halves.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Transport {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens transports to upstream endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `endpoint` (`host[:port]`).
    async fn connect(&self, endpoint: &str) -> Result<Transport, TransportError>;
}

/// Two in-process transports wired back to back.
///
/// Frames sent on one side arrive on the other. Dropping or closing one
/// side's sink ends the other side's stream.
pub fn memory_pair() -> (Transport, Transport) {
    let (a_tx, a_rx) = mpsc::unbounded::<Bytes>();
    let (b_tx, b_rx) = mpsc::unbounded::<Bytes>();

    let a = Transport::new(
        Box::pin(a_tx.sink_map_err(|_| TransportError::Closed)),
        Box::pin(b_rx.map(Ok)),
    );
    let b = Transport::new(
        Box::pin(b_tx.sink_map_err(|_| TransportError::Closed)),
        Box::pin(a_rx.map(Ok)),
    );
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_is_duplex() {
        let (mut left, mut right) = memory_pair();

        left.sink.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(right.stream.next().await.unwrap().unwrap(), "ping");

        right.sink.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(left.stream.next().await.unwrap().unwrap(), "pong");
    }

    #[tokio::test]
    async fn test_closing_ends_peer_stream() {
        let (mut left, mut right) = memory_pair();
        left.sink.close().await.unwrap();
        assert!(right.stream.next().await.is_none());

        drop(right);
        assert!(left.stream.next().await.is_none());
    }
}
