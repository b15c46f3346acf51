//! WebSocket transport built on `tokio-tungstenite`.
//!
//! The game protocol is binary. A text message from either peer is carried
//! as its UTF-8 bytes and re-sent as a binary message; the frame kind is not
//! preserved.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, ORIGIN};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::debug;

use super::{Connector, Transport, TransportError};

/// Wraps an established WebSocket as a [`Transport`].
///
/// Outbound frames are sent as binary messages. Inbound binary and text
/// messages are both surfaced as raw bytes; control frames are handled by
/// tungstenite and skipped here. The stream ends at the first close frame.
pub fn from_websocket<S>(ws: WebSocketStream<S>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (ws_sink, ws_stream) = ws.split();

    let sink = ws_sink.with(|frame: Bytes| future::ready(Ok::<_, TransportError>(Message::Binary(frame))));

    let stream = ws_stream
        .take_while(|message| future::ready(!matches!(message, Ok(Message::Close(_)))))
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(Message::Text(text)) => Some(Ok(Bytes::copy_from_slice(text.as_bytes()))),
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::from(e))),
            })
        });

    Transport::new(Box::pin(sink), Box::pin(stream))
}

/// Connects to upstream game servers over plain `ws://`.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    origin: Option<String>,
}

impl WsConnector {
    /// `origin` is sent as the `Origin` request header when set.
    pub fn new(origin: Option<String>) -> Self {
        Self { origin }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Transport, TransportError> {
        let mut request = format!("ws://{endpoint}/").into_client_request()?;

        if let Some(origin) = &self.origin {
            let value = HeaderValue::from_str(origin)
                .map_err(|e| TransportError::Other(format!("Invalid origin header: {e}")))?;
            request.headers_mut().insert(ORIGIN, value);
        }

        let (ws, response) = connect_async(request).await?;
        debug!("WebSocket to {} upgraded with status {}", endpoint, response.status());
        Ok(from_websocket(ws))
    }
}
