//! End-to-end relay over real WebSocket sockets on loopback.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{pool_config, ScriptedDiscovery};
use futures::{SinkExt, StreamExt};
use relay_server::{RelayConfig, RelayServer, UpstreamConfig, WsConnector};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async};

/// What a fake upstream saw from one relay connection.
#[derive(Debug)]
struct Seen {
    origin: Option<String>,
    handshake: Vec<Bytes>,
}

/// Starts a WebSocket upstream that records each handshake and then echoes
/// every binary frame back.
async fn spawn_echo_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen_tx = seen_tx.clone();
            tokio::spawn(async move {
                let mut origin = None;
                let callback = |request: &Request, response: Response| {
                    origin = request
                        .headers()
                        .get("origin")
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string);
                    Ok::<_, ErrorResponse>(response)
                };
                let mut ws = accept_hdr_async(stream, callback).await.unwrap();

                let mut handshake = Vec::new();
                while handshake.len() < 3 {
                    match ws.next().await {
                        Some(Ok(Message::Binary(data))) => handshake.push(data),
                        Some(Ok(_)) => continue,
                        _ => return,
                    }
                }
                let _ = seen_tx.send(Seen { origin, handshake });

                while let Some(Ok(message)) = ws.next().await {
                    if message.is_binary() && ws.send(message).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    (addr, seen_rx)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relay_over_websockets() {
    let (upstream_addr, mut seen) = spawn_echo_upstream().await;

    let config = RelayConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        pool: pool_config(Duration::from_secs(7)),
        upstream: UpstreamConfig {
            handshake_timeout: Duration::from_secs(5),
            ..UpstreamConfig::default()
        },
        ..RelayConfig::default()
    };
    let discovery = ScriptedDiscovery::new(&format!("{upstream_addr}\nABCDEF"));
    let connector = Arc::new(WsConnector::new(Some("http://agar.io".to_string())));
    let server = Arc::new(RelayServer::with_parts(config, discovery, connector));

    assert!(server.pool().warm_up().await.unwrap());

    for _ in 0..2 {
        let upstream = tokio::time::timeout(Duration::from_secs(2), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(upstream.origin.as_deref(), Some("http://agar.io"));
        assert_eq!(&upstream.handshake[0][..], &[254, 4, 0, 0, 0]);
        assert_eq!(&upstream.handshake[1][..], &[255, 0x29, 0x28, 0x28, 0x28]);
        assert_eq!(&upstream.handshake[2][..], b"PABCDEF");
    }

    let listener = server.bind().unwrap();
    let relay_addr = listener.local_addr().unwrap();
    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    let (mut client, _) = connect_async(format!("ws://{relay_addr}/")).await.unwrap();
    client
        .send(Message::Binary(Bytes::from_static(&[0x63, 1, 2, 3])))
        .await
        .unwrap();

    let echoed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Binary(data))) => return data,
                Some(Ok(_)) => continue,
                other => panic!("client stream ended: {:?}", other),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(&echoed[..], &[0x63, 1, 2, 3]);
    assert_eq!(server.active_sessions(), 1);

    client.close(None).await.unwrap();
    server.shutdown();
    serving.await.unwrap().unwrap();
    server.pool().shutdown();
}
