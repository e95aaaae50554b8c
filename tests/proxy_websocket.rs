//! WebSocket Proxy (C9): a CONNECT tunnel to a plaintext `ws://` origin,
//! then a frame sent through the proxy and echoed back (spec.md §4.8).

mod common;

use freeproxy::context::ProxyContext;
use freeproxy::rules::RuleStore;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

async fn read_until(stream: &mut TcpStream, marker: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.expect("read byte");
        assert!(n > 0, "connection closed before marker seen");
        buf.push(byte[0]);
        if buf.ends_with(marker) {
            return buf;
        }
    }
}

#[tokio::test]
async fn websocket_frames_round_trip_through_tunnel() {
    let upstream_addr = common::spawn_ws_echo_upstream().await;

    let ctx = Arc::new(ProxyContext::new(
        "127.0.0.1:0".to_string(),
        None,
        RuleStore::disabled(),
        0,
        None,
    ));
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    tokio::spawn(freeproxy::listener::serve(ctx, listener));

    // A plaintext ws:// target reaches the Fake Server through the same
    // CONNECT tunnel plaintext HTTP targets use (port != 443).
    let mut tunnel = TcpStream::connect(proxy_addr).await.unwrap();
    let connect_req = format!("CONNECT {upstream_addr} HTTP/1.1\r\nHost: {upstream_addr}\r\n\r\n");
    tunnel.write_all(connect_req.as_bytes()).await.unwrap();
    let head = read_until(&mut tunnel, b"\r\n\r\n").await;
    assert_eq!(head, b"HTTP/1.1 200 Connection established\r\n\r\n");

    let request = format!("ws://{upstream_addr}/")
        .into_client_request()
        .expect("build websocket handshake request");
    let (mut ws, _resp) = tokio_tungstenite::client_async(request, tunnel)
        .await
        .expect("websocket handshake through tunnel");

    ws.send(WsMessage::Binary(b"hello through the tunnel".to_vec().into()))
        .await
        .expect("send frame");

    let reply = ws
        .next()
        .await
        .expect("reply frame present")
        .expect("reply frame ok");
    assert_eq!(reply.into_data().to_vec(), b"hello through the tunnel".to_vec());

    let _ = ws.close(None).await;
}
