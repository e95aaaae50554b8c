//! Shared test helpers.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Create a temp directory for use as an isolated process working
/// directory (so `crts/` writes don't collide between tests).
#[allow(dead_code)]
pub fn temp_workdir() -> TempDir {
    tempfile::Builder::new()
        .prefix("freeproxy_test_")
        .tempdir_in(std::env::current_dir().unwrap_or_else(|_| std::path::Path::new(".").into()))
        .expect("temp dir")
}

/// Spawn a bare-bones upstream HTTP/1.1 server (one accept loop, one
/// canned response per connection) and return its bound address. Used to
/// stand in for "the origin" in end-to-end proxy tests.
#[allow(dead_code)]
pub async fn spawn_upstream(body: &'static str, content_type: &'static str) -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream local_addr");
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

/// Issue a raw origin-form-over-absolute-URI GET through `proxy_addr` for
/// `http://upstream_addr{path}` and return `(status, body)`. Mimics what a
/// forward-proxy-aware HTTP client sends: an absolute-URI request line.
#[allow(dead_code)]
pub async fn send_proxy_request(proxy_addr: SocketAddr, upstream_addr: SocketAddr, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(proxy_addr).await.expect("connect to proxy");
    let request = format!(
        "GET http://{upstream_addr}{path} HTTP/1.1\r\nHost: {upstream_addr}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.expect("write request");
    let _ = stream.shutdown().await;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.expect("read response");
    let text = String::from_utf8_lossy(&raw).to_string();
    let status_line = text.lines().next().unwrap_or_default();
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = text.split("\r\n\r\n").nth(1).unwrap_or("").to_string();
    (status, body)
}

/// Find the byte offset of the next `\r\n` in `buf`, starting at `from`.
fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..].windows(2).position(|w| w == b"\r\n").map(|p| from + p)
}

/// Parse one RESP array-of-bulk-strings command (the only shape a Redis
/// client ever sends) off the front of `buf`. Returns the arguments and
/// how many bytes were consumed, or `None` if `buf` doesn't yet hold a
/// complete command.
fn parse_resp_command(buf: &[u8]) -> Option<(Vec<String>, usize)> {
    if buf.first() != Some(&b'*') {
        return None;
    }
    let end = find_crlf(buf, 0)?;
    let count: usize = std::str::from_utf8(&buf[1..end]).ok()?.parse().ok()?;
    let mut pos = end + 2;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.get(pos) != Some(&b'$') {
            return None;
        }
        let len_end = find_crlf(buf, pos)?;
        let len: usize = std::str::from_utf8(&buf[pos + 1..len_end]).ok()?.parse().ok()?;
        let data_start = len_end + 2;
        let data_end = data_start + len;
        if buf.len() < data_end + 2 {
            return None;
        }
        args.push(String::from_utf8_lossy(&buf[data_start..data_end]).to_string());
        pos = data_end + 2;
    }
    Some((args, pos))
}

/// Spawn a bare-bones fake Redis server: accepts one connection, answers
/// every RESP command with `+OK\r\n` except `LPUSH`, whose second argument
/// (the pushed payload) is forwarded on the returned channel and answered
/// with the list-length reply clients expect.
#[allow(dead_code)]
pub async fn spawn_fake_redis() -> (SocketAddr, mpsc::Receiver<String>) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind fake redis");
    let addr = listener.local_addr().expect("fake redis local_addr");
    let (tx, rx) = mpsc::channel(8);

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => return,
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let n = match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                    while let Some((args, consumed)) = parse_resp_command(&buf) {
                        buf.drain(..consumed);
                        if args.first().is_some_and(|c| c.eq_ignore_ascii_case("LPUSH")) {
                            if let Some(payload) = args.get(2) {
                                let _ = tx.send(payload.clone()).await;
                            }
                            if stream.write_all(b":1\r\n").await.is_err() {
                                return;
                            }
                        } else if stream.write_all(b"+OK\r\n").await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    (addr, rx)
}

/// Spawn a bare-bones upstream WebSocket echo server: accepts one
/// connection, performs the server-side handshake, then echoes every
/// frame back until the client closes.
#[allow(dead_code)]
pub async fn spawn_ws_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind ws upstream");
    let addr = listener.local_addr().expect("ws upstream local_addr");
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let (mut sink, mut stream) = ws.split();
                while let Some(Ok(msg)) = stream.next().await {
                    let is_close = msg.is_close();
                    if sink.send(msg).await.is_err() || is_close {
                        break;
                    }
                }
            });
        }
    });
    addr
}
