//! WebSocket Proxy (C9): upgrade both ends and shuttle frames, applying
//! Message Capture to the upstream -> client direction only.

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::capture::{self, Message, MessageReq};
use crate::context::ProxyContext;
use crate::dial::{self, target_port};
use crate::rules::RuleOption;

/// Headers the upstream handshake must regenerate itself; forwarding the
/// client's copies would desynchronize the upstream accept key (spec.md
/// §4.8 "forwarding the client's headers minus the upgrade/key/version/
/// extensions set").
const SKIP_UPSTREAM_HEADERS: &[&str] = &[
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "host",
];

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// `upgrade_websocket` per spec.md §4.8. `host` is the Fake Server's
/// bare CONNECT-target hostname (§4.6), used only as a last-resort
/// fallback; `ssl` selects `wss` vs `ws`.
pub async fn upgrade_websocket(
    ctx: Arc<ProxyContext>,
    mut req: Request<Incoming>,
    host: String,
    ssl: bool,
) -> anyhow::Result<Response<Full<Bytes>>> {
    let client_key = req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let Some(client_key) = client_key else {
        return Ok(Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Full::from("missing Sec-WebSocket-Key"))
            .unwrap());
    };

    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();

    // `host` as passed down from the Tunnel Terminator carries no port
    // (the CONNECT target's authority is split into host/port there, and
    // only the host survives); the request's own `Host` header (or its
    // URI authority) is the real source of truth, matching how the HTTP
    // Forwarder resolves its own dial target.
    let host_header = headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.host().map(str::to_string))
        .unwrap_or(host);

    let message_req = MessageReq::build(&method, &uri, &host_header, &headers, Vec::new());

    let (target_host, explicit_port) = split_host_port(&host_header);
    let port = target_port(explicit_port.or_else(|| uri.port_u16()), ssl);
    let scheme = if ssl { "wss" } else { "ws" };
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let url = format!("{scheme}://{target_host}:{port}{path}");

    let upstream_proxy = ctx.upstream_proxy.clone();

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(&mut req).await {
            Ok(u) => u,
            Err(e) => {
                eprintln!("error: client websocket upgrade failed: {e}");
                return;
            }
        };

        let client_ws =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

        let mut upstream_request = match url.clone().into_client_request() {
            Ok(r) => r,
            Err(e) => {
                eprintln!("error: could not build upstream websocket request: {e}");
                return;
            }
        };
        for (name, value) in headers.iter() {
            if SKIP_UPSTREAM_HEADERS.contains(&name.as_str()) {
                continue;
            }
            upstream_request.headers_mut().insert(name.clone(), value.clone());
        }

        let stream = match dial::dial(upstream_proxy.as_ref(), &target_host, port, ssl).await {
            Ok(s) => s,
            Err(e) => {
                eprintln!("error: websocket dial to {target_host}:{port} failed: {e}");
                return;
            }
        };

        let (upstream_ws, _resp) =
            match tokio_tungstenite::client_async(upstream_request, stream).await {
                Ok(pair) => pair,
                Err(e) => {
                    eprintln!("error: upstream websocket handshake failed: {e}");
                    return;
                }
            };

        pump(ctx, client_ws, upstream_ws, message_req, target_host).await;
    });

    let accept = accept_key(&client_key);
    Ok(Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(http::header::UPGRADE, "websocket")
        .header(http::header::CONNECTION, "Upgrade")
        .header("Sec-WebSocket-Accept", accept)
        .body(Full::from(Bytes::new()))
        .unwrap())
}

/// Run the two concurrent pumps until either side closes (spec.md §4.8,
/// "Closure of either direction terminates both pumps").
async fn pump(
    ctx: Arc<ProxyContext>,
    client_ws: WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>,
    upstream_ws: WebSocketStream<dial::MaybeTlsStream>,
    message_req: MessageReq,
    host: String,
) {
    let (mut client_sink, mut client_stream) = client_ws.split();
    let (mut upstream_sink, mut upstream_stream) = upstream_ws.split();

    let client_to_upstream = async {
        while let Some(msg) = client_stream.next().await {
            match msg {
                Ok(msg) => {
                    let is_close = msg.is_close();
                    if upstream_sink.send(msg).await.is_err() {
                        break;
                    }
                    if is_close {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = upstream_sink.close().await;
    };

    let upstream_to_client = async {
        while let Some(msg) = upstream_stream.next().await {
            match msg {
                Ok(msg) => {
                    if msg.is_close() {
                        let _ = client_sink.send(msg).await;
                        break;
                    }
                    if !matches!(msg, WsMessage::Text(_) | WsMessage::Binary(_)) {
                        if client_sink.send(msg).await.is_err() {
                            break;
                        }
                        continue;
                    }

                    let (rule, matched) = ctx.rule_store.matches(&host, &message_req.uri);
                    if ctx.rule_store.enabled && !matched {
                        // Dropped: not delivered to the client (spec.md P7).
                        continue;
                    }

                    let payload = msg.clone().into_data();
                    capture::log_ws_frame(&ctx, &message_req, &payload);

                    match rule.option {
                        RuleOption::ToRedis => {
                            let export = Message::from_ws_frame(&message_req, &payload);
                            capture::export_to_redis(&ctx, &export).await;
                        }
                        RuleOption::UseLocalResponse => {
                            match tokio::fs::File::open(&rule.content).await {
                                Ok(mut file) => {
                                    let mut contents = Vec::new();
                                    if file.read_to_end(&mut contents).await.is_ok() {
                                        if client_sink.send(WsMessage::Binary(contents.into())).await.is_err() {
                                            break;
                                        }
                                        continue;
                                    }
                                }
                                Err(e) => {
                                    eprintln!(
                                        "warning: local response file {:?} could not be opened: {e}",
                                        rule.content
                                    );
                                }
                            }
                            if client_sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                        RuleOption::ToStdout => {
                            if client_sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(_) => break,
            }
        }
        let _ = client_sink.close().await;
    };

    tokio::join!(client_to_upstream, upstream_to_client);
}

fn split_host_port(s: &str) -> (String, Option<u16>) {
    match s.rsplit_once(':') {
        Some((h, p)) => match p.parse::<u16>() {
            Ok(port) => (h.to_string(), Some(port)),
            Err(_) => (s.to_string(), None),
        },
        None => (s.to_string(), None),
    }
}
