//! Connection Listener (C4) and Dispatcher (C5): accept connections on
//! the configured bind address and route each request to the Tunnel
//! Terminator or the HTTP Forwarder.

use anyhow::{Context, Result};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HttpBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use crate::context::ProxyContext;
use crate::forward;
use crate::tunnel;

/// Normalize a Go-style bind address (`:8080`, `localhost:8080`, `8080`)
/// into something `SocketAddr`/`TcpListener` accepts.
fn normalize_bind_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else if addr.chars().all(|c| c.is_ascii_digit()) {
        format!("0.0.0.0:{addr}")
    } else {
        addr.to_string()
    }
}

async fn dispatch(
    ctx: Arc<ProxyContext>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, anyhow::Error> {
    // CONNECT is intercepted ahead of hyper in `serve` (spec.md §6 needs
    // the exact "Connection established" wire text, which hyper's
    // response encoder can't produce); a CONNECT reaching here means it
    // arrived mid-connection rather than as the first request.
    if req.method() == Method::CONNECT {
        return Ok(Response::builder()
            .status(StatusCode::NOT_IMPLEMENTED)
            .body(Full::from("CONNECT must be the first request on a connection"))
            .unwrap());
    }

    match forward::forward(ctx, req, false).await {
        Ok(resp) => Ok(resp),
        Err(e) => Ok(Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Full::from(format!("proxy error: {e}")))
            .unwrap()),
    }
}

/// Peek at a freshly accepted connection to see if its first request is
/// CONNECT, without consuming any bytes — so a non-CONNECT connection
/// still lands on hyper untouched.
async fn looks_like_connect(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 8];
    matches!(stream.peek(&mut buf).await, Ok(n) if n >= 7 && &buf[..7] == b"CONNECT")
}

/// Bind and serve forever. Each accepted connection gets its own task; a
/// single connection may carry several requests (HTTP keep-alive) or be
/// upgraded into a CONNECT tunnel (spec.md §4.4/§4.5).
pub async fn run(ctx: Arc<ProxyContext>) -> Result<()> {
    let addr: SocketAddr = normalize_bind_addr(&ctx.bind_addr)
        .parse()
        .with_context(|| format!("invalid bind address {:?}", ctx.bind_addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    eprintln!("freeproxy listening on {addr}");

    serve(ctx, listener).await
}

/// The accept loop itself, split out from `run` so tests can bind an
/// ephemeral port, read it back with `local_addr()`, and drive the proxy
/// end to end without going through the CLI.
pub async fn serve(ctx: Arc<ProxyContext>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, _peer) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                eprintln!("accept error: {e}");
                continue;
            }
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            if looks_like_connect(&stream).await {
                if let Err(e) = tunnel::handle_connect(ctx, stream).await {
                    eprintln!("CONNECT error: {e:#}");
                }
                return;
            }

            let service = service_fn(move |req| dispatch(ctx.clone(), req));
            if let Err(e) = HttpBuilder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
            {
                eprintln!("connection error: {e:#}");
            }
        });
    }
}
