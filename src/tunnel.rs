//! Tunnel Terminator (C6) and Fake Server (C7): terminate a CONNECT
//! tunnel locally, decrypt it with a freshly minted leaf certificate, and
//! dispatch the decrypted traffic back through the Forwarder/WebSocket
//! Proxy.

use anyhow::Context as _;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HttpBuilder;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::context::ProxyContext;
use crate::forward;
use crate::wsproxy;

fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    let connection_has_upgrade = req
        .headers()
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|p| p.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    let upgrade_is_websocket = req
        .headers()
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    connection_has_upgrade && upgrade_is_websocket
}

/// Fake Server (C7) request handler: decrypted traffic emerging from a
/// tunnel, dispatched per spec.md §4.6.
async fn fake_server_dispatch(
    ctx: Arc<ProxyContext>,
    req: Request<Incoming>,
    host: String,
    tls: bool,
) -> Result<Response<Full<Bytes>>, anyhow::Error> {
    if is_websocket_upgrade(&req) {
        wsproxy::upgrade_websocket(ctx, req, host, tls).await
    } else {
        let scheme = if tls { "https" } else { "http" };
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{scheme}://{host}{path}");
        let (mut parts, body) = req.into_parts();
        parts.uri = url.parse().context("rebuild tunneled request URI")?;
        let req = Request::from_parts(parts, body);
        forward::forward(ctx, req, tls).await
    }
}

/// Bind an ephemeral loopback Fake Server for a single tunnel and return
/// its port plus a handle that tears it down on drop/abort.
async fn spawn_fake_server(
    ctx: Arc<ProxyContext>,
    host: String,
    tls: bool,
) -> anyhow::Result<(u16, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await?;
    let port = listener.local_addr()?.port();

    let tls_acceptor = if tls {
        Some(build_tls_acceptor(&ctx, &host).await?)
    } else {
        None
    };

    let handle = tokio::spawn(async move {
        let (stream, _) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                eprintln!("fake server accept error: {e}");
                return;
            }
        };

        let host = host.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            fake_server_dispatch(ctx.clone(), req, host.clone(), tls)
        });

        let result = if let Some(acceptor) = tls_acceptor {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    HttpBuilder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                        .await
                }
                Err(e) => {
                    eprintln!("fake server TLS handshake failed: {e}");
                    return;
                }
            }
        } else {
            HttpBuilder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
        };

        if let Err(e) = result {
            eprintln!("fake server connection error: {e:#}");
        }
    });

    Ok((port, handle))
}

async fn build_tls_acceptor(ctx: &ProxyContext, host: &str) -> anyhow::Result<TlsAcceptor> {
    let (cert_path, key_path) = ctx.cert_minter.ensure_pair(host).await?;

    let cert_pem = tokio::fs::read(&cert_path).await?;
    let key_pem = tokio::fs::read(&key_path).await?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .context("parse leaf cert PEM")?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("parse leaf key PEM")?
        .context("no private key found in leaf key file")?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build TLS server config for leaf certificate")?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Read a bare HTTP/1.1 request head (request-line + headers, no body)
/// directly off the socket, byte at a time until the blank line. CONNECT
/// requests carry no body, so this is the whole request.
async fn read_request_head(stream: &mut TcpStream) -> anyhow::Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            anyhow::bail!("client closed connection before CONNECT request completed");
        }
        buf.push(byte[0]);
        if buf.len() > 16 * 1024 {
            anyhow::bail!("CONNECT request head too large");
        }
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn parse_connect_target(head: &str) -> anyhow::Result<(String, u16)> {
    let request_line = head.lines().next().context("empty CONNECT request")?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().context("missing method")?;
    anyhow::ensure!(
        method.eq_ignore_ascii_case("CONNECT"),
        "not a CONNECT request"
    );
    let authority = parts.next().context("missing CONNECT target")?;
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse::<u16>().unwrap_or(443)),
        None => (authority.to_string(), 443),
    };
    Ok((host, port))
}

async fn write_simple_response(stream: &mut TcpStream, status: &str, body: &str) {
    let resp = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(resp.as_bytes()).await;
}

/// `handle_connect` per spec.md §4.5/§6. Runs on the raw accepted socket,
/// ahead of hyper entirely: hyper's h1 encoder only ever writes the
/// canonical reason phrase for a status code, with no hook to substitute
/// one, so the literal `200 Connection established\r\n\r\n` the original
/// writes to its hijacked socket has to be written the same way here —
/// directly, before the splice starts.
pub async fn handle_connect(ctx: Arc<ProxyContext>, mut stream: TcpStream) -> anyhow::Result<()> {
    let head = read_request_head(&mut stream).await?;
    let (host, port) = match parse_connect_target(&head) {
        Ok(v) => v,
        Err(e) => {
            write_simple_response(&mut stream, "400 Bad Request", &format!("bad CONNECT target: {e}")).await;
            return Ok(());
        }
    };

    let tls = port == 443;
    let (fake_port, fake_server_handle) = match spawn_fake_server(ctx, host, tls).await {
        Ok(v) => v,
        Err(e) => {
            write_simple_response(
                &mut stream,
                "502 Bad Gateway",
                &format!("failed to start fake server: {e}"),
            )
            .await;
            return Ok(());
        }
    };

    stream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await
        .context("write CONNECT response")?;

    let fake_stream = match TcpStream::connect((std::net::Ipv4Addr::LOCALHOST, fake_port)).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("could not connect to fake server: {e}");
            fake_server_handle.abort();
            return Ok(());
        }
    };

    let mut client_io = stream;
    let mut fake_io = fake_stream;
    if let Err(e) = tokio::io::copy_bidirectional(&mut client_io, &mut fake_io).await {
        eprintln!("tunnel splice ended: {e}");
    }

    fake_server_handle.abort();
    Ok(())
}

