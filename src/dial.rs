//! Outbound connection dialing shared by the HTTP Forwarder (C8) and the
//! WebSocket Proxy (C9): direct-to-origin or through a configured upstream
//! HTTP proxy, optionally wrapped in TLS with verification disabled
//! (spec.md §4.7, §4.8).

use anyhow::{bail, Context, Result};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use url::Url;

use crate::tls::insecure_client_config;

/// Either a plain TCP stream or a TLS stream over one, unified behind
/// `AsyncRead`/`AsyncWrite` so callers don't need to care which it is.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

fn default_port(ssl: bool) -> u16 {
    if ssl {
        443
    } else {
        80
    }
}

async fn wrap_tls(tcp: TcpStream, sni_host: &str) -> Result<MaybeTlsStream> {
    let connector = TlsConnector::from(Arc::new(insecure_client_config()));
    let server_name = rustls::pki_types::ServerName::try_from(sni_host.to_string())
        .context("invalid SNI hostname")?;
    let tls = connector
        .connect(server_name, tcp)
        .await
        .context("TLS handshake with upstream")?;
    Ok(MaybeTlsStream::Tls(Box::new(tls)))
}

/// Dial straight to `host:port`, optionally through the upstream HTTP
/// proxy configured in the ProxyContext (spec.md §4.7 step 1, §4.8).
pub async fn dial(upstream_proxy: Option<&Url>, host: &str, port: u16, ssl: bool) -> Result<MaybeTlsStream> {
    match upstream_proxy {
        Some(proxy) => dial_via_proxy(proxy, host, port, ssl).await,
        None => dial_direct(host, port, ssl).await,
    }
}

async fn dial_direct(host: &str, port: u16, ssl: bool) -> Result<MaybeTlsStream> {
    let tcp = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("connect to {host}:{port}"))?;
    if ssl {
        wrap_tls(tcp, host).await
    } else {
        Ok(MaybeTlsStream::Plain(tcp))
    }
}

/// Route through an upstream HTTP proxy: CONNECT-tunnel for TLS targets,
/// plain relay for plaintext targets. The plaintext branch hands back a
/// bare TCP stream to the proxy's own address; it's `forward::forward`
/// that builds the absolute-form request-target the proxy needs to route
/// on, since that's where the request is actually assembled.
async fn dial_via_proxy(proxy: &Url, host: &str, port: u16, ssl: bool) -> Result<MaybeTlsStream> {
    let proxy_host = proxy.host_str().context("upstream proxy URL has no host")?;
    let proxy_port = proxy.port().unwrap_or(8080);

    let mut tcp = TcpStream::connect((proxy_host, proxy_port))
        .await
        .with_context(|| format!("connect to upstream proxy {proxy_host}:{proxy_port}"))?;

    if ssl {
        let connect_line = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n"
        );
        tcp.write_all(connect_line.as_bytes()).await?;
        let status_line = read_status_line(&mut tcp).await?;
        if !status_line.contains("200") {
            bail!("upstream proxy CONNECT failed: {status_line}");
        }
        wrap_tls(tcp, host).await
    } else {
        // Plaintext targets are simply relayed; the forwarder sends an
        // absolute-form request line so the upstream proxy knows where to
        // deliver it.
        Ok(MaybeTlsStream::Plain(tcp))
    }
}

async fn read_status_line(tcp: &mut TcpStream) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = tcp.read(&mut byte).await?;
        if n == 0 {
            bail!("upstream proxy closed connection before CONNECT response");
        }
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            break;
        }
        if line.len() > 8192 {
            bail!("upstream proxy CONNECT response line too long");
        }
    }
    // Drain the rest of the header block.
    let mut prev4 = [0u8; 4];
    loop {
        let n = tcp.read(&mut byte).await?;
        if n == 0 {
            break;
        }
        prev4.rotate_left(1);
        prev4[3] = byte[0];
        if &prev4 == b"\r\n\r\n" {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&line).trim().to_string())
}

pub fn target_port(explicit: Option<u16>, ssl: bool) -> u16 {
    explicit.unwrap_or_else(|| default_port(ssl))
}
