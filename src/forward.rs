//! HTTP Forwarder (C8): build an outbound request, consult Message
//! Capture and the Rule Store, and write the response to the client.

use http::{HeaderMap, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::capture::{self, Message, MessageReq, MessageResp};
use crate::context::ProxyContext;
use crate::dial::{self, target_port};
use crate::rules::RuleOption;

/// Headers stripped before forwarding, matching the original's narrow
/// hop-header list (only `Proxy-Connection`, not a broader hop-by-hop
/// set) — spec.md §4.7 step 2.
const STRIPPED_HEADERS: &[&str] = &["proxy-connection"];

fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in STRIPPED_HEADERS {
        headers.remove(*name);
    }
}

/// Pick the request-target form the next hop actually expects (RFC 7230
/// §5.3): absolute-form when relaying through an upstream HTTP proxy, so
/// it can route on the target; origin-form when dialing the origin
/// directly, since that's the only form a real origin server accepts.
fn request_target(uri: &Uri, host: &str, port: u16, ssl: bool, via_proxy: bool) -> Uri {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let rebuilt = if via_proxy {
        let scheme = if ssl { "https" } else { "http" };
        format!("{scheme}://{host}:{port}{path}")
    } else {
        path.to_string()
    };
    rebuilt.parse().unwrap_or_else(|_| uri.clone())
}

fn bad_gateway(message: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(Full::from(message))
        .unwrap()
}

/// `forward(req, ssl)` per spec.md §4.7. `req`'s URI must already carry an
/// absolute form (scheme + authority): the plain-HTTP dispatcher passes
/// the client's absolute-URI request through untouched; the Fake Server
/// reconstructs `{scheme}://{host}{uri}` before calling in.
pub async fn forward(
    ctx: Arc<ProxyContext>,
    mut req: Request<Incoming>,
    ssl: bool,
) -> anyhow::Result<Response<Full<Bytes>>> {
    strip_hop_headers(req.headers_mut());

    let host_header = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string));

    let Some(host_header) = host_header else {
        return Ok(bad_gateway("missing Host header".to_string()));
    };
    let (target_host, explicit_port) = split_host_port(&host_header);
    let port = target_port(explicit_port.or_else(|| req.uri().port_u16()), ssl);

    let method = req.method().clone();
    let uri = req.uri().clone();
    let mut out_headers = req.headers().clone();
    out_headers.insert(
        http::header::HOST,
        host_header.parse().unwrap_or_else(|_| "".parse().unwrap()),
    );

    let body_bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return Ok(bad_gateway(format!("read request body: {e}"))),
    };

    let message_req = MessageReq::build(&method, &uri, &target_host, &out_headers, body_bytes.to_vec());

    let stream = match dial::dial(ctx.upstream_proxy.as_ref(), &target_host, port, ssl).await {
        Ok(s) => s,
        Err(e) => return Ok(bad_gateway(format!("connect to {target_host}:{port}: {e}"))),
    };

    let io = TokioIo::new(stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => return Ok(bad_gateway(format!("handshake with upstream: {e}"))),
    };
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("upstream connection error: {e}");
        }
    });

    let via_proxy = ctx.upstream_proxy.is_some() && !ssl;
    let out_uri = request_target(&uri, &target_host, port, ssl, via_proxy);

    let mut out_req_builder = Request::builder().method(method).uri(out_uri);
    *out_req_builder.headers_mut().unwrap() = out_headers;
    let out_req = out_req_builder
        .body(Full::from(body_bytes))
        .expect("valid outbound request");

    let upstream_resp = match sender.send_request(out_req).await {
        Ok(r) => r,
        Err(e) => return Ok(bad_gateway(format!("request to upstream failed: {e}"))),
    };

    let status = upstream_resp.status();
    let resp_headers = upstream_resp.headers().clone();
    let resp_body = match upstream_resp.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return Ok(bad_gateway(format!("read upstream response body: {e}"))),
    };

    let message_resp = MessageResp::build(status, &resp_headers, resp_body.to_vec());

    let (rule, matched) = ctx.rule_store.matches(&target_host, &message_req.uri);
    if ctx.rule_store.enabled && !matched {
        return Ok(write_passthrough(status, resp_headers, resp_body));
    }

    capture::log_exchange(&ctx, &message_req, &message_resp);

    match rule.option {
        RuleOption::UseLocalResponse => {
            if let Some(replaced) = try_local_response(&rule.content, status, &resp_headers).await {
                return Ok(replaced);
            }
            // File could not be opened: fall through to step 7.
        }
        RuleOption::ToRedis => {
            let message = Message::from_exchange(&message_req, &message_resp);
            capture::export_to_redis(&ctx, &message).await;
        }
        RuleOption::ToStdout => {}
    }

    Ok(write_passthrough(status, resp_headers, resp_body))
}

fn write_passthrough(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    *builder.headers_mut().unwrap() = headers;
    builder.body(Full::from(body)).unwrap()
}

/// Step 6 "use-local-response": stream the file in place of the upstream
/// body, copying upstream headers minus `Content-Length`. Returns `None`
/// if the file cannot be opened, so the caller falls back to the upstream
/// response (spec.md §4.7 step 6, §7 kind 4).
async fn try_local_response(
    path: &str,
    status: StatusCode,
    upstream_headers: &HeaderMap,
) -> Option<Response<Full<Bytes>>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) => {
            eprintln!("warning: local response file {path:?} could not be opened: {e}");
            return None;
        }
    };

    let mut contents = Vec::new();
    if let Err(e) = file.read_to_end(&mut contents).await {
        eprintln!("warning: local response file {path:?} could not be read: {e}");
        return None;
    }

    let mut headers = upstream_headers.clone();
    headers.remove(http::header::CONTENT_LENGTH);

    let mut builder = Response::builder().status(status);
    *builder.headers_mut().unwrap() = headers;
    Some(builder.body(Full::from(contents)).unwrap())
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
