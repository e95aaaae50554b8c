//! Message Capture (C3): canonical request/response records and export.

use base64::Engine;
use http::{HeaderMap, Method, StatusCode, Uri};
use serde::Serialize;
use std::collections::HashMap;

use crate::context::ProxyContext;

/// Flatten a header map to first-value-per-name, matching the original's
/// `dumpReq`/`dumpResp` (spec.md §4.3 "Request dump"/"Response dump").
pub fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for name in headers.keys() {
        if out.contains_key(name.as_str()) {
            continue;
        }
        if let Some(value) = headers.get(name) {
            if let Ok(v) = value.to_str() {
                out.insert(name.as_str().to_string(), v.to_string());
            }
        }
    }
    out
}

/// Intermediate record for a captured request.
pub struct MessageReq {
    pub method: String,
    pub uri: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl MessageReq {
    /// Build from method/uri/headers/body already pulled off the wire.
    /// `Host` is added explicitly when `uri` is not an absolute-form URI,
    /// matching the original's check for an `http://`/`https://` prefix.
    pub fn build(method: &Method, uri: &Uri, host: &str, headers: &HeaderMap, body: Vec<u8>) -> Self {
        let mut flat = flatten_headers(headers);
        let is_absolute = uri.scheme().is_some();
        if !is_absolute {
            flat.insert("Host".to_string(), host.to_string());
        }

        let method_str = if method.as_str().is_empty() {
            "GET".to_string()
        } else {
            method.to_string()
        };

        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        MessageReq {
            method: method_str,
            uri: path_and_query,
            headers: flat,
            body,
        }
    }
}

/// Intermediate record for a captured response.
pub struct MessageResp {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl MessageResp {
    /// Body is captured only when a `Content-Type` header contains `text`
    /// (case-insensitive substring, spec.md invariant (iv)); otherwise the
    /// body argument is ignored and an empty body is recorded.
    pub fn build(status: StatusCode, headers: &HeaderMap, body: Vec<u8>) -> Self {
        let flat = flatten_headers(headers);
        let captured = if should_capture_body(headers) {
            body
        } else {
            Vec::new()
        };
        MessageResp {
            status: status.as_u16(),
            headers: flat,
            body: captured,
        }
    }
}

/// Whether a response body should be captured, per invariant (iv): any
/// header named case-insensitively `Content-Type` whose value contains
/// the substring `text`.
pub fn should_capture_body(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("text"))
        .unwrap_or(false)
}

/// JSON export record (spec.md §3 "Message (export record)").
#[derive(Serialize)]
pub struct Message {
    pub url: String,
    pub method: String,
    #[serde(rename = "req-header")]
    pub req_header: HashMap<String, String>,
    #[serde(rename = "rsp-header")]
    pub rsp_header: HashMap<String, String>,
    pub req: String,
    pub resp: String,
    pub status: u16,
}

impl Message {
    pub fn from_exchange(req: &MessageReq, resp: &MessageResp) -> Self {
        let b64 = base64::engine::general_purpose::STANDARD;
        Message {
            url: req.uri.clone(),
            method: req.method.clone(),
            req_header: req.headers.clone(),
            rsp_header: resp.headers.clone(),
            req: b64.encode(&req.body),
            resp: b64.encode(&resp.body),
            status: resp.status,
        }
    }

    /// Build a WebSocket export record: status fixed at 206, `resp` carries
    /// the base64 frame payload, `req` is empty (spec.md §4.8).
    pub fn from_ws_frame(req: &MessageReq, payload: &[u8]) -> Self {
        let b64 = base64::engine::general_purpose::STANDARD;
        Message {
            url: req.uri.clone(),
            method: req.method.clone(),
            req_header: req.headers.clone(),
            rsp_header: HashMap::new(),
            req: String::new(),
            resp: b64.encode(payload),
            status: 206,
        }
    }
}

/// Push a Message onto the `http-message-queue` Redis list (spec.md §4.3
/// "Export"). Logs a warning instead of failing the caller's session when
/// no queue is configured or the push itself errors (spec.md §7 kind 6).
pub async fn export_to_redis(ctx: &ProxyContext, message: &Message) {
    let Some(redis_client) = ctx.redis_client() else {
        println!("warning: to-redis rule matched but no redis found");
        return;
    };

    let payload = match serde_json::to_string(message) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: failed to serialize message for export: {e}");
            return;
        }
    };

    if let Err(e) = redis_client.lpush("http-message-queue", payload).await {
        eprintln!("error: redis lpush failed: {e}");
    }
}

/// Stdout protocol trace, governed by `ctx.log_level` (spec.md §4.3
/// "Stdout log", levels 0..3).
pub fn log_exchange(ctx: &ProxyContext, req: &MessageReq, resp: &MessageResp) {
    if ctx.log_level < 1 {
        return;
    }
    println!("---------------");
    println!("> {} {}", req.method, req.uri);
    println!("< {}", resp.status);

    if ctx.log_level >= 2 {
        for (k, v) in &req.headers {
            println!("> {k}: {v}");
        }
        for (k, v) in &resp.headers {
            println!("< {k}: {v}");
        }
    }

    if ctx.log_level >= 3 {
        println!("> {}", String::from_utf8_lossy(&req.body));
        println!("< {}", String::from_utf8_lossy(&resp.body));
    }
}

/// Stdout trace for a single WebSocket frame (upstream -> client direction
/// only, per spec.md §4.8).
pub fn log_ws_frame(ctx: &ProxyContext, req: &MessageReq, payload: &[u8]) {
    if ctx.log_level < 1 {
        return;
    }
    println!("---------------");
    println!("> {} {} (ws)", req.method, req.uri);

    if ctx.log_level >= 2 {
        for (k, v) in &req.headers {
            println!("> {k}: {v}");
        }
    }

    if ctx.log_level >= 3 {
        println!("< {}", String::from_utf8_lossy(payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn capture_gated_on_text_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        assert!(should_capture_body(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("image/png"),
        );
        assert!(!should_capture_body(&headers));
    }

    #[test]
    fn message_resp_drops_binary_body() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        let resp = MessageResp::build(StatusCode::OK, &headers, vec![1, 2, 3]);
        assert!(resp.body.is_empty());
    }

    #[test]
    fn message_export_base64_round_trips() {
        let req = MessageReq {
            method: "GET".into(),
            uri: "/x".into(),
            headers: HashMap::new(),
            body: Vec::new(),
        };
        let resp = MessageResp {
            status: 200,
            headers: HashMap::new(),
            body: b"hello".to_vec(),
        };
        let msg = Message::from_exchange(&req, &resp);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&msg.resp)
            .unwrap();
        assert_eq!(decoded, b"hello");
        assert_eq!(msg.status, 200);
        assert_eq!(msg.method, "GET");
    }
}
