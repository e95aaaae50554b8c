//! `to-redis` rule: a matched exchange is exported as a JSON `Message`
//! onto the `http-message-queue` Redis list (spec.md S5).

mod common;

use base64::Engine;
use freeproxy::context::ProxyContext;
use freeproxy::queue::QueueClient;
use freeproxy::rules::RuleStore;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::test]
async fn to_redis_rule_exports_matched_exchange() {
    let upstream_addr = common::spawn_upstream("exported body", "text/plain").await;
    let (redis_addr, mut pushes) = common::spawn_fake_redis().await;

    let dir = common::temp_workdir();
    let rule_path = dir.path().join("rules.yaml");
    let mut f = std::fs::File::create(&rule_path).unwrap();
    writeln!(
        f,
        "version: \"1\"\nrules:\n  - host: default\n    regex: \".*\"\n    option: to-redis\n    content: \"\"\n"
    )
    .unwrap();

    let rule_store = RuleStore::new(Some(&rule_path), None);
    assert!(rule_store.enabled);

    let queue_client = QueueClient::connect(&redis_addr.to_string())
        .await
        .expect("connect to fake redis");

    let ctx = Arc::new(ProxyContext::new(
        "127.0.0.1:0".to_string(),
        None,
        rule_store,
        0,
        Some(queue_client),
    ));

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    tokio::spawn(freeproxy::listener::serve(ctx, listener));

    let (status, body) = common::send_proxy_request(proxy_addr, upstream_addr, "/exported").await;
    assert_eq!(status, 200);
    assert_eq!(body, "exported body");

    let payload = tokio::time::timeout(Duration::from_secs(5), pushes.recv())
        .await
        .expect("redis push within timeout")
        .expect("redis push channel open");

    let exported: serde_json::Value = serde_json::from_str(&payload).expect("exported payload is JSON");
    assert_eq!(exported["status"], 200);
    assert_eq!(exported["url"], "/exported");
    assert_eq!(exported["method"], "GET");

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(exported["resp"].as_str().unwrap())
        .unwrap();
    assert_eq!(decoded, b"exported body");
}
