//! Thin wrapper around the external message queue (Redis).
//!
//! The wire protocol itself is an opaque collaborator (spec.md §1); this
//! module only owns the "acquire a connection, LPUSH" lifecycle, mirroring
//! the original's `initRedis` connection-pool setup.

use redis::AsyncCommands;

/// A cloneable handle to a Redis connection manager. Acquire-per-push is
/// sufficient (spec.md §5 "Shared resources").
#[derive(Clone)]
pub struct QueueClient {
    manager: redis::aio::ConnectionManager,
}

impl QueueClient {
    pub async fn connect(addr: &str) -> anyhow::Result<Self> {
        let url = normalize_redis_url(addr);
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(QueueClient { manager })
    }

    /// LPUSH `payload` onto `key`.
    pub async fn lpush(&self, key: &str, payload: String) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.lpush(key, payload).await?;
        Ok(())
    }
}

/// Accept either a bare `host:port` (as the CLI flag documents) or a full
/// `redis://` URL.
fn normalize_redis_url(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("redis://{addr}")
    }
}
