//! Shared key-value edge cache backed by Redis.
//!
//! Every operation here is best-effort. The edge tier is an accelerator,
//! not a source of truth: when the store is unreachable, reads behave as
//! misses and writes are dropped, and the request proceeds against L3.

use std::time::Duration;

use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{EdgeCache, EdgeEntry, EDGE_NAMESPACE};

/// Sidecar value stored next to the bytes.
#[derive(Serialize, Deserialize)]
struct RedisMeta {
    content_type: String,
    cached_at: u64,
}

pub struct RedisEdgeCache {
    conn: ConnectionManager,
}

impl RedisEdgeCache {
    /// Connects to the store. Connection failures at startup are the
    /// caller's decision (the launcher falls back to the in-process cache).
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    fn data_key(key: &str) -> String {
        format!("{EDGE_NAMESPACE}{key}:data")
    }

    fn meta_key(key: &str) -> String {
        format!("{EDGE_NAMESPACE}{key}:meta")
    }
}

#[async_trait::async_trait]
impl EdgeCache for RedisEdgeCache {
    async fn get(&self, key: &str) -> Option<EdgeEntry> {
        let mut conn = self.conn.clone();
        let keys = [Self::data_key(key), Self::meta_key(key)];
        let values: Vec<Option<Vec<u8>>> = match conn.mget(&keys).await {
            Ok(v) => v,
            Err(e) => {
                warn!(key, error = %e, "edge cache read failed, treating as miss");
                return None;
            }
        };
        let data = values.first().cloned().flatten()?;
        let meta = values
            .get(1)
            .cloned()
            .flatten()
            .and_then(|raw| serde_json::from_slice::<RedisMeta>(&raw).ok())
            .unwrap_or(RedisMeta {
                content_type: "application/octet-stream".into(),
                cached_at: 0,
            });
        Some(EdgeEntry {
            bytes: Bytes::from(data),
            content_type: meta.content_type,
            cached_at: meta.cached_at,
        })
    }

    async fn set(&self, key: &str, entry: EdgeEntry, ttl: Duration) {
        let meta = RedisMeta {
            content_type: entry.content_type.clone(),
            cached_at: entry.cached_at,
        };
        let meta_raw = match serde_json::to_vec(&meta) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "edge cache metadata serialisation failed");
                return;
            }
        };
        let ttl_secs = ttl.as_secs().max(1);
        let mut conn = self.conn.clone();
        let result: Result<(), redis::RedisError> = redis::pipe()
            .set_ex(Self::data_key(key), entry.bytes.as_ref(), ttl_secs)
            .ignore()
            .set_ex(Self::meta_key(key), meta_raw, ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(key, error = %e, "edge cache write failed, entry dropped");
        }
    }

    async fn delete(&self, key: &str) {
        let mut conn = self.conn.clone();
        let keys = [Self::data_key(key), Self::meta_key(key)];
        if let Err(e) = conn.del::<_, ()>(&keys).await {
            warn!(key, error = %e, "edge cache delete failed");
        }
    }

    async fn delete_by_prefix(&self, prefix: &str) -> u64 {
        let pattern = format!("{EDGE_NAMESPACE}{prefix}*");
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let scanned: Result<(u64, Vec<String>), redis::RedisError> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await;
            let (next, keys) = match scanned {
                Ok(v) => v,
                Err(e) => {
                    warn!(prefix, error = %e, "edge cache scan failed, purge incomplete");
                    return removed;
                }
            };
            if !keys.is_empty() {
                match conn.del::<_, u64>(&keys).await {
                    Ok(n) => removed += n,
                    Err(e) => warn!(prefix, error = %e, "edge cache prefix delete failed"),
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        debug!(prefix, removed, "edge cache prefix purge complete");
        removed
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.conn.clone();
        let reply: Result<String, redis::RedisError> =
            redis::cmd("PING").query_async(&mut conn).await;
        match reply {
            Ok(reply) => reply.eq_ignore_ascii_case("pong"),
            Err(e) => {
                warn!(error = %e, "edge cache health check failed");
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
