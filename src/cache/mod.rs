//! Edge cache (L2): the volatile, fast tier in front of persistent storage.

pub mod memory;
pub mod redis;

pub use memory::MemoryEdgeCache;
pub use redis::RedisEdgeCache;

use std::time::Duration;

use bytes::Bytes;

/// Key namespace shared by every edge backend, so co-tenants of a shared
/// store cannot collide with us.
pub const EDGE_NAMESPACE: &str = "imagevault:edge:";

#[derive(Debug, Clone)]
pub struct EdgeEntry {
    pub bytes: Bytes,
    pub content_type: String,
    pub cached_at: u64,
}

/// Contract for the edge tier. Reads and writes are best-effort across the
/// board: a degraded edge cache turns into misses and dropped writes, never
/// into request failures.
#[async_trait::async_trait]
pub trait EdgeCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<EdgeEntry>;

    async fn set(&self, key: &str, entry: EdgeEntry, ttl: Duration);

    async fn delete(&self, key: &str);

    /// Removes every entry whose key starts with `prefix`; returns how many
    /// were removed (0 when the backend cannot tell).
    async fn delete_by_prefix(&self, prefix: &str) -> u64;

    async fn health_check(&self) -> bool;

    fn name(&self) -> &'static str;
}

pub(crate) fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
