//! In-process LRU edge cache.

use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cache::{EdgeCache, EdgeEntry, EDGE_NAMESPACE};

pub const DEFAULT_MAX_ENTRIES: usize = 1000;
pub const DEFAULT_MAX_BYTES: usize = 512 * 1024 * 1024;

struct StoredEntry {
    entry: EdgeEntry,
    expires_at: Instant,
    size: usize,
}

struct Inner {
    map: LruCache<String, StoredEntry>,
    total_bytes: usize,
}

/// Recency-ordered map plus a byte counter. A `get` refreshes recency; a
/// `set` evicts from the cold end until both the entry count and the byte
/// budget hold.
pub struct MemoryEdgeCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    max_bytes: usize,
}

impl MemoryEdgeCache {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: LruCache::unbounded(),
                total_bytes: 0,
            }),
            max_entries,
            max_bytes,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_BYTES)
    }

    fn namespaced(key: &str) -> String {
        format!("{EDGE_NAMESPACE}{key}")
    }

    #[cfg(test)]
    async fn entry_count(&self) -> usize {
        self.inner.lock().await.map.len()
    }

    #[cfg(test)]
    async fn byte_count(&self) -> usize {
        self.inner.lock().await.total_bytes
    }
}

#[async_trait::async_trait]
impl EdgeCache for MemoryEdgeCache {
    async fn get(&self, key: &str) -> Option<EdgeEntry> {
        let key = Self::namespaced(key);
        let mut inner = self.inner.lock().await;
        let expired = match inner.map.get(&key) {
            Some(stored) => stored.expires_at <= Instant::now(),
            None => return None,
        };
        if expired {
            if let Some((_, stored)) = inner.map.pop_entry(&key) {
                inner.total_bytes = inner.total_bytes.saturating_sub(stored.size);
            }
            return None;
        }
        // The `get` above already promoted the entry to most-recently-used.
        inner.map.get(&key).map(|stored| stored.entry.clone())
    }

    async fn set(&self, key: &str, entry: EdgeEntry, ttl: Duration) {
        let size = entry.bytes.len();
        if size > self.max_bytes {
            debug!(key, size, "entry larger than the edge byte budget, not caching");
            return;
        }
        let key = Self::namespaced(key);
        let stored = StoredEntry {
            entry,
            expires_at: Instant::now() + ttl,
            size,
        };
        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.map.put(key, stored) {
            inner.total_bytes = inner.total_bytes.saturating_sub(old.size);
        }
        inner.total_bytes += size;
        while inner.map.len() > self.max_entries || inner.total_bytes > self.max_bytes {
            match inner.map.pop_lru() {
                Some((_, evicted)) => {
                    inner.total_bytes = inner.total_bytes.saturating_sub(evicted.size);
                }
                None => break,
            }
        }
    }

    async fn delete(&self, key: &str) {
        let key = Self::namespaced(key);
        let mut inner = self.inner.lock().await;
        if let Some((_, stored)) = inner.map.pop_entry(&key) {
            inner.total_bytes = inner.total_bytes.saturating_sub(stored.size);
        }
    }

    async fn delete_by_prefix(&self, prefix: &str) -> u64 {
        let prefix = Self::namespaced(prefix);
        let mut inner = self.inner.lock().await;
        let keys: Vec<String> = inner
            .map
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        let mut removed = 0;
        for key in keys {
            if let Some((_, stored)) = inner.map.pop_entry(&key) {
                inner.total_bytes = inner.total_bytes.saturating_sub(stored.size);
                removed += 1;
            }
        }
        removed
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
