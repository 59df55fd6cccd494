//! Persistent store (L3): the durable tier that outlives upstream
//! signatures.

pub mod fs;
pub mod s3;

pub use fs::FsStorage;
pub use s3::S3Storage;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Record stored adjacent to the bytes: a JSON sidecar on the filesystem,
/// custom object metadata on an object store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub original_url: String,
    pub content_type: String,
    pub original_size: u64,
    pub cached_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    pub cached_at: u64,
    pub last_accessed_at: u64,
    pub access_count: u64,
}

impl ImageMetadata {
    /// Minimal record for bytes whose sidecar is missing or unreadable.
    pub fn placeholder(cached_size: u64) -> Self {
        Self {
            original_url: String::new(),
            content_type: "application/octet-stream".into(),
            original_size: cached_size,
            cached_size,
            width: None,
            height: None,
            workspace_id: None,
            block_id: None,
            cached_at: 0,
            last_accessed_at: 0,
            access_count: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredImage {
    pub bytes: Bytes,
    pub metadata: ImageMetadata,
}

/// Contract for the persistent tier. Unlike the edge cache, read errors
/// other than a benign not-found are surfaced to the caller: serving from a
/// half-broken store would mask real infrastructure failures.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoredImage>, StorageError>;

    async fn put(&self, key: &str, bytes: &[u8], metadata: &ImageMetadata)
        -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Removes every entry whose key starts with `prefix`; returns the
    /// number of entries removed.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, StorageError>;

    async fn health_check(&self) -> bool;

    fn name(&self) -> &'static str;
}

pub(crate) fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
