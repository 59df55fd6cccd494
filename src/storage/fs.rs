//! Local-filesystem persistent store.
//!
//! Layout: `<root>/<first two key chars>/<rest, sanitised>.{bin,json}`. The
//! two-character shard keeps any one directory from growing unbounded, and
//! sanitisation maps every character outside `[A-Za-z0-9_-]` (including the
//! key's own `/`) to `_`, so a key can never escape its shard directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs;
use tracing::{debug, error, warn};

use crate::storage::{epoch_secs, ImageMetadata, StorageBackend, StorageError, StoredImage};

pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn sanitise(raw: &str) -> String {
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn shard_dir(&self, key: &str) -> PathBuf {
        let shard = Self::sanitise(&key[..key.len().min(2)]);
        self.root.join(shard)
    }

    fn file_stem(key: &str) -> String {
        Self::sanitise(if key.len() > 2 { &key[2..] } else { key })
    }

    fn paths_for(&self, key: &str) -> (PathBuf, PathBuf) {
        let dir = self.shard_dir(key);
        let stem = Self::file_stem(key);
        (dir.join(format!("{stem}.bin")), dir.join(format!("{stem}.json")))
    }

    async fn read_metadata(path: &Path, fallback_size: u64) -> ImageMetadata {
        match fs::read(path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "unreadable metadata sidecar");
                ImageMetadata::placeholder(fallback_size)
            }),
            Err(_) => ImageMetadata::placeholder(fallback_size),
        }
    }

    /// Rewrites the sidecar with updated access statistics. Detached from
    /// the read path: a failure here must never fail the read.
    fn touch(meta_path: PathBuf, mut metadata: ImageMetadata) {
        tokio::spawn(async move {
            metadata.last_accessed_at = epoch_secs();
            metadata.access_count += 1;
            match serde_json::to_vec(&metadata) {
                Ok(raw) => {
                    if let Err(e) = fs::write(&meta_path, raw).await {
                        debug!(path = %meta_path.display(), error = %e, "access-tracking update failed");
                    }
                }
                Err(e) => {
                    debug!(path = %meta_path.display(), error = %e, "access-tracking serialise failed");
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl StorageBackend for FsStorage {
    async fn get(&self, key: &str) -> Result<Option<StoredImage>, StorageError> {
        let (bin_path, meta_path) = self.paths_for(key);
        let bytes = match fs::read(&bin_path).await {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let metadata = Self::read_metadata(&meta_path, bytes.len() as u64).await;
        Self::touch(meta_path, metadata.clone());
        Ok(Some(StoredImage {
            bytes: Bytes::from(bytes),
            metadata,
        }))
    }

    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: &ImageMetadata,
    ) -> Result<(), StorageError> {
        let (bin_path, meta_path) = self.paths_for(key);
        if let Some(dir) = bin_path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let meta_raw = serde_json::to_vec(metadata)?;
        // The two files are written concurrently; atomicity across the pair
        // is not required because a reader tolerates a missing sidecar.
        let (bin_result, meta_result) =
            tokio::join!(fs::write(&bin_path, bytes), fs::write(&meta_path, meta_raw));
        bin_result?;
        meta_result?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let (bin_path, _) = self.paths_for(key);
        match fs::metadata(&bin_path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let (bin_path, meta_path) = self.paths_for(key);
        for path in [bin_path, meta_path] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        if prefix.len() < 2 {
            return Ok(0);
        }
        let dir = self.shard_dir(prefix);
        let stem_prefix = Self::file_stem(prefix);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0u64;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&stem_prefix) {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) if name.ends_with(".bin") => removed += 1,
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(prefix, removed, "filesystem prefix purge complete");
        Ok(removed)
    }

    async fn health_check(&self) -> bool {
        match fs::create_dir_all(&self.root).await {
            Ok(()) => true,
            Err(e) => {
                error!(root = %self.root.display(), error = %e, "cache directory is not writable");
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "fs"
    }
}
