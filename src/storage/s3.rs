//! S3-compatible object-store backend, covering both AWS S3 and R2 (any
//! endpoint speaking the S3 API).
//!
//! Bytes are stored as the object body under `images/<key>`; the metadata
//! record rides along as string-valued custom object metadata.

use std::collections::HashMap;

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, warn};

use crate::config::{Config, StorageKind};
use crate::storage::{ImageMetadata, StorageBackend, StorageError, StoredImage};

pub const OBJECT_PREFIX: &str = "images/";
const HEALTH_PROBE_KEY: &str = "images/.health-probe";

pub struct S3Storage {
    client: Client,
    bucket: String,
    name: &'static str,
}

impl S3Storage {
    /// Builds the client from validated configuration. The config layer has
    /// already guaranteed bucket and credentials are present.
    pub async fn connect(config: &Config) -> Result<Self, StorageError> {
        let bucket = config
            .s3_bucket
            .clone()
            .ok_or_else(|| StorageError::Backend("S3_BUCKET is not configured".into()))?;
        let access_key = config
            .s3_access_key
            .clone()
            .ok_or_else(|| StorageError::Backend("S3_ACCESS_KEY is not configured".into()))?;
        let secret_key = config
            .s3_secret_key
            .clone()
            .ok_or_else(|| StorageError::Backend("S3_SECRET_KEY is not configured".into()))?;
        let region = config
            .s3_region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let credentials = Credentials::new(access_key, secret_key, None, None, "imagevault");
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(credentials)
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.s3_endpoint {
            builder = builder.endpoint_url(endpoint.clone()).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        let name = match config.storage_backend {
            StorageKind::R2 => "r2",
            _ => "s3",
        };
        Ok(Self { client, bucket, name })
    }

    fn object_key(key: &str) -> String {
        format!("{OBJECT_PREFIX}{key}")
    }

    fn metadata_to_map(metadata: &ImageMetadata) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("x-original-url".to_string(), metadata.original_url.clone());
        map.insert("x-content-type".to_string(), metadata.content_type.clone());
        map.insert(
            "x-original-size".to_string(),
            metadata.original_size.to_string(),
        );
        map.insert("x-cached-size".to_string(), metadata.cached_size.to_string());
        if let Some(width) = metadata.width {
            map.insert("x-width".to_string(), width.to_string());
        }
        if let Some(height) = metadata.height {
            map.insert("x-height".to_string(), height.to_string());
        }
        if let Some(ws) = &metadata.workspace_id {
            map.insert("x-workspace-id".to_string(), ws.clone());
        }
        if let Some(block) = &metadata.block_id {
            map.insert("x-block-id".to_string(), block.clone());
        }
        map.insert("x-cached-at".to_string(), metadata.cached_at.to_string());
        map.insert(
            "x-access-count".to_string(),
            metadata.access_count.to_string(),
        );
        map
    }

    fn metadata_from_map(
        map: Option<&HashMap<String, String>>,
        content_type: Option<&str>,
        cached_size: u64,
    ) -> ImageMetadata {
        let get = |name: &str| map.and_then(|m| m.get(name)).cloned();
        let parse = |name: &str| get(name).and_then(|v| v.parse::<u64>().ok());
        let cached_at = parse("x-cached-at").unwrap_or(0);
        ImageMetadata {
            original_url: get("x-original-url").unwrap_or_default(),
            content_type: get("x-content-type")
                .or_else(|| content_type.map(str::to_string))
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            original_size: parse("x-original-size").unwrap_or(cached_size),
            cached_size: parse("x-cached-size").unwrap_or(cached_size),
            width: get("x-width").and_then(|v| v.parse().ok()),
            height: get("x-height").and_then(|v| v.parse().ok()),
            workspace_id: get("x-workspace-id"),
            block_id: get("x-block-id"),
            cached_at,
            last_accessed_at: cached_at,
            access_count: parse("x-access-count").unwrap_or(0),
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for S3Storage {
    async fn get(&self, key: &str) -> Result<Option<StoredImage>, StorageError> {
        let object_key = Self::object_key(key);
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                    || err
                        .raw_response()
                        .map(|r| r.status().as_u16() == 404)
                        .unwrap_or(false);
                if not_found {
                    return Ok(None);
                }
                return Err(StorageError::Backend(err.to_string()));
            }
        };

        let content_type = resp.content_type().map(str::to_string);
        let object_meta = resp.metadata().cloned();
        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .into_bytes();
        let metadata = Self::metadata_from_map(
            object_meta.as_ref(),
            content_type.as_deref(),
            bytes.len() as u64,
        );
        Ok(Some(StoredImage { bytes, metadata }))
    }

    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: &ImageMetadata,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(Self::object_key(key))
            .content_type(&metadata.content_type)
            .set_metadata(Some(Self::metadata_to_map(metadata)))
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(Self::object_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(StorageError::Backend(err.to_string()))
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(Self::object_key(key))
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        let full_prefix = Self::object_key(prefix);
        let mut continuation: Option<String> = None;
        let mut removed = 0u64;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let page = request
                .send()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            let keys: Vec<String> = page
                .contents()
                .iter()
                .filter_map(|obj| obj.key().map(str::to_string))
                .collect();
            let deletes = keys.iter().map(|object_key| {
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(object_key)
                    .send()
            });
            for (object_key, result) in keys.iter().zip(futures::future::join_all(deletes).await) {
                match result {
                    Ok(_) => removed += 1,
                    Err(e) => warn!(key = %object_key, error = %e, "object delete failed during purge"),
                }
            }

            continuation = page.next_continuation_token().map(str::to_string);
            if continuation.is_none() {
                break;
            }
        }
        debug!(prefix, removed, "object-store prefix purge complete");
        Ok(removed)
    }

    async fn health_check(&self) -> bool {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(HEALTH_PROBE_KEY)
            .send()
            .await
        {
            Ok(_) => true,
            // A missing probe object still proves the bucket is reachable.
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    true
                } else {
                    warn!(bucket = %self.bucket, error = %err, "object-store health check failed");
                    false
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
