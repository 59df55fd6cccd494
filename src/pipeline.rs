//! Request pipeline: the one component that sees every tier.
//!
//! Probe order is fixed: edge cache, then persistent store, then the
//! upstream origin behind the single-flight coordinator. Cache writes after
//! an origin fetch are detached tasks; the response never waits on them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::cache::{epoch_secs, EdgeCache, EdgeEntry};
use crate::cache_key::{cache_key, cache_prefix};
use crate::config::Config;
use crate::error::{ErrorCode, ProxyError};
use crate::fetch::{build_client, fetch_image};
use crate::singleflight::FlightGroup;
use crate::storage::{ImageMetadata, StorageBackend};
use crate::transform;
use crate::transform::params::TransformOptions;

/// Which tier produced the response bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    L2Edge,
    L3Persistent,
    Origin,
}

impl CacheTier {
    pub fn as_header_value(&self) -> &'static str {
        match self {
            CacheTier::L2Edge => "L2_EDGE",
            CacheTier::L3Persistent => "L3_PERSISTENT",
            CacheTier::Origin => "ORIGIN",
        }
    }

    pub fn is_hit(&self) -> bool {
        !matches!(self, CacheTier::Origin)
    }
}

/// How fetcher errors surface to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorMode {
    /// Return the fetcher's error verbatim with its HTTP status.
    Relay,
    /// Rewrite upstream 403/404/502 into `404 IMAGE_NOT_CACHED`. Used by
    /// the stable-path route, which cannot produce a signed upstream URL
    /// and so cannot expect a cold fetch to succeed.
    CacheMiss,
}

pub struct PipelineRequest {
    pub upstream_url: String,
    /// Identity for cache keying: the upstream URL stripped of its query
    /// string, or the reconstructed canonical URL for stable-path requests.
    pub cache_base_url: String,
    pub options: TransformOptions,
    pub accept: Option<String>,
    pub workspace_id: Option<String>,
    pub block_id: Option<String>,
    pub error_mode: UpstreamErrorMode,
}

#[derive(Debug)]
pub struct PipelineResponse {
    pub bytes: Bytes,
    pub content_type: String,
    pub tier: CacheTier,
    /// Upstream byte count before optimisation; present only on origin
    /// responses.
    pub original_size: Option<u64>,
}

/// Outcome shared between the single-flight leader and its followers.
pub struct OriginOutcome {
    bytes: Bytes,
    content_type: String,
    original_size: u64,
}

pub struct ImagePipeline {
    edge: Arc<dyn EdgeCache>,
    storage: Arc<dyn StorageBackend>,
    flights: FlightGroup<OriginOutcome>,
    client: reqwest::Client,
    allowed_hosts: Arc<HashSet<String>>,
    upstream_timeout_ms: u64,
    max_image_size_bytes: usize,
    edge_ttl: Duration,
}

impl ImagePipeline {
    pub fn new(
        config: &Config,
        storage: Arc<dyn StorageBackend>,
        edge: Arc<dyn EdgeCache>,
    ) -> Self {
        Self {
            edge,
            storage,
            flights: FlightGroup::new(),
            client: build_client(),
            allowed_hosts: Arc::new(config.allowed_domains.clone()),
            upstream_timeout_ms: config.upstream_timeout_ms,
            max_image_size_bytes: config.max_image_size_bytes,
            edge_ttl: Duration::from_secs(config.edge_cache_ttl_seconds),
        }
    }

    pub async fn process(&self, request: PipelineRequest) -> Result<PipelineResponse, ProxyError> {
        let options = request
            .options
            .clone()
            .negotiated(request.accept.as_deref())
            .normalise();
        let key = cache_key(&request.cache_base_url, &options);

        if let Some(entry) = self.edge.get(&key).await {
            debug!(key = %key, "edge cache hit");
            return Ok(PipelineResponse {
                bytes: entry.bytes,
                content_type: entry.content_type,
                tier: CacheTier::L2Edge,
                original_size: None,
            });
        }

        match self.storage.get(&key).await {
            Ok(Some(stored)) => {
                debug!(key = %key, "persistent store hit, backfilling edge cache");
                self.spawn_edge_write(key.clone(), stored.bytes.clone(), stored.metadata.content_type.clone());
                return Ok(PipelineResponse {
                    bytes: stored.bytes,
                    content_type: stored.metadata.content_type,
                    tier: CacheTier::L3Persistent,
                    original_size: None,
                });
            }
            Ok(None) => {}
            Err(e) => {
                error!(key = %key, error = %e, "persistent store read failed");
                return Err(ProxyError::internal(format!(
                    "persistent store read failed: {e}"
                )));
            }
        }

        let work = self.origin_work(key.clone(), &request, options);
        let (outcome, was_leader) = self.flights.run(&key, work).await;
        match outcome {
            Ok(origin) => {
                if was_leader {
                    Ok(PipelineResponse {
                        bytes: origin.bytes.clone(),
                        content_type: origin.content_type.clone(),
                        tier: CacheTier::Origin,
                        original_size: Some(origin.original_size),
                    })
                } else {
                    // Followers received the leader's in-memory result; to
                    // the client that is indistinguishable from an edge hit.
                    Ok(PipelineResponse {
                        bytes: origin.bytes.clone(),
                        content_type: origin.content_type.clone(),
                        tier: CacheTier::L2Edge,
                        original_size: None,
                    })
                }
            }
            Err(err) => Err(map_upstream_error((*err).clone(), request.error_mode)),
        }
    }

    /// Purges every variant of `base_url` from both cache tiers; returns the
    /// number of persistent entries removed.
    pub async fn purge(&self, base_url: &str) -> Result<u64, ProxyError> {
        let prefix = cache_prefix(base_url);
        self.edge.delete_by_prefix(&prefix).await;
        match self.storage.delete_by_prefix(&prefix).await {
            Ok(removed) => {
                debug!(prefix = %prefix, removed, "purged cached variants");
                Ok(removed)
            }
            Err(e) => {
                error!(prefix = %prefix, error = %e, "prefix purge failed");
                Err(ProxyError::new(
                    500,
                    ErrorCode::PurgeFailed,
                    format!("purge failed: {e}"),
                ))
            }
        }
    }

    /// The leader's work: fetch, optimise, synthesise metadata, and kick off
    /// the detached cache writes.
    fn origin_work(
        &self,
        key: String,
        request: &PipelineRequest,
        options: TransformOptions,
    ) -> impl std::future::Future<Output = Result<OriginOutcome, ProxyError>> + Send + 'static {
        let client = self.client.clone();
        let edge = self.edge.clone();
        let storage = self.storage.clone();
        let allowed_hosts = self.allowed_hosts.clone();
        let timeout_ms = self.upstream_timeout_ms;
        let max_size = self.max_image_size_bytes;
        let edge_ttl = self.edge_ttl;
        let upstream_url = request.upstream_url.clone();
        let cache_base_url = request.cache_base_url.clone();
        let workspace_id = request.workspace_id.clone();
        let block_id = request.block_id.clone();

        async move {
            let fetched =
                fetch_image(&client, &upstream_url, timeout_ms, max_size, &allowed_hosts).await?;

            let optimize_input = fetched.bytes.clone();
            let optimize_options = options.clone();
            let optimized = tokio::task::spawn_blocking(move || {
                transform::optimize(&optimize_input, &optimize_options)
            })
            .await;

            let (bytes, content_type, width, height) = match optimized {
                Ok(Ok(optimized)) => (
                    optimized.bytes,
                    optimized.content_type.to_string(),
                    Some(optimized.width),
                    Some(optimized.height),
                ),
                Ok(Err(e)) => {
                    warn!(url = %upstream_url, error = %e, "optimizer failed, serving original bytes");
                    (fetched.bytes.clone(), fetched.content_type.clone(), None, None)
                }
                Err(e) => {
                    warn!(url = %upstream_url, error = %e, "optimizer task aborted, serving original bytes");
                    (fetched.bytes.clone(), fetched.content_type.clone(), None, None)
                }
            };

            let now = epoch_secs();
            let metadata = ImageMetadata {
                original_url: cache_base_url,
                content_type: content_type.clone(),
                original_size: fetched.original_size,
                cached_size: bytes.len() as u64,
                width,
                height,
                workspace_id,
                block_id,
                cached_at: now,
                last_accessed_at: now,
                access_count: 0,
            };

            // Detached writes: the client already has its bytes in hand, so
            // neither tier write may delay or fail the response.
            {
                let storage = storage.clone();
                let key = key.clone();
                let bytes = bytes.clone();
                let metadata = metadata.clone();
                tokio::spawn(async move {
                    if let Err(e) = storage.put(&key, &bytes, &metadata).await {
                        error!(
                            key = %key,
                            error = %e,
                            degradation = "infrastructure_degraded",
                            "persistent store write failed"
                        );
                    }
                });
            }
            {
                let edge = edge.clone();
                let key = key.clone();
                let entry = EdgeEntry {
                    bytes: bytes.clone(),
                    content_type: content_type.clone(),
                    cached_at: now,
                };
                tokio::spawn(async move {
                    edge.set(&key, entry, edge_ttl).await;
                });
            }

            Ok(OriginOutcome {
                bytes,
                content_type,
                original_size: fetched.original_size,
            })
        }
    }

    fn spawn_edge_write(&self, key: String, bytes: Bytes, content_type: String) {
        let edge = self.edge.clone();
        let ttl = self.edge_ttl;
        tokio::spawn(async move {
            let entry = EdgeEntry {
                bytes,
                content_type,
                cached_at: epoch_secs(),
            };
            edge.set(&key, entry, ttl).await;
        });
    }

    pub fn edge(&self) -> &Arc<dyn EdgeCache> {
        &self.edge
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }
}

fn map_upstream_error(err: ProxyError, mode: UpstreamErrorMode) -> ProxyError {
    match mode {
        UpstreamErrorMode::Relay => err,
        UpstreamErrorMode::CacheMiss => match err.status {
            403 | 404 | 502 => ProxyError::new(
                404,
                ErrorCode::ImageNotCached,
                "image is not cached; request it once through /api/v1/proxy with the signed upstream url to prime the cache",
            ),
            _ => err,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryEdgeCache;
    use crate::storage::FsStorage;
    use crate::transform::params::OutputFormat;

    fn pipeline_with_tempdir(dir: &std::path::Path) -> ImagePipeline {
        let config = Config {
            upstream_timeout_ms: 3000,
            ..Config::default()
        };
        let storage: Arc<dyn StorageBackend> = Arc::new(FsStorage::new(dir));
        let edge: Arc<dyn EdgeCache> = Arc::new(MemoryEdgeCache::with_defaults());
        ImagePipeline::new(&config, storage, edge)
    }

    fn seeded_metadata(content_type: &str, size: u64) -> ImageMetadata {
        ImageMetadata {
            original_url: "https://prod-files-secure.s3.us-west-2.amazonaws.com/w/b/f.png".into(),
            content_type: content_type.into(),
            original_size: size,
            cached_size: size,
            width: None,
            height: None,
            workspace_id: Some("w".into()),
            block_id: Some("b".into()),
            cached_at: 1,
            last_accessed_at: 1,
            access_count: 0,
        }
    }

    fn request_for(base: &str) -> PipelineRequest {
        PipelineRequest {
            upstream_url: base.to_string(),
            cache_base_url: base.to_string(),
            options: TransformOptions::default(),
            accept: None,
            workspace_id: None,
            block_id: None,
            error_mode: UpstreamErrorMode::CacheMiss,
        }
    }

    const BASE: &str = "https://prod-files-secure.s3.us-west-2.amazonaws.com/w/b/f.png";

    #[tokio::test]
    async fn l3_hit_backfills_l2() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with_tempdir(dir.path());

        let key = cache_key(BASE, &TransformOptions::default());
        pipeline
            .storage()
            .put(&key, b"imgbytes", &seeded_metadata("image/png", 8))
            .await
            .unwrap();

        let first = pipeline.process(request_for(BASE)).await.unwrap();
        assert_eq!(first.tier, CacheTier::L3Persistent);
        assert_eq!(&first.bytes[..], b"imgbytes");
        assert_eq!(first.content_type, "image/png");
        assert!(first.original_size.is_none());

        // Give the detached backfill a moment, then the edge serves it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = pipeline.process(request_for(BASE)).await.unwrap();
        assert_eq!(second.tier, CacheTier::L2Edge);
        assert_eq!(&second.bytes[..], b"imgbytes");
    }

    #[tokio::test]
    async fn variants_are_cached_independently() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with_tempdir(dir.path());

        let original_key = cache_key(BASE, &TransformOptions::default());
        pipeline
            .storage()
            .put(&original_key, b"orig", &seeded_metadata("image/png", 4))
            .await
            .unwrap();

        // The original variant resolves; a webp variant of the same image
        // is still a miss.
        assert!(pipeline.process(request_for(BASE)).await.is_ok());
        let mut webp_request = request_for(BASE);
        webp_request.options.format = Some(OutputFormat::Webp);
        let err = pipeline.process(webp_request).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ImageNotCached);
    }

    #[tokio::test]
    async fn purge_empties_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with_tempdir(dir.path());

        let key = cache_key(BASE, &TransformOptions::default());
        pipeline
            .storage()
            .put(&key, b"imgbytes", &seeded_metadata("image/png", 8))
            .await
            .unwrap();
        // Warm the edge via an L3 hit.
        pipeline.process(request_for(BASE)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let removed = pipeline.purge(BASE).await.unwrap();
        assert_eq!(removed, 1);

        let err = pipeline.process(request_for(BASE)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ImageNotCached);
    }

    #[tokio::test]
    async fn cache_miss_mode_rewrites_unfetchable_upstreams() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with_tempdir(dir.path());

        // Cold cache and an unsigned upstream URL: whether the upstream
        // rejects the request (403, remapped to 502) or is unreachable from
        // the test environment (FETCH_FAILED, 502), CacheMiss mode maps the
        // failure to IMAGE_NOT_CACHED.
        let err = pipeline.process(request_for(BASE)).await.unwrap_err();
        assert_eq!(err.status, 404);
        assert_eq!(err.code, ErrorCode::ImageNotCached);
    }

    #[test]
    fn relay_mode_passes_errors_through() {
        let err = ProxyError::new(502, ErrorCode::UpstreamError, "bad gateway");
        let mapped = map_upstream_error(err.clone(), UpstreamErrorMode::Relay);
        assert_eq!(mapped.code, ErrorCode::UpstreamError);

        let rewritten = map_upstream_error(err, UpstreamErrorMode::CacheMiss);
        assert_eq!(rewritten.code, ErrorCode::ImageNotCached);
        assert_eq!(rewritten.status, 404);

        // Timeouts are not rewritten: the image may exist but be slow.
        let timeout = ProxyError::new(504, ErrorCode::UpstreamTimeout, "slow");
        let kept = map_upstream_error(timeout, UpstreamErrorMode::CacheMiss);
        assert_eq!(kept.code, ErrorCode::UpstreamTimeout);
    }
}
