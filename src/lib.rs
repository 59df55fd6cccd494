use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Extension, Json, Router};
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

pub mod cache;
pub mod cache_key;
pub mod config;
pub mod error;
pub mod fetch;
pub mod pipeline;
pub mod singleflight;
pub mod storage;
pub mod transform;
pub mod upstream;
pub mod validate;

use crate::cache::EdgeCache;
use crate::config::Config;
use crate::error::{ApiError, ErrorCode, ProxyError};
use crate::pipeline::{ImagePipeline, PipelineRequest, PipelineResponse, UpstreamErrorMode};
use crate::storage::StorageBackend;
use crate::transform::params::TransformOptions;
use crate::upstream::{canonical_base_url, parse_upstream_url, strip_query};
use crate::validate::validate_url;

pub const MAX_REQUEST_ID_LENGTH: usize = 128;

/// Correlation ID attached to every request by the middleware and echoed in
/// the `x-request-id` response header and error bodies.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub struct AppState {
    pub config: Config,
    pub pipeline: ImagePipeline,
    pub storage: Arc<dyn StorageBackend>,
    pub edge: Arc<dyn EdgeCache>,
}

impl AppState {
    pub fn new(config: Config, storage: Arc<dyn StorageBackend>, edge: Arc<dyn EdgeCache>) -> Self {
        let pipeline = ImagePipeline::new(&config, storage.clone(), edge.clone());
        Self {
            config,
            pipeline,
            storage,
            edge,
        }
    }
}

/// Builds the service router with all middleware applied.
pub fn router(state: Arc<AppState>) -> Router {
    let mut cache_routes = Router::new().route("/api/v1/cache", delete(purge_handler));
    if state.config.api_keys_enabled {
        cache_routes = cache_routes.route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));
    }

    let mut app = Router::new()
        .route("/api/v1/proxy", get(proxy_handler))
        .route("/img/:workspace_id/:block_id/:filename", get(stable_path_handler))
        .route("/health", get(health_handler))
        .route("/api/v1/stats", get(stats_handler))
        .merge(cache_routes)
        .layer(cors_layer(&state.config));

    // Only add rate limiting if not disabled (useful for testing).
    if std::env::var("DISABLE_RATE_LIMIT").is_err() {
        let per_minute = state.config.rate_limit_per_minute.max(1);
        let replenish_ms = (60_000 / per_minute).max(1);
        let governor_conf = Box::new(
            GovernorConfigBuilder::default()
                .per_millisecond(replenish_ms)
                .burst_size(per_minute.min(10_000) as u32)
                .finish()
                .unwrap(),
        );
        tracing::info!(per_minute, "router configured with per-ip rate limiting");
        app = app.layer(GovernorLayer {
            config: Box::leak(governor_conf),
        });
    } else {
        tracing::info!("rate limiting disabled");
    }

    app.layer(middleware::from_fn(assign_request_id))
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    if config.cors_origins.iter().any(|origin| origin == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Accepts a client-supplied `x-request-id` (bounded length) or generates
/// one, and echoes it on the response.
async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LENGTH)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request.extensions_mut().insert(RequestId(request_id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let authorised = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|key| state.config.api_keys.contains(key))
        .unwrap_or(false);
    if !authorised {
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .map(|r| r.0.clone())
            .unwrap_or_default();
        return ApiError::new(
            ProxyError::new(401, ErrorCode::ApiKeyInvalid, "missing or invalid api key"),
            request_id,
        )
        .into_response();
    }
    next.run(request).await
}

async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let url = match params.get("url") {
        Some(url) => url.clone(),
        None => {
            return ApiError::new(
                ProxyError::new(400, ErrorCode::MissingUrl, "url query parameter is required"),
                request_id.0,
            )
            .into_response()
        }
    };
    if let Err(e) = validate_url(&url, &state.config.allowed_domains) {
        tracing::warn!(url = %url, code = e.code.as_str(), "rejected proxy request");
        return ApiError::new(e, request_id.0).into_response();
    }

    let parsed = parse_upstream_url(&url);
    let cache_base_url = parsed
        .as_ref()
        .map(|p| p.base_url.clone())
        .unwrap_or_else(|| strip_query(&url).to_string());
    let request = PipelineRequest {
        upstream_url: url,
        cache_base_url,
        options: TransformOptions::from_query(&params),
        accept: accept_header(&headers),
        workspace_id: parsed.as_ref().map(|p| p.workspace_id.clone()),
        block_id: parsed.as_ref().map(|p| p.block_id.clone()),
        error_mode: UpstreamErrorMode::Relay,
    };

    match state.pipeline.process(request).await {
        Ok(response) => image_response(response, state.config.edge_cache_ttl_seconds),
        Err(e) => ApiError::new(e, request_id.0).into_response(),
    }
}

async fn stable_path_handler(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path((workspace_id, block_id, filename)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let base_url = canonical_base_url(
        &state.config.canonical_upstream_host,
        &workspace_id,
        &block_id,
        &filename,
    );
    let request = PipelineRequest {
        upstream_url: base_url.clone(),
        cache_base_url: base_url,
        options: TransformOptions::from_query(&params),
        accept: accept_header(&headers),
        workspace_id: Some(workspace_id),
        block_id: Some(block_id),
        error_mode: UpstreamErrorMode::CacheMiss,
    };

    match state.pipeline.process(request).await {
        Ok(response) => image_response(response, state.config.edge_cache_ttl_seconds),
        Err(e) => ApiError::new(e, request_id.0).into_response(),
    }
}

async fn purge_handler(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if params.contains_key("page_id") {
        return ApiError::new(
            ProxyError::new(
                501,
                ErrorCode::NotImplemented,
                "purge by page_id is not implemented; purge by url instead",
            ),
            request_id.0,
        )
        .into_response();
    }
    let url = match params.get("url") {
        Some(url) => url,
        None => {
            return ApiError::new(
                ProxyError::new(400, ErrorCode::MissingParams, "url query parameter is required"),
                request_id.0,
            )
            .into_response()
        }
    };
    let base_url = parse_upstream_url(url)
        .map(|p| p.base_url)
        .unwrap_or_else(|| strip_query(url).to_string());

    match state.pipeline.purge(&base_url).await {
        Ok(purged) => (
            StatusCode::OK,
            Json(serde_json::json!({ "purged": purged })),
        )
            .into_response(),
        Err(e) => ApiError::new(e, request_id.0).into_response(),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let storage_healthy = state.storage.health_check().await;
    let cache_healthy = state.edge.health_check().await;
    // A degraded edge cache is tolerated; a broken persistent store is not.
    let status = if storage_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if storage_healthy { "ok" } else { "degraded" },
        "storage": { "name": state.storage.name(), "healthy": storage_healthy },
        "cache": { "name": state.edge.name(), "healthy": cache_healthy },
    });
    (status, Json(body)).into_response()
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "storage": state.storage.name(),
            "cache": state.edge.name(),
        })),
    )
        .into_response()
}

fn accept_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn image_response(response: PipelineResponse, edge_ttl_seconds: u64) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&response.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(response.bytes.len() as u64));
    let cache_control = format!(
        "public, max-age=3600, s-maxage={edge_ttl_seconds}, stale-while-revalidate=3600"
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_str(&cache_control)
            .unwrap_or_else(|_| HeaderValue::from_static("public, max-age=3600")),
    );
    headers.insert(
        "x-cache",
        HeaderValue::from_static(if response.tier.is_hit() { "HIT" } else { "MISS" }),
    );
    headers.insert(
        "x-cache-tier",
        HeaderValue::from_static(response.tier.as_header_value()),
    );
    headers.insert(
        "x-optimized-size",
        HeaderValue::from(response.bytes.len() as u64),
    );
    if let Some(original_size) = response.original_size {
        headers.insert("x-original-size", HeaderValue::from(original_size));
    }
    (headers, axum::body::Body::from(response.bytes)).into_response()
}
