use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::util::ServiceExt; // for `oneshot`

use imagevault::cache::{EdgeCache, MemoryEdgeCache};
use imagevault::cache_key::cache_key;
use imagevault::config::Config;
use imagevault::storage::{FsStorage, ImageMetadata, StorageBackend, StoredImage};
use imagevault::transform::params::TransformOptions;
use imagevault::upstream::canonical_base_url;
use imagevault::{router, AppState};

/// Builds an app over a scratch filesystem store and the in-process edge
/// cache. Rate limiting is disabled so tests can hammer the router.
fn test_state(dir: &std::path::Path) -> Arc<AppState> {
    std::env::set_var("DISABLE_RATE_LIMIT", "1");
    let config = Config {
        cache_dir: dir.to_path_buf(),
        upstream_timeout_ms: 3000,
        ..Config::default()
    };
    let storage: Arc<dyn StorageBackend> = Arc::new(FsStorage::new(dir));
    let edge: Arc<dyn EdgeCache> = Arc::new(MemoryEdgeCache::with_defaults());
    Arc::new(AppState::new(config, storage, edge))
}

async fn get(state: Arc<AppState>, uri: &str) -> axum::response::Response {
    router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn tiny_png() -> Vec<u8> {
    let img = image::DynamicImage::new_rgb8(4, 4);
    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();
    png
}

/// Seeds the persistent store with the original variant of a stable-path
/// image, the way a prior signed-URL proxy request would have.
async fn seed_stable_path(state: &AppState, workspace: &str, block: &str, filename: &str) -> Vec<u8> {
    let base_url = canonical_base_url(
        &state.config.canonical_upstream_host,
        workspace,
        block,
        filename,
    );
    let key = cache_key(&base_url, &TransformOptions::default());
    let png = tiny_png();
    let metadata = ImageMetadata {
        original_url: base_url,
        content_type: "image/png".into(),
        original_size: png.len() as u64,
        cached_size: png.len() as u64,
        width: Some(4),
        height: Some(4),
        workspace_id: Some(workspace.into()),
        block_id: Some(block.into()),
        cached_at: 1,
        last_accessed_at: 1,
        access_count: 0,
    };
    state.storage.put(&key, &png, &metadata).await.unwrap();
    png
}

#[tokio::test]
async fn proxy_without_url_is_missing_url() {
    let dir = tempfile::tempdir().unwrap();
    let response = get(test_state(dir.path()), "/api/v1/proxy").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "MISSING_URL");
    assert!(body["error"]["requestId"].as_str().is_some());
}

#[tokio::test]
async fn proxy_rejects_non_https() {
    let dir = tempfile::tempdir().unwrap();
    let response = get(
        test_state(dir.path()),
        "/api/v1/proxy?url=http%3A%2F%2Fprod-files-secure.s3.us-west-2.amazonaws.com%2Fa%2Fb%2Fc.png",
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], "HTTPS_REQUIRED");
}

#[tokio::test]
async fn proxy_rejects_disallowed_domains() {
    let dir = tempfile::tempdir().unwrap();
    let response = get(
        test_state(dir.path()),
        "/api/v1/proxy?url=https%3A%2F%2Fevil.example%2Fcat.png",
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"]["code"], "DOMAIN_NOT_ALLOWED");
}

#[tokio::test]
async fn proxy_rejects_private_hosts() {
    let dir = tempfile::tempdir().unwrap();
    let response = get(
        test_state(dir.path()),
        "/api/v1/proxy?url=https%3A%2F%2F127.0.0.1%2Fcat.png",
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"]["code"], "PRIVATE_HOST");
}

#[tokio::test]
async fn proxy_rejects_overlong_urls() {
    let dir = tempfile::tempdir().unwrap();
    let padding = "a".repeat(4097);
    let response = get(
        test_state(dir.path()),
        &format!("/api/v1/proxy?url=https%3A%2F%2Fx.example%2F{padding}"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], "URL_TOO_LONG");
}

#[tokio::test]
async fn stable_path_without_cached_bytes_is_image_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let response = get(test_state(dir.path()), "/img/w1/b1/photo.jpg").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "IMAGE_NOT_CACHED");
}

#[tokio::test]
async fn stable_path_serves_seeded_bytes_from_l3_then_l2() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    let png = seed_stable_path(&state, "w1", "b1", "photo.png").await;

    let response = get(state.clone(), "/img/w1/b1/photo.png").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-cache"], "HIT");
    assert_eq!(response.headers()["x-cache-tier"], "L3_PERSISTENT");
    assert_eq!(response.headers()["content-type"], "image/png");
    assert!(response.headers().get("x-original-size").is_none());
    let cache_control = response.headers()["cache-control"].to_str().unwrap();
    assert!(cache_control.contains("public"));
    assert!(cache_control.contains("s-maxage=3600"));
    assert!(cache_control.contains("stale-while-revalidate=3600"));
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], &png[..]);

    // The L3 hit backfills the edge cache; the replay is an L2 hit.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let replay = get(state, "/img/w1/b1/photo.png").await;
    assert_eq!(replay.status(), StatusCode::OK);
    assert_eq!(replay.headers()["x-cache"], "HIT");
    assert_eq!(replay.headers()["x-cache-tier"], "L2_EDGE");
}

#[tokio::test]
async fn invalid_transform_params_are_silently_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    seed_stable_path(&state, "w2", "b2", "photo.png").await;

    // Only the original variant is cached; junk directives must resolve to
    // it rather than miss on a bogus variant key.
    let response = get(
        state,
        "/img/w2/b2/photo.png?w=abc&h=-3&q=999&fmt=xyz&fit=stretch",
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-cache"], "HIT");
}

#[tokio::test]
async fn purge_removes_every_variant_and_misses_after() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    seed_stable_path(&state, "w3", "b3", "photo.png").await;
    let base_url = canonical_base_url(
        &state.config.canonical_upstream_host,
        "w3",
        "b3",
        "photo.png",
    );

    // Warm both tiers.
    let first = get(state.clone(), "/img/w3/b3/photo.png").await;
    assert_eq!(first.status(), StatusCode::OK);

    let encoded = urlencode(&base_url);
    let response = router(state.clone())
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/cache?url={encoded}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["purged"], 1);

    let after = get(state, "/img/w3/b3/photo.png").await;
    assert_eq!(after.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(after).await["error"]["code"], "IMAGE_NOT_CACHED");
}

#[tokio::test]
async fn purge_by_page_id_is_not_implemented() {
    let dir = tempfile::tempdir().unwrap();
    let response = router(test_state(dir.path()))
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/cache?page_id=abc123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    assert_eq!(json_body(response).await["error"]["code"], "NOT_IMPLEMENTED");
}

#[tokio::test]
async fn purge_without_parameters_is_missing_params() {
    let dir = tempfile::tempdir().unwrap();
    let response = router(test_state(dir.path()))
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/cache")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], "MISSING_PARAMS");
}

#[tokio::test]
async fn health_reports_subsystem_probes() {
    let dir = tempfile::tempdir().unwrap();
    let response = get(test_state(dir.path()), "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storage"]["name"], "fs");
    assert_eq!(body["storage"]["healthy"], true);
    assert_eq!(body["cache"]["name"], "memory");
}

#[tokio::test]
async fn stats_reports_backend_names() {
    let dir = tempfile::tempdir().unwrap();
    let response = get(test_state(dir.path()), "/api/v1/stats").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["storage"], "fs");
    assert_eq!(body["cache"], "memory");
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let dir = tempfile::tempdir().unwrap();
    let response = get(test_state(dir.path()), "/health").await;
    let request_id = response.headers()["x-request-id"].to_str().unwrap();
    assert!(!request_id.is_empty());
}

#[tokio::test]
async fn client_supplied_request_ids_are_echoed() {
    let dir = tempfile::tempdir().unwrap();
    let response = router(test_state(dir.path()))
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "trace-me-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()["x-request-id"], "trace-me-42");
}

#[tokio::test]
async fn oversized_request_ids_are_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let supplied = "x".repeat(200);
    let response = router(test_state(dir.path()))
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", &supplied)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_ne!(response.headers()["x-request-id"], supplied.as_str());
}

#[tokio::test]
async fn purge_requires_an_api_key_when_enabled() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("DISABLE_RATE_LIMIT", "1");
    let config = Config {
        cache_dir: dir.path().to_path_buf(),
        api_keys_enabled: true,
        api_keys: ["secret-key"].into_iter().map(str::to_string).collect(),
        ..Config::default()
    };
    let storage: Arc<dyn StorageBackend> = Arc::new(FsStorage::new(dir.path()));
    let edge: Arc<dyn EdgeCache> = Arc::new(MemoryEdgeCache::with_defaults());
    let state = Arc::new(AppState::new(config, storage, edge));

    let denied = router(state.clone())
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/cache?url=https://x.example/a.png")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    // A valid key clears the gate (and then fails on its own merits).
    let allowed = router(state)
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/cache")
                .header("x-api-key", "secret-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn seeded_metadata_survives_a_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    seed_stable_path(&state, "w4", "b4", "photo.png").await;
    let base_url = canonical_base_url(
        &state.config.canonical_upstream_host,
        "w4",
        "b4",
        "photo.png",
    );
    let key = cache_key(&base_url, &TransformOptions::default());
    let StoredImage { metadata, .. } = state.storage.get(&key).await.unwrap().unwrap();
    assert_eq!(metadata.workspace_id.as_deref(), Some("w4"));
    assert_eq!(metadata.block_id.as_deref(), Some("b4"));
    assert_eq!(metadata.content_type, "image/png");
}

fn urlencode(raw: &str) -> String {
    let mut out = String::new();
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
