use std::net::SocketAddr;
use std::sync::Arc;

use imagevault::cache::{EdgeCache, MemoryEdgeCache, RedisEdgeCache};
use imagevault::config::{Config, StorageKind};
use imagevault::storage::{FsStorage, S3Storage, StorageBackend};
use imagevault::{router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("imagevault={},tower_http=info", config.log_level).into()
            }),
        )
        .init();

    tracing::info!("starting imagevault");

    let storage: Arc<dyn StorageBackend> = match config.storage_backend {
        StorageKind::Fs => Arc::new(FsStorage::new(config.cache_dir.clone())),
        StorageKind::S3 | StorageKind::R2 => Arc::new(S3Storage::connect(&config).await?),
    };

    let edge: Arc<dyn EdgeCache> = match &config.redis_url {
        Some(url) => match RedisEdgeCache::connect(url).await {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                tracing::warn!(error = %e, "redis unavailable, falling back to the in-process edge cache");
                Arc::new(MemoryEdgeCache::with_defaults())
            }
        },
        None => Arc::new(MemoryEdgeCache::with_defaults()),
    };

    tracing::info!(
        storage = storage.name(),
        cache = edge.name(),
        "backends initialised"
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let state = Arc::new(AppState::new(config, storage, edge));
    let app = router(state);

    tracing::info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
