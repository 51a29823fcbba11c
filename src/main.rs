use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use scrape_gateway::adapters::build_registry;
use scrape_gateway::cache::CacheStore;
use scrape_gateway::config::{load_site_profiles, Config};
use scrape_gateway::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    info!("Starting scrape gateway");
    info!(
        "Cache TTL {}s, snapshot {}, rate limit {} requests / {}ms",
        config.cache_ttl.as_secs(),
        config.snapshot_path().display(),
        config.rate_limit_max_requests,
        config.rate_limit_window.as_millis()
    );

    let profiles = load_site_profiles(&config.sites_config)?;
    let registry = build_registry(profiles, config.adapter_timeout)?;

    let cache = Arc::new(CacheStore::open(config.snapshot_path(), config.cache_ttl).await);
    let maintenance =
        cache.spawn_maintenance(config.cache_sweep_interval, config.cache_snapshot_interval);

    let state = Arc::new(AppState::new(&config, Arc::clone(&cache), registry)?);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("Scrape gateway listening on http://0.0.0.0:{}", config.port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    maintenance.shutdown().await;
    cache.close().await;
    info!("Scrape gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, saving cache");
}
