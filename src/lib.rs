pub mod adapters;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod rate_limit;
pub mod registry;
pub mod thumb;
pub mod types;

use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::gateway::GatewayStats;
use crate::rate_limit::ClientRateLimiter;
use crate::registry::AdapterRegistry;
use crate::thumb::ThumbnailProxy;

pub struct AppState {
    pub cache: Arc<CacheStore>,
    pub registry: AdapterRegistry,
    pub thumbs: ThumbnailProxy,
    pub rate_limiter: ClientRateLimiter,
    pub stats: GatewayStats,
    pub started_at: Instant,
}

// Re-export shared types for easy access
pub use types::*;

impl AppState {
    pub fn new(
        config: &Config,
        cache: Arc<CacheStore>,
        registry: AdapterRegistry,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            cache,
            registry,
            thumbs: ThumbnailProxy::new(config.thumb_allowed_hosts.clone())?,
            rate_limiter: ClientRateLimiter::new(
                config.rate_limit_window,
                config.rate_limit_max_requests,
            ),
            stats: GatewayStats::default(),
            started_at: Instant::now(),
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let search = Router::new()
        .route("/api/search/:site", get(gateway::search))
        .route("/api/search/:site/video/:video_id", get(gateway::video_details))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit::limit_clients,
        ));

    Router::new()
        .route("/health", get(health::health))
        .route("/api/sites", get(health::sites))
        .route("/api/status", get(health::status))
        .route("/api/thumb", get(thumb::proxy_thumbnail))
        .merge(search)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
