use axum::{extract::State, response::Json};
use std::sync::Arc;

use crate::types::{CacheStatus, HealthResponse, SitesResponse, StatusResponse};
use crate::AppState;

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

pub async fn sites(State(state): State<Arc<AppState>>) -> Json<SitesResponse> {
    Json(SitesResponse {
        sites: state.registry.list(),
    })
}

/// Status snapshot for the admin dashboard. The entry count is taken after
/// pending cache maintenance has run, so recent writes are included.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let adapters = state.registry.list();
    let enabled_adapters = adapters.iter().filter(|a| a.enabled).count();
    Json(StatusResponse {
        status: "ok".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        cache: CacheStatus {
            entries: state.cache.sweep().await,
        },
        adapters,
        enabled_adapters,
        in_flight: state.stats.in_flight(),
        total_requests: state.stats.total_requests(),
    })
}

#[cfg(test)]
mod tests {
    use crate::cache::CacheStore;
    use crate::config::Config;
    use crate::registry::{AdapterDescriptor, AdapterRegistry, SearchProvider};
    use crate::error::AdapterError;
    use crate::{router, AppState};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Idle;

    #[async_trait]
    impl SearchProvider for Idle {
        async fn search(&self, _query: &str, _page: u32) -> Result<Value, AdapterError> {
            Err(AdapterError::Failed("idle".into()))
        }

        async fn video_details(&self, _video_id: &str) -> Result<Value, AdapterError> {
            Err(AdapterError::Failed("idle".into()))
        }
    }

    fn app_with_cache(cache: Arc<CacheStore>) -> axum::Router {
        let registry = AdapterRegistry::new([
            AdapterDescriptor::new("tube", "Tube", true, Arc::new(Idle)),
            AdapterDescriptor::new("clips", "Clips", false, Arc::new(Idle)),
        ]);
        router(Arc::new(
            AppState::new(&Config::default(), cache, registry).unwrap(),
        ))
    }

    fn app() -> axum::Router {
        app_with_cache(Arc::new(CacheStore::in_memory(Duration::from_secs(60))))
    }

    async fn get_json(uri: &str) -> (StatusCode, Value) {
        request_json(app(), uri).await
    }

    async fn request_json(app: axum::Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        let timestamp = body["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[tokio::test]
    async fn test_sites_lists_registry() {
        let (status, body) = get_json("/api/sites").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            serde_json::json!({
                "sites": [
                    { "id": "tube", "name": "Tube", "enabled": true },
                    { "id": "clips", "name": "Clips", "enabled": false },
                ]
            })
        );
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let (status, body) = get_json("/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabledAdapters"], 1);
        assert_eq!(body["adapters"].as_array().unwrap().len(), 2);
        assert_eq!(body["cache"]["entries"], 0);
        assert_eq!(body["inFlight"], 0);
        assert_eq!(body["totalRequests"], 0);
    }

    #[tokio::test]
    async fn test_status_counts_fresh_writes() {
        let cache = Arc::new(CacheStore::in_memory(Duration::from_secs(60)));
        cache.set("tube:search:cats:1", serde_json::json!({ "videos": [] })).await;
        cache.set("tube:video:7", serde_json::json!({ "id": "7" })).await;

        let (status, body) = request_json(app_with_cache(cache), "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cache"]["entries"], 2);
    }
}
