use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::{AdapterError, ApiError};
use crate::registry::{AdapterDescriptor, AdapterRegistry};
use crate::types::SearchQuery;
use crate::AppState;

/// Counters exposed on the status endpoint.
#[derive(Debug, Default)]
pub struct GatewayStats {
    in_flight: AtomicUsize,
    total: AtomicU64,
}

impl GatewayStats {
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    fn record_request(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn begin_fetch(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlight(self)
    }
}

struct InFlight<'a>(&'a GatewayStats);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Search and details keys carry distinct tags so a query such as `video`
/// can never address a details entry.
pub fn search_key(site: &str, query: &str, page: u32) -> String {
    format!("{}:search:{}:{}", site, query, page)
}

pub fn video_key(site: &str, video_id: &str) -> String {
    format!("{}:video:{}", site, video_id)
}

fn resolve<'a>(registry: &'a AdapterRegistry, site: &str) -> Result<&'a AdapterDescriptor, ApiError> {
    let descriptor = registry.lookup(site).ok_or_else(|| ApiError::NotFound {
        site: site.to_string(),
        available_sites: registry.ids(),
    })?;
    if !descriptor.enabled {
        return Err(ApiError::Disabled(site.to_string()));
    }
    Ok(descriptor)
}

/// Missing, non-numeric or zero pages fall back to the first page.
fn parse_page(raw: Option<&str>) -> u32 {
    raw.and_then(|p| p.trim().parse::<u32>().ok())
        .filter(|p| *p > 0)
        .unwrap_or(1)
}

/// Merge the `cached` flag into an object result, wrapping anything else.
fn tag_cached(value: Value, cached: bool) -> Value {
    match value {
        Value::Object(mut map) => {
            map.insert("cached".to_string(), Value::Bool(cached));
            Value::Object(map)
        }
        other => json!({ "data": other, "cached": cached }),
    }
}

async fn cached_or_fetch<F, Fut>(
    state: &AppState,
    site: &str,
    key: String,
    context: &str,
    fetch: F,
) -> Result<Json<Value>, ApiError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, AdapterError>>,
{
    if let Some(hit) = state.cache.get(&key).await {
        debug!("cache hit for {}", key);
        return Ok(Json(tag_cached(hit, true)));
    }

    let result = {
        let _in_flight = state.stats.begin_fetch();
        fetch().await
    };
    match result {
        Ok(value) => {
            state.cache.set(key, value.clone()).await;
            Ok(Json(tag_cached(value, false)))
        }
        Err(e) => {
            error!("{} failed for {}: {}", context, site, e);
            Err(ApiError::from_adapter(site, context, e))
        }
    }
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Path(site): Path<String>,
    Query(params): Query<SearchQuery>,
) -> Result<Json<Value>, ApiError> {
    state.stats.record_request();
    let adapter = resolve(&state.registry, &site)?;

    let query = params
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::Validation("Query parameter \"q\" is required".to_string()))?;
    let page = parse_page(params.page.as_deref());
    info!("Search {} for '{}' page {}", site, query, page);

    let provider = Arc::clone(&adapter.provider);
    cached_or_fetch(
        &state,
        &site,
        search_key(&site, query, page),
        "Failed to search",
        || async move { provider.search(query, page).await },
    )
    .await
}

pub async fn video_details(
    State(state): State<Arc<AppState>>,
    Path((site, video_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    state.stats.record_request();
    let adapter = resolve(&state.registry, &site)?;

    let video_id = video_id.trim();
    if video_id.is_empty() {
        return Err(ApiError::Validation("Video id is required".to_string()));
    }
    info!("Details {} for video {}", site, video_id);

    let provider = Arc::clone(&adapter.provider);
    cached_or_fetch(
        &state,
        &site,
        video_key(&site, video_id),
        "Failed to get video details",
        || async move { provider.video_details(video_id).await },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::config::Config;
    use crate::registry::SearchProvider;
    use crate::{router, AppState};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    enum Behaviour {
        Succeed,
        Block,
        Fail,
    }

    struct CountingProvider {
        calls: AtomicUsize,
        behaviour: Behaviour,
    }

    impl CountingProvider {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                behaviour,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn respond(&self, payload: Value) -> Result<Value, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Succeed => Ok(payload),
                Behaviour::Block => Err(AdapterError::blocked(
                    "geo restricted",
                    Some(json!({ "status": 451 })),
                )),
                Behaviour::Fail => Err(AdapterError::Failed("connection reset".into())),
            }
        }
    }

    #[async_trait]
    impl SearchProvider for CountingProvider {
        async fn search(&self, query: &str, page: u32) -> Result<Value, AdapterError> {
            self.respond(json!({ "query": query, "page": page, "videos": [] }))
        }

        async fn video_details(&self, video_id: &str) -> Result<Value, AdapterError> {
            self.respond(json!({ "id": video_id, "title": "clip" }))
        }
    }

    fn app_with(
        providers: Vec<(&str, bool, Arc<CountingProvider>)>,
        max_requests: u32,
    ) -> (axum::Router, Arc<AppState>) {
        let config = Config {
            rate_limit_max_requests: max_requests,
            ..Config::default()
        };
        let registry = AdapterRegistry::new(providers.into_iter().map(|(id, enabled, p)| {
            let provider: Arc<dyn SearchProvider> = p;
            AdapterDescriptor::new(id, id.to_uppercase(), enabled, provider)
        }));
        let cache = Arc::new(CacheStore::in_memory(Duration::from_secs(3600)));
        let state = Arc::new(AppState::new(&config, cache, registry).unwrap());
        (router(Arc::clone(&state)), state)
    }

    async fn get(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[test]
    fn test_cache_keys() {
        assert_eq!(search_key("tube", "cats", 2), "tube:search:cats:2");
        assert_ne!(search_key("tube", "video", 5), video_key("tube", "5"));
        assert_eq!(video_key("tube", "abc"), "tube:video:abc");
        assert_eq!(parse_page(None), 1);
        assert_eq!(parse_page(Some("3")), 3);
        assert_eq!(parse_page(Some("0")), 1);
        assert_eq!(parse_page(Some("two")), 1);
    }

    #[tokio::test]
    async fn test_unknown_site_lists_available_sites() {
        let (app, _) = app_with(
            vec![
                ("tube", true, CountingProvider::new(Behaviour::Succeed)),
                ("clips", true, CountingProvider::new(Behaviour::Succeed)),
            ],
            30,
        );
        let (status, body) = get(&app, "/api/search/doesnotexist?q=a").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Site not found");
        assert_eq!(body["availableSites"], json!(["tube", "clips"]));
    }

    #[tokio::test]
    async fn test_second_search_is_served_from_cache() {
        let provider = CountingProvider::new(Behaviour::Succeed);
        let (app, state) = app_with(vec![("tube", true, Arc::clone(&provider))], 30);

        let (status, first) = get(&app, "/api/search/tube?q=cats&page=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["cached"], false);
        assert_eq!(first["page"], 2);
        assert_eq!(provider.calls(), 1);

        let (status, second) = get(&app, "/api/search/tube?q=cats&page=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["cached"], true);
        assert_eq!(second["query"], "cats");
        assert_eq!(provider.calls(), 1);

        let (_, other_page) = get(&app, "/api/search/tube?q=cats").await;
        assert_eq!(other_page["cached"], false);
        assert_eq!(provider.calls(), 2);
        assert_eq!(state.stats.total_requests(), 3);
        assert_eq!(state.stats.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_video_details_are_cached() {
        let provider = CountingProvider::new(Behaviour::Succeed);
        let (app, state) = app_with(vec![("tube", true, Arc::clone(&provider))], 30);

        let (status, body) = get(&app, "/api/search/tube/video/abc123").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "abc123");
        assert_eq!(body["cached"], false);

        let (_, body) = get(&app, "/api/search/tube/video/abc123").await;
        assert_eq!(body["cached"], true);
        assert_eq!(provider.calls(), 1);
        assert!(state.cache.get("tube:video:abc123").await.is_some());
    }

    #[tokio::test]
    async fn test_video_query_does_not_hit_details_entry() {
        let provider = CountingProvider::new(Behaviour::Succeed);
        let (app, _) = app_with(vec![("tube", true, Arc::clone(&provider))], 30);

        let (status, details) = get(&app, "/api/search/tube/video/5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(details["id"], "5");
        assert_eq!(details["cached"], false);

        let (status, listing) = get(&app, "/api/search/tube?q=video&page=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listing["cached"], false);
        assert_eq!(listing["query"], "video");
        assert_eq!(listing["page"], 5);
        assert!(listing.get("id").is_none());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_query_and_disabled_site() {
        let provider = CountingProvider::new(Behaviour::Succeed);
        let (app, _) = app_with(
            vec![
                ("tube", true, Arc::clone(&provider)),
                ("off", false, Arc::clone(&provider)),
            ],
            30,
        );

        let (status, body) = get(&app, "/api/search/tube").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("\"q\""));

        let (status, _) = get(&app, "/api/search/tube?q=%20%20").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = get(&app, "/api/search/off?q=cats").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Site is disabled");

        let (status, _) = get(&app, "/api/search/off/video/1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_blocked_adapter_maps_to_forbidden_and_is_not_cached() {
        let provider = CountingProvider::new(Behaviour::Block);
        let (app, state) = app_with(vec![("tube", true, Arc::clone(&provider))], 30);

        let (status, body) = get(&app, "/api/search/tube?q=cats").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["message"], "geo restricted");
        assert!(body["suggestion"].is_string());
        assert_eq!(body["details"]["status"], 451);

        get(&app, "/api/search/tube?q=cats").await;
        assert_eq!(provider.calls(), 2);
        assert!(state.cache.get("tube:search:cats:1").await.is_none());
    }

    #[tokio::test]
    async fn test_generic_failure_maps_to_server_error() {
        let provider = CountingProvider::new(Behaviour::Fail);
        let (app, _) = app_with(vec![("tube", true, Arc::clone(&provider))], 30);

        let (status, body) = get(&app, "/api/search/tube/video/9").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to get video details");
        assert_eq!(body["message"], "connection reset");
        assert!(body.get("suggestion").is_none());
    }

    #[tokio::test]
    async fn test_rate_limited_requests_have_no_side_effects() {
        let provider = CountingProvider::new(Behaviour::Succeed);
        let (app, state) = app_with(vec![("tube", true, Arc::clone(&provider))], 3);

        for n in 0..3 {
            let (status, _) = get(&app, &format!("/api/search/tube?q=q{}", n)).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = get(&app, "/api/search/tube?q=late").await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "Too many requests");
        assert_eq!(provider.calls(), 3);
        assert!(state.cache.get("tube:search:late:1").await.is_none());

        let (status, _) = get(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
    }
}
