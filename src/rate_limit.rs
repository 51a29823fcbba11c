//! Per-client throttling for search and details traffic.
//!
//! Fixed window per client address: the first request opens a window of
//! `window` length, at most `max_requests` are admitted inside it. Windows
//! live in a `moka` cache with a matching time-to-live, so idle clients are
//! forgotten on their own.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use moka::future::Cache;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::AppState;

/// Upper bound on tracked clients; the oldest windows are dropped first.
const MAX_TRACKED_CLIENTS: u64 = 100_000;

#[derive(Debug)]
struct Window {
    opened_at: Instant,
    hits: AtomicU32,
}

impl Window {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            opened_at: Instant::now(),
            hits: AtomicU32::new(0),
        })
    }
}

pub struct ClientRateLimiter {
    windows: Cache<IpAddr, Arc<Window>>,
    window: Duration,
    max_requests: u32,
}

impl ClientRateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            windows: Cache::builder()
                .max_capacity(MAX_TRACKED_CLIENTS)
                .time_to_live(window)
                .build(),
            window,
            max_requests: max_requests.max(1),
        }
    }

    /// Count one request from `client`. On rejection returns how long until
    /// the client's window closes.
    pub async fn check(&self, client: IpAddr) -> Result<(), Duration> {
        let mut current = self.windows.get_with(client, async { Window::new() }).await;
        if current.opened_at.elapsed() >= self.window {
            // Expired but not yet evicted.
            current = Window::new();
            self.windows.insert(client, Arc::clone(&current)).await;
        }

        let seen = current.hits.fetch_add(1, Ordering::Relaxed);
        if seen < self.max_requests {
            Ok(())
        } else {
            Err(self.window.saturating_sub(current.opened_at.elapsed()))
        }
    }

    /// Clients with an open window.
    pub async fn tracked_clients(&self) -> u64 {
        self.windows.run_pending_tasks().await;
        self.windows.entry_count()
    }
}

fn client_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

/// Rejects clients over their quota before any handler runs.
pub async fn limit_clients(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&request);

    if let Err(wait) = state.rate_limiter.check(ip).await {
        let retry_after = wait.as_secs().max(1);
        warn!(ip = %ip, path = %request.uri().path(), "Rate limit exceeded");
        let body = serde_json::json!({
            "error": "Too many requests",
            "message": format!(
                "Too many requests from this client, please try again in {} seconds.",
                retry_after
            ),
        });
        return Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::RETRY_AFTER, retry_after.to_string())
            .body(Body::from(body.to_string()))
            .unwrap_or_default();
    }

    next.run(request).await
}
