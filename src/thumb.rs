//! Thumbnail proxy.
//!
//! Fetches remote images on behalf of the browser so the frontend never talks
//! to the CDNs directly. Every URL passes through the validation pipeline in
//! [`validate`] before any network I/O happens; redirects are re-validated.

use anyhow::Result;
use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, StatusCode},
    response::Response,
};
use axum::BoxError;
use futures::{TryStream, TryStreamExt};
use reqwest::redirect::Policy;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use url::Url;

use crate::error::ProxyRejection;
use crate::types::ThumbQuery;
use crate::AppState;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REDIRECTS: usize = 5;
const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const IMAGE_ACCEPT: &str = "image/avif,image/webp,image/apng,image/*,*/*;q=0.8";
const CACHE_CONTROL: &str = "public, max-age=86400";

/// A URL that passed validation, alive for one proxy call.
#[derive(Debug, Clone)]
pub struct ThumbnailRequest {
    pub url: Url,
    pub host: String,
}

impl ThumbnailRequest {
    /// Referer sent upstream: the target's own origin.
    pub fn referer(&self) -> String {
        format!("{}/", self.url.origin().ascii_serialization())
    }
}

/// Hosts that must never be fetched. The `172.` rule covers all of
/// 172.0.0.0/8, not only 172.16.0.0/12.
pub fn is_private_host(host: &str) -> bool {
    host == "localhost"
        || host == "127.0.0.1"
        || host == "0.0.0.0"
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || host.starts_with("169.254.")
        || host.starts_with("172.")
        || host.ends_with(".local")
        || host.ends_with(".internal")
}

/// Exact match or subdomain of an allowlisted host.
pub fn is_allowed_host(host: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|domain| {
        host == domain
            || host
                .strip_suffix(domain.as_str())
                .map(|prefix| prefix.ends_with('.'))
                .unwrap_or(false)
    })
}

/// Scheme, private-address and allowlist checks shared by the initial URL and
/// every redirect hop.
fn check_target(url: &Url, allowed: &[String]) -> Result<String, ProxyRejection> {
    if url.scheme() != "https" {
        return Err(ProxyRejection::InsecureScheme);
    }
    let host = url
        .host_str()
        .ok_or(ProxyRejection::InvalidUrl)?
        .to_ascii_lowercase();
    if is_private_host(&host) {
        return Err(ProxyRejection::PrivateAddress);
    }
    if !is_allowed_host(&host, allowed) {
        return Err(ProxyRejection::DomainNotAllowed);
    }
    Ok(host)
}

pub fn validate(raw: Option<&str>, allowed: &[String]) -> Result<ThumbnailRequest, ProxyRejection> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ProxyRejection::MissingUrl)?;
    let url = Url::parse(raw).map_err(|_| ProxyRejection::InvalidUrl)?;
    let host = check_target(&url, allowed)?;
    Ok(ThumbnailRequest { url, host })
}

/// Upstream status must be 2xx and the body must be declared as an image.
pub fn check_upstream(status: u16, content_type: Option<&str>) -> Result<(), ProxyRejection> {
    if !(200..300).contains(&status) {
        return Err(ProxyRejection::UpstreamStatus(status));
    }
    match content_type {
        Some(ct) if ct.trim_start().to_ascii_lowercase().starts_with("image/") => Ok(()),
        _ => Err(ProxyRejection::NotAnImage),
    }
}

/// A redirect hop is followed only within the hop budget and only when the
/// new target would itself pass validation.
fn follow_redirect(hops_taken: usize, target: &Url, allowed: &[String]) -> bool {
    hops_taken < MAX_REDIRECTS && check_target(target, allowed).is_ok()
}

/// Turn the upstream status, content type and body into the proxied response.
///
/// A 3xx here means the redirect policy refused the next hop.
pub fn upstream_response<S>(
    status: u16,
    content_type: Option<&str>,
    body: S,
) -> Result<Response, ProxyRejection>
where
    S: TryStream + Send + 'static,
    S::Ok: Into<Bytes>,
    S::Error: Into<BoxError>,
{
    if (300..400).contains(&status) {
        return Err(ProxyRejection::DomainNotAllowed);
    }
    check_upstream(status, content_type)?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type.unwrap_or_default())
        .header(header::CACHE_CONTROL, CACHE_CONTROL)
        .body(Body::from_stream(body))
        .map_err(|e| {
            error!("Failed to build thumbnail response: {}", e);
            ProxyRejection::Internal
        })
}

pub struct ThumbnailProxy {
    client: Client,
    allowed_hosts: Arc<Vec<String>>,
}

impl ThumbnailProxy {
    pub fn new(allowed_hosts: Vec<String>) -> Result<Self> {
        let allowed_hosts = Arc::new(allowed_hosts);
        let redirect_hosts = Arc::clone(&allowed_hosts);
        let policy = Policy::custom(move |attempt| {
            if follow_redirect(attempt.previous().len(), attempt.url(), &redirect_hosts) {
                attempt.follow()
            } else {
                attempt.stop()
            }
        });

        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .redirect(policy)
            .build()?;

        Ok(Self {
            client,
            allowed_hosts,
        })
    }

    pub fn allowed_hosts(&self) -> &[String] {
        &self.allowed_hosts
    }

    /// Validate `raw` and stream the upstream image back.
    pub async fn proxy(&self, raw: Option<&str>) -> Result<Response, ProxyRejection> {
        let request = validate(raw, &self.allowed_hosts)?;
        debug!("Proxying thumbnail from {}", request.host);

        let upstream = self
            .client
            .get(request.url.as_str())
            .header(reqwest::header::USER_AGENT, BROWSER_USER_AGENT)
            .header(reqwest::header::ACCEPT, IMAGE_ACCEPT)
            .header(reqwest::header::REFERER, request.referer())
            .send()
            .await
            .map_err(|e| {
                error!("Thumbnail fetch from {} failed: {}", request.host, e);
                ProxyRejection::Internal
            })?;

        let status = upstream.status().as_u16();
        let content_type = upstream
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let host = request.host;
        let stream_host = host.clone();
        // Dropping the body (client gone) drops the upstream connection too.
        let stream = upstream.bytes_stream().inspect_err(move |e| {
            warn!("Thumbnail stream from {} aborted: {}", stream_host, e);
        });

        upstream_response(status, content_type.as_deref(), stream).map_err(|rejection| {
            warn!(
                "Thumbnail from {} rejected: status {}, content-type {:?}",
                host, status, content_type
            );
            rejection
        })
    }
}

pub async fn proxy_thumbnail(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ThumbQuery>,
) -> Result<Response, ProxyRejection> {
    state.thumbs.proxy(params.url.as_deref()).await
}
