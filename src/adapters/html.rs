use anyhow::{anyhow, Result};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use rand::Rng;
use regex::Regex;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::{Client, StatusCode};
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::SiteProfile;
use crate::error::AdapterError;
use crate::registry::SearchProvider;
use crate::types::{SearchPage, VideoDetails, VideoSummary};

/// User agents for rotation
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// Attributes checked, in order, for a thumbnail URL. Lazy-loading markup keeps
/// the real image in a data attribute.
const THUMB_ATTRS: &[&str] = &["data-src", "data-thumb_url", "data-original", "src", "content"];

fn compile(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector {:?}: {:?}", css, e))
}

fn compile_opt(css: &Option<String>) -> Result<Option<Selector>> {
    css.as_deref().map(compile).transpose()
}

struct CompiledSelectors {
    item: Selector,
    link: Selector,
    title: Option<Selector>,
    thumbnail: Option<Selector>,
    duration: Option<Selector>,
    next_page: Option<Selector>,
    detail_title: Selector,
    detail_thumbnail: Selector,
    detail_duration: Option<Selector>,
    detail_tags: Option<Selector>,
}

/// Site adapter driven entirely by a [`SiteProfile`].
pub struct HtmlSiteAdapter {
    profile: SiteProfile,
    base_url: Url,
    id_pattern: Regex,
    selectors: CompiledSelectors,
    client: Client,
}

impl HtmlSiteAdapter {
    pub fn new(profile: SiteProfile, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(&profile.base_url)
            .map_err(|e| anyhow!("invalid base_url '{}': {}", profile.base_url, e))?;
        let id_pattern = Regex::new(&profile.id_pattern)?;
        if id_pattern.captures_len() < 2 {
            return Err(anyhow!("id_pattern needs a capture group"));
        }

        let s = &profile.selectors;
        let selectors = CompiledSelectors {
            item: compile(&s.item)?,
            link: compile(&s.link)?,
            title: compile_opt(&s.title)?,
            thumbnail: compile_opt(&s.thumbnail)?,
            duration: compile_opt(&s.duration)?,
            next_page: compile_opt(&s.next_page)?,
            detail_title: compile(s.detail_title.as_deref().unwrap_or("h1"))?,
            detail_thumbnail: compile(
                s.detail_thumbnail
                    .as_deref()
                    .unwrap_or("meta[property=\"og:image\"]"),
            )?,
            detail_duration: compile_opt(&s.detail_duration)?,
            detail_tags: compile_opt(&s.detail_tags)?,
        };

        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;

        Ok(Self {
            profile,
            base_url,
            id_pattern,
            selectors,
            client,
        })
    }

    /// Get a random User-Agent string
    fn random_user_agent() -> &'static str {
        let index = rand::thread_rng().gen_range(0..USER_AGENTS.len());
        USER_AGENTS[index]
    }

    fn search_url(&self, query: &str, page: u32) -> Result<Url, AdapterError> {
        let encoded = utf8_percent_encode(query, NON_ALPHANUMERIC).to_string();
        let path = self
            .profile
            .search_path
            .replace("{query}", &encoded)
            .replace("{page}", &page.to_string());
        self.base_url
            .join(&path)
            .map_err(|e| AdapterError::Failed(format!("Invalid search URL: {}", e)))
    }

    fn video_url(&self, video_id: &str) -> Result<Url, AdapterError> {
        let encoded = utf8_percent_encode(video_id, NON_ALPHANUMERIC).to_string();
        let path = self.profile.video_path.replace("{id}", &encoded);
        self.base_url
            .join(&path)
            .map_err(|e| AdapterError::Failed(format!("Invalid video URL: {}", e)))
    }

    fn blocked_marker(&self, body: &str) -> Option<&str> {
        let lowered = body.to_lowercase();
        self.profile
            .blocked_markers
            .iter()
            .find(|marker| lowered.contains(&marker.to_lowercase()))
            .map(String::as_str)
    }

    /// Fetch a page, retrying network errors and 5xx responses.
    async fn fetch_html(&self, url: &Url) -> Result<String, AdapterError> {
        let site = self.profile.id.as_str();
        retry(
            ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(200))
                .with_max_interval(Duration::from_secs(2))
                .with_max_elapsed_time(Some(Duration::from_secs(6)))
                .build(),
            || async move {
                let response = self
                    .client
                    .get(url.as_str())
                    .header(USER_AGENT, Self::random_user_agent())
                    .header(
                        ACCEPT,
                        "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                    )
                    .header(ACCEPT_LANGUAGE, "en-US,en;q=0.5")
                    .send()
                    .await
                    .map_err(|e| {
                        backoff::Error::transient(AdapterError::Failed(format!(
                            "Failed to fetch {}: {}",
                            url, e
                        )))
                    })?;

                let status = response.status();
                if status == StatusCode::FORBIDDEN
                    || status == StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS
                {
                    return Err(backoff::Error::permanent(AdapterError::blocked(
                        format!("{} refused the request with status {}", site, status.as_u16()),
                        Some(json!({ "site": site, "status": status.as_u16() })),
                    )));
                }
                if status.is_server_error() {
                    return Err(backoff::Error::transient(AdapterError::Failed(format!(
                        "{} returned status {}",
                        site, status
                    ))));
                }
                if !status.is_success() {
                    return Err(backoff::Error::permanent(AdapterError::Failed(format!(
                        "{} returned status {}",
                        site, status
                    ))));
                }

                let body = response.text().await.map_err(|e| {
                    backoff::Error::transient(AdapterError::Failed(format!(
                        "Failed to read response body: {}",
                        e
                    )))
                })?;
                if let Some(marker) = self.blocked_marker(&body) {
                    return Err(backoff::Error::permanent(AdapterError::blocked(
                        format!("{} served a block page", site),
                        Some(json!({ "site": site, "marker": marker })),
                    )));
                }
                Ok(body)
            },
        )
        .await
    }

    fn absolute(&self, raw: &str) -> String {
        match self.base_url.join(raw) {
            Ok(url) => url.to_string(),
            Err(_) => raw.to_string(),
        }
    }

    fn extract_thumbnail(&self, element: ElementRef) -> Option<String> {
        THUMB_ATTRS
            .iter()
            .filter_map(|attr| element.value().attr(attr))
            .map(str::trim)
            .find(|value| !value.is_empty() && !value.starts_with("data:"))
            .map(|value| self.absolute(value))
    }

    /// Extract listing entries from a search results page.
    pub fn parse_search(&self, html: &str, query: &str, page: u32) -> SearchPage {
        let document = Html::parse_document(html);
        let sel = &self.selectors;
        let mut seen = HashSet::new();
        let mut videos = Vec::new();

        for item in document.select(&sel.item) {
            let Some(link) = item.select(&sel.link).next() else {
                continue;
            };
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let Some(id) = self
                .id_pattern
                .captures(href)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
            else {
                continue;
            };
            if !seen.insert(id.clone()) {
                continue;
            }

            let title = sel
                .title
                .as_ref()
                .and_then(|s| item.select(s).next())
                .map(element_text)
                .or_else(|| link.value().attr("title").map(|t| t.trim().to_string()))
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| element_text(link));
            let thumbnail = sel
                .thumbnail
                .as_ref()
                .and_then(|s| item.select(s).next())
                .and_then(|el| self.extract_thumbnail(el));
            let duration = sel
                .duration
                .as_ref()
                .and_then(|s| item.select(s).next())
                .map(element_text)
                .filter(|d| !d.is_empty());

            videos.push(VideoSummary {
                id,
                title,
                url: self.absolute(href),
                thumbnail,
                duration,
            });
        }

        let has_next_page = sel
            .next_page
            .as_ref()
            .map(|s| document.select(s).next().is_some())
            .unwrap_or(false);

        debug!("{}: parsed {} videos", self.profile.id, videos.len());
        SearchPage {
            site: self.profile.id.clone(),
            query: query.to_string(),
            page,
            videos,
            has_next_page,
        }
    }

    /// Extract a single video's metadata from its watch page.
    pub fn parse_details(&self, html: &str, video_id: &str, url: &str) -> VideoDetails {
        let document = Html::parse_document(html);
        let sel = &self.selectors;

        let title = document
            .select(&sel.detail_title)
            .next()
            .map(|el| {
                el.value()
                    .attr("content")
                    .map(|c| c.trim().to_string())
                    .unwrap_or_else(|| element_text(el))
            })
            .filter(|t| !t.is_empty())
            .or_else(|| page_title(&document))
            .unwrap_or_else(|| "No Title".to_string());
        let thumbnail = document
            .select(&sel.detail_thumbnail)
            .next()
            .and_then(|el| self.extract_thumbnail(el));
        let duration = sel
            .detail_duration
            .as_ref()
            .and_then(|s| document.select(s).next())
            .map(|el| {
                el.value()
                    .attr("content")
                    .map(|c| c.trim().to_string())
                    .unwrap_or_else(|| element_text(el))
            })
            .filter(|d| !d.is_empty());

        let mut tags = Vec::new();
        if let Some(s) = &sel.detail_tags {
            let mut seen = HashSet::new();
            for tag in document.select(s).map(element_text) {
                if !tag.is_empty() && seen.insert(tag.clone()) {
                    tags.push(tag);
                }
            }
        }

        VideoDetails {
            id: video_id.to_string(),
            site: self.profile.id.clone(),
            url: url.to_string(),
            title,
            thumbnail,
            duration,
            tags,
        }
    }
}

/// Element text with whitespace collapsed.
fn element_text(element: ElementRef) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn page_title(document: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    document
        .select(&selector)
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty())
}

fn to_value<T: serde::Serialize>(payload: &T) -> Result<Value, AdapterError> {
    serde_json::to_value(payload)
        .map_err(|e| AdapterError::Failed(format!("Failed to encode result: {}", e)))
}

#[async_trait]
impl SearchProvider for HtmlSiteAdapter {
    async fn search(&self, query: &str, page: u32) -> Result<Value, AdapterError> {
        let url = self.search_url(query, page)?;
        info!("{}: searching '{}' page {}", self.profile.id, query, page);
        let html = self.fetch_html(&url).await.map_err(|e| {
            warn!("{}: search failed: {}", self.profile.id, e);
            e
        })?;
        to_value(&self.parse_search(&html, query, page))
    }

    async fn video_details(&self, video_id: &str) -> Result<Value, AdapterError> {
        let url = self.video_url(video_id)?;
        info!("{}: fetching video {}", self.profile.id, video_id);
        let html = self.fetch_html(&url).await.map_err(|e| {
            warn!("{}: details failed: {}", self.profile.id, e);
            e
        })?;
        to_value(&self.parse_details(&html, video_id, url.as_str()))
    }
}
