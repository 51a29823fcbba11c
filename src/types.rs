use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub page: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThumbQuery {
    pub url: Option<String>,
}

/// Public identity of a registered site adapter.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SiteInfo {
    pub id: String,
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SitesResponse {
    pub sites: Vec<SiteInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheStatus {
    pub entries: u64,
}

/// Read-only snapshot consumed by the admin dashboard widget.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
    pub timestamp: String,
    pub uptime_seconds: u64,
    pub cache: CacheStatus,
    pub adapters: Vec<SiteInfo>,
    pub enabled_adapters: usize,
    pub in_flight: usize,
    pub total_requests: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// One listing entry extracted by an HTML adapter.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VideoSummary {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    pub site: String,
    pub query: String,
    pub page: u32,
    pub videos: Vec<VideoSummary>,
    pub has_next_page: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VideoDetails {
    pub id: String,
    pub site: String,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}
