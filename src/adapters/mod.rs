pub mod html;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::registry::{AdapterDescriptor, AdapterRegistry};
pub use html::HtmlSiteAdapter;

fn default_enabled() -> bool {
    true
}

fn default_item_selector() -> String {
    ".video".to_string()
}

fn default_link_selector() -> String {
    "a[href]".to_string()
}

/// Declarative description of one scraped site, loaded from the sites config.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteProfile {
    pub id: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub base_url: String,
    /// Path template with `{query}` and `{page}` placeholders.
    pub search_path: String,
    /// Path template with an `{id}` placeholder.
    pub video_path: String,
    /// Regex applied to listing links; the first capture group is the video id.
    pub id_pattern: String,
    /// Case-insensitive body markers of a geo-block or bot wall page.
    #[serde(default)]
    pub blocked_markers: Vec<String>,
    #[serde(default)]
    pub selectors: SelectorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectorConfig {
    #[serde(default = "default_item_selector")]
    pub item: String,
    #[serde(default = "default_link_selector")]
    pub link: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub next_page: Option<String>,
    #[serde(default)]
    pub detail_title: Option<String>,
    #[serde(default)]
    pub detail_thumbnail: Option<String>,
    #[serde(default)]
    pub detail_duration: Option<String>,
    #[serde(default)]
    pub detail_tags: Option<String>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            item: default_item_selector(),
            link: default_link_selector(),
            title: None,
            thumbnail: None,
            duration: None,
            next_page: None,
            detail_title: None,
            detail_thumbnail: None,
            detail_duration: None,
            detail_tags: None,
        }
    }
}

/// Construct one adapter per profile. Invalid selectors or patterns abort startup.
pub fn build_registry(profiles: Vec<SiteProfile>, timeout: Duration) -> Result<AdapterRegistry> {
    let mut descriptors = Vec::with_capacity(profiles.len());
    for profile in profiles {
        let (id, name, enabled) = (profile.id.clone(), profile.name.clone(), profile.enabled);
        let adapter = HtmlSiteAdapter::new(profile, timeout)
            .with_context(|| format!("Invalid adapter profile '{}'", id))?;
        descriptors.push(AdapterDescriptor::new(id, name, enabled, Arc::new(adapter)));
    }
    Ok(AdapterRegistry::new(descriptors))
}
