use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::adapters::SiteProfile;

/// CDN hosts thumbnails may be fetched from. Subdomains are accepted.
pub const DEFAULT_THUMB_HOSTS: &[&str] = &["phncdn.com"];

const SNAPSHOT_FILE: &str = "cache.json";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub rate_limit_window: Duration,
    pub rate_limit_max_requests: u32,
    pub cache_ttl: Duration,
    pub cache_dir: PathBuf,
    pub cache_sweep_interval: Duration,
    pub cache_snapshot_interval: Duration,
    pub sites_config: PathBuf,
    pub thumb_allowed_hosts: Vec<String>,
    pub adapter_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3001,
            rate_limit_window: Duration::from_millis(60_000),
            rate_limit_max_requests: 30,
            cache_ttl: Duration::from_secs(3600),
            cache_dir: PathBuf::from("cache"),
            cache_sweep_interval: Duration::from_secs(120),
            cache_snapshot_interval: Duration::from_secs(300),
            sites_config: PathBuf::from("sites.toml"),
            thumb_allowed_hosts: DEFAULT_THUMB_HOSTS.iter().map(|h| h.to_string()).collect(),
            adapter_timeout: Duration::from_secs(20),
        }
    }
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let mut thumb_allowed_hosts = defaults.thumb_allowed_hosts;
        if let Some(extra) = lookup("THUMB_ALLOWED_HOSTS") {
            for host in extra.split(',') {
                let host = host.trim().trim_start_matches('.').to_ascii_lowercase();
                if !host.is_empty() && !thumb_allowed_hosts.contains(&host) {
                    thumb_allowed_hosts.push(host);
                }
            }
        }

        let rate_limit_max_requests =
            parse_var(&lookup, "RATE_LIMIT_MAX_REQUESTS", defaults.rate_limit_max_requests);
        let rate_limit_max_requests = if rate_limit_max_requests == 0 {
            warn!("RATE_LIMIT_MAX_REQUESTS must be positive, using 1");
            1
        } else {
            rate_limit_max_requests
        };

        Self {
            port: parse_var(&lookup, "PORT", defaults.port),
            rate_limit_window: Duration::from_millis(
                parse_var(&lookup, "RATE_LIMIT_WINDOW_MS", 60_000u64).max(1),
            ),
            rate_limit_max_requests,
            cache_ttl: Duration::from_secs(parse_var(&lookup, "CACHE_TTL", 3600u64)),
            cache_dir: lookup("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            cache_sweep_interval: Duration::from_secs(
                parse_var(&lookup, "CACHE_SWEEP_INTERVAL_SECS", 120u64).max(1),
            ),
            cache_snapshot_interval: Duration::from_secs(
                parse_var(&lookup, "CACHE_SNAPSHOT_INTERVAL_SECS", 300u64).max(1),
            ),
            sites_config: lookup("SITES_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.sites_config),
            thumb_allowed_hosts,
            adapter_timeout: Duration::from_secs(
                parse_var(&lookup, "ADAPTER_TIMEOUT_SECS", 20u64).max(1),
            ),
        }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.cache_dir.join(SNAPSHOT_FILE)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy + std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring invalid {}={:?}, using {}", key, raw, default);
                default
            }
        },
        None => default,
    }
}

#[derive(Debug, Default, Deserialize)]
struct SitesFile {
    #[serde(default, rename = "site")]
    sites: Vec<SiteProfile>,
}

/// Load site adapter profiles. A missing file yields no sites; a malformed
/// one is a startup error.
pub fn load_site_profiles(path: &Path) -> Result<Vec<SiteProfile>> {
    if !path.exists() {
        warn!("Sites config {} not found, starting with no adapters", path.display());
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read sites config {}", path.display()))?;
    let file: SitesFile = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse sites config {}", path.display()))?;
    info!("Loaded {} site profiles from {}", file.sites.len(), path.display());
    Ok(file.sites)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config.port, 3001);
        assert_eq!(config.rate_limit_window, Duration::from_secs(60));
        assert_eq!(config.rate_limit_max_requests, 30);
        assert_eq!(config.cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.snapshot_path(), PathBuf::from("cache").join("cache.json"));
        assert_eq!(config.thumb_allowed_hosts, vec!["phncdn.com".to_string()]);
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let config = Config::from_lookup(lookup_from(&[
            ("PORT", "8080"),
            ("RATE_LIMIT_WINDOW_MS", "1000"),
            ("RATE_LIMIT_MAX_REQUESTS", "not-a-number"),
            ("CACHE_TTL", "60"),
            ("THUMB_ALLOWED_HOSTS", "img.example.net, .Cdn.Example.org,phncdn.com"),
        ]));
        assert_eq!(config.port, 8080);
        assert_eq!(config.rate_limit_window, Duration::from_secs(1));
        assert_eq!(config.rate_limit_max_requests, 30);
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(
            config.thumb_allowed_hosts,
            vec!["phncdn.com", "img.example.net", "cdn.example.org"]
        );
    }

    #[test]
    fn test_load_site_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let missing = load_site_profiles(&dir.path().join("nope.toml")).unwrap();
        assert!(missing.is_empty());

        let path = dir.path().join("sites.toml");
        std::fs::write(
            &path,
            r#"
[[site]]
id = "tube"
name = "Tube"
base_url = "https://www.tube.example"
search_path = "/search?q={query}&page={page}"
video_path = "/watch/{id}"
id_pattern = "/watch/([A-Za-z0-9]+)"

[site.selectors]
item = ".video"
link = "a.title"
"#,
        )
        .unwrap();
        let profiles = load_site_profiles(&path).unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].id, "tube");
        assert!(profiles[0].enabled);

        std::fs::write(&path, "[[site]]\nid = 3").unwrap();
        assert!(load_site_profiles(&path).is_err());
    }
}
