use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::AdapterError;
use crate::types::SiteInfo;

/// Capability every site adapter provides. Results are opaque JSON documents
/// that the gateway caches and forwards without inspecting.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, page: u32) -> Result<Value, AdapterError>;

    async fn video_details(&self, video_id: &str) -> Result<Value, AdapterError>;
}

#[derive(Clone)]
pub struct AdapterDescriptor {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub provider: Arc<dyn SearchProvider>,
}

impl AdapterDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        enabled: bool,
        provider: Arc<dyn SearchProvider>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled,
            provider,
        }
    }

    pub fn info(&self) -> SiteInfo {
        SiteInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            enabled: self.enabled,
        }
    }
}

impl std::fmt::Debug for AdapterDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Fixed set of adapters, built once at startup. Registration order is the
/// listing order.
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    adapters: Vec<AdapterDescriptor>,
}

impl AdapterRegistry {
    /// Later descriptors with an id already present are ignored.
    pub fn new(descriptors: impl IntoIterator<Item = AdapterDescriptor>) -> Self {
        let mut adapters: Vec<AdapterDescriptor> = Vec::new();
        for descriptor in descriptors {
            if adapters.iter().any(|a| a.id == descriptor.id) {
                warn!("Duplicate adapter id '{}' ignored", descriptor.id);
                continue;
            }
            info!(
                "Registered adapter {} ({}){}",
                descriptor.id,
                descriptor.name,
                if descriptor.enabled { "" } else { " [disabled]" }
            );
            adapters.push(descriptor);
        }
        Self { adapters }
    }

    pub fn lookup(&self, id: &str) -> Option<&AdapterDescriptor> {
        self.adapters.iter().find(|a| a.id == id)
    }

    pub fn list(&self) -> Vec<SiteInfo> {
        self.adapters.iter().map(AdapterDescriptor::info).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
