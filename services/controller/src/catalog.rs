//! Registry catalog: the image-discovery side of a Registry.
//!
//! Crawling registries and generating SBOMs happens outside the controller.
//! The job reconciler only needs the list of images behind a Registry
//! together with their SPDX documents.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vscan_api::{ImageMetadata, ObjectKey, Registry, Resource};

/// One platform-specific image found behind a registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredImage {
    pub metadata: ImageMetadata,
    pub spdx: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    /// The registry could not be reached or answered with an error.
    #[error("registry {registry} unreachable: {reason}")]
    Unreachable { registry: String, reason: String },
}

/// Source of the images behind a Registry.
#[async_trait]
pub trait RegistryCatalog: Send + Sync {
    async fn list_images(&self, registry: &Registry) -> Result<Vec<DiscoveredImage>, CatalogError>;
}

/// Catalog backed by a fixed table, keyed by Registry object.
#[derive(Default)]
pub struct StaticCatalog {
    images: RwLock<HashMap<ObjectKey, Vec<DiscoveredImage>>>,
    unreachable: RwLock<HashSet<ObjectKey>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the images listed for a registry.
    pub fn set_images(&self, registry: ObjectKey, images: Vec<DiscoveredImage>) {
        self.images
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(registry, images);
    }

    /// Make a registry fail every listing until reset.
    pub fn set_unreachable(&self, registry: ObjectKey, unreachable: bool) {
        let mut set = self.unreachable.write().unwrap_or_else(|e| e.into_inner());
        if unreachable {
            set.insert(registry);
        } else {
            set.remove(&registry);
        }
    }
}

#[async_trait]
impl RegistryCatalog for StaticCatalog {
    async fn list_images(&self, registry: &Registry) -> Result<Vec<DiscoveredImage>, CatalogError> {
        let key = registry.key();
        if self
            .unreachable
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&key)
        {
            return Err(CatalogError::Unreachable {
                registry: registry.spec.uri.clone(),
                reason: "connection refused".to_string(),
            });
        }

        let mut images = self
            .images
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
            .unwrap_or_default();

        // Discovery stamps the registry identity on every image.
        for image in &mut images {
            image.metadata.registry = registry.metadata.name.clone();
            image.metadata.registry_uri = registry.spec.uri.clone();
        }
        Ok(images)
    }
}
