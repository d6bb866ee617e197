//! Engine manifest: the catalog of installable engines.
//!
//! The manifest is a JSON document fetched from a remote endpoint or read
//! from a local file. Entries are immutable for a session; `reload()`
//! replaces the whole cached document.

use crate::config::{AppConfig, NetworkConfig};
use crate::{HangarError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A file the install must contain, optionally pinned to a hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequiredFile {
    /// Path relative to the install directory.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// How to probe a running engine for readiness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheck {
    /// URL with `{port}` substituted at probe time,
    /// e.g. `http://127.0.0.1:{port}/health`.
    pub url_template: String,
    #[serde(default = "default_expect_status")]
    pub expect_status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_substring: Option<String>,
}

fn default_expect_status() -> u16 {
    200
}

impl HealthCheck {
    /// Resolve the template against a concrete port.
    pub fn url(&self, port: u16) -> String {
        self.url_template.replace("{port}", &port.to_string())
    }
}

/// One installable engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub name: String,
    pub version: String,
    pub download_url: String,
    /// Alternate sources tried after the primary, keyed by platform
    /// (`"linux"`, `"macos"`, `"windows"`, or `"any"`).
    #[serde(default)]
    pub mirrors: HashMap<String, Vec<String>>,
    pub sha256: String,
    /// Uncompressed size estimate in bytes, used for disk-space checks.
    #[serde(default)]
    pub size_estimate: u64,
    pub default_port: u16,
    /// Executable path relative to the install directory.
    pub entrypoint: String,
    /// Argument template; `{port}` and `{install_dir}` are substituted at
    /// spawn time.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub required_files: Vec<RequiredFile>,
    /// Minimum accelerator memory in bytes. Gates auto-start only, never
    /// install.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_accelerator_memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

impl ManifestEntry {
    /// Mirror URLs for the current platform, in declared order.
    ///
    /// Platform-specific mirrors come first, then `"any"` mirrors.
    pub fn mirrors_for_platform(&self, platform: &str) -> Vec<String> {
        let mut urls = Vec::new();
        if let Some(list) = self.mirrors.get(platform) {
            urls.extend(list.iter().cloned());
        }
        if let Some(list) = self.mirrors.get("any") {
            urls.extend(list.iter().cloned());
        }
        urls
    }
}

/// The manifest document as fetched.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ManifestDocument {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub engines: Vec<ManifestEntry>,
}

/// Where manifest bytes come from. Opaque to the rest of the subsystem so
/// tests can feed a local file.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch(&self) -> Result<String>;
    fn describe(&self) -> String;
}

/// Fetches the manifest over HTTP.
pub struct HttpManifestSource {
    client: reqwest::Client,
    url: String,
}

impl HttpManifestSource {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .timeout(NetworkConfig::MANIFEST_TIMEOUT)
            .user_agent(AppConfig::USER_AGENT)
            .build()
            .map_err(|e| HangarError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: Some(e.to_string()),
            })?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ManifestSource for HttpManifestSource {
    async fn fetch(&self) -> Result<String> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(HangarError::Network {
                message: format!(
                    "Manifest fetch failed: HTTP {} from {}",
                    response.status(),
                    self.url
                ),
                cause: None,
            });
        }
        Ok(response.text().await?)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Reads the manifest from a local file.
pub struct FileManifestSource {
    path: PathBuf,
}

impl FileManifestSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ManifestSource for FileManifestSource {
    async fn fetch(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| HangarError::io_with_path(e, &self.path))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Loads and caches the manifest. `list()` serves the cache; `reload()`
/// replaces it wholesale.
pub struct ManifestLoader {
    source: Box<dyn ManifestSource>,
    cache: RwLock<Option<ManifestDocument>>,
}

impl ManifestLoader {
    pub fn new(source: Box<dyn ManifestSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(None),
        }
    }

    /// All entries, fetching on first use.
    pub async fn list(&self) -> Result<Vec<ManifestEntry>> {
        {
            let cache = self.cache.read().await;
            if let Some(doc) = cache.as_ref() {
                return Ok(doc.engines.clone());
            }
        }
        self.reload().await?;
        let cache = self.cache.read().await;
        Ok(cache.as_ref().map(|d| d.engines.clone()).unwrap_or_default())
    }

    /// Look up one entry by id.
    pub async fn get(&self, id: &str) -> Result<ManifestEntry> {
        self.list()
            .await?
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| HangarError::ManifestEntryNotFound { id: id.to_string() })
    }

    /// Re-fetch and replace the cached document.
    pub async fn reload(&self) -> Result<()> {
        debug!("Loading manifest from {}", self.source.describe());
        let raw = self.source.fetch().await?;
        let doc: ManifestDocument =
            serde_json::from_str(&raw).map_err(|e| HangarError::InvalidManifest {
                message: format!("Failed to parse manifest: {}", e),
            })?;

        validate_document(&doc)?;

        info!("Loaded manifest with {} engines", doc.engines.len());
        *self.cache.write().await = Some(doc);
        Ok(())
    }
}

fn validate_document(doc: &ManifestDocument) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for entry in &doc.engines {
        if entry.id.is_empty() {
            return Err(HangarError::InvalidManifest {
                message: "Manifest entry with empty id".into(),
            });
        }
        if !seen.insert(entry.id.clone()) {
            return Err(HangarError::InvalidManifest {
                message: format!("Duplicate manifest entry id: {}", entry.id),
            });
        }
        if url::Url::parse(&entry.download_url).is_err() {
            return Err(HangarError::InvalidManifest {
                message: format!(
                    "Entry {} has an invalid download URL: {}",
                    entry.id, entry.download_url
                ),
            });
        }
        for mirror in entry.mirrors.values().flatten() {
            if url::Url::parse(mirror).is_err() {
                return Err(HangarError::InvalidManifest {
                    message: format!("Entry {} has an invalid mirror URL: {}", entry.id, mirror),
                });
            }
        }
        if entry.entrypoint.is_empty() {
            return Err(HangarError::InvalidManifest {
                message: format!("Entry {} has no entrypoint", entry.id),
            });
        }
    }
    Ok(())
}
