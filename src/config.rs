//! Configuration structures and loading logic

use crate::models::{ModelId, ModelRequest, default_cache_dir};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Main provisioner configuration
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root directory models are stored under (standard cache dir if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    pub registry: RegistryConfig,
    /// Install the Prometheus recorder
    pub metrics: bool,
    /// Token applied to model entries that do not carry their own
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub models: Vec<ModelRequest>,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("cache_dir", &self.cache_dir)
            .field("registry", &self.registry)
            .field("metrics", &self.metrics)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("models", &self.models)
            .finish()
    }
}

/// Remote registry settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Alternative hub endpoint (mirror or self-hosted)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub metadata_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub show_progress: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            metadata_timeout_secs: default_metadata_timeout(),
            download_timeout_secs: default_download_timeout(),
            show_progress: true,
        }
    }
}

impl RegistryConfig {
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config: Self = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(cache_dir) = std::env::var("EMBED_PROVISIONER_CACHE_DIR") {
            config.cache_dir = Some(PathBuf::from(cache_dir));
        }
        if let Ok(endpoint) = std::env::var("HF_ENDPOINT") {
            config.registry.endpoint = Some(endpoint);
        }
        if let Ok(timeout) = std::env::var("HF_HUB_ETAG_TIMEOUT") {
            config.registry.metadata_timeout_secs = timeout
                .parse()
                .context("Invalid HF_HUB_ETAG_TIMEOUT value")?;
        }
        if let Ok(timeout) = std::env::var("HF_HUB_DOWNLOAD_TIMEOUT") {
            config.registry.download_timeout_secs = timeout
                .parse()
                .context("Invalid HF_HUB_DOWNLOAD_TIMEOUT value")?;
        }
        if let Ok(token) = std::env::var("HF_TOKEN") {
            config.access_token = Some(token);
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.registry.metadata_timeout_secs == 0 {
            anyhow::bail!("registry.metadata_timeout_secs must be greater than 0");
        }
        if self.registry.download_timeout_secs == 0 {
            anyhow::bail!("registry.download_timeout_secs must be greater than 0");
        }

        let mut seen = HashSet::new();
        for model in &self.models {
            ModelId::parse(&model.identifier)
                .with_context(|| format!("Invalid model entry '{}'", model.identifier))?;

            if model.batch_size == Some(0) {
                anyhow::bail!("Model '{}' batch_size must be greater than 0", model.identifier);
            }
            if !seen.insert((&model.identifier, model.quantize)) {
                anyhow::bail!("Duplicate model entry: {}", model.identifier);
            }
        }

        Ok(())
    }

    /// Directory models are stored under
    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    /// Configured model entries with file-level defaults applied
    ///
    /// Entries without a root use [`Self::cache_root`], entries without a
    /// token inherit the configured one, and progress display follows the
    /// registry setting unless an entry overrides it.
    pub fn model_requests(&self) -> Vec<ModelRequest> {
        self.models
            .iter()
            .cloned()
            .map(|mut request| {
                if request.local_root.is_none() {
                    request.local_root = Some(self.cache_root());
                }
                if request.access_token.is_none() {
                    request.access_token = self.access_token.clone();
                }
                if request.show_progress.is_none() {
                    request.show_progress = Some(self.registry.show_progress);
                }
                request
            })
            .collect()
    }
}

// Default functions
fn default_metadata_timeout() -> u64 {
    120
}
fn default_download_timeout() -> u64 {
    300
}
