//! HuggingFace Hub registry adapter using hf-hub
//!
//! Files are pulled through hf-hub into a staging cache inside the
//! destination, then copied into the flat sentence-transformers layout the
//! provisioner expects. The two cache marker files are copied last and
//! renamed into place, so an interrupted fetch never looks complete.

use super::cache::{MARKER_FILES, QUANT_DIR};
use super::registry::RemoteRegistry;
use super::spec::{AccessToken, ModelId};
use crate::config::RegistryConfig;
use crate::error::FetchError;
use async_trait::async_trait;
use hf_hub::api::tokio::{Api, ApiBuilder, ApiError, ApiRepo};
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::time::timeout;

/// Staging directory created inside the destination during a fetch
pub const STAGING_DIR: &str = ".hf-staging";

/// Registry backed by the HuggingFace Hub
#[derive(Debug, Clone)]
pub struct HfHubRegistry {
    config: RegistryConfig,
}

impl HfHubRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self { config }
    }

    fn api(
        &self,
        credential: Option<&AccessToken>,
        cache_dir: Option<PathBuf>,
    ) -> Result<Api, FetchError> {
        let mut builder = ApiBuilder::new()
            .with_token(credential.map(|t| t.expose().to_string()))
            .with_progress(self.config.show_progress);

        if let Some(endpoint) = &self.config.endpoint {
            builder = builder.with_endpoint(endpoint.clone());
        }
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir);
        }

        builder
            .build()
            .map_err(|e| FetchError::Network(format!("Failed to create HF API client: {}", e)))
    }

    async fn fetch_into(
        &self,
        identifier: &ModelId,
        credential: Option<&AccessToken>,
        destination: &Path,
        staging: &Path,
    ) -> Result<(), FetchError> {
        let api = self.api(credential, Some(staging.to_path_buf()))?;
        let repo = api.model(identifier.to_string());

        let info = with_timeout(
            "repository metadata request",
            self.config.metadata_timeout(),
            repo.info(),
        )
        .await?
        .map_err(classify)?;

        let files: Vec<String> = info
            .siblings
            .into_iter()
            .map(|s| s.rfilename)
            .filter(|f| should_download(f))
            .collect();

        for marker in MARKER_FILES {
            if !files.iter().any(|f| f == marker) {
                return Err(FetchError::MalformedResponse(format!(
                    "{} is not a sentence-transformers model: {} is missing",
                    identifier, marker
                )));
            }
        }

        tracing::info!(
            model_id = %identifier,
            file_count = files.len(),
            revision = %info.sha,
            "Downloading model files"
        );

        let (markers, payload): (Vec<_>, Vec<_>) = files
            .iter()
            .partition(|f| MARKER_FILES.contains(&f.as_str()));

        for file in payload {
            let cached = self.download_file(&repo, identifier, file).await?;
            let target = destination_path(destination, file)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&cached, &target).await?;
        }

        // Markers last, each written under a temporary name and renamed
        for file in markers {
            let cached = self.download_file(&repo, identifier, file).await?;
            let target = destination_path(destination, file)?;
            let partial = target.with_extension("json.partial");
            tokio::fs::copy(&cached, &partial).await?;
            tokio::fs::rename(&partial, &target).await?;
        }

        Ok(())
    }

    async fn download_file(
        &self,
        repo: &ApiRepo,
        identifier: &ModelId,
        file: &str,
    ) -> Result<PathBuf, FetchError> {
        tracing::debug!(model_id = %identifier, file = %file, "Downloading file");
        with_timeout(
            &format!("download of {}", file),
            self.config.download_timeout(),
            repo.get(file),
        )
        .await?
        .map_err(classify)
    }
}

#[async_trait]
impl RemoteRegistry for HfHubRegistry {
    async fn exists(
        &self,
        identifier: &ModelId,
        credential: Option<&AccessToken>,
    ) -> Result<bool, FetchError> {
        let api = self.api(credential, None)?;
        let repo = api.model(identifier.to_string());

        let result = with_timeout(
            "repository metadata request",
            self.config.metadata_timeout(),
            repo.info(),
        )
        .await?;

        match result {
            Ok(_) => Ok(true),
            Err(ApiError::RequestError(e))
                if matches!(e.status().map(|s| s.as_u16()), Some(401 | 403 | 404)) =>
            {
                tracing::debug!(
                    model_id = %identifier,
                    error = %e,
                    "Registry does not expose model"
                );
                Ok(false)
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn fetch(
        &self,
        identifier: &ModelId,
        credential: Option<&AccessToken>,
        destination: &Path,
    ) -> Result<(), FetchError> {
        tracing::info!(
            model_id = %identifier,
            destination = ?destination,
            "Starting model download via hf-hub"
        );

        let staging = destination.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging).await?;

        let result = self
            .fetch_into(identifier, credential, destination, &staging)
            .await;

        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            tracing::warn!(
                path = ?staging,
                error = %e,
                "Failed to remove download staging directory"
            );
        }

        match &result {
            Ok(()) => tracing::info!(model_id = %identifier, "Model download complete"),
            Err(e) => tracing::error!(model_id = %identifier, error = %e, "Model download failed"),
        }

        result
    }
}

async fn with_timeout<T>(
    operation: &str,
    limit: Duration,
    future: impl Future<Output = T>,
) -> Result<T, FetchError> {
    timeout(limit, future).await.map_err(|_| FetchError::Timeout {
        operation: operation.to_string(),
        secs: limit.as_secs(),
    })
}

/// Map hf-hub errors onto the fetch error taxonomy
fn classify(err: ApiError) -> FetchError {
    match err {
        ApiError::RequestError(e) => match e.status().map(|s| s.as_u16()) {
            Some(401 | 403) => FetchError::Permission(e.to_string()),
            Some(_) => FetchError::Network(e.to_string()),
            None if e.is_decode() => FetchError::MalformedResponse(e.to_string()),
            None if e.is_timeout() => FetchError::Timeout {
                operation: "registry request".to_string(),
                secs: 0,
            },
            None => FetchError::Network(e.to_string()),
        },
        ApiError::IoError(e) => FetchError::from(e),
        e @ (ApiError::MissingHeader(_) | ApiError::InvalidHeader(_)) => {
            FetchError::MalformedResponse(e.to_string())
        }
        other => FetchError::Network(other.to_string()),
    }
}

/// Repository files worth copying into the local artifact
fn should_download(file: &str) -> bool {
    if file == ".gitattributes" {
        return false;
    }
    // The quant/ subdirectory is reserved for locally derived variants
    !(file == QUANT_DIR || file.starts_with(&format!("{}/", QUANT_DIR)))
}

/// Resolve a repository file name under the destination
///
/// Registry file names are untrusted: anything that is not a plain relative
/// path is rejected.
fn destination_path(destination: &Path, file: &str) -> Result<PathBuf, FetchError> {
    let relative = Path::new(file);
    let is_plain = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));

    if file.is_empty() || !is_plain {
        return Err(FetchError::MalformedResponse(format!(
            "registry returned unsafe file name '{}'",
            file
        )));
    }

    Ok(destination.join(relative))
}
