//! Model provisioning
//!
//! [`ModelProvisioner`] turns a [`ModelSpecification`] into a loaded
//! [`ModelHandle`]:
//!
//! ```text
//! Unchecked ─┬─> LocalPresent ─────────────────────────────────────────> Ready
//!            └─> LocalAbsent ─┬─> RemoteExists ─> Downloading ─> Downloaded ─┬─> Ready
//!                             │                        │                     └─> Quantizing ─> Quantized ─> Ready
//!                             └─> RemoteAbsent ─> Failed                     │
//!                                                      └─> DownloadFailed ─> Failed
//! ```
//!
//! Calls for the same base location are serialized; unrelated models are
//! provisioned concurrently.

use crate::config::RegistryConfig;
use crate::error::{FailureKind, FetchError, ProvisionError, ProvisionResult};
use crate::gpu::{self, GpuInfo};
use crate::metrics;
use crate::models::cache::{MARKER_FILES, default_cache_dir, is_present};
use crate::models::{
    CacheLocation, EncodeOptions, HfHubRegistry, LocalDeriver, ModelHandle, ModelRequest,
    ModelSpecification, QuantizationDeriver, RemoteRegistry,
};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// A model ready for use
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedModel {
    pub handle: ModelHandle,
    /// The base artifact was fetched from the registry during this call
    pub was_downloaded: bool,
    /// The handle was loaded from a quantized variant
    pub was_quantized: bool,
}

pub type ProvisioningResult = ProvisionResult<ProvisionedModel>;

/// Provisioning lifecycle states, reported in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    LocalPresent,
    LocalAbsent,
    RemoteExists,
    RemoteAbsent,
    Downloading,
    Downloaded,
    DownloadFailed,
    Quantizing,
    Quantized,
    Ready,
    Failed,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LocalPresent => "local_present",
            Self::LocalAbsent => "local_absent",
            Self::RemoteExists => "remote_exists",
            Self::RemoteAbsent => "remote_absent",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::DownloadFailed => "download_failed",
            Self::Quantizing => "quantizing",
            Self::Quantized => "quantized",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Resolves, fetches, quantizes and loads models
pub struct ModelProvisioner {
    registry: Arc<dyn RemoteRegistry>,
    deriver: Arc<dyn QuantizationDeriver>,
    gpus: GpuInfo,
    /// One lease per base location
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl ModelProvisioner {
    /// Create a provisioner with GPUs detected from this host
    pub fn new(registry: Arc<dyn RemoteRegistry>, deriver: Arc<dyn QuantizationDeriver>) -> Self {
        Self::with_gpus(registry, deriver, gpu::get_or_init().clone())
    }

    /// Create a provisioner resolving `auto` devices against `gpus`
    pub fn with_gpus(
        registry: Arc<dyn RemoteRegistry>,
        deriver: Arc<dyn QuantizationDeriver>,
        gpus: GpuInfo,
    ) -> Self {
        Self {
            registry,
            deriver,
            gpus,
            locks: DashMap::new(),
        }
    }

    /// Provisioner backed by the HuggingFace Hub and the built-in deriver
    pub fn huggingface(config: RegistryConfig) -> Self {
        Self::new(
            Arc::new(HfHubRegistry::new(config)),
            Arc::new(LocalDeriver),
        )
    }

    /// Validate a raw request, then provision it
    pub async fn provision_request(&self, request: ModelRequest) -> ProvisioningResult {
        let identifier = request.identifier.clone();
        let root = request.local_root.clone().unwrap_or_else(default_cache_dir);

        let spec = match ModelSpecification::from_request(request) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::warn!(
                    model_id = %identifier,
                    field = e.field(),
                    error = %e,
                    "Invalid model request"
                );
                metrics::record_provision("validation");
                return Err(ProvisionError::new(identifier, root, e));
            }
        };

        self.provision(&spec).await
    }

    /// Provision several requests one after another
    pub async fn provision_all(&self, requests: Vec<ModelRequest>) -> Vec<ProvisioningResult> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.provision_request(request).await);
        }
        results
    }

    /// Make the model described by `spec` available locally and load it
    pub async fn provision(&self, spec: &ModelSpecification) -> ProvisioningResult {
        let result = self.run(spec).await;

        match &result {
            Ok(model) => {
                transition(spec, ProvisionState::Ready);
                tracing::info!(
                    model_id = %spec.identifier(),
                    path = ?model.handle.path(),
                    was_downloaded = model.was_downloaded,
                    was_quantized = model.was_quantized,
                    "Model ready"
                );
                metrics::record_provision("ready");
            }
            Err(e) => {
                transition(spec, ProvisionState::Failed);
                tracing::error!(
                    model_id = %spec.identifier(),
                    stage = %e.stage(),
                    retryable = e.is_retryable(),
                    error = %e,
                    "Model provisioning failed"
                );
                metrics::record_provision(&e.stage().to_string());
            }
        }

        result
    }

    async fn run(&self, spec: &ModelSpecification) -> ProvisioningResult {
        let location = spec.cache_location();
        let lease = self.lease(location.base());

        let result = {
            let _guard = lease.lock().await;
            self.run_leased(spec, &location).await
        };

        self.release(location.base(), lease);
        result
    }

    async fn run_leased(
        &self,
        spec: &ModelSpecification,
        location: &CacheLocation,
    ) -> ProvisioningResult {
        let target = location.target();

        if is_present(&target) {
            transition(spec, ProvisionState::LocalPresent);
            let handle = self.load(spec, &target)?;
            return Ok(ProvisionedModel {
                handle,
                was_downloaded: false,
                was_quantized: spec.quantize(),
            });
        }
        transition(spec, ProvisionState::LocalAbsent);

        let was_downloaded = if location.is_quantized() && is_present(location.base()) {
            tracing::info!(
                model_id = %spec.identifier(),
                path = ?location.base(),
                "Reusing cached base artifact for quantization"
            );
            false
        } else {
            self.download(spec, location.base()).await?;
            true
        };

        let (path, was_quantized) = if spec.quantize() {
            (self.quantize(spec, location).await?, true)
        } else {
            (target, false)
        };

        let handle = self.load(spec, &path)?;
        Ok(ProvisionedModel {
            handle,
            was_downloaded,
            was_quantized,
        })
    }

    /// Lease serializing work on one base location
    fn lease(&self, base: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(base.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Drop the lease entry once no other call holds or waits on it
    fn release(&self, base: &Path, lease: Arc<Mutex<()>>) {
        drop(lease);
        self.locks.remove_if(base, |_, entry| Arc::strong_count(entry) == 1);
    }

    /// Number of base locations with a live lease
    pub fn active_leases(&self) -> usize {
        self.locks.len()
    }

    async fn download(&self, spec: &ModelSpecification, base: &Path) -> ProvisionResult<()> {
        let identifier = spec.identifier();
        let credential = spec.access_token();
        let fail = |kind: FailureKind| ProvisionError::new(identifier.as_str(), base, kind);

        let exists = self
            .registry
            .exists(identifier, credential)
            .await
            .map_err(|e| fail(FailureKind::Lookup(e)))?;

        if !exists {
            transition(spec, ProvisionState::RemoteAbsent);
            tracing::warn!(model_id = %identifier, "Model not found in registry");
            return Err(fail(FailureKind::ModelNotFound));
        }
        transition(spec, ProvisionState::RemoteExists);

        let created = !base.exists();
        transition(spec, ProvisionState::Downloading);
        let started = Instant::now();

        let fetched = match self.registry.fetch(identifier, credential, base).await {
            Ok(()) if is_present(base) => Ok(()),
            Ok(()) => Err(FetchError::MalformedResponse(
                "fetch completed without writing the cache marker files".to_string(),
            )),
            Err(e) => Err(e),
        };

        match fetched {
            Ok(()) => {
                metrics::record_download(started.elapsed());
                transition(spec, ProvisionState::Downloaded);
                Ok(())
            }
            Err(e) => {
                transition(spec, ProvisionState::DownloadFailed);
                discard_partial_fetch(base, created).await;
                Err(fail(FailureKind::Fetch(e)))
            }
        }
    }

    async fn quantize(
        &self,
        spec: &ModelSpecification,
        location: &CacheLocation,
    ) -> ProvisionResult<PathBuf> {
        let backend = spec.quantization_backend();
        transition(spec, ProvisionState::Quantizing);

        let result = self.deriver.derive(location.base(), backend).await;
        metrics::record_quantization(backend.as_str(), result.is_ok());

        let path = result.map_err(|e| {
            ProvisionError::new(spec.identifier().as_str(), location.quantized(), e)
        })?;
        transition(spec, ProvisionState::Quantized);
        Ok(path)
    }

    fn load(&self, spec: &ModelSpecification, path: &Path) -> ProvisionResult<ModelHandle> {
        let device = spec.device().resolve(&self.gpus);
        let options = EncodeOptions::from_spec(spec, device);

        ModelHandle::load(spec.identifier(), path, options)
            .map_err(|e| ProvisionError::new(spec.identifier().as_str(), path, e))
    }
}

fn transition(spec: &ModelSpecification, state: ProvisionState) {
    tracing::debug!(model_id = %spec.identifier(), state = %state, "Provisioning state");
}

/// Make sure a failed fetch does not leave a location that looks present
///
/// A directory created by this call is removed entirely. A directory that
/// already existed only loses its marker files.
async fn discard_partial_fetch(base: &Path, created: bool) {
    if created {
        if let Err(e) = tokio::fs::remove_dir_all(base).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = ?base, error = %e, "Failed to remove partial download");
        }
        return;
    }

    for marker in MARKER_FILES {
        let path = base.join(marker);
        if let Err(e) = tokio::fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(
                path = ?path,
                error = %e,
                "Failed to remove marker after failed download"
            );
        }
    }
}
