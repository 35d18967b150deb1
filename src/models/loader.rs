//! Local-only model loading
//!
//! Turns a ready cache location into a [`ModelHandle`]: the module pipeline,
//! sentence-transformers config and transformer metadata read from disk,
//! together with the encode options of the [`ModelSpecification`]. Nothing here
//! touches the network.

use super::cache::is_present;
use super::metadata::{
    HfModelMetadata, ModuleEntry, SentenceConfig, parse_model_config, parse_modules,
    parse_sentence_config,
};
use super::quantize::QUANTIZATION_RECORD;
use super::spec::{Device, ModelId, ModelSpecification, QuantizationBackend};
use crate::error::LoadError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Options applied when the handle is used to encode text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EncodeOptions {
    pub batch_size: usize,
    pub device: Device,
    pub trust_remote_code: bool,
    pub show_progress: bool,
}

impl EncodeOptions {
    pub fn from_spec(spec: &ModelSpecification, device: Device) -> Self {
        Self {
            batch_size: spec.batch_size(),
            device,
            trust_remote_code: spec.trust_remote_code(),
            show_progress: spec.show_progress(),
        }
    }
}

/// A model artifact loaded from the local cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelHandle {
    identifier: ModelId,
    path: PathBuf,
    modules: Vec<ModuleEntry>,
    sentence_config: SentenceConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<HfModelMetadata>,
    options: EncodeOptions,
    /// Backend of a quantized variant, `None` for a full-precision artifact
    #[serde(skip_serializing_if = "Option::is_none")]
    quantization: Option<QuantizationBackend>,
}

#[derive(Deserialize)]
struct QuantizationRecordRef {
    backend: QuantizationBackend,
}

impl ModelHandle {
    /// Load the artifact at `path`, local files only
    pub fn load(
        identifier: &ModelId,
        path: &Path,
        options: EncodeOptions,
    ) -> Result<Self, LoadError> {
        if !is_present(path) {
            return Err(LoadError::Incomplete(path.to_path_buf()));
        }

        let modules = parse_modules(path)?;
        let sentence_config = parse_sentence_config(path)?;
        let metadata = parse_model_config(path);
        let quantization = read_quantization_backend(path)?;

        tracing::debug!(
            model_id = %identifier,
            path = ?path,
            module_count = modules.len(),
            device = %options.device,
            "Model handle loaded"
        );

        Ok(Self {
            identifier: identifier.clone(),
            path: path.to_path_buf(),
            modules,
            sentence_config,
            metadata,
            options,
            quantization,
        })
    }

    pub fn identifier(&self) -> &ModelId {
        &self.identifier
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Module pipeline, ordered by `idx`
    pub fn modules(&self) -> &[ModuleEntry] {
        &self.modules
    }

    pub fn sentence_config(&self) -> &SentenceConfig {
        &self.sentence_config
    }

    pub fn metadata(&self) -> Option<&HfModelMetadata> {
        self.metadata.as_ref()
    }

    pub fn options(&self) -> &EncodeOptions {
        &self.options
    }

    pub fn batch_size(&self) -> usize {
        self.options.batch_size
    }

    pub fn device(&self) -> Device {
        self.options.device
    }

    pub fn trust_remote_code(&self) -> bool {
        self.options.trust_remote_code
    }

    pub fn show_progress(&self) -> bool {
        self.options.show_progress
    }

    pub fn quantization(&self) -> Option<QuantizationBackend> {
        self.quantization
    }

    /// Embedding dimension, when config.json records one
    pub fn embedding_dimension(&self) -> Option<u32> {
        self.metadata.as_ref().and_then(|m| m.hidden_size)
    }
}

fn read_quantization_backend(path: &Path) -> Result<Option<QuantizationBackend>, LoadError> {
    let record_path = path.join(QUANTIZATION_RECORD);
    if !record_path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(&record_path)?;
    let record: QuantizationRecordRef =
        serde_json::from_str(&content).map_err(|e| LoadError::Parse {
            file: record_path,
            message: e.to_string(),
        })?;
    Ok(Some(record.backend))
}
