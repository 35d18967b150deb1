//! Quantized variant derivation
//!
//! A quantized variant is always derived locally from a full-precision base
//! artifact and written to `<base>/quant`. The base directory is only ever
//! read. Work happens in a `.quant.partial` staging directory that is renamed
//! into place once complete, so a failed derivation leaves no quantized
//! location behind.
//!
//! Built-in backends:
//! - `torch`: floating-point safetensors weights are converted to float16
//! - `onnx`: the quantized ONNX export shipped with the artifact becomes
//!   `onnx/model.onnx`
//! - `openvino`: the quantized OpenVINO IR shipped with the artifact becomes
//!   `openvino/openvino_model.{xml,bin}`

use super::cache::{MARKER_FILES, MODULES_MANIFEST, QUANT_DIR};
use super::download::STAGING_DIR;
use super::metadata::parse_modules;
use super::spec::QuantizationBackend;
use crate::error::QuantizationError;
use async_trait::async_trait;
use candle_core::{DType, Tensor};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};

/// Staging directory used while a variant is being derived
pub const QUANT_STAGING_DIR: &str = ".quant.partial";

/// Record of how a quantized variant was produced
pub const QUANTIZATION_RECORD: &str = "quantization.json";

const SAFETENSORS_WEIGHTS: &str = "model.safetensors";
const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";

/// Quantized ONNX exports, most specific first
const ONNX_CANDIDATES: &[&str] = &[
    "onnx/model_qint8_avx512_vnni.onnx",
    "onnx/model_qint8_avx512.onnx",
    "onnx/model_quint8_avx2.onnx",
    "onnx/model_qint8_arm64.onnx",
    "onnx/model_quantized.onnx",
];

const OPENVINO_QUANTIZED: &str = "openvino/openvino_model_qint8_quantized";

/// Extensions of top-level transformer weights never copied verbatim into a variant
const WEIGHT_EXTENSIONS: &[&str] = &[
    "safetensors",
    "bin",
    "onnx",
    "pt",
    "h5",
    "msgpack",
    "ot",
    "gguf",
];

/// Top-level directories holding exported graphs for other runtimes
const EXPORT_DIRS: &[&str] = &["onnx", "openvino"];

#[async_trait]
pub trait QuantizationDeriver: Send + Sync {
    /// Derive a quantized variant of the artifact at `base`
    ///
    /// Returns the directory holding the variant. On error the base artifact
    /// is left exactly as it was.
    async fn derive(
        &self,
        base: &Path,
        backend: QuantizationBackend,
    ) -> Result<PathBuf, QuantizationError>;
}

/// Deriver implementing the built-in backends on the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalDeriver;

#[async_trait]
impl QuantizationDeriver for LocalDeriver {
    async fn derive(
        &self,
        base: &Path,
        backend: QuantizationBackend,
    ) -> Result<PathBuf, QuantizationError> {
        let base = base.to_path_buf();
        tokio::task::spawn_blocking(move || derive_variant(&base, backend))
            .await
            .map_err(|e| QuantizationError::Conversion(format!("quantization task failed: {}", e)))?
    }
}

/// Blocking implementation of [`LocalDeriver`]
pub fn derive_variant(
    base: &Path,
    backend: QuantizationBackend,
) -> Result<PathBuf, QuantizationError> {
    let target = base.join(QUANT_DIR);
    let staging = base.join(QUANT_STAGING_DIR);

    tracing::info!(base = ?base, backend = %backend, "Deriving quantized variant");

    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;

    let result = build_variant(base, &staging, backend).and_then(|()| promote(&staging, &target));

    match result {
        Ok(()) => {
            tracing::info!(path = ?target, backend = %backend, "Quantized variant ready");
            Ok(target)
        }
        Err(e) => {
            if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                tracing::warn!(
                    path = ?staging,
                    error = %cleanup,
                    "Failed to remove quantization staging directory"
                );
            }
            tracing::error!(base = ?base, backend = %backend, error = %e, "Quantization failed");
            Err(e)
        }
    }
}

fn build_variant(
    base: &Path,
    staging: &Path,
    backend: QuantizationBackend,
) -> Result<(), QuantizationError> {
    copy_support_files(base, staging, true)?;

    let sources = match backend {
        QuantizationBackend::Torch => convert_torch_weights(base, staging)?,
        QuantizationBackend::Onnx => promote_onnx_export(base, staging)?,
        QuantizationBackend::OpenVino => promote_openvino_export(base, staging)?,
    };

    write_record(staging, backend, &sources)?;

    // Markers last
    for marker in MARKER_FILES {
        std::fs::copy(base.join(marker), staging.join(marker))?;
    }

    Ok(())
}

/// Swap the finished staging directory into the quantized location
fn promote(staging: &Path, target: &Path) -> Result<(), QuantizationError> {
    if target.exists() {
        tracing::debug!(path = ?target, "Replacing incomplete quantized variant");
        std::fs::remove_dir_all(target)?;
    }
    std::fs::rename(staging, target)?;
    Ok(())
}

/// Recursively copy configs, tokenizer files and module directories
///
/// Hidden entries are always skipped. At the root, the transformer weights,
/// exported graphs and marker files are left out as well; module
/// directories (`1_Pooling`, `2_Dense`...) are copied whole, weights included.
fn copy_support_files(from: &Path, to: &Path, top_level: bool) -> Result<(), QuantizationError> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();

        if name.starts_with('.') {
            continue;
        }

        if path.is_dir() {
            let reserved = name == QUANT_DIR
                || name == STAGING_DIR
                || EXPORT_DIRS.contains(&name.as_str());
            if top_level && reserved {
                continue;
            }
            let dest = to.join(&name);
            std::fs::create_dir_all(&dest)?;
            copy_support_files(&path, &dest, false)?;
            continue;
        }

        if top_level && (MARKER_FILES.contains(&name.as_str()) || name == SAFETENSORS_INDEX) {
            continue;
        }
        if top_level && is_weight_file(&path) {
            continue;
        }

        std::fs::copy(&path, to.join(&name))?;
    }

    Ok(())
}

fn is_weight_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| WEIGHT_EXTENSIONS.contains(&ext))
}

fn convert_torch_weights(base: &Path, staging: &Path) -> Result<Vec<String>, QuantizationError> {
    let index_path = base.join(SAFETENSORS_INDEX);

    let shards: Vec<String> = if index_path.exists() {
        let shards = read_shard_names(&index_path)?;
        std::fs::copy(&index_path, staging.join(SAFETENSORS_INDEX))?;
        shards
    } else if base.join(SAFETENSORS_WEIGHTS).exists() {
        vec![SAFETENSORS_WEIGHTS.to_string()]
    } else {
        return Err(QuantizationError::MissingWeights(base.to_path_buf()));
    };

    tracing::debug!(shard_count = shards.len(), "Converting safetensors weights to float16");

    for shard in &shards {
        convert_safetensors(&base.join(shard), &staging.join(shard))?;
    }

    let mut sources = shards;
    sources.extend(convert_module_weights(base, staging)?);

    mark_config_dtype(staging, "float16")?;
    Ok(sources)
}

/// Convert safetensors weights of the modules listed in modules.json
///
/// The module directories were already copied into `staging`; converted
/// files overwrite those copies.
fn convert_module_weights(base: &Path, staging: &Path) -> Result<Vec<String>, QuantizationError> {
    let modules = parse_modules(base).map_err(|e| QuantizationError::InvalidMetadata {
        file: base.join(MODULES_MANIFEST),
        message: e.to_string(),
    })?;

    let mut converted = Vec::new();
    for module in modules.iter().filter(|m| !m.path.is_empty()) {
        let relative = Path::new(&module.path);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(QuantizationError::InvalidMetadata {
                file: base.join(MODULES_MANIFEST),
                message: format!("module path '{}' escapes the artifact", module.path),
            });
        }

        let module_dir = base.join(relative);
        if !module_dir.is_dir() {
            continue;
        }

        for entry in std::fs::read_dir(&module_dir)? {
            let path = entry?.path();
            let is_safetensors = path.extension().and_then(|e| e.to_str()) == Some("safetensors");
            if !path.is_file() || !is_safetensors {
                continue;
            }
            let Some(file_name) = path.file_name() else {
                continue;
            };

            convert_safetensors(&path, &staging.join(relative).join(file_name))?;
            converted.push(format!("{}/{}", module.path, file_name.to_string_lossy()));
        }
    }

    converted.sort();
    Ok(converted)
}

/// Collect unique shard file names from a safetensors index
fn read_shard_names(index_path: &Path) -> Result<Vec<String>, QuantizationError> {
    let invalid = |message: String| QuantizationError::InvalidMetadata {
        file: index_path.to_path_buf(),
        message,
    };

    let content = std::fs::read_to_string(index_path)?;
    let index: serde_json::Value =
        serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?;

    let weight_map = index
        .get("weight_map")
        .and_then(|v| v.as_object())
        .ok_or_else(|| invalid("missing weight_map".to_string()))?;

    let shards: BTreeSet<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
    if shards.is_empty() {
        return Err(invalid("weight_map lists no shards".to_string()));
    }
    if shards.iter().any(|s| s.contains('/') || s.contains('\\')) {
        return Err(invalid("shard names must be plain file names".to_string()));
    }

    Ok(shards.into_iter().map(String::from).collect())
}

fn convert_safetensors(src: &Path, dst: &Path) -> Result<(), QuantizationError> {
    let conversion = |e: candle_core::Error| {
        QuantizationError::Conversion(format!("{}: {}", src.display(), e))
    };

    let tensors =
        candle_core::safetensors::load(src, &candle_core::Device::Cpu).map_err(conversion)?;

    let mut converted: HashMap<String, Tensor> = HashMap::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        let tensor = match tensor.dtype() {
            DType::F32 | DType::F64 => tensor.to_dtype(DType::F16).map_err(conversion)?,
            _ => tensor,
        };
        converted.insert(name, tensor);
    }

    candle_core::safetensors::save(&converted, dst).map_err(conversion)
}

/// Record the new weight dtype in the variant's config.json, if it has one
fn mark_config_dtype(staging: &Path, dtype: &str) -> Result<(), QuantizationError> {
    let config_path = staging.join("config.json");
    if !config_path.exists() {
        return Ok(());
    }

    let content = std::fs::read_to_string(&config_path)?;
    let mut config: serde_json::Value =
        serde_json::from_str(&content).map_err(|e| QuantizationError::InvalidMetadata {
            file: config_path.clone(),
            message: e.to_string(),
        })?;

    if let Some(object) = config.as_object_mut() {
        object.insert("torch_dtype".to_string(), serde_json::Value::from(dtype));
    }

    let rendered = serde_json::to_string_pretty(&config).map_err(|e| {
        QuantizationError::InvalidMetadata {
            file: config_path.clone(),
            message: e.to_string(),
        }
    })?;
    std::fs::write(&config_path, rendered)?;
    Ok(())
}

fn promote_onnx_export(base: &Path, staging: &Path) -> Result<Vec<String>, QuantizationError> {
    let source = ONNX_CANDIDATES
        .iter()
        .find(|candidate| base.join(candidate).is_file())
        .ok_or_else(|| QuantizationError::BackendUnavailable {
            backend: QuantizationBackend::Onnx.to_string(),
            reason: "artifact ships no quantized ONNX export".to_string(),
        })?;

    let dest_dir = staging.join("onnx");
    std::fs::create_dir_all(&dest_dir)?;
    std::fs::copy(base.join(source), dest_dir.join("model.onnx"))?;

    Ok(vec![source.to_string()])
}

fn promote_openvino_export(base: &Path, staging: &Path) -> Result<Vec<String>, QuantizationError> {
    let xml = format!("{}.xml", OPENVINO_QUANTIZED);
    let bin = format!("{}.bin", OPENVINO_QUANTIZED);

    if !base.join(&xml).is_file() || !base.join(&bin).is_file() {
        return Err(QuantizationError::BackendUnavailable {
            backend: QuantizationBackend::OpenVino.to_string(),
            reason: "artifact ships no quantized OpenVINO IR".to_string(),
        });
    }

    let dest_dir = staging.join("openvino");
    std::fs::create_dir_all(&dest_dir)?;
    std::fs::copy(base.join(&xml), dest_dir.join("openvino_model.xml"))?;
    std::fs::copy(base.join(&bin), dest_dir.join("openvino_model.bin"))?;

    Ok(vec![xml, bin])
}

#[derive(Serialize)]
struct QuantizationRecord<'a> {
    backend: QuantizationBackend,
    sources: &'a [String],
}

fn write_record(
    staging: &Path,
    backend: QuantizationBackend,
    sources: &[String],
) -> Result<(), QuantizationError> {
    let path = staging.join(QUANTIZATION_RECORD);
    let record = QuantizationRecord { backend, sources };
    let rendered = serde_json::to_string_pretty(&record).map_err(|e| {
        QuantizationError::InvalidMetadata {
            file: path.clone(),
            message: e.to_string(),
        }
    })?;
    std::fs::write(&path, rendered)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cache::{MODULES_MANIFEST, SENTENCE_CONFIG, is_present};
    use tempfile::TempDir;

    fn base_artifact(dir: &TempDir) -> PathBuf {
        let base = dir.path().join("org/model");
        std::fs::create_dir_all(base.join("1_Pooling")).unwrap();
        std::fs::write(base.join(MODULES_MANIFEST), "[]").unwrap();
        std::fs::write(base.join(SENTENCE_CONFIG), "{}").unwrap();
        std::fs::write(
            base.join("config.json"),
            r#"{"model_type": "bert", "torch_dtype": "float32"}"#,
        )
        .unwrap();
        std::fs::write(base.join("tokenizer.json"), "{}").unwrap();
        std::fs::write(base.join("1_Pooling/config.json"), "{}").unwrap();
        base
    }

    fn write_weights(path: &Path) {
        let device = candle_core::Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "embeddings.weight".to_string(),
            Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &device).unwrap(),
        );
        tensors.insert(
            "position_ids".to_string(),
            Tensor::new(&[0u32, 1, 2], &device).unwrap(),
        );
        candle_core::safetensors::save(&tensors, path).unwrap();
    }

    #[test]
    fn test_torch_converts_weights_to_f16() {
        let dir = TempDir::new().unwrap();
        let base = base_artifact(&dir);
        write_weights(&base.join(SAFETENSORS_WEIGHTS));

        let quant = derive_variant(&base, QuantizationBackend::Torch).unwrap();
        assert_eq!(quant, base.join(QUANT_DIR));
        assert!(is_present(&quant));
        assert!(quant.join("tokenizer.json").exists());
        assert!(quant.join("1_Pooling/config.json").exists());
        assert!(quant.join(QUANTIZATION_RECORD).exists());

        let tensors = candle_core::safetensors::load(
            quant.join(SAFETENSORS_WEIGHTS),
            &candle_core::Device::Cpu,
        )
        .unwrap();
        assert_eq!(tensors["embeddings.weight"].dtype(), DType::F16);
        assert_eq!(tensors["position_ids"].dtype(), DType::U32);

        let config: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(quant.join("config.json")).unwrap())
                .unwrap();
        assert_eq!(config["torch_dtype"], "float16");

        // Base untouched
        let base_config = std::fs::read_to_string(base.join("config.json")).unwrap();
        assert!(base_config.contains("float32"));
        assert!(!base.join(QUANT_STAGING_DIR).exists());
    }

    #[test]
    fn test_torch_converts_sharded_weights() {
        let dir = TempDir::new().unwrap();
        let base = base_artifact(&dir);
        write_weights(&base.join("model-00001-of-00002.safetensors"));
        write_weights(&base.join("model-00002-of-00002.safetensors"));
        std::fs::write(
            base.join(SAFETENSORS_INDEX),
            r#"{"weight_map": {
                "a": "model-00001-of-00002.safetensors",
                "b": "model-00002-of-00002.safetensors",
                "c": "model-00002-of-00002.safetensors"
            }}"#,
        )
        .unwrap();

        let quant = derive_variant(&base, QuantizationBackend::Torch).unwrap();
        assert!(quant.join("model-00001-of-00002.safetensors").exists());
        assert!(quant.join("model-00002-of-00002.safetensors").exists());
        assert!(quant.join(SAFETENSORS_INDEX).exists());
    }

    fn add_dense_module(base: &Path) {
        std::fs::write(
            base.join(MODULES_MANIFEST),
            r#"[
                {"idx": 0, "name": "0", "path": "", "type": "sentence_transformers.models.Transformer"},
                {"idx": 1, "name": "1", "path": "1_Pooling", "type": "sentence_transformers.models.Pooling"},
                {"idx": 2, "name": "2", "path": "2_Dense", "type": "sentence_transformers.models.Dense"}
            ]"#,
        )
        .unwrap();
        std::fs::create_dir_all(base.join("2_Dense")).unwrap();
        std::fs::write(base.join("2_Dense/config.json"), r#"{"out_features": 256}"#).unwrap();
        write_weights(&base.join("2_Dense/model.safetensors"));
    }

    #[test]
    fn test_torch_converts_module_weights() {
        let dir = TempDir::new().unwrap();
        let base = base_artifact(&dir);
        write_weights(&base.join(SAFETENSORS_WEIGHTS));
        add_dense_module(&base);

        let quant = derive_variant(&base, QuantizationBackend::Torch).unwrap();
        assert!(quant.join("2_Dense/config.json").exists());

        let tensors = candle_core::safetensors::load(
            quant.join("2_Dense/model.safetensors"),
            &candle_core::Device::Cpu,
        )
        .unwrap();
        assert_eq!(tensors["embeddings.weight"].dtype(), DType::F16);

        let record = std::fs::read_to_string(quant.join(QUANTIZATION_RECORD)).unwrap();
        assert!(record.contains("2_Dense/model.safetensors"));

        // Base module weights keep their precision
        let base_tensors = candle_core::safetensors::load(
            base.join("2_Dense/model.safetensors"),
            &candle_core::Device::Cpu,
        )
        .unwrap();
        assert_eq!(base_tensors["embeddings.weight"].dtype(), DType::F32);
    }

    #[test]
    fn test_onnx_keeps_module_weights() {
        let dir = TempDir::new().unwrap();
        let base = base_artifact(&dir);
        add_dense_module(&base);
        std::fs::write(base.join("2_Dense/pytorch_model.bin"), "dense").unwrap();
        std::fs::create_dir_all(base.join("onnx")).unwrap();
        std::fs::write(base.join("onnx/model_quantized.onnx"), "int8").unwrap();

        let quant = derive_variant(&base, QuantizationBackend::Onnx).unwrap();
        assert!(quant.join("2_Dense/model.safetensors").exists());
        assert_eq!(
            std::fs::read_to_string(quant.join("2_Dense/pytorch_model.bin")).unwrap(),
            "dense"
        );
        // Top-level transformer weights are still left out
        assert!(!quant.join(SAFETENSORS_WEIGHTS).exists());
    }

    #[test]
    fn test_module_path_outside_artifact_rejected() {
        let dir = TempDir::new().unwrap();
        let base = base_artifact(&dir);
        write_weights(&base.join(SAFETENSORS_WEIGHTS));
        std::fs::write(
            base.join(MODULES_MANIFEST),
            r#"[{"idx": 1, "name": "1", "path": "../elsewhere", "type": "sentence_transformers.models.Dense"}]"#,
        )
        .unwrap();

        let err = derive_variant(&base, QuantizationBackend::Torch).unwrap_err();
        assert!(matches!(err, QuantizationError::InvalidMetadata { .. }));
        assert!(!base.join(QUANT_DIR).exists());
    }

    #[test]
    fn test_torch_without_weights_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let base = base_artifact(&dir);

        let err = derive_variant(&base, QuantizationBackend::Torch).unwrap_err();
        assert!(matches!(err, QuantizationError::MissingWeights(_)));
        assert!(!base.join(QUANT_DIR).exists());
        assert!(!base.join(QUANT_STAGING_DIR).exists());
        assert!(is_present(&base));
    }

    #[test]
    fn test_onnx_promotes_quantized_export() {
        let dir = TempDir::new().unwrap();
        let base = base_artifact(&dir);
        std::fs::create_dir_all(base.join("onnx")).unwrap();
        std::fs::write(base.join("onnx/model.onnx"), "full").unwrap();
        std::fs::write(base.join("onnx/model_qint8_avx512.onnx"), "int8").unwrap();

        let quant = derive_variant(&base, QuantizationBackend::Onnx).unwrap();
        assert_eq!(
            std::fs::read_to_string(quant.join("onnx/model.onnx")).unwrap(),
            "int8"
        );
        assert!(is_present(&quant));
    }

    #[test]
    fn test_openvino_without_export_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let base = base_artifact(&dir);

        let err = derive_variant(&base, QuantizationBackend::OpenVino).unwrap_err();
        assert!(matches!(err, QuantizationError::BackendUnavailable { .. }));
        assert!(!is_present(&base.join(QUANT_DIR)));
        assert!(is_present(&base));
    }

    #[test]
    fn test_openvino_promotes_quantized_ir() {
        let dir = TempDir::new().unwrap();
        let base = base_artifact(&dir);
        std::fs::create_dir_all(base.join("openvino")).unwrap();
        std::fs::write(base.join("openvino/openvino_model_qint8_quantized.xml"), "<xml/>").unwrap();
        std::fs::write(base.join("openvino/openvino_model_qint8_quantized.bin"), "bin").unwrap();

        let quant = derive_variant(&base, QuantizationBackend::OpenVino).unwrap();
        assert!(quant.join("openvino/openvino_model.xml").exists());
        assert!(quant.join("openvino/openvino_model.bin").exists());
    }

    #[test]
    fn test_stale_quant_dir_is_replaced() {
        let dir = TempDir::new().unwrap();
        let base = base_artifact(&dir);
        write_weights(&base.join(SAFETENSORS_WEIGHTS));
        std::fs::create_dir_all(base.join(QUANT_DIR)).unwrap();
        std::fs::write(base.join(QUANT_DIR).join(MODULES_MANIFEST), "[]").unwrap();

        let quant = derive_variant(&base, QuantizationBackend::Torch).unwrap();
        assert!(is_present(&quant));
    }

    #[tokio::test]
    async fn test_local_deriver_runs_off_runtime() {
        let dir = TempDir::new().unwrap();
        let base = base_artifact(&dir);
        write_weights(&base.join(SAFETENSORS_WEIGHTS));

        let quant = LocalDeriver
            .derive(&base, QuantizationBackend::Torch)
            .await
            .unwrap();
        assert!(is_present(&quant));
    }
}
