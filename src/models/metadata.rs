//! Model metadata parsing
//!
//! Reads the three JSON files a sentence-transformers artifact carries:
//! - `modules.json`: the module pipeline (transformer, pooling, normalize...)
//! - `config_sentence_transformers.json`: prompts and similarity function
//! - `config.json`: transformer architecture, embedding dimension, etc.

use super::cache::{MODULES_MANIFEST, SENTENCE_CONFIG};
use crate::error::LoadError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Model metadata extracted from HuggingFace config.json
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HfModelMetadata {
    /// Model architecture type (e.g., "bert", "mpnet", "xlm-roberta")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,

    /// Hidden size / embedding dimension
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden_size: Option<u32>,

    /// Maximum sequence length
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_position_embeddings: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vocab_size: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_hidden_layers: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_attention_heads: Option<u32>,

    /// Weight dtype recorded by the exporter (e.g., "float32", "float16")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub torch_dtype: Option<String>,
}

/// Raw config.json structure (partial)
#[derive(Debug, Deserialize)]
struct RawConfig {
    model_type: Option<String>,
    hidden_size: Option<u32>,
    max_position_embeddings: Option<u32>,
    vocab_size: Option<u32>,
    num_hidden_layers: Option<u32>,
    num_attention_heads: Option<u32>,
    torch_dtype: Option<String>,
    // Some models use different names
    d_model: Option<u32>,
    n_positions: Option<u32>,
}

/// One stage of the sentence-transformers module pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub idx: u32,
    pub name: String,
    /// Subdirectory holding the module's files ("" for the root module)
    pub path: String,
    /// Python class of the module (e.g., "sentence_transformers.models.Pooling")
    #[serde(rename = "type")]
    pub module_type: String,
}

/// Contents of config_sentence_transformers.json
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SentenceConfig {
    /// Named prompts prepended at encode time (e.g., "search_document": "search_document: ")
    pub prompts: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_prompt_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_fn_name: Option<String>,
}

/// Parse model metadata from an artifact's config.json
///
/// # Returns
/// * `Some(HfModelMetadata)` if config.json exists and is valid
/// * `None` if config.json doesn't exist or can't be parsed
pub fn parse_model_config(artifact_path: &Path) -> Option<HfModelMetadata> {
    let config_path = artifact_path.join("config.json");

    if !config_path.exists() {
        return None;
    }

    let content = std::fs::read_to_string(&config_path).ok()?;
    let raw: RawConfig = serde_json::from_str(&content).ok()?;

    Some(HfModelMetadata {
        model_type: raw.model_type,
        hidden_size: raw.hidden_size.or(raw.d_model),
        max_position_embeddings: raw.max_position_embeddings.or(raw.n_positions),
        vocab_size: raw.vocab_size,
        num_hidden_layers: raw.num_hidden_layers,
        num_attention_heads: raw.num_attention_heads,
        torch_dtype: raw.torch_dtype,
    })
}

/// Parse the module pipeline from modules.json
pub fn parse_modules(artifact_path: &Path) -> Result<Vec<ModuleEntry>, LoadError> {
    let mut modules: Vec<ModuleEntry> = read_json(&artifact_path.join(MODULES_MANIFEST))?;
    modules.sort_by_key(|m| m.idx);
    Ok(modules)
}

/// Parse config_sentence_transformers.json
pub fn parse_sentence_config(artifact_path: &Path) -> Result<SentenceConfig, LoadError> {
    read_json(&artifact_path.join(SENTENCE_CONFIG))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, LoadError> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| LoadError::Parse {
        file: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) {
        let mut file = std::fs::File::create(dir.path().join(name)).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn test_parse_bert_config() {
        let dir = TempDir::new().unwrap();
        let content = r#"{
            "model_type": "bert",
            "hidden_size": 384,
            "max_position_embeddings": 512,
            "vocab_size": 30522,
            "num_hidden_layers": 6,
            "num_attention_heads": 12,
            "torch_dtype": "float32"
        }"#;
        write_file(&dir, "config.json", content);

        let metadata = parse_model_config(dir.path()).unwrap();

        assert_eq!(metadata.model_type, Some("bert".to_string()));
        assert_eq!(metadata.hidden_size, Some(384));
        assert_eq!(metadata.max_position_embeddings, Some(512));
        assert_eq!(metadata.vocab_size, Some(30522));
        assert_eq!(metadata.num_hidden_layers, Some(6));
        assert_eq!(metadata.num_attention_heads, Some(12));
        assert_eq!(metadata.torch_dtype, Some("float32".to_string()));
    }

    #[test]
    fn test_parse_config_with_alternative_names() {
        let dir = TempDir::new().unwrap();
        let content = r#"{
            "model_type": "t5",
            "d_model": 768,
            "n_positions": 1024,
            "vocab_size": 32128
        }"#;
        write_file(&dir, "config.json", content);

        let metadata = parse_model_config(dir.path()).unwrap();
        assert_eq!(metadata.hidden_size, Some(768));
        assert_eq!(metadata.max_position_embeddings, Some(1024));
    }

    #[test]
    fn test_parse_missing_config() {
        let dir = TempDir::new().unwrap();
        assert!(parse_model_config(dir.path()).is_none());
    }

    #[test]
    fn test_parse_modules_sorted_by_idx() {
        let dir = TempDir::new().unwrap();
        let content = r#"[
            {"idx": 1, "name": "1", "path": "1_Pooling", "type": "sentence_transformers.models.Pooling"},
            {"idx": 0, "name": "0", "path": "", "type": "sentence_transformers.models.Transformer"},
            {"idx": 2, "name": "2", "path": "2_Normalize", "type": "sentence_transformers.models.Normalize"}
        ]"#;
        write_file(&dir, MODULES_MANIFEST, content);

        let modules = parse_modules(dir.path()).unwrap();
        assert_eq!(modules.len(), 3);
        assert_eq!(modules[0].module_type, "sentence_transformers.models.Transformer");
        assert_eq!(modules[1].path, "1_Pooling");
        assert_eq!(modules[2].idx, 2);
    }

    #[test]
    fn test_parse_modules_invalid_json() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, MODULES_MANIFEST, "{\"not\": \"a list\"}");

        let err = parse_modules(dir.path()).unwrap_err();
        assert!(matches!(err, LoadError::Parse { .. }));
    }

    #[test]
    fn test_parse_sentence_config() {
        let dir = TempDir::new().unwrap();
        let content = r#"{
            "__version__": {"sentence_transformers": "3.0.1"},
            "prompts": {"search_query": "search_query: ", "search_document": "search_document: "},
            "default_prompt_name": null,
            "similarity_fn_name": "cosine"
        }"#;
        write_file(&dir, SENTENCE_CONFIG, content);

        let config = parse_sentence_config(dir.path()).unwrap();
        assert_eq!(config.prompts.len(), 2);
        assert_eq!(
            config.prompts.get("search_document").map(String::as_str),
            Some("search_document: ")
        );
        assert_eq!(config.similarity_fn_name.as_deref(), Some("cosine"));
        assert!(config.default_prompt_name.is_none());
    }

    #[test]
    fn test_parse_empty_sentence_config() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, SENTENCE_CONFIG, "{}");
        assert_eq!(
            parse_sentence_config(dir.path()).unwrap(),
            SentenceConfig::default()
        );
    }
}
