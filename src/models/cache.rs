//! Local model cache inspection
//!
//! Models are stored under a single root, one directory per identifier:
//! ```text
//! <root>/
//! ├── BAAI/
//! │   └── bge-small-en-v1.5/
//! │       ├── modules.json
//! │       ├── config_sentence_transformers.json
//! │       ├── config.json
//! │       ├── model.safetensors
//! │       ├── tokenizer.json
//! │       ├── 1_Pooling/
//! │       │   └── config.json
//! │       └── quant/                 (quantized variant, if requested)
//! │           ├── modules.json
//! │           ├── config_sentence_transformers.json
//! │           └── ...
//! └── sentence-transformers/
//!     └── all-MiniLM-L6-v2/
//!         └── ...
//! ```
//!
//! A location only counts as present when both marker files exist directly
//! under it. A directory holding a partial download is absent.

use super::spec::ModelId;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Module manifest written by sentence-transformers
pub const MODULES_MANIFEST: &str = "modules.json";

/// Framework config written by sentence-transformers
pub const SENTENCE_CONFIG: &str = "config_sentence_transformers.json";

/// Both files that must exist for a location to count as present
pub const MARKER_FILES: [&str; 2] = [MODULES_MANIFEST, SENTENCE_CONFIG];

/// Subdirectory of the base location holding the quantized variant
pub const QUANT_DIR: &str = "quant";

/// Get the standard model directory
///
/// Checks in order:
/// 1. `$EMBED_PROVISIONER_HOME`
/// 2. `$XDG_CACHE_HOME/embedding-provisioner/models`
/// 3. `~/.cache/embedding-provisioner/models`
pub fn default_cache_dir() -> PathBuf {
    if let Ok(home) = std::env::var("EMBED_PROVISIONER_HOME") {
        return PathBuf::from(home);
    }

    if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        return PathBuf::from(xdg_cache).join("embedding-provisioner/models");
    }

    dirs::home_dir()
        .map(|h| h.join(".cache/embedding-provisioner/models"))
        .unwrap_or_else(|| PathBuf::from("/tmp/embedding-provisioner/models"))
}

/// Deterministic on-disk location of a model under a cache root
///
/// The base artifact lives at `<root>/<org>/<name>`, the quantized variant
/// at `<root>/<org>/<name>/quant`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheLocation {
    base: PathBuf,
    quantized: bool,
}

impl CacheLocation {
    pub fn new(root: &Path, identifier: &ModelId, quantized: bool) -> Self {
        Self {
            base: root.join(identifier.organization()).join(identifier.name()),
            quantized,
        }
    }

    /// Directory of the full-precision artifact
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory of the quantized variant
    pub fn quantized(&self) -> PathBuf {
        self.base.join(QUANT_DIR)
    }

    /// Directory the request is ultimately served from
    pub fn target(&self) -> PathBuf {
        if self.quantized {
            self.quantized()
        } else {
            self.base.clone()
        }
    }

    pub fn is_quantized(&self) -> bool {
        self.quantized
    }
}

/// Check whether a complete artifact exists at `location`
///
/// Filesystem errors other than "not found" are logged and read as absent.
pub fn is_present(location: &Path) -> bool {
    MARKER_FILES
        .iter()
        .all(|marker| marker_exists(&location.join(marker)))
}

fn marker_exists(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(metadata) => metadata.is_file(),
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(
                path = ?path,
                error = %e,
                "Cannot inspect cache marker, treating as absent"
            );
            false
        }
    }
}

/// Get the total size of a cached location in bytes
pub fn cache_size(location: &Path) -> Option<u64> {
    if !location.exists() {
        return None;
    }

    Some(dir_size(location))
}

/// Recursively calculate directory size
fn dir_size(path: &Path) -> u64 {
    let mut size = 0;

    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                size += dir_size(&path);
            } else if let Ok(metadata) = std::fs::metadata(&path) {
                size += metadata.len();
            }
        }
    }

    size
}

/// List all models with a complete base artifact under `root`
pub fn list_cached_models(root: &Path) -> Vec<String> {
    let mut models = Vec::new();

    let Ok(orgs) = std::fs::read_dir(root) else {
        return models;
    };

    for org in orgs.flatten() {
        if !org.path().is_dir() {
            continue;
        }
        let Ok(names) = std::fs::read_dir(org.path()) else {
            continue;
        };

        for name in names.flatten() {
            let model_id = format!(
                "{}/{}",
                org.file_name().to_string_lossy(),
                name.file_name().to_string_lossy()
            );

            // Skip staging directories and anything that is not a valid id
            if ModelId::parse(&model_id).is_ok() && is_present(&name.path()) {
                models.push(model_id);
            }
        }
    }

    models.sort();
    models
}
