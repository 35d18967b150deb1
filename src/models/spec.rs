//! Model specifications
//!
//! A [`ModelRequest`] is the raw, user-supplied description of a model (from
//! the CLI, a TOML config or another service). Turning it into a
//! [`ModelSpecification`] runs every validation rule; a specification value
//! is therefore always fully valid and never changes afterwards.

use super::cache::{CacheLocation, default_cache_dir};
use crate::error::ValidationError;
use crate::gpu::GpuInfo;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

/// Prefix of HuggingFace user access tokens
pub const TOKEN_PREFIX: &str = "hf_";

/// Batch size used when a request does not set one
pub const DEFAULT_BATCH_SIZE: usize = 32;

static IDENTIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_\-]+/[A-Za-z0-9_\-.]+$").expect("identifier pattern is valid")
});

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^{TOKEN_PREFIX}[A-Za-z0-9]{{34,}}$")).expect("token pattern is valid")
});

/// Registry identifier in `organization/name` form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        if !IDENTIFIER_RE.is_match(value) {
            return Err(ValidationError::InvalidIdentifierFormat(value.to_string()));
        }

        // The name becomes a path component under the cache root
        let name = value.split_once('/').map(|(_, name)| name).unwrap_or_default();
        if name == "." || name == ".." {
            return Err(ValidationError::InvalidIdentifierFormat(value.to_string()));
        }

        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn organization(&self) -> &str {
        self.0.split_once('/').map(|(org, _)| org).unwrap_or(&self.0)
    }

    pub fn name(&self) -> &str {
        self.0.split_once('/').map(|(_, name)| name).unwrap_or(&self.0)
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry access token
///
/// Never printed: `Debug` shows only the prefix.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        if !TOKEN_RE.is_match(value) {
            return Err(ValidationError::InvalidTokenFormat);
        }
        Ok(Self(value.to_string()))
    }

    /// Raw token, for handing to the registry transport
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken({TOKEN_PREFIX}***)")
    }
}

/// Requested compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Pick CUDA when a GPU is visible, CPU otherwise
    #[default]
    Auto,
    Cpu,
    Cuda,
}

impl DevicePreference {
    /// Normalize a user-supplied device name
    ///
    /// `gpu` and `cuda` (any case) mean CUDA, `cpu` means CPU, `auto` or no
    /// value means automatic selection.
    pub fn parse(value: Option<&str>) -> Result<Self, ValidationError> {
        let Some(raw) = value else {
            return Ok(Self::Auto);
        };

        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "gpu" | "cuda" => Ok(Self::Cuda),
            _ => Err(ValidationError::InvalidDevice(raw.to_string())),
        }
    }

    /// Resolve to a concrete device given the GPUs visible to this process
    pub fn resolve(self, gpus: &GpuInfo) -> Device {
        match self {
            Self::Cpu => Device::Cpu,
            Self::Cuda => Device::Cuda,
            Self::Auto if gpus.count() > 0 => Device::Cuda,
            Self::Auto => Device::Cpu,
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
        }
    }
}

/// Concrete device an artifact is loaded for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
        }
    }
}

/// On-disk representation a quantized variant is derived into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantizationBackend {
    /// Half-precision safetensors weights
    Torch,
    /// Quantized ONNX graph
    Onnx,
    /// Quantized OpenVINO IR
    #[default]
    OpenVino,
}

impl QuantizationBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Torch => "torch",
            Self::Onnx => "onnx",
            Self::OpenVino => "openvino",
        }
    }
}

impl fmt::Display for QuantizationBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuantizationBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "torch" => Ok(Self::Torch),
            "onnx" => Ok(Self::Onnx),
            "openvino" => Ok(Self::OpenVino),
            other => Err(format!(
                "unknown quantization backend '{other}' (expected torch, onnx or openvino)"
            )),
        }
    }
}

/// Raw model request, as written in config files or built by callers
#[derive(Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelRequest {
    /// HuggingFace model ID (e.g., "sentence-transformers/all-MiniLM-L6-v2")
    pub identifier: String,
    pub is_private: bool,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    /// Root directory models are stored under
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_root: Option<PathBuf>,
    pub trust_remote_code: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub quantize: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization_backend: Option<QuantizationBackend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_progress: Option<bool>,
}

impl ModelRequest {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Default::default()
        }
    }
}

impl fmt::Debug for ModelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRequest")
            .field("identifier", &self.identifier)
            .field("is_private", &self.is_private)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("local_root", &self.local_root)
            .field("trust_remote_code", &self.trust_remote_code)
            .field("batch_size", &self.batch_size)
            .field("device", &self.device)
            .field("quantize", &self.quantize)
            .field("quantization_backend", &self.quantization_backend)
            .field("show_progress", &self.show_progress)
            .finish()
    }
}

/// Validated, immutable description of a model and where it lives locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpecification {
    identifier: ModelId,
    is_private: bool,
    access_token: Option<AccessToken>,
    local_root: PathBuf,
    trust_remote_code: bool,
    batch_size: usize,
    device: DevicePreference,
    quantize: bool,
    quantization_backend: QuantizationBackend,
    show_progress: bool,
}

impl ModelSpecification {
    /// Validate a request, falling back to the standard cache directory
    pub fn from_request(request: ModelRequest) -> Result<Self, ValidationError> {
        Self::from_request_with_root(request, &default_cache_dir())
    }

    /// Validate a request, using `default_root` when it sets no local root
    ///
    /// Checks run in field order and the first failure is returned. Checks
    /// that touch the filesystem run last, so a malformed request never
    /// creates directories.
    pub fn from_request_with_root(
        request: ModelRequest,
        default_root: &Path,
    ) -> Result<Self, ValidationError> {
        let identifier = ModelId::parse(&request.identifier)?;

        let access_token = request
            .access_token
            .as_deref()
            .map(AccessToken::parse)
            .transpose()?;

        if request.is_private && access_token.is_none() {
            return Err(ValidationError::MissingTokenForPrivateModel(
                identifier.to_string(),
            ));
        }

        let device = DevicePreference::parse(request.device.as_deref())?;

        let batch_size = request.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(ValidationError::InvalidBatchSize);
        }

        let local_root = match request.local_root {
            Some(root) => validate_local_root(root)?,
            None => ensure_default_root(default_root)?,
        };

        Ok(Self {
            identifier,
            is_private: request.is_private,
            access_token,
            local_root,
            trust_remote_code: request.trust_remote_code,
            batch_size,
            device,
            quantize: request.quantize,
            quantization_backend: request.quantization_backend.unwrap_or_default(),
            show_progress: request.show_progress.unwrap_or(true),
        })
    }

    pub fn identifier(&self) -> &ModelId {
        &self.identifier
    }

    pub fn is_private(&self) -> bool {
        self.is_private
    }

    pub fn access_token(&self) -> Option<&AccessToken> {
        self.access_token.as_ref()
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn trust_remote_code(&self) -> bool {
        self.trust_remote_code
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn device(&self) -> DevicePreference {
        self.device
    }

    pub fn quantize(&self) -> bool {
        self.quantize
    }

    pub fn quantization_backend(&self) -> QuantizationBackend {
        self.quantization_backend
    }

    pub fn show_progress(&self) -> bool {
        self.show_progress
    }

    /// Where this model's artifact lives under the local root
    pub fn cache_location(&self) -> CacheLocation {
        CacheLocation::new(&self.local_root, &self.identifier, self.quantize)
    }
}

impl TryFrom<ModelRequest> for ModelSpecification {
    type Error = ValidationError;

    fn try_from(request: ModelRequest) -> Result<Self, Self::Error> {
        Self::from_request(request)
    }
}

/// An explicit root is accepted when its parent directory exists
fn validate_local_root(root: PathBuf) -> Result<PathBuf, ValidationError> {
    let parent_exists = match root.parent() {
        // Filesystem root, or a bare relative name under the working directory
        None => true,
        Some(parent) if parent.as_os_str().is_empty() => true,
        Some(parent) => parent.is_dir(),
    };

    if !parent_exists {
        return Err(ValidationError::InvalidLocalPath(root));
    }
    Ok(root)
}

fn ensure_default_root(root: &Path) -> Result<PathBuf, ValidationError> {
    std::fs::create_dir_all(root).map_err(|e| {
        tracing::warn!(path = ?root, error = %e, "Cannot create standard model directory");
        ValidationError::InvalidLocalPath(root.to_path_buf())
    })?;
    Ok(root.to_path_buf())
}
