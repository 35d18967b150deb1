//! Error types for model provisioning
//!
//! Every failure a caller can observe is a [`ProvisionError`]: it names the
//! model, the cache location that was being worked on, and the step that
//! failed. The per-step enums below are also usable on their own.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A model request could not be turned into a valid specification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("model identifier '{0}' must have the form 'organization/name'")]
    InvalidIdentifierFormat(String),

    #[error(
        "access token does not match the HuggingFace format \
         ('hf_' followed by at least 34 letters or digits)"
    )]
    InvalidTokenFormat,

    #[error("model '{0}' is private and requires an access token")]
    MissingTokenForPrivateModel(String),

    #[error("local root {0:?} is not usable: parent directory does not exist or cannot be created")]
    InvalidLocalPath(PathBuf),

    #[error("device '{0}' is not recognized (expected cpu, gpu or cuda)")]
    InvalidDevice(String),

    #[error("batch size must be a positive integer")]
    InvalidBatchSize,
}

impl ValidationError {
    /// Name of the request field that failed validation
    pub fn field(&self) -> &'static str {
        match self {
            Self::InvalidIdentifierFormat(_) => "identifier",
            Self::InvalidTokenFormat => "access_token",
            Self::MissingTokenForPrivateModel(_) => "access_token",
            Self::InvalidLocalPath(_) => "local_root",
            Self::InvalidDevice(_) => "device",
            Self::InvalidBatchSize => "batch_size",
        }
    }
}

/// Failure while talking to the remote registry or writing what it returned
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("malformed registry response: {0}")]
    MalformedResponse(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("I/O error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => FetchError::Permission(err.to_string()),
            _ => FetchError::Io(err),
        }
    }
}

/// Failure while deriving a quantized variant from a base artifact
#[derive(Debug, Error)]
pub enum QuantizationError {
    #[error("backend '{backend}' cannot quantize this artifact: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("no weight files found under {0:?}")]
    MissingWeights(PathBuf),

    #[error("weight conversion failed: {0}")]
    Conversion(String),

    #[error("invalid artifact metadata in {file:?}: {message}")]
    InvalidMetadata { file: PathBuf, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure while loading a ready artifact into a handle
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("artifact at {0:?} is incomplete (missing marker file)")]
    Incomplete(PathBuf),

    #[error("failed to parse {file:?}: {message}")]
    Parse { file: PathBuf, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Provisioning step at which a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStage {
    Validation,
    Lookup,
    Fetch,
    Quantize,
    Load,
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Lookup => write!(f, "lookup"),
            Self::Fetch => write!(f, "fetch"),
            Self::Quantize => write!(f, "quantize"),
            Self::Load => write!(f, "load"),
        }
    }
}

/// What went wrong during provisioning
#[derive(Debug, Error)]
pub enum FailureKind {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The registry definitively does not know the identifier
    #[error("model not found in registry")]
    ModelNotFound,

    /// The registry could not be asked whether the model exists
    #[error("registry lookup failed: {0}")]
    Lookup(FetchError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Quantization(#[from] QuantizationError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

impl FailureKind {
    pub fn stage(&self) -> ProvisionStage {
        match self {
            Self::Validation(_) => ProvisionStage::Validation,
            Self::ModelNotFound | Self::Lookup(_) => ProvisionStage::Lookup,
            Self::Fetch(_) => ProvisionStage::Fetch,
            Self::Quantization(_) => ProvisionStage::Quantize,
            Self::Load(_) => ProvisionStage::Load,
        }
    }
}

/// A provisioning call failed
#[derive(Debug, Error)]
#[error("{} failed for '{identifier}' at {location:?}: {kind}", .kind.stage())]
pub struct ProvisionError {
    pub identifier: String,
    pub location: PathBuf,
    #[source]
    pub kind: FailureKind,
}

impl ProvisionError {
    pub fn new(
        identifier: impl Into<String>,
        location: impl Into<PathBuf>,
        kind: impl Into<FailureKind>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            location: location.into(),
            kind: kind.into(),
        }
    }

    pub fn stage(&self) -> ProvisionStage {
        self.kind.stage()
    }

    /// Whether retrying the same request could succeed
    ///
    /// Validation and not-found failures are definitive; everything else
    /// depends on the environment.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind,
            FailureKind::Validation(_) | FailureKind::ModelNotFound
        )
    }
}

pub type ProvisionResult<T> = std::result::Result<T, ProvisionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_field() {
        assert_eq!(
            ValidationError::InvalidIdentifierFormat("x".into()).field(),
            "identifier"
        );
        assert_eq!(ValidationError::InvalidTokenFormat.field(), "access_token");
        assert_eq!(ValidationError::InvalidDevice("tpu".into()).field(), "device");
    }

    #[test]
    fn test_permission_io_error_maps_to_permission() {
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(FetchError::from(err), FetchError::Permission(_)));

        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(FetchError::from(err), FetchError::Io(_)));
    }

    #[test]
    fn test_provision_error_display_carries_context() {
        let err = ProvisionError::new(
            "org/missing-model",
            "/models/org/missing-model",
            FailureKind::ModelNotFound,
        );
        let msg = err.to_string();
        assert!(msg.starts_with("lookup failed"));
        assert!(msg.contains("org/missing-model"));
        assert!(msg.contains("/models/org/missing-model"));
        assert_eq!(err.stage(), ProvisionStage::Lookup);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_fetch_failure_is_retryable() {
        let err = ProvisionError::new(
            "org/model",
            "/models/org/model",
            FetchError::Network("connection reset".into()),
        );
        assert_eq!(err.stage(), ProvisionStage::Fetch);
        assert!(err.is_retryable());
    }
}
