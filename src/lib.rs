//! Embedding Provisioner - model resolution and local-cache provisioning
//!
//! Validates model specifications, checks the local cache, fetches missing
//! sentence-transformers artifacts from a remote registry, optionally derives
//! a quantized variant, and loads the result into a ready-to-use handle.

pub mod config;
pub mod error;
pub mod gpu;
pub mod metrics;
pub mod models;
pub mod provisioner;

pub use config::{AppConfig, RegistryConfig};
pub use error::{
    FailureKind, FetchError, LoadError, ProvisionError, ProvisionResult, ProvisionStage,
    QuantizationError, ValidationError,
};
pub use models::{ModelHandle, ModelRequest, ModelSpecification};
pub use provisioner::{ModelProvisioner, ProvisionState, ProvisionedModel, ProvisioningResult};
