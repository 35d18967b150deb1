//! Model resolution and local cache
//!
//! Provides functionality for:
//! - Validating model specifications
//! - Detecting complete artifacts in the local cache
//! - Checking and fetching models from a remote registry (HuggingFace Hub)
//! - Deriving quantized variants locally
//! - Parsing model metadata and loading ready artifacts into handles

pub mod cache;
pub mod download;
pub mod loader;
pub mod metadata;
pub mod quantize;
pub mod registry;
pub mod spec;

pub use cache::{CacheLocation, cache_size, default_cache_dir, is_present, list_cached_models};
pub use download::HfHubRegistry;
pub use loader::{EncodeOptions, ModelHandle};
pub use metadata::{HfModelMetadata, ModuleEntry, SentenceConfig, parse_model_config};
pub use quantize::{LocalDeriver, QuantizationDeriver};
pub use registry::RemoteRegistry;
pub use spec::{
    AccessToken, Device, DevicePreference, ModelId, ModelRequest, ModelSpecification,
    QuantizationBackend,
};
