//! Remote model registry interface
//!
//! The provisioner only needs two things from a registry: whether it knows
//! an identifier, and a way to pull the full artifact tree into a local
//! directory. Transport, authentication and retry policy live behind this
//! trait; [`super::download::HfHubRegistry`] is the HuggingFace Hub adapter.

use super::spec::{AccessToken, ModelId};
use crate::error::FetchError;
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait RemoteRegistry: Send + Sync {
    /// Check whether the registry knows `identifier`
    ///
    /// Unauthorized, forbidden and not-found responses all yield `Ok(false)`,
    /// so a private model queried without a valid credential is
    /// indistinguishable from a missing one. Errors are reserved for failures
    /// to reach the registry at all.
    async fn exists(
        &self,
        identifier: &ModelId,
        credential: Option<&AccessToken>,
    ) -> Result<bool, FetchError>;

    /// Download the complete artifact tree of `identifier` into `destination`
    ///
    /// Implementations write the cache marker files last: if this returns an
    /// error, the destination must not look present to
    /// [`super::cache::is_present`].
    async fn fetch(
        &self,
        identifier: &ModelId,
        credential: Option<&AccessToken>,
        destination: &Path,
    ) -> Result<(), FetchError>;
}
