//! Storage endpoint capability trait and construction.
//!
//! An endpoint is anything that can hold content-addressed blobs:
//! a directory on local disk or an S3-compatible bucket. All higher layers
//! (content store, synchronizer) work against [`StorageBackend`] and never
//! know which kind they are talking to.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Config, EndpointConfig};
use crate::endpoint_local::LocalEndpoint;
use crate::endpoint_s3::S3Endpoint;

/// A physical storage backend holding copies of image objects, addressed
/// by fingerprint.
///
/// Implementations must make `put` atomic (tmp + rename, or object-store
/// PUT) and tolerate concurrent callers; the engine never coordinates
/// writes to the same endpoint.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Endpoint name from configuration.
    fn name(&self) -> &str;

    /// Store bytes under the fingerprint. Overwriting an existing object
    /// with identical content is allowed and harmless.
    async fn put(&self, fingerprint: &str, bytes: &[u8]) -> Result<()>;

    /// Fetch the object, or `None` if this endpoint does not hold it.
    async fn get(&self, fingerprint: &str) -> Result<Option<Vec<u8>>>;

    /// Remove the object. Removing an absent object is a no-op.
    async fn delete(&self, fingerprint: &str) -> Result<()>;

    async fn exists(&self, fingerprint: &str) -> Result<bool>;

    /// All fingerprints this endpoint currently holds. Used by the
    /// reconciliation pass.
    async fn list(&self) -> Result<Vec<String>>;
}

/// Construct a backend for one endpoint config entry.
pub fn build_endpoint(cfg: &EndpointConfig) -> Result<Arc<dyn StorageBackend>> {
    match cfg.kind.as_str() {
        "local" => Ok(Arc::new(LocalEndpoint::new(cfg)?)),
        "s3" => Ok(Arc::new(S3Endpoint::new(cfg)?)),
        other => bail!("Unknown endpoint kind: '{}'", other),
    }
}

/// All configured endpoints, resolved once at startup and shared.
///
/// `ordered` is primary-first (the read-fallback order); `by_name` serves
/// the synchronizer, which works from replica rows keyed by endpoint name.
pub struct EndpointSet {
    pub ordered: Vec<Arc<dyn StorageBackend>>,
    pub by_name: HashMap<String, Arc<dyn StorageBackend>>,
    pub primary_name: String,
}

impl EndpointSet {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut ordered = Vec::new();
        let mut by_name = HashMap::new();

        for cfg in config.endpoints_primary_first() {
            let backend = build_endpoint(cfg)?;
            by_name.insert(cfg.name.clone(), Arc::clone(&backend));
            ordered.push(backend);
        }

        Ok(Self {
            ordered,
            by_name,
            primary_name: config.primary_endpoint().name.clone(),
        })
    }

    /// Build from already-constructed backends, primary first. Used by
    /// tests to inject endpoints over temp dirs.
    pub fn from_backends(backends: Vec<Arc<dyn StorageBackend>>) -> Self {
        let primary_name = backends
            .first()
            .map(|b| b.name().to_string())
            .unwrap_or_default();
        let by_name = backends
            .iter()
            .map(|b| (b.name().to_string(), Arc::clone(b)))
            .collect();
        Self {
            ordered: backends,
            by_name,
            primary_name,
        }
    }

    pub fn primary(&self) -> &Arc<dyn StorageBackend> {
        &self.by_name[&self.primary_name]
    }

    pub fn names(&self) -> Vec<String> {
        self.ordered.iter().map(|b| b.name().to_string()).collect()
    }
}
