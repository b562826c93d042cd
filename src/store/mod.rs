//! Artifact storage: one contract, two backends.
//!
//! Podcast artifacts (audio, scripts, metadata, the cache index) are
//! addressed by storage keys and written through [`ArtifactStore`].
//! The local backend keeps files under the configured root and presigns
//! by routing through the serving layer; the object backend uses an
//! S3-compatible operator with native presigning. Selection is purely
//! configuration: credentials present → object store. Consumers never
//! branch on the backend.

pub mod local;
pub mod object;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::StoreConfig;
use crate::error::Result;

/// Storage contract shared by both backends.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write bytes under a key; returns the storage handle (the key).
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String>;

    /// Read the bytes stored under a key.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// A time-limited URL granting read access to a key.
    async fn presign(&self, key: &str, ttl: Duration) -> Result<String>;

    /// Keys under a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Build the store selected by configuration.
///
/// # Errors
///
/// Returns an error when the selected backend cannot be initialized.
pub fn build_store(config: &StoreConfig) -> Result<Arc<dyn ArtifactStore>> {
    if config.object_store_configured() {
        tracing::info!(
            "using object store (bucket: {})",
            config.s3_bucket.as_deref().unwrap_or("")
        );
        Ok(Arc::new(object::S3Store::new(config)?))
    } else {
        tracing::info!("using local store at {}", config.root.display());
        Ok(Arc::new(local::LocalStore::new(config.root.clone())?))
    }
}

/// Validate a storage key: relative, normalized, no traversal.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    use crate::error::GitcastError;
    if key.is_empty() {
        return Err(GitcastError::Storage("empty storage key".into()));
    }
    if key.starts_with('/') || key.contains("..") || key.contains('\\') {
        return Err(GitcastError::Storage(format!("invalid storage key: {key}")));
    }
    Ok(())
}
