//! S3-compatible object store backend.
//!
//! Thin adapter from [`ArtifactStore`] to an `opendal` S3 operator.
//! Presigning is native: the provider signs a time-limited GET URL, so
//! artifacts are served without passing bytes through this process.

use std::time::Duration;

use async_trait::async_trait;
use opendal::Operator;
use opendal::services::S3;

use super::{ArtifactStore, validate_key};
use crate::config::StoreConfig;
use crate::error::{GitcastError, Result};

/// Object store backed by an S3-compatible service.
#[derive(Debug, Clone)]
pub struct S3Store {
    op: Operator,
}

impl S3Store {
    /// Build the operator from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GitcastError::Storage`] when the bucket or credentials
    /// are missing or the operator cannot be constructed.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let bucket = config
            .s3_bucket
            .as_deref()
            .ok_or_else(|| GitcastError::Storage("object store requires a bucket".into()))?;
        let access_key = config
            .s3_access_key
            .as_deref()
            .ok_or_else(|| GitcastError::Storage("object store requires an access key".into()))?;
        let secret_key = config
            .s3_secret_key
            .as_deref()
            .ok_or_else(|| GitcastError::Storage("object store requires a secret key".into()))?;

        let mut builder = S3::default()
            .bucket(bucket)
            .access_key_id(access_key)
            .secret_access_key(secret_key);
        if let Some(region) = config.s3_region.as_deref() {
            builder = builder.region(region);
        }
        if let Some(endpoint) = config.s3_endpoint.as_deref() {
            builder = builder.endpoint(endpoint);
        }

        let op = Operator::new(builder)
            .map_err(|e| GitcastError::Storage(format!("object store init failed: {e}")))?
            .finish();
        Ok(Self { op })
    }
}

#[async_trait]
impl ArtifactStore for S3Store {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String> {
        validate_key(key)?;
        self.op
            .write_with(key, bytes.to_vec())
            .content_type(content_type)
            .await
            .map_err(|e| GitcastError::Storage(format!("object write {key} failed: {e}")))?;
        Ok(key.to_owned())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        match self.op.read(key).await {
            Ok(buffer) => Ok(buffer.to_vec()),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => {
                Err(GitcastError::NotFound(format!("no artifact at {key}")))
            }
            Err(e) => Err(GitcastError::Storage(format!("object read {key} failed: {e}"))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.op
            .exists(key)
            .await
            .map_err(|e| GitcastError::Storage(format!("object stat {key} failed: {e}")))
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<String> {
        validate_key(key)?;
        let request = self
            .op
            .presign_read(key, ttl)
            .await
            .map_err(|e| GitcastError::Storage(format!("presign {key} failed: {e}")))?;
        Ok(request.uri().to_string())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        validate_key(prefix)?;
        let entries = self
            .op
            .list_with(prefix)
            .recursive(true)
            .await
            .map_err(|e| GitcastError::Storage(format!("object list {prefix} failed: {e}")))?;
        let mut keys: Vec<String> = entries
            .into_iter()
            .filter(|e| !e.path().ends_with('/'))
            .map(|e| e.path().to_owned())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
