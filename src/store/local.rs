//! Local filesystem store backend.
//!
//! Keys map directly to paths under the store root. `presign` returns a
//! URL routed through the serving layer (`/podcast-file/{key}`) since a
//! bare filesystem has no native presigning; the TTL is accepted for
//! interface compatibility and not enforced locally.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{ArtifactStore, validate_key};
use crate::error::{GitcastError, Result};

/// Filesystem-backed artifact store.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create the store, ensuring the root directory exists.
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root).map_err(|e| {
            GitcastError::Storage(format!("cannot create store root {}: {e}", root.display()))
        })?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// The store root (for diagnostics).
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactStore for LocalStore {
    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                GitcastError::Storage(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        // Write-then-rename so concurrent readers never see partial files.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| GitcastError::Storage(format!("write {} failed: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| GitcastError::Storage(format!("rename to {} failed: {e}", path.display())))?;
        debug!("stored {} bytes at {key}", bytes.len());
        Ok(key.to_owned())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(GitcastError::NotFound(format!("no artifact at {key}")))
            }
            Err(e) => Err(GitcastError::Storage(format!(
                "read {} failed: {e}",
                path.display()
            ))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn presign(&self, key: &str, _ttl: Duration) -> Result<String> {
        validate_key(key)?;
        Ok(format!("/podcast-file/{}", urlencoding::encode(key).replace("%2F", "/")))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        validate_key(prefix)?;
        let mut keys = Vec::new();
        let base = self.root.join(prefix);
        let walk_root = if base.is_dir() {
            base
        } else {
            match base.parent() {
                Some(parent) if parent.is_dir() => parent.to_path_buf(),
                _ => return Ok(keys),
            }
        };

        let mut pending = vec![walk_root];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) && !key.ends_with(".tmp") {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
