//! Repository URL parsing and normalization.
//!
//! Accepts `https://<host>/<owner>/<name>[.git][/...]` and extracts the
//! owner/name pair. Normalization (lowercased host, trailing slashes and
//! `.git` stripped) feeds the podcast cache key, so it must be a pure
//! function of the input.

use url::Url;

use crate::error::{GitcastError, Result};

/// A parsed repository URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoUrl {
    /// Hosting provider host, lowercased (e.g. `github.com`).
    pub host: String,
    /// Repository owner or organization.
    pub owner: String,
    /// Repository name with any `.git` suffix removed.
    pub name: String,
}

impl RepoUrl {
    /// Parse a repository URL.
    ///
    /// # Errors
    ///
    /// Returns [`GitcastError::InvalidInput`] when the URL is malformed,
    /// uses a non-http scheme, or lacks an owner/name path.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(GitcastError::InvalidInput("empty repository URL".into()));
        }

        let parsed = Url::parse(trimmed)
            .map_err(|e| GitcastError::InvalidInput(format!("invalid repository URL: {e}")))?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(GitcastError::InvalidInput(format!(
                    "unsupported URL scheme: {other}"
                )));
            }
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| GitcastError::InvalidInput("repository URL has no host".into()))?
            .to_ascii_lowercase();

        let mut segments = parsed
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()))
            .ok_or_else(|| GitcastError::InvalidInput("repository URL has no path".into()))?;

        let owner = segments
            .next()
            .ok_or_else(|| GitcastError::InvalidInput("repository URL is missing the owner".into()))?
            .to_owned();
        let name_raw = segments
            .next()
            .ok_or_else(|| GitcastError::InvalidInput("repository URL is missing the name".into()))?;
        let name = name_raw.strip_suffix(".git").unwrap_or(name_raw).to_owned();

        if owner.is_empty() || name.is_empty() {
            return Err(GitcastError::InvalidInput(
                "repository owner and name must be non-empty".into(),
            ));
        }

        Ok(Self { host, owner, name })
    }

    /// Canonical normalized form: lowercased host, no trailing slash, no
    /// `.git` suffix. This is the cache-key input.
    pub fn normalized(&self) -> String {
        format!("https://{}/{}/{}", self.host, self.owner, self.name)
    }

    /// Human-readable display name.
    pub fn display_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl std::fmt::Display for RepoUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.normalized())
    }
}
