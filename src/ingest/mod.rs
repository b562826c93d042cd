//! Repository ingestion: URL → snapshot.
//!
//! Talks to the hosting provider's REST API (GitHub-shaped) to resolve
//! the default branch, fetch the recursive file tree and README, and read
//! a bounded selection of representative source files. The snapshot is
//! immutable and lives only for the duration of a request; its content
//! hash is what the podcast cache uses to detect upstream changes.

pub mod tree;
pub mod url;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::error::{GitcastError, Result, UpstreamError};
pub use tree::{EntryKind, FileTree, TreeNode};
pub use url::RepoUrl;

/// Retry attempts for upstream fetches.
const FETCH_ATTEMPTS: u32 = 3;

/// Window scanned for NUL bytes when sniffing binary content.
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// Root manifest files, always selected when present.
const MANIFESTS: &[&str] = &[
    "package.json",
    "pyproject.toml",
    "Cargo.toml",
    "go.mod",
    "setup.py",
    "requirements.txt",
    "Gemfile",
    "pom.xml",
    "build.gradle",
    "composer.json",
];

/// Filename stems treated as root entry points.
const ENTRY_STEMS: &[&str] = &["main", "index", "app", "server", "cli"];

/// Extensions considered readable source/text.
const TEXT_EXTENSIONS: &[&str] = &[
    "py", "rs", "js", "ts", "tsx", "jsx", "go", "rb", "java", "kt", "c", "h", "cpp", "hpp", "cs",
    "php", "swift", "scala", "sh", "toml", "json", "yaml", "yml", "md", "txt", "cfg", "ini",
    "gradle", "mod", "lock",
];

/// Why a file was selected into the snapshot; doubles as its retention
/// priority when the context builder must shed content (lowest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRole {
    /// One-level-deep module under `src/` or equivalent.
    Module,
    /// Documentation file (`.md` near the root, README excluded).
    Doc,
    /// Root-level source entry point.
    EntryPoint,
    /// Root manifest (`Cargo.toml`, `package.json`, …).
    Manifest,
}

/// One file read into the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedFile {
    /// Path from the repository root.
    pub path: String,
    /// Full text content (bounded by the ingest size cap).
    pub content: String,
    /// Selection role / retention priority.
    pub role: FileRole,
}

/// Repository identity and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoInfo {
    /// Canonical normalized URL.
    pub url: String,
    /// Owner or organization.
    pub owner: String,
    /// Repository name.
    pub name: String,
    /// `owner/name` display form.
    pub display_name: String,
    /// Default branch ref.
    pub default_branch: String,
}

/// Immutable snapshot of a repository's textual surface.
#[derive(Debug, Clone)]
pub struct RepoSnapshot {
    /// Identity and metadata.
    pub info: RepoInfo,
    /// Bounded file tree.
    pub tree: FileTree,
    /// README text, empty when the repository has none.
    pub readme: String,
    /// Selected representative files.
    pub files: Vec<SelectedFile>,
}

impl RepoSnapshot {
    /// Hash over the snapshot's textual surface, used by the podcast
    /// cache to detect upstream changes. Hex-encoded SHA-256.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, kind) in self.tree.flatten() {
            hasher.update(path.as_bytes());
            hasher.update(match kind {
                EntryKind::File => b"f" as &[u8],
                EntryKind::Dir => b"d",
            });
            hasher.update(b"\n");
        }
        hasher.update(b"README\n");
        hasher.update(self.readme.as_bytes());
        for file in &self.files {
            hasher.update(file.path.as_bytes());
            hasher.update(b"\n");
            hasher.update(file.content.as_bytes());
        }
        hex_digest(hasher)
    }
}

// ── Provider wire types ───────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RepoMeta {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct GitTreeResponse {
    tree: Vec<GitTreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct GitTreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ContentFile {
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
}

// ── Ingestor ──────────────────────────────────────────────────

/// Repository ingestor over the hosting provider's REST API.
#[derive(Debug, Clone)]
pub struct Ingestor {
    http: reqwest::Client,
    config: IngestConfig,
}

impl Ingestor {
    /// Create an ingestor from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: IngestConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .user_agent("gitcast")
            .build()
            .map_err(|e| GitcastError::Internal(format!("HTTP client build failed: {e}")))?;
        Ok(Self { http, config })
    }

    /// Fetch a repository snapshot for the given URL.
    ///
    /// # Errors
    ///
    /// Returns [`GitcastError::InvalidInput`] for malformed URLs and
    /// [`UpstreamError`] variants for provider failures.
    pub async fn parse(&self, raw_url: &str) -> Result<RepoSnapshot> {
        let repo_url = RepoUrl::parse(raw_url)?;
        info!("ingesting {}", repo_url);

        let meta: RepoMeta = self
            .get_json(&format!(
                "{}/repos/{}/{}",
                self.config.api_base, repo_url.owner, repo_url.name
            ))
            .await?;
        debug!("default branch: {}", meta.default_branch);

        let tree_response: GitTreeResponse = self
            .get_json(&format!(
                "{}/repos/{}/{}/git/trees/{}?recursive=1",
                self.config.api_base, repo_url.owner, repo_url.name, meta.default_branch
            ))
            .await?;

        let mut sizes: HashMap<String, u64> = HashMap::new();
        let mut entries: Vec<(String, EntryKind)> = Vec::with_capacity(tree_response.tree.len());
        for entry in &tree_response.tree {
            let kind = match entry.kind.as_str() {
                "blob" => EntryKind::File,
                "tree" => EntryKind::Dir,
                _ => continue,
            };
            if kind == EntryKind::File
                && let Some(size) = entry.size
            {
                sizes.insert(entry.path.clone(), size);
            }
            entries.push((entry.path.clone(), kind));
        }
        if tree_response.truncated {
            warn!("provider truncated the tree listing for {}", repo_url);
        }

        let tree = FileTree::from_flat(&entries, self.config.max_tree_entries);
        if tree.truncated {
            info!(
                "tree capped at {} entries ({} total)",
                self.config.max_tree_entries, tree.total_entries
            );
        }

        let readme = self.fetch_readme(&repo_url).await?;

        let candidates = select_candidates(&tree, self.config.max_selected_files, |path| {
            sizes
                .get(path)
                .is_none_or(|size| *size <= self.config.max_file_bytes as u64)
        });
        let mut files = Vec::with_capacity(candidates.len());
        for (path, role) in candidates {
            match self
                .fetch_file(&repo_url, &meta.default_branch, &path)
                .await
            {
                Ok(Some(content)) => files.push(SelectedFile {
                    path,
                    content,
                    role,
                }),
                Ok(None) => debug!("skipping binary file {path}"),
                Err(e) => warn!("failed to read {path}: {e}"),
            }
        }

        info!(
            "snapshot ready: {} tree entries, {} selected files, readme {} bytes",
            tree.total_entries,
            files.len(),
            readme.len()
        );

        Ok(RepoSnapshot {
            info: RepoInfo {
                url: repo_url.normalized(),
                owner: repo_url.owner.clone(),
                name: repo_url.name.clone(),
                display_name: repo_url.display_name(),
                default_branch: meta.default_branch,
            },
            tree,
            readme,
            files,
        })
    }

    /// Fetch the README text, or empty when the repo has none.
    async fn fetch_readme(&self, repo_url: &RepoUrl) -> Result<String> {
        let url = format!(
            "{}/repos/{}/{}/readme",
            self.config.api_base, repo_url.owner, repo_url.name
        );
        match self.get_json::<ContentFile>(&url).await {
            Ok(content) => Ok(decode_content(&content).unwrap_or_default()),
            Err(GitcastError::Upstream(UpstreamError::NotFound(_))) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Read one file's text content; `None` when it sniffs as binary.
    async fn fetch_file(
        &self,
        repo_url: &RepoUrl,
        branch: &str,
        path: &str,
    ) -> Result<Option<String>> {
        let url = format!(
            "{}/repos/{}/{}/contents/{}?ref={}",
            self.config.api_base,
            repo_url.owner,
            repo_url.name,
            urlencoding::encode(path).replace("%2F", "/"),
            branch
        );
        let content: ContentFile = self.get_json(&url).await?;
        match decode_content(&content) {
            Some(text) if text.len() <= self.config.max_file_bytes => Ok(Some(text)),
            Some(_) => Ok(None),
            None => Ok(None),
        }
    }

    /// GET with retry and typed upstream errors.
    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut last_error = UpstreamError::Network("no attempt made".into());

        for attempt in 0..FETCH_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let mut request = self.http.get(url).header("Accept", "application/vnd.github+json");
            if let Some(token) = &self.config.token {
                request = request.header("Authorization", format!("Bearer {token}"));
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = UpstreamError::Network(e.to_string());
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<T>()
                    .await
                    .map_err(|e| UpstreamError::Network(format!("bad response body: {e}")).into());
            }

            let rate_limited = status.as_u16() == 429
                || (status.as_u16() == 403 && rate_limit_exhausted(response.headers()));
            let body = response.text().await.unwrap_or_default();

            if rate_limited {
                last_error = UpstreamError::RateLimited(truncate(&body, 200));
                continue;
            }
            if status.is_server_error() {
                last_error = UpstreamError::Network(format!("{status}: {}", truncate(&body, 200)));
                continue;
            }

            // Non-retryable.
            return Err(match status.as_u16() {
                404 => UpstreamError::NotFound(url.to_owned()),
                401 | 403 => UpstreamError::Unauthorized(truncate(&body, 200)),
                _ => UpstreamError::Network(format!("{status}: {}", truncate(&body, 200))),
            }
            .into());
        }

        Err(last_error.into())
    }
}

/// Exponential backoff with jitter for upstream retries.
fn backoff_delay(attempt: u32) -> Duration {
    use rand::Rng as _;
    let base = 500u64.saturating_mul(1 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..250);
    Duration::from_millis(base + jitter)
}

fn rate_limit_exhausted(headers: &reqwest::header::HeaderMap) -> bool {
    headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0")
}

/// Decode a contents-API payload; `None` when it is not valid text.
fn decode_content(content: &ContentFile) -> Option<String> {
    if content.encoding != "base64" {
        return None;
    }
    let stripped: String = content.content.split_whitespace().collect();
    let bytes = base64::engine::general_purpose::STANDARD.decode(stripped).ok()?;
    if is_binary(&bytes) {
        return None;
    }
    String::from_utf8(bytes).ok()
}

/// Binary signature: a NUL byte in the sniff window.
fn is_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0)
}

/// Classify a tree path into a selection role.
fn classify(path: &str) -> Option<FileRole> {
    let depth = path.split('/').filter(|s| !s.is_empty()).count();
    let basename = path.rsplit('/').next().unwrap_or(path);
    let (stem, extension) = match basename.rsplit_once('.') {
        Some((stem, ext)) => (stem, ext.to_ascii_lowercase()),
        None => (basename, String::new()),
    };

    if depth == 1 && MANIFESTS.contains(&basename) {
        return Some(FileRole::Manifest);
    }
    if !TEXT_EXTENSIONS.contains(&extension.as_str()) {
        return None;
    }
    if extension == "md" {
        let is_readme = stem.eq_ignore_ascii_case("readme");
        if depth <= 2 && !is_readme {
            return Some(FileRole::Doc);
        }
        return None;
    }
    if depth == 1 && ENTRY_STEMS.contains(&stem) {
        return Some(FileRole::EntryPoint);
    }
    if depth == 2 {
        let top = path.split('/').next().unwrap_or("");
        if matches!(top, "src" | "lib" | "app" | "pkg" | "source") {
            return Some(FileRole::Module);
        }
    }
    None
}

/// Pick up to `cap` candidate files from the tree, highest role first,
/// skipping those rejected by the size filter.
fn select_candidates(
    tree: &FileTree,
    cap: usize,
    size_ok: impl Fn(&str) -> bool,
) -> Vec<(String, FileRole)> {
    let mut candidates: Vec<(String, FileRole)> = tree
        .flatten()
        .into_iter()
        .filter(|(_, kind)| *kind == EntryKind::File)
        .filter_map(|(path, _)| classify(&path).map(|role| (path, role)))
        .filter(|(path, _)| size_ok(path))
        .collect();
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    candidates.truncate(cap);
    candidates
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_owned()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
