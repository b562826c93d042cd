//! Error types for the gitcast pipelines.
//!
//! Every error that crosses a component boundary is one of the variants
//! here, and each carries a stable string code (snake_case) that is part
//! of the wire contract: HTTP error bodies and terminal stream events
//! report it via [`GitcastError::code()`]. Codes do not change across
//! releases.

/// Errors from the repository hosting provider.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The provider rate-limited us and retries were exhausted.
    #[error("upstream rate limited: {0}")]
    RateLimited(String),

    /// Repository (or a file within it) does not exist.
    #[error("upstream not found: {0}")]
    NotFound(String),

    /// Private repository or invalid credentials.
    #[error("upstream unauthorized: {0}")]
    Unauthorized(String),

    /// Transport-level failure talking to the provider.
    #[error("upstream network error: {0}")]
    Network(String),
}

impl UpstreamError {
    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "upstream_rate_limited",
            Self::NotFound(_) => "upstream_not_found",
            Self::Unauthorized(_) => "upstream_unauthorized",
            Self::Network(_) => "upstream_network",
        }
    }
}

/// Errors from the LLM, TTS, or STT providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Provider returned 429 and retries were exhausted.
    #[error("provider rate limited: {0}")]
    RateLimited(String),

    /// A single call exceeded its deadline.
    #[error("provider timeout: {0}")]
    Timeout(String),

    /// The provider refused the content.
    #[error("provider content filtered: {0}")]
    ContentFiltered(String),

    /// Non-retryable API error with the provider's status and body.
    #[error("provider error ({status}): {body}")]
    Api {
        /// HTTP status returned by the provider.
        status: u16,
        /// Response body (possibly truncated).
        body: String,
    },

    /// Transport-level failure before a response arrived.
    #[error("provider network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "provider_rate_limited",
            Self::Timeout(_) => "provider_timeout",
            Self::ContentFiltered(_) => "provider_content_filtered",
            Self::Api { .. } | Self::Network(_) => "provider_other",
        }
    }

    /// Whether the retry policy may attempt this call again.
    ///
    /// Rate limits, timeouts, transport failures and provider 5xx are
    /// retryable; content filtering and other 4xx are fatal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited(_) | Self::Timeout(_) | Self::Network(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::ContentFiltered(_) => false,
        }
    }
}

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum GitcastError {
    /// Malformed URL, unsupported host, or out-of-range parameters.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A requested artifact or cache key does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Repository host failure.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// LLM/TTS/STT provider failure.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// LLM output failed post-processing after the one repair pass.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Audio concatenation or encoding failure.
    #[error("audio assembly failed: {0}")]
    Assembly(String),

    /// Persistence layer failure.
    #[error("storage failed: {0}")]
    Storage(String),

    /// Anything unexpected.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GitcastError {
    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::Upstream(e) => e.code(),
            Self::Provider(e) => e.code(),
            Self::Validation(_) => "validation_failed",
            Self::Assembly(_) => "assembly_failed",
            Self::Storage(_) => "storage_failed",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status this error maps to on non-streaming endpoints.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::NotFound(_) | Self::Upstream(UpstreamError::NotFound(_)) => 404,
            Self::Upstream(UpstreamError::RateLimited(_)) => 429,
            _ => 500,
        }
    }
}

impl From<std::io::Error> for GitcastError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, GitcastError>;
