//! Configuration types for the gitcast service.
//!
//! Configuration is layered: built-in defaults, then an optional TOML
//! file, then `GITCAST_*` environment variables. Secrets (provider API
//! keys, object-store credentials) are only ever read from the
//! environment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{GitcastError, Result};

/// Top-level configuration for the service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Repository ingestion settings.
    pub ingest: IngestConfig,
    /// Prompt-context budgeting settings.
    pub context: ContextConfig,
    /// LLM provider settings.
    pub llm: LlmConfig,
    /// Text-to-speech provider settings.
    pub tts: TtsConfig,
    /// Speech-to-text provider settings.
    pub stt: SttConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Podcast generation settings.
    pub podcast: PodcastConfig,
    /// Artifact store settings.
    pub store: StoreConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind, `host:port`.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8700".to_owned(),
        }
    }
}

/// Repository ingestion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Base URL of the hosting provider's REST API.
    pub api_base: String,
    /// Optional access token lifting anonymous rate limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Maximum size of a file read into the snapshot, in bytes.
    pub max_file_bytes: usize,
    /// Maximum number of selected files per snapshot.
    pub max_selected_files: usize,
    /// Tree node cap; deeper entries beyond it are elided.
    pub max_tree_entries: usize,
    /// Per-request timeout in seconds.
    pub fetch_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_owned(),
            token: None,
            max_file_bytes: 64 * 1024,
            max_selected_files: 12,
            max_tree_entries: 5_000,
            fetch_timeout_secs: 30,
        }
    }
}

/// Prompt-context budgeting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Advertised model context window, in tokens.
    pub model_context_window: usize,
    /// Fraction of the window the builder may fill.
    pub safety_factor: f64,
}

impl ContextConfig {
    /// Effective token budget for a built context.
    pub fn token_budget(&self) -> usize {
        (self.model_context_window as f64 * self.safety_factor) as usize
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            model_context_window: 32_768,
            safety_factor: 0.9,
        }
    }
}

/// LLM provider configuration (OpenAI-compatible chat API).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider base URL.
    pub api_url: String,
    /// API key (environment only; never serialized).
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Model to use.
    pub model_id: String,
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
    /// Retry attempts for rate limits and timeouts.
    pub max_attempts: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com".to_owned(),
            api_key: String::new(),
            model_id: "gpt-4o-mini".to_owned(),
            timeout_secs: 60,
            max_attempts: 3,
        }
    }
}

/// Text-to-speech provider configuration (ElevenLabs-compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Provider base URL.
    pub api_url: String,
    /// API key (environment only; never serialized).
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Output sample rate in Hz (16-bit mono PCM).
    pub sample_rate: u32,
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.elevenlabs.io".to_owned(),
            api_key: String::new(),
            sample_rate: 24_000,
            timeout_secs: 30,
        }
    }
}

/// Speech-to-text provider configuration (Whisper-compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Provider base URL.
    pub api_url: String,
    /// API key (environment only; never serialized).
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Transcription model.
    pub model_id: String,
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com".to_owned(),
            api_key: String::new(),
            model_id: "whisper-1".to_owned(),
            timeout_secs: 30,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold for speech classification.
    ///
    /// Frames with RMS above this value count as speech. Typical values
    /// for f32 samples in \[-1, 1\]: 0.005 very sensitive, 0.01 normal,
    /// 0.02 for noisy environments.
    pub threshold: f32,
    /// Analysis frame length in ms.
    pub frame_ms: u32,
    /// Padding kept around detected speech in ms.
    pub speech_pad_ms: u32,
    /// Minimum total speech duration in ms for a clip to count as speech.
    pub min_speech_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            frame_ms: 30,
            speech_pad_ms: 150,
            min_speech_ms: 250,
        }
    }
}

/// Podcast generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PodcastConfig {
    /// Default host voice id.
    pub host_voice_id: String,
    /// Default expert voice id.
    pub expert_voice_id: String,
    /// Target words per minute of narration.
    pub words_per_minute: u32,
    /// Silence inserted between turns in the combined file, in ms.
    pub turn_gap_ms: u32,
    /// Retries per turn before substituting silence.
    pub tts_retries: u32,
    /// Depth of the segment handoff channel between batcher and sender.
    pub segment_channel_depth: usize,
    /// End-to-end generation timeout in seconds.
    pub generation_timeout_secs: u64,
}

impl Default for PodcastConfig {
    fn default() -> Self {
        Self {
            host_voice_id: "EXAVITQu4vr4xnSDxMaL".to_owned(),
            expert_voice_id: "ErXwobaYiN019PkySvjV".to_owned(),
            words_per_minute: 150,
            turn_gap_ms: 200,
            tts_retries: 2,
            segment_channel_depth: 4,
            generation_timeout_secs: 600,
        }
    }
}

/// Artifact store configuration.
///
/// When the S3 fields are all present the object-store backend is
/// selected; otherwise artifacts live on the local filesystem under
/// `root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Local store root.
    pub root: PathBuf,
    /// Presigned URL lifetime in seconds.
    pub presign_ttl_secs: u64,
    /// S3 bucket name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_bucket: Option<String>,
    /// S3 region.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_region: Option<String>,
    /// S3 endpoint override (for S3-compatible stores).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_endpoint: Option<String>,
    /// S3 access key id (environment only; never serialized).
    #[serde(skip_serializing)]
    pub s3_access_key: Option<String>,
    /// S3 secret access key (environment only; never serialized).
    #[serde(skip_serializing)]
    pub s3_secret_key: Option<String>,
}

impl StoreConfig {
    /// Whether object-store credentials are fully configured.
    pub fn object_store_configured(&self) -> bool {
        self.s3_bucket.is_some() && self.s3_access_key.is_some() && self.s3_secret_key.is_some()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        let root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gitcast");
        Self {
            root,
            presign_ttl_secs: 3_600,
            s3_bucket: None,
            s3_region: None,
            s3_endpoint: None,
            s3_access_key: None,
            s3_secret_key: None,
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults, then the TOML file at `path` if it
    /// exists, then the environment overlay.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    GitcastError::Internal(format!("failed to read config {}: {e}", p.display()))
                })?;
                toml::from_str(&raw).map_err(|e| {
                    GitcastError::Internal(format!("invalid config {}: {e}", p.display()))
                })?
            }
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Overlay `GITCAST_*` environment variables onto this config.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_nonempty("GITCAST_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = env_nonempty("GITCAST_GITHUB_TOKEN") {
            self.ingest.token = Some(v);
        }
        if let Some(v) = env_nonempty("GITCAST_LLM_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(v) = env_nonempty("GITCAST_LLM_API_URL") {
            self.llm.api_url = v;
        }
        if let Some(v) = env_nonempty("GITCAST_MODEL_ID") {
            self.llm.model_id = v;
        }
        if let Some(v) = env_nonempty("GITCAST_MODEL_CONTEXT_WINDOW")
            && let Ok(n) = v.parse()
        {
            self.context.model_context_window = n;
        }
        if let Some(v) = env_nonempty("GITCAST_TTS_API_KEY") {
            self.tts.api_key = v;
        }
        if let Some(v) = env_nonempty("GITCAST_TTS_API_URL") {
            self.tts.api_url = v;
        }
        if let Some(v) = env_nonempty("GITCAST_STT_API_KEY") {
            self.stt.api_key = v;
        }
        if let Some(v) = env_nonempty("GITCAST_STT_API_URL") {
            self.stt.api_url = v;
        }
        if let Some(v) = env_nonempty("GITCAST_STORE_ROOT") {
            self.store.root = PathBuf::from(v);
        }
        if let Some(v) = env_nonempty("GITCAST_S3_BUCKET") {
            self.store.s3_bucket = Some(v);
        }
        if let Some(v) = env_nonempty("GITCAST_S3_REGION") {
            self.store.s3_region = Some(v);
        }
        if let Some(v) = env_nonempty("GITCAST_S3_ENDPOINT") {
            self.store.s3_endpoint = Some(v);
        }
        if let Some(v) = env_nonempty("GITCAST_S3_ACCESS_KEY") {
            self.store.s3_access_key = Some(v);
        }
        if let Some(v) = env_nonempty("GITCAST_S3_SECRET_KEY") {
            self.store.s3_secret_key = Some(v);
        }
    }

    /// Validate that required settings are present.
    pub fn validate(&self) -> Result<()> {
        if self.llm.api_key.trim().is_empty() {
            return Err(GitcastError::Internal(
                "LLM API key is not configured (set GITCAST_LLM_API_KEY)".to_owned(),
            ));
        }
        if self.context.safety_factor <= 0.0 || self.context.safety_factor > 1.0 {
            return Err(GitcastError::Internal(
                "context.safety_factor must be in (0, 1]".to_owned(),
            ));
        }
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
