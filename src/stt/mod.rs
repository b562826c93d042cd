//! Speech-to-text via a Whisper-compatible transcription API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::config::SttConfig;
use crate::error::ProviderError;
use crate::llm::RetryPolicy;

/// A transcription engine: WAV bytes in, text out.
#[async_trait]
pub trait SttEngine: Send + Sync {
    /// Transcribe a WAV clip. An empty string means no recognizable
    /// speech; callers treat that as a non-error.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] after retries are exhausted.
    async fn transcribe(&self, wav: &[u8]) -> std::result::Result<String, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

/// HTTP client for a Whisper-compatible `/v1/audio/transcriptions`
/// endpoint (multipart upload).
#[derive(Clone)]
pub struct WhisperStt {
    config: SttConfig,
    http: reqwest::Client,
}

impl std::fmt::Debug for WhisperStt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperStt")
            .field("api_url", &self.config.api_url)
            .field("model_id", &self.config.model_id)
            .finish()
    }
}

impl WhisperStt {
    /// Create a client from configuration.
    pub fn new(config: SttConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/audio/transcriptions",
            self.config.api_url.trim_end_matches('/')
        )
    }

    async fn transcribe_once(&self, wav: &[u8]) -> std::result::Result<String, ProviderError> {
        let file_part = reqwest::multipart::Part::bytes(wav.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| ProviderError::Network(format!("multipart build failed: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("model", self.config.model_id.clone());

        let send = self
            .http
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .multipart(form)
            .send();

        let response = tokio::time::timeout(Duration::from_secs(self.config.timeout_secs), send)
            .await
            .map_err(|_| {
                ProviderError::Timeout(format!(
                    "STT call exceeded {}s",
                    self.config.timeout_secs
                ))
            })?
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => ProviderError::RateLimited(body),
                status => ProviderError::Api { status, body },
            });
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Network(format!("bad transcription body: {e}")))?;
        Ok(parsed.text.trim().to_owned())
    }
}

#[async_trait]
impl SttEngine for WhisperStt {
    async fn transcribe(&self, wav: &[u8]) -> std::result::Result<String, ProviderError> {
        let start = std::time::Instant::now();
        let text = RetryPolicy::default()
            .run(|| self.transcribe_once(wav))
            .await?;
        info!(
            "transcribed {} bytes in {:.0}ms: \"{text}\"",
            wav.len(),
            start.elapsed().as_millis()
        );
        Ok(text)
    }
}
