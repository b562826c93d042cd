//! Text-to-speech synthesis via an ElevenLabs-compatible provider.
//!
//! The engine contract returns WAV bytes (16-bit mono PCM at the
//! engine's sample rate) so the podcast batcher and the voice endpoints
//! never re-encode. The HTTP client requests raw PCM from the provider
//! and wraps it in a WAV container itself.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::audio;
use crate::config::TtsConfig;
use crate::error::ProviderError;

/// Voice quality parameters, matching the provider's
/// `voice_settings` record field-for-field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceQuality {
    /// Voice stability, \[0, 1\].
    pub stability: f32,
    /// Similarity boost, \[0, 1\].
    pub similarity_boost: f32,
    /// Style exaggeration, \[0, 1\].
    pub style: f32,
    /// Speaker boost toggle.
    pub use_speaker_boost: bool,
}

impl Default for VoiceQuality {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity_boost: 0.75,
            style: 0.0,
            use_speaker_boost: true,
        }
    }
}

impl VoiceQuality {
    /// Whether every parameter is within its documented range.
    pub fn is_valid(&self) -> bool {
        let in_unit = |v: f32| (0.0..=1.0).contains(&v);
        in_unit(self.stability) && in_unit(self.similarity_boost) && in_unit(self.style)
    }
}

/// A synthesis engine: text in, WAV bytes out.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    /// Synthesize one utterance with the given voice.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`]; retries are the caller's policy
    /// (the podcast batcher substitutes silence after its retries).
    async fn synthesize(
        &self,
        text: &str,
        voice_id: &str,
        quality: &VoiceQuality,
    ) -> std::result::Result<Vec<u8>, ProviderError>;

    /// Output sample rate of the WAV bytes.
    fn sample_rate(&self) -> u32;
}

/// HTTP client for an ElevenLabs-compatible synthesis API.
#[derive(Clone)]
pub struct ElevenLabsTts {
    config: TtsConfig,
    http: reqwest::Client,
}

impl std::fmt::Debug for ElevenLabsTts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElevenLabsTts")
            .field("api_url", &self.config.api_url)
            .field("sample_rate", &self.config.sample_rate)
            .finish()
    }
}

impl ElevenLabsTts {
    /// Create a client from configuration.
    pub fn new(config: TtsConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, voice_id: &str) -> String {
        format!(
            "{}/v1/text-to-speech/{}?output_format=pcm_{}",
            self.config.api_url.trim_end_matches('/'),
            urlencoding::encode(voice_id),
            self.config.sample_rate
        )
    }

    async fn synthesize_once(
        &self,
        text: &str,
        voice_id: &str,
        quality: &VoiceQuality,
    ) -> std::result::Result<Vec<u8>, ProviderError> {
        let body = serde_json::json!({
            "text": text,
            "voice_settings": quality,
        });

        let send = self
            .http
            .post(self.endpoint(voice_id))
            .header("xi-api-key", &self.config.api_key)
            .json(&body)
            .send();

        let response = tokio::time::timeout(Duration::from_secs(self.config.timeout_secs), send)
            .await
            .map_err(|_| {
                ProviderError::Timeout(format!(
                    "TTS call exceeded {}s",
                    self.config.timeout_secs
                ))
            })?
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => ProviderError::RateLimited(body_text),
                status => ProviderError::Api {
                    status,
                    body: body_text,
                },
            });
        }

        let pcm = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Network(format!("TTS body read failed: {e}")))?;
        debug!("synthesized {} PCM bytes for voice {voice_id}", pcm.len());

        let clip = audio::clip_from_pcm(&pcm, self.config.sample_rate);
        audio::encode_wav(&clip).map_err(|e| ProviderError::Api {
            status: 200,
            body: format!("could not wrap provider PCM: {e}"),
        })
    }
}

#[async_trait]
impl TtsEngine for ElevenLabsTts {
    async fn synthesize(
        &self,
        text: &str,
        voice_id: &str,
        quality: &VoiceQuality,
    ) -> std::result::Result<Vec<u8>, ProviderError> {
        let start = std::time::Instant::now();
        // Single attempt: the podcast batcher owns the retry policy and
        // the silence fallback.
        let wav = self.synthesize_once(text, voice_id, quality).await?;
        info!(
            "synthesized {} chars in {:.0}ms",
            text.len(),
            start.elapsed().as_millis()
        );
        Ok(wav)
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }
}
