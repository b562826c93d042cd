//! Test support: scripted providers and an in-memory store.
//!
//! Every prompt chain is testable offline by scripting the model with
//! recorded responses; the TTS/STT stubs produce deterministic audio and
//! transcripts. These types are used by unit tests and the integration
//! suite; they are not part of the service's runtime surface.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::audio::{self, AudioClip};
use crate::error::{ProviderError, Result};
use crate::llm::{ChatRequest, LanguageModel, TextDeltaStream};
use crate::store::ArtifactStore;
use crate::stt::SttEngine;
use crate::tts::{TtsEngine, VoiceQuality};

/// A [`LanguageModel`] that replays recorded responses in order.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    /// Create a model that returns the given replies in order.
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of chat calls made so far.
    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Concatenated message text of the i-th request.
    pub fn request_text(&self, index: usize) -> String {
        self.requests
            .lock()
            .ok()
            .and_then(|requests| {
                requests.get(index).map(|r| {
                    r.messages
                        .iter()
                        .map(|m| m.content.clone())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            })
            .unwrap_or_default()
    }

    fn next_reply(&self, request: &ChatRequest) -> std::result::Result<String, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        match self.replies.lock() {
            Ok(mut replies) => replies.pop_front().ok_or_else(|| ProviderError::Api {
                status: 599,
                body: "scripted replies exhausted".into(),
            }),
            Err(_) => Err(ProviderError::Network("script lock poisoned".into())),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model_id(&self) -> &str {
        "scripted-model"
    }

    async fn chat(&self, request: &ChatRequest) -> std::result::Result<String, ProviderError> {
        self.next_reply(request)
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> std::result::Result<TextDeltaStream, ProviderError> {
        let reply = self.next_reply(request)?;
        // Split in two so consumers see more than one delta.
        let mid = reply.len() / 2;
        let mut cut = mid;
        while !reply.is_char_boundary(cut) {
            cut += 1;
        }
        let (head, tail) = reply.split_at(cut);
        let deltas = vec![Ok(head.to_owned()), Ok(tail.to_owned())];
        Ok(Box::pin(futures_util::stream::iter(deltas)))
    }
}

/// A [`TtsEngine`] producing a deterministic tone whose duration tracks
/// the word count (150 words per minute, matching the narration rate).
#[derive(Debug)]
pub struct StubTts {
    sample_rate: u32,
    /// Synthesis fails for any text containing this marker.
    fail_marker: Option<String>,
    calls: Mutex<usize>,
}

impl StubTts {
    /// A stub at the given sample rate.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            fail_marker: None,
            calls: Mutex::new(0),
        }
    }

    /// Fail synthesis for turns whose text contains `marker`.
    pub fn failing_on(sample_rate: u32, marker: impl Into<String>) -> Self {
        Self {
            sample_rate,
            fail_marker: Some(marker.into()),
            calls: Mutex::new(0),
        }
    }

    /// Number of synthesis calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.lock().map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl TtsEngine for StubTts {
    async fn synthesize(
        &self,
        text: &str,
        _voice_id: &str,
        _quality: &VoiceQuality,
    ) -> std::result::Result<Vec<u8>, ProviderError> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }
        if let Some(marker) = &self.fail_marker
            && text.contains(marker)
        {
            return Err(ProviderError::Api {
                status: 500,
                body: "stub synthesis failure".into(),
            });
        }
        let words = text.split_whitespace().count().max(1) as u64;
        let duration_ms = words * 60 * 1000 / 150;
        let count = (duration_ms as usize * self.sample_rate as usize) / 1000;
        let samples: Vec<i16> = (0..count)
            .map(|i| ((i as f32 * 0.05).sin() * 6_000.0) as i16)
            .collect();
        let clip = AudioClip {
            samples,
            sample_rate: self.sample_rate,
        };
        audio::encode_wav(&clip).map_err(|e| ProviderError::Api {
            status: 200,
            body: e.to_string(),
        })
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// An [`SttEngine`] returning a fixed transcript.
#[derive(Debug)]
pub struct StubStt {
    transcript: String,
    calls: Mutex<usize>,
}

impl StubStt {
    /// A stub that always transcribes to `transcript`.
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            calls: Mutex::new(0),
        }
    }

    /// Number of transcription calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.lock().map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl SttEngine for StubStt {
    async fn transcribe(&self, _wav: &[u8]) -> std::result::Result<String, ProviderError> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }
        Ok(self.transcript.clone())
    }
}

/// An in-memory [`ArtifactStore`] for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<String> {
        crate::store::validate_key(key)?;
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(key.to_owned(), bytes.to_vec());
        }
        Ok(key.to_owned())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(key).cloned())
            .ok_or_else(|| crate::error::GitcastError::NotFound(format!("no artifact at {key}")))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .objects
            .lock()
            .map(|objects| objects.contains_key(key))
            .unwrap_or(false))
    }

    async fn presign(&self, key: &str, _ttl: Duration) -> Result<String> {
        Ok(format!("/podcast-file/{key}"))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .map(|objects| {
                objects
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatParams;

    #[tokio::test]
    async fn scripted_model_replays_in_order() {
        let model = ScriptedModel::new(vec!["one".into(), "two".into()]);
        let request = ChatRequest::user_prompt("q", ChatParams::default());
        assert_eq!(model.chat(&request).await.ok().as_deref(), Some("one"));
        assert_eq!(model.chat(&request).await.ok().as_deref(), Some("two"));
        assert!(model.chat(&request).await.is_err());
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn stub_tts_duration_tracks_words() {
        let tts = StubTts::new(16_000);
        let five_words = tts
            .synthesize("one two three four five", "v", &VoiceQuality::default())
            .await;
        assert!(five_words.is_ok());
        match five_words {
            Ok(wav) => {
                let clip = match audio::decode_wav(&wav) {
                    Ok(clip) => clip,
                    Err(_) => unreachable!("stub produces valid WAV"),
                };
                // 5 words at 150 wpm = 2 seconds.
                assert!(clip.duration_ms().abs_diff(2_000) <= 5);
            }
            Err(_) => unreachable!("stub synthesis succeeded"),
        }
    }

    #[tokio::test]
    async fn stub_tts_failure_marker() {
        let tts = StubTts::failing_on(16_000, "FAIL");
        let result = tts
            .synthesize("please FAIL here", "v", &VoiceQuality::default())
            .await;
        assert!(result.is_err());
        assert_eq!(tts.calls(), 1);
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        let _ = store.put("a/b.txt", b"hi", "text/plain").await;
        assert!(matches!(store.exists("a/b.txt").await, Ok(true)));
        assert!(matches!(store.get("a/b.txt").await.as_deref(), Ok(b"hi")));
        assert_eq!(store.object_count(), 1);
    }
}
