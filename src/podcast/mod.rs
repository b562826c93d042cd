//! The podcast generation engine.
//!
//! One request flows: snapshot → context → script synthesis → per-turn
//! TTS (batcher) → assembly → storage → cache record, with progress
//! delivered as an ordered event stream. The cache front-door enforces
//! the reuse discipline (files exist + content hash matches) and the
//! per-key single-flight rule: concurrent requests for one key observe
//! a single build and identical event sequences.

pub mod batcher;
pub mod cache;
pub mod events;
pub mod script;

use chrono::Utc;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::audio::{self, AudioClip};
use crate::config::PodcastConfig;
use crate::context::{ContextBuilder, Purpose};
use crate::error::{GitcastError, ProviderError, Result};
use crate::ingest::{Ingestor, RepoSnapshot, RepoUrl};
use crate::llm::LanguageModel;
use crate::store::ArtifactStore;
use crate::tts::TtsEngine;

use batcher::TtsBatcher;
use cache::{BuildHandle, BuildSlot, PodcastCache, PodcastRecord, RecordFiles, VoiceSettings};
use events::StreamEvent;
use script::PodcastScript;

pub use cache::{compute_cache_key, INDEX_KEY};

/// Allowed podcast durations in minutes.
pub const DURATION_RANGE: std::ops::RangeInclusive<u32> = 1..=15;

/// A podcast generation request (normalized core form).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodcastRequest {
    /// Repository URL as supplied by the client.
    pub repo_url: String,
    /// Target duration in minutes, 1..=15.
    pub duration_minutes: u32,
    /// Voice selection and quality.
    pub voice_settings: VoiceSettings,
}

/// What `prepare` decided for a request.
enum Preparation {
    /// Valid cached record; reuse it.
    Cached(PodcastRecord),
    /// Another request is building this key; observe it.
    Attached(Vec<StreamEvent>, broadcast::Receiver<StreamEvent>),
    /// This request owns the build.
    Build {
        cache_key: String,
        snapshot: RepoSnapshot,
        handle: BuildHandle,
    },
}

/// The end-to-end podcast pipeline.
pub struct PodcastPipeline {
    ingestor: Arc<Ingestor>,
    context_builder: ContextBuilder,
    model: Arc<dyn LanguageModel>,
    tts: Arc<dyn TtsEngine>,
    store: Arc<dyn ArtifactStore>,
    cache: Arc<PodcastCache>,
    config: PodcastConfig,
    presign_ttl: Duration,
}

impl PodcastPipeline {
    /// Assemble the pipeline from its dependencies.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ingestor: Arc<Ingestor>,
        context_builder: ContextBuilder,
        model: Arc<dyn LanguageModel>,
        tts: Arc<dyn TtsEngine>,
        store: Arc<dyn ArtifactStore>,
        cache: Arc<PodcastCache>,
        config: PodcastConfig,
        presign_ttl: Duration,
    ) -> Self {
        Self {
            ingestor,
            context_builder,
            model,
            tts,
            store,
            cache,
            config,
            presign_ttl,
        }
    }

    /// The cache handle (listing endpoints use it directly).
    pub fn cache(&self) -> &Arc<PodcastCache> {
        &self.cache
    }

    /// Default voice settings from configuration.
    pub fn default_voice_settings(&self) -> VoiceSettings {
        VoiceSettings {
            host_voice_id: self.config.host_voice_id.clone(),
            expert_voice_id: self.config.expert_voice_id.clone(),
            quality: crate::tts::VoiceQuality::default(),
        }
    }

    /// Validate request parameters.
    ///
    /// # Errors
    ///
    /// Returns [`GitcastError::InvalidInput`] for out-of-range values.
    pub fn validate_request(request: &PodcastRequest) -> Result<()> {
        if !DURATION_RANGE.contains(&request.duration_minutes) {
            return Err(GitcastError::InvalidInput(format!(
                "duration_minutes must be between {} and {}",
                DURATION_RANGE.start(),
                DURATION_RANGE.end()
            )));
        }
        if request.voice_settings.host_voice_id.trim().is_empty()
            || request.voice_settings.expert_voice_id.trim().is_empty()
        {
            return Err(GitcastError::InvalidInput(
                "host and expert voice ids must be set".into(),
            ));
        }
        if !request.voice_settings.quality.is_valid() {
            return Err(GitcastError::InvalidInput(
                "voice quality parameters must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// Produce the event stream for a generation request.
    ///
    /// Never fails: pre-build errors become a single terminal `error`
    /// event, matching the streaming endpoint's always-200 contract.
    pub async fn stream_events(
        self: &Arc<Self>,
        request: PodcastRequest,
    ) -> futures_util::stream::BoxStream<'static, StreamEvent> {
        match self.prepare(&request).await {
            Ok(Preparation::Cached(record)) => {
                info!("cache hit for {}", record.cache_key);
                let complete = self.complete_event(&record).await;
                Box::pin(observer_stream(vec![complete], None))
            }
            Ok(Preparation::Attached(history, receiver)) => {
                info!("attaching to in-flight build");
                Box::pin(observer_stream(history, Some(receiver)))
            }
            Ok(Preparation::Build {
                cache_key,
                snapshot,
                handle,
            }) => {
                let (history, receiver) = handle.attach();
                let pipeline = self.clone();
                tokio::spawn(pipeline.run_build(cache_key, request, snapshot, handle));
                Box::pin(observer_stream(history, Some(receiver)))
            }
            Err(e) => {
                warn!("podcast request failed before build: {e}");
                Box::pin(observer_stream(vec![error_event(&e)], None))
            }
        }
    }

    /// Generate (or reuse) a podcast and return the record.
    ///
    /// # Errors
    ///
    /// Propagates the build failure as its typed error kind.
    pub async fn generate(self: &Arc<Self>, request: PodcastRequest) -> Result<PodcastRecord> {
        match self.prepare(&request).await? {
            Preparation::Cached(record) => Ok(record),
            Preparation::Build {
                cache_key,
                snapshot,
                handle,
            } => {
                let outcome = self
                    .build_with_timeout(&cache_key, &request, &snapshot, &handle)
                    .await;
                let terminal = match &outcome {
                    Ok(record) => self.complete_event(record).await,
                    Err(e) => error_event(e),
                };
                handle.publish(terminal);
                self.cache.finish_build(&cache_key).await;
                outcome
            }
            Preparation::Attached(history, mut receiver) => {
                // Drain the shared build to its terminal event.
                for event in history {
                    if let Some(record) = self.record_for_terminal(&event).await? {
                        return Ok(record);
                    }
                }
                loop {
                    match receiver.recv().await {
                        Ok(event) => {
                            if let Some(record) = self.record_for_terminal(&event).await? {
                                return Ok(record);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(GitcastError::Internal(
                                "build ended without a terminal event".into(),
                            ));
                        }
                    }
                }
            }
        }
    }

    async fn record_for_terminal(&self, event: &StreamEvent) -> Result<Option<PodcastRecord>> {
        match event {
            StreamEvent::Complete { cache_key, .. } => {
                let record = self.cache.lookup(cache_key).await.ok_or_else(|| {
                    GitcastError::Internal("completed build has no cache record".into())
                })?;
                Ok(Some(record))
            }
            StreamEvent::Error { message } => Err(GitcastError::Internal(message.clone())),
            _ => Ok(None),
        }
    }

    /// Validate, snapshot, and resolve the cache/single-flight decision.
    async fn prepare(&self, request: &PodcastRequest) -> Result<Preparation> {
        Self::validate_request(request)?;
        let repo_url = RepoUrl::parse(&request.repo_url)?;
        let cache_key = compute_cache_key(
            &repo_url.normalized(),
            request.duration_minutes,
            &request.voice_settings,
        );

        let snapshot = self.ingestor.parse(&request.repo_url).await?;
        let content_hash = snapshot.content_hash();

        if let Some(record) = self.cache.lookup(&cache_key).await {
            if record.content_hash == content_hash && self.cache.files_exist(&record).await {
                self.cache.touch(&cache_key).await?;
                let refreshed = self.cache.lookup(&cache_key).await.unwrap_or(record);
                return Ok(Preparation::Cached(refreshed));
            }
            info!("cache entry {cache_key} is stale, regenerating");
            self.cache.invalidate(&cache_key).await?;
        }

        match self.cache.begin_build(&cache_key).await {
            BuildSlot::Attached(history, receiver) => Ok(Preparation::Attached(history, receiver)),
            BuildSlot::Builder(handle) => Ok(Preparation::Build {
                cache_key,
                snapshot,
                handle,
            }),
        }
    }

    /// Background task wrapper for an owned build.
    async fn run_build(
        self: Arc<Self>,
        cache_key: String,
        request: PodcastRequest,
        snapshot: RepoSnapshot,
        handle: BuildHandle,
    ) {
        let outcome = self
            .build_with_timeout(&cache_key, &request, &snapshot, &handle)
            .await;
        let terminal = match &outcome {
            Ok(record) => self.complete_event(record).await,
            Err(e) => {
                warn!("podcast build {cache_key} failed: {e}");
                error_event(e)
            }
        };
        handle.publish(terminal);
        self.cache.finish_build(&cache_key).await;
    }

    async fn build_with_timeout(
        &self,
        cache_key: &str,
        request: &PodcastRequest,
        snapshot: &RepoSnapshot,
        handle: &BuildHandle,
    ) -> Result<PodcastRecord> {
        let deadline = Duration::from_secs(self.config.generation_timeout_secs);
        match tokio::time::timeout(deadline, self.build(cache_key, request, snapshot, handle)).await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(format!(
                "podcast generation exceeded {}s",
                self.config.generation_timeout_secs
            ))
            .into()),
        }
    }

    /// The build itself: script → segments → assembly → persistence.
    async fn build(
        &self,
        cache_key: &str,
        request: &PodcastRequest,
        snapshot: &RepoSnapshot,
        handle: &BuildHandle,
    ) -> Result<PodcastRecord> {
        handle.publish(processing(0.05, "repository snapshot ready"));

        let context = self.context_builder.build(snapshot, Purpose::Podcast);
        handle.publish(processing(0.1, "writing the script"));

        let mut script = script::synthesize_script(
            &self.model,
            &context,
            &snapshot.info.display_name,
            request.duration_minutes,
            self.config.words_per_minute,
        )
        .await?;
        let total = script.turns.len();
        handle.publish(StreamEvent::Processing {
            progress: 0.12,
            message: format!("script ready: {total} turns"),
            segment_index: None,
            total_segments: Some(total),
        });

        let tts_batcher = TtsBatcher::new(
            self.tts.clone(),
            self.store.clone(),
            self.config.clone(),
            self.presign_ttl,
        );
        let (segments, warnings) = tts_batcher
            .run(cache_key, &script, &request.voice_settings, handle)
            .await?;

        handle.publish(processing(0.96, "assembling the combined audio"));

        let gap_ms = u64::from(self.config.turn_gap_ms);
        let rate = self.tts.sample_rate();
        let clips: Vec<AudioClip> = segments.iter().map(|s| s.clip.clone()).collect();
        let (wav, offsets, total_duration_ms) =
            tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, Vec<(u64, u64)>, u64)> {
                let combined = audio::concat(&clips, gap_ms, rate);
                let mut offsets = Vec::with_capacity(clips.len());
                let mut position = 0u64;
                for (i, clip) in clips.iter().enumerate() {
                    if i > 0 {
                        position += gap_ms;
                    }
                    let duration = audio::resample(clip, rate).duration_ms();
                    offsets.push((position, position + duration));
                    position += duration;
                }
                let wav = audio::encode_wav(&combined)?;
                Ok((wav, offsets, combined.duration_ms()))
            })
            .await
            .map_err(|e| GitcastError::Assembly(format!("assembly task panicked: {e}")))??;

        for segment in &segments {
            if let (Some(turn), Some((start, end))) = (
                script.turns.get_mut(segment.turn_index),
                offsets.get(segment.turn_index).copied(),
            ) {
                turn.start_ms = Some(start);
                turn.end_ms = Some(end);
            }
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let files = RecordFiles {
            audio: format!("podcasts/audio/podcast_{cache_key}_{timestamp}.wav"),
            script: format!("podcasts/scripts/script_{cache_key}_{timestamp}.json"),
            metadata: format!("podcasts/metadata/meta_{cache_key}_{timestamp}.json"),
        };

        let script_json = serde_json::json!({
            "cache_key": cache_key,
            "script": script.turns,
        });
        let metadata_json = serde_json::json!({
            "cache_key": cache_key,
            "repo_url": snapshot.info.url,
            "repo_name": snapshot.info.display_name,
            "duration_minutes": request.duration_minutes,
            "voice_settings": request.voice_settings,
            "content_hash": snapshot.content_hash(),
            "model_id": self.model.model_id(),
            "total_duration_ms": total_duration_ms,
            "created_at": Utc::now(),
            "warnings": warnings,
            "segments": segments.iter().map(|s| serde_json::json!({
                "turn_index": s.turn_index,
                "voice_id": s.voice_id,
                "duration_ms": s.duration_ms,
                "storage_key": s.storage_key,
                "silent": s.silent,
            })).collect::<Vec<_>>(),
        });

        self.store.put(&files.audio, &wav, "audio/wav").await?;
        self.store
            .put(
                &files.script,
                script_json.to_string().as_bytes(),
                "application/json",
            )
            .await?;
        self.store
            .put(
                &files.metadata,
                metadata_json.to_string().as_bytes(),
                "application/json",
            )
            .await?;

        let now = Utc::now();
        let record = PodcastRecord {
            cache_key: cache_key.to_owned(),
            repo_url: snapshot.info.url.clone(),
            duration_minutes: request.duration_minutes,
            voice_settings: request.voice_settings.clone(),
            content_hash: snapshot.content_hash(),
            files,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            estimated_cost: estimate_cost(&script),
            warnings,
        };
        self.cache.insert(record.clone()).await?;

        info!(
            "podcast {cache_key} built: {total} segments, {}ms audio",
            total_duration_ms
        );
        Ok(record)
    }

    /// The terminal success event with freshly resolved URLs.
    async fn complete_event(&self, record: &PodcastRecord) -> StreamEvent {
        let audio_url = self
            .store
            .presign(&record.files.audio, self.presign_ttl)
            .await
            .unwrap_or_else(|_| format!("/podcast-audio/{}", record.cache_key));
        let script_url = self
            .store
            .presign(&record.files.script, self.presign_ttl)
            .await
            .unwrap_or_else(|_| format!("/podcast-script/{}", record.cache_key));
        StreamEvent::Complete {
            cache_key: record.cache_key.clone(),
            audio_url,
            script_url,
            progress: 1.0,
        }
    }
}

fn processing(progress: f32, message: &str) -> StreamEvent {
    StreamEvent::Processing {
        progress,
        message: message.to_owned(),
        segment_index: None,
        total_segments: None,
    }
}

fn error_event(e: &GitcastError) -> StreamEvent {
    StreamEvent::Error {
        message: format!("[{}] {e}", e.code()),
    }
}

/// Rough provider cost estimate for the record bookkeeping.
fn estimate_cost(script: &PodcastScript) -> f64 {
    let chars: usize = script.turns.iter().map(|t| t.text.chars().count()).sum();
    // Synthesis dominates; one flat cent covers the chat calls.
    chars as f64 * 30.0 / 1_000_000.0 + 0.01
}

/// Replay buffered history, then follow the live feed to the terminal
/// event.
fn observer_stream(
    history: Vec<StreamEvent>,
    receiver: Option<broadcast::Receiver<StreamEvent>>,
) -> impl Stream<Item = StreamEvent> + Send {
    async_stream::stream! {
        let mut terminal_seen = false;
        for event in history {
            terminal_seen = event.is_terminal();
            yield event;
            if terminal_seen {
                return;
            }
        }
        let Some(mut receiver) = receiver else {
            return;
        };
        while !terminal_seen {
            match receiver.recv().await {
                Ok(event) => {
                    terminal_seen = event.is_terminal();
                    yield event;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("observer lagged, skipped {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
