//! Per-turn TTS batching with pipelined store-and-emit.
//!
//! Turns are synthesized strictly in script order (one provider call at
//! a time, which also respects provider rate limits). Each finished
//! segment is handed to a post-processing task over a bounded channel:
//! storing and emitting segment `i` overlaps the synthesis of segment
//! `i + 1`, and a slow consumer parks the batcher before the next turn
//! (backpressure). A turn that still fails after the configured retries
//! is replaced by silence sized to its word count, with a warning
//! recorded for the podcast metadata.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::cache::{BuildHandle, VoiceSettings};
use super::events::StreamEvent;
use super::script::{PodcastScript, Speaker};
use crate::audio::{self, AudioClip};
use crate::config::PodcastConfig;
use crate::error::{GitcastError, Result};
use crate::llm::RetryPolicy;
use crate::store::ArtifactStore;
use crate::tts::TtsEngine;

/// Progress fraction when segment synthesis starts.
pub const SEGMENT_PHASE_START: f32 = 0.15;
/// Progress span covered by segment synthesis.
pub const SEGMENT_PHASE_SPAN: f32 = 0.8;

/// One synthesized (or substituted) segment.
#[derive(Debug, Clone)]
pub struct SegmentResult {
    /// Turn index this segment realizes.
    pub turn_index: usize,
    /// Voice used.
    pub voice_id: String,
    /// Storage key of the segment WAV.
    pub storage_key: String,
    /// Decoded clip, kept for final assembly.
    pub clip: AudioClip,
    /// Segment duration in ms.
    pub duration_ms: u64,
    /// Whether this is substituted silence.
    pub silent: bool,
}

struct PendingSegment {
    turn_index: usize,
    voice_id: String,
    wav: Vec<u8>,
    clip: AudioClip,
    silent: bool,
}

/// The TTS batcher.
pub struct TtsBatcher {
    tts: Arc<dyn TtsEngine>,
    store: Arc<dyn ArtifactStore>,
    config: PodcastConfig,
    presign_ttl: Duration,
}

impl TtsBatcher {
    /// Create a batcher.
    pub fn new(
        tts: Arc<dyn TtsEngine>,
        store: Arc<dyn ArtifactStore>,
        config: PodcastConfig,
        presign_ttl: Duration,
    ) -> Self {
        Self {
            tts,
            store,
            config,
            presign_ttl,
        }
    }

    /// Synthesize every turn, emitting `segment_ready` events as
    /// segments land in storage. Returns the segments in turn order
    /// plus any silence-substitution warnings.
    ///
    /// # Errors
    ///
    /// Returns [`GitcastError::Storage`] when a segment cannot be
    /// persisted; per-turn synthesis failures are not errors (silence is
    /// substituted instead).
    pub async fn run(
        &self,
        cache_key: &str,
        script: &PodcastScript,
        settings: &VoiceSettings,
        handle: &BuildHandle,
    ) -> Result<(Vec<SegmentResult>, Vec<String>)> {
        let total = script.turns.len();
        let mut warnings = Vec::new();

        let (tx, rx) = mpsc::channel::<PendingSegment>(self.config.segment_channel_depth.max(1));
        let post = tokio::spawn(store_and_emit(
            rx,
            self.store.clone(),
            handle.clone(),
            cache_key.to_owned(),
            total,
            self.presign_ttl,
        ));

        for turn in &script.turns {
            handle.publish(StreamEvent::Processing {
                progress: segment_progress(turn.index, total),
                message: format!("synthesizing turn {} of {total}", turn.index + 1),
                segment_index: Some(turn.index),
                total_segments: Some(total),
            });

            let voice_id = match turn.speaker {
                Speaker::Host => settings.host_voice_id.clone(),
                Speaker::Expert => settings.expert_voice_id.clone(),
            };

            let retry = RetryPolicy::with_attempts(self.config.tts_retries + 1);
            let synthesis = retry
                .run(|| self.tts.synthesize(&turn.text, &voice_id, &settings.quality))
                .await;

            let pending = match synthesis {
                Ok(wav) => match audio::decode_wav(&wav) {
                    Ok(clip) => PendingSegment {
                        turn_index: turn.index,
                        voice_id,
                        wav,
                        clip,
                        silent: false,
                    },
                    Err(e) => {
                        warn!("turn {} produced undecodable audio: {e}", turn.index);
                        self.silent_segment(turn.index, turn.word_count(), voice_id, &mut warnings)?
                    }
                },
                Err(e) => {
                    warn!("turn {} synthesis failed after retries: {e}", turn.index);
                    self.silent_segment(turn.index, turn.word_count(), voice_id, &mut warnings)?
                }
            };

            if tx.send(pending).await.is_err() {
                // The post-processor died; surface its storage error.
                break;
            }
        }
        drop(tx);

        let segments = post
            .await
            .map_err(|e| GitcastError::Internal(format!("segment task panicked: {e}")))??;
        info!(
            "batcher finished: {} segments, {} substituted",
            segments.len(),
            warnings.len()
        );
        Ok((segments, warnings))
    }

    /// Build a substituted-silence segment sized to the word count.
    fn silent_segment(
        &self,
        turn_index: usize,
        words: usize,
        voice_id: String,
        warnings: &mut Vec<String>,
    ) -> Result<PendingSegment> {
        let duration_ms = words as u64 * 60_000 / self.config.words_per_minute.max(1) as u64;
        let clip = AudioClip::silence(duration_ms, self.tts.sample_rate());
        let wav = audio::encode_wav(&clip)?;
        warnings.push(format!(
            "turn {turn_index}: synthesis failed, substituted {duration_ms}ms of silence"
        ));
        Ok(PendingSegment {
            turn_index,
            voice_id,
            wav,
            clip,
            silent: true,
        })
    }
}

/// Progress fraction for the start of a segment's synthesis.
fn segment_progress(index: usize, total: usize) -> f32 {
    SEGMENT_PHASE_START + SEGMENT_PHASE_SPAN * index as f32 / total.max(1) as f32
}

/// Progress fraction once a segment is stored.
fn segment_done_progress(index: usize, total: usize) -> f32 {
    SEGMENT_PHASE_START + SEGMENT_PHASE_SPAN * (index + 1) as f32 / total.max(1) as f32
}

/// Consumer half of the pipeline: persist each segment and emit its
/// `segment_ready` event, in arrival (= turn) order.
async fn store_and_emit(
    mut rx: mpsc::Receiver<PendingSegment>,
    store: Arc<dyn ArtifactStore>,
    handle: BuildHandle,
    cache_key: String,
    total: usize,
    presign_ttl: Duration,
) -> Result<Vec<SegmentResult>> {
    let mut segments = Vec::with_capacity(total);
    while let Some(pending) = rx.recv().await {
        let cache_scoped_key = segment_key_for(&cache_key, pending.turn_index);
        store
            .put(&cache_scoped_key, &pending.wav, "audio/wav")
            .await?;
        let segment_url = store.presign(&cache_scoped_key, presign_ttl).await?;
        let duration_ms = pending.clip.duration_ms();

        handle.publish(StreamEvent::SegmentReady {
            segment_index: pending.turn_index,
            total_segments: total,
            segment_url,
            duration_ms,
            progress: segment_done_progress(pending.turn_index, total),
        });

        segments.push(SegmentResult {
            turn_index: pending.turn_index,
            voice_id: pending.voice_id,
            storage_key: cache_scoped_key,
            clip: pending.clip,
            duration_ms,
            silent: pending.silent,
        });
    }
    Ok(segments)
}

fn segment_key_for(cache_key: &str, turn_index: usize) -> String {
    format!("podcasts/segments/{cache_key}/segment_{turn_index:03}.wav")
}
