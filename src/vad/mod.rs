//! Voice activity detection using energy-based analysis.
//!
//! Frames the clip, classifies each frame by RMS energy against a
//! threshold, and trims leading/trailing non-speech with a small pad.
//! A clip with no frame above the threshold (or with less total speech
//! than the minimum) is reported as silent so the caller can skip the
//! STT call entirely.

use tracing::debug;

use crate::audio::AudioClip;
use crate::config::VadConfig;

/// Result of trimming a clip.
#[derive(Debug, Clone)]
pub struct VadOutcome {
    /// The trimmed clip (empty when no speech was found).
    pub trimmed: AudioClip,
    /// Whether the clip contained speech.
    pub has_speech: bool,
    /// Total duration classified as speech, in ms.
    pub speech_ms: u64,
}

/// Energy-based voice activity detector.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    config: VadConfig,
}

impl EnergyVad {
    /// Create a detector from configuration.
    pub fn new(config: VadConfig) -> Self {
        Self { config }
    }

    /// Trim leading and trailing non-speech from a clip.
    pub fn trim(&self, clip: &AudioClip) -> VadOutcome {
        let frame_len =
            ((self.config.frame_ms as usize * clip.sample_rate as usize) / 1000).max(1);
        let frames: Vec<bool> = clip
            .samples
            .chunks(frame_len)
            .map(|frame| rms(frame) > self.config.threshold)
            .collect();

        let first = frames.iter().position(|s| *s);
        let last = frames.iter().rposition(|s| *s);
        let speech_frames = frames.iter().filter(|s| **s).count();
        let speech_ms = speech_frames as u64 * self.config.frame_ms as u64;

        let (Some(first), Some(last)) = (first, last) else {
            debug!("no speech detected in {}ms clip", clip.duration_ms());
            return VadOutcome {
                trimmed: AudioClip {
                    samples: Vec::new(),
                    sample_rate: clip.sample_rate,
                },
                has_speech: false,
                speech_ms: 0,
            };
        };

        if speech_ms < self.config.min_speech_ms as u64 {
            debug!("only {speech_ms}ms of speech, below the minimum");
            return VadOutcome {
                trimmed: AudioClip {
                    samples: Vec::new(),
                    sample_rate: clip.sample_rate,
                },
                has_speech: false,
                speech_ms,
            };
        }

        let pad_samples =
            (self.config.speech_pad_ms as usize * clip.sample_rate as usize) / 1000;
        let start = (first * frame_len).saturating_sub(pad_samples);
        let end = ((last + 1) * frame_len + pad_samples).min(clip.samples.len());

        VadOutcome {
            trimmed: AudioClip {
                samples: clip.samples[start..end].to_vec(),
                sample_rate: clip.sample_rate,
            },
            has_speech: true,
            speech_ms,
        }
    }
}

/// RMS energy of i16 samples normalized to \[-1, 1\].
fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples
        .iter()
        .map(|s| {
            let v = *s as f32 / i16::MAX as f32;
            v * v
        })
        .sum();
    (sum_sq / samples.len() as f32).sqrt()
}
