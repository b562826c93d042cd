//! WAV handling for podcast segments and voice clips.
//!
//! Everything downstream of the TTS providers works on 16-bit mono PCM.
//! This module decodes incoming WAV bytes (mono-izing and converting as
//! needed), encodes clips back to WAV, linearly resamples to a common
//! rate, and concatenates segments with fixed silence gaps.

use std::io::Cursor;

use crate::error::{GitcastError, Result};

/// A decoded mono PCM clip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    /// 16-bit mono samples.
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioClip {
    /// A silent clip of the given duration.
    pub fn silence(duration_ms: u64, sample_rate: u32) -> Self {
        let count = (duration_ms as usize * sample_rate as usize) / 1000;
        Self {
            samples: vec![0; count],
            sample_rate,
        }
    }

    /// Clip duration in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }
}

/// Interpret raw little-endian 16-bit PCM as a clip.
pub fn clip_from_pcm(bytes: &[u8], sample_rate: u32) -> AudioClip {
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    AudioClip {
        samples,
        sample_rate,
    }
}

/// Decode WAV bytes into a mono clip.
///
/// Accepts 16-bit integer and 32-bit float WAVs, mono or stereo; stereo
/// is averaged down to mono.
///
/// # Errors
///
/// Returns [`GitcastError::Assembly`] for malformed or unsupported WAVs.
pub fn decode_wav(bytes: &[u8]) -> Result<AudioClip> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| GitcastError::Assembly(format!("WAV decode failed: {e}")))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .into_samples::<i16>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| GitcastError::Assembly(format!("WAV samples unreadable: {e}")))?,
        (hound::SampleFormat::Float, 32) => reader
            .into_samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| GitcastError::Assembly(format!("WAV samples unreadable: {e}")))?,
        (format, bits) => {
            return Err(GitcastError::Assembly(format!(
                "unsupported WAV format: {format:?} {bits}-bit"
            )));
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|s| *s as i32).sum();
                (sum / frame.len() as i32) as i16
            })
            .collect()
    };

    Ok(AudioClip {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Encode a clip as a 16-bit mono WAV.
///
/// # Errors
///
/// Returns [`GitcastError::Assembly`] when encoding fails.
pub fn encode_wav(clip: &AudioClip) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: clip.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| GitcastError::Assembly(format!("WAV encode failed: {e}")))?;
        for sample in &clip.samples {
            writer
                .write_sample(*sample)
                .map_err(|e| GitcastError::Assembly(format!("WAV write failed: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| GitcastError::Assembly(format!("WAV finalize failed: {e}")))?;
    }
    Ok(cursor.into_inner())
}

/// Linearly resample a clip to the target rate.
pub fn resample(clip: &AudioClip, target_rate: u32) -> AudioClip {
    if clip.sample_rate == target_rate || clip.samples.is_empty() || clip.sample_rate == 0 {
        return AudioClip {
            samples: clip.samples.clone(),
            sample_rate: target_rate.max(clip.sample_rate),
        };
    }

    let ratio = clip.sample_rate as f64 / target_rate as f64;
    let out_len = ((clip.samples.len() as f64) / ratio).round() as usize;
    let mut samples = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let position = i as f64 * ratio;
        let index = position.floor() as usize;
        let fraction = position - index as f64;
        let a = clip.samples.get(index).copied().unwrap_or(0) as f64;
        let b = clip.samples.get(index + 1).copied().unwrap_or(a as i16) as f64;
        samples.push((a + (b - a) * fraction).round() as i16);
    }

    AudioClip {
        samples,
        sample_rate: target_rate,
    }
}

/// Concatenate clips at a common rate with a fixed silence gap between
/// consecutive clips.
pub fn concat(clips: &[AudioClip], gap_ms: u64, target_rate: u32) -> AudioClip {
    let gap_samples = (gap_ms as usize * target_rate as usize) / 1000;
    let mut samples = Vec::new();
    for (i, clip) in clips.iter().enumerate() {
        if i > 0 {
            samples.extend(std::iter::repeat_n(0i16, gap_samples));
        }
        let resampled = resample(clip, target_rate);
        samples.extend_from_slice(&resampled.samples);
    }
    AudioClip {
        samples,
        sample_rate: target_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(rate: u32, ms: u64) -> AudioClip {
        let count = (ms as usize * rate as usize) / 1000;
        let samples = (0..count)
            .map(|i| ((i as f32 * 0.1).sin() * 8_000.0) as i16)
            .collect();
        AudioClip {
            samples,
            sample_rate: rate,
        }
    }

    // ── encode / decode ───────────────────────────────────────

    #[test]
    fn wav_round_trip_preserves_samples() {
        let clip = tone(16_000, 100);
        let bytes = match encode_wav(&clip) {
            Ok(bytes) => bytes,
            Err(_) => unreachable!("encode succeeded"),
        };
        let decoded = match decode_wav(&bytes) {
            Ok(decoded) => decoded,
            Err(_) => unreachable!("decode succeeded"),
        };
        assert_eq!(decoded.sample_rate, 16_000);
        assert_eq!(decoded.samples, clip.samples);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_wav(b"not a wav").is_err());
        assert!(decode_wav(b"").is_err());
    }

    #[test]
    fn decode_averages_stereo_to_mono() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = match hound::WavWriter::new(&mut cursor, spec) {
                Ok(w) => w,
                Err(_) => unreachable!("writer created"),
            };
            for _ in 0..10 {
                let _ = writer.write_sample(100i16);
                let _ = writer.write_sample(300i16);
            }
            let _ = writer.finalize();
        }
        let decoded = match decode_wav(&cursor.into_inner()) {
            Ok(d) => d,
            Err(_) => unreachable!("decode succeeded"),
        };
        assert_eq!(decoded.samples.len(), 10);
        assert!(decoded.samples.iter().all(|s| *s == 200));
    }

    #[test]
    fn clip_from_pcm_parses_little_endian() {
        let clip = clip_from_pcm(&[0x01, 0x00, 0xFF, 0x7F], 16_000);
        assert_eq!(clip.samples, vec![1, i16::MAX]);
    }

    // ── clip math ─────────────────────────────────────────────

    #[test]
    fn silence_has_expected_duration() {
        let clip = AudioClip::silence(500, 16_000);
        assert_eq!(clip.samples.len(), 8_000);
        assert_eq!(clip.duration_ms(), 500);
        assert!(clip.samples.iter().all(|s| *s == 0));
    }

    #[test]
    fn duration_rounds_down() {
        let clip = AudioClip {
            samples: vec![0; 15_999],
            sample_rate: 16_000,
        };
        assert_eq!(clip.duration_ms(), 999);
    }

    // ── resample ──────────────────────────────────────────────

    #[test]
    fn resample_identity_at_same_rate() {
        let clip = tone(16_000, 50);
        let resampled = resample(&clip, 16_000);
        assert_eq!(resampled.samples, clip.samples);
    }

    #[test]
    fn resample_scales_length() {
        let clip = tone(16_000, 1_000);
        let up = resample(&clip, 24_000);
        assert_eq!(up.sample_rate, 24_000);
        let expected = 24_000usize;
        assert!(up.samples.len().abs_diff(expected) <= 2);

        let down = resample(&clip, 8_000);
        assert!(down.samples.len().abs_diff(8_000) <= 2);
    }

    #[test]
    fn resample_preserves_duration() {
        let clip = tone(22_050, 730);
        let resampled = resample(&clip, 16_000);
        assert!(resampled.duration_ms().abs_diff(clip.duration_ms()) <= 2);
    }

    // ── concat ────────────────────────────────────────────────

    #[test]
    fn concat_inserts_gaps_between_clips() {
        let a = tone(16_000, 100);
        let b = tone(16_000, 100);
        let combined = concat(&[a, b], 200, 16_000);
        // 100ms + 200ms gap + 100ms
        assert_eq!(combined.duration_ms(), 400);
    }

    #[test]
    fn concat_has_no_leading_or_trailing_gap() {
        let a = tone(16_000, 100);
        let combined = concat(&[a], 200, 16_000);
        assert_eq!(combined.duration_ms(), 100);
    }

    #[test]
    fn concat_resamples_mixed_rates() {
        let a = tone(16_000, 100);
        let b = tone(24_000, 100);
        let combined = concat(&[a, b], 0, 16_000);
        assert_eq!(combined.sample_rate, 16_000);
        assert!(combined.duration_ms().abs_diff(200) <= 2);
    }

    #[test]
    fn concat_empty_is_empty() {
        let combined = concat(&[], 200, 16_000);
        assert!(combined.samples.is_empty());
    }
}
