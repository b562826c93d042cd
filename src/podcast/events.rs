//! Stream event schema for progressive podcast delivery.
//!
//! Events are serialized as `data: <json>\n\n` lines. The ordering
//! contract: `processing` progress is monotonic, `segment_ready` indexes
//! ascend from 0, and exactly one terminal event (`complete` or `error`)
//! closes the stream.

use serde::{Deserialize, Serialize};

/// One event on a podcast generation stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Coarse status update.
    Processing {
        /// Completion fraction, 0..1.
        progress: f32,
        /// Human-readable status.
        message: String,
        /// Segment currently being synthesized, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        segment_index: Option<usize>,
        /// Total segment count, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        total_segments: Option<usize>,
    },
    /// One finished audio segment.
    SegmentReady {
        /// Turn index of the segment.
        segment_index: usize,
        /// Total segment count.
        total_segments: usize,
        /// URL where the segment can be fetched.
        segment_url: String,
        /// Segment duration in ms.
        duration_ms: u64,
        /// Completion fraction, 0..1.
        progress: f32,
    },
    /// Terminal success.
    Complete {
        /// Cache key of the generated record.
        cache_key: String,
        /// URL of the combined audio file.
        audio_url: String,
        /// URL of the script JSON.
        script_url: String,
        /// Always 1.0.
        progress: f32,
    },
    /// Terminal failure.
    Error {
        /// User-facing message (prefixed with the stable error code).
        message: String,
    },
}

impl StreamEvent {
    /// Whether this event terminates the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// The event's progress value, when it carries one.
    pub fn progress(&self) -> Option<f32> {
        match self {
            Self::Processing { progress, .. }
            | Self::SegmentReady { progress, .. }
            | Self::Complete { progress, .. } => Some(*progress),
            Self::Error { .. } => None,
        }
    }

    /// Serialize to the wire format: `data: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            // Serialization of these variants cannot fail; keep the
            // stream well-formed regardless.
            "{\"type\":\"error\",\"message\":\"event serialization failed\"}".to_owned()
        });
        format!("data: {json}\n\n")
    }
}
