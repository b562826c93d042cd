//! Content-addressed podcast cache: key derivation, the persistent
//! index, and per-key single-flight builds.
//!
//! The cache key is a pure function of the normalized inputs:
//! `SHA-256(normalize(repo_url) ∥ duration_minutes ∥
//! canonical_json(voice_settings))`, where canonical JSON sorts keys and
//! rounds numbers to four decimals. The index lives at
//! `cache/index.json` in the artifact store and is guarded by one
//! mutex, shared with the per-key build map so a second request for an
//! in-flight key attaches to the existing build instead of starting a
//! new one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::events::StreamEvent;
use crate::error::Result;
use crate::store::ArtifactStore;
use crate::tts::VoiceQuality;

/// Storage key of the persistent cache index.
pub const INDEX_KEY: &str = "cache/index.json";

/// Broadcast capacity for build event fan-out.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Voice selection plus quality parameters for one podcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    /// Voice id for host turns.
    pub host_voice_id: String,
    /// Voice id for expert turns.
    pub expert_voice_id: String,
    /// Quality parameters shared by both voices.
    #[serde(flatten)]
    pub quality: VoiceQuality,
}

impl VoiceSettings {
    /// Canonical JSON: keys sorted, numbers rounded to 4 decimals.
    pub fn canonical_json(&self) -> String {
        let round = |v: f32| (f64::from(v) * 10_000.0).round() / 10_000.0;
        // serde_json maps are sorted by key, so serializing this value
        // yields the canonical ordering.
        let value = serde_json::json!({
            "expert_voice_id": self.expert_voice_id,
            "host_voice_id": self.host_voice_id,
            "similarity_boost": round(self.quality.similarity_boost),
            "stability": round(self.quality.stability),
            "style": round(self.quality.style),
            "use_speaker_boost": self.quality.use_speaker_boost,
        });
        value.to_string()
    }
}

/// Compute the cache key for a generation request.
pub fn compute_cache_key(
    normalized_url: &str,
    duration_minutes: u32,
    voice_settings: &VoiceSettings,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_url.as_bytes());
    hasher.update(b"\n");
    hasher.update(duration_minutes.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(voice_settings.canonical_json().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    // 16 hex chars is plenty of address space and keeps filenames short.
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Storage keys of the three files backing one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFiles {
    /// Combined audio WAV.
    pub audio: String,
    /// Script JSON.
    pub script: String,
    /// Metadata JSON.
    pub metadata: String,
}

/// A persisted podcast artifact set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodcastRecord {
    /// Content-addressed key.
    pub cache_key: String,
    /// Normalized repository URL.
    pub repo_url: String,
    /// Requested duration.
    pub duration_minutes: u32,
    /// Voice configuration used.
    pub voice_settings: VoiceSettings,
    /// Snapshot hash at generation time.
    pub content_hash: String,
    /// Storage handles of the artifact files.
    pub files: RecordFiles,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// Last reuse time.
    pub last_accessed: DateTime<Utc>,
    /// Reuse count.
    pub access_count: u64,
    /// Rough provider cost estimate in USD.
    pub estimated_cost: f64,
    /// Warnings recorded during generation (e.g. silence-substituted
    /// turns).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// The persisted index shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheIndex {
    entries: HashMap<String, PodcastRecord>,
}

/// A build in flight: buffered history plus live fan-out, so every
/// observer sees the identical event sequence regardless of when it
/// attached.
#[derive(Clone)]
pub struct BuildHandle {
    shared: Arc<std::sync::Mutex<Vec<StreamEvent>>>,
    sender: broadcast::Sender<StreamEvent>,
}

impl BuildHandle {
    /// A fresh handle with empty history.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(std::sync::Mutex::new(Vec::new())),
            sender,
        }
    }

    /// Publish an event to history and live subscribers.
    pub fn publish(&self, event: StreamEvent) {
        if let Ok(mut history) = self.shared.lock() {
            history.push(event.clone());
            // Send while holding the lock so attach() cannot observe a
            // gap between snapshot and subscription.
            let _ = self.sender.send(event);
        }
    }

    /// Attach an observer: everything published so far plus a live
    /// receiver for the rest.
    pub fn attach(&self) -> (Vec<StreamEvent>, broadcast::Receiver<StreamEvent>) {
        match self.shared.lock() {
            Ok(history) => (history.clone(), self.sender.subscribe()),
            Err(_) => (Vec::new(), self.sender.subscribe()),
        }
    }

    /// Whether a terminal event has been published.
    pub fn is_finished(&self) -> bool {
        self.shared
            .lock()
            .map(|history| history.iter().any(StreamEvent::is_terminal))
            .unwrap_or(false)
    }
}

impl Default for BuildHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// What a generation request should do for its key.
pub enum BuildSlot {
    /// No build in flight; the caller owns this build.
    Builder(BuildHandle),
    /// A build is in flight; observe it.
    Attached(Vec<StreamEvent>, broadcast::Receiver<StreamEvent>),
}

struct CacheState {
    index: CacheIndex,
    building: HashMap<String, BuildHandle>,
}

/// The podcast cache: index plus single-flight coordination.
pub struct PodcastCache {
    store: Arc<dyn ArtifactStore>,
    state: tokio::sync::Mutex<CacheState>,
}

impl PodcastCache {
    /// Create a cache over the given store, loading the persisted index
    /// if one exists.
    pub async fn load(store: Arc<dyn ArtifactStore>) -> Self {
        let index = match store.get(INDEX_KEY).await {
            Ok(bytes) => match serde_json::from_slice::<CacheIndex>(&bytes) {
                Ok(index) => {
                    info!("cache index loaded: {} entries", index.entries.len());
                    index
                }
                Err(e) => {
                    warn!("cache index unreadable, starting empty: {e}");
                    CacheIndex::default()
                }
            },
            Err(_) => CacheIndex::default(),
        };
        Self {
            store,
            state: tokio::sync::Mutex::new(CacheState {
                index,
                building: HashMap::new(),
            }),
        }
    }

    /// Look up a record by key.
    pub async fn lookup(&self, cache_key: &str) -> Option<PodcastRecord> {
        let state = self.state.lock().await;
        state.index.entries.get(cache_key).cloned()
    }

    /// Record a reuse: bump `access_count` and `last_accessed`.
    pub async fn touch(&self, cache_key: &str) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock().await;
            if let Some(record) = state.index.entries.get_mut(cache_key) {
                record.access_count += 1;
                record.last_accessed = Utc::now();
            }
            state.index.clone()
        };
        self.persist(&snapshot).await
    }

    /// Insert a freshly built record.
    pub async fn insert(&self, record: PodcastRecord) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.index.entries.insert(record.cache_key.clone(), record);
            state.index.clone()
        };
        self.persist(&snapshot).await
    }

    /// Drop a record whose content hash no longer matches.
    pub async fn invalidate(&self, cache_key: &str) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock().await;
            if state.index.entries.remove(cache_key).is_some() {
                debug!("invalidated cache entry {cache_key}");
            }
            state.index.clone()
        };
        self.persist(&snapshot).await
    }

    /// Entries ordered by `last_accessed`, newest first.
    pub async fn entries_by_last_accessed(&self, limit: usize) -> Vec<PodcastRecord> {
        let state = self.state.lock().await;
        let mut entries: Vec<PodcastRecord> = state.index.entries.values().cloned().collect();
        entries.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        entries.truncate(limit);
        entries
    }

    /// Claim or join the build for a key.
    pub async fn begin_build(&self, cache_key: &str) -> BuildSlot {
        let mut state = self.state.lock().await;
        if let Some(handle) = state.building.get(cache_key) {
            let (history, receiver) = handle.attach();
            return BuildSlot::Attached(history, receiver);
        }
        let handle = BuildHandle::new();
        state.building.insert(cache_key.to_owned(), handle.clone());
        BuildSlot::Builder(handle)
    }

    /// Release the build slot for a key (after its terminal event).
    pub async fn finish_build(&self, cache_key: &str) {
        let mut state = self.state.lock().await;
        state.building.remove(cache_key);
    }

    /// Verify that all three files behind a record still exist.
    pub async fn files_exist(&self, record: &PodcastRecord) -> bool {
        for key in [
            &record.files.audio,
            &record.files.script,
            &record.files.metadata,
        ] {
            match self.store.exists(key).await {
                Ok(true) => {}
                _ => return false,
            }
        }
        true
    }

    async fn persist(&self, index: &CacheIndex) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(index)
            .map_err(|e| crate::error::GitcastError::Storage(format!("index encode failed: {e}")))?;
        self.store.put(INDEX_KEY, &bytes, "application/json").await?;
        Ok(())
    }
}
