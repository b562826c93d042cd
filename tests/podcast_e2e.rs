//! End-to-end podcast pipeline tests: mock repository host, scripted
//! model, stub synthesis, in-memory store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use futures_util::StreamExt as _;
use gitcast::config::{ContextConfig, IngestConfig, PodcastConfig};
use gitcast::context::ContextBuilder;
use gitcast::error::ProviderError;
use gitcast::ingest::Ingestor;
use gitcast::llm::{ChatRequest, LanguageModel, TextDeltaStream};
use gitcast::podcast::cache::{PodcastCache, VoiceSettings};
use gitcast::podcast::events::StreamEvent;
use gitcast::podcast::{PodcastPipeline, PodcastRequest};
use gitcast::store::ArtifactStore;
use gitcast::test_utils::{MemoryStore, ScriptedModel, StubTts};
use gitcast::tts::VoiceQuality;
use serde_json::json;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn script_json(turns: usize) -> String {
    let parts: Vec<String> = (0..turns)
        .map(|i| {
            let speaker = if i % 2 == 0 { "host" } else { "expert" };
            let text = (0..20).map(|w| format!("word{w}")).collect::<Vec<_>>().join(" ");
            format!("{{\"speaker\":\"{speaker}\",\"text\":\"{text}\"}}")
        })
        .collect();
    format!("[{}]", parts.join(","))
}

async fn mount_github(server: &MockServer, readme: &str) {
    let b64 = |text: &str| base64::engine::general_purpose::STANDARD.encode(text);
    Mock::given(method("GET"))
        .and(path("/repos/x/y"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "default_branch": "main"
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/x/y/git/trees/main"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tree": [
                { "path": "README.md", "type": "blob", "size": 20 },
                { "path": "main.py", "type": "blob", "size": 15 }
            ],
            "truncated": false
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/x/y/readme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": b64(readme),
            "encoding": "base64"
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/repos/x/y/contents/.*$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": b64("print('hello')\n"),
            "encoding": "base64"
        })))
        .mount(server)
        .await;
}

fn pipeline_over(
    server: &MockServer,
    model: Arc<dyn LanguageModel>,
    store: Arc<MemoryStore>,
    cache: Arc<PodcastCache>,
) -> Arc<PodcastPipeline> {
    let ingestor = match Ingestor::new(IngestConfig {
        api_base: server.uri(),
        fetch_timeout_secs: 5,
        ..IngestConfig::default()
    }) {
        Ok(i) => Arc::new(i),
        Err(_) => unreachable!("ingestor built"),
    };
    Arc::new(PodcastPipeline::new(
        ingestor,
        ContextBuilder::new(ContextConfig::default()),
        model,
        Arc::new(StubTts::new(16_000)),
        store,
        cache,
        PodcastConfig {
            tts_retries: 0,
            ..PodcastConfig::default()
        },
        Duration::from_secs(3_600),
    ))
}

fn request() -> PodcastRequest {
    PodcastRequest {
        repo_url: "https://github.com/x/y".into(),
        duration_minutes: 3,
        voice_settings: VoiceSettings {
            host_voice_id: "host-voice".into(),
            expert_voice_id: "expert-voice".into(),
            quality: VoiceQuality::default(),
        },
    }
}

// ────────────────────────────────────────────────────────────────
// Scenario: fresh generation over the stream
// ────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn stream_delivers_ordered_events_then_complete() {
    let server = MockServer::start().await;
    mount_github(&server, "A demo.").await;
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(PodcastCache::load(store.clone()).await);
    let pipeline = pipeline_over(
        &server,
        Arc::new(ScriptedModel::new(vec![script_json(18)])),
        store.clone(),
        cache,
    );

    let events: Vec<StreamEvent> = pipeline.stream_events(request()).await.collect().await;

    // Processing progress is monotonically increasing.
    let processing: Vec<f32> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Processing { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert!(!processing.is_empty());
    for pair in processing.windows(2) {
        assert!(pair[1] >= pair[0], "processing regressed: {pair:?}");
    }

    // 18 segment_ready events with strictly ascending indexes from 0.
    let ready: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::SegmentReady { segment_index, .. } => Some(*segment_index),
            _ => None,
        })
        .collect();
    assert_eq!(ready, (0..18).collect::<Vec<_>>());

    // Exactly one terminal event and it is last.
    let terminal_count = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminal_count, 1);
    match events.last() {
        Some(StreamEvent::Complete {
            progress,
            audio_url,
            script_url,
            ..
        }) => {
            assert_eq!(*progress, 1.0);
            assert!(audio_url.contains("podcasts/audio/"));
            assert!(script_url.contains("podcasts/scripts/"));
        }
        other => unreachable!("expected terminal complete, got {other:?}"),
    }
}

// ────────────────────────────────────────────────────────────────
// Scenario: cache reuse
// ────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn second_identical_request_reuses_the_cache() {
    let server = MockServer::start().await;
    mount_github(&server, "A demo.").await;
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(PodcastCache::load(store.clone()).await);
    // Only one script reply: a second build would fail loudly.
    let pipeline = pipeline_over(
        &server,
        Arc::new(ScriptedModel::new(vec![script_json(12)])),
        store.clone(),
        cache,
    );

    let first = pipeline.generate(request()).await;
    assert!(first.is_ok(), "first generation failed: {first:?}");
    let first = match first {
        Ok(record) => record,
        Err(_) => unreachable!("first generation succeeded"),
    };

    let second = pipeline.generate(request()).await;
    assert!(second.is_ok());
    let second = match second {
        Ok(record) => record,
        Err(_) => unreachable!("second generation succeeded"),
    };

    assert_eq!(first.cache_key, second.cache_key);
    assert_eq!(first.files, second.files);
    assert_eq!(second.access_count, 1);
    assert_eq!(second.content_hash, first.content_hash);

    // Exactly one artifact set was written.
    for prefix in ["podcasts/audio/", "podcasts/scripts/", "podcasts/metadata/"] {
        let keys = match store.list(prefix).await {
            Ok(keys) => keys,
            Err(_) => unreachable!("list succeeded"),
        };
        assert_eq!(keys.len(), 1, "expected one file under {prefix}: {keys:?}");
    }

    // The reuse arrives on the stream as a single complete event.
    let events: Vec<StreamEvent> = pipeline.stream_events(request()).await.collect().await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], StreamEvent::Complete { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn changed_repository_content_invalidates_the_entry() {
    let server = MockServer::start().await;
    // First snapshot reads one README, later reads a different one.
    let b64 = |text: &str| base64::engine::general_purpose::STANDARD.encode(text);
    Mock::given(method("GET"))
        .and(path("/repos/x/y"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "default_branch": "main"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/x/y/git/trees/main"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tree": [{ "path": "README.md", "type": "blob", "size": 20 }],
            "truncated": false
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/x/y/readme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": b64("version one"),
            "encoding": "base64"
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/x/y/readme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": b64("version two, changed upstream"),
            "encoding": "base64"
        })))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(PodcastCache::load(store.clone()).await);
    let pipeline = pipeline_over(
        &server,
        Arc::new(ScriptedModel::new(vec![script_json(12), script_json(12)])),
        store.clone(),
        cache,
    );

    let first = match pipeline.generate(request()).await {
        Ok(record) => record,
        Err(e) => unreachable!("first generation failed: {e}"),
    };
    let second = match pipeline.generate(request()).await {
        Ok(record) => record,
        Err(e) => unreachable!("second generation failed: {e}"),
    };

    assert_eq!(first.cache_key, second.cache_key);
    assert_ne!(first.content_hash, second.content_hash);
    // A fresh artifact set was written for the new content.
    assert_ne!(first.files.audio, second.files.audio);
    assert_eq!(second.access_count, 0);
}

// ────────────────────────────────────────────────────────────────
// Scenario: concurrent identical requests share one build
// ────────────────────────────────────────────────────────────────

/// A model that answers slowly, so a second request reliably attaches
/// to the in-flight build.
struct SlowModel {
    inner: ScriptedModel,
    delay: Duration,
}

#[async_trait]
impl LanguageModel for SlowModel {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    async fn chat(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        tokio::time::sleep(self.delay).await;
        self.inner.chat(request).await
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<TextDeltaStream, ProviderError> {
        self.inner.chat_stream(request).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_identical_requests_observe_one_build() {
    let server = MockServer::start().await;
    mount_github(&server, "A demo.").await;
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(PodcastCache::load(store.clone()).await);
    let model = Arc::new(SlowModel {
        inner: ScriptedModel::new(vec![script_json(12)]),
        delay: Duration::from_millis(500),
    });
    let pipeline = pipeline_over(&server, model, store.clone(), cache);

    let first_pipeline = pipeline.clone();
    let first = tokio::spawn(async move {
        let events: Vec<StreamEvent> =
            first_pipeline.stream_events(request()).await.collect().await;
        events
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second_pipeline = pipeline.clone();
    let second = tokio::spawn(async move {
        let events: Vec<StreamEvent> =
            second_pipeline.stream_events(request()).await.collect().await;
        events
    });

    let (first, second) = match (first.await, second.await) {
        (Ok(a), Ok(b)) => (a, b),
        _ => unreachable!("stream tasks completed"),
    };

    // Identical event sequences for both observers.
    assert_eq!(first, second);
    assert!(matches!(first.last(), Some(StreamEvent::Complete { .. })));

    // Exactly one artifact set in storage.
    for prefix in ["podcasts/audio/", "podcasts/scripts/", "podcasts/metadata/"] {
        let keys = match store.list(prefix).await {
            Ok(keys) => keys,
            Err(_) => unreachable!("list succeeded"),
        };
        assert_eq!(keys.len(), 1, "expected one file under {prefix}: {keys:?}");
    }
}

// ────────────────────────────────────────────────────────────────
// Failure: terminal error event, nothing persisted
// ────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn failing_script_ends_the_stream_with_one_error_event() {
    let server = MockServer::start().await;
    mount_github(&server, "A demo.").await;
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(PodcastCache::load(store.clone()).await);
    let pipeline = pipeline_over(
        &server,
        Arc::new(ScriptedModel::new(vec![
            "not a script".into(),
            "still not a script".into(),
        ])),
        store.clone(),
        cache,
    );

    let events: Vec<StreamEvent> = pipeline.stream_events(request()).await.collect().await;
    let terminal_count = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminal_count, 1);
    match events.last() {
        Some(StreamEvent::Error { message }) => {
            assert!(message.contains("validation_failed"), "message: {message}");
        }
        other => unreachable!("expected terminal error, got {other:?}"),
    }

    // No podcast artifacts were persisted (the cache index may exist).
    for prefix in ["podcasts/audio/", "podcasts/scripts/", "podcasts/metadata/"] {
        let keys = match store.list(prefix).await {
            Ok(keys) => keys,
            Err(_) => unreachable!("list succeeded"),
        };
        assert!(keys.is_empty(), "unexpected files under {prefix}: {keys:?}");
    }
}
