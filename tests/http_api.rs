//! HTTP surface tests: a real listener, real requests, stubbed
//! providers behind the state.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use gitcast::audio::{self, AudioClip};
use gitcast::config::{AppConfig, IngestConfig};
use gitcast::context::ContextBuilder;
use gitcast::diagram::DiagramPipeline;
use gitcast::ingest::Ingestor;
use gitcast::podcast::cache::PodcastCache;
use gitcast::podcast::PodcastPipeline;
use gitcast::server::{AppState, router};
use gitcast::test_utils::{MemoryStore, ScriptedModel, StubStt, StubTts};
use gitcast::vad::EnergyVad;
use gitcast::voice::VoiceService;
use serde_json::json;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Bind the router on an ephemeral port and return its base URL.
async fn spawn_server(state: AppState) -> String {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(_) => unreachable!("ephemeral bind"),
    };
    let addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(_) => unreachable!("local addr"),
    };
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });
    format!("http://{addr}")
}

/// State with every provider scripted/stubbed.
async fn state_over(github: &MockServer, model_replies: Vec<String>) -> AppState {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(PodcastCache::load(store.clone()).await);
    let ingestor = match Ingestor::new(IngestConfig {
        api_base: github.uri(),
        fetch_timeout_secs: 5,
        ..IngestConfig::default()
    }) {
        Ok(i) => Arc::new(i),
        Err(_) => unreachable!("ingestor built"),
    };
    let config = Arc::new(AppConfig::default());
    let context_builder = ContextBuilder::new(config.context.clone());
    let model: Arc<ScriptedModel> = Arc::new(ScriptedModel::new(model_replies));
    let tts = Arc::new(StubTts::new(16_000));
    let stt = Arc::new(StubStt::new("what does this project do"));

    let podcast = Arc::new(PodcastPipeline::new(
        ingestor.clone(),
        context_builder.clone(),
        model.clone(),
        tts.clone(),
        store.clone(),
        cache,
        config.podcast.clone(),
        Duration::from_secs(3_600),
    ));
    let diagram = Arc::new(DiagramPipeline::new(model.clone()));
    let voice = Arc::new(VoiceService::new(
        ingestor.clone(),
        context_builder.clone(),
        model,
        tts,
        stt,
        EnergyVad::new(config.vad.clone()),
        "intro-voice".into(),
    ));

    AppState {
        config,
        ingestor,
        context_builder,
        diagram,
        podcast,
        voice,
        store,
    }
}

async fn mount_hello_world(server: &MockServer) {
    let b64 = |text: &str| base64::engine::general_purpose::STANDARD.encode(text);
    Mock::given(method("GET"))
        .and(path("/repos/octocat/Hello-World"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "default_branch": "master"
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/octocat/Hello-World/git/trees/master"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tree": [{ "path": "README", "type": "blob", "size": 13 }],
            "truncated": false
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/octocat/Hello-World/readme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": b64("Hello World!\n"),
            "encoding": "base64"
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/repos/octocat/Hello-World/contents/.*$"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
}

fn silence_wav(ms: u64) -> Vec<u8> {
    let clip = AudioClip::silence(ms, 16_000);
    match audio::encode_wav(&clip) {
        Ok(bytes) => bytes,
        Err(_) => unreachable!("encode succeeded"),
    }
}

// ────────────────────────────────────────────────────────────────
// Liveness and basics
// ────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn health_answers_ok() {
    let github = MockServer::start().await;
    let base = spawn_server(state_over(&github, vec![]).await).await;

    let response = reqwest::get(format!("{base}/health")).await;
    assert!(response.is_ok());
    match response {
        Ok(response) => {
            assert_eq!(response.status(), 200);
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            assert_eq!(body["status"], "ok");
        }
        Err(_) => unreachable!("request succeeded"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn parse_repo_returns_tree_and_readme() {
    let github = MockServer::start().await;
    mount_hello_world(&github).await;
    let base = spawn_server(state_over(&github, vec![]).await).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/parse-repo"))
        .json(&json!({ "repo_url": "https://github.com/octocat/Hello-World" }))
        .send()
        .await;
    let response = match response {
        Ok(response) => response,
        Err(_) => unreachable!("request succeeded"),
    };
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    assert_eq!(body["repo_info"]["default_branch"], "master");
    assert_eq!(body["readme_content"], "Hello World!\n");
    let names: Vec<&str> = body["file_tree"]["roots"]
        .as_array()
        .map(|roots| {
            roots
                .iter()
                .filter_map(|n| n["name"].as_str())
                .collect()
        })
        .unwrap_or_default();
    assert!(names.contains(&"README"), "roots: {names:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_repo_url_is_a_400_with_stable_code() {
    let github = MockServer::start().await;
    let base = spawn_server(state_over(&github, vec![]).await).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/parse-repo"))
        .json(&json!({ "repo_url": "ftp://not-supported" }))
        .send()
        .await;
    let response = match response {
        Ok(response) => response,
        Err(_) => unreachable!("request succeeded"),
    };
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    assert_eq!(body["error"]["code"], "invalid_input");
}

// ────────────────────────────────────────────────────────────────
// Diagram endpoint
// ────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn generate_diagram_accepts_a_bare_path_list() {
    let github = MockServer::start().await;
    let replies = vec![
        "A CLI that greets the world from main.py.".to_owned(),
        "[{\"component\":\"cli\",\"paths\":[\"src/main.py\"],\"role\":\"entry point\"}]".to_owned(),
        "flowchart TD\n    A[main.py] --> B[stdout]\n    class A entry\n".to_owned(),
    ];
    let base = spawn_server(state_over(&github, replies).await).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/generate-diagram"))
        .json(&json!({
            "file_tree": ["src/main.py", "README.md"],
            "readme_content": "A CLI that greets the world."
        }))
        .send()
        .await;
    let response = match response {
        Ok(response) => response,
        Err(_) => unreachable!("request succeeded"),
    };
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    let diagram = body["diagram_code"].as_str().unwrap_or_default();
    assert!(diagram.contains("main.py"), "diagram: {diagram}");
    // The normalized output still parses and passes validation.
    assert!(gitcast::diagram::grammar::parse(diagram).is_ok());
}

// ────────────────────────────────────────────────────────────────
// Podcast endpoints
// ────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn out_of_range_duration_is_rejected() {
    let github = MockServer::start().await;
    let base = spawn_server(state_over(&github, vec![]).await).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/generate-podcast"))
        .json(&json!({
            "repo_url": "https://github.com/octocat/Hello-World",
            "duration_minutes": 99
        }))
        .send()
        .await;
    let response = match response {
        Ok(response) => response,
        Err(_) => unreachable!("request succeeded"),
    };
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    assert_eq!(body["error"]["code"], "invalid_input");
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_cache_key_is_a_404() {
    let github = MockServer::start().await;
    let base = spawn_server(state_over(&github, vec![]).await).await;

    let response = reqwest::get(format!("{base}/podcast-audio/deadbeefdeadbeef")).await;
    match response {
        Ok(response) => assert_eq!(response.status(), 404),
        Err(_) => unreachable!("request succeeded"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cached_podcasts_starts_empty() {
    let github = MockServer::start().await;
    let base = spawn_server(state_over(&github, vec![]).await).await;

    let response = reqwest::get(format!("{base}/cached-podcasts?limit=5")).await;
    match response {
        Ok(response) => {
            assert_eq!(response.status(), 200);
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            assert_eq!(body, json!([]));
        }
        Err(_) => unreachable!("request succeeded"),
    }
}

// ────────────────────────────────────────────────────────────────
// Voice endpoints
// ────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn silent_upload_transcribes_to_empty() {
    let github = MockServer::start().await;
    let base = spawn_server(state_over(&github, vec![]).await).await;

    let part = reqwest::multipart::Part::bytes(silence_wav(1_000))
        .file_name("clip.wav")
        .mime_str("audio/wav");
    let part = match part {
        Ok(part) => part,
        Err(_) => unreachable!("part built"),
    };
    let form = reqwest::multipart::Form::new().part("audio", part);

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/voice/stt"))
        .multipart(form)
        .send()
        .await;
    let response = match response {
        Ok(response) => response,
        Err(_) => unreachable!("request succeeded"),
    };
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    assert_eq!(body["transcript"], "");
}

#[tokio::test(flavor = "multi_thread")]
async fn voice_flow_analyze_then_intro_then_ask() {
    let github = MockServer::start().await;
    mount_hello_world(&github).await;
    let replies = vec![
        "This project is a minimal greeting demo.\n---\nWelcome! Ask me anything about Hello World.".to_owned(),
        "It simply prints a greeting; there is no other behavior.".to_owned(),
    ];
    let base = spawn_server(state_over(&github, replies).await).await;
    let client = reqwest::Client::new();

    // analyze-repo opens the session and pre-synthesizes the intro.
    let response = client
        .post(format!("{base}/voice/analyze-repo"))
        .json(&json!({ "repo_url": "https://github.com/octocat/Hello-World" }))
        .send()
        .await;
    let response = match response {
        Ok(response) => response,
        Err(_) => unreachable!("request succeeded"),
    };
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    assert_eq!(body["success"], true);
    assert_eq!(body["repo_name"], "octocat/Hello-World");
    let session_id = body["session_id"].as_str().unwrap_or_default().to_owned();
    assert!(!session_id.is_empty());
    let audio_size = body["introduction_audio_size"].as_u64().unwrap_or(0);
    assert!(audio_size > 0);

    // introduction-audio returns the cached bytes.
    let response = client
        .get(format!(
            "{base}/voice/introduction-audio?session_id={session_id}"
        ))
        .send()
        .await;
    let response = match response {
        Ok(response) => response,
        Err(_) => unreachable!("request succeeded"),
    };
    assert_eq!(response.status(), 200);
    let bytes = response.bytes().await.map(|b| b.len()).unwrap_or(0);
    assert_eq!(bytes as u64, audio_size);

    // ask answers from the session history.
    let response = client
        .post(format!("{base}/voice/ask"))
        .json(&json!({
            "transcript": "what does this project do?",
            "session_id": session_id
        }))
        .send()
        .await;
    let response = match response {
        Ok(response) => response,
        Err(_) => unreachable!("request succeeded"),
    };
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    assert_eq!(
        body["response"],
        "It simply prints a greeting; there is no other behavior."
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn ask_without_a_session_is_a_404() {
    let github = MockServer::start().await;
    let base = spawn_server(state_over(&github, vec![]).await).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/voice/ask"))
        .json(&json!({ "transcript": "anyone there?" }))
        .send()
        .await;
    match response {
        Ok(response) => {
            assert_eq!(response.status(), 404);
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            assert_eq!(body["error"]["code"], "not_found");
        }
        Err(_) => unreachable!("request succeeded"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn voice_tts_returns_wav_bytes() {
    let github = MockServer::start().await;
    let base = spawn_server(state_over(&github, vec![]).await).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/voice/tts"))
        .json(&json!({ "text": "hello out there", "voice_id": "v1" }))
        .send()
        .await;
    let response = match response {
        Ok(response) => response,
        Err(_) => unreachable!("request succeeded"),
    };
    assert_eq!(response.status(), 200);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    assert_eq!(content_type, "audio/wav");
    let bytes = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
    assert!(audio::decode_wav(&bytes).is_ok());
}
