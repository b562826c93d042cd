//! Request handlers for the API surface.
//!
//! Error mapping: 400 for `invalid_input`, 404 for missing repositories
//! and cache keys, 429 when the upstream rate limit is exhausted, 500
//! with `{error: {code, message}}` otherwise. The streaming endpoint
//! always answers 200 and delivers failures as terminal `error` events.

use axum::Json;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::{Stream, StreamExt as _};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tracing::warn;

use super::AppState;
use crate::context::{PromptContext, estimate_tokens};
use crate::error::GitcastError;
use crate::ingest::{EntryKind, FileTree, RepoInfo};
use crate::podcast::cache::{PodcastRecord, VoiceSettings};
use crate::podcast::{PodcastPipeline, PodcastRequest};

/// Error wrapper implementing the wire mapping.
pub struct ApiError(GitcastError);

impl From<GitcastError> for ApiError {
    fn from(e: GitcastError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!("request failed: {}", self.0);
        }
        let body = serde_json::json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ── repository parsing ────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ParseRepoRequest {
    repo_url: String,
}

#[derive(Debug, Serialize)]
pub struct ParseRepoResponse {
    file_tree: FileTree,
    readme_content: String,
    repo_info: RepoInfo,
}

/// `POST /parse-repo`
pub async fn parse_repo(
    State(state): State<AppState>,
    Json(request): Json<ParseRepoRequest>,
) -> ApiResult<Json<ParseRepoResponse>> {
    let snapshot = state.ingestor.parse(&request.repo_url).await?;
    Ok(Json(ParseRepoResponse {
        file_tree: snapshot.tree,
        readme_content: snapshot.readme,
        repo_info: snapshot.info,
    }))
}

// ── diagram ───────────────────────────────────────────────────

/// The tree as clients send it: either the structured shape from
/// `/parse-repo` or a bare list of paths.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FileTreeInput {
    /// Structured tree.
    Tree(FileTree),
    /// Flat path list; every entry is a file.
    Paths(Vec<String>),
}

impl FileTreeInput {
    fn into_tree(self) -> FileTree {
        match self {
            Self::Tree(tree) => tree,
            Self::Paths(paths) => {
                let entries: Vec<(String, EntryKind)> = paths
                    .into_iter()
                    .map(|path| (path, EntryKind::File))
                    .collect();
                FileTree::from_flat(&entries, 5_000)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GenerateDiagramRequest {
    file_tree: FileTreeInput,
    #[serde(default)]
    readme_content: String,
}

#[derive(Debug, Serialize)]
pub struct GenerateDiagramResponse {
    diagram_code: String,
}

/// `POST /generate-diagram`
pub async fn generate_diagram(
    State(state): State<AppState>,
    Json(request): Json<GenerateDiagramRequest>,
) -> ApiResult<Json<GenerateDiagramResponse>> {
    let tree = request.file_tree.into_tree();
    let tree_text = tree.render();
    let token_estimate = estimate_tokens(&tree_text) + estimate_tokens(&request.readme_content);
    let context = PromptContext {
        tree_text,
        readme_text: request.readme_content,
        selected_files: Vec::new(),
        token_estimate,
    };
    let diagram_code = state.diagram.generate(&tree, &context).await?;
    Ok(Json(GenerateDiagramResponse { diagram_code }))
}

// ── podcast ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GeneratePodcastRequest {
    repo_url: String,
    duration_minutes: u32,
    #[serde(default)]
    voice_settings: Option<VoiceSettings>,
}

fn to_core_request(pipeline: &PodcastPipeline, wire: GeneratePodcastRequest) -> PodcastRequest {
    PodcastRequest {
        repo_url: wire.repo_url,
        duration_minutes: wire.duration_minutes,
        voice_settings: wire
            .voice_settings
            .unwrap_or_else(|| pipeline.default_voice_settings()),
    }
}

/// `POST /generate-podcast`
pub async fn generate_podcast(
    State(state): State<AppState>,
    Json(request): Json<GeneratePodcastRequest>,
) -> ApiResult<Json<PodcastRecord>> {
    let request = to_core_request(&state.podcast, request);
    let record = state.podcast.generate(request).await?;
    Ok(Json(record))
}

/// `POST /generate-podcast-stream`
pub async fn generate_podcast_stream(
    State(state): State<AppState>,
    Json(request): Json<GeneratePodcastRequest>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let request = to_core_request(&state.podcast, request);
    let events = state.podcast.stream_events(request).await;
    let sse_stream = events.map(|event| {
        let sse_event = Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("{\"type\":\"error\",\"message\":\"event serialization failed\"}"));
        Ok(sse_event)
    });
    Sse::new(sse_stream).keep_alive(KeepAlive::default())
}

async fn record_for(state: &AppState, cache_key: &str) -> ApiResult<PodcastRecord> {
    state
        .podcast
        .cache()
        .lookup(cache_key)
        .await
        .ok_or_else(|| ApiError(GitcastError::NotFound(format!("no podcast for {cache_key}"))))
}

/// `GET /podcast-audio/{cache_key}`
pub async fn podcast_audio(
    State(state): State<AppState>,
    Path(cache_key): Path<String>,
) -> ApiResult<Response> {
    let record = record_for(&state, &cache_key).await?;
    let bytes = state.store.get(&record.files.audio).await?;
    Ok(([(header::CONTENT_TYPE, "audio/wav")], bytes).into_response())
}

#[derive(Debug, Serialize)]
pub struct PodcastScriptResponse {
    cache_key: String,
    script: serde_json::Value,
    metadata: serde_json::Value,
    files: crate::podcast::cache::RecordFiles,
}

/// `GET /podcast-script/{cache_key}`
pub async fn podcast_script(
    State(state): State<AppState>,
    Path(cache_key): Path<String>,
) -> ApiResult<Json<PodcastScriptResponse>> {
    let record = record_for(&state, &cache_key).await?;
    let script_bytes = state.store.get(&record.files.script).await?;
    let metadata_bytes = state.store.get(&record.files.metadata).await?;

    let script: serde_json::Value = serde_json::from_slice(&script_bytes)
        .map_err(|e| GitcastError::Storage(format!("stored script unreadable: {e}")))?;
    let metadata: serde_json::Value = serde_json::from_slice(&metadata_bytes)
        .map_err(|e| GitcastError::Storage(format!("stored metadata unreadable: {e}")))?;

    let script = script.get("script").cloned().unwrap_or(script);
    Ok(Json(PodcastScriptResponse {
        cache_key,
        script,
        metadata,
        files: record.files,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CachedPodcastsQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

/// `GET /cached-podcasts?limit=N`
pub async fn cached_podcasts(
    State(state): State<AppState>,
    Query(query): Query<CachedPodcastsQuery>,
) -> Json<Vec<PodcastRecord>> {
    Json(
        state
            .podcast
            .cache()
            .entries_by_last_accessed(query.limit)
            .await,
    )
}

/// `GET /podcast-file/{key}` — serving route backing local presigned
/// URLs.
pub async fn podcast_file(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Response> {
    let bytes = state.store.get(&key).await?;
    let content_type = match key.rsplit('.').next() {
        Some("wav") => "audio/wav",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

// ── voice ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct VoiceAnalyzeRequest {
    repo_url: String,
}

/// `POST /voice/analyze-repo`
pub async fn voice_analyze_repo(
    State(state): State<AppState>,
    Json(request): Json<VoiceAnalyzeRequest>,
) -> ApiResult<Json<crate::voice::RepoAnalysis>> {
    let analysis = state.voice.analyze_repo(&request.repo_url).await?;
    Ok(Json(analysis))
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    #[serde(default)]
    session_id: Option<String>,
}

/// `GET /voice/introduction-audio`
pub async fn voice_introduction_audio(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Response> {
    let bytes = state
        .voice
        .introduction_audio(query.session_id.as_deref())
        .await?;
    Ok(([(header::CONTENT_TYPE, "audio/wav")], bytes).into_response())
}

#[derive(Debug, Serialize)]
pub struct SttResponse {
    transcript: String,
}

/// `POST /voice/stt` — multipart upload with an `audio` field.
pub async fn voice_stt(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<SttResponse>> {
    let mut audio: Option<Vec<u8>> = None;
    let mut session_id: Option<String> = None;

    while let Ok(Some(field)) = multipart.next_field().await {
        match field.name() {
            Some("audio") => {
                audio = field.bytes().await.ok().map(|b| b.to_vec());
            }
            Some("session_id") => {
                session_id = field.text().await.ok();
            }
            _ => {}
        }
    }

    let audio = audio.ok_or_else(|| {
        ApiError(GitcastError::InvalidInput(
            "multipart field 'audio' is required".into(),
        ))
    })?;
    let transcript = state
        .voice
        .transcribe(&audio, session_id.as_deref())
        .await?;
    Ok(Json(SttResponse { transcript }))
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    transcript: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    response: String,
}

/// `POST /voice/ask`
pub async fn voice_ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> ApiResult<Json<AskResponse>> {
    let response = state
        .voice
        .ask(&request.transcript, request.session_id.as_deref())
        .await?;
    Ok(Json(AskResponse { response }))
}

#[derive(Debug, Deserialize)]
pub struct TtsRequest {
    text: String,
    voice_id: String,
    #[serde(default)]
    session_id: Option<String>,
}

/// `POST /voice/tts`
pub async fn voice_tts(
    State(state): State<AppState>,
    Json(request): Json<TtsRequest>,
) -> ApiResult<Response> {
    if request.text.trim().is_empty() {
        return Err(ApiError(GitcastError::InvalidInput(
            "text must be non-empty".into(),
        )));
    }
    let synthesized = state
        .voice
        .speak(
            &request.text,
            &request.voice_id,
            request.session_id.as_deref(),
        )
        .await?;
    match synthesized {
        Some(bytes) => Ok(([(header::CONTENT_TYPE, "audio/wav")], bytes).into_response()),
        // Interrupted mid-synthesis: nothing to play.
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

// ── liveness ──────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
