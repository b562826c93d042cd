//! HTTP server: router, shared state, and serving.
//!
//! All dependencies are explicit objects constructed at process start
//! and carried in [`AppState`]; handlers never reach for globals.

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tracing::info;

use crate::config::AppConfig;
use crate::context::ContextBuilder;
use crate::diagram::DiagramPipeline;
use crate::error::{GitcastError, Result};
use crate::ingest::Ingestor;
use crate::podcast::PodcastPipeline;
use crate::store::ArtifactStore;
use crate::voice::VoiceService;

/// Shared application state for the handlers.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: Arc<AppConfig>,
    /// Repository ingestor.
    pub ingestor: Arc<Ingestor>,
    /// Prompt-context builder.
    pub context_builder: ContextBuilder,
    /// Diagram prompt chain.
    pub diagram: Arc<DiagramPipeline>,
    /// Podcast engine.
    pub podcast: Arc<PodcastPipeline>,
    /// Voice conversation service.
    pub voice: Arc<VoiceService>,
    /// Artifact store (also backs the local presign route).
    pub store: Arc<dyn ArtifactStore>,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/parse-repo", post(handlers::parse_repo))
        .route("/generate-diagram", post(handlers::generate_diagram))
        .route("/generate-podcast", post(handlers::generate_podcast))
        .route(
            "/generate-podcast-stream",
            post(handlers::generate_podcast_stream),
        )
        .route("/podcast-audio/{cache_key}", get(handlers::podcast_audio))
        .route("/podcast-script/{cache_key}", get(handlers::podcast_script))
        .route("/cached-podcasts", get(handlers::cached_podcasts))
        .route("/podcast-file/{*key}", get(handlers::podcast_file))
        .route("/voice/analyze-repo", post(handlers::voice_analyze_repo))
        .route(
            "/voice/introduction-audio",
            get(handlers::voice_introduction_audio),
        )
        .route("/voice/stt", post(handlers::voice_stt))
        .route("/voice/ask", post(handlers::voice_ask))
        .route("/voice/tts", post(handlers::voice_tts))
        .route("/health", get(handlers::health))
        .with_state(state)
}

/// Bind and serve until ctrl-c.
///
/// # Errors
///
/// Returns an error when the listener cannot bind or the server fails.
pub async fn serve(state: AppState) -> Result<()> {
    let bind = state.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| GitcastError::Internal(format!("cannot bind {bind}: {e}")))?;
    info!("listening on {bind}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GitcastError::Internal(format!("server error: {e}")))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
