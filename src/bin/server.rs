//! The gitcast API server binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gitcast::config::AppConfig;
use gitcast::context::ContextBuilder;
use gitcast::diagram::DiagramPipeline;
use gitcast::ingest::Ingestor;
use gitcast::llm::openai::OpenAiChatClient;
use gitcast::podcast::cache::PodcastCache;
use gitcast::podcast::PodcastPipeline;
use gitcast::server::{self, AppState};
use gitcast::store::build_store;
use gitcast::stt::WhisperStt;
use gitcast::tts::ElevenLabsTts;
use gitcast::vad::EnergyVad;
use gitcast::voice::VoiceService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("GITCAST_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GITCAST_CONFIG").ok())
        .map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("loading configuration")?;
    config.validate().context("validating configuration")?;

    let presign_ttl = Duration::from_secs(config.store.presign_ttl_secs);
    let store = build_store(&config.store).context("initializing the artifact store")?;
    let ingestor = Arc::new(Ingestor::new(config.ingest.clone()).context("building the ingestor")?);
    let context_builder = ContextBuilder::new(config.context.clone());
    let model: Arc<dyn gitcast::llm::LanguageModel> =
        Arc::new(OpenAiChatClient::new(config.llm.clone()));
    let tts: Arc<dyn gitcast::tts::TtsEngine> = Arc::new(ElevenLabsTts::new(config.tts.clone()));
    let stt: Arc<dyn gitcast::stt::SttEngine> = Arc::new(WhisperStt::new(config.stt.clone()));

    let cache = Arc::new(PodcastCache::load(store.clone()).await);
    let podcast = Arc::new(PodcastPipeline::new(
        ingestor.clone(),
        context_builder.clone(),
        model.clone(),
        tts.clone(),
        store.clone(),
        cache,
        config.podcast.clone(),
        presign_ttl,
    ));
    let diagram = Arc::new(DiagramPipeline::new(model.clone()));
    let voice = Arc::new(VoiceService::new(
        ingestor.clone(),
        context_builder.clone(),
        model,
        tts,
        stt,
        EnergyVad::new(config.vad.clone()),
        config.podcast.host_voice_id.clone(),
    ));

    info!("gitcast server starting (model: {})", config.llm.model_id);
    let state = AppState {
        config: Arc::new(config),
        ingestor,
        context_builder,
        diagram,
        podcast,
        voice,
        store,
    };
    server::serve(state).await.context("serving")?;
    Ok(())
}
