//! Interactive voice conversation sessions.
//!
//! Each session is explicit per-connection state in a registry: a
//! repository summary computed once at `analyze-repo` time, a bounded
//! conversation history whose system entry is pinned at index 0, the
//! pre-synthesized introduction audio, and a cancellation token for
//! interrupting active synthesis. The state machine mirrors the
//! client's: idle → listening → thinking → speaking → idle, with
//! interrupt cutting speech short. The in-flight LLM call is never
//! cancelled; history is committed only after the reply returns, so
//! interruptions cannot corrupt it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audio;
use crate::context::{ContextBuilder, Purpose};
use crate::error::{GitcastError, Result};
use crate::ingest::Ingestor;
use crate::llm::{ChatMessage, ChatParams, ChatRequest, LanguageModel};
use crate::stt::SttEngine;
use crate::tts::{TtsEngine, VoiceQuality};
use crate::vad::EnergyVad;

/// Maximum retained conversation pairs (user + assistant).
pub const MAX_HISTORY_PAIRS: usize = 16;

/// Word cap on the spoken introduction.
pub const MAX_INTRO_WORDS: usize = 80;

/// Client-observable turn state, mirrored for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    /// Nothing in flight.
    Idle,
    /// Capturing user speech.
    Listening,
    /// Waiting on the model.
    Thinking,
    /// Playing a reply.
    Speaking,
}

/// Per-connection conversational state.
pub struct VoiceSession {
    /// Unique id, returned by `analyze-repo` and accepted by the other
    /// voice endpoints.
    pub session_id: String,
    /// `owner/name` of the analyzed repository.
    pub repo_name: String,
    /// One-paragraph summary seeded into the system entry.
    pub summary: String,
    /// Short spoken introduction (≤ 80 words).
    pub introduction_text: String,
    /// Pre-synthesized introduction audio.
    pub introduction_audio: Vec<u8>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    history: Vec<ChatMessage>,
    state: TurnState,
    cancel: CancellationToken,
}

impl VoiceSession {
    fn new(repo_name: String, summary: String, introduction_text: String) -> Self {
        let system = format!(
            "You are a knowledgeable guide answering spoken questions about \
             the repository {repo_name}. Keep answers short and conversational \
             (two or three sentences). Repository summary: {summary}"
        );
        Self {
            session_id: Uuid::new_v4().to_string(),
            repo_name,
            summary,
            introduction_text,
            introduction_audio: Vec::new(),
            created_at: Utc::now(),
            history: vec![ChatMessage::system(system)],
            state: TurnState::Idle,
            cancel: CancellationToken::new(),
        }
    }

    /// Current turn state.
    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Move to a new turn state.
    pub fn set_state(&mut self, state: TurnState) {
        debug!("session {}: {:?} → {state:?}", self.session_id, self.state);
        self.state = state;
    }

    /// Cancellation token guarding the active synthesis.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Interrupt active speech: cancel synthesis/playback and return to
    /// listening. The LLM call, if any, keeps running.
    pub fn interrupt(&mut self) {
        if self.state == TurnState::Speaking {
            info!("session {} interrupted while speaking", self.session_id);
            self.cancel.cancel();
            self.cancel = CancellationToken::new();
            self.state = TurnState::Listening;
        }
    }

    /// The messages for one model call: history plus the new user turn.
    pub fn messages_with(&self, transcript: &str) -> Vec<ChatMessage> {
        let mut messages = self.history.clone();
        messages.push(ChatMessage::user(transcript));
        messages
    }

    /// Commit a completed exchange, dropping the oldest pair beyond the
    /// bound. The system entry stays at index 0.
    pub fn commit_exchange(&mut self, transcript: &str, reply: &str) {
        self.history.push(ChatMessage::user(transcript));
        self.history.push(ChatMessage::assistant(reply));
        while (self.history.len() - 1) / 2 > MAX_HISTORY_PAIRS {
            self.history.drain(1..=2);
        }
    }

    /// Read-only view of the history.
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }
}

/// Session registry keyed by id; remembers the most recent session for
/// clients that do not thread the id.
#[derive(Default)]
pub struct SessionRegistry {
    inner: std::sync::Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, Arc<tokio::sync::Mutex<VoiceSession>>>,
    latest: Option<String>,
}

impl SessionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, session: VoiceSession) -> Arc<tokio::sync::Mutex<VoiceSession>> {
        let id = session.session_id.clone();
        let shared = Arc::new(tokio::sync::Mutex::new(session));
        if let Ok(mut state) = self.inner.lock() {
            state.sessions.insert(id.clone(), shared.clone());
            state.latest = Some(id);
        }
        shared
    }

    /// Resolve a session by id, or the most recent one when `None`.
    ///
    /// # Errors
    ///
    /// Returns [`GitcastError::NotFound`] for unknown ids or when no
    /// session exists yet.
    pub fn resolve(
        &self,
        session_id: Option<&str>,
    ) -> Result<Arc<tokio::sync::Mutex<VoiceSession>>> {
        let state = self
            .inner
            .lock()
            .map_err(|_| GitcastError::Internal("session registry poisoned".into()))?;
        let id = match session_id {
            Some(id) => id.to_owned(),
            None => state
                .latest
                .clone()
                .ok_or_else(|| GitcastError::NotFound("no active voice session".into()))?,
        };
        state
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| GitcastError::NotFound(format!("unknown voice session {id}")))
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|s| s.sessions.len()).unwrap_or(0)
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of `analyze-repo`, shaped for the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoAnalysis {
    /// Whether analysis succeeded (always true on the success path).
    pub success: bool,
    /// Session id for subsequent voice calls.
    pub session_id: String,
    /// `owner/name`.
    pub repo_name: String,
    /// Short repository description line.
    pub repo_description: String,
    /// One-paragraph summary.
    pub analysis_summary: String,
    /// Spoken introduction text.
    pub introduction_text: String,
    /// Size of the pre-synthesized introduction audio in bytes.
    pub introduction_audio_size: usize,
}

/// The voice conversation service.
pub struct VoiceService {
    ingestor: Arc<Ingestor>,
    context_builder: ContextBuilder,
    model: Arc<dyn LanguageModel>,
    tts: Arc<dyn TtsEngine>,
    stt: Arc<dyn SttEngine>,
    vad: EnergyVad,
    registry: SessionRegistry,
    intro_voice_id: String,
}

impl VoiceService {
    /// Assemble the service from its dependencies.
    pub fn new(
        ingestor: Arc<Ingestor>,
        context_builder: ContextBuilder,
        model: Arc<dyn LanguageModel>,
        tts: Arc<dyn TtsEngine>,
        stt: Arc<dyn SttEngine>,
        vad: EnergyVad,
        intro_voice_id: String,
    ) -> Self {
        Self {
            ingestor,
            context_builder,
            model,
            tts,
            stt,
            vad,
            registry: SessionRegistry::new(),
            intro_voice_id,
        }
    }

    /// The session registry (for diagnostics).
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Analyze a repository and open a session: summary + spoken
    /// introduction, with the introduction audio pre-synthesized.
    pub async fn analyze_repo(&self, repo_url: &str) -> Result<RepoAnalysis> {
        let snapshot = self.ingestor.parse(repo_url).await?;
        let context = self.context_builder.build(&snapshot, Purpose::Qa);

        let prompt = format!(
            "Analyze this repository. Respond with exactly two parts \
             separated by a line containing only ---. Part one: a single \
             technical paragraph summarizing what the project does and how \
             it is structured. Part two: a friendly spoken introduction of \
             at most {MAX_INTRO_WORDS} words, welcoming a listener who is \
             about to ask questions about the project.\n\n{}",
            context.render()
        );
        let request = ChatRequest::user_prompt(prompt, ChatParams::with_temperature(0.4));
        let reply = self.model.chat(&request).await?;
        let (summary, introduction) = split_analysis(&reply);

        let audio_bytes = self
            .tts
            .synthesize(&introduction, &self.intro_voice_id, &VoiceQuality::default())
            .await?;
        info!(
            "analyzed {}: intro audio {} bytes",
            snapshot.info.display_name,
            audio_bytes.len()
        );

        let mut session = VoiceSession::new(
            snapshot.info.display_name.clone(),
            summary.clone(),
            introduction.clone(),
        );
        session.introduction_audio = audio_bytes.clone();
        let analysis = RepoAnalysis {
            success: true,
            session_id: session.session_id.clone(),
            repo_name: snapshot.info.display_name,
            repo_description: first_sentence(&summary),
            analysis_summary: summary,
            introduction_text: introduction,
            introduction_audio_size: audio_bytes.len(),
        };
        self.registry.insert(session);
        Ok(analysis)
    }

    /// The cached introduction audio for a session.
    pub async fn introduction_audio(&self, session_id: Option<&str>) -> Result<Vec<u8>> {
        let session = self.registry.resolve(session_id)?;
        let session = session.lock().await;
        if session.introduction_audio.is_empty() {
            return Err(GitcastError::NotFound(
                "introduction audio not ready".into(),
            ));
        }
        Ok(session.introduction_audio.clone())
    }

    /// Transcribe an uploaded clip: VAD trim, then STT. A clip with no
    /// detected speech yields an empty transcript without an STT call.
    /// Arriving speech interrupts a session that is still speaking.
    pub async fn transcribe(&self, wav: &[u8], session_id: Option<&str>) -> Result<String> {
        if let Ok(session) = self.registry.resolve(session_id) {
            let mut session = session.lock().await;
            session.interrupt();
            session.set_state(TurnState::Listening);
        }

        let clip = audio::decode_wav(wav)
            .map_err(|e| GitcastError::InvalidInput(format!("unreadable audio clip: {e}")))?;
        let outcome = self.vad.trim(&clip);
        if !outcome.has_speech {
            debug!("no speech in {}ms clip", clip.duration_ms());
            return Ok(String::new());
        }

        let trimmed = audio::encode_wav(&outcome.trimmed)?;
        let transcript = self.stt.transcribe(&trimmed).await?;
        Ok(transcript)
    }

    /// Answer a transcript with the bounded conversation history.
    ///
    /// Empty transcripts return an empty reply without a model call.
    pub async fn ask(&self, transcript: &str, session_id: Option<&str>) -> Result<String> {
        let transcript = transcript.trim();
        if transcript.is_empty() {
            return Ok(String::new());
        }

        let shared = self.registry.resolve(session_id)?;
        let mut session = shared.lock().await;
        session.set_state(TurnState::Thinking);
        let messages = session.messages_with(transcript);
        drop(session);

        let request = ChatRequest {
            messages,
            params: ChatParams::with_temperature(0.5),
        };
        let reply = match self.model.chat(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                // Recoverable: back to idle, session stays open.
                let mut session = shared.lock().await;
                session.set_state(TurnState::Idle);
                return Err(e.into());
            }
        };

        let mut session = shared.lock().await;
        session.commit_exchange(transcript, &reply);
        session.set_state(TurnState::Speaking);
        Ok(reply)
    }

    /// Synthesize reply text. Returns `None` when the session was
    /// interrupted mid-synthesis (the client restarted listening).
    pub async fn speak(
        &self,
        text: &str,
        voice_id: &str,
        session_id: Option<&str>,
    ) -> Result<Option<Vec<u8>>> {
        let token = match self.registry.resolve(session_id) {
            Ok(shared) => {
                let mut session = shared.lock().await;
                session.set_state(TurnState::Speaking);
                Some((shared.clone(), session.cancel_token()))
            }
            Err(_) => None,
        };

        let quality = VoiceQuality::default();
        let synthesis = self.tts.synthesize(text, voice_id, &quality);

        let result = match &token {
            Some((_, cancel)) => {
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    synthesized = synthesis => Some(synthesized?),
                }
            }
            None => Some(synthesis.await?),
        };

        if let Some((shared, _)) = token {
            let mut session = shared.lock().await;
            if result.is_some() && session.state() == TurnState::Speaking {
                session.set_state(TurnState::Idle);
            }
        }
        Ok(result)
    }
}

/// Split the analysis reply into (summary, introduction ≤ 80 words).
///
/// Without the `---` delimiter the whole reply becomes the summary and
/// the introduction is its first 80 words, keeping the endpoint total.
fn split_analysis(reply: &str) -> (String, String) {
    let mut summary_lines: Vec<&str> = Vec::new();
    let mut intro_lines: Vec<&str> = Vec::new();
    let mut seen_delimiter = false;
    for line in reply.lines() {
        if !seen_delimiter && line.trim() == "---" {
            seen_delimiter = true;
            continue;
        }
        if seen_delimiter {
            intro_lines.push(line);
        } else {
            summary_lines.push(line);
        }
    }

    let summary = summary_lines.join("\n").trim().to_owned();
    let introduction = intro_lines.join("\n").trim().to_owned();
    if !seen_delimiter || introduction.is_empty() || summary.is_empty() {
        let whole = reply.trim().to_owned();
        let introduction = cap_words(&whole, MAX_INTRO_WORDS);
        return (whole, introduction);
    }
    (summary, cap_words(&introduction, MAX_INTRO_WORDS))
}

/// Keep at most the first `max` words.
fn cap_words(text: &str, max: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max {
        words.join(" ")
    } else {
        words[..max].join(" ")
    }
}

/// First sentence of a paragraph, for the short description field.
fn first_sentence(text: &str) -> String {
    match text.find(". ") {
        Some(cut) => text[..=cut].trim().to_owned(),
        None => text.trim().to_owned(),
    }
}
