//! Podcast script synthesis and validation.
//!
//! The model is prompted for a host/expert conversation as a strict JSON
//! array of `{speaker, text}` turns. Post-processing strips markup,
//! merges consecutive same-speaker turns, and enforces the structural
//! constraints (host first, strict alternation, 12..=60 turns, 8..=80
//! words per turn). One repair re-prompt is allowed before the chain
//! fails with `validation_failed`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::PromptContext;
use crate::error::{GitcastError, Result};
use crate::llm::{ChatParams, ChatRequest, LanguageModel, strip_code_fences};

/// Turn count bounds.
pub const MIN_TURNS: usize = 12;
/// Turn count bounds.
pub const MAX_TURNS: usize = 60;
/// Per-turn word bounds.
pub const MIN_WORDS_PER_TURN: usize = 8;
/// Per-turn word bounds.
pub const MAX_WORDS_PER_TURN: usize = 80;

/// Which voice speaks a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// The curious host.
    Host,
    /// The technical expert.
    Expert,
}

impl Speaker {
    fn other(self) -> Self {
        match self {
            Self::Host => Self::Expert,
            Self::Expert => Self::Host,
        }
    }
}

/// One utterance in the script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Who speaks.
    pub speaker: Speaker,
    /// Plain spoken text, no markup.
    pub text: String,
    /// Position in the script.
    pub index: usize,
    /// Start offset in the combined audio, set after TTS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ms: Option<u64>,
    /// End offset in the combined audio, set after TTS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ms: Option<u64>,
}

impl Turn {
    /// Word count of the turn text.
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// A validated podcast script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodcastScript {
    /// Turns in speaking order.
    pub turns: Vec<Turn>,
}

impl PodcastScript {
    /// Total word count.
    pub fn total_words(&self) -> usize {
        self.turns.iter().map(Turn::word_count).sum()
    }
}

/// Raw turn shape the model produces.
#[derive(Debug, Deserialize)]
struct RawTurn {
    speaker: Speaker,
    text: String,
}

/// Synthesize a validated script for the given target duration.
///
/// # Errors
///
/// Returns [`GitcastError::Validation`] when the output still violates
/// the constraints after the one repair pass, or a provider error.
pub async fn synthesize_script(
    model: &Arc<dyn LanguageModel>,
    context: &PromptContext,
    repo_name: &str,
    duration_minutes: u32,
    words_per_minute: u32,
) -> Result<PodcastScript> {
    let prompt = script_prompt(context, repo_name, duration_minutes, words_per_minute);
    let request = ChatRequest::user_prompt(prompt.clone(), ChatParams::with_temperature(0.7));
    let reply = model.chat(&request).await?;

    match postprocess_script(&reply) {
        Ok(script) => {
            info!(
                "script ready: {} turns, {} words",
                script.turns.len(),
                script.total_words()
            );
            Ok(script)
        }
        Err(reason) => {
            warn!("script invalid, repairing: {reason}");
            let repair = format!(
                "{prompt}\n\nYour previous answer was rejected: {reason}. \
                 Produce a corrected JSON array that satisfies every constraint."
            );
            let request = ChatRequest::user_prompt(repair, ChatParams::with_temperature(0.7));
            let reply = model.chat(&request).await?;
            postprocess_script(&reply)
                .map_err(|e| GitcastError::Validation(format!("script validation failed: {e}")))
        }
    }
}

/// Build the style-directive prompt.
fn script_prompt(
    context: &PromptContext,
    repo_name: &str,
    duration_minutes: u32,
    words_per_minute: u32,
) -> String {
    let target_words = duration_minutes * words_per_minute;
    format!(
        "Write a two-speaker podcast script about the repository {repo_name}. \
         The \"host\" asks curious questions and keeps the show moving; the \
         \"expert\" explains the project: what it does, how it is put \
         together, and what is interesting about its design. Target about \
         {target_words} words total ({duration_minutes} minutes of speech).\n\
         \n\
         Rules:\n\
         - Respond with a JSON array only: [{{\"speaker\": \"host\", \"text\": \"...\"}}, ...]\n\
         - Speakers must strictly alternate, starting with the host.\n\
         - Between {MIN_TURNS} and {MAX_TURNS} turns.\n\
         - Each turn between {MIN_WORDS_PER_TURN} and {MAX_WORDS_PER_TURN} words.\n\
         - Plain spoken language: no markdown, no code, no stage directions.\n\
         \n\
         {}",
        context.render()
    )
}

/// Parse, clean, and validate model output into a script.
///
/// The error string doubles as repair-prompt feedback.
pub fn postprocess_script(reply: &str) -> std::result::Result<PodcastScript, String> {
    let cleaned = strip_code_fences(reply);
    let raw: Vec<RawTurn> =
        serde_json::from_str(cleaned).map_err(|e| format!("not a valid JSON turn array: {e}"))?;

    // Strip markup, drop empty turns, merge same-speaker runs.
    let mut merged: Vec<(Speaker, String)> = Vec::with_capacity(raw.len());
    for turn in raw {
        let text = strip_markup(&turn.text);
        if text.is_empty() {
            continue;
        }
        match merged.last_mut() {
            Some((speaker, existing)) if *speaker == turn.speaker => {
                existing.push(' ');
                existing.push_str(&text);
            }
            _ => merged.push((turn.speaker, text)),
        }
    }

    let turns: Vec<Turn> = merged
        .into_iter()
        .enumerate()
        .map(|(index, (speaker, text))| Turn {
            speaker,
            text,
            index,
            start_ms: None,
            end_ms: None,
        })
        .collect();
    let script = PodcastScript { turns };
    validate_script(&script)?;
    Ok(script)
}

/// Check the structural constraints.
///
/// # Errors
///
/// Returns a description of every violated constraint, joined, so the
/// repair prompt can address them all at once.
pub fn validate_script(script: &PodcastScript) -> std::result::Result<(), String> {
    let mut problems = Vec::new();

    let n = script.turns.len();
    if !(MIN_TURNS..=MAX_TURNS).contains(&n) {
        problems.push(format!(
            "turn count {n} outside {MIN_TURNS}..={MAX_TURNS}"
        ));
    }

    if let Some(first) = script.turns.first()
        && first.speaker != Speaker::Host
    {
        problems.push("the first speaker must be the host".to_owned());
    }

    let mut expected = Speaker::Host;
    for turn in &script.turns {
        if turn.speaker != expected {
            problems.push(format!("turn {} breaks speaker alternation", turn.index));
            break;
        }
        expected = expected.other();
    }

    for turn in &script.turns {
        let words = turn.word_count();
        if !(MIN_WORDS_PER_TURN..=MAX_WORDS_PER_TURN).contains(&words) {
            problems.push(format!(
                "turn {} has {words} words, outside {MIN_WORDS_PER_TURN}..={MAX_WORDS_PER_TURN}",
                turn.index
            ));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join("; "))
    }
}

/// Remove markdown markup, leaving plain spoken text.
fn strip_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' | '_' | '`' | '#' | '~' => {}
            '[' => {
                // Turn [label](url) into the label.
                let label: String = chars.by_ref().take_while(|c| *c != ']').collect();
                out.push_str(&label);
                if chars.peek() == Some(&'(') {
                    for c in chars.by_ref() {
                        if c == ')' {
                            break;
                        }
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
