//! LLM orchestration: the single abstraction over the chat provider.
//!
//! Every prompt chain talks to a [`LanguageModel`]: `chat` for a full
//! completion, `chat_stream` for incremental text deltas. Provider auth,
//! base URLs, and retry live behind the trait; callers only ever see
//! [`ProviderError`](crate::error::ProviderError) kinds.

pub mod openai;
pub mod sse;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// The role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Assistant (model) output.
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who sent this message.
    pub role: Role,
    /// Plain text content.
    pub content: String,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    /// Create a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
}

/// Uniform generation parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatParams {
    /// Model override; the adapter's configured model when `None`.
    pub model_id: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Output token cap.
    pub max_output_tokens: Option<u32>,
    /// System prompt override, prepended to the messages.
    pub system: Option<String>,
}

impl ChatParams {
    /// Parameters with a fixed temperature.
    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature: Some(temperature),
            ..Self::default()
        }
    }
}

/// A chat request: conversation plus parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Conversation history, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Generation parameters.
    pub params: ChatParams,
}

impl ChatRequest {
    /// Single-user-message request with the given parameters.
    pub fn user_prompt(prompt: impl Into<String>, params: ChatParams) -> Self {
        Self {
            messages: vec![ChatMessage::user(prompt)],
            params,
        }
    }

    /// The messages with any system override prepended.
    pub fn effective_messages(&self) -> Vec<ChatMessage> {
        match &self.params.system {
            Some(system) => {
                let mut messages = Vec::with_capacity(self.messages.len() + 1);
                messages.push(ChatMessage::system(system.clone()));
                messages.extend(self.messages.iter().cloned());
                messages
            }
            None => self.messages.clone(),
        }
    }
}

/// A boxed stream of text deltas.
pub type TextDeltaStream =
    Pin<Box<dyn Stream<Item = std::result::Result<String, ProviderError>> + Send>>;

/// The single abstraction over the LLM provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// The model id requests run against by default.
    fn model_id(&self) -> &str;

    /// Run a chat completion to completion and return the text.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] after the adapter's retry policy is
    /// exhausted.
    async fn chat(&self, request: &ChatRequest) -> std::result::Result<String, ProviderError>;

    /// Run a chat completion and stream text deltas as they arrive.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] when the stream cannot be initiated;
    /// mid-stream failures arrive as `Err` items.
    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> std::result::Result<TextDeltaStream, ProviderError>;
}

/// Strip a surrounding Markdown code fence from model output.
///
/// Models wrap structured output in ``` fences despite instructions;
/// every chain post-processor runs its payload through this first.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(after_open) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = after_open.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the language tag on the opening fence line.
    match body.find('\n') {
        Some(newline) => body[newline + 1..].trim(),
        None => body.trim(),
    }
}

/// Retry policy: exponential backoff with jitter on retryable errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts (first try included).
    pub max_attempts: u32,
    /// Base delay, doubled per attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt count and the default base delay.
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay before the given retry attempt (1-based), with jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        use rand::Rng as _;
        let factor = 1u32 << attempt.min(6);
        let base = self.base_delay.saturating_mul(factor);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        base + jitter
    }

    /// Run an operation under this policy, retrying on
    /// [`ProviderError::is_retryable`] failures.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> std::result::Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, ProviderError>>,
    {
        let mut last_error = ProviderError::Network("no attempt made".into());
        for attempt in 0..self.max_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.delay_for(attempt)).await;
            }
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    tracing::warn!("attempt {} failed (retryable): {e}", attempt + 1);
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }
}
