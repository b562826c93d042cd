//! OpenAI-compatible chat adapter.
//!
//! Implements [`LanguageModel`] against the `/v1/chat/completions`
//! surface, streaming via SSE `data:` events with the `[DONE]`
//! sentinel. Retries (rate limit, timeout, transient network/5xx) are
//! applied here so callers only see final [`ProviderError`]s.

use async_stream::stream;
use futures_util::StreamExt as _;
use std::time::Duration;
use tracing::debug;

use async_trait::async_trait;

use crate::config::LlmConfig;
use crate::error::ProviderError;
use crate::llm::sse::{self, SseDecoder};
use crate::llm::{ChatRequest, LanguageModel, RetryPolicy, Role, TextDeltaStream};

/// Chat client for an OpenAI-compatible provider.
#[derive(Clone)]
pub struct OpenAiChatClient {
    config: LlmConfig,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl std::fmt::Debug for OpenAiChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChatClient")
            .field("api_url", &self.config.api_url)
            .field("model_id", &self.config.model_id)
            .finish()
    }
}

impl OpenAiChatClient {
    /// Create a client from configuration.
    pub fn new(config: LlmConfig) -> Self {
        let retry = RetryPolicy::with_attempts(config.max_attempts);
        Self {
            config,
            http: reqwest::Client::new(),
            retry,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.config.api_url.trim_end_matches('/'))
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    /// Build the request body for one chat call.
    fn build_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .effective_messages()
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": match m.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let model = request
            .params
            .model_id
            .clone()
            .unwrap_or_else(|| self.config.model_id.clone());

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(obj) = body.as_object_mut() {
            if let Some(temperature) = request.params.temperature {
                obj.insert("temperature".into(), serde_json::json!(temperature));
            }
            if let Some(max_tokens) = request.params.max_output_tokens {
                obj.insert("max_tokens".into(), serde_json::json!(max_tokens));
            }
        }
        body
    }

    /// One HTTP round trip; returns the raw response or a typed error.
    async fn post_once(
        &self,
        body: &serde_json::Value,
    ) -> std::result::Result<reqwest::Response, ProviderError> {
        let send = self
            .http
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(body)
            .send();

        let response = tokio::time::timeout(self.timeout(), send)
            .await
            .map_err(|_| {
                ProviderError::Timeout(format!("LLM call exceeded {}s", self.config.timeout_secs))
            })?
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body_text = response.text().await.unwrap_or_default();
        Err(map_http_error(status.as_u16(), &body_text))
    }
}

/// Map a provider HTTP error to a [`ProviderError`].
fn map_http_error(status: u16, body: &str) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited(snippet(body)),
        400 if mentions_content_filter(body) => ProviderError::ContentFiltered(snippet(body)),
        _ => ProviderError::Api {
            status,
            body: snippet(body),
        },
    }
}

fn mentions_content_filter(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("content_filter")
        || lower.contains("content_policy")
        || lower.contains("content management policy")
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= 300 {
        trimmed.to_owned()
    } else {
        let mut end = 300;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}

/// Extract the completion text from a non-streaming response body.
fn extract_text(body: &serde_json::Value) -> std::result::Result<String, ProviderError> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| ProviderError::Api {
            status: 200,
            body: "response has no choices".into(),
        })?;

    if choice.get("finish_reason").and_then(|f| f.as_str()) == Some("content_filter") {
        return Err(ProviderError::ContentFiltered(
            "completion stopped by the provider's content filter".into(),
        ));
    }

    choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_owned)
        .ok_or_else(|| ProviderError::Api {
            status: 200,
            body: "response has no message content".into(),
        })
}

/// Extract the text delta from a streaming chunk payload, if any.
fn extract_delta(payload: &str) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_str(payload).ok()?;
    let delta = parsed
        .get("choices")?
        .as_array()?
        .first()?
        .get("delta")?
        .get("content")?
        .as_str()?;
    if delta.is_empty() {
        None
    } else {
        Some(delta.to_owned())
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatClient {
    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    async fn chat(&self, request: &ChatRequest) -> std::result::Result<String, ProviderError> {
        let body = self.build_body(request, false);
        self.retry
            .run(|| async {
                let response = self.post_once(&body).await?;
                let parsed: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| ProviderError::Network(format!("bad response body: {e}")))?;
                let text = extract_text(&parsed)?;
                debug!("chat completion: {} chars", text.len());
                Ok(text)
            })
            .await
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> std::result::Result<TextDeltaStream, ProviderError> {
        let body = self.build_body(request, true);
        // Retry covers stream initiation only; mid-stream failures are
        // delivered as Err items.
        let response = self.retry.run(|| self.post_once(&body)).await?;

        let mut byte_stream = response.bytes_stream();
        let deltas = stream! {
            let mut decoder = SseDecoder::new();
            let mut done = false;

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(ProviderError::Network(format!("stream read failed: {e}")));
                        return;
                    }
                };
                for payload in decoder.feed(&chunk) {
                    if sse::is_done(&payload) {
                        done = true;
                        break;
                    }
                    if let Some(delta) = extract_delta(&payload) {
                        yield Ok(delta);
                    }
                }
                if done {
                    break;
                }
            }

            if !done
                && let Some(payload) = decoder.finish()
                && !sse::is_done(&payload)
                && let Some(delta) = extract_delta(&payload)
            {
                yield Ok(delta);
            }
        };

        Ok(Box::pin(deltas))
    }
}
