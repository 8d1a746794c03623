//! [`LlmDriver`] – OpenAI-compatible inference endpoint.
//!
//! Talks to any server exposing `/v1/chat/completions`, such as
//! [Ollama](https://ollama.com) (`http://localhost:11434`), vLLM, or a hosted
//! provider.  HTTP status codes are classified into [`InferenceError`]
//! variants so the gateway knows what is worth retrying.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use ember_runtime::config::EndpointConfig;
//! use ember_runtime::inference::{ChatMessage, InferenceEndpoint};
//! use ember_runtime::llm_driver::LlmDriver;
//!
//! # async fn demo() {
//! let driver = LlmDriver::new(&EndpointConfig::default());
//! let messages = vec![ChatMessage::user("What should I do next?")];
//! // Requires a running model server.
//! let _reply = driver.complete(&messages, Duration::from_secs(3)).await;
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use ember_kernel::grammar::reply_schema;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::EndpointConfig;
use crate::inference::{ChatMessage, InferenceEndpoint, InferenceError};

// ─────────────────────────────────────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: serde_json::Value,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmDriver
// ─────────────────────────────────────────────────────────────────────────────

/// An async client for an OpenAI-compatible chat-completions endpoint.
///
/// Construct once and reuse across ticks.
pub struct LlmDriver {
    url: String,
    model: String,
    api_key: Option<Zeroizing<String>>,
    temperature: Option<f32>,
    structured_output: bool,
    client: reqwest::Client,
}

impl LlmDriver {
    pub fn new(config: &EndpointConfig) -> Self {
        Self {
            url: format!("{}/v1/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            structured_output: config.structured_output,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request_body(&self, messages: &[ChatMessage]) -> serde_json::Value {
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            temperature: self.temperature,
            response_format: self.structured_output.then(|| ResponseFormat {
                kind: "json_schema",
                json_schema: serde_json::json!({
                    "name": "ember_actions",
                    "schema": reply_schema(),
                }),
            }),
        };
        serde_json::to_value(&body).unwrap_or(serde_json::Value::Null)
    }
}

#[async_trait]
impl InferenceEndpoint for LlmDriver {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, InferenceError> {
        let mut request = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(&self.request_body(messages));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.as_str());
        }

        let response = request.send().await.map_err(|e| classify_transport(e, timeout))?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport(e, timeout))?;
        debug!(status, bytes = body.len(), "chat completion response");

        if let Some(err) = classify_status(status, retry_after, &body) {
            return Err(err);
        }
        parse_reply(&body)
    }
}

fn classify_transport(e: reqwest::Error, timeout: Duration) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout(timeout)
    } else if e.is_decode() || e.is_body() {
        InferenceError::Malformed(e.to_string())
    } else {
        InferenceError::Transport(e.to_string())
    }
}

fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> Option<InferenceError> {
    let body = || body.chars().take(200).collect::<String>();
    match status {
        200..=299 => None,
        429 => Some(InferenceError::RateLimited { retry_after }),
        500..=599 => Some(InferenceError::Server {
            status,
            body: body(),
        }),
        _ => Some(InferenceError::BadRequest {
            status,
            body: body(),
        }),
    }
}

/// Extract the assistant text from a chat-completions body.  A reply cut off
/// by the token limit is refused rather than parsed.
fn parse_reply(body: &str) -> Result<String, InferenceError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| InferenceError::Malformed(format!("invalid JSON: {e}")))?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| InferenceError::Malformed("empty choices array".into()))?;
    if choice.finish_reason.as_deref() == Some("length") {
        return Err(InferenceError::Malformed(
            "reply truncated by the token limit".into(),
        ));
    }
    Ok(choice.message.content.unwrap_or_default())
}
