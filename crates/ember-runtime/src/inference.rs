//! Inference Gateway: one external model call per tick, with a hard timeout.
//!
//! [`InferenceEndpoint`] is the capability the gateway wraps: messages in,
//! text out, may fail or hang.  [`InferenceGateway::infer`] adds the
//! contract the loop relies on:
//!
//! - the whole call, retries included, finishes within `timeout` or yields
//!   [`InferenceError::Timeout`];
//! - only transient failures (transport errors, rate limits, 5xx) are
//!   retried, at most `max_retries` times, with exponential backoff;
//! - request-shaped failures (4xx, malformed or truncated replies) are
//!   returned at once.  A partial reply is never passed on as complete.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ember_types::{EmberError, RawInferenceResponse};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::prompt::Prompt;

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

/// The role of a participant in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failures of one inference call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),
    /// Connection refused, reset, DNS failure.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },
    /// The endpoint refused the request itself (4xx other than 429).
    #[error("request rejected ({status}): {body}")]
    BadRequest { status: u16, body: String },
    /// Unparseable, empty-choice, or truncated reply.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl InferenceError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InferenceError::Transport(_)
                | InferenceError::RateLimited { .. }
                | InferenceError::Server { .. }
        )
    }
}

impl From<InferenceError> for EmberError {
    fn from(e: InferenceError) -> Self {
        match e {
            InferenceError::Timeout(after) => EmberError::InferenceTimeout { after },
            other => EmberError::InferenceFailure(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Endpoint capability
// ─────────────────────────────────────────────────────────────────────────────

/// An external model: prompt in, text out.
#[async_trait]
pub trait InferenceEndpoint: Send + Sync {
    /// Label used in logs.
    fn name(&self) -> &str;

    /// Run one completion.  Implementations should honour `timeout`; the
    /// gateway enforces it regardless.
    ///
    /// # Errors
    ///
    /// Any [`InferenceError`].
    async fn complete(
        &self,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, InferenceError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry policy
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Additional attempts after the first.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    /// `min(base * 2^attempt, max)` for the 0-indexed retry `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway
// ─────────────────────────────────────────────────────────────────────────────

pub struct InferenceGateway {
    endpoint: Arc<dyn InferenceEndpoint>,
    retry: RetryConfig,
}

impl InferenceGateway {
    pub fn new(endpoint: Arc<dyn InferenceEndpoint>, retry: RetryConfig) -> Self {
        Self { endpoint, retry }
    }

    pub fn endpoint_name(&self) -> &str {
        self.endpoint.name()
    }

    /// Send `prompt` and wait at most `timeout` for a complete reply.
    ///
    /// # Errors
    ///
    /// [`InferenceError::Timeout`] when the budget runs out, otherwise the
    /// last endpoint error.
    #[instrument(skip(self, prompt), fields(endpoint = %self.endpoint.name()))]
    pub async fn infer(
        &self,
        tick_id: u64,
        prompt: &Prompt,
        timeout: Duration,
    ) -> Result<RawInferenceResponse, InferenceError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let messages = prompt.messages();
        let mut attempt = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let call = self.endpoint.complete(&messages, remaining);
            let result = match tokio::time::timeout_at(deadline, call).await {
                Ok(result) => result,
                Err(_) => Err(InferenceError::Timeout(timeout)),
            };

            match result {
                Ok(text) => {
                    let arrived_at = Instant::now();
                    let latency = arrived_at - started;
                    debug!(tick_id, attempt, latency_ms = latency.as_millis() as u64, "inference completed");
                    return Ok(RawInferenceResponse {
                        tick_id,
                        text,
                        arrived_at,
                        latency,
                    });
                }
                Err(InferenceError::Timeout(_)) => return Err(InferenceError::Timeout(timeout)),
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    let mut delay = self.retry.delay(attempt);
                    if let InferenceError::RateLimited {
                        retry_after: Some(hint),
                    } = &err
                    {
                        delay = delay.max(*hint);
                    }
                    if Instant::now() + delay >= deadline {
                        warn!(tick_id, error = %err, "no time left to retry inference");
                        return Err(err);
                    }
                    warn!(
                        tick_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying inference after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scripted endpoint
// ─────────────────────────────────────────────────────────────────────────────

/// An in-process endpoint that replays canned results, for headless runs and
/// tests.  Once the script is exhausted the last entry repeats.
pub struct ScriptedEndpoint {
    script: Mutex<VecDeque<Result<String, InferenceError>>>,
    last: Mutex<Option<Result<String, InferenceError>>>,
    latency: Duration,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedEndpoint {
    pub fn new<I>(script: I) -> Self
    where
        I: IntoIterator<Item = Result<String, InferenceError>>,
    {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            last: Mutex::new(None),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Always reply with `text`.
    pub fn replying(text: impl Into<String>) -> Self {
        Self::new([Ok(text.into())])
    }

    /// Delay every reply by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every message list this endpoint was called with.
    pub fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl InferenceEndpoint for ScriptedEndpoint {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        _timeout: Duration,
    ) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(messages.to_vec());
        let next = {
            let mut script = self.script.lock().unwrap_or_else(|p| p.into_inner());
            let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
            match script.pop_front() {
                Some(entry) => {
                    *last = Some(entry.clone());
                    entry
                }
                None => last
                    .clone()
                    .unwrap_or_else(|| Ok(String::new())),
            }
        };
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        next
    }
}
