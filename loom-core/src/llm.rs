//! The text generation collaborator.
//!
//! Search strategies, the writer and the planner's refinement all talk to
//! a [`Generator`]. [`ClaudeGenerator`] is the production implementation;
//! [`ResilientGenerator`] wraps any generator with a timeout and bounded
//! retry so one slow or flaky call never stalls a whole search.

use async_trait::async_trait;
use claude::{Claude, Message, Request};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio_retry2::strategy::{jitter, ExponentialBackoff};
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, warn};

/// Default system prompt when a caller doesn't supply one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

const JSON_INSTRUCTION: &str = "Respond in valid JSON format.";

/// Errors from the generation collaborator.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(#[from] claude::Error),

    #[error("Malformed structured response: {0}")]
    Malformed(String),

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Generator not configured: {0}")]
    NotConfigured(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Api(e) => e.is_retryable(),
            LlmError::Timeout(_) => true,
            LlmError::Malformed(_) | LlmError::NotConfigured(_) => false,
        }
    }
}

/// Free-text and structured generation.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        system: &str,
        temperature: f32,
    ) -> Result<String, LlmError>;

    /// Generate and parse a JSON payload. Callers must tolerate missing and
    /// extra fields.
    async fn generate_structured(&self, prompt: &str, system: &str) -> Result<Value, LlmError>;
}

#[async_trait]
impl<G: Generator + ?Sized> Generator for std::sync::Arc<G> {
    async fn generate(
        &self,
        prompt: &str,
        system: &str,
        temperature: f32,
    ) -> Result<String, LlmError> {
        (**self).generate(prompt, system, temperature).await
    }

    async fn generate_structured(&self, prompt: &str, system: &str) -> Result<Value, LlmError> {
        (**self).generate_structured(prompt, system).await
    }
}

/// Generator backed by the Claude Messages API.
#[derive(Clone)]
pub struct ClaudeGenerator {
    client: Claude,
    max_tokens: usize,
    structured_temperature: f32,
}

impl ClaudeGenerator {
    pub fn new(client: Claude) -> Self {
        Self {
            client,
            max_tokens: 8192,
            structured_temperature: 0.7,
        }
    }

    /// Create from `ANTHROPIC_API_KEY`.
    pub fn from_env() -> Result<Self, LlmError> {
        let client = Claude::from_env()
            .map_err(|_| LlmError::NotConfigured("set ANTHROPIC_API_KEY".to_string()))?;
        Ok(Self::new(client))
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.client = self.client.with_model(model);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    async fn complete(
        &self,
        prompt: &str,
        system: &str,
        temperature: f32,
    ) -> Result<String, LlmError> {
        let request = Request::new(vec![Message::user(prompt)])
            .with_system(system)
            .with_max_tokens(self.max_tokens)
            .with_temperature(temperature);

        let response = self.client.complete(request).await?;
        debug!(
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "Completion finished"
        );
        Ok(response.text())
    }
}

#[async_trait]
impl Generator for ClaudeGenerator {
    async fn generate(
        &self,
        prompt: &str,
        system: &str,
        temperature: f32,
    ) -> Result<String, LlmError> {
        self.complete(prompt, system, temperature).await
    }

    async fn generate_structured(&self, prompt: &str, system: &str) -> Result<Value, LlmError> {
        let system = format!("{system}\n{JSON_INSTRUCTION}");
        let text = self
            .complete(prompt, &system, self.structured_temperature)
            .await?;
        parse_structured(&text)
    }
}

/// Parse a model reply as JSON, tolerating markdown fences and prose around the object.
pub fn parse_structured(text: &str) -> Result<Value, LlmError> {
    let candidate = extract_json(text);
    serde_json::from_str(candidate).map_err(|e| {
        LlmError::Malformed(format!("{e}; response began with {:?}", preview(text)))
    })
}

/// Pull the JSON object out of a response that may be wrapped in a code block.
fn extract_json(text: &str) -> &str {
    let text = text.trim();

    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // Prose before or after a bare object.
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

fn preview(text: &str) -> String {
    text.chars().take(80).collect()
}

/// Timeout and retry policy for external calls.
#[derive(Debug, Clone)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub max_retries: usize,
    /// Base of the exponential backoff between attempts.
    pub backoff_base: Duration,
    pub max_delay: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_retries: 2,
            backoff_base: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Wraps a generator with a per-attempt timeout and bounded retry.
///
/// Only retryable failures (network, rate limiting, server errors,
/// timeouts) are repeated; malformed output fails immediately.
pub struct ResilientGenerator<G> {
    inner: G,
    policy: CallPolicy,
}

impl<G: Generator> ResilientGenerator<G> {
    pub fn new(inner: G, policy: CallPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        let base = u64::try_from(self.policy.backoff_base.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        ExponentialBackoff::from_millis(base)
            .factor(2)
            .max_delay(self.policy.max_delay)
            .map(jitter)
            .take(self.policy.max_retries)
    }
}

/// Run `attempt` under the timeout, classifying the failure for the retry loop.
async fn classify<T, F>(timeout: Duration, attempt: F) -> Result<T, RetryError<LlmError>>
where
    F: std::future::Future<Output = Result<T, LlmError>>,
{
    let result = match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout(timeout)),
    };

    result.map_err(|e| {
        if e.is_retryable() {
            warn!(error = %e, "Transient generation failure, will retry");
            RetryError::Transient {
                err: e,
                retry_after: None,
            }
        } else {
            RetryError::Permanent(e)
        }
    })
}

#[async_trait]
impl<G: Generator> Generator for ResilientGenerator<G> {
    async fn generate(
        &self,
        prompt: &str,
        system: &str,
        temperature: f32,
    ) -> Result<String, LlmError> {
        let inner = &self.inner;
        let timeout = self.policy.timeout;
        Retry::spawn(self.retry_strategy(), || async move {
            classify(timeout, inner.generate(prompt, system, temperature)).await
        })
        .await
    }

    async fn generate_structured(&self, prompt: &str, system: &str) -> Result<Value, LlmError> {
        let inner = &self.inner;
        let timeout = self.policy.timeout;
        Retry::spawn(self.retry_strategy(), || async move {
            classify(timeout, inner.generate_structured(prompt, system)).await
        })
        .await
    }
}
