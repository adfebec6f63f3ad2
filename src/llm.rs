//! LLM completion client with bounded retry
//!
//! A [`CompletionTransport`] performs exactly one request and classifies the
//! outcome as an [`Attempt`]; [`RetryingClient`] loops over attempts with
//! exponential backoff and exposes the [`LlmClient`] contract the
//! summarization stages depend on.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::error::LlmError;

/// `complete(system, user, temperature) -> text`
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str, temperature: f32) -> Result<String, LlmError>;
}

/// Outcome of a single completion try
#[derive(Debug)]
pub enum Attempt {
    Success(String),
    Retryable(LlmError),
    Fatal(LlmError),
}

impl Attempt {
    /// Classify an HTTP status from the completion endpoint
    pub fn from_status(code: u16, body: String) -> Self {
        let error = LlmError::Status { code, body };
        if code == 429 || (500..600).contains(&code) {
            Attempt::Retryable(error)
        } else {
            Attempt::Fatal(error)
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub system: &'a str,
    pub user: &'a str,
    pub temperature: f32,
}

/// One network round trip to the completion service
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    async fn attempt(&self, request: &CompletionRequest<'_>) -> Attempt;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// `base * 2^attempt`, capped
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_backoff.as_millis() as u64;
        let delay_ms = base
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(self.max_backoff.as_millis() as u64);
        Duration::from_millis(delay_ms)
    }
}

impl From<&LlmConfig> for RetryPolicy {
    fn from(config: &LlmConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

pub struct RetryingClient<T> {
    transport: T,
    policy: RetryPolicy,
}

impl<T: CompletionTransport> RetryingClient<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }
}

#[async_trait]
impl<T: CompletionTransport> LlmClient for RetryingClient<T> {
    async fn complete(&self, system: &str, user: &str, temperature: f32) -> Result<String, LlmError> {
        let request = CompletionRequest {
            system,
            user,
            temperature,
        };
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match self.transport.attempt(&request).await {
                Attempt::Success(text) => {
                    if attempt > 0 {
                        info!("Completion succeeded after {} retries", attempt);
                    }
                    return Ok(text);
                }
                Attempt::Fatal(e) => return Err(e),
                Attempt::Retryable(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(LlmError::Exhausted {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    let delay = self.policy.backoff_delay(attempt - 1);
                    warn!(
                        "Completion attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// OpenAI-compatible chat completions endpoint
pub struct OpenAiTransport {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
}

impl OpenAiTransport {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("Missing LLM API key in ${}", config.api_key_env))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .build()
            .context("Failed to build LLM HTTP client")?;

        Ok(Self {
            client,
            url: format!("{}/v1/chat/completions", config.api_base.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[async_trait]
impl CompletionTransport for OpenAiTransport {
    async fn attempt(&self, request: &CompletionRequest<'_>) -> Attempt {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: request.system,
                },
                ChatMessage {
                    role: "user",
                    content: request.user,
                },
            ],
            temperature: request.temperature,
        };

        debug!("Requesting completion from {}", self.url);
        let response = match self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Attempt::Retryable(LlmError::Transport(e.to_string())),
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Attempt::from_status(status.as_u16(), text);
        }

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return Attempt::Retryable(LlmError::Transport(e.to_string())),
        };
        match parse_chat_response(&text) {
            Ok(content) => Attempt::Success(content),
            Err(e) => Attempt::Fatal(e),
        }
    }
}

fn parse_chat_response(text: &str) -> Result<String, LlmError> {
    let parsed: ChatResponse =
        serde_json::from_str(text).map_err(|e| LlmError::Malformed(e.to_string()))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| LlmError::Malformed("response has no message content".to_string()))
}

/// Decode a JSON value from model output that may be wrapped in prose or
/// a fenced code block
pub fn parse_json_reply<T: DeserializeOwned>(text: &str) -> Result<T, LlmError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    let start = trimmed.find(['{', '[']);
    let end = trimmed.rfind(['}', ']']);
    match (start, end) {
        (Some(start), Some(end)) if end > start => serde_json::from_str(&trimmed[start..=end])
            .map_err(|e| LlmError::Malformed(format!("{}: {}", e, excerpt_for_log(trimmed)))),
        _ => Err(LlmError::Malformed(format!("no JSON in reply: {}", excerpt_for_log(trimmed)))),
    }
}

fn excerpt_for_log(text: &str) -> String {
    crate::extractor::excerpt(text, 120)
}
