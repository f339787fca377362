pub mod prompt;
pub mod response;

use crate::batch::Batch;
use crate::config::{LlmProvider, ReasoningSettings};
use crate::consolidate::ContextEntry;
use crate::error::{ReasoningError, ValidationError};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use response::BatchProposal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

const MAX_TOKENS: u32 = 8192;
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Submit one batch plus the current canonical context, get structured
/// proposals back. Swappable so tests can script the service.
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    async fn propose(
        &self,
        context: &[ContextEntry],
        batch: &Batch<'_>,
    ) -> Result<(BatchProposal, Vec<ValidationError>), ReasoningError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Exponential backoff; a server-provided delay wins when present.
    pub fn delay(&self, attempt: u32, err: &ReasoningError) -> Duration {
        if let Some(after) = err.retry_after() {
            return after.min(MAX_BACKOFF);
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempt cap is hit.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, batch: usize, mut op: F) -> Result<T, ReasoningError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ReasoningError>>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= max => {
                return Err(ReasoningError::Exhausted {
                    batch,
                    attempts: attempt,
                    last: Box::new(e),
                })
            }
            Err(e) => {
                let delay = policy.delay(attempt, &e);
                tracing::warn!(
                    "Batch {}: attempt {}/{} failed ({}), retrying in {:?}",
                    batch + 1, attempt, max, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    provider: LlmProvider,
    base_url: String,
    pub model: String,
    api_key: String,
    retry: RetryPolicy,
}

// Anthropic Messages API

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Debug)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

// OpenAI-compatible chat completions (OpenRouter)

#[derive(Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: &str) -> Self {
        Self { role: role.to_string(), content: content.to_string() }
    }
}

#[derive(Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
    pub usage: Option<Usage>,
}

#[derive(Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

fn parse_retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a non-success HTTP response onto the error taxonomy.
async fn status_error(resp: Response) -> ReasoningError {
    let status = resp.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ReasoningError::RateLimited { retry_after: parse_retry_after(&resp) };
    }
    let body = resp.text().await.unwrap_or_default();
    ReasoningError::Status { status: status.as_u16(), body }
}

impl LlmClient {
    pub fn new(settings: &ReasoningSettings) -> Result<Self, ReasoningError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| ReasoningError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            provider: settings.provider,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key: settings.api_key.clone(),
            retry: RetryPolicy {
                max_attempts: settings.max_attempts,
                base_backoff: settings.base_backoff,
            },
        })
    }

    /// One request, no retries. Returns the model's text reply.
    pub async fn complete(&self, prompt: &str) -> Result<String, ReasoningError> {
        match self.provider {
            LlmProvider::Anthropic => self.complete_anthropic(prompt).await,
            LlmProvider::OpenRouter => self.chat(prompt).await,
        }
    }

    async fn complete_anthropic(&self, prompt: &str) -> Result<String, ReasoningError> {
        let url = format!("{}/messages", self.base_url);
        let req = AnthropicRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system: prompt::SYSTEM_PROMPT,
            temperature: 0.0,
            messages: vec![ChatMessage::new("user", prompt)],
        };

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let body: AnthropicResponse = resp
            .json()
            .await
            .map_err(|e| ReasoningError::MalformedResponse(e.to_string()))?;
        if let Some(usage) = &body.usage {
            tracing::debug!("Tokens: {} in / {} out", usage.input_tokens, usage.output_tokens);
        }

        let text: String = body.content.into_iter().map(|c| c.text).collect();
        if text.trim().is_empty() {
            return Err(ReasoningError::MalformedResponse("empty completion".to_string()));
        }
        Ok(text)
    }

    async fn chat(&self, prompt: &str) -> Result<String, ReasoningError> {
        let url = format!("{}/chat/completions", self.base_url);
        let req = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::new("system", prompt::SYSTEM_PROMPT),
                ChatMessage::new("user", prompt),
            ],
            temperature: 0.0,
            max_tokens: MAX_TOKENS,
        };

        let resp = self
            .client
            .post(&url)
            .json(&req)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("X-Title", "formfuse")
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let body: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ReasoningError::MalformedResponse(e.to_string()))?;
        if let Some(usage) = &body.usage {
            tracing::debug!(
                "Tokens: {} prompt / {} completion / {} total",
                usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            );
        }

        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ReasoningError::MalformedResponse("no choices in response".to_string()))
    }
}

#[async_trait]
impl ReasoningProvider for LlmClient {
    async fn propose(
        &self,
        context: &[ContextEntry],
        batch: &Batch<'_>,
    ) -> Result<(BatchProposal, Vec<ValidationError>), ReasoningError> {
        let prompt = prompt::build_prompt(context, batch);
        let prompt = prompt.as_str();
        tracing::debug!("Batch {}: prompt is {} chars", batch.index + 1, prompt.len());

        with_retry(self.retry, batch.index, move |attempt| async move {
            tracing::info!("Batch {}: request attempt {}", batch.index + 1, attempt);
            let text = self.complete(prompt).await?;
            response::parse_proposal(&text)
        })
        .await
    }
}
