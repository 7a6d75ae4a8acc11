//! LLM client trait and the Anthropic provider implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{Error, Result};
use crate::llm::types::{
    CompletionRequest, CompletionResponse, LlmErrorKind, ModelSpec, StopReason, TokenUsage,
    ToolCallRequest,
};

/// Client for multi-turn chat completion with structured tool calls.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete a conversation turn.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// List available models.
    fn available_models(&self) -> Vec<ModelSpec>;
}

/// Retry policy for transient provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
}

impl RetryConfig {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt as i32);
        let millis = (self.base_delay_ms as f64 * factor).round().max(0.0) as u64;
        Duration::from_millis(millis)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 200,
            backoff_factor: 2.0,
        }
    }
}

/// Configuration for the Anthropic client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub timeout_secs: u64,
    pub retry: RetryConfig,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            default_model: None,
            timeout_secs: 120,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }
}

/// Anthropic Messages API client with tool use.
pub struct AnthropicClient {
    config: ClientConfig,
    http: Client,
}

impl AnthropicClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::llm(LlmErrorKind::Transport, e.to_string()))?;
        Ok(Self { config, http })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }

    fn classify_status(status: reqwest::StatusCode, body: &str) -> LlmErrorKind {
        match status.as_u16() {
            401 | 403 => LlmErrorKind::Authentication,
            429 => LlmErrorKind::RateLimited,
            400 if body.contains("context") || body.contains("too long") => {
                LlmErrorKind::ContextExceeded
            }
            500..=599 => LlmErrorKind::Transport,
            _ => LlmErrorKind::MalformedResponse,
        }
    }

    async fn complete_once(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let model = request
            .model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| ModelSpec::claude_sonnet().id);

        let messages: Vec<AnthropicMessage> = request
            .messages
            .iter()
            .map(AnthropicMessage::from_chat)
            .collect();

        let api_request = AnthropicRequest {
            model: model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(4096),
            system: request.system.clone(),
            temperature: request.temperature,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(request.tools.clone())
            },
        };

        let url = format!("{}/v1/messages", self.base_url());
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::llm(LlmErrorKind::Transport, format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            Error::llm(LlmErrorKind::Transport, format!("read response: {}", e))
        })?;

        if !status.is_success() {
            let kind = Self::classify_status(status, &body);
            return Err(Error::llm(kind, format!("{}: {}", status, body)));
        }

        let api_response: AnthropicResponse = serde_json::from_str(&body).map_err(|e| {
            Error::llm(
                LlmErrorKind::MalformedResponse,
                format!("parse response: {}", e),
            )
        })?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in &api_response.content {
            match block {
                AnthropicContent::Text { text } => content.push_str(text),
                AnthropicContent::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCallRequest {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: input.clone(),
                    });
                }
            }
        }

        let stop_reason = api_response.stop_reason.as_deref().map(|r| match r {
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            "tool_use" => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        });

        Ok(CompletionResponse {
            content,
            tool_calls,
            usage: TokenUsage {
                input_tokens: api_response.usage.input_tokens,
                output_tokens: api_response.usage.output_tokens,
                cache_creation_tokens: api_response
                    .usage
                    .cache_creation_input_tokens
                    .unwrap_or(0),
                cache_read_tokens: api_response.usage.cache_read_input_tokens.unwrap_or(0),
            },
            stop_reason,
            model: api_response.model,
            raw: body,
        })
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let mut attempt = 0u32;
        loop {
            match self.complete_once(&request).await {
                Ok(response) => return Ok(response),
                Err(Error::Llm { kind, message })
                    if kind.is_retryable() && attempt < self.config.retry.max_retries =>
                {
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        kind = %kind,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "LLM call failed, retrying: {}",
                        message
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn available_models(&self) -> Vec<ModelSpec> {
        vec![ModelSpec::claude_sonnet(), ModelSpec::claude_haiku()]
    }
}

// Anthropic API wire types

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Value,
}

impl AnthropicMessage {
    fn from_chat(message: &crate::llm::types::ChatMessage) -> Self {
        use crate::llm::types::ChatRole;
        match message.role {
            ChatRole::Tool => Self {
                role: "user".to_string(),
                content: serde_json::json!([{
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                    "content": message.content,
                }]),
            },
            ChatRole::Assistant if !message.tool_calls.is_empty() => {
                let mut blocks = Vec::new();
                if !message.content.is_empty() {
                    blocks.push(serde_json::json!({"type": "text", "text": message.content}));
                }
                for call in &message.tool_calls {
                    blocks.push(serde_json::json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                Self {
                    role: "assistant".to_string(),
                    content: Value::Array(blocks),
                }
            }
            ChatRole::Assistant => Self {
                role: "assistant".to_string(),
                content: Value::String(message.content.clone()),
            },
            // System content is carried in the request's system field; a
            // stray system message degrades to user
            ChatRole::System | ChatRole::User => Self {
                role: "user".to_string(),
                content: Value::String(message.content.clone()),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<AnthropicContent>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContent {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
}
