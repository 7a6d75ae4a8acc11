//! LLM provider interface: request/response types and the HTTP client.

pub mod client;
pub mod types;

pub use client::{AnthropicClient, ClientConfig, LlmClient, RetryConfig};
pub use types::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, CostSummary, LlmErrorKind,
    ModelSpec, StopReason, TokenUsage, ToolCallRequest,
};
