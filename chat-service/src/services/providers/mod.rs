//! Completion source abstractions and implementations.
//!
//! The pipeline only talks to [`CompletionSource`], so the Gemini backend
//! can be swapped for the mock in tests and local development.

pub mod gemini;
pub mod mock;

use crate::models::Message;
use async_trait::async_trait;
use std::pin::Pin;
use thiserror::Error;
use tokio_stream::Stream;

/// Error type for provider operations.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Content filtered")]
    ContentFiltered,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),
}

impl ProviderError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::NotConfigured(_) => "not_configured",
            ProviderError::ApiError(_) => "api_error",
            ProviderError::InvalidRequest(_) => "invalid_request",
            ProviderError::RateLimited(_) => "rate_limited",
            ProviderError::ContentFiltered => "content_filtered",
            ProviderError::NetworkError(_) => "network_error",
            ProviderError::Timeout(_) => "timeout",
        }
    }
}

/// Reason why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Complete,
    Length,
    ContentFilter,
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Complete => "complete",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Error => "error",
        }
    }
}

/// Stream chunk for streaming responses.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Text fragment.
    Text(String),

    /// Final completion with usage stats.
    Complete {
        input_tokens: i32,
        output_tokens: i32,
        finish_reason: FinishReason,
    },
}

/// Lazy, fallible sequence of chunks. Dropping it cancels the upstream call.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Generation parameters for completion requests.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    /// Temperature (0.0 - 2.0).
    pub temperature: Option<f32>,

    /// Maximum output tokens.
    pub max_tokens: Option<i32>,
}

/// Source of model-generated text.
#[async_trait]
pub trait CompletionSource: Send + Sync {
    /// Stream a reply to `prompt` given the prior conversation.
    async fn stream(
        &self,
        prompt: &str,
        history: &[Message],
        params: &GenerationParams,
    ) -> Result<FragmentStream, ProviderError>;

    /// Run a single-shot call under `instruction` and return the raw text.
    /// Used for intent classification.
    async fn classify(&self, instruction: &str, text: &str) -> Result<String, ProviderError>;

    /// Health check.
    async fn health_check(&self) -> Result<(), ProviderError>;

    /// Provider name for logs and metrics.
    fn name(&self) -> &'static str;
}
