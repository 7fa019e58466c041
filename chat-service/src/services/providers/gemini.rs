//! Gemini completion source.
//!
//! Streams replies through `streamGenerateContent` (SSE) and runs intent
//! classification through `generateContent`.

use super::{
    CompletionSource, FinishReason, FragmentStream, GenerationParams, ProviderError, StreamChunk,
};
use crate::models::{Message, Role};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Gemini API base URL.
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const API_KEY_HEADER: &str = "x-goog-api-key";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Gemini provider configuration.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub system_prompt: String,
    pub base_url: String,
    /// Longest silence tolerated between two reads of a response. The
    /// overall bound on a turn belongs to the pipeline.
    pub read_timeout: Duration,
}

impl GeminiConfig {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            system_prompt: system_prompt.into(),
            base_url: GEMINI_API_BASE.to_string(),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Gemini completion source.
pub struct GeminiCompletionSource {
    config: GeminiConfig,
    client: Client,
}

impl GeminiCompletionSource {
    pub fn new(config: GeminiConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(config.read_timeout)
            .build()
            .map_err(|e| {
                ProviderError::NotConfigured(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self { config, client })
    }

    /// Build the API URL for the configured model and method. The key
    /// travels in a header so it never shows up in URLs or error text.
    fn api_url(&self, method: &str) -> String {
        format!("{}/models/{}:{}", self.config.base_url, self.config.model, method)
    }

    /// Map prior conversation plus the new prompt onto Gemini contents.
    fn build_contents(history: &[Message], prompt: &str) -> Vec<Content> {
        let mut contents: Vec<Content> = history
            .iter()
            .map(|m| Content {
                role: Some(
                    match m.role {
                        Role::User => "user",
                        Role::Assistant => "model",
                    }
                    .to_string(),
                ),
                parts: vec![ContentPart {
                    text: Some(m.content.clone()),
                }],
            })
            .collect();

        contents.push(Content {
            role: Some("user".to_string()),
            parts: vec![ContentPart {
                text: Some(prompt.to_string()),
            }],
        });

        contents
    }

    fn system_instruction(text: &str) -> Option<Content> {
        if text.is_empty() {
            return None;
        }
        Some(Content {
            role: None,
            parts: vec![ContentPart {
                text: Some(text.to_string()),
            }],
        })
    }

    async fn post(
        &self,
        url: &str,
        request: &GenerateContentRequest,
    ) -> Result<Response, ProviderError> {
        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(request)
            .send()
            .await
            .map_err(network_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();

            if status.as_u16() == 429 {
                return Err(ProviderError::RateLimited(error_text));
            }

            return Err(ProviderError::ApiError(format!(
                "Gemini API error {}: {}",
                status, error_text
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionSource for GeminiCompletionSource {
    async fn stream(
        &self,
        prompt: &str,
        history: &[Message],
        params: &GenerationParams,
    ) -> Result<FragmentStream, ProviderError> {
        let request = GenerateContentRequest {
            system_instruction: Self::system_instruction(&self.config.system_prompt),
            contents: Self::build_contents(history, prompt),
            generation_config: Some(GenerationConfig {
                temperature: params.temperature,
                max_output_tokens: params.max_tokens,
            }),
        };

        let url = format!("{}?alt=sse", self.api_url("streamGenerateContent"));

        tracing::debug!(
            model = %self.config.model,
            prompt_len = prompt.len(),
            history_len = history.len(),
            "Starting streaming request to Gemini API"
        );

        let response = self.post(&url, &request).await?;

        let (tx, rx) = mpsc::channel(32);

        // Reader task; exits (dropping the connection) once the consumer
        // goes away.
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            let mut total_input_tokens = 0i32;
            let mut total_output_tokens = 0i32;
            let mut last_finish_reason = FinishReason::Complete;

            loop {
                let chunk_result = tokio::select! {
                    _ = tx.closed() => return,
                    next = stream.next() => match next {
                        Some(chunk_result) => chunk_result,
                        None => break,
                    },
                };

                let chunk = match chunk_result {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(network_error(e))).await;
                        return;
                    }
                };

                // '\r' never occurs inside a multi-byte UTF-8 sequence.
                buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

                for data in drain_sse_data(&mut buffer) {
                    let response = match serde_json::from_str::<GenerateContentResponse>(&data) {
                        Ok(response) => response,
                        Err(e) => {
                            tracing::debug!(error = %e, "Skipping unparseable Gemini SSE event");
                            continue;
                        }
                    };

                    if let Some(error) = response.error {
                        let _ = tx.send(Err(error.into_provider_error())).await;
                        return;
                    }

                    if let Some(usage) = &response.usage_metadata {
                        total_input_tokens = usage.prompt_token_count.unwrap_or(0);
                        total_output_tokens = usage.candidates_token_count.unwrap_or(0);
                    }

                    if let Some(candidate) = response.candidates.first() {
                        let text = candidate.text();
                        if !text.is_empty() && tx.send(Ok(StreamChunk::Text(text))).await.is_err() {
                            return;
                        }

                        if let Some(reason) = &candidate.finish_reason {
                            last_finish_reason = parse_finish_reason(reason);
                        }
                    }
                }
            }

            let _ = tx
                .send(Ok(StreamChunk::Complete {
                    input_tokens: total_input_tokens,
                    output_tokens: total_output_tokens,
                    finish_reason: last_finish_reason,
                }))
                .await;
        });

        let stream = ReceiverStream::new(rx);
        Ok(Box::pin(stream) as FragmentStream)
    }

    async fn classify(&self, instruction: &str, text: &str) -> Result<String, ProviderError> {
        let request = GenerateContentRequest {
            system_instruction: Self::system_instruction(instruction),
            contents: Self::build_contents(&[], text),
            generation_config: Some(GenerationConfig {
                temperature: Some(0.0),
                max_output_tokens: None,
            }),
        };

        let url = self.api_url("generateContent");

        tracing::debug!(
            model = %self.config.model,
            text_len = text.len(),
            "Sending classification request to Gemini API"
        );

        let response = self.post(&url, &request).await?;

        let api_response: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ApiError(format!("Failed to parse response: {}", e)))?;

        if let Some(error) = api_response.error {
            return Err(error.into_provider_error());
        }

        let candidate = api_response
            .candidates
            .first()
            .ok_or_else(|| ProviderError::ApiError("Response has no candidates".to_string()))?;

        if candidate.finish_reason.as_deref() == Some("SAFETY") {
            return Err(ProviderError::ContentFiltered);
        }

        Ok(candidate.text())
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::NotConfigured(
                "Gemini API key not configured".to_string(),
            ));
        }

        // Listing models verifies the API key.
        let url = format!("{}/models", self.config.base_url);

        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .send()
            .await
            .map_err(network_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::ApiError(format!(
                "Health check failed: {}",
                response.status()
            )))
        }
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

/// URL-free network error, so request URLs never reach logs.
fn network_error(e: reqwest::Error) -> ProviderError {
    ProviderError::NetworkError(e.without_url().to_string())
}

/// Remove every complete SSE event from `buffer` and return the payload of
/// its `data:` lines. Incomplete trailing bytes stay buffered, so a
/// character split across network chunks is decoded only once whole.
fn drain_sse_data(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut events = Vec::new();

    while let Some(event_end) = buffer.windows(2).position(|w| w == b"\n\n") {
        let raw: Vec<u8> = buffer.drain(..event_end + 2).collect();
        let event = String::from_utf8_lossy(&raw);

        let data: Vec<&str> = event
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|d| d.strip_prefix(' ').unwrap_or(d))
            .collect();

        if !data.is_empty() {
            events.push(data.join("\n"));
        }
    }

    events
}

fn parse_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Complete,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => {
            FinishReason::ContentFilter
        }
        _ => FinishReason::Complete,
    }
}

// ============================================================================
// Gemini API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<ContentPart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Content,
    #[serde(default)]
    finish_reason: Option<String>,
}

impl Candidate {
    fn text(&self) -> String {
        self.content
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect()
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<i32>,
    candidates_token_count: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

impl ApiErrorBody {
    fn into_provider_error(self) -> ProviderError {
        let status = self.status.unwrap_or_default();
        let detail = format!("{} {}", status, self.message).trim().to_string();
        if self.code == Some(429) || status == "RESOURCE_EXHAUSTED" {
            ProviderError::RateLimited(detail)
        } else {
            ProviderError::ApiError(detail)
        }
    }
}
