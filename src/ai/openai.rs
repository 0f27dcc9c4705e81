//! OpenAI-compatible streaming LLM client.
//!
//! Works against any endpoint that speaks the `/chat/completions` SSE
//! protocol: OpenAI, OpenRouter, Ollama, vLLM, LM Studio, and most gateway
//! proxies. The client owns a pooled `reqwest::Client` and decodes the
//! event stream into plain content fragments.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::client::{LLMClient, Result, TokenStream};
use super::types::{CompletionRequest, Role};

/// Default timeout covering connection setup and each read on the stream.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key (may be empty for local providers like Ollama).
    pub api_key: String,
    /// Base URL up to and excluding `/chat/completions`.
    pub base_url: String,
    /// Request timeout.
    pub timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Build a config from `SWARMHOST_API_KEY` / `SWARMHOST_API_BASE`,
    /// defaulting the base URL to the OpenAI endpoint.
    pub fn from_env() -> Self {
        let api_key = std::env::var("SWARMHOST_API_KEY").unwrap_or_default();
        let base_url = std::env::var("SWARMHOST_API_BASE")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        Self::new(api_key, base_url)
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

/// Streaming client for OpenAI-compatible chat completion endpoints.
pub struct OpenAiClient {
    config: OpenAiConfig,
    http: Client,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self { config, http })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LLMClient for OpenAiClient {
    async fn stream_completion(&self, request: CompletionRequest) -> Result<TokenStream> {
        let body = ChatCompletionRequest {
            model: request.model.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| ApiMessage {
                    role: match m.role {
                        Role::System => "system".to_string(),
                        Role::User => "user".to_string(),
                        Role::Assistant => "assistant".to_string(),
                    },
                    content: m.content.clone(),
                })
                .collect(),
            temperature: request.temperature,
            stream: true,
        };

        let mut req = self.http.post(self.endpoint()).json(&body);
        if !self.config.api_key.is_empty() {
            req = req.bearer_auth(&self.config.api_key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| format!("LLM request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(format!("LLM endpoint returned {status}: {detail}"));
        }

        // Decode the SSE body into content fragments. The terminal "[DONE]"
        // event ends the stream; malformed chunks are skipped rather than
        // failing the whole response.
        let stream = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                let done = matches!(event, Ok(ev) if ev.data.trim() == "[DONE]");
                futures::future::ready(!done)
            })
            .filter_map(|event| {
                let item = match event {
                    Ok(ev) => match serde_json::from_str::<ApiStreamChunk>(&ev.data) {
                        Ok(chunk) => chunk
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.delta.content)
                            .filter(|s| !s.is_empty())
                            .map(Ok),
                        Err(_) => None,
                    },
                    Err(e) => Some(Err(format!("LLM stream error: {e}"))),
                };
                futures::future::ready(item)
            });

        Ok(Box::pin(stream) as TokenStream)
    }

    fn client_name(&self) -> &str {
        "openai-compatible"
    }
}
