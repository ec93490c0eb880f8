//! Anthropic messages API adapter.
//!
//! The messages API differs from the chat-completions shape in three ways
//! that matter here: auth uses the `x-api-key` header, the system prompt is
//! a top-level field rather than a message, and streaming events are typed
//! (`content_block_delta` carries the text).

use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use async_trait::async_trait;
use futures::StreamExt;

use crate::config::ProviderConfig;
use crate::error::LlmError;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, LlmProvider, Role, TokenUsage,
};
use crate::llm::stream::TokenStream;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// Anthropic provider.
pub struct AnthropicProvider {
    client: Client,
    config: ProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, LlmError> {
        if config.api_key.is_none() {
            return Err(LlmError::AuthFailed {
                provider: config.name.clone(),
            });
        }

        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Ok(Self { client, config })
    }

    fn api_key(&self) -> String {
        self.config
            .api_key
            .as_ref()
            .map(|k| k.expose_secret().to_string())
            .unwrap_or_default()
    }

    fn map_status(&self, status: reqwest::StatusCode, body: &str) -> LlmError {
        match status.as_u16() {
            401 | 403 => LlmError::AuthFailed {
                provider: self.config.name.clone(),
            },
            404 => LlmError::ModelNotAvailable {
                provider: self.config.name.clone(),
                model: self.config.model.clone(),
            },
            429 => LlmError::RateLimited {
                provider: self.config.name.clone(),
                retry_after: None,
            },
            _ => LlmError::RequestFailed {
                provider: self.config.name.clone(),
                reason: format!("HTTP {}: {}", status, body),
            },
        }
    }

    fn build_body(&self, req: &CompletionRequest, stream: bool) -> MessagesRequest {
        // System messages become the top-level `system` field.
        let system: Vec<&str> = req
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        let messages = req
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| WireMessage {
                role: match m.role {
                    Role::User => "user",
                    _ => "assistant",
                }
                .to_string(),
                content: m.content.clone(),
            })
            .collect();

        MessagesRequest {
            model: self.config.model.clone(),
            max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: if system.is_empty() {
                None
            } else {
                Some(system.join("\n\n"))
            },
            temperature: req.temperature,
            stream: if stream { Some(true) } else { None },
        }
    }

    async fn send(
        &self,
        req: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/v1/messages", self.config.base_url);
        let body = self.build_body(req, stream);

        tracing::debug!(provider = %self.config.name, %url, stream, "Sending messages request");

        let mut builder = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(timeout) = req.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout {
                    provider: self.config.name.clone(),
                    elapsed: req.timeout.unwrap_or(DEFAULT_TIMEOUT),
                }
            } else {
                LlmError::RequestFailed {
                    provider: self.config.name.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.map_status(status, &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let response = self.send(&request, false).await?;
        let text = response.text().await.unwrap_or_default();

        let parsed: MessagesResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
                provider: self.config.name.clone(),
                reason: format!("JSON parse error: {}", e),
            })?;

        let content = parsed
            .content
            .into_iter()
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(CompletionResponse {
            content,
            usage: TokenUsage {
                prompt_tokens: parsed.usage.input_tokens,
                completion_tokens: parsed.usage.output_tokens,
                total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
            },
        })
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<TokenStream, LlmError> {
        let response = self.send(&request, true).await?;
        let provider = self.config.name.clone();

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<String, LlmError>>(32);

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buf = String::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(Err(LlmError::RequestFailed {
                                provider: provider.clone(),
                                reason: e.to_string(),
                            }))
                            .await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf.drain(..=pos);

                    let data = match line.strip_prefix("data:") {
                        Some(d) => d.trim(),
                        None => continue,
                    };
                    match parse_stream_event(data) {
                        StreamEvent::Delta(text) => {
                            if !text.is_empty() && tx.send(Ok(text)).await.is_err() {
                                return;
                            }
                        }
                        StreamEvent::Stop => return,
                        StreamEvent::Other => {}
                    }
                }
            }
        });

        Ok(TokenStream::from_receiver(rx))
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        // Anthropic has no stable models listing for API keys with minimal
        // scopes; report the configured model.
        Ok(vec![self.config.model.clone()])
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (dec!(0.000003), dec!(0.000015))
    }
}

enum StreamEvent {
    Delta(String),
    Stop,
    Other,
}

fn parse_stream_event(data: &str) -> StreamEvent {
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return StreamEvent::Other,
    };
    match value.get("type").and_then(|t| t.as_str()) {
        Some("content_block_delta") => {
            let text = value
                .get("delta")
                .and_then(|d| d.get("text"))
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string();
            StreamEvent::Delta(text)
        }
        Some("message_stop") => StreamEvent::Stop,
        _ => StreamEvent::Other,
    }
}

// Wire types for the messages API.

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}
