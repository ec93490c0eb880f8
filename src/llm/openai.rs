//! OpenAI-compatible chat completions adapter.
//!
//! Works against any endpoint speaking the standard `/v1/chat/completions`
//! contract with bearer-token auth (OpenAI itself, most gateways and local
//! servers).

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
    ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, Role, TokenUsage,
};
use crate::llm::stream::TokenStream;

/// Default per-request timeout when the caller does not set one.
const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// OpenAI-compatible provider.
pub struct OpenAiProvider {
    client: Client,
    config: ProviderConfig,
}

impl OpenAiProvider {
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

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}",
            self.config.base_url,
            path.trim_start_matches('/')
        )
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

    fn build_body(&self, req: &CompletionRequest, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: req.messages.iter().map(wire_message).collect(),
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            stream: if stream { Some(true) } else { None },
        }
    }

    async fn send(&self, req: &CompletionRequest, stream: bool) -> Result<reqwest::Response, LlmError> {
        let url = self.api_url("chat/completions");
        let body = self.build_body(req, stream);

        tracing::debug!(provider = %self.config.name, %url, stream, "Sending chat completion request");

        let mut builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key()))
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
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let response = self.send(&request, false).await?;
        let text = response.text().await.unwrap_or_default();

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
                provider: self.config.name.clone(),
                reason: format!("JSON parse error: {}", e),
            })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: self.config.name.clone(),
                reason: "no choices in response".to_string(),
            })?;

        let usage = parsed.usage.unwrap_or_default();
        Ok(CompletionResponse {
            content: choice.message.and_then(|m| m.content).unwrap_or_default(),
            usage: TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
        })
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<TokenStream, LlmError> {
        let response = self.send(&request, true).await?;
        let provider = self.config.name.clone();

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<String, LlmError>>(32);

        // Forwarding task owns the connection. When the consumer closes the
        // TokenStream the receiver drops, sends fail, and the task returns,
        // dropping the response body with it.
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
                    if data == "[DONE]" {
                        return;
                    }
                    if let Some(delta) = parse_stream_delta(data) {
                        if !delta.is_empty() && tx.send(Ok(delta)).await.is_err() {
                            // Consumer closed the stream: release the connection.
                            return;
                        }
                    }
                }
            }
        });

        Ok(TokenStream::from_receiver(rx))
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let url = self.api_url("models");
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key()))
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: self.config.name.clone(),
                reason: format!("failed to fetch models: {}", e),
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(self.map_status(status, &text));
        }

        let parsed: ModelsResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
                provider: self.config.name.clone(),
                reason: format!("JSON parse error: {}", e),
            })?;

        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        // Generic defaults; provider-specific pricing belongs in config.
        (dec!(0.000003), dec!(0.000015))
    }
}

/// Extract the content delta from one SSE `data:` payload.
fn parse_stream_delta(data: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

fn wire_message(msg: &ChatMessage) -> WireMessage {
    WireMessage {
        role: match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
        .to_string(),
        content: msg.content.clone(),
    }
}

// Wire types for the chat completions contract.

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: Option<WireResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_conversion() {
        let msg = wire_message(&ChatMessage::user("Hello"));
        assert_eq!(msg.role, "user");
        assert_eq!(msg.content, "Hello");
    }

    #[test]
    fn missing_api_key_rejected() {
        let config = ProviderConfig::openai_compatible("test", "https://example.com", "m");
        assert!(matches!(
            OpenAiProvider::new(config),
            Err(LlmError::AuthFailed { .. })
        ));
    }

    #[test]
    fn stream_delta_parsing() {
        let data = r#"{"choices":[{"delta":{"content":"hel"}}]}"#;
        assert_eq!(parse_stream_delta(data).as_deref(), Some("hel"));

        // Final chunk typically has an empty delta.
        let data = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_stream_delta(data), None);

        assert_eq!(parse_stream_delta("not json"), None);
    }

    #[test]
    fn response_parsing() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "hi"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        }"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed.choices[0].message.as_ref().unwrap().content.as_deref(),
            Some("hi")
        );
        assert_eq!(parsed.usage.unwrap().total_tokens, 4);
    }
}
