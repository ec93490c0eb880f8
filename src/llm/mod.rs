//! The LLM gateway and provider adapters.
//!
//! Providers implement the unified [`LlmProvider`] chat contract; the
//! [`LlmGateway`] adds provider selection, retry/backoff, bounded
//! concurrency, and usage accounting on top.

mod anthropic;
mod gateway;
mod openai;
mod provider;
mod stream;

pub use anthropic::AnthropicProvider;
pub use gateway::{
    Candidate, ChatOptions, ChatRequest, GatewayBuilder, GatewayResponse, LeastConnections,
    LlmGateway, RoundRobin, SelectionStrategy, UsageStats, Weighted,
};
pub use openai::OpenAiProvider;
pub use provider::{
    ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, Role, TokenUsage,
};
pub use stream::TokenStream;

#[cfg(test)]
pub(crate) use gateway::testing;
