//! Multi-provider LLM gateway.
//!
//! Unifies heterogeneous providers behind one chat contract and owns the
//! cross-cutting concerns: load-balanced provider selection, retry with
//! backoff on transient failures, bounded in-flight concurrency, and running
//! usage counters per provider.
//!
//! Selection happens once per call and never changes mid-stream. Retries
//! stay on the selected provider; exhausting the budget surfaces the typed
//! [`LlmError`] from the last attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::Semaphore;

use crate::config::{GatewayConfig, ProviderKind, RetryConfig, StrategyKind};
use crate::error::LlmError;
use crate::llm::anthropic::AnthropicProvider;
use crate::llm::openai::OpenAiProvider;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, TokenUsage,
};
use crate::llm::stream::TokenStream;

/// Options recognized on a gateway call.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Per-call timeout, enforced by the adapter.
    pub timeout: Option<Duration>,
    /// Override the gateway's configured retry count for this call.
    pub retries: Option<u32>,
}

/// A chat request routed through the gateway.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Pin a provider by name, or let the selection strategy decide.
    pub provider: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub options: ChatOptions,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            provider: None,
            messages,
            options: ChatOptions::default(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }
}

/// A completed gateway response, annotated with the serving provider.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub provider: String,
    pub model: String,
    pub content: String,
    pub usage: TokenUsage,
}

/// Snapshot of one provider's running counters.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageStats {
    pub requests: u64,
    pub failures: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub estimated_cost: Decimal,
    pub avg_latency: Duration,
}

/// What a selection strategy sees about each eligible provider.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    /// Index into the gateway's slot table.
    pub index: usize,
    pub weight: u32,
    pub in_flight: usize,
}

/// Pluggable provider selection. One implementation per configured strategy.
pub trait SelectionStrategy: Send + Sync {
    /// Pick one of `candidates` (guaranteed non-empty); returns the chosen
    /// `Candidate::index`.
    fn select(&self, candidates: &[Candidate]) -> usize;
}

/// Cycles through the provider list.
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for RoundRobin {
    fn select(&self, candidates: &[Candidate]) -> usize {
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        candidates[n % candidates.len()].index
    }
}

/// Routes to the provider with the fewest in-flight requests.
pub struct LeastConnections;

impl SelectionStrategy for LeastConnections {
    fn select(&self, candidates: &[Candidate]) -> usize {
        candidates
            .iter()
            .min_by_key(|c| c.in_flight)
            .map(|c| c.index)
            .unwrap_or(0)
    }
}

/// Picks with probability proportional to configured weight.
pub struct Weighted;

impl SelectionStrategy for Weighted {
    fn select(&self, candidates: &[Candidate]) -> usize {
        let total: u64 = candidates.iter().map(|c| c.weight as u64).sum();
        if total == 0 {
            return candidates[0].index;
        }
        let mut pick = rand::thread_rng().gen_range(0..total);
        for c in candidates {
            let w = c.weight as u64;
            if pick < w {
                return c.index;
            }
            pick -= w;
        }
        candidates[candidates.len() - 1].index
    }
}

fn strategy_for(kind: StrategyKind) -> Box<dyn SelectionStrategy> {
    match kind {
        StrategyKind::RoundRobin => Box::new(RoundRobin::new()),
        StrategyKind::LeastConnections => Box::new(LeastConnections),
        StrategyKind::Weighted => Box::new(Weighted),
    }
}

/// Per-provider counters. All counter updates are single atomic steps so
/// concurrent calls never lose increments.
struct SlotStats {
    requests: AtomicU64,
    failures: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_latency_ms: AtomicU64,
    estimated_cost: Mutex<Decimal>,
}

impl SlotStats {
    fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            estimated_cost: Mutex::new(Decimal::ZERO),
        }
    }

    fn record(&self, latency: Duration, usage: Option<TokenUsage>, cost: Decimal, failed: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        if let Some(usage) = usage {
            self.prompt_tokens
                .fetch_add(usage.prompt_tokens as u64, Ordering::Relaxed);
            self.completion_tokens
                .fetch_add(usage.completion_tokens as u64, Ordering::Relaxed);
        }
        if !cost.is_zero() {
            let mut total = self.estimated_cost.lock().expect("cost lock poisoned");
            *total += cost;
        }
    }

    fn snapshot(&self) -> UsageStats {
        let requests = self.requests.load(Ordering::Relaxed);
        let total_ms = self.total_latency_ms.load(Ordering::Relaxed);
        UsageStats {
            requests,
            failures: self.failures.load(Ordering::Relaxed),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            estimated_cost: *self.estimated_cost.lock().expect("cost lock poisoned"),
            avg_latency: if requests == 0 {
                Duration::ZERO
            } else {
                Duration::from_millis(total_ms / requests)
            },
        }
    }
}

struct ProviderSlot {
    provider: Arc<dyn LlmProvider>,
    weight: u32,
    enabled: bool,
    in_flight: Arc<AtomicUsize>,
    stats: SlotStats,
}

/// Decrements the slot's in-flight counter on drop. For streaming calls the
/// guard rides inside the [`TokenStream`] so accounting holds until the
/// consumer finishes or abandons the stream.
struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl InFlightGuard {
    fn acquire(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The gateway.
pub struct LlmGateway {
    slots: Vec<ProviderSlot>,
    by_name: HashMap<String, usize>,
    strategy: Box<dyn SelectionStrategy>,
    retry: RetryConfig,
    limiter: Arc<Semaphore>,
}

impl LlmGateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    /// Build a gateway with real HTTP adapters from configuration.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, LlmError> {
        let mut builder = Self::builder()
            .strategy_kind(config.strategy)
            .retry(config.retry.clone())
            .max_in_flight(config.max_in_flight);

        for pc in &config.providers {
            if !pc.enabled {
                continue;
            }
            let provider: Arc<dyn LlmProvider> = match pc.kind {
                ProviderKind::OpenAiCompatible => Arc::new(OpenAiProvider::new(pc.clone())?),
                ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(pc.clone())?),
            };
            builder = builder.register(provider, pc.weight);
        }

        builder.build()
    }

    /// Select a slot for one call: either the pinned provider or whatever
    /// the configured strategy picks among enabled providers.
    fn select_slot(&self, pinned: Option<&str>) -> Result<usize, LlmError> {
        if let Some(name) = pinned {
            let idx = self
                .by_name
                .get(name)
                .copied()
                .ok_or_else(|| LlmError::ProviderNotConfigured {
                    provider: name.to_string(),
                })?;
            if !self.slots[idx].enabled {
                return Err(LlmError::ProviderNotConfigured {
                    provider: name.to_string(),
                });
            }
            return Ok(idx);
        }

        let candidates: Vec<Candidate> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.enabled)
            .map(|(index, s)| Candidate {
                index,
                weight: s.weight,
                in_flight: s.in_flight.load(Ordering::Relaxed),
            })
            .collect();

        if candidates.is_empty() {
            return Err(LlmError::NoProvidersAvailable);
        }
        Ok(self.strategy.select(&candidates))
    }

    fn completion_request(&self, req: &ChatRequest) -> CompletionRequest {
        let mut out = CompletionRequest::new(req.messages.clone());
        out.temperature = req.options.temperature;
        out.max_tokens = req.options.max_tokens;
        out.timeout = req.options.timeout;
        out
    }

    fn estimate_cost(provider: &dyn LlmProvider, usage: &TokenUsage) -> Decimal {
        let (input, output) = provider.cost_per_token();
        input * Decimal::from(usage.prompt_tokens) + output * Decimal::from(usage.completion_tokens)
    }

    /// Send a chat request and wait for the full response.
    ///
    /// Transient failures are retried with the configured backoff up to the
    /// retry budget (`retries` retries = `retries + 1` total attempts).
    pub async fn chat(&self, request: ChatRequest) -> Result<GatewayResponse, LlmError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| LlmError::NoProvidersAvailable)?;

        let idx = self.select_slot(request.provider.as_deref())?;
        let slot = &self.slots[idx];
        let retries = request.options.retries.unwrap_or(self.retry.retries);
        let completion = self.completion_request(&request);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = {
                let _guard = InFlightGuard::acquire(Arc::clone(&slot.in_flight));
                slot.provider.complete(completion.clone()).await
            };
            let latency = started.elapsed();

            match result {
                Ok(response) => {
                    let cost = Self::estimate_cost(slot.provider.as_ref(), &response.usage);
                    slot.stats.record(latency, Some(response.usage), cost, false);
                    return Ok(GatewayResponse {
                        provider: slot.provider.name().to_string(),
                        model: slot.provider.model().to_string(),
                        content: response.content,
                        usage: response.usage,
                    });
                }
                Err(err) => {
                    slot.stats.record(latency, None, Decimal::ZERO, true);
                    let retryable = (self.retry.condition)(&err);
                    if !retryable || attempt > retries {
                        if retryable {
                            tracing::warn!(
                                provider = %slot.provider.name(),
                                attempts = attempt,
                                error = %err,
                                "Retry budget exhausted"
                            );
                        }
                        return Err(err);
                    }
                    let delay = self.retry.backoff.delay(attempt);
                    tracing::debug!(
                        provider = %slot.provider.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Send a chat request and stream the response tokens.
    ///
    /// Retries apply only to establishing the stream; once tokens flow the
    /// sequence is single-pass and non-restartable.
    pub async fn chat_stream(&self, request: ChatRequest) -> Result<TokenStream, LlmError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| LlmError::NoProvidersAvailable)?;

        let idx = self.select_slot(request.provider.as_deref())?;
        let slot = &self.slots[idx];
        let retries = request.options.retries.unwrap_or(self.retry.retries);
        let completion = self.completion_request(&request);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            let guard = InFlightGuard::acquire(Arc::clone(&slot.in_flight));
            match slot.provider.complete_stream(completion.clone()).await {
                Ok(mut stream) => {
                    slot.stats
                        .record(started.elapsed(), None, Decimal::ZERO, false);
                    stream.attach_guard(Box::new(guard));
                    return Ok(stream);
                }
                Err(err) => {
                    drop(guard);
                    slot.stats
                        .record(started.elapsed(), None, Decimal::ZERO, true);
                    let retryable = (self.retry.condition)(&err);
                    if !retryable || attempt > retries {
                        return Err(err);
                    }
                    tokio::time::sleep(self.retry.backoff.delay(attempt)).await;
                }
            }
        }
    }

    /// Models a configured provider can serve.
    pub async fn available_models(&self, provider: &str) -> Result<Vec<String>, LlmError> {
        let idx = self
            .by_name
            .get(provider)
            .copied()
            .ok_or_else(|| LlmError::ProviderNotConfigured {
                provider: provider.to_string(),
            })?;
        self.slots[idx].provider.list_models().await
    }

    /// Synchronous capability check based on configuration, not a live probe.
    pub fn is_provider_available(&self, provider: &str) -> bool {
        self.by_name
            .get(provider)
            .map(|&idx| self.slots[idx].enabled)
            .unwrap_or(false)
    }

    /// Running counters for one provider.
    pub fn usage_stats(&self, provider: &str) -> Option<UsageStats> {
        self.by_name
            .get(provider)
            .map(|&idx| self.slots[idx].stats.snapshot())
    }

    /// Names of all configured providers.
    pub fn provider_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .map(|s| s.provider.name().to_string())
            .collect()
    }
}

/// Builder for assembling a gateway, primarily so tests and embedders can
/// register their own [`LlmProvider`] implementations.
pub struct GatewayBuilder {
    providers: Vec<(Arc<dyn LlmProvider>, u32)>,
    strategy: Box<dyn SelectionStrategy>,
    retry: RetryConfig,
    max_in_flight: usize,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            strategy: Box::new(RoundRobin::new()),
            retry: RetryConfig::default(),
            max_in_flight: 32,
        }
    }
}

impl GatewayBuilder {
    pub fn register(mut self, provider: Arc<dyn LlmProvider>, weight: u32) -> Self {
        self.providers.push((provider, weight));
        self
    }

    pub fn strategy(mut self, strategy: Box<dyn SelectionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy_kind(mut self, kind: StrategyKind) -> Self {
        self.strategy = strategy_for(kind);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    pub fn build(self) -> Result<LlmGateway, LlmError> {
        if self.providers.is_empty() {
            return Err(LlmError::NoProvidersAvailable);
        }

        let mut slots = Vec::with_capacity(self.providers.len());
        let mut by_name = HashMap::new();
        for (provider, weight) in self.providers {
            by_name.insert(provider.name().to_string(), slots.len());
            slots.push(ProviderSlot {
                provider,
                weight,
                enabled: true,
                in_flight: Arc::new(AtomicUsize::new(0)),
                stats: SlotStats::new(),
            });
        }

        Ok(LlmGateway {
            slots,
            by_name,
            strategy: self.strategy,
            retry: self.retry,
            limiter: Arc::new(Semaphore::new(self.max_in_flight)),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Mock providers shared by gateway, agent, and orchestrator tests.

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::llm::provider::{CompletionRequest, CompletionResponse};

    /// A scripted provider: returns canned responses in order, repeating the
    /// last one. `fail_first` calls fail with a transient error before the
    /// script starts.
    pub struct ScriptedProvider {
        name: String,
        responses: Mutex<Vec<String>>,
        pub calls: AtomicU32,
        fail_first: u32,
    }

    impl ScriptedProvider {
        pub fn new(name: &str, responses: Vec<&str>) -> Self {
            Self {
                name: name.to_string(),
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
                calls: AtomicU32::new(0),
                fail_first: 0,
            }
        }

        pub fn failing_first(name: &str, fail_first: u32, responses: Vec<&str>) -> Self {
            Self {
                fail_first,
                ..Self::new(name, responses)
            }
        }

        pub fn always_failing(name: &str) -> Self {
            Self::failing_first(name, u32::MAX, vec![])
        }

        pub fn call_count(&self) -> u32 {
            self.calls.load(Ordering::Relaxed)
        }

        fn next_content(&self, call: u32) -> String {
            let responses = self.responses.lock().unwrap();
            let idx = (call as usize).min(responses.len().saturating_sub(1));
            responses.get(idx).cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn model(&self) -> &str {
            "mock-model"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed);
            if call < self.fail_first {
                return Err(LlmError::RequestFailed {
                    provider: self.name.clone(),
                    reason: format!("scripted failure {}", call),
                });
            }
            let after_failures = call - self.fail_first;
            Ok(CompletionResponse {
                content: self.next_content(after_failures),
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
            })
        }

        async fn complete_stream(
            &self,
            request: CompletionRequest,
        ) -> Result<TokenStream, LlmError> {
            let response = self.complete(request).await?;
            let chunks: Vec<Result<String, LlmError>> = response
                .content
                .chars()
                .map(|c| Ok(c.to_string()))
                .collect();
            Ok(TokenStream::new(futures::stream::iter(chunks)))
        }

        async fn list_models(&self) -> Result<Vec<String>, LlmError> {
            Ok(vec!["mock-model".to_string()])
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::new(1, 6), Decimal::new(2, 6))
        }
    }

    /// Gateway with a single scripted provider, zero backoff.
    pub fn scripted_gateway(responses: Vec<&str>) -> (LlmGateway, Arc<ScriptedProvider>) {
        let provider = Arc::new(ScriptedProvider::new("mock", responses));
        let gateway = LlmGateway::builder()
            .register(provider.clone(), 1)
            .retry(RetryConfig {
                retries: 0,
                backoff: crate::config::Backoff::Linear {
                    base: Duration::ZERO,
                },
                condition: crate::error::is_transient,
            })
            .build()
            .unwrap();
        (gateway, provider)
    }
}
