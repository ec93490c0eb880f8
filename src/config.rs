//! Configuration for the workflow core.
//!
//! Everything is constructible in code (the UI layer owns persistence) and
//! loadable from the environment via [`Config::from_env`]. Environment
//! variables use the `FORGEFLOW_` prefix; provider API keys use the
//! conventional names (`OPENAI_API_KEY`, `ANTHROPIC_API_KEY`).

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

/// Which adapter a configured provider uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions endpoint.
    OpenAiCompatible,
    /// Anthropic messages API.
    Anthropic,
}

/// One backing model provider reachable through the gateway.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Name used for selection, stats, and error context.
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub api_key: Option<SecretString>,
    /// Default model for this provider.
    pub model: String,
    /// Relative weight for the weighted selection strategy.
    pub weight: u32,
    pub enabled: bool,
}

impl ProviderConfig {
    pub fn openai_compatible(name: &str, base_url: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ProviderKind::OpenAiCompatible,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            model: model.to_string(),
            weight: 1,
            enabled: true,
        }
    }

    pub fn anthropic(name: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ProviderKind::Anthropic,
            base_url: "https://api.anthropic.com".to_string(),
            api_key: None,
            model: model.to_string(),
            weight: 1,
            enabled: true,
        }
    }

    pub fn with_api_key(mut self, key: SecretString) -> Self {
        self.api_key = Some(key);
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// Load-balancing strategy selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round_robin" | "roundrobin" | "rr" => Ok(Self::RoundRobin),
            "least_connections" | "leastconnections" | "lc" => Ok(Self::LeastConnections),
            "weighted" | "w" => Ok(Self::Weighted),
            _ => Err(format!(
                "invalid strategy '{}', expected 'round_robin', 'least_connections', or 'weighted'",
                s
            )),
        }
    }
}

/// Backoff shape for gateway retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Delay grows linearly: base, 2*base, 3*base, ...
    Linear { base: Duration },
    /// Delay doubles: base, 2*base, 4*base, ...
    Exponential { base: Duration },
}

impl Backoff {
    /// Delay before retry attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Linear { base } => base.saturating_mul(attempt),
            Self::Exponential { base } => {
                base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(250),
        }
    }
}

/// Retry policy applied by the gateway to transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Number of retries after the first attempt.
    pub retries: u32,
    pub backoff: Backoff,
    /// Predicate deciding whether an error is worth retrying. Defaults to
    /// [`crate::error::is_transient`].
    pub condition: fn(&crate::error::LlmError) -> bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff: Backoff::default(),
            condition: crate::error::is_transient,
        }
    }
}

/// Gateway configuration: providers, selection strategy, retry policy.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub providers: Vec<ProviderConfig>,
    pub strategy: StrategyKind,
    pub retry: RetryConfig,
    /// Cap on concurrent in-flight gateway calls across all workflows.
    pub max_in_flight: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            strategy: StrategyKind::RoundRobin,
            retry: RetryConfig::default(),
            max_in_flight: 32,
        }
    }
}

/// Resource limits applied to one sandbox session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Wall-clock budget per execution.
    pub timeout: Duration,
    /// Virtual memory cap in megabytes.
    pub memory_limit_mb: u64,
    pub allow_network: bool,
    pub allow_filesystem: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            memory_limit_mb: 512,
            allow_network: false,
            allow_filesystem: false,
        }
    }
}

/// Configuration for the sandbox session pool.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum simultaneous sessions.
    pub max_sessions: usize,
    /// Sessions older than this are eligible for forced closure.
    pub session_ttl: Duration,
    /// Sessions idle longer than this are eligible for forced closure.
    pub idle_timeout: Duration,
    /// Defaults for sessions created without explicit options.
    pub defaults: SessionOptions,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_sessions: 8,
            session_ttl: Duration::from_secs(600),
            idle_timeout: Duration::from_secs(120),
            defaults: SessionOptions::default(),
        }
    }
}

/// Eviction policy for a named cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    #[default]
    Lru,
    Fifo,
}

/// TTL + size bounds for one named cache.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub max_entries: usize,
    pub eviction: EvictionPolicy,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 128,
            eviction: EvictionPolicy::Lru,
        }
    }
}

/// Per-name cache configuration.
#[derive(Debug, Clone, Default)]
pub struct CacheSettings {
    pub conversation: CachePolicy,
    pub code: CachePolicy,
    pub execution: CachePolicy,
}

/// Quality level requested for a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Draft,
    #[default]
    Production,
    Optimized,
}

impl Quality {
    /// How many regenerate-and-revalidate cycles codegen may spend.
    pub fn regen_attempts(&self) -> u32 {
        match self {
            Self::Draft => 0,
            Self::Production => 1,
            Self::Optimized => 2,
        }
    }

    /// Whether derived artifacts (tests, documentation) are produced.
    pub fn derive_artifacts(&self) -> bool {
        !matches!(self, Self::Draft)
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "production" => Ok(Self::Production),
            "optimized" => Ok(Self::Optimized),
            _ => Err(format!(
                "invalid quality '{}', expected 'draft', 'production', or 'optimized'",
                s
            )),
        }
    }
}

/// Policy when the clarification budget runs out while the agent still
/// reports missing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
    /// Force progress to refinement with best-available information.
    #[default]
    ForceRefine,
    /// Fail the workflow instead.
    Fail,
}

/// Per-run options, with orchestrator-level defaults.
#[derive(Debug, Clone)]
pub struct WorkflowDefaults {
    /// Upper bound on clarification round-trips.
    pub max_clarifications: u32,
    /// Wall-clock budget for a whole run.
    pub timeout: Duration,
    /// Gateway retry budget used for this run's calls.
    pub retries: u32,
    pub quality: Quality,
    pub on_clarification_exhausted: ExhaustionPolicy,
}

impl Default for WorkflowDefaults {
    fn default() -> Self {
        Self {
            max_clarifications: 3,
            timeout: Duration::from_secs(300),
            retries: 2,
            quality: Quality::default(),
            on_clarification_exhausted: ExhaustionPolicy::default(),
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub sandbox: SandboxConfig,
    pub cache: CacheSettings,
    pub workflow: WorkflowDefaults,
}

impl Config {
    /// Load configuration from the environment (and `.env` if present).
    ///
    /// Providers are registered when their API key variable is set.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let mut providers = Vec::new();

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            let base_url = std::env::var("FORGEFLOW_OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string());
            let model = std::env::var("FORGEFLOW_OPENAI_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string());
            providers.push(
                ProviderConfig::openai_compatible("openai", &base_url, &model)
                    .with_api_key(key.into()),
            );
        }

        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            let model = std::env::var("FORGEFLOW_ANTHROPIC_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());
            providers.push(ProviderConfig::anthropic("anthropic", &model).with_api_key(key.into()));
        }

        let strategy = std::env::var("FORGEFLOW_STRATEGY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        let retries = env_u32("FORGEFLOW_RETRIES").unwrap_or(2);

        let mut workflow = WorkflowDefaults::default();
        if let Some(n) = env_u32("FORGEFLOW_MAX_CLARIFICATIONS") {
            workflow.max_clarifications = n;
        }
        if let Some(secs) = env_u32("FORGEFLOW_WORKFLOW_TIMEOUT_SECS") {
            workflow.timeout = Duration::from_secs(secs as u64);
        }
        workflow.retries = retries;
        if let Ok(q) = std::env::var("FORGEFLOW_QUALITY") {
            if let Ok(q) = q.parse() {
                workflow.quality = q;
            }
        }

        let mut sandbox = SandboxConfig::default();
        if let Some(n) = env_u32("FORGEFLOW_MAX_SESSIONS") {
            sandbox.max_sessions = n as usize;
        }
        if let Some(secs) = env_u32("FORGEFLOW_SESSION_TIMEOUT_SECS") {
            sandbox.defaults.timeout = Duration::from_secs(secs as u64);
        }

        Self {
            gateway: GatewayConfig {
                providers,
                strategy,
                retry: RetryConfig {
                    retries,
                    ..RetryConfig::default()
                },
                ..GatewayConfig::default()
            },
            sandbox,
            cache: CacheSettings::default(),
            workflow,
        }
    }
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parsing() {
        assert_eq!(
            "round_robin".parse::<StrategyKind>().unwrap(),
            StrategyKind::RoundRobin
        );
        assert_eq!(
            "least_connections".parse::<StrategyKind>().unwrap(),
            StrategyKind::LeastConnections
        );
        assert_eq!(
            "weighted".parse::<StrategyKind>().unwrap(),
            StrategyKind::Weighted
        );
        assert!("invalid".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn backoff_delays() {
        let linear = Backoff::Linear {
            base: Duration::from_millis(100),
        };
        assert_eq!(linear.delay(1), Duration::from_millis(100));
        assert_eq!(linear.delay(3), Duration::from_millis(300));

        let exp = Backoff::Exponential {
            base: Duration::from_millis(100),
        };
        assert_eq!(exp.delay(1), Duration::from_millis(100));
        assert_eq!(exp.delay(2), Duration::from_millis(200));
        assert_eq!(exp.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn quality_budgets() {
        assert_eq!(Quality::Draft.regen_attempts(), 0);
        assert_eq!(Quality::Production.regen_attempts(), 1);
        assert_eq!(Quality::Optimized.regen_attempts(), 2);
        assert!(!Quality::Draft.derive_artifacts());
        assert!(Quality::Optimized.derive_artifacts());
    }

    #[test]
    fn workflow_defaults() {
        let d = WorkflowDefaults::default();
        assert_eq!(d.max_clarifications, 3);
        assert_eq!(d.retries, 2);
        assert_eq!(d.on_clarification_exhausted, ExhaustionPolicy::ForceRefine);
    }
}
