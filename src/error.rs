//! Error types shared across the workflow core.
//!
//! Each layer surfaces its own typed error (`LlmError` for the gateway,
//! `SandboxError` for execution sessions) and the orchestrator folds them
//! into `WorkflowError`, which carries the category/severity/recovery
//! metadata the reporting layer exposes to users.

use std::time::Duration;

use uuid::Uuid;

/// Errors surfaced by LLM providers and the gateway.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Request failed (network error, 5xx, connection reset).
    #[error("LLM request failed ({provider}): {reason}")]
    RequestFailed { provider: String, reason: String },

    /// Provider rate limited the request.
    #[error("Rate limited by {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    /// Authentication failed (missing or rejected API key).
    #[error("Authentication failed for {provider}")]
    AuthFailed { provider: String },

    /// Provider returned something we could not parse.
    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    /// Requested model is not served by this provider.
    #[error("Model {model} not available on {provider}")]
    ModelNotAvailable { provider: String, model: String },

    /// Provider name is not present in the gateway configuration.
    #[error("Provider {provider} is not configured")]
    ProviderNotConfigured { provider: String },

    /// Per-call timeout elapsed.
    #[error("Call to {provider} timed out after {elapsed:?}")]
    Timeout { provider: String, elapsed: Duration },

    /// The token stream was closed before the response completed.
    #[error("Stream from {provider} closed early")]
    StreamClosed { provider: String },

    /// No enabled provider could serve the request.
    #[error("No providers available")]
    NoProvidersAvailable,

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl LlmError {
    /// Name of the provider involved, when known.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::RequestFailed { provider, .. }
            | Self::RateLimited { provider, .. }
            | Self::AuthFailed { provider }
            | Self::InvalidResponse { provider, .. }
            | Self::ModelNotAvailable { provider, .. }
            | Self::ProviderNotConfigured { provider }
            | Self::Timeout { provider, .. }
            | Self::StreamClosed { provider } => Some(provider),
            Self::NoProvidersAvailable | Self::Http(_) => None,
        }
    }
}

/// Returns `true` if the error is transient and the call is worth retrying.
///
/// Non-retryable errors (`AuthFailed`, `ModelNotAvailable`,
/// `ProviderNotConfigured`) propagate immediately because another attempt
/// against the same provider cannot fix them.
pub fn is_transient(err: &LlmError) -> bool {
    matches!(
        err,
        LlmError::RequestFailed { .. }
            | LlmError::RateLimited { .. }
            | LlmError::InvalidResponse { .. }
            | LlmError::Timeout { .. }
            | LlmError::StreamClosed { .. }
            | LlmError::Http(_)
    )
}

/// Errors that cross the sandbox contract boundary.
///
/// Note: user code failing *inside* a session (nonzero exit, resource
/// violation) is reported through `ExecutionResult`, not through this type.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Session pool is at capacity.
    #[error("Session pool exhausted (capacity {capacity})")]
    PoolExhausted { capacity: usize },

    /// Execution requested against a session that does not exist.
    #[error("Session {session_id} not found")]
    SessionNotFound { session_id: Uuid },

    /// Execution requested against a session that was already closed.
    #[error("Session {session_id} is closed")]
    SessionClosed { session_id: Uuid },

    /// Language has no registered runner.
    #[error("Unsupported language: {language}")]
    UnsupportedLanguage { language: String },

    /// Failed to spawn or drive the runner process.
    #[error("Execution failed in session {session_id}: {reason}")]
    ExecutionFailed { session_id: Uuid, reason: String },

    /// I/O error while preparing the session workspace.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Sandbox configuration error: {reason}")]
    Config { reason: String },
}

/// Failure category, used for routing recovery behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Communication,
    Execution,
    Validation,
    Timeout,
    Cancelled,
}

/// How bad a failure is, from the workflow's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Recovery descriptor attached to every workflow failure.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Recovery {
    /// Whether the orchestrator may retry without user involvement.
    pub automatic: bool,
    /// Ordered recovery actions to attempt.
    pub actions: Vec<String>,
    /// Last-resort fallback when all actions fail.
    pub fallback: Option<String>,
}

/// Top-level workflow failure.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Gateway / network failure that exhausted its retry budget.
    #[error("Communication failure: {0}")]
    Communication(#[from] LlmError),

    /// Sandbox contract failure.
    #[error("Execution failure: {0}")]
    Execution(#[from] SandboxError),

    /// Generated code failed static checks after all regeneration attempts.
    #[error("Validation failed: {reason}")]
    Validation { reason: String, issues: Vec<String> },

    /// The workflow's wall-clock budget was exhausted.
    #[error("Workflow timed out after {budget:?}")]
    Timeout { budget: Duration },

    /// The workflow was cancelled cooperatively.
    #[error("Workflow cancelled")]
    Cancelled,

    /// Invariant violation inside the orchestrator itself.
    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl WorkflowError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Communication(_) => ErrorCategory::Communication,
            Self::Execution(_) | Self::Internal { .. } => ErrorCategory::Execution,
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Communication(LlmError::AuthFailed { .. }) => Severity::Critical,
            Self::Communication(LlmError::RateLimited { .. }) => Severity::Medium,
            Self::Communication(_) => Severity::High,
            Self::Execution(SandboxError::PoolExhausted { .. }) => Severity::Medium,
            Self::Execution(_) => Severity::High,
            Self::Validation { .. } => Severity::Low,
            Self::Timeout { .. } => Severity::High,
            Self::Cancelled => Severity::Low,
            Self::Internal { .. } => Severity::Critical,
        }
    }

    pub fn recovery(&self) -> Recovery {
        match self {
            Self::Communication(err) => Recovery {
                automatic: is_transient(err),
                actions: vec![
                    "retry with backoff".to_string(),
                    "switch provider".to_string(),
                ],
                fallback: Some("report failure with step trace".to_string()),
            },
            Self::Execution(_) => Recovery {
                automatic: true,
                actions: vec![
                    "recreate session".to_string(),
                    "retry execution".to_string(),
                ],
                fallback: Some("return generated code without execution".to_string()),
            },
            Self::Validation { .. } => Recovery {
                automatic: true,
                actions: vec!["regenerate code with validation feedback".to_string()],
                fallback: Some("surface validation issues to the user".to_string()),
            },
            Self::Timeout { .. } | Self::Cancelled | Self::Internal { .. } => Recovery {
                automatic: false,
                actions: vec![],
                fallback: Some("start a fresh workflow run".to_string()),
            },
        }
    }
}
