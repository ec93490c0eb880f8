//! forgeflow: a dual-agent AI coding workflow core.
//!
//! A conversational agent refines a user request into a structured handoff,
//! a code generation agent turns it into validated code, and an execution
//! agent runs it in a pooled sandbox. The [`workflow::WorkflowOrchestrator`]
//! sequences the three per conversation turn with bounded clarification,
//! cooperative cancellation, per-workflow timeouts, and a per-step trace.
//! All model traffic goes through the [`llm::LlmGateway`], which owns
//! provider selection, retry/backoff, and usage accounting; repeated work is
//! memoized by the [`cache::CacheLayer`].
//!
//! The embedding layer (UI, persistence) is out of scope; it drives the
//! orchestrator boundary and implements [`workflow::ClarificationHandler`]
//! to route questions back to the user.

pub mod agents;
pub mod cache;
pub mod config;
pub mod error;
pub mod llm;
pub mod sandbox;
pub mod workflow;

pub use config::Config;
pub use error::{LlmError, SandboxError, WorkflowError};
pub use llm::LlmGateway;
pub use sandbox::SandboxManager;
pub use workflow::{WorkflowInput, WorkflowOrchestrator, WorkflowResult};

/// Install a tracing subscriber driven by `RUST_LOG` (default `info`).
///
/// For binaries and tests embedding the library; calling it twice is a
/// no-op because a global subscriber can only be set once.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
