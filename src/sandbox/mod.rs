//! Process-backed code execution sandbox.
//!
//! A bounded pool of sessions, each with its own temporary workspace and
//! resource limits (wall-clock timeout, virtual-memory cap, network denied by
//! default). User-code failures surface inside [`ExecutionResult`]; only
//! contract violations (pool exhausted, unknown session, unsupported
//! language) surface as [`SandboxError`](crate::error::SandboxError).

mod manager;
mod session;

pub use manager::SandboxManager;
pub use session::{ExecutionResult, Language, SessionState, SessionStatus};
