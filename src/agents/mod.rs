//! The three agents and their handoff contract.
//!
//! Agents are stateless mediators over the shared gateway and sandbox; all
//! conversation and workflow state is owned by the orchestrator and passed
//! in by snapshot.

mod codegen;
mod conversational;
mod execution;
mod handoff;
pub(crate) mod parse;

pub use codegen::{CodeGenAgent, CodeMetadata, GeneratedCode, GeneratedFile, Validation};
pub use conversational::{ConversationalAgent, ProcessedMessage};
pub use execution::{ExecutionAgent, TestCaseResult, TestReport};
pub use handoff::{AgentMessage, Clarification, Complexity, Priority, RefinedRequirements};
