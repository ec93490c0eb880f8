//! The workflow state machine and its public boundary.

mod orchestrator;
pub mod state;

pub use orchestrator::{
    ClarificationHandler, NoAnswers, WorkflowInput, WorkflowMetadata, WorkflowOptions,
    WorkflowOrchestrator, WorkflowResult,
};
pub use state::{
    AgentType, ConversationState, Message, RunState, StepRecord, WorkflowPhase, WorkflowState,
    WorkflowStatus,
};
