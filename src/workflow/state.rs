//! Workflow state: the conversation log, the state-machine snapshot, and the
//! status surface consumers poll.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::{AgentMessage, GeneratedCode};
use crate::llm::Role;
use crate::sandbox::ExecutionResult;

/// Which agent authored an assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentType {
    Conversational,
    CodeGeneration,
}

/// One message in a conversation's append-only log. Immutable once created;
/// individual messages are never deleted, only bulk-cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub agent: Option<AgentType>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>, agent: Option<AgentType>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            agent,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, None)
    }

    pub fn assistant(content: impl Into<String>, agent: AgentType) -> Self {
        Self::new(Role::Assistant, content, Some(agent))
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content, None)
    }
}

/// Conversation-side state for one active conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub conversation_id: Uuid,
    pub messages: Vec<Message>,
    pub user_intent: String,
    pub needs_clarification: bool,
    /// Non-empty only while `needs_clarification` is true; cleared once
    /// answered.
    pub clarification_questions: Vec<String>,
    /// Set if and only if clarification is resolved.
    pub refined_prompt: Option<AgentMessage>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self {
            conversation_id: Uuid::new_v4(),
            messages: Vec::new(),
            user_intent: String::new(),
            needs_clarification: false,
            clarification_questions: Vec::new(),
            refined_prompt: None,
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Bulk-clear the log. The only way messages leave the conversation.
    pub fn clear_messages(&mut self) {
        self.messages.clear();
    }

    /// The log rendered as plain transcript lines for prompt context.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

/// The orchestrator's full state-machine snapshot for one run.
#[derive(Debug, Clone)]
pub struct WorkflowState {
    pub conversation: ConversationState,
    pub generated_code: Option<GeneratedCode>,
    pub execution_result: Option<ExecutionResult>,
    pub should_continue: bool,
}

impl WorkflowState {
    pub fn new(conversation: ConversationState) -> Self {
        Self {
            conversation,
            generated_code: None,
            execution_result: None,
            should_continue: true,
        }
    }
}

/// Phases of the workflow state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowPhase {
    Start,
    Clarifying,
    Refining,
    Generating,
    Executing,
    Reporting,
    Complete,
    Failed,
    Cancelled,
}

impl WorkflowPhase {
    /// Coarse completion percentage for status reporting.
    pub fn progress(&self) -> u8 {
        match self {
            Self::Start => 0,
            Self::Clarifying => 15,
            Self::Refining => 30,
            Self::Generating => 50,
            Self::Executing => 75,
            Self::Reporting => 90,
            Self::Complete | Self::Failed | Self::Cancelled => 100,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Clarifying => "clarifying",
            Self::Refining => "refining",
            Self::Generating => "generating",
            Self::Executing => "executing",
            Self::Reporting => "reporting",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Coarse run state exposed through the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One entry of the per-step trace. Recorded for every step regardless of
/// outcome.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
}

/// Snapshot of a run for status polling. `progress` is monotonically
/// non-decreasing across snapshots of the same run.
#[derive(Debug, Clone)]
pub struct WorkflowStatus {
    pub status: RunState,
    pub current_step: WorkflowPhase,
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_progress_is_monotone_over_the_happy_path() {
        let path = [
            WorkflowPhase::Start,
            WorkflowPhase::Clarifying,
            WorkflowPhase::Refining,
            WorkflowPhase::Generating,
            WorkflowPhase::Executing,
            WorkflowPhase::Reporting,
            WorkflowPhase::Complete,
        ];
        let mut last = 0;
        for phase in path {
            assert!(phase.progress() >= last);
            last = phase.progress();
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn terminal_phases() {
        assert!(WorkflowPhase::Complete.is_terminal());
        assert!(WorkflowPhase::Failed.is_terminal());
        assert!(WorkflowPhase::Cancelled.is_terminal());
        assert!(!WorkflowPhase::Executing.is_terminal());
    }

    #[test]
    fn conversation_log_is_append_only() {
        let mut state = ConversationState::new();
        state.push(Message::user("hello"));
        state.push(Message::assistant("hi", AgentType::Conversational));
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[1].agent, Some(AgentType::Conversational));

        state.clear_messages();
        assert!(state.messages.is_empty());
    }
}
