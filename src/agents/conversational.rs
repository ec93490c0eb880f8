//! Conversation understanding: intent extraction, clarification questions,
//! and prompt refinement.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agents::handoff::{AgentMessage, RefinedRequirements};
use crate::agents::parse::extract_json;
use crate::error::LlmError;
use crate::llm::{ChatMessage, ChatOptions, ChatRequest, LlmGateway};
use crate::workflow::state::ConversationState;

const EXTRACT_SYSTEM_PROMPT: &str = "You analyze a software request and reply with ONLY a JSON object: \
{\"user_intent\": string, \"confidence\": number 0..1, \"tech_stack\": [string], \
\"features\": [string], \"database\": string or null, \
\"additional_constraints\": [string], \"suggested_actions\": [string]}. \
Leave tech_stack or features empty when the request does not state them.";

const QUESTIONS_SYSTEM_PROMPT: &str = "You ask the minimum questions needed to start building. Reply with ONLY a \
JSON object: {\"questions\": [string]}. Ask at most 3 questions, only about \
missing required information (technology stack, core features).";

const REFINE_SYSTEM_PROMPT: &str = "You turn a conversation into a build-ready request. Reply with ONLY a JSON \
object: {\"user_intent\": string, \"tech_stack\": [string], \"features\": [string], \
\"database\": string or null, \"additional_constraints\": [string]}. \
Fill every field with your best reading of the conversation; do not leave \
tech_stack or features empty.";

/// What one `process_message` call produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedMessage {
    pub needs_clarification: bool,
    pub clarification_questions: Vec<String>,
    pub refined_prompt: Option<AgentMessage>,
    pub user_intent: String,
    /// Opaque model-reported score; informational only, never used to decide
    /// whether clarification is needed.
    pub confidence: f32,
    pub suggested_actions: Vec<String>,
}

/// Shape of the model's extraction reply. Every field defaults so a partial
/// reply still parses.
#[derive(Debug, Default, Deserialize)]
struct Extraction {
    #[serde(default)]
    user_intent: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    tech_stack: Vec<String>,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    database: Option<String>,
    #[serde(default)]
    additional_constraints: Vec<String>,
    #[serde(default)]
    suggested_actions: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct QuestionList {
    #[serde(default)]
    questions: Vec<String>,
}

/// The conversational agent. Stateless apart from the shared gateway; all
/// conversation state is owned by the orchestrator and passed in.
pub struct ConversationalAgent {
    gateway: Arc<LlmGateway>,
    chat_options: ChatOptions,
}

impl ConversationalAgent {
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self {
            gateway,
            chat_options: ChatOptions::default(),
        }
    }

    /// Override the gateway retry budget for this agent's calls.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.chat_options.retries = Some(retries);
        self
    }

    /// Analyze one user message in context.
    ///
    /// `needs_clarification` derives from whether the required structured
    /// fields (tech stack, at least one feature) could be extracted, never
    /// from the confidence score. Reporting `needs_clarification` with zero
    /// questions is coerced to `false` so the workflow cannot stall.
    pub async fn process_message(
        &self,
        message: &str,
        state: &ConversationState,
    ) -> Result<ProcessedMessage, LlmError> {
        let mut prompt = String::new();
        let transcript = state.transcript();
        if !transcript.is_empty() {
            prompt.push_str("Conversation so far:\n");
            prompt.push_str(&transcript);
            prompt.push_str("\n\n");
        }
        prompt.push_str("Latest message: ");
        prompt.push_str(message);

        let response = self
            .gateway
            .chat(
                ChatRequest::new(vec![
                    ChatMessage::system(EXTRACT_SYSTEM_PROMPT),
                    ChatMessage::user(prompt),
                ])
                .with_options(self.chat_options.clone()),
            )
            .await?;

        let extraction = parse_extraction(&response.content)
            .unwrap_or_else(|| heuristic_extraction(message));

        let requirements = RefinedRequirements {
            tech_stack: extraction.tech_stack,
            features: extraction.features,
            database: extraction.database,
            additional_constraints: extraction.additional_constraints,
        };
        let user_intent = if extraction.user_intent.is_empty() {
            message.to_string()
        } else {
            extraction.user_intent
        };

        let mut needs_clarification = !requirements.is_complete();
        let mut questions = Vec::new();
        if needs_clarification {
            questions = self
                .generate_clarification_questions(&user_intent, state)
                .await
                .unwrap_or_default();
            if questions.is_empty() {
                // Fail open toward progress rather than stalling.
                tracing::debug!(
                    conversation_id = %state.conversation_id,
                    "Clarification requested with no questions; treating as resolved"
                );
                needs_clarification = false;
            }
        }

        let refined_prompt = if needs_clarification {
            None
        } else {
            Some(AgentMessage::new(
                state.conversation_id,
                user_intent.clone(),
                requirements,
            ))
        };

        Ok(ProcessedMessage {
            needs_clarification,
            clarification_questions: questions,
            refined_prompt,
            user_intent,
            confidence: extraction.confidence,
            suggested_actions: extraction.suggested_actions,
        })
    }

    /// Ask the model for the minimum clarification questions. A single
    /// gateway call with no side effects.
    pub async fn generate_clarification_questions(
        &self,
        intent: &str,
        state: &ConversationState,
    ) -> Result<Vec<String>, LlmError> {
        let prompt = format!(
            "Request: {}\n\nConversation so far:\n{}",
            intent,
            state.transcript()
        );
        let response = self
            .gateway
            .chat(
                ChatRequest::new(vec![
                    ChatMessage::system(QUESTIONS_SYSTEM_PROMPT),
                    ChatMessage::user(prompt),
                ])
                .with_options(self.chat_options.clone()),
            )
            .await?;

        let list: QuestionList = extract_json(&response.content)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        Ok(list.questions)
    }

    /// Refine the whole conversation into a build-ready handoff. A single
    /// gateway call; on an unparseable reply it falls back to best-available
    /// extraction from the raw conversation so forced progress always has
    /// something to hand to code generation.
    pub async fn refine_prompt(
        &self,
        state: &ConversationState,
        intent: &str,
    ) -> Result<AgentMessage, LlmError> {
        let prompt = format!(
            "Intent: {}\n\nConversation:\n{}",
            intent,
            state.transcript()
        );
        let response = self
            .gateway
            .chat(
                ChatRequest::new(vec![
                    ChatMessage::system(REFINE_SYSTEM_PROMPT),
                    ChatMessage::user(prompt),
                ])
                .with_options(self.chat_options.clone()),
            )
            .await?;

        let extraction = parse_extraction(&response.content).unwrap_or_else(|| {
            tracing::warn!(
                conversation_id = %state.conversation_id,
                "Refinement reply was not parseable; using best-available extraction"
            );
            heuristic_extraction(intent)
        });

        let user_intent = if extraction.user_intent.is_empty() {
            intent.to_string()
        } else {
            extraction.user_intent
        };
        Ok(AgentMessage::new(
            state.conversation_id,
            user_intent,
            RefinedRequirements {
                tech_stack: extraction.tech_stack,
                features: extraction.features,
                database: extraction.database,
                additional_constraints: extraction.additional_constraints,
            },
        ))
    }
}

fn parse_extraction(content: &str) -> Option<Extraction> {
    extract_json(content).and_then(|v| serde_json::from_value(v).ok())
}

/// Last-resort extraction when the model reply is not structured: keyword
/// scan for well-known technologies, intent = the raw message.
fn heuristic_extraction(message: &str) -> Extraction {
    const KNOWN_TECH: &[&str] = &[
        "react",
        "vue",
        "angular",
        "svelte",
        "typescript",
        "javascript",
        "python",
        "rust",
        "go",
        "node",
        "django",
        "flask",
        "express",
        "postgres",
        "sqlite",
    ];
    let lower = message.to_lowercase();
    let tech_stack = KNOWN_TECH
        .iter()
        .filter(|t| lower.contains(*t))
        .map(|t| t.to_string())
        .collect();
    Extraction {
        user_intent: message.to_string(),
        tech_stack,
        ..Extraction::default()
    }
}
