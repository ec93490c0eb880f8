//! The structured handoff between conversation understanding and code
//! synthesis.
//!
//! An [`AgentMessage`] is created once per successful refinement and consumed
//! exactly once by the code generation agent. It is immutable after creation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What the conversational agent extracted about the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefinedRequirements {
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub additional_constraints: Vec<String>,
}

impl RefinedRequirements {
    /// Both required fields (a tech stack and at least one feature) present.
    pub fn is_complete(&self) -> bool {
        !self.tech_stack.is_empty() && !self.features.is_empty()
    }
}

/// One answered clarification round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clarification {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    #[default]
    Medium,
    Complex,
}

impl Complexity {
    /// Rough sizing from the amount of extracted structure.
    pub fn estimate(requirements: &RefinedRequirements) -> Self {
        let parts = requirements.features.len()
            + requirements.additional_constraints.len()
            + usize::from(requirements.database.is_some());
        match parts {
            0..=2 => Self::Simple,
            3..=5 => Self::Medium,
            _ => Self::Complex,
        }
    }
}

/// Structured handoff from the conversational agent to code generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub conversation_id: Uuid,
    pub user_intent: String,
    pub refined_requirements: RefinedRequirements,
    #[serde(default)]
    pub clarifications: Vec<Clarification>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub estimated_complexity: Complexity,
}

impl AgentMessage {
    pub fn new(
        conversation_id: Uuid,
        user_intent: impl Into<String>,
        requirements: RefinedRequirements,
    ) -> Self {
        let estimated_complexity = Complexity::estimate(&requirements);
        Self {
            conversation_id,
            user_intent: user_intent.into(),
            refined_requirements: requirements,
            clarifications: Vec::new(),
            priority: Priority::Medium,
            estimated_complexity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completeness_requires_stack_and_feature() {
        let mut req = RefinedRequirements::default();
        assert!(!req.is_complete());
        req.tech_stack.push("rust".into());
        assert!(!req.is_complete());
        req.features.push("cli".into());
        assert!(req.is_complete());
    }

    #[test]
    fn complexity_scales_with_structure() {
        let mut req = RefinedRequirements {
            features: vec!["a".into()],
            ..Default::default()
        };
        assert_eq!(Complexity::estimate(&req), Complexity::Simple);

        req.features = vec!["a".into(), "b".into(), "c".into()];
        req.database = Some("postgres".into());
        assert_eq!(Complexity::estimate(&req), Complexity::Medium);

        req.additional_constraints = vec!["x".into(), "y".into(), "z".into()];
        assert_eq!(Complexity::estimate(&req), Complexity::Complex);
    }

    #[test]
    fn handoff_roundtrips_through_json() {
        let msg = AgentMessage::new(
            Uuid::new_v4(),
            "todo app",
            RefinedRequirements {
                tech_stack: vec!["react".into(), "typescript".into()],
                features: vec!["todo list".into()],
                database: None,
                additional_constraints: vec![],
            },
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: AgentMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
