//! Code synthesis: generation with bounded regenerate-and-revalidate,
//! static validation, and formatting.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::agents::handoff::AgentMessage;
use crate::agents::parse::{extract_json, strip_code_fence};
use crate::config::Quality;
use crate::error::WorkflowError;
use crate::llm::{ChatMessage, ChatOptions, ChatRequest, LlmGateway};
use crate::sandbox::Language;

const GENERATE_SYSTEM_PROMPT: &str = "You write complete, runnable programs. Reply with ONLY a JSON object: \
{\"code\": string, \"language\": \"python\"|\"javascript\"|\"shell\", \
\"explanation\": string, \"suggestions\": [string], \
\"files\": [{\"path\": string, \"content\": string}]}. \
The program must run as-is with no placeholders.";

const TESTS_SYSTEM_PROMPT: &str = "You write a self-contained test script for the given program, in the same \
language. Each test prints exactly one line: 'PASS: <name>' or \
'FAIL: <name> - <detail>'. Reply with ONLY the test code.";

const DOCS_SYSTEM_PROMPT: &str = "You write concise usage documentation (markdown) for the given program. \
Reply with ONLY the documentation.";

/// Where the code came from and how hard it was to get.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeMetadata {
    pub provider: String,
    pub model: String,
    /// Total generation attempts, including regenerations.
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

/// Output of one `generate_code` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedCode {
    pub code: String,
    pub language: Language,
    pub explanation: String,
    pub metadata: CodeMetadata,
    pub suggestions: Vec<String>,
    pub files: Vec<GeneratedFile>,
    /// Best-effort derived artifacts; absent when derivation failed or the
    /// quality level skips them.
    pub tests: Option<String>,
    pub documentation: Option<String>,
}

/// Result of static validation. Pure function of the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CodeReply {
    #[serde(default)]
    code: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    suggestions: Vec<String>,
    #[serde(default)]
    files: Vec<GeneratedFile>,
}

/// The code generation agent.
pub struct CodeGenAgent {
    gateway: Arc<LlmGateway>,
    chat_options: ChatOptions,
}

impl CodeGenAgent {
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

    /// Generate code for a refined request.
    ///
    /// Validation failures trigger a regenerate-and-revalidate cycle bounded
    /// by the quality level; exhausting it surfaces
    /// [`WorkflowError::Validation`]. Derived artifacts (tests, docs) are
    /// best effort and never fail the call.
    pub async fn generate_code(
        &self,
        refined: &AgentMessage,
        quality: Quality,
    ) -> Result<GeneratedCode, WorkflowError> {
        let base_prompt = render_request(refined);
        let mut feedback: Option<Vec<String>> = None;
        let max_attempts = 1 + quality.regen_attempts();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut prompt = base_prompt.clone();
            if let Some(issues) = &feedback {
                prompt.push_str("\n\nThe previous attempt failed validation:\n");
                for issue in issues {
                    prompt.push_str("- ");
                    prompt.push_str(issue);
                    prompt.push('\n');
                }
                prompt.push_str("Produce a corrected program.");
            }

            let response = self
                .gateway
                .chat(
                    ChatRequest::new(vec![
                        ChatMessage::system(GENERATE_SYSTEM_PROMPT),
                        ChatMessage::user(prompt),
                    ])
                    .with_options(self.chat_options.clone()),
                )
                .await
                .map_err(WorkflowError::Communication)?;

            let (code, language, explanation, suggestions, files) =
                parse_code_reply(&response.content, refined);
            let code = self.format_code(&code);

            let validation = self.validate_code(&code, language);
            if validation.valid {
                let mut generated = GeneratedCode {
                    code,
                    language,
                    explanation,
                    metadata: CodeMetadata {
                        provider: response.provider,
                        model: response.model,
                        attempts: attempt,
                    },
                    suggestions,
                    files,
                    tests: None,
                    documentation: None,
                };
                if quality.derive_artifacts() {
                    generated.tests = self.generate_tests(&generated.code, language).await;
                    generated.documentation =
                        self.generate_documentation(&generated.code, language).await;
                }
                return Ok(generated);
            }

            tracing::debug!(
                attempt,
                issues = ?validation.issues,
                "Generated code failed validation"
            );
            if attempt >= max_attempts {
                return Err(WorkflowError::Validation {
                    reason: format!(
                        "generated code failed validation after {} attempt(s)",
                        attempt
                    ),
                    issues: validation.issues,
                });
            }
            feedback = Some(validation.issues);
        }
    }

    /// Static checks over source text. Independent of generation and
    /// idempotent: validating twice gives the same result.
    pub fn validate_code(&self, code: &str, language: Language) -> Validation {
        let mut issues = Vec::new();

        if code.trim().is_empty() {
            issues.push("code is empty".to_string());
        }
        if code.contains("```") {
            issues.push("code contains a leftover markdown fence".to_string());
        }

        for (open, close) in [('(', ')'), ('[', ']'), ('{', '}')] {
            let (opens, closes) = count_outside_strings(code, open, close);
            // Shell parameter expansion makes brace counts unreliable there.
            if language == Language::Shell && open == '{' {
                continue;
            }
            if opens != closes {
                issues.push(format!(
                    "unbalanced '{}' / '{}' ({} vs {})",
                    open, close, opens, closes
                ));
            }
        }

        Validation {
            valid: issues.is_empty(),
            issues,
        }
    }

    /// Normalize source text. Idempotent: `format(format(x)) == format(x)`.
    pub fn format_code(&self, code: &str) -> String {
        static BLANK_RUNS: OnceLock<Regex> = OnceLock::new();
        let blank_runs = BLANK_RUNS.get_or_init(|| Regex::new(r"\n{3,}").expect("valid pattern"));

        let unix = code.replace("\r\n", "\n");
        let stripped = unix
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n");
        let collapsed = blank_runs.replace_all(&stripped, "\n\n");
        let mut out = collapsed.trim_matches('\n').to_string();
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }

    /// Derive a test script. Best effort: any failure is logged and reported
    /// as an absent artifact.
    pub async fn generate_tests(&self, code: &str, language: Language) -> Option<String> {
        match self.derive_artifact(TESTS_SYSTEM_PROMPT, code, language).await {
            Ok(tests) => Some(tests),
            Err(e) => {
                tracing::warn!(error = %e, "Test derivation failed; continuing without tests");
                None
            }
        }
    }

    /// Derive documentation. Best effort, same policy as tests.
    pub async fn generate_documentation(&self, code: &str, language: Language) -> Option<String> {
        match self.derive_artifact(DOCS_SYSTEM_PROMPT, code, language).await {
            Ok(docs) => Some(docs),
            Err(e) => {
                tracing::warn!(error = %e, "Documentation derivation failed; continuing without docs");
                None
            }
        }
    }

    async fn derive_artifact(
        &self,
        system: &str,
        code: &str,
        language: Language,
    ) -> Result<String, crate::error::LlmError> {
        let response = self
            .gateway
            .chat(
                ChatRequest::new(vec![
                    ChatMessage::system(system),
                    ChatMessage::user(format!("Language: {}\n\n{}", language, code)),
                ])
                .with_options(self.chat_options.clone()),
            )
            .await?;
        Ok(strip_code_fence(&response.content).to_string())
    }
}

fn render_request(refined: &AgentMessage) -> String {
    let req = &refined.refined_requirements;
    let mut prompt = format!("Build: {}\n", refined.user_intent);
    if !req.tech_stack.is_empty() {
        prompt.push_str(&format!("Tech stack: {}\n", req.tech_stack.join(", ")));
    }
    if !req.features.is_empty() {
        prompt.push_str(&format!("Features: {}\n", req.features.join(", ")));
    }
    if let Some(db) = &req.database {
        prompt.push_str(&format!("Database: {}\n", db));
    }
    if !req.additional_constraints.is_empty() {
        prompt.push_str(&format!(
            "Constraints: {}\n",
            req.additional_constraints.join(", ")
        ));
    }
    for c in &refined.clarifications {
        prompt.push_str(&format!("Q: {} A: {}\n", c.question, c.answer));
    }
    prompt
}

fn parse_code_reply(
    content: &str,
    refined: &AgentMessage,
) -> (String, Language, String, Vec<String>, Vec<GeneratedFile>) {
    if let Some(reply) = extract_json(content)
        .and_then(|v| serde_json::from_value::<CodeReply>(v).ok())
        .filter(|r| !r.code.trim().is_empty())
    {
        let language = reply
            .language
            .as_deref()
            .and_then(|l| l.parse().ok())
            .unwrap_or_else(|| default_language(refined));
        return (
            reply.code,
            language,
            reply.explanation,
            reply.suggestions,
            reply.files,
        );
    }

    // Unstructured reply: treat the fence-stripped body as the program.
    (
        strip_code_fence(content).to_string(),
        default_language(refined),
        String::new(),
        Vec::new(),
        Vec::new(),
    )
}

fn default_language(refined: &AgentMessage) -> Language {
    let stack = refined
        .refined_requirements
        .tech_stack
        .join(" ")
        .to_lowercase();
    if ["javascript", "typescript", "react", "node", "vue"]
        .iter()
        .any(|t| stack.contains(t))
    {
        Language::JavaScript
    } else if stack.contains("shell") || stack.contains("bash") {
        Language::Shell
    } else {
        Language::Python
    }
}

fn count_outside_strings(code: &str, open: char, close: char) -> (usize, usize) {
    let mut opens = 0;
    let mut closes = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in code.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match quote {
            Some(q) => {
                if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None => {
                if c == '"' || c == '\'' {
                    quote = Some(c);
                } else if c == open {
                    opens += 1;
                } else if c == close {
                    closes += 1;
                }
            }
        }
    }
    (opens, closes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::handoff::RefinedRequirements;
    use crate::llm::testing::scripted_gateway;
    use uuid::Uuid;

    fn refined() -> AgentMessage {
        AgentMessage::new(
            Uuid::new_v4(),
            "number printer",
            RefinedRequirements {
                tech_stack: vec!["python".into()],
                features: vec!["print numbers".into()],
                database: None,
                additional_constraints: vec![],
            },
        )
    }

    fn agent_with(responses: Vec<&str>) -> CodeGenAgent {
        let (gateway, _) = scripted_gateway(responses);
        CodeGenAgent::new(Arc::new(gateway))
    }

    #[tokio::test]
    async fn structured_reply_is_parsed() {
        let agent = agent_with(vec![
            r#"{"code": "print(1)", "language": "python", "explanation": "prints one", "suggestions": ["add a loop"]}"#,
        ]);

        let generated = agent
            .generate_code(&refined(), Quality::Draft)
            .await
            .unwrap();
        assert_eq!(generated.code, "print(1)\n");
        assert_eq!(generated.language, Language::Python);
        assert_eq!(generated.explanation, "prints one");
        assert_eq!(generated.metadata.attempts, 1);
        // Draft quality skips derived artifacts.
        assert!(generated.tests.is_none());
        assert!(generated.documentation.is_none());
    }

    #[tokio::test]
    async fn unstructured_reply_becomes_code() {
        let agent = agent_with(vec!["```python\nprint(2)\n```"]);
        let generated = agent
            .generate_code(&refined(), Quality::Draft)
            .await
            .unwrap();
        assert_eq!(generated.code, "print(2)\n");
    }

    #[tokio::test]
    async fn validation_failure_triggers_bounded_regeneration() {
        // First reply unbalanced, second fixed. Production allows one regen.
        let agent = agent_with(vec![
            r#"{"code": "print((1)", "language": "python"}"#,
            r#"{"code": "print(1)", "language": "python"}"#,
        ]);

        let generated = agent
            .generate_code(&refined(), Quality::Production)
            .await
            .unwrap();
        assert_eq!(generated.code, "print(1)\n");
        assert_eq!(generated.metadata.attempts, 2);
    }

    #[tokio::test]
    async fn exhausted_regeneration_surfaces_validation_error() {
        let agent = agent_with(vec![r#"{"code": "print((1)", "language": "python"}"#]);

        let err = agent
            .generate_code(&refined(), Quality::Draft)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));
    }

    #[tokio::test]
    async fn derived_artifacts_for_production_quality() {
        let agent = agent_with(vec![
            r#"{"code": "print(3)", "language": "python"}"#,
            "```python\nprint('PASS: smoke')\n```",
            "# Usage\nRun it.",
        ]);

        let generated = agent
            .generate_code(&refined(), Quality::Production)
            .await
            .unwrap();
        assert_eq!(generated.tests.as_deref(), Some("print('PASS: smoke')"));
        assert!(generated.documentation.as_deref().unwrap().contains("Usage"));
    }

    #[test]
    fn format_is_idempotent() {
        let agent = agent_with(vec![]);
        let samples = [
            "a = 1\r\nb = 2   \n\n\n\n\nc = 3",
            "\n\nx\n",
            "",
            "def f():\n    pass\n",
        ];
        for src in samples {
            let once = agent.format_code(src);
            let twice = agent.format_code(&once);
            assert_eq!(once, twice, "format not idempotent for {:?}", src);
        }
    }

    #[test]
    fn validation_is_idempotent_and_catches_imbalance() {
        let agent = agent_with(vec![]);
        let bad = "print((1)";
        let first = agent.validate_code(bad, Language::Python);
        let second = agent.validate_code(bad, Language::Python);
        assert_eq!(first, second);
        assert!(!first.valid);

        let good = "print(\"a ( in a string\")";
        assert!(agent.validate_code(good, Language::Python).valid);
    }

    #[test]
    fn shell_braces_are_not_flagged() {
        let agent = agent_with(vec![]);
        let code = "echo ${HOME";
        assert!(agent.validate_code(code, Language::Shell).valid);
    }
}
