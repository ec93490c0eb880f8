//! Execution mediation: pre-flight checks, sandbox delegation, and test-run
//! aggregation.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::SessionOptions;
use crate::error::{SandboxError, WorkflowError};
use crate::sandbox::{ExecutionResult, Language, SandboxManager};

/// Outcome of one test case parsed from the run output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub name: String,
    pub passed: bool,
    pub detail: Option<String>,
}

/// Aggregate result of running a test script against source code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: bool,
    pub total_tests: u32,
    pub passed_tests: u32,
    pub failed_tests: u32,
    pub test_results: Vec<TestCaseResult>,
    /// Coverage is not measured by the line-based harness.
    pub coverage: Option<f32>,
    pub execution_time: Duration,
}

impl TestReport {
    /// A suite with zero tests passes by definition.
    fn empty(execution_time: Duration) -> Self {
        Self {
            passed: true,
            total_tests: 0,
            passed_tests: 0,
            failed_tests: 0,
            test_results: Vec::new(),
            coverage: None,
            execution_time,
        }
    }
}

/// Thin mediator between generated code and the sandbox.
pub struct ExecutionAgent {
    sandbox: Arc<SandboxManager>,
}

impl ExecutionAgent {
    pub fn new(sandbox: Arc<SandboxManager>) -> Self {
        Self { sandbox }
    }

    /// Pre-flight check before anything reaches the sandbox.
    pub fn validate_execution(&self, code: &str) -> Result<(), WorkflowError> {
        let mut issues = Vec::new();
        if code.trim().is_empty() {
            issues.push("nothing to execute".to_string());
        }
        if code.contains("```") {
            issues.push("code contains a leftover markdown fence".to_string());
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(WorkflowError::Validation {
                reason: "code rejected before execution".to_string(),
                issues,
            })
        }
    }

    /// Run code in an ephemeral session.
    pub async fn execute(
        &self,
        code: &str,
        language: Language,
        options: Option<SessionOptions>,
    ) -> Result<ExecutionResult, SandboxError> {
        self.sandbox.execute_code(code, language, options).await
    }

    /// Run a test script against source code in one session.
    ///
    /// The harness convention is line-based: each test prints
    /// `PASS: <name>` or `FAIL: <name> - <detail>`. A suite with zero tests
    /// reports `passed = true, total_tests = 0`, never a failure.
    pub async fn run_tests(
        &self,
        code: &str,
        test_code: &str,
        language: Language,
    ) -> Result<TestReport, SandboxError> {
        if test_code.trim().is_empty() {
            return Ok(TestReport::empty(Duration::ZERO));
        }

        let combined = format!("{}\n\n{}", code.trim_end(), test_code.trim_start());
        let session_id = self.sandbox.create_session(None).await?;
        let result = self
            .sandbox
            .execute_in_session(session_id, &combined, language)
            .await;
        self.sandbox.close_session(session_id).await;
        let result = result?;

        let test_results = parse_test_lines(&result.output);
        let total = test_results.len() as u32;
        let failed = test_results.iter().filter(|t| !t.passed).count() as u32;

        Ok(TestReport {
            passed: result.success && failed == 0,
            total_tests: total,
            passed_tests: total - failed,
            failed_tests: failed,
            test_results,
            coverage: None,
            execution_time: result.execution_time,
        })
    }
}

fn parse_test_lines(output: &str) -> Vec<TestCaseResult> {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    // The detail separator is a spaced " - " so hyphenated names stay whole.
    let marker = MARKER.get_or_init(|| {
        Regex::new(r"^(PASS|FAIL):\s*(.+?)(?:\s+-\s+(.+))?$").expect("valid pattern")
    });

    output
        .lines()
        .filter_map(|line| {
            let caps = marker.captures(line.trim())?;
            Some(TestCaseResult {
                name: caps[2].trim().to_string(),
                passed: &caps[1] == "PASS",
                detail: caps.get(3).map(|m| m.as_str().to_string()),
            })
        })
        .collect()
}
