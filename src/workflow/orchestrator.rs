//! The workflow state machine.
//!
//! One run per user request: clarify (bounded), refine, generate, execute,
//! report. The orchestrator owns all run state; agents receive snapshots and
//! return partial updates that are merged back before the next step starts.
//! Cancellation is cooperative and checked at every suspension point; the
//! wall-clock budget is a hard deadline that abandons the in-flight step. A
//! cancelled or timed-out run is terminal and never transitions again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::agents::{
    AgentMessage, Clarification, CodeGenAgent, ConversationalAgent, ExecutionAgent,
    GeneratedCode, ProcessedMessage,
};
use crate::cache::{cache_key, CacheLayer};
use crate::config::{Config, ExhaustionPolicy, Quality, WorkflowDefaults};
use crate::error::WorkflowError;
use crate::llm::LlmGateway;
use crate::sandbox::{ExecutionResult, SandboxManager};
use crate::workflow::state::{
    AgentType, ConversationState, Message, RunState, StepRecord, WorkflowPhase, WorkflowState,
    WorkflowStatus,
};

/// Seam through which the embedding layer answers clarification questions.
///
/// Returning no answers means none are available; the workflow then makes
/// forced progress instead of waiting.
#[async_trait]
pub trait ClarificationHandler: Send + Sync {
    async fn answer(&self, questions: &[String]) -> Vec<Clarification>;
}

/// Default handler: no answers, so clarification degrades to forced progress.
pub struct NoAnswers;

#[async_trait]
impl ClarificationHandler for NoAnswers {
    async fn answer(&self, _questions: &[String]) -> Vec<Clarification> {
        Vec::new()
    }
}

/// Per-run options. Defaults come from [`WorkflowDefaults`].
#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    pub max_clarifications: u32,
    pub timeout: std::time::Duration,
    pub retries: u32,
    pub quality: Quality,
    pub on_clarification_exhausted: ExhaustionPolicy,
}

impl From<&WorkflowDefaults> for WorkflowOptions {
    fn from(defaults: &WorkflowDefaults) -> Self {
        Self {
            max_clarifications: defaults.max_clarifications,
            timeout: defaults.timeout,
            retries: defaults.retries,
            quality: defaults.quality,
            on_clarification_exhausted: defaults.on_clarification_exhausted,
        }
    }
}

/// Input for one workflow run.
#[derive(Debug, Clone)]
pub struct WorkflowInput {
    /// Caller-supplied id, mainly so `cancel`/`status` can address the run
    /// while it is in flight. Generated when absent.
    pub workflow_id: Option<Uuid>,
    pub user_message: String,
    /// Prior conversation to continue, if any.
    pub context: Option<ConversationState>,
    pub options: Option<WorkflowOptions>,
}

impl WorkflowInput {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            workflow_id: None,
            user_message: user_message.into(),
            context: None,
            options: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.workflow_id = Some(id);
        self
    }

    pub fn with_context(mut self, context: ConversationState) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_options(mut self, options: WorkflowOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Observability metadata carried on every result, success or failure.
#[derive(Debug, Clone)]
pub struct WorkflowMetadata {
    pub duration: std::time::Duration,
    pub steps: Vec<StepRecord>,
    /// Completed clarification rounds, always `<= max_clarifications`.
    pub clarifications: u32,
    pub quality: Quality,
}

/// Terminal output of one run.
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub workflow_id: Uuid,
    pub success: bool,
    pub messages: Vec<Message>,
    pub generated_code: Option<GeneratedCode>,
    pub execution_result: Option<ExecutionResult>,
    /// Human-readable failure summary; the step trace carries the detail.
    pub error: Option<String>,
    pub metadata: WorkflowMetadata,
}

struct TrackerInner {
    state: RunState,
    phase: WorkflowPhase,
    progress: u8,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

/// Shared run handle: the cancellation flag plus the status snapshot.
struct RunTracker {
    cancel: AtomicBool,
    inner: Mutex<TrackerInner>,
}

impl RunTracker {
    fn new() -> Self {
        Self {
            cancel: AtomicBool::new(false),
            inner: Mutex::new(TrackerInner {
                state: RunState::Running,
                phase: WorkflowPhase::Start,
                progress: 0,
                started_at: Utc::now(),
                ended_at: None,
            }),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Cancellation is terminal the moment it is requested: the status flips
    /// to `Cancelled` immediately and no later transition can override it.
    fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        if inner.state == RunState::Running {
            inner.state = RunState::Cancelled;
            inner.phase = WorkflowPhase::Cancelled;
            inner.progress = 100;
            inner.ended_at = Some(Utc::now());
        }
    }

    fn set_phase(&self, phase: WorkflowPhase) {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        if inner.state != RunState::Running {
            return;
        }
        inner.phase = phase;
        // Progress is monotone even if phases were ever revisited.
        inner.progress = inner.progress.max(phase.progress());
    }

    fn finish(&self, state: RunState, phase: WorkflowPhase) {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        if inner.state != RunState::Running {
            return;
        }
        inner.state = state;
        inner.phase = phase;
        inner.progress = 100;
        inner.ended_at = Some(Utc::now());
    }

    fn status(&self) -> WorkflowStatus {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        WorkflowStatus {
            status: inner.state,
            current_step: inner.phase,
            progress: inner.progress,
            started_at: inner.started_at,
            ended_at: inner.ended_at,
        }
    }
}

/// The orchestrator. Shared safely across conversations; each run owns
/// disjoint state and shares only the gateway, the sandbox pool, and the
/// cache layer.
pub struct WorkflowOrchestrator {
    gateway: Arc<LlmGateway>,
    sandbox: Arc<SandboxManager>,
    cache: CacheLayer,
    defaults: WorkflowDefaults,
    clarifier: Arc<dyn ClarificationHandler>,
    runs: RwLock<HashMap<Uuid, Arc<RunTracker>>>,
}

impl WorkflowOrchestrator {
    pub fn new(gateway: Arc<LlmGateway>, sandbox: Arc<SandboxManager>, config: &Config) -> Self {
        Self {
            gateway,
            sandbox,
            cache: CacheLayer::new(&config.cache),
            defaults: config.workflow.clone(),
            clarifier: Arc::new(NoAnswers),
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_clarification_handler(mut self, handler: Arc<dyn ClarificationHandler>) -> Self {
        self.clarifier = handler;
        self
    }

    /// Run the full state machine for one user request.
    ///
    /// Always returns a result: failures are folded into
    /// `WorkflowResult { success: false, error, .. }` with the per-step trace
    /// intact, never surfaced as a bare error.
    pub async fn execute(&self, input: WorkflowInput) -> WorkflowResult {
        let options = input
            .options
            .unwrap_or_else(|| WorkflowOptions::from(&self.defaults));
        let workflow_id = input.workflow_id.unwrap_or_else(Uuid::new_v4);

        let tracker = Arc::new(RunTracker::new());
        self.runs
            .write()
            .await
            .insert(workflow_id, Arc::clone(&tracker));

        tracing::info!(workflow_id = %workflow_id, quality = ?options.quality, "Workflow started");

        let started = Instant::now();
        let deadline = started + options.timeout;

        let mut state = WorkflowState::new(input.context.unwrap_or_default());
        state.conversation.push(Message::user(&input.user_message));

        let mut steps: Vec<StepRecord> = Vec::new();
        let mut clarifications = 0u32;

        // The budget is a hard stop: when it elapses the in-flight step is
        // abandoned and the run goes terminal right away, not at the next
        // suspension point.
        let outcome = match tokio::time::timeout(
            options.timeout,
            self.drive(
                &tracker,
                &options,
                deadline,
                &input.user_message,
                &mut state,
                &mut steps,
                &mut clarifications,
            ),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(WorkflowError::Timeout {
                budget: options.timeout,
            }),
        };

        let error = match outcome {
            Ok(()) => {
                tracker.finish(RunState::Completed, WorkflowPhase::Complete);
                tracing::info!(
                    workflow_id = %workflow_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Workflow completed"
                );
                None
            }
            Err(err) => {
                state.should_continue = false;
                match err {
                    WorkflowError::Cancelled => {
                        // The tracker already went terminal in request_cancel.
                        tracing::info!(workflow_id = %workflow_id, "Workflow cancelled");
                    }
                    ref err => {
                        tracker.finish(RunState::Failed, WorkflowPhase::Failed);
                        tracing::warn!(
                            workflow_id = %workflow_id,
                            category = ?err.category(),
                            severity = ?err.severity(),
                            error = %err,
                            "Workflow failed"
                        );
                    }
                }
                Some(err.to_string())
            }
        };

        WorkflowResult {
            workflow_id,
            success: error.is_none(),
            messages: state.conversation.messages,
            generated_code: state.generated_code,
            execution_result: state.execution_result,
            error,
            metadata: WorkflowMetadata {
                duration: started.elapsed(),
                steps,
                clarifications,
                quality: options.quality,
            },
        }
    }

    /// Status of a run, or `None` for an unknown id.
    pub async fn status(&self, workflow_id: Uuid) -> Option<WorkflowStatus> {
        let runs = self.runs.read().await;
        runs.get(&workflow_id).map(|t| t.status())
    }

    /// Request cooperative cancellation. The in-flight step finishes or
    /// aborts at its next suspension point and its result is discarded; the
    /// status is `Cancelled` by the time this returns.
    pub async fn cancel(&self, workflow_id: Uuid) {
        let tracker = self.runs.read().await.get(&workflow_id).cloned();
        if let Some(tracker) = tracker {
            tracker.request_cancel();
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        tracker: &RunTracker,
        options: &WorkflowOptions,
        deadline: Instant,
        user_message: &str,
        state: &mut WorkflowState,
        steps: &mut Vec<StepRecord>,
        clarifications: &mut u32,
    ) -> Result<(), WorkflowError> {
        let conversational =
            ConversationalAgent::new(Arc::clone(&self.gateway)).with_retries(options.retries);
        let codegen = CodeGenAgent::new(Arc::clone(&self.gateway)).with_retries(options.retries);
        let executor = ExecutionAgent::new(Arc::clone(&self.sandbox));

        // Clarifying.
        checkpoint(tracker, deadline, options)?;
        tracker.set_phase(WorkflowPhase::Clarifying);

        let conv_key = cache_key(&(user_message, state.conversation.transcript()));
        let mut processed = match self.cache.conversation.get::<ProcessedMessage>(&conv_key) {
            Some(hit) => {
                steps.push(cached_step("understand"));
                hit
            }
            None => {
                let t0 = Instant::now();
                let result = conversational
                    .process_message(user_message, &state.conversation)
                    .await;
                record(steps, "understand", t0, &result);
                let processed = result.map_err(WorkflowError::Communication)?;
                self.cache.conversation.insert(&conv_key, &processed);
                processed
            }
        };
        merge_processed(&mut state.conversation, &processed);

        let mut answered: Vec<Clarification> = Vec::new();
        while state.conversation.needs_clarification && *clarifications < options.max_clarifications
        {
            checkpoint(tracker, deadline, options)?;

            let answers = self
                .clarifier
                .answer(&state.conversation.clarification_questions)
                .await;
            if answers.is_empty() {
                break;
            }
            *clarifications += 1;

            for a in &answers {
                state
                    .conversation
                    .push(Message::assistant(a.question.clone(), AgentType::Conversational));
                state.conversation.push(Message::user(a.answer.clone()));
            }
            answered.extend(answers);

            checkpoint(tracker, deadline, options)?;
            let t0 = Instant::now();
            let result = conversational
                .process_message(user_message, &state.conversation)
                .await;
            record(steps, "understand", t0, &result);
            processed = result.map_err(WorkflowError::Communication)?;
            merge_processed(&mut state.conversation, &processed);
        }

        // Refining.
        checkpoint(tracker, deadline, options)?;
        tracker.set_phase(WorkflowPhase::Refining);

        let mut refined: AgentMessage = match processed.refined_prompt.take() {
            Some(refined) => refined,
            None => match options.on_clarification_exhausted {
                ExhaustionPolicy::Fail => {
                    return Err(WorkflowError::Validation {
                        reason: "clarification budget exhausted with unresolved requirements"
                            .to_string(),
                        issues: state.conversation.clarification_questions.clone(),
                    });
                }
                ExhaustionPolicy::ForceRefine => {
                    let intent = state.conversation.user_intent.clone();
                    let t0 = Instant::now();
                    let result = conversational
                        .refine_prompt(&state.conversation, &intent)
                        .await;
                    record(steps, "refine", t0, &result);
                    result.map_err(WorkflowError::Communication)?
                }
            },
        };
        // A cache hit can replay a handoff minted under an earlier
        // conversation id; rebind it before anything downstream sees it.
        refined.conversation_id = state.conversation.conversation_id;
        refined.clarifications = answered;
        state.conversation.needs_clarification = false;
        state.conversation.clarification_questions.clear();
        state.conversation.refined_prompt = Some(refined.clone());

        // Generating.
        checkpoint(tracker, deadline, options)?;
        tracker.set_phase(WorkflowPhase::Generating);

        // Keyed on content, not conversation identity, so equal requirements
        // hit the cache across conversations.
        let code_key = cache_key(&(
            &refined.user_intent,
            &refined.refined_requirements,
            options.quality,
        ));
        let generated = match self.cache.code.get::<GeneratedCode>(&code_key) {
            Some(hit) => {
                steps.push(cached_step("generate"));
                hit
            }
            None => {
                let t0 = Instant::now();
                let result = codegen.generate_code(&refined, options.quality).await;
                record(steps, "generate", t0, &result);
                let generated = result?;
                self.cache.code.insert(&code_key, &generated);
                generated
            }
        };
        state.generated_code = Some(generated.clone());

        // Executing.
        checkpoint(tracker, deadline, options)?;
        tracker.set_phase(WorkflowPhase::Executing);
        executor.validate_execution(&generated.code)?;

        let exec_key = cache_key(&(&generated.code, generated.language));
        let execution = match self.cache.execution.get::<ExecutionResult>(&exec_key) {
            Some(hit) => {
                steps.push(cached_step("execute"));
                hit
            }
            None => {
                let t0 = Instant::now();
                let result = executor
                    .execute(&generated.code, generated.language, None)
                    .await;
                record(steps, "execute", t0, &result);
                let execution = result.map_err(WorkflowError::Execution)?;
                self.cache.execution.insert(&exec_key, &execution);
                execution
            }
        };
        state.execution_result = Some(execution);

        // Reporting.
        checkpoint(tracker, deadline, options)?;
        tracker.set_phase(WorkflowPhase::Reporting);
        let report = render_report(state);
        state
            .conversation
            .push(Message::assistant(report, AgentType::CodeGeneration));

        Ok(())
    }
}

/// Cancellation and deadline check at a suspension point.
fn checkpoint(
    tracker: &RunTracker,
    deadline: Instant,
    options: &WorkflowOptions,
) -> Result<(), WorkflowError> {
    if tracker.cancelled() {
        return Err(WorkflowError::Cancelled);
    }
    if Instant::now() >= deadline {
        return Err(WorkflowError::Timeout {
            budget: options.timeout,
        });
    }
    Ok(())
}

fn record<T, E: std::fmt::Display>(
    steps: &mut Vec<StepRecord>,
    name: &str,
    started: Instant,
    result: &Result<T, E>,
) {
    steps.push(StepRecord {
        name: name.to_string(),
        duration: started.elapsed(),
        success: result.is_ok(),
        error: result.as_ref().err().map(|e| e.to_string()),
    });
}

fn cached_step(name: &str) -> StepRecord {
    StepRecord {
        name: format!("{} (cached)", name),
        duration: std::time::Duration::ZERO,
        success: true,
        error: None,
    }
}

fn merge_processed(conversation: &mut ConversationState, processed: &ProcessedMessage) {
    conversation.user_intent = processed.user_intent.clone();
    conversation.needs_clarification = processed.needs_clarification;
    conversation.clarification_questions = processed.clarification_questions.clone();
}

fn render_report(state: &WorkflowState) -> String {
    let mut report = String::new();
    if let Some(code) = &state.generated_code {
        report.push_str(&format!(
            "Generated a {} program ({} lines).",
            code.language,
            code.code.lines().count()
        ));
        if !code.explanation.is_empty() {
            report.push(' ');
            report.push_str(&code.explanation);
        }
    }
    match &state.execution_result {
        Some(result) if result.success => {
            report.push_str(&format!(
                " Execution succeeded in {} ms.",
                result.execution_time.as_millis()
            ));
        }
        Some(result) => {
            report.push_str(&format!(
                " Execution failed: {}.",
                result.error.as_deref().unwrap_or("unknown error")
            ));
        }
        None => {}
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backoff, RetryConfig};
    use crate::error::LlmError;
    use crate::llm::testing::ScriptedProvider;
    use crate::llm::{
        CompletionRequest, CompletionResponse, LlmProvider, TokenStream, TokenUsage,
    };
    use std::time::Duration;

    const COMPLETE_EXTRACTION: &str = r#"{"user_intent": "greeting script", "confidence": 0.9,
        "tech_stack": ["shell"], "features": ["print a greeting"]}"#;
    const INCOMPLETE_EXTRACTION: &str =
        r#"{"user_intent": "something vague", "tech_stack": [], "features": []}"#;
    const ONE_QUESTION: &str = r#"{"questions": ["Which language?"]}"#;
    const SHELL_CODE: &str =
        r#"{"code": "echo hi", "language": "shell", "explanation": "prints hi"}"#;

    fn orchestrator_with(
        responses: Vec<&str>,
    ) -> (WorkflowOrchestrator, Arc<ScriptedProvider>) {
        let provider = Arc::new(ScriptedProvider::new("mock", responses));
        let gateway = LlmGateway::builder()
            .register(provider.clone(), 1)
            .retry(RetryConfig {
                retries: 0,
                backoff: Backoff::Linear {
                    base: Duration::ZERO,
                },
                condition: crate::error::is_transient,
            })
            .build()
            .unwrap();
        let sandbox = Arc::new(SandboxManager::new(Default::default()));
        let orchestrator =
            WorkflowOrchestrator::new(Arc::new(gateway), sandbox, &Config::default());
        (orchestrator, provider)
    }

    fn draft_options() -> WorkflowOptions {
        WorkflowOptions {
            quality: Quality::Draft,
            ..WorkflowOptions::from(&WorkflowDefaults::default())
        }
    }

    #[tokio::test]
    async fn happy_path_runs_to_completion() {
        let (orchestrator, _) = orchestrator_with(vec![COMPLETE_EXTRACTION, SHELL_CODE]);

        let result = orchestrator
            .execute(
                WorkflowInput::new("write a shell script that greets")
                    .with_options(draft_options()),
            )
            .await;

        assert!(result.success, "error: {:?}", result.error);
        let code = result.generated_code.as_ref().unwrap();
        assert_eq!(code.code, "echo hi\n");
        let execution = result.execution_result.as_ref().unwrap();
        assert!(execution.success);
        assert!(execution.output.contains("hi"));
        assert_eq!(result.metadata.clarifications, 0);
        assert!(result.metadata.steps.iter().all(|s| s.success));

        let status = orchestrator.status(result.workflow_id).await.unwrap();
        assert_eq!(status.status, RunState::Completed);
        assert_eq!(status.progress, 100);
        assert!(status.ended_at.is_some());
    }

    #[tokio::test]
    async fn unanswered_clarification_forces_progress() {
        // Incomplete extraction, one question, no answers available, then the
        // forced refinement produces a complete handoff.
        let (orchestrator, _) = orchestrator_with(vec![
            INCOMPLETE_EXTRACTION,
            ONE_QUESTION,
            COMPLETE_EXTRACTION,
            SHELL_CODE,
        ]);

        let result = orchestrator
            .execute(WorkflowInput::new("do something").with_options(draft_options()))
            .await;

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.metadata.clarifications, 0);
        assert!(result.metadata.steps.iter().any(|s| s.name == "refine"));
    }

    struct EchoAnswers;

    #[async_trait]
    impl ClarificationHandler for EchoAnswers {
        async fn answer(&self, questions: &[String]) -> Vec<Clarification> {
            questions
                .iter()
                .map(|q| Clarification {
                    question: q.clone(),
                    answer: "still not sure".to_string(),
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn clarification_rounds_respect_the_bound() {
        // The extraction never completes, so every round asks again. Three
        // answered rounds exhaust the budget; forced refinement then takes
        // over.
        let (orchestrator, _) = orchestrator_with(vec![
            INCOMPLETE_EXTRACTION,
            ONE_QUESTION,
            INCOMPLETE_EXTRACTION,
            ONE_QUESTION,
            INCOMPLETE_EXTRACTION,
            ONE_QUESTION,
            INCOMPLETE_EXTRACTION,
            ONE_QUESTION,
            COMPLETE_EXTRACTION, // forced refinement reply
            SHELL_CODE,
        ]);
        let orchestrator = orchestrator.with_clarification_handler(Arc::new(EchoAnswers));

        let defaults = WorkflowDefaults::default();
        let result = orchestrator
            .execute(WorkflowInput::new("do something").with_options(draft_options()))
            .await;

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.metadata.clarifications, defaults.max_clarifications);
        assert!(result.metadata.clarifications <= defaults.max_clarifications);
    }

    #[tokio::test]
    async fn validation_failure_fails_the_workflow() {
        let (orchestrator, _) = orchestrator_with(vec![
            COMPLETE_EXTRACTION,
            r#"{"code": "echo ((", "language": "python"}"#,
        ]);

        let result = orchestrator
            .execute(WorkflowInput::new("greet").with_options(draft_options()))
            .await;

        assert!(!result.success);
        assert!(result.error.is_some());
        let generate = result
            .metadata
            .steps
            .iter()
            .find(|s| s.name == "generate")
            .unwrap();
        assert!(!generate.success);
        assert!(generate.error.is_some());

        let status = orchestrator.status(result.workflow_id).await.unwrap();
        assert_eq!(status.status, RunState::Failed);
    }

    #[tokio::test]
    async fn zero_timeout_fails_immediately() {
        let (orchestrator, provider) = orchestrator_with(vec![COMPLETE_EXTRACTION, SHELL_CODE]);

        let options = WorkflowOptions {
            timeout: Duration::ZERO,
            ..draft_options()
        };
        let result = orchestrator
            .execute(WorkflowInput::new("greet").with_options(options))
            .await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("timed out"));
        // Nothing ran.
        assert_eq!(provider.call_count(), 0);
    }

    /// Completes slowly enough that a cancel lands mid-step.
    struct SlowProvider;

    #[async_trait]
    impl LlmProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }
        fn model(&self) -> &str {
            "m"
        }
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(CompletionResponse {
                content: COMPLETE_EXTRACTION.to_string(),
                usage: TokenUsage {
                    prompt_tokens: 1,
                    completion_tokens: 1,
                    total_tokens: 2,
                },
            })
        }
        async fn complete_stream(
            &self,
            _request: CompletionRequest,
        ) -> Result<TokenStream, LlmError> {
            Ok(TokenStream::empty())
        }
        async fn list_models(&self) -> Result<Vec<String>, LlmError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn cancellation_is_terminal() {
        let gateway = LlmGateway::builder()
            .register(Arc::new(SlowProvider), 1)
            .build()
            .unwrap();
        let sandbox = Arc::new(SandboxManager::new(Default::default()));
        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            Arc::new(gateway),
            sandbox,
            &Config::default(),
        ));

        let id = Uuid::new_v4();
        let runner = Arc::clone(&orchestrator);
        let handle = tokio::spawn(async move {
            runner
                .execute(
                    WorkflowInput::new("greet")
                        .with_id(id)
                        .with_options(draft_options()),
                )
                .await
        });

        // Let the run get into its first model call, then cancel.
        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.cancel(id).await;

        // Terminal immediately, before the in-flight step finishes.
        let status = orchestrator.status(id).await.unwrap();
        assert_eq!(status.status, RunState::Cancelled);
        assert_eq!(status.progress, 100);

        let result = handle.await.unwrap();
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().to_lowercase().contains("cancelled"));

        // No transition after the terminal state.
        let status = orchestrator.status(id).await.unwrap();
        assert_eq!(status.status, RunState::Cancelled);
        assert_eq!(status.current_step, WorkflowPhase::Cancelled);
    }

    #[tokio::test]
    async fn timeout_goes_terminal_mid_step() {
        let gateway = LlmGateway::builder()
            .register(Arc::new(SlowProvider), 1)
            .build()
            .unwrap();
        let sandbox = Arc::new(SandboxManager::new(Default::default()));
        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            Arc::new(gateway),
            sandbox,
            &Config::default(),
        ));

        let id = Uuid::new_v4();
        let options = WorkflowOptions {
            timeout: Duration::from_millis(50),
            ..draft_options()
        };
        let runner = Arc::clone(&orchestrator);
        let handle = tokio::spawn(async move {
            runner
                .execute(
                    WorkflowInput::new("greet")
                        .with_id(id)
                        .with_options(options),
                )
                .await
        });

        // Well past the budget but still inside the provider's 200 ms call.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let status = orchestrator.status(id).await.unwrap();
        assert_eq!(status.status, RunState::Failed);
        assert_eq!(status.progress, 100);
        assert!(status.ended_at.is_some());

        let result = handle.await.unwrap();
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("timed out"));
        // The run did not wait out the in-flight provider call.
        assert!(result.metadata.duration < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn cached_handoff_is_rebound_to_the_current_conversation() {
        use crate::agents::RefinedRequirements;

        let (orchestrator, _) = orchestrator_with(vec![SHELL_CODE]);

        // A handoff minted for some earlier conversation, replayed via the
        // conversation cache.
        let stale = AgentMessage::new(
            Uuid::new_v4(),
            "greeting script",
            RefinedRequirements {
                tech_stack: vec!["shell".into()],
                features: vec!["print a greeting".into()],
                ..Default::default()
            },
        );
        let processed = ProcessedMessage {
            needs_clarification: false,
            clarification_questions: vec![],
            refined_prompt: Some(stale),
            user_intent: "greeting script".into(),
            confidence: 0.9,
            suggested_actions: vec![],
        };

        let user_message = "write a shell script that greets";
        let mut state = WorkflowState::new(ConversationState::new());
        state.conversation.push(Message::user(user_message));
        let conv_key = cache_key(&(user_message, state.conversation.transcript()));
        orchestrator.cache.conversation.insert(&conv_key, &processed);

        let tracker = RunTracker::new();
        let options = draft_options();
        let deadline = Instant::now() + options.timeout;
        let mut steps = Vec::new();
        let mut clarifications = 0;
        orchestrator
            .drive(
                &tracker,
                &options,
                deadline,
                user_message,
                &mut state,
                &mut steps,
                &mut clarifications,
            )
            .await
            .unwrap();

        let refined = state.conversation.refined_prompt.as_ref().unwrap();
        assert_eq!(refined.conversation_id, state.conversation.conversation_id);
    }

    #[tokio::test]
    async fn repeated_input_is_served_from_the_caches() {
        let (orchestrator, provider) = orchestrator_with(vec![COMPLETE_EXTRACTION, SHELL_CODE]);

        let first = orchestrator
            .execute(WorkflowInput::new("greet me").with_options(draft_options()))
            .await;
        assert!(first.success);
        let calls_after_first = provider.call_count();

        let second = orchestrator
            .execute(WorkflowInput::new("greet me").with_options(draft_options()))
            .await;
        assert!(second.success);

        // Conversation, code, and execution all memoized: no new model calls.
        assert_eq!(provider.call_count(), calls_after_first);
        assert!(second
            .metadata
            .steps
            .iter()
            .any(|s| s.name.ends_with("(cached)")));
        assert_eq!(
            second.generated_code.as_ref().unwrap().code,
            first.generated_code.as_ref().unwrap().code
        );
    }

    #[tokio::test]
    async fn status_of_unknown_run_is_none() {
        let (orchestrator, _) = orchestrator_with(vec![]);
        assert!(orchestrator.status(Uuid::new_v4()).await.is_none());
        // Cancelling an unknown run is a quiet no-op.
        orchestrator.cancel(Uuid::new_v4()).await;
    }
}
