//! Sandbox session bookkeeping and the process-backed runner.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SessionOptions;
use crate::error::SandboxError;

/// Languages with a registered runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Shell,
}

impl Language {
    pub fn interpreter(&self) -> &'static str {
        match self {
            Self::Python => "python3",
            Self::JavaScript => "node",
            Self::Shell => "sh",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Python => "main.py",
            Self::JavaScript => "main.js",
            Self::Shell => "main.sh",
        }
    }
}

impl std::str::FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "python" | "py" | "python3" => Ok(Self::Python),
            "javascript" | "js" | "node" | "typescript" | "ts" => Ok(Self::JavaScript),
            "shell" | "sh" | "bash" => Ok(Self::Shell),
            other => Err(SandboxError::UnsupportedLanguage {
                language: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Python => write!(f, "python"),
            Self::JavaScript => write!(f, "javascript"),
            Self::Shell => write!(f, "shell"),
        }
    }
}

/// Terminal artifact of one sandbox run. Immutable after creation.
///
/// User-code failures (nonzero exit, resource violation) live *inside* this
/// type as `success = false` with `error` populated; they never cross the
/// sandbox contract as a fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub logs: Vec<String>,
    pub execution_time: Duration,
}

impl ExecutionResult {
    pub fn failure(error: impl Into<String>, execution_time: Duration) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            logs: Vec::new(),
            execution_time,
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Closed,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: SessionState,
    pub uptime: Duration,
    /// Peak resident set observed across runs, best effort (0 if unmeasured).
    pub memory_usage_kb: u64,
    /// Cumulative wall-clock time spent executing.
    pub cpu_time: Duration,
    pub executions: u32,
}

const MAX_OUTPUT_BYTES: usize = 64 * 1024;
const MAX_LOG_LINES: usize = 200;

fn truncate_output(mut s: String) -> (String, bool) {
    if s.len() <= MAX_OUTPUT_BYTES {
        return (s, false);
    }
    let mut cut = MAX_OUTPUT_BYTES;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    (s, true)
}

/// Run one program inside a session workspace under the session's limits.
///
/// The memory cap uses `ulimit -v`; the command is killed when the wall-clock
/// timeout elapses (`kill_on_drop` reaps the child when the wait future is
/// dropped by the timeout).
pub(crate) async fn run_program(
    session_id: Uuid,
    workdir: &Path,
    options: &SessionOptions,
    code: &str,
    language: Language,
) -> Result<ExecutionResult, SandboxError> {
    let file = workdir.join(language.file_name());
    tokio::fs::write(&file, code).await?;

    let mut shell_cmd = String::new();
    if options.memory_limit_mb > 0 {
        shell_cmd.push_str(&format!(
            "ulimit -v {} 2>/dev/null; ",
            options.memory_limit_mb * 1024
        ));
    }
    shell_cmd.push_str(&format!(
        "exec {} {}",
        language.interpreter(),
        language.file_name()
    ));

    let mut cmd = tokio::process::Command::new("sh");
    cmd.args(["-c", &shell_cmd]);
    cmd.current_dir(workdir);
    cmd.kill_on_drop(true);
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    if !options.allow_network {
        // Black-hole proxy: TCP port 9 (discard) is never listening.
        for var in ["http_proxy", "https_proxy", "HTTP_PROXY", "HTTPS_PROXY"] {
            cmd.env(var, "http://127.0.0.1:9");
        }
        cmd.env_remove("no_proxy");
        cmd.env_remove("NO_PROXY");
    }
    if !options.allow_filesystem {
        // Soft containment: point writable locations at the workspace.
        cmd.env("HOME", workdir);
        cmd.env("TMPDIR", workdir);
    }

    let started = Instant::now();
    let child = cmd.spawn().map_err(|e| SandboxError::ExecutionFailed {
        session_id,
        reason: format!("failed to spawn runner: {}", e),
    })?;

    let output = match tokio::time::timeout(options.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(SandboxError::ExecutionFailed {
                session_id,
                reason: e.to_string(),
            });
        }
        Err(_) => {
            // Timed out: the dropped wait future kills the child.
            let elapsed = started.elapsed();
            tracing::warn!(session_id = %session_id, timeout = ?options.timeout, "Execution timed out");
            return Ok(ExecutionResult {
                success: false,
                output: String::new(),
                error: Some(format!(
                    "execution timed out after {}ms",
                    options.timeout.as_millis()
                )),
                logs: vec!["process killed: wall-clock timeout".to_string()],
                execution_time: elapsed,
            });
        }
    };

    let elapsed = started.elapsed();
    let (stdout, stdout_truncated) =
        truncate_output(String::from_utf8_lossy(&output.stdout).to_string());
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut logs: Vec<String> = stderr
        .lines()
        .take(MAX_LOG_LINES)
        .map(|l| l.to_string())
        .collect();
    if stdout_truncated {
        logs.push("stdout truncated at 64KB".to_string());
    }

    let exit_code = output.status.code().unwrap_or(-1);
    if output.status.success() {
        Ok(ExecutionResult {
            success: true,
            output: stdout,
            error: None,
            logs,
            execution_time: elapsed,
        })
    } else {
        // 137 = SIGKILL, the usual signature of the memory cap firing.
        let error = if exit_code == 137 || stderr.contains("MemoryError") {
            format!("memory limit exceeded ({} MB)", options.memory_limit_mb)
        } else {
            let tail = stderr.lines().rev().take(5).collect::<Vec<_>>();
            let tail = tail.into_iter().rev().collect::<Vec<_>>().join("\n");
            if tail.is_empty() {
                format!("process exited with code {}", exit_code)
            } else {
                tail
            }
        };
        Ok(ExecutionResult {
            success: false,
            output: stdout,
            error: Some(error),
            logs,
            execution_time: elapsed,
        })
    }
}
