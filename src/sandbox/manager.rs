//! Session pool and execution entry points.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use uuid::Uuid;

use crate::config::{SandboxConfig, SessionOptions};
use crate::error::SandboxError;
use crate::sandbox::session::{
    run_program, ExecutionResult, Language, SessionState, SessionStatus,
};

struct Session {
    options: SessionOptions,
    /// Owns the on-disk workspace; removed when the session is dropped.
    workdir: tempfile::TempDir,
    created: Instant,
    last_used: Instant,
    executions: u32,
    cpu_time: Duration,
    memory_peak_kb: u64,
    /// Held for the session lifetime so the pool bound is enforced by drop.
    _permit: OwnedSemaphorePermit,
}

/// Pooled sandbox. Sessions are isolated workspaces; executions within one
/// run under its resource limits.
pub struct SandboxManager {
    config: SandboxConfig,
    sessions: RwLock<HashMap<Uuid, Session>>,
    permits: Arc<Semaphore>,
}

impl SandboxManager {
    pub fn new(config: SandboxConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_sessions.max(1)));
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            permits,
        }
    }

    /// Create a session, failing fast when the pool is full.
    pub async fn create_session(
        &self,
        options: Option<SessionOptions>,
    ) -> Result<Uuid, SandboxError> {
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| SandboxError::PoolExhausted {
                capacity: self.config.max_sessions,
            })?;

        let workdir = tempfile::tempdir()?;
        let id = Uuid::new_v4();
        let now = Instant::now();
        let session = Session {
            options: options.unwrap_or_else(|| self.config.defaults.clone()),
            workdir,
            created: now,
            last_used: now,
            executions: 0,
            cpu_time: Duration::ZERO,
            memory_peak_kb: 0,
            _permit: permit,
        };

        self.sessions.write().await.insert(id, session);
        tracing::info!(session_id = %id, "Sandbox session created");
        Ok(id)
    }

    /// Execute code inside an existing session.
    pub async fn execute_in_session(
        &self,
        session_id: Uuid,
        code: &str,
        language: Language,
    ) -> Result<ExecutionResult, SandboxError> {
        // Snapshot what the run needs; the lock is never held across the run.
        let (workdir, options): (PathBuf, SessionOptions) = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(&session_id)
                .ok_or(SandboxError::SessionNotFound { session_id })?;
            (session.workdir.path().to_path_buf(), session.options.clone())
        };

        let result = run_program(session_id, &workdir, &options, code, language).await?;

        {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(&session_id) {
                session.last_used = Instant::now();
                session.executions += 1;
                session.cpu_time += result.execution_time;
            }
        }

        tracing::debug!(
            session_id = %session_id,
            language = %language,
            success = result.success,
            elapsed_ms = result.execution_time.as_millis() as u64,
            "Sandbox execution finished"
        );
        Ok(result)
    }

    /// One-shot execution in an ephemeral session.
    pub async fn execute_code(
        &self,
        code: &str,
        language: Language,
        options: Option<SessionOptions>,
    ) -> Result<ExecutionResult, SandboxError> {
        let session_id = self.create_session(options).await?;
        let result = self.execute_in_session(session_id, code, language).await;
        self.close_session(session_id).await;
        result
    }

    /// Point-in-time status. Closed or unknown sessions report `Closed`.
    pub async fn session_status(&self, session_id: Uuid) -> SessionStatus {
        let sessions = self.sessions.read().await;
        match sessions.get(&session_id) {
            Some(session) => SessionStatus {
                state: SessionState::Active,
                uptime: session.created.elapsed(),
                memory_usage_kb: session.memory_peak_kb,
                cpu_time: session.cpu_time,
                executions: session.executions,
            },
            None => SessionStatus {
                state: SessionState::Closed,
                uptime: Duration::ZERO,
                memory_usage_kb: 0,
                cpu_time: Duration::ZERO,
                executions: 0,
            },
        }
    }

    /// Close a session and release its pool slot. Closing an unknown or
    /// already-closed session is a no-op.
    pub async fn close_session(&self, session_id: Uuid) {
        let removed = self.sessions.write().await.remove(&session_id);
        if removed.is_some() {
            tracing::info!(session_id = %session_id, "Sandbox session closed");
        }
    }

    /// Drop sessions past their TTL or idle bound. Returns how many closed.
    pub async fn reap_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, s| {
            let expired = s.created.elapsed() > self.config.session_ttl
                || s.last_used.elapsed() > self.config.idle_timeout;
            if expired {
                tracing::info!(session_id = %id, "Reaped expired sandbox session");
            }
            !expired
        });
        before - sessions.len()
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }
}
