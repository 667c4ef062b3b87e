//! Job runner - executes one task attempt in an isolated workspace
//!
//! An attempt prepares a workspace, writes the instruction to the worker's
//! stdin, streams its stdout for progress markers, and enforces the task
//! timeout. The workspace is removed and the process reaped on every exit
//! path.

mod instruction;
mod job;
pub mod markers;
mod workspace;

pub use instruction::{DEFAULT_INSTRUCTION_TEMPLATE, InstructionBuilder};
pub use job::JobRunner;
pub use workspace::Workspace;

use crate::error::{EngineFailure, ErrorKind};
use crate::shutdown::CancellationToken;
use crate::store::{Task, TaskResult};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors from a single execution attempt
#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("timeout after {elapsed:?}")]
    Timeout {
        elapsed: Duration,
        partial_output: Option<String>,
    },

    #[error("worker exited with code {exit_code:?}: {message}")]
    Execution {
        exit_code: Option<i32>,
        message: String,
        stderr: String,
    },

    /// The worker process died from a signal nobody sent it
    #[error("worker killed by signal {signal}")]
    Crashed { signal: i32, stderr: String },

    #[error("attempt cancelled")]
    Cancelled,

    #[error("instruction error: {0}")]
    Instruction(String),
}

impl JobError {
    pub fn workspace(message: impl Into<String>) -> Self {
        Self::Workspace(message.into())
    }

    pub fn execution(exit_code: Option<i32>, message: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Execution {
            exit_code,
            message: message.into(),
            stderr: stderr.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Workspace(_) | JobError::Instruction(_) => ErrorKind::WorkspaceError,
            JobError::Timeout { .. } => ErrorKind::Timeout,
            JobError::Execution { .. } => ErrorKind::ExecutionError,
            JobError::Crashed { .. } => ErrorKind::WorkerCrashed,
            JobError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Convert into the failure recorded on the task
    pub fn into_failure(self) -> EngineFailure {
        let kind = self.kind();
        let message = self.to_string();
        match self {
            JobError::Execution { stderr, .. } | JobError::Crashed { stderr, .. } => {
                EngineFailure::new(kind, message).with_diagnostics(stderr)
            }
            JobError::Timeout {
                partial_output: Some(partial),
                ..
            } => EngineFailure::new(kind, message).with_diagnostics(partial),
            _ => EngineFailure::new(kind, message),
        }
    }
}

/// Executes task attempts
///
/// The pool drives tasks through this trait so tests can substitute
/// scripted executors for the process-backed `JobRunner`.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one attempt of a task, honouring `cancel`
    async fn execute(&self, task: &Task, cancel: CancellationToken) -> Result<TaskResult, JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(JobError::workspace("x").kind(), ErrorKind::WorkspaceError);
        assert_eq!(
            JobError::Instruction("bad".into()).kind(),
            ErrorKind::WorkspaceError
        );
        assert_eq!(
            JobError::Timeout {
                elapsed: Duration::from_secs(1),
                partial_output: None
            }
            .kind(),
            ErrorKind::Timeout
        );
        assert_eq!(JobError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_execution_failure_carries_stderr() {
        let failure = JobError::execution(Some(2), "exit code 2", "boom").into_failure();
        assert_eq!(failure.kind, ErrorKind::ExecutionError);
        assert!(failure.is_retryable());
        assert_eq!(failure.diagnostics.as_deref(), Some("boom"));
    }

    #[test]
    fn test_crash_is_retryable() {
        let failure = JobError::Crashed {
            signal: 9,
            stderr: String::new(),
        }
        .into_failure();
        assert_eq!(failure.kind, ErrorKind::WorkerCrashed);
        assert!(failure.diagnostics.is_none());
    }
}
