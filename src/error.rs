//! Error taxonomy shared by every engine component

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Categories of failure the engine reports to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Not retryable - environment or resource problem
    WorkspaceError,

    // Retryable - transient failures
    Timeout,
    ExecutionError,
    WorkerCrashed,

    // Fatal - template defect
    WorkflowDeadlock,

    // Internal scheduling guard, reaching a caller means an engine bug
    DependencyNotMet,

    Cancelled,
}

impl ErrorKind {
    /// Returns true if a task failing with this kind may be attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::ExecutionError | ErrorKind::WorkerCrashed
        )
    }

    /// Wire name used in status reports and delivery payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::WorkspaceError => "workspace_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ExecutionError => "execution_error",
            ErrorKind::WorkerCrashed => "worker_crashed",
            ErrorKind::WorkflowDeadlock => "workflow_deadlock",
            ErrorKind::DependencyNotMet => "dependency_not_met",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure as recorded on a task or workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct EngineFailure {
    pub kind: ErrorKind,
    pub message: String,

    /// Captured diagnostic output (stderr tail for execution errors)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl EngineFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            diagnostics: None,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        let diagnostics = diagnostics.into();
        if !diagnostics.is_empty() {
            self.diagnostics = Some(diagnostics);
        }
        self
    }

    pub fn timeout(elapsed: Duration) -> Self {
        Self::new(ErrorKind::Timeout, format!("timeout after {:?}", elapsed))
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}
