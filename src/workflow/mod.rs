//! Workflow engine for task-mux
//!
//! A workflow is an instance of a [`WorkflowTemplate`](crate::config::WorkflowTemplate):
//! a DAG of steps run in rounds. Each round executes every ready step
//! concurrently and waits for all of them before planning the next one.
//! Task steps go through the shared task store, so a wide round is bounded
//! by the worker pool like any other work.
//!
//! # Example
//!
//! ```ignore
//! use task_mux::workflow::{ExecutorRegistry, StartOptions, WorkflowEngine};
//!
//! let engine = WorkflowEngine::new(registry, tracker, settings);
//! let id = engine.start(template, StartOptions::default()).await?;
//! let workflow = engine.wait(id).await?;
//! ```

mod approval;
mod engine;
mod executor;
mod state;

pub use approval::ApprovalDecision;
pub use engine::{StartOptions, WorkflowCallback, WorkflowEngine};
pub use executor::{
    AggregateStepExecutor, ExecutorRegistry, ReportStepExecutor, StepContext, StepError,
    StepExecutor, TaskStepExecutor, task_output,
};
pub use state::{
    PendingApproval, RoundPlan, StepState, StepStatus, Workflow, WorkflowId, WorkflowStatus,
};

use crate::error::EngineFailure;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from workflow engine operations
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow not found: {0}")]
    NotFound(WorkflowId),

    #[error("invalid workflow template '{template}': {}", errors.join("; "))]
    InvalidTemplate {
        template: String,
        errors: Vec<String>,
    },

    #[error("workflow template '{id}' could not be loaded: {message}")]
    TemplateNotFound { id: String, message: String },

    #[error("workflow {0} has no pending approval")]
    NoPendingApproval(WorkflowId),

    #[error("workflow {id} is already {status}")]
    NotRunning { id: WorkflowId, status: WorkflowStatus },
}

/// Lifecycle events published by the workflow engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Started {
        workflow_id: WorkflowId,
        template_id: String,
    },
    StepStarted {
        workflow_id: WorkflowId,
        step: String,
    },
    StepCompleted {
        workflow_id: WorkflowId,
        step: String,
    },
    StepSkipped {
        workflow_id: WorkflowId,
        step: String,
        reason: String,
    },
    StepFailed {
        workflow_id: WorkflowId,
        step: String,
        error: EngineFailure,
    },
    ApprovalRequested {
        workflow_id: WorkflowId,
        step: String,
        message: Option<String>,
    },
    ApprovalResolved {
        workflow_id: WorkflowId,
        step: String,
        approved: bool,
        comment: Option<String>,
    },
    Completed {
        workflow_id: WorkflowId,
    },
    Failed {
        workflow_id: WorkflowId,
        error: EngineFailure,
    },
    Cancelled {
        workflow_id: WorkflowId,
    },
}

impl WorkflowEvent {
    pub fn workflow_id(&self) -> WorkflowId {
        match self {
            WorkflowEvent::Started { workflow_id, .. }
            | WorkflowEvent::StepStarted { workflow_id, .. }
            | WorkflowEvent::StepCompleted { workflow_id, .. }
            | WorkflowEvent::StepSkipped { workflow_id, .. }
            | WorkflowEvent::StepFailed { workflow_id, .. }
            | WorkflowEvent::ApprovalRequested { workflow_id, .. }
            | WorkflowEvent::ApprovalResolved { workflow_id, .. }
            | WorkflowEvent::Completed { workflow_id }
            | WorkflowEvent::Failed { workflow_id, .. }
            | WorkflowEvent::Cancelled { workflow_id } => *workflow_id,
        }
    }

    /// True for the last event a workflow publishes
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::Completed { .. }
                | WorkflowEvent::Failed { .. }
                | WorkflowEvent::Cancelled { .. }
        )
    }
}
