//! Step executors
//!
//! Each step type maps to a [`StepExecutor`]. Executors receive a read-only
//! projection of the workflow context and return the step's output value;
//! the engine alone writes it back into the context.

use crate::config::{StageSpec, StepConfig, StepType};
use crate::error::{EngineFailure, ErrorKind};
use crate::shutdown::CancellationToken;
use crate::store::{StoreError, Task, TaskId, TaskSpec, TaskStatus, TaskStore};
use crate::template::{TemplateContext, TemplateEngine, TemplateError};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::WorkflowId;

/// Errors from executing a single step
#[derive(Debug, Error)]
pub enum StepError {
    #[error("task {task_id} {error}")]
    TaskFailed {
        task_id: TaskId,
        error: EngineFailure,
    },

    #[error("task {0} was cancelled")]
    TaskCancelled(TaskId),

    #[error("missing required field '{field}' for step '{step}'")]
    MissingField { step: String, field: String },

    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("task store error: {0}")]
    Store(#[from] StoreError),

    #[error("step '{step}' scheduled before dependency '{dependency}' completed")]
    DependencyNotMet { step: String, dependency: String },

    #[error("no executor registered for step type '{0}'")]
    NoExecutor(String),

    #[error("step panicked: {0}")]
    Panicked(String),
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::TaskFailed { error, .. } => error.kind,
            StepError::TaskCancelled(_) => ErrorKind::Cancelled,
            StepError::DependencyNotMet { .. } => ErrorKind::DependencyNotMet,
            _ => ErrorKind::ExecutionError,
        }
    }

    pub fn into_failure(self, step: &str) -> EngineFailure {
        let kind = self.kind();
        let diagnostics = match &self {
            StepError::TaskFailed { error, .. } => error.diagnostics.clone(),
            _ => None,
        };
        let failure = EngineFailure::new(kind, format!("step '{}' failed: {}", step, self));
        match diagnostics {
            Some(d) => failure.with_diagnostics(d),
            None => failure,
        }
    }
}

/// What a step executor sees
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow_id: WorkflowId,
    /// Projection of the workflow context onto the step's inputs
    pub inputs: Map<String, Value>,
}

impl StepContext {
    fn template_context(&self) -> TemplateContext {
        TemplateContext::from_map(self.inputs.clone())
    }
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: &StepConfig, ctx: StepContext) -> Result<Value, StepError>;
}

/// Step type to executor mapping
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<StepType, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the task, aggregate and report executors
    pub fn with_builtins(tasks: TaskStepExecutor) -> Self {
        let mut registry = Self::new();
        registry.register(StepType::Task, Arc::new(tasks));
        registry.register(StepType::Aggregate, Arc::new(AggregateStepExecutor));
        registry.register(StepType::Report, Arc::new(ReportStepExecutor::new()));
        registry
    }

    /// Register or replace the executor for a step type
    pub fn register(&mut self, step_type: StepType, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(step_type, executor);
    }

    pub fn get(&self, step_type: StepType) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(&step_type).cloned()
    }
}

/// Runs task steps through the shared task store, so the pool bounds them
pub struct TaskStepExecutor {
    store: Arc<TaskStore>,
    engine: TemplateEngine,
    default_retries: u32,
    default_stages: Vec<StageSpec>,
    task_type: String,
    shutdown: CancellationToken,
}

impl TaskStepExecutor {
    pub fn new(store: Arc<TaskStore>, default_retries: u32, default_stages: Vec<StageSpec>) -> Self {
        Self {
            store,
            engine: TemplateEngine::lenient(),
            default_retries,
            default_stages,
            task_type: "task".into(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Task type for steps that do not name one
    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    /// Stop waiting on step tasks (and cancel them) once `token` fires
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    fn build_spec(&self, step: &StepConfig, ctx: &StepContext) -> Result<TaskSpec, StepError> {
        let prompt = step.prompt.as_deref().ok_or_else(|| StepError::MissingField {
            step: step.id.clone(),
            field: "prompt".into(),
        })?;
        let prompt = self.engine.render_trimmed(prompt, &ctx.template_context())?;

        Ok(TaskSpec {
            task_type: step.task_type.clone().unwrap_or_else(|| self.task_type.clone()),
            prompt,
            context: ctx.inputs.clone(),
            payload: step.payload.clone(),
            priority: step.priority,
            timeout_ms: step.timeout_ms,
            retries: step.retries,
            stages: (!step.stages.is_empty()).then(|| step.stages.clone()),
        })
    }
}

/// Step output for a completed task
///
/// Base fields are overlaid with any JSON object the worker printed, so a
/// worker can report `"success": false` on a zero exit.
pub fn task_output(task: &Task) -> Value {
    let result = task.result.clone().unwrap_or_default();
    let mut output = json!({
        "success": true,
        "task_id": task.id.to_string(),
        "summary": result.summary,
        "output": result.output,
        "artifacts": result.artifacts,
        "duration_ms": result.duration_ms,
    });
    if let (Some(Value::Object(structured)), Some(base)) = (result.structured, output.as_object_mut()) {
        base.extend(structured);
    }
    output
}

#[async_trait]
impl StepExecutor for TaskStepExecutor {
    async fn execute(&self, step: &StepConfig, ctx: StepContext) -> Result<Value, StepError> {
        let spec = self.build_spec(step, &ctx)?;
        let task = Task::from_spec(spec, self.default_retries, &self.default_stages);
        let task_id = self.store.enqueue(task).await;
        tracing::info!(workflow_id = %ctx.workflow_id, step = %step.id, task_id = %task_id, "step task submitted");

        let task = tokio::select! {
            task = self.store.wait_terminal(task_id) => task?,
            _ = self.shutdown.cancelled() => {
                self.store.cancel(task_id).await;
                return Err(StepError::TaskCancelled(task_id));
            }
        };
        match task.status {
            TaskStatus::Completed => Ok(task_output(&task)),
            TaskStatus::Cancelled => Err(StepError::TaskCancelled(task_id)),
            _ => Err(StepError::TaskFailed {
                task_id,
                error: task
                    .error
                    .unwrap_or_else(|| EngineFailure::new(ErrorKind::ExecutionError, "failed")),
            }),
        }
    }
}

/// Collects context values into one object
///
/// When every input is an array, the arrays are also concatenated under
/// `items`.
pub struct AggregateStepExecutor;

#[async_trait]
impl StepExecutor for AggregateStepExecutor {
    async fn execute(&self, step: &StepConfig, ctx: StepContext) -> Result<Value, StepError> {
        // declared input order, not the map's key order
        let ordered: Vec<(String, Value)> = if step.inputs.is_empty() {
            ctx.inputs.into_iter().collect()
        } else {
            step.inputs
                .iter()
                .map(|k| (k.clone(), ctx.inputs.get(k).cloned().unwrap_or(Value::Null)))
                .collect()
        };

        let mut output = json!({
            "success": true,
            "count": ordered.iter().filter(|(_, v)| !v.is_null()).count(),
        });
        if !ordered.is_empty() && ordered.iter().all(|(_, v)| v.is_array()) {
            let items: Vec<Value> = ordered
                .iter()
                .filter_map(|(_, v)| v.as_array())
                .flatten()
                .cloned()
                .collect();
            output["items"] = Value::Array(items);
        }
        let values: Map<String, Value> = ordered.into_iter().collect();
        output["values"] = Value::Object(values);
        Ok(output)
    }
}

/// Renders a text report from context values
pub struct ReportStepExecutor {
    engine: TemplateEngine,
}

impl ReportStepExecutor {
    pub fn new() -> Self {
        Self {
            engine: TemplateEngine::lenient(),
        }
    }
}

impl Default for ReportStepExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for ReportStepExecutor {
    async fn execute(&self, step: &StepConfig, ctx: StepContext) -> Result<Value, StepError> {
        let template = step.template.as_deref().ok_or_else(|| StepError::MissingField {
            step: step.id.clone(),
            field: "template".into(),
        })?;
        let report = self.engine.render_trimmed(template, &ctx.template_context())?;
        Ok(json!({ "success": true, "report": report }))
    }
}
