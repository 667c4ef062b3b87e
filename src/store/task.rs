//! Task records and identifiers

use crate::config::StageSpec;
use crate::error::EngineFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default priority for tasks submitted without one
pub const DEFAULT_PRIORITY: i32 = 5;

/// Unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    /// Failed an attempt and is queued for another
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Waiting in the queue for a slot
    pub fn is_queued(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retrying)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "retrying" => Ok(TaskStatus::Retrying),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// A task submission
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task type, matched against a slot's worker class
    #[serde(rename = "type")]
    pub task_type: String,

    /// Instruction for the worker
    pub prompt: String,

    /// Values rendered into the instruction
    #[serde(default)]
    pub context: Map<String, Value>,

    /// Workspace inputs (`files`, `template_dir`, `repository`)
    #[serde(default)]
    pub payload: Map<String, Value>,

    pub priority: Option<i32>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub stages: Option<Vec<StageSpec>>,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Successful outcome of a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub summary: String,
    pub output: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub duration_ms: u64,

    /// JSON object found in the worker output, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
}

/// A task as held by the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub priority: i32,
    pub prompt: String,
    pub context: Map<String, Value>,
    pub payload: Map<String, Value>,
    pub stages: Vec<StageSpec>,
    pub timeout_ms: Option<u64>,

    pub status: TaskStatus,
    pub retries_remaining: u32,

    /// Execution attempts started so far
    pub attempts: u32,

    /// Attempts lost to a crashed slot; these do not spend retries
    #[serde(default)]
    pub crashes: u32,

    /// Cancellation requested while running
    #[serde(default)]
    pub cancel_requested: bool,

    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<TaskResult>,

    /// Terminal error, or the last attempt's error while retrying
    pub error: Option<EngineFailure>,
}

impl Task {
    /// Build a pending task from a submission
    pub fn from_spec(spec: TaskSpec, default_retries: u32, default_stages: &[StageSpec]) -> Self {
        Self {
            id: TaskId::new(),
            task_type: spec.task_type,
            priority: spec.priority.unwrap_or(DEFAULT_PRIORITY),
            prompt: spec.prompt,
            context: spec.context,
            payload: spec.payload,
            stages: spec.stages.unwrap_or_else(|| default_stages.to_vec()),
            timeout_ms: spec.timeout_ms,
            status: TaskStatus::Pending,
            retries_remaining: spec.retries.unwrap_or(default_retries),
            attempts: 0,
            crashes: 0,
            cancel_requested: false,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Wall-clock duration of the latest attempt, if it has ended
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let ended = self.completed_at?;
        Some((ended - started).num_milliseconds().max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_id_roundtrip_text() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<TaskId>().is_err());
    }

    #[test]
    fn test_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
        assert!(TaskStatus::Retrying.is_queued());
        assert!(!TaskStatus::Running.is_queued());
    }

    #[test]
    fn test_from_spec_defaults() {
        let spec = TaskSpec::new("analysis", "Find bugs").with_context("repo", json!("acme"));
        let stages = vec![StageSpec::new("only", 1.0)];
        let task = Task::from_spec(spec, 2, &stages);

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, DEFAULT_PRIORITY);
        assert_eq!(task.retries_remaining, 2);
        assert_eq!(task.stages, stages);
        assert_eq!(task.context["repo"], "acme");
    }

    #[test]
    fn test_spec_deserialize() {
        let spec: TaskSpec = serde_json::from_value(json!({
            "type": "analysis",
            "prompt": "Analyze",
            "retries": 2,
            "timeout_ms": 5000
        }))
        .unwrap();
        assert_eq!(spec.task_type, "analysis");
        assert_eq!(spec.retries, Some(2));
        assert_eq!(spec.timeout_ms, Some(5000));
    }
}
