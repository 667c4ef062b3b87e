//! Stage-weighted progress and ETA tracking
//!
//! Any in-flight unit of work (a task attempt or a whole workflow) is
//! tracked under a subject id. Overall progress is the weighted sum of its
//! stages and never decreases while the subject is running.

mod tracker;

pub use tracker::ProgressTracker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    /// Skipped workflow step, counts as done
    Skipped,
    Failed,
}

impl StageStatus {
    fn is_done(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStatus {
    Running,
    Completed,
    Failed,
}

/// One stage of a tracked subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub name: String,
    pub weight: f64,
    pub status: StageStatus,
    /// 0-100
    pub progress: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A point-in-time progress sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub timestamp: DateTime<Utc>,
    pub overall: f64,
}

/// Read-only view of a tracked subject
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub subject_id: String,
    pub status: TrackingStatus,
    pub stages: Vec<StageProgress>,
    pub current_stage: usize,
    /// 0-100
    pub overall: f64,
    pub message: Option<String>,

    /// Time left at the current rate; None when it cannot be estimated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<Duration>,
    pub estimated_completion: Option<DateTime<Utc>>,

    pub samples: Vec<ProgressSample>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ProgressSnapshot {
    pub fn current_stage_name(&self) -> Option<&str> {
        self.stages.get(self.current_stage).map(|s| s.name.as_str())
    }
}

/// An update reported for a running subject
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    /// Progress within the current stage (0-100)
    pub stage_progress: Option<f64>,

    /// Complete the current stage and start the next
    pub advance_stage: bool,

    /// Jump forward to the named stage, completing those before it
    pub stage: Option<String>,

    pub message: Option<String>,
}

impl ProgressUpdate {
    pub fn percent(progress: f64) -> Self {
        Self {
            stage_progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn advance() -> Self {
        Self {
            advance_stage: true,
            ..Default::default()
        }
    }

    pub fn enter_stage(name: impl Into<String>) -> Self {
        Self {
            stage: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Lifecycle events published by the tracker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started {
        subject_id: String,
        stages: Vec<String>,
    },
    Updated {
        subject_id: String,
        overall: f64,
        stage: Option<String>,
        message: Option<String>,
    },
    Completed {
        subject_id: String,
    },
    Failed {
        subject_id: String,
        overall: f64,
        error: String,
    },
}

impl ProgressEvent {
    pub fn subject_id(&self) -> &str {
        match self {
            ProgressEvent::Started { subject_id, .. }
            | ProgressEvent::Updated { subject_id, .. }
            | ProgressEvent::Completed { subject_id }
            | ProgressEvent::Failed { subject_id, .. } => subject_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("no progress tracked for '{0}'")]
    NotFound(String),

    #[error("progress for '{subject_id}' is no longer running ({status:?})")]
    NotRunning {
        subject_id: String,
        status: TrackingStatus,
    },

    #[error("unknown stage '{stage}' for '{subject_id}'")]
    UnknownStage { subject_id: String, stage: String },
}
