//! Engine configuration sections

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Where a retried task re-enters its priority tier
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetryPlacement {
    /// Ahead of every queued peer with the same priority
    Head,
    /// Behind every queued peer with the same priority
    #[default]
    Tail,
}

/// Worker pool settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct PoolConfig {
    /// Number of concurrent execution slots
    pub size: usize,

    /// Restarts allowed per slot before it is retired
    pub max_restarts: u32,

    /// Only dequeue tasks of this type (None = any)
    pub worker_class: Option<String>,

    /// Idle slots re-check the queue at least this often (milliseconds)
    pub poll_interval_ms: u64,

    /// Placement of retried tasks within their priority tier
    pub retry_placement: RetryPlacement,

    /// Base delay before a retried task becomes eligible (milliseconds)
    pub retry_delay_ms: u64,

    /// Upper bound for the retry delay (milliseconds)
    pub max_retry_delay_ms: u64,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,

    /// Add up to 25% jitter to retry delays
    pub retry_jitter: bool,

    /// Retry budget for tasks submitted without one
    pub default_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            max_restarts: 3,
            worker_class: None,
            poll_interval_ms: 250,
            retry_placement: RetryPlacement::Tail,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            retry_jitter: true,
            default_retries: 2,
        }
    }
}

impl PoolConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Job runner settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct RunnerConfig {
    /// Directory under which per-attempt workspaces are created
    pub workspace_root: PathBuf,

    /// Timeout applied when a task does not specify one (milliseconds)
    pub default_timeout_ms: u64,

    /// Cap on buffered stdout/stderr per attempt (bytes)
    pub max_output_bytes: usize,

    /// Leave workspaces on disk after the attempt (debugging)
    pub keep_workspaces: bool,

    /// Override for the instruction template (minijinja syntax)
    pub instruction_template: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("task-mux").join("workspaces"),
            default_timeout_ms: 300_000,
            max_output_bytes: 1024 * 1024,
            keep_workspaces: false,
            instruction_template: None,
        }
    }
}

impl RunnerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// A named, weighted stage declaration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StageSpec {
    pub name: String,

    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl StageSpec {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Progress tracker settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProgressConfig {
    /// Number of trailing samples used for ETA estimation
    pub sample_window: usize,

    /// Stages used for tasks submitted without a stage list
    pub default_stages: Vec<StageSpec>,

    /// Finished tasks and workflows whose progress stays queryable; older
    /// entries (and finished workflow runs) are pruned
    pub retain_finished: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            sample_window: 10,
            default_stages: vec![
                StageSpec::new("analyze", 1.0),
                StageSpec::new("implement", 3.0),
                StageSpec::new("verify", 1.0),
            ],
            retain_finished: 1024,
        }
    }
}

/// Workflow engine settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkflowSettings {
    /// Directory searched for workflow templates
    pub templates_dir: Option<PathBuf>,

    /// Default expiry for approval gates (None = wait indefinitely)
    pub approval_timeout_ms: Option<u64>,
}

/// Result delivery settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct DeliveryConfig {
    /// Attempts per adapter before the result is cached for polling
    pub max_attempts: u32,

    /// Base delay between attempts (milliseconds)
    pub retry_delay_ms: u64,

    /// Webhook URLs that receive JSON result payloads
    pub webhooks: Vec<String>,

    /// HTTP timeout for webhook requests (seconds)
    pub timeout: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 500,
            webhooks: Vec::new(),
            timeout: 30,
        }
    }
}

/// Task store settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct StoreConfig {
    /// SQLite journal used for crash recovery (None = memory only)
    pub journal_path: Option<PathBuf>,
}
