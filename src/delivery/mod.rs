//! Result delivery
//!
//! Finished task and workflow results are fanned out to registered
//! [`ResultDelivery`] adapters. Each adapter gets a bounded number of
//! attempts with exponential backoff; a result any adapter could not take
//! is kept for polling.

mod webhook;

pub use webhook::WebhookDelivery;

use crate::config::DeliveryConfig;
use crate::error::EngineFailure;
use crate::store::{Task, TaskStatus};
use crate::workflow::{Workflow, WorkflowStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("delivery adapter error: {0}")]
    Adapter(String),
}

/// What an adapter did with a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Transient failure; worth another attempt
    Retry(String),
    /// Permanent refusal; not retried
    Rejected(String),
}

/// Whether a payload describes a task or a workflow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    #[default]
    Task,
    Workflow,
}

/// Result payload handed to adapters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub id: String,
    pub kind: SubjectKind,
    pub status: String,
    pub success: bool,
    pub duration_ms: u64,
    pub summary: String,
    pub output: String,
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineFailure>,

    /// Structured result (workflow context, parsed task JSON)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl DeliveryPayload {
    pub fn from_task(task: &Task) -> Self {
        let result = task.result.clone().unwrap_or_default();
        Self {
            id: task.id.to_string(),
            kind: SubjectKind::Task,
            status: task.status.as_str().to_string(),
            success: task.status == TaskStatus::Completed,
            duration_ms: task.duration_ms().unwrap_or(result.duration_ms),
            summary: result.summary,
            output: result.output,
            artifacts: result.artifacts,
            error: task.error.clone(),
            result: result.structured,
        }
    }

    pub fn from_workflow(workflow: &Workflow) -> Self {
        let duration_ms = workflow
            .completed_at
            .map(|end| (end - workflow.created_at).num_milliseconds().max(0) as u64)
            .unwrap_or_default();
        let done = workflow.completed_steps.len();
        let summary = match &workflow.error {
            Some(error) => format!("workflow '{}' {}: {}", workflow.template_id, workflow.status, error),
            None => format!(
                "workflow '{}' {} ({}/{} steps)",
                workflow.template_id,
                workflow.status,
                done,
                workflow.steps.len()
            ),
        };
        let artifacts = workflow
            .steps
            .iter()
            .filter_map(|s| s.output.as_ref())
            .filter_map(|o| o.get("artifacts").and_then(Value::as_array))
            .flatten()
            .filter_map(|a| a.as_str().map(String::from))
            .collect();

        Self {
            id: workflow.id.to_string(),
            kind: SubjectKind::Workflow,
            status: workflow.status.as_str().to_string(),
            success: workflow.status == WorkflowStatus::Completed,
            duration_ms,
            summary,
            output: String::new(),
            artifacts,
            error: workflow.error.clone(),
            result: Some(Value::Object(workflow.context.clone())),
        }
    }
}

/// A destination for finished results
#[async_trait]
pub trait ResultDelivery: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, payload: &DeliveryPayload) -> Result<DeliveryOutcome, DeliveryError>;
}

/// What happened to one payload across all adapters
#[derive(Debug, Default, PartialEq)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    /// Adapter name and the last reason it gave
    pub failed: Vec<(String, String)>,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Fans results out to adapters and keeps what could not be delivered
pub struct DeliveryManager {
    adapters: Vec<Arc<dyn ResultDelivery>>,
    max_attempts: u32,
    retry_delay: Duration,
    undelivered: RwLock<HashMap<String, DeliveryPayload>>,
}

impl DeliveryManager {
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            adapters: Vec::new(),
            max_attempts: max_attempts.max(1),
            retry_delay,
            undelivered: RwLock::new(HashMap::new()),
        }
    }

    /// Manager with one webhook adapter per configured URL
    pub fn from_config(config: &DeliveryConfig) -> Result<Self, DeliveryError> {
        let mut manager = Self::new(config.max_attempts, Duration::from_millis(config.retry_delay_ms));
        for url in &config.webhooks {
            let hook = WebhookDelivery::new(url.clone(), Duration::from_secs(config.timeout))?;
            manager.register(Arc::new(hook));
        }
        Ok(manager)
    }

    pub fn register(&mut self, adapter: Arc<dyn ResultDelivery>) {
        self.adapters.push(adapter);
    }

    pub fn has_adapters(&self) -> bool {
        !self.adapters.is_empty()
    }

    /// Deliver a payload to every adapter
    pub async fn deliver(&self, payload: DeliveryPayload) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for adapter in &self.adapters {
            match self.deliver_to(adapter.as_ref(), &payload).await {
                Ok(()) => report.delivered.push(adapter.name().to_string()),
                Err(reason) => {
                    tracing::warn!(id = %payload.id, adapter = adapter.name(), reason = %reason, "result not delivered");
                    report.failed.push((adapter.name().to_string(), reason));
                }
            }
        }

        if !report.is_complete() {
            self.undelivered
                .write()
                .await
                .insert(payload.id.clone(), payload);
        }
        report
    }

    async fn deliver_to(&self, adapter: &dyn ResultDelivery, payload: &DeliveryPayload) -> Result<(), String> {
        let mut last_reason = String::new();
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let delay = self.retry_delay.saturating_mul(1 << (attempt - 2).min(16));
                tokio::time::sleep(delay).await;
            }

            match adapter.deliver(payload).await {
                Ok(DeliveryOutcome::Delivered) => {
                    tracing::debug!(id = %payload.id, adapter = adapter.name(), attempt, "result delivered");
                    return Ok(());
                }
                Ok(DeliveryOutcome::Rejected(reason)) => return Err(reason),
                Ok(DeliveryOutcome::Retry(reason)) => last_reason = reason,
                Err(e) => last_reason = e.to_string(),
            }
            tracing::debug!(id = %payload.id, adapter = adapter.name(), attempt, reason = %last_reason, "delivery attempt failed");
        }
        Err(format!("gave up after {} attempts: {}", self.max_attempts, last_reason))
    }

    /// A cached result that could not be delivered
    pub async fn undelivered(&self, id: &str) -> Option<DeliveryPayload> {
        self.undelivered.read().await.get(id).cloned()
    }

    /// Remove and return a cached result once the caller has it
    pub async fn take_undelivered(&self, id: &str) -> Option<DeliveryPayload> {
        self.undelivered.write().await.remove(id)
    }

    pub async fn undelivered_count(&self) -> usize {
        self.undelivered.read().await.len()
    }
}
