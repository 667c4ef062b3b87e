//! Bounded worker pool
//!
//! A fixed number of slots pull tasks from the store and run them through
//! a [`TaskExecutor`](crate::runner::TaskExecutor). Each attempt runs in
//! its own tokio task so a panic or a killed worker process only costs the
//! slot a restart, never the pool.

mod retry;
mod worker_pool;

pub use retry::BackoffPolicy;
pub use worker_pool::WorkerPool;

use crate::error::EngineFailure;
use crate::store::TaskId;
use serde::{Deserialize, Serialize};

/// Snapshot of pool activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Live slots
    pub size: usize,
    pub idle: usize,
    pub busy: usize,
    /// Tasks completed successfully
    pub completed: u64,
    /// Tasks that failed terminally
    pub failed: u64,
    /// Slot restarts after crashed attempts
    pub restarts: u64,
}

/// Lifecycle events published by the pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    TaskStarted {
        task_id: TaskId,
        slot: usize,
        attempt: u32,
    },
    TaskCompleted {
        task_id: TaskId,
        slot: usize,
        duration_ms: u64,
    },
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        retries_remaining: u32,
        delay_ms: u64,
        error: EngineFailure,
    },
    TaskFailed {
        task_id: TaskId,
        error: EngineFailure,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    SlotRestarted {
        slot: usize,
        restarts: u32,
    },
    SlotRetired {
        slot: usize,
        reason: String,
    },
    /// A slot was lost to repeated crashes
    Degraded {
        capacity: usize,
    },
    Scaled {
        from: usize,
        to: usize,
    },
}

impl PoolEvent {
    /// Task the event concerns, if any
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            PoolEvent::TaskStarted { task_id, .. }
            | PoolEvent::TaskCompleted { task_id, .. }
            | PoolEvent::TaskRetrying { task_id, .. }
            | PoolEvent::TaskFailed { task_id, .. }
            | PoolEvent::TaskCancelled { task_id } => Some(*task_id),
            _ => None,
        }
    }
}
