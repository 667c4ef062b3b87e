//! Task store - priority-ordered queue and authoritative task state
//!
//! The store is the only owner of task records. Every status change goes
//! through one of its methods while holding the store lock, so `dequeue`
//! and the running transition are a single atomic step. Journal writes
//! happen off the lock on a writer thread.

mod journal;
mod queue;
mod task;

pub use task::{DEFAULT_PRIORITY, Task, TaskId, TaskResult, TaskSpec, TaskStatus};

use crate::config::RetryPlacement;
use crate::error::{EngineFailure, ErrorKind};
use chrono::Utc;
use journal::{Journal, JournalWriter};
use queue::ReadyQueue;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::time::Instant;

/// Task store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("store dropped while waiting for task {0}")]
    Closed(TaskId),

    #[error("journal error: {message}")]
    Journal { message: String },

    #[error("journal error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Was queued; removed and now cancelled
    Removed,
    /// Is running; the owner of the attempt must terminate it
    Running,
    AlreadyTerminal(TaskStatus),
    NotFound,
}

/// What happened to a task after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Queued again for another attempt
    Retrying { retries_remaining: u32 },
    /// Terminal failure
    Failed(EngineFailure),
    /// Cancellation was requested during the attempt
    Cancelled,
}

struct Inner {
    tasks: HashMap<TaskId, Task>,
    queue: ReadyQueue,
    waiters: HashMap<TaskId, Vec<oneshot::Sender<Task>>>,
    journal: Option<JournalWriter>,
    /// Receives every terminal snapshot
    outcomes: Option<mpsc::UnboundedSender<Task>>,
}

impl Inner {
    fn task_mut(
        &mut self,
        id: TaskId,
        allowed: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<&mut Task, StoreError> {
        let task = self.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !allowed.contains(&task.status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: task.status,
                to,
            });
        }
        Ok(task)
    }

    /// Journal the snapshot; wake waiters and report it if it is terminal
    fn settle(&mut self, snapshot: Task) -> Task {
        if let Some(journal) = &self.journal {
            journal.record(snapshot.clone());
        }
        if snapshot.status.is_terminal() {
            for waiter in self.waiters.remove(&snapshot.id).unwrap_or_default() {
                let _ = waiter.send(snapshot.clone());
            }
            if let Some(outcomes) = &self.outcomes {
                if outcomes.send(snapshot.clone()).is_err() {
                    tracing::debug!(task_id = %snapshot.id, "outcome receiver gone");
                }
            }
        }
        snapshot
    }

    fn push(&mut self, task: &Task, placement: RetryPlacement, not_before: Option<Instant>) {
        match placement {
            RetryPlacement::Head => {
                self.queue
                    .push_head(task.id, task.priority, &task.task_type, not_before)
            }
            RetryPlacement::Tail => {
                self.queue
                    .push_tail(task.id, task.priority, &task.task_type, not_before)
            }
        }
    }
}

/// Priority task store
pub struct TaskStore {
    inner: Mutex<Inner>,
    work: Notify,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStore {
    /// In-memory store
    pub fn new() -> Self {
        Self::from_parts(HashMap::new(), ReadyQueue::new(), None)
    }

    /// Store journaling every transition to a SQLite file
    pub fn with_journal(path: &Path) -> Result<Self, StoreError> {
        let journal = JournalWriter::spawn(Journal::open(path)?)?;
        Ok(Self::from_parts(HashMap::new(), ReadyQueue::new(), Some(journal)))
    }

    /// Send a snapshot of every task that reaches a terminal status
    ///
    /// The channel is unbounded so no outcome is ever dropped.
    pub fn with_outcome_sink(mut self, sink: mpsc::UnboundedSender<Task>) -> Self {
        self.inner.get_mut().outcomes = Some(sink);
        self
    }

    /// Rebuild a store from a journal, re-queuing unfinished tasks
    ///
    /// Tasks interrupted while running go back to pending with their retry
    /// budget intact.
    pub fn recover(path: &Path) -> Result<Self, StoreError> {
        let journal = Journal::open(path)?;
        let mut tasks = HashMap::new();
        let mut queue = ReadyQueue::new();

        for mut task in journal.unfinished()? {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
                task.started_at = None;
            }
            task.cancel_requested = false;
            queue.push_tail(task.id, task.priority, &task.task_type, None);
            journal.record(&task)?;
            tasks.insert(task.id, task);
        }

        tracing::info!(recovered = tasks.len(), path = %path.display(), "recovered task journal");
        let journal = JournalWriter::spawn(journal)?;
        Ok(Self::from_parts(tasks, queue, Some(journal)))
    }

    fn from_parts(
        tasks: HashMap<TaskId, Task>,
        queue: ReadyQueue,
        journal: Option<JournalWriter>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks,
                queue,
                waiters: HashMap::new(),
                journal,
                outcomes: None,
            }),
            work: Notify::new(),
        }
    }

    /// Add a pending task at the tail of its priority tier
    pub async fn enqueue(&self, mut task: Task) -> TaskId {
        task.status = TaskStatus::Pending;
        let id = task.id;
        {
            let mut inner = self.inner.lock().await;
            inner.push(&task, RetryPlacement::Tail, None);
            inner.tasks.insert(id, task.clone());
            inner.settle(task);
        }
        tracing::debug!(task_id = %id, "task enqueued");
        self.work.notify_waiters();
        id
    }

    /// Take the next eligible task for a worker class and mark it running
    pub async fn dequeue(&self, worker_class: Option<&str>) -> Option<Task> {
        let mut inner = self.inner.lock().await;
        let id = inner.queue.pop(worker_class, Instant::now())?;
        Self::start_attempt(&mut inner, id)
    }

    /// Like `dequeue`, but waits up to `max_wait` for work to appear
    pub async fn dequeue_wait(&self, worker_class: Option<&str>, max_wait: Duration) -> Option<Task> {
        let notified = self.work.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(task) = self.dequeue(worker_class).await {
            return Some(task);
        }

        let deadline = Instant::now() + max_wait;
        let wake_at = {
            let inner = self.inner.lock().await;
            inner
                .queue
                .next_eligible_at(worker_class)
                .map_or(deadline, |t| t.min(deadline))
        };

        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep_until(wake_at) => {}
        }

        self.dequeue(worker_class).await
    }

    /// Claim a specific queued task
    pub async fn mark_running(&self, id: TaskId) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.task_mut(
            id,
            &[TaskStatus::Pending, TaskStatus::Retrying],
            TaskStatus::Running,
        )?;
        inner.queue.remove(id);
        Self::start_attempt(&mut inner, id).ok_or(StoreError::NotFound(id))
    }

    fn start_attempt(inner: &mut Inner, id: TaskId) -> Option<Task> {
        let task = inner.tasks.get_mut(&id)?;
        task.status = TaskStatus::Running;
        task.attempts += 1;
        task.started_at = Some(Utc::now());
        task.completed_at = None;
        let snapshot = task.clone();
        Some(inner.settle(snapshot))
    }

    pub async fn mark_completed(&self, id: TaskId, result: TaskResult) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock().await;
        let task = inner.task_mut(id, &[TaskStatus::Running], TaskStatus::Completed)?;
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.error = None;
        task.completed_at = Some(Utc::now());
        let snapshot = task.clone();
        Ok(inner.settle(snapshot))
    }

    /// Terminal failure regardless of remaining budget
    pub async fn mark_failed(&self, id: TaskId, failure: EngineFailure) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock().await;
        let task = inner.task_mut(
            id,
            &[TaskStatus::Running, TaskStatus::Pending, TaskStatus::Retrying],
            TaskStatus::Failed,
        )?;
        task.status = TaskStatus::Failed;
        task.error = Some(failure);
        task.completed_at = Some(Utc::now());
        let snapshot = task.clone();
        inner.queue.remove(id);
        Ok(inner.settle(snapshot))
    }

    /// Finish a running task whose cancellation was honoured
    pub async fn mark_cancelled(&self, id: TaskId) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock().await;
        let task = inner.task_mut(id, &[TaskStatus::Running], TaskStatus::Cancelled)?;
        Self::cancel_in_place(task);
        let snapshot = task.clone();
        Ok(inner.settle(snapshot))
    }

    fn cancel_in_place(task: &mut Task) {
        task.status = TaskStatus::Cancelled;
        task.error = Some(EngineFailure::new(ErrorKind::Cancelled, "task cancelled"));
        task.completed_at = Some(Utc::now());
    }

    /// Route a failed attempt: requeue while budget remains, else fail
    ///
    /// Non-retryable failures are terminal immediately.
    pub async fn retry_or_fail(
        &self,
        id: TaskId,
        failure: EngineFailure,
        placement: RetryPlacement,
        delay: Duration,
    ) -> Result<FailureOutcome, StoreError> {
        let outcome = {
            let mut inner = self.inner.lock().await;
            let task = inner.task_mut(id, &[TaskStatus::Running], TaskStatus::Retrying)?;

            if task.cancel_requested {
                Self::cancel_in_place(task);
                let snapshot = task.clone();
                inner.settle(snapshot);
                return Ok(FailureOutcome::Cancelled);
            }

            if failure.is_retryable() && task.retries_remaining > 0 {
                task.retries_remaining -= 1;
                task.status = TaskStatus::Retrying;
                task.error = Some(failure);
                task.completed_at = Some(Utc::now());
                let remaining = task.retries_remaining;
                let snapshot = task.clone();
                inner.push(&snapshot, placement, Some(Instant::now() + delay));
                inner.settle(snapshot);
                FailureOutcome::Retrying {
                    retries_remaining: remaining,
                }
            } else {
                task.status = TaskStatus::Failed;
                task.error = Some(failure.clone());
                task.completed_at = Some(Utc::now());
                let snapshot = task.clone();
                inner.settle(snapshot);
                FailureOutcome::Failed(failure)
            }
        };

        if matches!(outcome, FailureOutcome::Retrying { .. }) {
            self.work.notify_waiters();
        }
        Ok(outcome)
    }

    /// Requeue a task whose slot crashed, without spending retry budget
    ///
    /// A task that has crashed more than `max_crashes` times fails for good,
    /// so one poisonous task cannot retire every slot in turn.
    pub async fn requeue_crashed(
        &self,
        id: TaskId,
        failure: EngineFailure,
        placement: RetryPlacement,
        max_crashes: u32,
    ) -> Result<FailureOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let task = inner.task_mut(id, &[TaskStatus::Running], TaskStatus::Retrying)?;

        if task.cancel_requested {
            Self::cancel_in_place(task);
            let snapshot = task.clone();
            inner.settle(snapshot);
            return Ok(FailureOutcome::Cancelled);
        }

        task.crashes += 1;
        if task.crashes > max_crashes {
            let failure = EngineFailure::new(
                ErrorKind::WorkerCrashed,
                format!("worker crashed {} times: {}", task.crashes, failure.message),
            );
            task.status = TaskStatus::Failed;
            task.error = Some(failure.clone());
            task.completed_at = Some(Utc::now());
            let snapshot = task.clone();
            inner.settle(snapshot);
            return Ok(FailureOutcome::Failed(failure));
        }

        task.status = TaskStatus::Retrying;
        task.error = Some(failure);
        let remaining = task.retries_remaining;
        let snapshot = task.clone();
        inner.push(&snapshot, placement, None);
        inner.settle(snapshot);
        drop(inner);

        self.work.notify_waiters();
        Ok(FailureOutcome::Retrying {
            retries_remaining: remaining,
        })
    }

    /// Cancel a task: queued tasks are removed, running ones are flagged
    pub async fn cancel(&self, id: TaskId) -> CancelOutcome {
        let mut inner = self.inner.lock().await;
        let Some(task) = inner.tasks.get_mut(&id) else {
            return CancelOutcome::NotFound;
        };

        match task.status {
            status if status.is_terminal() => CancelOutcome::AlreadyTerminal(status),
            TaskStatus::Running => {
                task.cancel_requested = true;
                CancelOutcome::Running
            }
            _ => {
                Self::cancel_in_place(task);
                let snapshot = task.clone();
                inner.queue.remove(id);
                inner.settle(snapshot);
                CancelOutcome::Removed
            }
        }
    }

    pub async fn get(&self, id: TaskId) -> Option<Task> {
        self.inner.lock().await.tasks.get(&id).cloned()
    }

    /// Drop a terminal task from memory; the journal keeps its record
    pub async fn forget(&self, id: TaskId) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.tasks.get(&id) {
            Some(task) if task.status.is_terminal() => inner.tasks.remove(&id).is_some(),
            _ => false,
        }
    }

    /// Number of tasks waiting in the queue
    pub async fn size(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Task counts for every status
    pub async fn stats_by_status(&self) -> BTreeMap<TaskStatus, usize> {
        let inner = self.inner.lock().await;
        let mut stats: BTreeMap<TaskStatus, usize> = [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Retrying,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ]
        .into_iter()
        .map(|s| (s, 0))
        .collect();
        for task in inner.tasks.values() {
            *stats.entry(task.status).or_default() += 1;
        }
        stats
    }

    /// Resolve once the task reaches completed, failed or cancelled
    pub async fn wait_terminal(&self, id: TaskId) -> Result<Task, StoreError> {
        let receiver = {
            let mut inner = self.inner.lock().await;
            let task = inner.tasks.get(&id).ok_or(StoreError::NotFound(id))?;
            if task.status.is_terminal() {
                return Ok(task.clone());
            }
            let (sender, receiver) = oneshot::channel();
            inner.waiters.entry(id).or_default().push(sender);
            receiver
        };
        receiver.await.map_err(|_| StoreError::Closed(id))
    }

    /// Wake every slot blocked in `dequeue_wait`
    pub fn wake_all(&self) {
        self.work.notify_waiters();
    }
}
