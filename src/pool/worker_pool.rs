//! Worker slots, crash recovery and scaling

use super::{BackoffPolicy, PoolEvent, PoolStats};
use crate::config::PoolConfig;
use crate::error::{EngineFailure, ErrorKind};
use crate::progress::{ProgressTracker, ProgressUpdate};
use crate::runner::{JobError, TaskExecutor};
use crate::shutdown::CancellationToken;
use crate::store::{CancelOutcome, FailureOutcome, Task, TaskId, TaskResult, TaskStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

/// Slot accounting; `excess` slots retire as soon as they are idle
#[derive(Debug, Default)]
struct Capacity {
    live: usize,
    excess: usize,
}

impl Capacity {
    fn target(&self) -> usize {
        self.live.saturating_sub(self.excess)
    }
}

struct Shared {
    store: Arc<TaskStore>,
    executor: Arc<dyn TaskExecutor>,
    tracker: Arc<ProgressTracker>,
    config: PoolConfig,
    backoff: BackoffPolicy,
    events: broadcast::Sender<PoolEvent>,

    /// Cancellation handles for attempts in flight
    running: Mutex<HashMap<TaskId, CancellationToken>>,
    capacity: Mutex<Capacity>,
    shutdown: CancellationToken,

    next_slot: AtomicUsize,
    busy: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    restarts: AtomicU64,
}

impl Shared {
    fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }

    async fn try_retire(&self) -> bool {
        let mut capacity = self.capacity.lock().await;
        if capacity.excess > 0 {
            capacity.excess -= 1;
            capacity.live -= 1;
            true
        } else {
            false
        }
    }

    /// Remove a slot from the live count, returning what is left
    async fn release_slot(&self) -> usize {
        let mut capacity = self.capacity.lock().await;
        capacity.live = capacity.live.saturating_sub(1);
        capacity.live
    }

    async fn task_completed(&self, id: TaskId, slot: usize, result: TaskResult) {
        let duration_ms = result.duration_ms;
        let snapshot = serde_json::to_value(&result).ok();
        // Progress first, so waiters on the store see it finished
        if let Err(e) = self.tracker.complete(&id.to_string(), snapshot).await {
            tracing::debug!(task_id = %id, error = %e, "progress not completed");
        }
        match self.store.mark_completed(id, result).await {
            Ok(_) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(task_id = %id, slot, duration_ms, "task completed");
                self.emit(PoolEvent::TaskCompleted {
                    task_id: id,
                    slot,
                    duration_ms,
                });
            }
            Err(e) => tracing::warn!(task_id = %id, error = %e, "failed to record completion"),
        }
    }

    /// Route a failed attempt through the store's retry budget
    async fn task_failed(&self, id: TaskId, attempt: u32, failure: EngineFailure) {
        let delay = self.backoff.delay_for_retry(attempt.saturating_sub(1));
        let outcome = self
            .store
            .retry_or_fail(id, failure.clone(), self.config.retry_placement, delay)
            .await;

        match outcome {
            Ok(FailureOutcome::Retrying { retries_remaining }) => {
                tracing::warn!(
                    task_id = %id,
                    attempt,
                    retries_remaining,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "attempt failed, retrying"
                );
                let update = ProgressUpdate::default()
                    .with_message(format!("attempt {} failed: {}", attempt, failure.kind));
                let _ = self.tracker.update(&id.to_string(), update).await;
                self.emit(PoolEvent::TaskRetrying {
                    task_id: id,
                    attempt,
                    retries_remaining,
                    delay_ms: delay.as_millis() as u64,
                    error: failure,
                });
            }
            Ok(FailureOutcome::Failed(failure)) => self.task_gave_up(id, attempt, failure).await,
            Ok(FailureOutcome::Cancelled) => self.task_cancelled(id).await,
            Err(e) => tracing::warn!(task_id = %id, error = %e, "failed to record failure"),
        }
    }

    async fn task_gave_up(&self, id: TaskId, attempt: u32, failure: EngineFailure) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        tracing::error!(task_id = %id, attempt, error = %failure, "task failed");
        let _ = self.tracker.fail(&id.to_string(), failure.to_string()).await;
        self.emit(PoolEvent::TaskFailed {
            task_id: id,
            error: failure,
        });
    }

    async fn task_cancelled(&self, id: TaskId) {
        tracing::info!(task_id = %id, "task cancelled");
        let _ = self.tracker.fail(&id.to_string(), "cancelled").await;
        self.emit(PoolEvent::TaskCancelled { task_id: id });
    }
}

/// How an attempt ended from the slot's point of view
enum Attempt {
    Finished(Result<TaskResult, JobError>),
    /// The attempt's task panicked or its process died unexpectedly
    Crashed(EngineFailure),
}

struct Slot {
    id: usize,
    restarts: u32,
    shared: Arc<Shared>,
}

impl Slot {
    async fn run(mut self) {
        let shared = self.shared.clone();
        let class = shared.config.worker_class.clone();
        let poll = shared.config.poll_interval();
        tracing::debug!(slot = self.id, "slot started");

        loop {
            if shared.shutdown.is_cancelled() {
                shared.release_slot().await;
                break;
            }
            if shared.try_retire().await {
                tracing::info!(slot = self.id, "slot retired after scale-down");
                shared.emit(PoolEvent::SlotRetired {
                    slot: self.id,
                    reason: "scaled down".into(),
                });
                break;
            }

            let next = tokio::select! {
                task = shared.store.dequeue_wait(class.as_deref(), poll) => task,
                _ = shared.shutdown.cancelled() => continue,
            };
            let Some(task) = next else { continue };

            if !self.execute(task).await {
                break;
            }
        }
        tracing::debug!(slot = self.id, "slot stopped");
    }

    /// Run one attempt; returns false once the slot has been retired
    async fn execute(&mut self, task: Task) -> bool {
        let shared = self.shared.clone();
        let id = task.id;
        let attempt = task.attempts;
        let subject = id.to_string();

        shared.busy.fetch_add(1, Ordering::SeqCst);
        tracing::info!(task_id = %id, slot = self.id, attempt, task_type = %task.task_type, "dispatching task");
        shared.emit(PoolEvent::TaskStarted {
            task_id: id,
            slot: self.id,
            attempt,
        });

        // Retries keep their entry so progress stays monotonic across attempts
        if attempt <= 1 || shared.tracker.get(&subject).await.is_none() {
            shared.tracker.start_tracking(&subject, &task.stages).await;
        }

        let token = CancellationToken::new();
        shared.running.lock().await.insert(id, token.clone());
        // A cancel that arrived between dequeue and registration
        if shared.store.get(id).await.is_some_and(|t| t.cancel_requested) {
            token.cancel();
        }

        let executor = shared.executor.clone();
        let handle = tokio::spawn(async move { executor.execute(&task, token).await });
        let outcome = match handle.await {
            Ok(Err(e @ JobError::Crashed { .. })) => Attempt::Crashed(e.into_failure()),
            Ok(result) => Attempt::Finished(result),
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    "worker slot panicked"
                } else {
                    "worker slot aborted"
                };
                Attempt::Crashed(EngineFailure::new(ErrorKind::WorkerCrashed, message))
            }
        };
        shared.running.lock().await.remove(&id);

        let keep_running = match outcome {
            Attempt::Finished(Ok(result)) => {
                shared.task_completed(id, self.id, result).await;
                true
            }
            Attempt::Finished(Err(JobError::Cancelled)) => {
                match shared.store.mark_cancelled(id).await {
                    Ok(_) => shared.task_cancelled(id).await,
                    Err(e) => tracing::warn!(task_id = %id, error = %e, "failed to record cancellation"),
                }
                true
            }
            Attempt::Finished(Err(e)) => {
                shared.task_failed(id, attempt, e.into_failure()).await;
                true
            }
            Attempt::Crashed(failure) => self.recover(id, attempt, failure).await,
        };

        shared.busy.fetch_sub(1, Ordering::SeqCst);
        keep_running
    }

    /// Requeue the crashed task, then restart the slot or retire it once
    /// its restart cap is exceeded
    ///
    /// The task has its own crash cap (`max_restarts` as well) and fails for
    /// good once it is exceeded.
    async fn recover(&mut self, id: TaskId, attempt: u32, failure: EngineFailure) -> bool {
        let shared = self.shared.clone();
        self.restarts += 1;
        shared.restarts.fetch_add(1, Ordering::Relaxed);

        tracing::warn!(task_id = %id, slot = self.id, restarts = self.restarts, error = %failure, "slot crashed");
        match shared
            .store
            .requeue_crashed(
                id,
                failure,
                shared.config.retry_placement,
                shared.config.max_restarts,
            )
            .await
        {
            Ok(FailureOutcome::Cancelled) => shared.task_cancelled(id).await,
            Ok(FailureOutcome::Failed(failure)) => shared.task_gave_up(id, attempt, failure).await,
            Ok(FailureOutcome::Retrying { .. }) => {}
            Err(e) => tracing::warn!(task_id = %id, error = %e, "failed to requeue crashed task"),
        }

        if self.restarts > shared.config.max_restarts {
            let capacity = shared.release_slot().await;
            tracing::error!(
                slot = self.id,
                restarts = self.restarts,
                capacity,
                "slot exceeded restart limit, pool degraded"
            );
            shared.emit(PoolEvent::SlotRetired {
                slot: self.id,
                reason: format!("{} restarts", self.restarts),
            });
            shared.emit(PoolEvent::Degraded { capacity });
            return false;
        }

        shared.emit(PoolEvent::SlotRestarted {
            slot: self.id,
            restarts: self.restarts,
        });
        true
    }
}

fn spawn_slot(shared: &Arc<Shared>) -> JoinHandle<()> {
    let slot = Slot {
        id: shared.next_slot.fetch_add(1, Ordering::Relaxed),
        restarts: 0,
        shared: shared.clone(),
    };
    tokio::spawn(slot.run())
}

/// Fixed-size pool of execution slots
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `config.size` slots pulling from `store`
    pub fn start(
        store: Arc<TaskStore>,
        executor: Arc<dyn TaskExecutor>,
        tracker: Arc<ProgressTracker>,
        config: PoolConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let size = config.size;
        let shared = Arc::new(Shared {
            store,
            executor,
            tracker,
            backoff: BackoffPolicy::from_config(&config),
            config,
            events,
            running: Mutex::new(HashMap::new()),
            capacity: Mutex::new(Capacity {
                live: size,
                excess: 0,
            }),
            shutdown: CancellationToken::new(),
            next_slot: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        });

        let handles = (0..size).map(|_| spawn_slot(&shared)).collect();
        tracing::info!(size, "worker pool started");
        Self {
            shared,
            handles: Mutex::new(handles),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    pub async fn stats(&self) -> PoolStats {
        let live = self.shared.capacity.lock().await.live;
        let busy = self.shared.busy.load(Ordering::SeqCst);
        PoolStats {
            size: live,
            idle: live.saturating_sub(busy),
            busy,
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            restarts: self.shared.restarts.load(Ordering::Relaxed),
        }
    }

    /// Resize the pool
    ///
    /// Growing adds slots immediately. Shrinking marks slots for retirement;
    /// busy slots finish their current task first.
    pub async fn scale(&self, new_size: usize) {
        let mut handles = self.handles.lock().await;
        let from = {
            let mut capacity = self.shared.capacity.lock().await;
            let current = capacity.target();
            if new_size > current {
                let mut to_add = new_size - current;
                let reclaimed = capacity.excess.min(to_add);
                capacity.excess -= reclaimed;
                to_add -= reclaimed;
                capacity.live += to_add;
                for _ in 0..to_add {
                    handles.push(spawn_slot(&self.shared));
                }
            } else if new_size < current {
                capacity.excess += current - new_size;
            }
            current
        };
        handles.retain(|h| !h.is_finished());
        drop(handles);

        if new_size < from {
            self.shared.store.wake_all();
        }
        tracing::info!(from, to = new_size, "worker pool scaled");
        self.shared.emit(PoolEvent::Scaled { from, to: new_size });
    }

    /// Cancel a task: queued tasks are dropped, running attempts are terminated
    pub async fn cancel(&self, id: TaskId) -> CancelOutcome {
        let outcome = self.shared.store.cancel(id).await;
        match outcome {
            CancelOutcome::Running => {
                if let Some(token) = self.shared.running.lock().await.get(&id) {
                    token.cancel();
                }
            }
            CancelOutcome::Removed => self.shared.task_cancelled(id).await,
            CancelOutcome::AlreadyTerminal(_) | CancelOutcome::NotFound => {}
        }
        outcome
    }

    /// Stop dispatching and wait for in-flight attempts to finish
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.store.wake_all();
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "slot ended abnormally");
            }
        }
        tracing::info!("worker pool stopped");
    }
}
