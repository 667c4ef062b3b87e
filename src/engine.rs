//! Engine lifecycle object
//!
//! [`Engine`] owns every component: the task store, progress tracker, job
//! runner, worker pool, workflow engine and delivery manager. It fans the
//! components' event channels into one stream, hands finished results to
//! delivery, and tears everything down in order on [`Engine::shutdown`].

use crate::config::{EngineConfig, StepType, WorkflowTemplate, load_template};
use crate::delivery::{DeliveryError, DeliveryManager, DeliveryPayload, SubjectKind};
use crate::error::EngineFailure;
use crate::pool::{PoolEvent, PoolStats, WorkerPool};
use crate::progress::{ProgressEvent, ProgressTracker};
use crate::runner::{JobRunner, TaskExecutor};
use crate::shutdown::CancellationToken;
use crate::store::{CancelOutcome, StoreError, Task, TaskId, TaskSpec, TaskStatus, TaskStore};
use crate::workflow::{
    ApprovalDecision, ExecutorRegistry, PendingApproval, StartOptions, TaskStepExecutor, Workflow,
    WorkflowEngine, WorkflowError, WorkflowEvent, WorkflowId, WorkflowStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task store error: {0}")]
    Store(#[from] StoreError),

    #[error("delivery setup failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

/// Every component event, tagged with its source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", content = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Pool(PoolEvent),
    Workflow(WorkflowEvent),
    Progress(ProgressEvent),
}

/// Answer to a status query for a task or workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub id: String,
    pub kind: SubjectKind,
    pub status: String,

    /// Overall progress, 0-100
    pub progress: f64,
    pub stage: Option<String>,

    /// Remaining time estimate; absent until the progress rate is known
    #[serde(default, with = "duration_ms")]
    pub eta: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApproval>,

    /// Delivery adapters could not take the result; poll it here
    #[serde(default)]
    pub undelivered: bool,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Engine-wide counters
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub pool: PoolStats,
    pub queued: usize,
    pub tasks: BTreeMap<String, usize>,
    pub active_workflows: usize,
    pub undelivered: usize,
}

struct Shared {
    store: Arc<TaskStore>,
    workflows: Arc<WorkflowEngine>,
    tracker: Arc<ProgressTracker>,
    delivery: Arc<DeliveryManager>,
    events: broadcast::Sender<EngineEvent>,

    /// Tasks submitted directly, whose results go to delivery
    direct: RwLock<HashSet<TaskId>>,

    /// Finished subjects still held in memory, oldest first
    finished: Mutex<VecDeque<Finished>>,
    retain_finished: usize,
}

#[derive(Debug, Clone, Copy)]
enum Finished {
    Task(TaskId),
    Workflow(WorkflowId),
}

impl Shared {
    fn forward(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Payload for a terminal task, if it was submitted directly
    async fn task_finished(&self, task: &Task) -> Option<DeliveryPayload> {
        let direct = self.direct.write().await.remove(&task.id);
        self.retire(Finished::Task(task.id)).await;
        (direct && self.delivery.has_adapters()).then(|| DeliveryPayload::from_task(task))
    }

    async fn workflow_finished(&self, workflow: &Workflow) -> Option<DeliveryPayload> {
        self.retire(Finished::Workflow(workflow.id)).await;
        self.delivery
            .has_adapters()
            .then(|| DeliveryPayload::from_workflow(workflow))
    }

    /// Record a finished subject and drop the oldest beyond the retention bound
    async fn retire(&self, subject: Finished) {
        let evicted: Vec<Finished> = {
            let mut finished = self.finished.lock().await;
            finished.push_back(subject);
            let excess = finished.len().saturating_sub(self.retain_finished);
            finished.drain(..excess).collect()
        };

        for subject in evicted {
            match subject {
                Finished::Task(id) => {
                    self.store.forget(id).await;
                    self.tracker.remove(&id.to_string()).await;
                }
                Finished::Workflow(id) => {
                    self.workflows.forget(id).await;
                    self.tracker.remove(&id.to_string()).await;
                }
            }
            tracing::debug!(?subject, "finished subject pruned");
        }
    }
}

/// Receive from one component channel until `stop` fires
///
/// Events are advisory. Lagging here only loses notifications, never a
/// result; results arrive through [`deliver_outcomes`].
async fn forward_events<E: Clone + Send + 'static>(
    shared: Arc<Shared>,
    mut receiver: broadcast::Receiver<E>,
    wrap: fn(E) -> EngineEvent,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            received = receiver.recv() => match received {
                Ok(event) => shared.forward(wrap(event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = stop.cancelled() => break,
        }
    }
}

/// Hand every terminal task and workflow to delivery and retention
///
/// Fed by unbounded channels, so nothing is skipped under load. After
/// `stop` the channels are drained before in-flight deliveries are awaited.
async fn deliver_outcomes(
    shared: Arc<Shared>,
    mut tasks: mpsc::UnboundedReceiver<Task>,
    mut workflows: mpsc::UnboundedReceiver<Workflow>,
    stop: CancellationToken,
) {
    let mut deliveries = JoinSet::new();
    let spawn = |deliveries: &mut JoinSet<()>, payload: Option<DeliveryPayload>| {
        if let Some(payload) = payload {
            let delivery = shared.delivery.clone();
            deliveries.spawn(async move {
                delivery.deliver(payload).await;
            });
        }
    };

    loop {
        tokio::select! {
            Some(task) = tasks.recv() => {
                let payload = shared.task_finished(&task).await;
                spawn(&mut deliveries, payload);
            }
            Some(workflow) = workflows.recv() => {
                let payload = shared.workflow_finished(&workflow).await;
                spawn(&mut deliveries, payload);
            }
            Some(joined) = deliveries.join_next(), if !deliveries.is_empty() => {
                if let Err(e) = joined {
                    tracing::warn!(error = %e, "delivery task ended abnormally");
                }
            }
            _ = stop.cancelled() => break,
        }
    }

    while let Ok(task) = tasks.try_recv() {
        let payload = shared.task_finished(&task).await;
        spawn(&mut deliveries, payload);
    }
    while let Ok(workflow) = workflows.try_recv() {
        let payload = shared.workflow_finished(&workflow).await;
        spawn(&mut deliveries, payload);
    }
    while deliveries.join_next().await.is_some() {}
}

/// The task orchestration engine
pub struct Engine {
    config: EngineConfig,
    project_dir: Option<PathBuf>,
    shared: Arc<Shared>,
    tracker: Arc<ProgressTracker>,
    pool: WorkerPool,
    /// Stops task steps waiting on the store
    stopping: CancellationToken,
    /// Stops the event forwarders once everything else is down
    stop_forwarding: CancellationToken,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Start an engine running tasks through the configured external workers
    pub fn start(config: EngineConfig, project_dir: Option<PathBuf>) -> Result<Self, EngineError> {
        let tracker = Arc::new(ProgressTracker::new(config.progress.sample_window));
        let runner = JobRunner::from_config(&config, tracker.clone());
        let delivery = DeliveryManager::from_config(&config.delivery)?;
        Self::assemble(config, project_dir, Arc::new(runner), tracker, delivery)
    }

    /// Start an engine with a custom task executor
    pub fn with_executor(
        config: EngineConfig,
        project_dir: Option<PathBuf>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Self, EngineError> {
        let tracker = Arc::new(ProgressTracker::new(config.progress.sample_window));
        let delivery = DeliveryManager::from_config(&config.delivery)?;
        Self::assemble(config, project_dir, executor, tracker, delivery)
    }

    fn assemble(
        config: EngineConfig,
        project_dir: Option<PathBuf>,
        executor: Arc<dyn TaskExecutor>,
        tracker: Arc<ProgressTracker>,
        delivery: DeliveryManager,
    ) -> Result<Self, EngineError> {
        let (task_outcomes, task_rx) = mpsc::unbounded_channel();
        let (workflow_outcomes, workflow_rx) = mpsc::unbounded_channel();

        let store = match &config.store.journal_path {
            Some(path) => TaskStore::recover(path)?,
            None => TaskStore::new(),
        };
        let store = Arc::new(store.with_outcome_sink(task_outcomes));
        let delivery = Arc::new(delivery);

        let stopping = CancellationToken::new();
        let mut steps = TaskStepExecutor::new(
            store.clone(),
            config.pool.default_retries,
            config.progress.default_stages.clone(),
        )
        .with_shutdown(stopping.clone());
        if let Some(class) = &config.pool.worker_class {
            steps = steps.with_task_type(class.clone());
        }
        let workflows = Arc::new(
            WorkflowEngine::new(
                ExecutorRegistry::with_builtins(steps),
                tracker.clone(),
                config.workflow.clone(),
            )
            .with_outcome_sink(workflow_outcomes),
        );

        let pool = WorkerPool::start(store.clone(), executor, tracker.clone(), config.pool.clone());

        let (events, _) = broadcast::channel(1024);
        let shared = Arc::new(Shared {
            store,
            workflows: workflows.clone(),
            tracker: tracker.clone(),
            delivery,
            events,
            direct: RwLock::new(HashSet::new()),
            finished: Mutex::new(VecDeque::new()),
            retain_finished: config.progress.retain_finished,
        });

        let stop_forwarding = CancellationToken::new();
        let forwarders = vec![
            tokio::spawn(deliver_outcomes(
                shared.clone(),
                task_rx,
                workflow_rx,
                stop_forwarding.clone(),
            )),
            tokio::spawn(forward_events(
                shared.clone(),
                pool.subscribe(),
                EngineEvent::Pool,
                stop_forwarding.clone(),
            )),
            tokio::spawn(forward_events(
                shared.clone(),
                workflows.subscribe(),
                EngineEvent::Workflow,
                stop_forwarding.clone(),
            )),
            tokio::spawn(forward_events(
                shared.clone(),
                tracker.subscribe(),
                EngineEvent::Progress,
                stop_forwarding.clone(),
            )),
        ];

        tracing::info!(pool_size = config.pool.size, "engine started");
        Ok(Self {
            config,
            project_dir,
            shared,
            tracker,
            pool,
            stopping,
            stop_forwarding,
            forwarders: Mutex::new(forwarders),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    /// Queue a task; returns its id immediately
    pub async fn submit(&self, spec: TaskSpec) -> TaskId {
        let task = Task::from_spec(
            spec,
            self.config.pool.default_retries,
            &self.config.progress.default_stages,
        );
        if self.shared.delivery.has_adapters() {
            self.shared.direct.write().await.insert(task.id);
        }
        let id = self.shared.store.enqueue(task).await;
        tracing::info!(task_id = %id, "task submitted");
        id
    }

    /// Wait for a task to reach a terminal status
    pub async fn wait_task(&self, id: TaskId) -> Result<Task, StoreError> {
        self.shared.store.wait_terminal(id).await
    }

    /// Start a workflow from a template found by id
    pub async fn start_workflow(
        &self,
        template_id: &str,
        options: StartOptions,
    ) -> Result<WorkflowId, WorkflowError> {
        let template = load_template(template_id, self.project_dir.as_deref(), &self.config.workflow)
            .map_err(|e| WorkflowError::TemplateNotFound {
                id: template_id.to_string(),
                message: format!("{:#}", e),
            })?;
        self.start_workflow_template(template, options).await
    }

    /// Start a workflow; task steps must match the pool's worker class
    pub async fn start_workflow_template(
        &self,
        template: WorkflowTemplate,
        options: StartOptions,
    ) -> Result<WorkflowId, WorkflowError> {
        if let Some(class) = &self.config.pool.worker_class {
            let errors: Vec<String> = template
                .steps
                .iter()
                .filter(|step| step.step_type == StepType::Task)
                .filter_map(|step| {
                    let task_type = step.task_type.as_deref()?;
                    (task_type != class).then(|| {
                        format!(
                            "step '{}' has task_type '{}' but workers only take '{}'",
                            step.id, task_type, class
                        )
                    })
                })
                .collect();
            if !errors.is_empty() {
                return Err(WorkflowError::InvalidTemplate {
                    template: template.id,
                    errors,
                });
            }
        }
        self.shared.workflows.start(template, options).await
    }

    pub async fn wait_workflow(&self, id: WorkflowId) -> Result<Workflow, WorkflowError> {
        self.shared.workflows.wait(id).await
    }

    /// Status of a task or workflow; `None` when the id is unknown
    pub async fn get_status(&self, id: &str) -> Option<StatusReport> {
        if let Ok(task_id) = id.parse::<TaskId>() {
            if let Some(task) = self.shared.store.get(task_id).await {
                return Some(self.task_status(&task).await);
            }
        }
        if let Ok(workflow_id) = id.parse::<WorkflowId>() {
            if let Some(workflow) = self.shared.workflows.get(workflow_id).await {
                return Some(self.workflow_status(&workflow).await);
            }
        }
        None
    }

    async fn task_status(&self, task: &Task) -> StatusReport {
        let id = task.id.to_string();
        let snapshot = self.tracker.get(&id).await;
        let progress = match (&snapshot, task.status) {
            (_, TaskStatus::Completed) => 100.0,
            (Some(s), _) => s.overall,
            (None, _) => 0.0,
        };
        StatusReport {
            kind: SubjectKind::Task,
            status: task.status.as_str().to_string(),
            progress,
            stage: snapshot
                .as_ref()
                .and_then(|s| s.current_stage_name().map(String::from)),
            eta: snapshot.as_ref().and_then(|s| s.eta),
            result: task
                .result
                .as_ref()
                .and_then(|r| serde_json::to_value(r).ok()),
            error: task.error.clone(),
            pending_approval: None,
            undelivered: self.shared.delivery.undelivered(&id).await.is_some(),
            id,
        }
    }

    async fn workflow_status(&self, workflow: &Workflow) -> StatusReport {
        let id = workflow.id.to_string();
        let snapshot = self.tracker.get(&id).await;
        let completed = workflow.status == WorkflowStatus::Completed;
        StatusReport {
            kind: SubjectKind::Workflow,
            status: workflow.status.as_str().to_string(),
            progress: snapshot.as_ref().map_or(0.0, |s| s.overall),
            stage: workflow.current_steps.iter().next().cloned(),
            eta: snapshot.as_ref().and_then(|s| s.eta),
            result: completed.then(|| Value::Object(workflow.context.clone())),
            error: workflow.error.clone(),
            pending_approval: workflow.pending_approval.clone(),
            undelivered: self.shared.delivery.undelivered(&id).await.is_some(),
            id,
        }
    }

    pub async fn respond_to_approval(
        &self,
        id: WorkflowId,
        approved: bool,
        comment: Option<String>,
    ) -> Result<String, WorkflowError> {
        self.shared
            .workflows
            .respond_to_approval(id, ApprovalDecision { approved, comment })
            .await
    }

    /// Cancel a task: pending tasks are dropped, running ones terminated
    pub async fn cancel_task(&self, id: TaskId) -> CancelOutcome {
        self.pool.cancel(id).await
    }

    pub async fn cancel_workflow(&self, id: WorkflowId) -> Result<(), WorkflowError> {
        self.shared.workflows.cancel(id).await
    }

    pub async fn scale(&self, size: usize) {
        self.pool.scale(size).await
    }

    pub async fn stats(&self) -> EngineStats {
        let tasks = self
            .shared
            .store
            .stats_by_status()
            .await
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect();
        EngineStats {
            pool: self.pool.stats().await,
            queued: self.shared.store.size().await,
            tasks,
            active_workflows: self.shared.workflows.active().await.len(),
            undelivered: self.shared.delivery.undelivered_count().await,
        }
    }

    /// Stop dispatching, cancel running workflows and wait for in-flight work
    pub async fn shutdown(&self) {
        tracing::info!("engine shutting down");
        self.stopping.cancel();
        self.shared.workflows.shutdown().await;
        self.pool.shutdown().await;

        self.stop_forwarding.cancel();
        let forwarders: Vec<_> = self.forwarders.lock().await.drain(..).collect();
        for forwarder in forwarders {
            if let Err(e) = forwarder.await {
                tracing::warn!(error = %e, "event forwarder ended abnormally");
            }
        }
        tracing::info!("engine stopped");
    }
}
