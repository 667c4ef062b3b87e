//! Workflow driver - rounds, approval gates and terminal bookkeeping

use super::approval::{ApprovalDecision, ApprovalGate, GateOutcome, wait_for_decision};
use super::executor::{ExecutorRegistry, StepContext, StepError, StepExecutor};
use super::state::{PendingApproval, StepStatus, Workflow, WorkflowId, WorkflowStatus};
use super::{WorkflowError, WorkflowEvent};
use crate::config::{StageSpec, StepConfig, WorkflowSettings, WorkflowTemplate};
use crate::error::{EngineFailure, ErrorKind};
use crate::progress::{ProgressTracker, StageStatus};
use crate::shutdown::CancellationToken;
use crate::template::TemplateEngine;
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

/// Called once with the final workflow state
pub type WorkflowCallback = Arc<dyn Fn(&Workflow) + Send + Sync>;

/// Options for starting a workflow
#[derive(Clone, Default)]
pub struct StartOptions {
    /// Initial context, merged over the template's defaults
    pub context: Map<String, Value>,
    pub callback: Option<WorkflowCallback>,
}

impl StartOptions {
    pub fn with_context(context: Map<String, Value>) -> Self {
        Self {
            context,
            callback: None,
        }
    }

    pub fn on_finish(mut self, callback: impl Fn(&Workflow) + Send + Sync + 'static) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }
}

/// One running workflow instance
struct Run {
    id: WorkflowId,
    template: WorkflowTemplate,
    state: RwLock<Workflow>,
    cancel: CancellationToken,
    gate: ApprovalGate,
    done: watch::Sender<bool>,
    callback: Option<WorkflowCallback>,
}

impl Run {
    fn subject(&self) -> String {
        self.id.to_string()
    }
}

/// How waiting on a gate left the workflow
enum GateResult {
    Proceed,
    Halt,
}

struct Shared {
    registry: ExecutorRegistry,
    tracker: Arc<ProgressTracker>,
    settings: WorkflowSettings,
    messages: TemplateEngine,
    events: broadcast::Sender<WorkflowEvent>,
    /// Receives the final state of every workflow
    outcomes: Option<mpsc::UnboundedSender<Workflow>>,
}

impl Shared {
    fn emit(&self, event: WorkflowEvent) {
        let _ = self.events.send(event);
    }

    async fn mark_stage(&self, run: &Run, step: &str, status: StageStatus) {
        if let Err(e) = self
            .tracker
            .mark_stage(&run.subject(), step, status, None)
            .await
        {
            tracing::debug!(workflow_id = %run.id, step, error = %e, "progress update ignored");
        }
    }

    async fn drive(self: Arc<Self>, run: Arc<Run>) {
        tracing::info!(workflow_id = %run.id, template = %run.template.id, "workflow started");

        loop {
            if run.cancel.is_cancelled() {
                break;
            }

            let plan = {
                let mut state = run.state.write().await;
                if state.status.is_terminal() {
                    break;
                }
                state.plan(&run.template)
            };
            let plan = match plan {
                Ok(plan) => plan,
                Err(e) => {
                    let failure = EngineFailure::new(
                        ErrorKind::ExecutionError,
                        format!("condition evaluation failed: {}", e),
                    );
                    run.state.write().await.fail(failure);
                    break;
                }
            };

            for (step, reason) in plan.skipped {
                tracing::info!(workflow_id = %run.id, step = %step, reason = %reason, "step skipped");
                self.mark_stage(&run, &step, StageStatus::Skipped).await;
                self.emit(WorkflowEvent::StepSkipped {
                    workflow_id: run.id,
                    step,
                    reason,
                });
            }

            if !plan.work.is_empty() {
                self.run_round(&run, plan.work).await;
                continue;
            }

            if let Some(step) = plan.approvals.first() {
                match self.await_approval(&run, step).await {
                    GateResult::Proceed => continue,
                    GateResult::Halt => break,
                }
            }

            let mut state = run.state.write().await;
            if state.status.is_terminal() {
                break;
            }
            if state.all_done() {
                state.status = WorkflowStatus::Completed;
            } else {
                let blocked: Vec<String> = state
                    .blocked_steps(&run.template)
                    .into_iter()
                    .map(|(step, waiting)| format!("{} (waiting on {})", step, waiting.join(", ")))
                    .collect();
                tracing::error!(workflow_id = %run.id, blocked = ?blocked, "workflow deadlocked");
                state.fail(EngineFailure::new(
                    ErrorKind::WorkflowDeadlock,
                    format!("no step can make progress: {}", blocked.join("; ")),
                ));
            }
            break;
        }

        self.finish(&run).await;
    }

    /// Execute one round of ready steps and wait for every one of them
    async fn run_round(&self, run: &Arc<Run>, steps: Vec<String>) {
        let mut round = JoinSet::new();
        let mut started = Vec::new();
        {
            let mut state = run.state.write().await;
            for id in steps {
                let Some(step) = run.template.step(&id).cloned() else {
                    continue;
                };

                if let Some(dep) = step
                    .depends_on
                    .iter()
                    .find(|d| !state.completed_steps.contains(*d))
                {
                    let failure = StepError::DependencyNotMet {
                        step: id.clone(),
                        dependency: dep.clone(),
                    }
                    .into_failure(&id);
                    tracing::error!(workflow_id = %run.id, step = %id, "dependency guard tripped");
                    state.record_failure(&id, failure.clone());
                    state.fail(failure);
                    continue;
                }

                state.mark_running(&id);
                let ctx = StepContext {
                    workflow_id: run.id,
                    inputs: state.projection(&step),
                };
                let executor = self.registry.get(step.step_type);
                round.spawn(async move {
                    let result = run_step(executor, &step, ctx).await;
                    (step, result)
                });
                started.push(id);
            }
        }

        for step in started {
            tracing::debug!(workflow_id = %run.id, step = %step, "step started");
            self.mark_stage(run, &step, StageStatus::Running).await;
            self.emit(WorkflowEvent::StepStarted {
                workflow_id: run.id,
                step,
            });
        }

        while let Some(joined) = round.join_next().await {
            let (step, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // run_step already isolates executor panics
                    tracing::error!(workflow_id = %run.id, error = %e, "round task aborted");
                    continue;
                }
            };
            self.step_finished(run, &step, result).await;
        }
    }

    async fn step_finished(&self, run: &Run, step: &StepConfig, result: Result<Value, StepError>) {
        let mut state = run.state.write().await;
        if state.status == WorkflowStatus::Cancelled {
            tracing::debug!(workflow_id = %run.id, step = %step.id, "discarding result of cancelled workflow");
            state.record_discarded(&step.id);
            return;
        }

        match result {
            Ok(output) => {
                state.record_output(step, output);
                drop(state);
                tracing::info!(workflow_id = %run.id, step = %step.id, "step completed");
                self.mark_stage(run, &step.id, StageStatus::Completed).await;
                self.emit(WorkflowEvent::StepCompleted {
                    workflow_id: run.id,
                    step: step.id.clone(),
                });
            }
            Err(e) => {
                let failure = e.into_failure(&step.id);
                state.record_failure(&step.id, failure.clone());
                state.fail(failure.clone());
                drop(state);
                tracing::warn!(workflow_id = %run.id, step = %step.id, error = %failure, "step failed");
                self.mark_stage(run, &step.id, StageStatus::Failed).await;
                self.emit(WorkflowEvent::StepFailed {
                    workflow_id: run.id,
                    step: step.id.clone(),
                    error: failure,
                });
            }
        }
    }

    /// Suspend the workflow on an approval gate until it is decided
    async fn await_approval(&self, run: &Run, step_id: &str) -> GateResult {
        let Some(step) = run.template.step(step_id) else {
            return GateResult::Halt;
        };
        let expiry = step
            .approval_timeout_ms
            .or(self.settings.approval_timeout_ms)
            .map(Duration::from_millis);

        let receiver = run.gate.open(step_id).await;
        let message = {
            let mut state = run.state.write().await;
            if state.status.is_terminal() {
                drop(state);
                run.gate.close().await;
                return GateResult::Halt;
            }

            let message = step.message.as_deref().map(|m| {
                self.messages
                    .render_trimmed(m, &state.template_context())
                    .unwrap_or_else(|_| m.to_string())
            });
            let now = Utc::now();
            state.status = WorkflowStatus::AwaitingApproval;
            state.pending_approval = Some(PendingApproval {
                step: step_id.to_string(),
                message: message.clone(),
                requested_at: now,
                expires_at: expiry.and_then(|d| chrono::Duration::from_std(d).ok()).map(|d| now + d),
            });
            state.current_steps.insert(step_id.to_string());
            if let Some(gate) = state.step_mut(step_id) {
                gate.status = StepStatus::AwaitingApproval;
                gate.started_at = Some(now);
            }
            message
        };

        tracing::info!(workflow_id = %run.id, step = step_id, "awaiting approval");
        self.mark_stage(run, step_id, StageStatus::Running).await;
        self.emit(WorkflowEvent::ApprovalRequested {
            workflow_id: run.id,
            step: step_id.to_string(),
            message,
        });

        let outcome = wait_for_decision(receiver, expiry, &run.cancel).await;
        run.gate.close().await;

        let mut state = run.state.write().await;
        state.pending_approval = None;
        let (approved, comment, verdict) = match outcome {
            GateOutcome::Decided(ApprovalDecision { approved, comment }) => {
                (approved, comment, "rejected")
            }
            GateOutcome::Expired => (false, None, "expired"),
            GateOutcome::Cancelled => {
                state.record_discarded(step_id);
                return GateResult::Halt;
            }
        };

        if approved {
            if state.status == WorkflowStatus::AwaitingApproval {
                state.status = WorkflowStatus::Running;
            }
            state.record_output(step, json!({ "approved": true, "comment": comment }));
            drop(state);
            tracing::info!(workflow_id = %run.id, step = step_id, "approval granted");
            self.mark_stage(run, step_id, StageStatus::Completed).await;
            self.emit(WorkflowEvent::ApprovalResolved {
                workflow_id: run.id,
                step: step_id.to_string(),
                approved,
                comment,
            });
            GateResult::Proceed
        } else {
            let mut failure =
                EngineFailure::new(ErrorKind::Cancelled, format!("approval '{}' {}", step_id, verdict));
            if let Some(comment) = &comment {
                failure = failure.with_diagnostics(comment.clone());
            }
            state.record_failure(step_id, failure.clone());
            state.fail(failure);
            drop(state);
            tracing::info!(workflow_id = %run.id, step = step_id, verdict, "approval denied");
            self.mark_stage(run, step_id, StageStatus::Failed).await;
            self.emit(WorkflowEvent::ApprovalResolved {
                workflow_id: run.id,
                step: step_id.to_string(),
                approved,
                comment,
            });
            GateResult::Halt
        }
    }

    /// Record the terminal state, notify observers and release waiters
    async fn finish(&self, run: &Run) {
        let snapshot = {
            let mut state = run.state.write().await;
            if !state.status.is_terminal() {
                // The loop only exits early on cancellation
                state.status = WorkflowStatus::Cancelled;
            }
            state.completed_at.get_or_insert_with(Utc::now);
            state.pending_approval = None;
            state.clone()
        };
        let subject = run.subject();

        let event = match snapshot.status {
            WorkflowStatus::Completed => {
                let result = Value::Object(snapshot.context.clone());
                if let Err(e) = self.tracker.complete(&subject, Some(result)).await {
                    tracing::debug!(workflow_id = %run.id, error = %e, "progress completion ignored");
                }
                tracing::info!(workflow_id = %run.id, "workflow completed");
                WorkflowEvent::Completed { workflow_id: run.id }
            }
            WorkflowStatus::Cancelled => {
                let _ = self.tracker.fail(&subject, "workflow cancelled").await;
                tracing::info!(workflow_id = %run.id, "workflow cancelled");
                WorkflowEvent::Cancelled { workflow_id: run.id }
            }
            _ => {
                let error = snapshot
                    .error
                    .clone()
                    .unwrap_or_else(|| EngineFailure::new(ErrorKind::ExecutionError, "workflow failed"));
                let _ = self.tracker.fail(&subject, error.to_string()).await;
                tracing::warn!(workflow_id = %run.id, error = %error, "workflow failed");
                WorkflowEvent::Failed {
                    workflow_id: run.id,
                    error,
                }
            }
        };

        if let Some(callback) = &run.callback {
            callback(&snapshot);
        }
        self.emit(event);
        run.done.send_replace(true);
        // After `done`, so a receiver may `forget` the run straight away
        if let Some(outcomes) = &self.outcomes {
            if outcomes.send(snapshot).is_err() {
                tracing::debug!(workflow_id = %run.id, "outcome receiver gone");
            }
        }
    }
}

/// Run an executor in its own task so a panic fails only this step
async fn run_step(
    executor: Option<Arc<dyn StepExecutor>>,
    step: &StepConfig,
    ctx: StepContext,
) -> Result<Value, StepError> {
    let Some(executor) = executor else {
        return Err(StepError::NoExecutor(step.step_type.as_str().to_string()));
    };
    let config = step.clone();
    let handle = tokio::spawn(async move { executor.execute(&config, ctx).await });
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(StepError::Panicked(e.to_string())),
    }
}

/// Runs workflow instances and owns their lifecycle
pub struct WorkflowEngine {
    shared: Arc<Shared>,
    runs: RwLock<HashMap<WorkflowId, Arc<Run>>>,
    drivers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkflowEngine {
    pub fn new(
        registry: ExecutorRegistry,
        tracker: Arc<ProgressTracker>,
        settings: WorkflowSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                registry,
                tracker,
                settings,
                messages: TemplateEngine::lenient(),
                events,
                outcomes: None,
            }),
            runs: RwLock::new(HashMap::new()),
            drivers: Mutex::new(Vec::new()),
        }
    }

    /// Send the final state of every workflow to `sink`
    ///
    /// Unlike the event channel this never drops a result. Call before the
    /// first `start`.
    pub fn with_outcome_sink(mut self, sink: mpsc::UnboundedSender<Workflow>) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.outcomes = Some(sink),
            None => tracing::warn!("outcome sink ignored, workflows already running"),
        }
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.shared.events.subscribe()
    }

    /// Start a workflow instance and return its id immediately
    ///
    /// Structural template errors reject the start. Dependency cycles are
    /// not checked here; they surface as a deadlock once nothing can run.
    pub async fn start(
        &self,
        template: WorkflowTemplate,
        options: StartOptions,
    ) -> Result<WorkflowId, WorkflowError> {
        template
            .validate_structure()
            .map_err(|errors| WorkflowError::InvalidTemplate {
                template: template.id.clone(),
                errors,
            })?;

        let id = WorkflowId::new();
        let stages: Vec<StageSpec> = template
            .steps
            .iter()
            .map(|s| StageSpec::new(s.id.clone(), s.weight))
            .collect();
        self.shared
            .tracker
            .start_tracking(&id.to_string(), &stages)
            .await;

        let (done, _) = watch::channel(false);
        let run = Arc::new(Run {
            id,
            state: RwLock::new(Workflow::new(id, &template, options.context)),
            template,
            cancel: CancellationToken::new(),
            gate: ApprovalGate::new(),
            done,
            callback: options.callback,
        });
        self.runs.write().await.insert(id, run.clone());

        self.shared.emit(WorkflowEvent::Started {
            workflow_id: id,
            template_id: run.template.id.clone(),
        });

        let handle = tokio::spawn(self.shared.clone().drive(run));
        let mut drivers = self.drivers.lock().await;
        drivers.retain(|h| !h.is_finished());
        drivers.push(handle);
        Ok(id)
    }

    /// Current state of a workflow
    pub async fn get(&self, id: WorkflowId) -> Option<Workflow> {
        let run = self.runs.read().await.get(&id).cloned()?;
        let state = run.state.read().await.clone();
        Some(state)
    }

    /// Wait for the workflow's driver to finish
    pub async fn wait(&self, id: WorkflowId) -> Result<Workflow, WorkflowError> {
        let run = self.run(id).await?;
        let mut done = run.done.subscribe();
        // The sender lives in `run`, which we hold
        let _ = done.wait_for(|finished| *finished).await;
        let state = run.state.read().await.clone();
        Ok(state)
    }

    /// Deliver a decision to the workflow's open approval gate
    ///
    /// Returns the step the decision resolved.
    pub async fn respond_to_approval(
        &self,
        id: WorkflowId,
        decision: ApprovalDecision,
    ) -> Result<String, WorkflowError> {
        let run = self.run(id).await?;
        let step = run
            .gate
            .resolve(decision)
            .await
            .ok_or(WorkflowError::NoPendingApproval(id))?;
        tracing::debug!(workflow_id = %id, step = %step, "approval decision delivered");
        Ok(step)
    }

    /// Cancel a workflow
    ///
    /// The status changes at once; steps already running finish and their
    /// results are discarded.
    pub async fn cancel(&self, id: WorkflowId) -> Result<(), WorkflowError> {
        let run = self.run(id).await?;
        {
            let mut state = run.state.write().await;
            if state.status.is_terminal() {
                return Err(WorkflowError::NotRunning {
                    id,
                    status: state.status,
                });
            }
            state.status = WorkflowStatus::Cancelled;
            state.error = Some(EngineFailure::new(ErrorKind::Cancelled, "workflow cancelled"));
            state.pending_approval = None;
        }
        run.cancel.cancel();
        tracing::info!(workflow_id = %id, "workflow cancellation requested");
        Ok(())
    }

    /// Ids of workflows whose driver has not finished
    pub async fn active(&self) -> Vec<WorkflowId> {
        let runs: Vec<Arc<Run>> = self.runs.read().await.values().cloned().collect();
        let mut active = Vec::new();
        for run in runs {
            if !*run.done.borrow() {
                active.push(run.id);
            }
        }
        active
    }

    /// Drop a finished workflow from the engine
    pub async fn forget(&self, id: WorkflowId) -> bool {
        let mut runs = self.runs.write().await;
        match runs.get(&id) {
            Some(run) if *run.done.borrow() => runs.remove(&id).is_some(),
            _ => false,
        }
    }

    /// Cancel every active workflow and wait for the drivers to stop
    pub async fn shutdown(&self) {
        for id in self.active().await {
            let _ = self.cancel(id).await;
        }
        let drivers: Vec<_> = self.drivers.lock().await.drain(..).collect();
        for driver in drivers {
            if let Err(e) = driver.await {
                tracing::warn!(error = %e, "workflow driver ended abnormally");
            }
        }
        tracing::info!("workflow engine stopped");
    }

    async fn run(&self, id: WorkflowId) -> Result<Arc<Run>, WorkflowError> {
        self.runs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(WorkflowError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StepType;
    use crate::store::TaskId;
    use async_trait::async_trait;
    use rand::Rng;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;
    use tokio::sync::Semaphore;

    /// In-process step executor with scripted outputs
    #[derive(Default)]
    struct Scripted {
        outputs: HashMap<String, Value>,
        failing: HashSet<String>,
        panicking: HashSet<String>,
        blocked: Option<(String, Arc<Semaphore>)>,
        jitter: bool,
        log: StdMutex<Vec<(String, Instant, Instant)>>,
    }

    impl Scripted {
        fn output(mut self, step: &str, value: Value) -> Self {
            self.outputs.insert(step.into(), value);
            self
        }

        fn failing(mut self, step: &str) -> Self {
            self.failing.insert(step.into());
            self
        }

        fn started(&self, step: &str) -> bool {
            self.log.lock().unwrap().iter().any(|(s, _, _)| s == step)
        }

        fn span(&self, step: &str) -> (Instant, Instant) {
            let log = self.log.lock().unwrap();
            let (_, start, end) = log.iter().find(|(s, _, _)| s == step).unwrap();
            (*start, *end)
        }
    }

    #[async_trait]
    impl StepExecutor for Scripted {
        async fn execute(&self, step: &StepConfig, _ctx: StepContext) -> Result<Value, StepError> {
            let start = Instant::now();
            if self.jitter {
                let micros = rand::rng().random_range(0..1500);
                tokio::time::sleep(Duration::from_micros(micros)).await;
            }
            if let Some((id, gate)) = &self.blocked {
                if id == &step.id {
                    let _permit = gate.acquire().await.unwrap();
                }
            }
            if self.panicking.contains(&step.id) {
                panic!("executor blew up");
            }
            self.log
                .lock()
                .unwrap()
                .push((step.id.clone(), start, Instant::now()));

            if self.failing.contains(&step.id) {
                return Err(StepError::TaskFailed {
                    task_id: TaskId::new(),
                    error: EngineFailure::new(ErrorKind::ExecutionError, "exit code 1"),
                });
            }
            Ok(self
                .outputs
                .get(&step.id)
                .cloned()
                .unwrap_or_else(|| json!({"success": true})))
        }
    }

    fn engine(executor: Arc<Scripted>, settings: WorkflowSettings) -> WorkflowEngine {
        let mut registry = ExecutorRegistry::new();
        registry.register(StepType::Task, executor);
        WorkflowEngine::new(registry, Arc::new(ProgressTracker::new(10)), settings)
    }

    fn template(steps: Vec<StepConfig>) -> WorkflowTemplate {
        WorkflowTemplate {
            id: "test".into(),
            steps,
            ..Default::default()
        }
    }

    fn gated() -> WorkflowTemplate {
        template(vec![
            StepConfig::task("build", "Build"),
            StepConfig::approval("approve").depends_on(&["build"]),
            StepConfig::task("deploy", "Deploy").depends_on(&["approve"]),
        ])
    }

    async fn wait_for_approval(events: &mut broadcast::Receiver<WorkflowEvent>) -> String {
        loop {
            if let WorkflowEvent::ApprovalRequested { step, .. } = events.recv().await.unwrap() {
                return step;
            }
        }
    }

    #[tokio::test]
    async fn test_linear_chain_respects_dependencies() {
        for _ in 0..100 {
            let executor = Arc::new(Scripted {
                jitter: true,
                ..Default::default()
            });
            let engine = engine(executor.clone(), WorkflowSettings::default());
            let tpl = template(vec![
                StepConfig::task("c", "C").depends_on(&["b"]),
                StepConfig::task("noise", "N"),
                StepConfig::task("b", "B").depends_on(&["a"]),
                StepConfig::task("a", "A"),
            ]);

            let id = engine.start(tpl, StartOptions::default()).await.unwrap();
            let workflow = engine.wait(id).await.unwrap();
            assert_eq!(workflow.status, WorkflowStatus::Completed);

            let (_, a_end) = executor.span("a");
            let (b_start, b_end) = executor.span("b");
            let (c_start, _) = executor.span("c");
            assert!(b_start >= a_end);
            assert!(c_start >= b_end);

            let b = workflow.step("b").unwrap();
            let c = workflow.step("c").unwrap();
            assert!(c.started_at.unwrap() >= b.completed_at.unwrap());
        }
    }

    #[tokio::test]
    async fn test_false_gate_condition_skips_gate_and_dependents() {
        let executor = Arc::new(Scripted::default().output("analyze", json!({"success": false})));
        let engine = engine(executor.clone(), WorkflowSettings::default());
        let mut events = engine.subscribe();

        let tpl = template(vec![
            StepConfig::task("analyze", "Analyze"),
            StepConfig::task("prioritize", "Prioritize").depends_on(&["analyze"]),
            StepConfig::approval("approval")
                .depends_on(&["prioritize"])
                .when("analyze.success"),
            StepConfig::task("implement", "Implement").depends_on(&["approval"]),
        ]);
        let id = engine.start(tpl, StartOptions::default()).await.unwrap();
        let workflow = engine.wait(id).await.unwrap();

        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert!(executor.started("prioritize"));
        assert!(!executor.started("implement"));
        assert_eq!(workflow.step("approval").unwrap().status, StepStatus::Skipped);
        assert_eq!(workflow.step("implement").unwrap().status, StepStatus::Skipped);

        let mut saw_skips = 0;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, WorkflowEvent::ApprovalRequested { .. }));
            if matches!(event, WorkflowEvent::StepSkipped { .. }) {
                saw_skips += 1;
            }
        }
        assert_eq!(saw_skips, 2);
    }

    #[tokio::test]
    async fn test_outputs_visible_to_dependents_only_after_completion() {
        let executor = Arc::new(
            Scripted::default().output("scan", json!({"success": true, "files": ["a.rs"]})),
        );
        let engine = engine(executor, WorkflowSettings::default());
        let mut scan = StepConfig::task("scan", "Scan");
        scan.outputs = vec!["files".into()];
        let tpl = template(vec![
            scan,
            StepConfig::task("fix", "Fix").depends_on(&["scan"]).when("files"),
        ]);

        let id = engine.start(tpl, StartOptions::default()).await.unwrap();
        let workflow = engine.wait(id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert_eq!(workflow.context["files"], json!(["a.rs"]));
        assert_eq!(workflow.step("fix").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_approval_granted_resumes() {
        let executor = Arc::new(Scripted::default());
        let engine = engine(executor.clone(), WorkflowSettings::default());
        let mut events = engine.subscribe();

        let id = engine.start(gated(), StartOptions::default()).await.unwrap();
        assert_eq!(wait_for_approval(&mut events).await, "approve");

        let waiting = engine.get(id).await.unwrap();
        assert_eq!(waiting.status, WorkflowStatus::AwaitingApproval);
        assert_eq!(waiting.pending_approval.unwrap().step, "approve");
        assert!(!executor.started("deploy"));

        let step = engine
            .respond_to_approval(id, ApprovalDecision::approve())
            .await
            .unwrap();
        assert_eq!(step, "approve");

        let workflow = engine.wait(id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert!(executor.started("deploy"));
        assert_eq!(workflow.context["approve"]["approved"], true);
    }

    #[tokio::test]
    async fn test_approval_rejected_fails_workflow() {
        let executor = Arc::new(Scripted::default());
        let engine = engine(executor.clone(), WorkflowSettings::default());
        let mut events = engine.subscribe();

        let id = engine.start(gated(), StartOptions::default()).await.unwrap();
        wait_for_approval(&mut events).await;
        engine
            .respond_to_approval(id, ApprovalDecision::reject("not today"))
            .await
            .unwrap();

        let workflow = engine.wait(id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        let error = workflow.error.clone().unwrap();
        assert_eq!(error.kind, ErrorKind::Cancelled);
        assert!(error.message.contains("rejected"));
        assert_eq!(error.diagnostics.as_deref(), Some("not today"));
        assert!(!executor.started("deploy"));
        assert_eq!(workflow.step("deploy").unwrap().status, StepStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_approval_expires() {
        let executor = Arc::new(Scripted::default());
        let engine = engine(
            executor,
            WorkflowSettings {
                approval_timeout_ms: Some(60_000),
                ..Default::default()
            },
        );

        let id = engine.start(gated(), StartOptions::default()).await.unwrap();
        let workflow = engine.wait(id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert!(workflow.error.clone().unwrap().message.contains("expired"));
    }

    #[tokio::test]
    async fn test_respond_without_pending_approval() {
        let engine = engine(Arc::new(Scripted::default()), WorkflowSettings::default());
        let id = engine
            .start(template(vec![StepConfig::task("a", "A")]), StartOptions::default())
            .await
            .unwrap();
        engine.wait(id).await.unwrap();

        let err = engine
            .respond_to_approval(id, ApprovalDecision::approve())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NoPendingApproval(_)));

        let err = engine
            .respond_to_approval(WorkflowId::new(), ApprovalDecision::approve())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_approval() {
        let engine = engine(Arc::new(Scripted::default()), WorkflowSettings::default());
        let mut events = engine.subscribe();
        let id = engine.start(gated(), StartOptions::default()).await.unwrap();
        wait_for_approval(&mut events).await;

        engine.cancel(id).await.unwrap();
        let workflow = engine.wait(id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Cancelled);
        assert!(matches!(
            engine.cancel(id).await,
            Err(WorkflowError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_discards_in_flight_results() {
        let gate = Arc::new(Semaphore::new(0));
        let executor = Arc::new(Scripted {
            blocked: Some(("slow".into(), gate.clone())),
            ..Default::default()
        });
        let engine = engine(executor.clone(), WorkflowSettings::default());
        let mut events = engine.subscribe();

        let tpl = template(vec![
            StepConfig::task("slow", "Slow"),
            StepConfig::task("after", "After").depends_on(&["slow"]),
        ]);
        let id = engine.start(tpl, StartOptions::default()).await.unwrap();
        loop {
            if let WorkflowEvent::StepStarted { step, .. } = events.recv().await.unwrap() {
                assert_eq!(step, "slow");
                break;
            }
        }

        engine.cancel(id).await.unwrap();
        assert_eq!(engine.get(id).await.unwrap().status, WorkflowStatus::Cancelled);
        gate.add_permits(1);

        let workflow = engine.wait(id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Cancelled);
        assert_eq!(workflow.step("slow").unwrap().status, StepStatus::Discarded);
        assert!(!workflow.context.contains_key("slow"));
        assert!(!executor.started("after"));
    }

    #[tokio::test]
    async fn test_step_failure_fails_workflow_after_round_drains() {
        let executor = Arc::new(Scripted::default().failing("lint"));
        let engine = engine(executor.clone(), WorkflowSettings::default());
        let tpl = template(vec![
            StepConfig::task("lint", "Lint"),
            StepConfig::task("test", "Test"),
            StepConfig::task("ship", "Ship").depends_on(&["lint", "test"]),
        ]);

        let id = engine.start(tpl, StartOptions::default()).await.unwrap();
        let workflow = engine.wait(id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert_eq!(workflow.error.clone().unwrap().kind, ErrorKind::ExecutionError);
        assert!(workflow.failed_steps.contains("lint"));
        assert_eq!(workflow.step("test").unwrap().status, StepStatus::Completed);
        assert!(!executor.started("ship"));
    }

    #[tokio::test]
    async fn test_panicking_step_fails_workflow() {
        let mut scripted = Scripted::default();
        scripted.panicking.insert("boom".into());
        let engine = engine(Arc::new(scripted), WorkflowSettings::default());

        let id = engine
            .start(template(vec![StepConfig::task("boom", "Boom")]), StartOptions::default())
            .await
            .unwrap();
        let workflow = engine.wait(id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert!(workflow.error.clone().unwrap().message.contains("panicked"));
    }

    #[tokio::test]
    async fn test_missing_executor_fails_workflow() {
        let engine = engine(Arc::new(Scripted::default()), WorkflowSettings::default());
        let report = StepConfig {
            id: "report".into(),
            step_type: StepType::Report,
            template: Some("done".into()),
            ..Default::default()
        };

        let id = engine.start(template(vec![report]), StartOptions::default()).await.unwrap();
        let workflow = engine.wait(id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert!(workflow.error.clone().unwrap().message.contains("no executor"));
    }

    #[tokio::test]
    async fn test_cycle_is_reported_as_deadlock() {
        let executor = Arc::new(Scripted::default());
        let engine = engine(executor.clone(), WorkflowSettings::default());
        let tpl = template(vec![
            StepConfig::task("setup", "Setup"),
            StepConfig::task("a", "A").depends_on(&["setup", "b"]),
            StepConfig::task("b", "B").depends_on(&["a"]),
        ]);

        let id = engine.start(tpl, StartOptions::default()).await.unwrap();
        let workflow = engine.wait(id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert_eq!(workflow.error.clone().unwrap().kind, ErrorKind::WorkflowDeadlock);
        assert!(executor.started("setup"));
        assert!(!executor.started("a"));
    }

    #[tokio::test]
    async fn test_invalid_template_rejected() {
        let engine = engine(Arc::new(Scripted::default()), WorkflowSettings::default());
        let tpl = template(vec![StepConfig::task("a", "A").depends_on(&["missing"])]);
        let err = engine.start(tpl, StartOptions::default()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTemplate { .. }));
    }

    #[tokio::test]
    async fn test_callback_and_progress_on_completion() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let tracker = Arc::new(ProgressTracker::new(10));
        let mut registry = ExecutorRegistry::new();
        registry.register(StepType::Task, Arc::new(Scripted::default()));
        let engine = WorkflowEngine::new(registry, tracker.clone(), WorkflowSettings::default());

        let seen = calls.clone();
        let options = StartOptions::default().on_finish(move |wf| {
            seen.lock().unwrap().push(wf.status);
        });
        let id = engine
            .start(
                template(vec![StepConfig::task("a", "A"), StepConfig::task("b", "B")]),
                options,
            )
            .await
            .unwrap();
        engine.wait(id).await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![WorkflowStatus::Completed]);
        let progress = tracker.get(&id.to_string()).await.unwrap();
        assert_eq!(progress.overall, 100.0);
    }

    #[tokio::test]
    async fn test_outcome_sink_receives_final_state() {
        let (sink, mut outcomes) = mpsc::unbounded_channel();
        let engine = engine(Arc::new(Scripted::default()), WorkflowSettings::default())
            .with_outcome_sink(sink);

        let mut ids = HashSet::new();
        for _ in 0..20 {
            let tpl = template(vec![StepConfig::task("a", "A")]);
            ids.insert(engine.start(tpl, StartOptions::default()).await.unwrap());
        }
        for _ in 0..20 {
            let workflow = outcomes.recv().await.unwrap();
            assert_eq!(workflow.status, WorkflowStatus::Completed);
            assert!(ids.remove(&workflow.id));
            assert!(engine.forget(workflow.id).await);
        }
        assert!(engine.active().await.is_empty());
        assert!(engine.get(WorkflowId::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_active_workflows() {
        let engine = engine(Arc::new(Scripted::default()), WorkflowSettings::default());
        let mut events = engine.subscribe();
        let id = engine.start(gated(), StartOptions::default()).await.unwrap();
        wait_for_approval(&mut events).await;

        engine.shutdown().await;
        assert_eq!(engine.get(id).await.unwrap().status, WorkflowStatus::Cancelled);
        assert!(engine.active().await.is_empty());
        assert!(engine.forget(id).await);
        assert!(engine.get(id).await.is_none());
    }
}
