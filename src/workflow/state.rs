//! Workflow instance state and round planning

use crate::config::{StepConfig, StepType, WorkflowTemplate};
use crate::error::EngineFailure;
use crate::template::{TemplateContext, TemplateError, evaluate_condition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique workflow instance identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::AwaitingApproval => "awaiting_approval",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    AwaitingApproval,
    Completed,
    Skipped,
    Failed,
    /// Finished after the workflow was cancelled; result discarded
    Discarded,
}

/// Runtime state of one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub id: String,
    pub step_type: StepType,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<EngineFailure>,
    pub skip_reason: Option<String>,

    /// Dependents of this skipped step are skipped too
    #[serde(default)]
    pub skip_propagates: bool,
}

impl StepState {
    fn new(step: &StepConfig) -> Self {
        Self {
            id: step.id.clone(),
            step_type: step.step_type,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            skip_reason: None,
            skip_propagates: false,
        }
    }
}

/// An approval gate waiting for a decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub step: String,
    pub message: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A workflow instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub template_id: String,
    pub status: WorkflowStatus,

    /// Accumulated step outputs; only the engine writes here
    pub context: Map<String, Value>,

    pub steps: Vec<StepState>,

    /// Completed or skipped steps
    pub completed_steps: BTreeSet<String>,
    pub failed_steps: BTreeSet<String>,
    pub current_steps: BTreeSet<String>,

    pub pending_approval: Option<PendingApproval>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<EngineFailure>,
}

/// What the scheduler may do next
#[derive(Debug, Default, PartialEq)]
pub struct RoundPlan {
    /// Steps skipped while planning, with the reason
    pub skipped: Vec<(String, String)>,
    /// Non-approval steps ready to run this round
    pub work: Vec<String>,
    /// Approval gates whose dependencies are met
    pub approvals: Vec<String>,
}

impl Workflow {
    /// New running instance; caller context overrides template defaults
    pub fn new(id: WorkflowId, template: &WorkflowTemplate, context: Map<String, Value>) -> Self {
        let mut merged = template.context.clone();
        merged.extend(context);
        Self {
            id,
            template_id: template.id.clone(),
            status: WorkflowStatus::Running,
            context: merged,
            steps: template.steps.iter().map(StepState::new).collect(),
            completed_steps: BTreeSet::new(),
            failed_steps: BTreeSet::new(),
            current_steps: BTreeSet::new(),
            pending_approval: None,
            created_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut StepState> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn all_done(&self) -> bool {
        self.completed_steps.len() == self.steps.len()
    }

    pub fn template_context(&self) -> TemplateContext {
        TemplateContext::from_map(self.context.clone()).with_workflow(self.template_id.clone())
    }

    /// Read-only view of the context handed to a step
    pub fn projection(&self, step: &StepConfig) -> Map<String, Value> {
        if step.inputs.is_empty() {
            return self.context.clone();
        }
        step.inputs
            .iter()
            .filter_map(|key| self.context.get(key).map(|v| (key.clone(), v.clone())))
            .collect()
    }

    pub fn mark_running(&mut self, id: &str) {
        if let Some(step) = self.step_mut(id) {
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
        }
        self.current_steps.insert(id.to_string());
    }

    /// Store a finished step's output and expose it to dependents
    ///
    /// The whole output lands under the step id; each declared output key
    /// is also copied to the top level.
    pub fn record_output(&mut self, step: &StepConfig, output: Value) {
        for key in &step.outputs {
            if let Some(value) = output.get(key) {
                self.context.insert(key.clone(), value.clone());
            }
        }
        self.context.insert(step.id.clone(), output.clone());

        if let Some(state) = self.step_mut(&step.id) {
            state.status = StepStatus::Completed;
            state.completed_at = Some(Utc::now());
            state.output = Some(output);
        }
        self.current_steps.remove(&step.id);
        self.completed_steps.insert(step.id.clone());
    }

    pub fn record_failure(&mut self, id: &str, failure: EngineFailure) {
        if let Some(state) = self.step_mut(id) {
            state.status = StepStatus::Failed;
            state.completed_at = Some(Utc::now());
            state.error = Some(failure);
        }
        self.current_steps.remove(id);
        self.failed_steps.insert(id.to_string());
    }

    pub fn record_discarded(&mut self, id: &str) {
        if let Some(state) = self.step_mut(id) {
            state.status = StepStatus::Discarded;
            state.completed_at = Some(Utc::now());
        }
        self.current_steps.remove(id);
    }

    fn mark_skipped(&mut self, id: &str, reason: String, propagates: bool) {
        if let Some(state) = self.step_mut(id) {
            state.status = StepStatus::Skipped;
            state.completed_at = Some(Utc::now());
            state.skip_reason = Some(reason);
            state.skip_propagates = propagates;
        }
        self.completed_steps.insert(id.to_string());
    }

    /// Move the workflow to a terminal failure unless it already ended
    pub fn fail(&mut self, failure: EngineFailure) {
        if !self.status.is_terminal() {
            self.status = WorkflowStatus::Failed;
            self.error = Some(failure);
            self.pending_approval = None;
        }
    }

    /// Work out the next round
    ///
    /// Pending steps whose dependencies are all complete are either skipped
    /// (false condition, or a dependency on a skipped approval gate) or
    /// returned as ready. Skips can unlock further steps, so planning
    /// repeats until nothing changes.
    pub fn plan(&mut self, template: &WorkflowTemplate) -> Result<RoundPlan, TemplateError> {
        let mut plan = RoundPlan::default();

        loop {
            let mut changed = false;
            let ctx = self.template_context();

            for step in &template.steps {
                let pending = self
                    .step(&step.id)
                    .is_some_and(|s| s.status == StepStatus::Pending);
                if !pending
                    || plan.work.contains(&step.id)
                    || plan.approvals.contains(&step.id)
                    || !step.depends_on.iter().all(|d| self.completed_steps.contains(d))
                {
                    continue;
                }

                let blocked_by = step.depends_on.iter().find(|d| {
                    self.step(d)
                        .is_some_and(|s| s.status == StepStatus::Skipped && s.skip_propagates)
                });
                if let Some(gate) = blocked_by {
                    let reason = format!("dependency '{}' was skipped", gate);
                    self.mark_skipped(&step.id, reason.clone(), true);
                    plan.skipped.push((step.id.clone(), reason));
                    changed = true;
                    continue;
                }

                if let Some(condition) = &step.condition {
                    if !evaluate_condition(condition, &ctx)? {
                        let reason = format!("condition '{}' is false", condition);
                        let propagates = step.step_type == StepType::Approval;
                        self.mark_skipped(&step.id, reason.clone(), propagates);
                        plan.skipped.push((step.id.clone(), reason));
                        changed = true;
                        continue;
                    }
                }

                match step.step_type {
                    StepType::Approval => plan.approvals.push(step.id.clone()),
                    _ => plan.work.push(step.id.clone()),
                }
            }

            if !changed {
                break;
            }
        }

        Ok(plan)
    }

    /// Pending steps and what each is still waiting on
    pub fn blocked_steps(&self, template: &WorkflowTemplate) -> Vec<(String, Vec<String>)> {
        template
            .steps
            .iter()
            .filter(|s| {
                self.step(&s.id)
                    .is_some_and(|state| state.status == StepStatus::Pending)
            })
            .map(|s| {
                let waiting = s
                    .depends_on
                    .iter()
                    .filter(|d| !self.completed_steps.contains(*d))
                    .cloned()
                    .collect();
                (s.id.clone(), waiting)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(steps: Vec<StepConfig>) -> WorkflowTemplate {
        WorkflowTemplate {
            id: "test".into(),
            steps,
            ..Default::default()
        }
    }

    fn gated() -> WorkflowTemplate {
        template(vec![
            StepConfig::task("analyze", "Analyze"),
            StepConfig::task("prioritize", "Prioritize").depends_on(&["analyze"]),
            StepConfig::approval("approve")
                .depends_on(&["prioritize"])
                .when("analyze.success"),
            StepConfig::task("implement", "Implement").depends_on(&["approve"]),
        ])
    }

    #[test]
    fn test_context_merge_and_projection() {
        let mut tpl = template(vec![StepConfig::task("a", "A")]);
        tpl.context.insert("repo".into(), json!("default"));
        tpl.context.insert("branch".into(), json!("main"));

        let ctx = json!({"repo": "acme"}).as_object().unwrap().clone();
        let wf = Workflow::new(WorkflowId::new(), &tpl, ctx);
        assert_eq!(wf.context["repo"], "acme");
        assert_eq!(wf.context["branch"], "main");

        let mut step = StepConfig::task("b", "B");
        step.inputs = vec!["repo".into(), "missing".into()];
        let projected = wf.projection(&step);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected["repo"], "acme");
    }

    #[test]
    fn test_plan_respects_dependencies() {
        let tpl = gated();
        let mut wf = Workflow::new(WorkflowId::new(), &tpl, Map::new());

        let plan = wf.plan(&tpl).unwrap();
        assert_eq!(plan.work, vec!["analyze"]);
        assert!(plan.approvals.is_empty());

        wf.mark_running("analyze");
        assert!(wf.plan(&tpl).unwrap().work.is_empty());

        wf.record_output(&tpl.steps[0], json!({"success": true}));
        assert_eq!(wf.plan(&tpl).unwrap().work, vec!["prioritize"]);
    }

    #[test]
    fn test_false_gate_condition_skips_dependents() {
        let tpl = gated();
        let mut wf = Workflow::new(WorkflowId::new(), &tpl, Map::new());
        wf.record_output(&tpl.steps[0], json!({"success": false}));
        wf.record_output(&tpl.steps[1], json!({"success": true}));

        let plan = wf.plan(&tpl).unwrap();
        assert!(plan.work.is_empty());
        assert!(plan.approvals.is_empty());
        let skipped: Vec<_> = plan.skipped.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(skipped, vec!["approve", "implement"]);
        assert!(wf.all_done());
        assert_eq!(wf.step("implement").unwrap().status, StepStatus::Skipped);
    }

    #[test]
    fn test_true_gate_condition_waits_for_approval() {
        let tpl = gated();
        let mut wf = Workflow::new(WorkflowId::new(), &tpl, Map::new());
        wf.record_output(&tpl.steps[0], json!({"success": true}));
        wf.record_output(&tpl.steps[1], json!({}));

        let plan = wf.plan(&tpl).unwrap();
        assert_eq!(plan.approvals, vec!["approve"]);
        assert!(plan.work.is_empty());
    }

    #[test]
    fn test_skipped_task_does_not_propagate() {
        let tpl = template(vec![
            StepConfig::task("lint", "Lint").when("run_lint"),
            StepConfig::task("report", "Report").depends_on(&["lint"]),
        ]);
        let mut wf = Workflow::new(WorkflowId::new(), &tpl, Map::new());

        let plan = wf.plan(&tpl).unwrap();
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.work, vec!["report"]);
    }

    #[test]
    fn test_declared_outputs_copied_to_top_level() {
        let mut step = StepConfig::task("analyze", "Analyze");
        step.outputs = vec!["bugs".into()];
        let tpl = template(vec![step.clone()]);
        let mut wf = Workflow::new(WorkflowId::new(), &tpl, Map::new());

        wf.record_output(&step, json!({"success": true, "bugs": 3}));
        assert_eq!(wf.context["bugs"], 3);
        assert_eq!(wf.context["analyze"]["success"], true);
        assert!(wf.completed_steps.contains("analyze"));
    }

    #[test]
    fn test_blocked_steps_for_cycle() {
        let tpl = template(vec![
            StepConfig::task("a", "A").depends_on(&["b"]),
            StepConfig::task("b", "B").depends_on(&["a"]),
        ]);
        let mut wf = Workflow::new(WorkflowId::new(), &tpl, Map::new());
        assert_eq!(wf.plan(&tpl).unwrap(), RoundPlan::default());

        let blocked = wf.blocked_steps(&tpl);
        assert_eq!(blocked[0], ("a".to_string(), vec!["b".to_string()]));
    }

    #[test]
    fn test_fail_keeps_first_error() {
        let tpl = template(vec![StepConfig::task("a", "A")]);
        let mut wf = Workflow::new(WorkflowId::new(), &tpl, Map::new());
        wf.fail(EngineFailure::new(crate::error::ErrorKind::ExecutionError, "first"));
        wf.fail(EngineFailure::new(crate::error::ErrorKind::Timeout, "second"));
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert_eq!(wf.error.unwrap().message, "first");
    }
}
