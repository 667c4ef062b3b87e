//! Workflow template and step configuration

use super::sections::StageSpec;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Step type - explicit, not inferred
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    /// Dispatch a task to the worker pool
    Task,
    /// Suspend the workflow until an external actor decides
    Approval,
    /// Collect context values into a single object
    Aggregate,
    /// Render a text report from context values
    Report,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Task => "task",
            StepType::Approval => "approval",
            StepType::Aggregate => "aggregate",
            StepType::Report => "report",
        }
    }
}

/// Configuration for a workflow step
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    /// Step id (unique within the template)
    #[serde(alias = "name")]
    pub id: String,

    /// Step type
    #[serde(rename = "type")]
    pub step_type: StepType,

    /// Steps this step depends on
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Conditional execution expression over the workflow context
    #[serde(rename = "if", alias = "condition")]
    pub condition: Option<String>,

    /// Context keys projected into the step (empty = whole context)
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Keys of the step result copied into the workflow context
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Instruction template (task steps)
    pub prompt: Option<String>,

    /// Task type used for worker-class routing (task steps)
    pub task_type: Option<String>,

    /// Queue priority (task steps)
    pub priority: Option<i32>,

    /// Timeout in milliseconds (task steps)
    pub timeout_ms: Option<u64>,

    /// Retry budget (task steps)
    pub retries: Option<u32>,

    /// Progress stages declared to the worker (task steps)
    #[serde(default)]
    pub stages: Vec<StageSpec>,

    /// Extra payload handed to the job runner (task steps)
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,

    /// Message shown to the approver (approval steps)
    pub message: Option<String>,

    /// Expiry for this gate in milliseconds (approval steps)
    pub approval_timeout_ms: Option<u64>,

    /// Report template (report steps)
    pub template: Option<String>,

    /// Weight of this step in aggregate workflow progress
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            step_type: StepType::Task,
            depends_on: Vec::new(),
            condition: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            prompt: None,
            task_type: None,
            priority: None,
            timeout_ms: None,
            retries: None,
            stages: Vec::new(),
            payload: serde_json::Map::new(),
            message: None,
            approval_timeout_ms: None,
            template: None,
            weight: default_weight(),
        }
    }
}

impl StepConfig {
    /// Task step with a prompt
    pub fn task(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: StepType::Task,
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    /// Approval gate
    pub fn approval(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: StepType::Approval,
            ..Default::default()
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// A workflow template: a DAG of steps
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowTemplate {
    /// Template id; the loader falls back to the file stem
    #[serde(default, alias = "name")]
    pub id: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Template version
    pub version: Option<u32>,

    /// Initial context values merged under the caller's context
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,

    /// Steps in this workflow
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

impl WorkflowTemplate {
    /// Structural checks that do not need a cycle search
    pub fn validate_structure(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.steps.is_empty() {
            errors.push(format!("workflow '{}' has no steps", self.id));
        }

        let mut seen_ids = HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                errors.push("step with empty id".to_string());
            }
            if !seen_ids.insert(&step.id) {
                errors.push(format!("duplicate step id: {}", step.id));
            }
        }

        let step_ids: HashSet<_> = self.steps.iter().map(|s| s.id.as_str()).collect();
        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    errors.push(format!("step '{}' depends on itself", step.id));
                } else if !step_ids.contains(dep.as_str()) {
                    errors.push(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    ));
                }
            }
        }

        for step in &self.steps {
            match step.step_type {
                StepType::Task => {
                    if step.prompt.is_none() {
                        errors.push(format!("task step '{}' missing 'prompt' field", step.id));
                    }
                }
                StepType::Report => {
                    if step.template.is_none() {
                        errors.push(format!(
                            "report step '{}' missing 'template' field",
                            step.id
                        ));
                    }
                }
                StepType::Approval | StepType::Aggregate => {}
            }
            if step.weight < 0.0 {
                errors.push(format!("step '{}' has negative weight", step.id));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Full validation including dependency cycles
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = match self.validate_structure() {
            Ok(()) => Vec::new(),
            Err(errors) => errors,
        };

        if let Some(step) = self.find_cycle() {
            errors.push(format!("circular dependency detected involving step '{}'", step));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Depth-first search for a dependency cycle, returning a step on it
    pub fn find_cycle(&self) -> Option<String> {
        let deps: HashMap<&str, Vec<&str>> = self
            .steps
            .iter()
            .map(|s| {
                (
                    s.id.as_str(),
                    s.depends_on.iter().map(|d| d.as_str()).collect(),
                )
            })
            .collect();

        fn visit<'a>(
            step: &'a str,
            deps: &HashMap<&'a str, Vec<&'a str>>,
            visited: &mut HashSet<&'a str>,
            in_progress: &mut HashSet<&'a str>,
        ) -> Option<String> {
            if visited.contains(step) {
                return None;
            }
            if !in_progress.insert(step) {
                return Some(step.to_string());
            }
            for dep in deps.get(step).into_iter().flatten() {
                if let Some(found) = visit(dep, deps, visited, in_progress) {
                    return Some(found);
                }
            }
            in_progress.remove(step);
            visited.insert(step);
            None
        }

        let mut visited = HashSet::new();
        let mut in_progress = HashSet::new();
        for step in &self.steps {
            if let Some(found) = visit(&step.id, &deps, &mut visited, &mut in_progress) {
                return Some(found);
            }
        }
        None
    }

    pub fn step(&self, id: &str) -> Option<&StepConfig> {
        self.steps.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_config_task() {
        let toml = r#"
            id = "analyze"
            type = "task"
            prompt = "Find bugs in {{ repo }}"
            outputs = ["findings"]
            retries = 2
        "#;
        let step: StepConfig = toml::from_str(toml).unwrap();
        assert_eq!(step.id, "analyze");
        assert_eq!(step.step_type, StepType::Task);
        assert_eq!(step.outputs, vec!["findings"]);
        assert_eq!(step.retries, Some(2));
        assert_eq!(step.weight, 1.0);
    }

    #[test]
    fn test_template_without_id_parses() {
        let toml = r#"
            description = "nightly sweep"

            [[steps]]
            id = "collect"
            type = "aggregate"
        "#;
        let template: WorkflowTemplate = toml::from_str(toml).unwrap();
        assert!(template.id.is_empty());
        assert_eq!(template.steps.len(), 1);
    }

    #[test]
    fn test_step_config_condition_alias() {
        let toml = r#"
            name = "approve"
            type = "approval"
            depends_on = ["prioritize"]
            if = "analyze.success"
        "#;
        let step: StepConfig = toml::from_str(toml).unwrap();
        assert_eq!(step.id, "approve");
        assert_eq!(step.condition.as_deref(), Some("analyze.success"));
        assert_eq!(step.depends_on, vec!["prioritize"]);
    }

    #[test]
    fn test_workflow_template() {
        let toml = r#"
            id = "triage"
            description = "Analyze and fix"

            [context]
            repo = "example/repo"

            [[steps]]
            id = "analyze"
            type = "task"
            prompt = "Analyze"

            [[steps]]
            id = "summary"
            type = "report"
            template = "{{ analyze.summary }}"
            depends_on = ["analyze"]
        "#;
        let template: WorkflowTemplate = toml::from_str(toml).unwrap();
        assert_eq!(template.id, "triage");
        assert_eq!(template.steps.len(), 2);
        assert_eq!(template.context["repo"], "example/repo");
        assert!(template.validate().is_ok());
    }

    #[test]
    fn test_workflow_validation() {
        let template = WorkflowTemplate {
            id: "bad".into(),
            steps: vec![
                StepConfig::task("good", "do it"),
                StepConfig {
                    id: "no_prompt".into(),
                    step_type: StepType::Task,
                    depends_on: vec!["nonexistent".into()],
                    ..Default::default()
                },
                StepConfig {
                    id: "report".into(),
                    step_type: StepType::Report,
                    ..Default::default()
                },
                StepConfig::task("good", "duplicate"),
            ],
            ..Default::default()
        };

        let errors = template.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("nonexistent")));
        assert!(errors.iter().any(|e| e.contains("'prompt'")));
        assert!(errors.iter().any(|e| e.contains("'template'")));
        assert!(errors.iter().any(|e| e.contains("duplicate")));
    }

    #[test]
    fn test_cycle_detection() {
        let template = WorkflowTemplate {
            id: "circular".into(),
            steps: vec![
                StepConfig::task("a", "a").depends_on(&["b"]),
                StepConfig::task("b", "b").depends_on(&["a"]),
            ],
            ..Default::default()
        };

        assert!(template.validate_structure().is_ok());
        assert!(template.find_cycle().is_some());
        let errors = template.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("circular")));
    }

    #[test]
    fn test_linear_has_no_cycle() {
        let template = WorkflowTemplate {
            id: "linear".into(),
            steps: vec![
                StepConfig::task("a", "a"),
                StepConfig::task("b", "b").depends_on(&["a"]),
                StepConfig::task("c", "c").depends_on(&["b"]),
            ],
            ..Default::default()
        };
        assert!(template.find_cycle().is_none());
    }

    #[test]
    fn test_self_dependency() {
        let template = WorkflowTemplate {
            id: "selfish".into(),
            steps: vec![StepConfig::task("a", "a").depends_on(&["a"])],
            ..Default::default()
        };
        let errors = template.validate_structure().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("itself")));
    }
}
