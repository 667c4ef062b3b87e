//! Instruction construction for the external worker

use serde_json::{Value, json};

use super::JobError;
use super::markers::protocol_description;
use crate::store::Task;
use crate::template::{TemplateContext, TemplateEngine};

/// Default instruction layout
pub const DEFAULT_INSTRUCTION_TEMPLATE: &str = r#"{{ prompt }}
{% if context %}

## Context

```json
{{ context | json }}
```
{% endif %}
{% if stages %}

## Stages

Work through these stages in order:
{% for stage in stages %}
{{ loop.index }}. {{ stage.name }}
{% endfor %}
{% endif %}

## Progress reporting

{{ protocol }}
"#;

/// Builds worker instructions from tasks
#[derive(Clone)]
pub struct InstructionBuilder {
    engine: TemplateEngine,
    template: String,
}

impl Default for InstructionBuilder {
    fn default() -> Self {
        Self::new(None)
    }
}

impl InstructionBuilder {
    pub fn new(template: Option<String>) -> Self {
        Self {
            engine: TemplateEngine::new(),
            template: template.unwrap_or_else(|| DEFAULT_INSTRUCTION_TEMPLATE.to_string()),
        }
    }

    /// Check the configured template parses
    pub fn validate(&self) -> Result<(), JobError> {
        self.engine
            .validate(&self.template)
            .map_err(|e| JobError::Instruction(e.to_string()))
    }

    /// Render the instruction for one attempt
    pub fn build(&self, task: &Task) -> Result<String, JobError> {
        let stages: Vec<Value> = task
            .stages
            .iter()
            .map(|s| json!({ "name": s.name, "weight": s.weight }))
            .collect();

        let mut ctx = TemplateContext::new();
        ctx.insert("prompt", Value::String(task.prompt.clone()));
        ctx.insert("task_type", Value::String(task.task_type.clone()));
        ctx.insert("task_id", Value::String(task.id.to_string()));
        ctx.insert("attempt", json!(task.attempts));
        ctx.insert("context", Value::Object(task.context.clone()));
        ctx.insert("stages", Value::Array(stages));
        ctx.insert("protocol", Value::String(protocol_description().to_string()));

        self.engine
            .render(&self.template, &ctx)
            .map(|s| s.trim_end().to_string() + "\n")
            .map_err(|e| JobError::Instruction(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageSpec;
    use crate::store::TaskSpec;

    fn task() -> Task {
        let spec = TaskSpec::new("analysis", "Find the bug in parser.rs")
            .with_context("repo", json!("acme/widgets"));
        Task::from_spec(
            spec,
            0,
            &[StageSpec::new("analyze", 1.0), StageSpec::new("report", 1.0)],
        )
    }

    #[test]
    fn test_default_instruction_contents() {
        let text = InstructionBuilder::default().build(&task()).unwrap();
        assert!(text.starts_with("Find the bug in parser.rs"));
        assert!(text.contains("\"repo\": \"acme/widgets\""));
        assert!(text.contains("1. analyze"));
        assert!(text.contains("2. report"));
        assert!(text.contains("[STAGE] <stage name>"));
        assert!(text.contains("[PROGRESS] <0-100>"));
    }

    #[test]
    fn test_empty_context_and_stages_omitted() {
        let task = Task::from_spec(TaskSpec::new("t", "Just do it"), 0, &[]);
        let text = InstructionBuilder::default().build(&task).unwrap();
        assert!(!text.contains("## Context"));
        assert!(!text.contains("## Stages"));
        assert!(text.contains("## Progress reporting"));
    }

    #[test]
    fn test_custom_template() {
        let builder = InstructionBuilder::new(Some("[{{ task_type }}] {{ prompt }}".into()));
        assert_eq!(
            builder.build(&task()).unwrap(),
            "[analysis] Find the bug in parser.rs\n"
        );
    }

    #[test]
    fn test_custom_template_errors() {
        let builder = InstructionBuilder::new(Some("{{ missing_var }}".into()));
        assert!(matches!(builder.build(&task()), Err(JobError::Instruction(_))));

        let broken = InstructionBuilder::new(Some("{% if %}".into()));
        assert!(broken.validate().is_err());
    }
}
