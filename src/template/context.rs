//! Template context for variable resolution

use minijinja::value::{Enumerator, Object, Value};
use serde_json::Map;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Values visible to templates and conditions
///
/// Context keys are exposed at the top level (`analyze.success`, `repo`),
/// alongside `workflow` and a lazy `env` lookup.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    /// Workflow context or task payload
    pub values: Map<String, serde_json::Value>,

    /// Workflow or template id
    pub workflow: Option<String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: Map<String, serde_json::Value>) -> Self {
        Self {
            values,
            workflow: None,
        }
    }

    pub fn with_workflow(mut self, name: impl Into<String>) -> Self {
        self.workflow = Some(name.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    /// Convert to a minijinja Value for template rendering
    pub fn to_value(&self) -> Value {
        let mut root: BTreeMap<String, Value> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_serialize(v)))
            .collect();
        if let Some(workflow) = &self.workflow {
            root.insert("workflow".into(), Value::from(workflow.clone()));
        }
        root.insert("env".into(), Value::from_object(EnvObject));
        Value::from(root)
    }

    /// Known top-level names for error suggestions
    pub fn known_variables(&self) -> Vec<&str> {
        let mut vars: Vec<&str> = self.values.keys().map(|k| k.as_str()).collect();
        vars.push("env");
        if self.workflow.is_some() {
            vars.push("workflow");
        }
        vars
    }
}

/// Object for lazy environment variable access
#[derive(Debug, Clone, Copy)]
struct EnvObject;

impl fmt::Display for EnvObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env")
    }
}

impl Object for EnvObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let name = key.as_str()?;
        std::env::var(name).ok().map(Value::from)
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::NonEnumerable
    }
}
