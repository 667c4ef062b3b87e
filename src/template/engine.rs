//! Template engine for rendering instructions and reports

use super::context::TemplateContext;
use super::errors::TemplateError;
use super::filters;
use minijinja::{Environment, UndefinedBehavior};

/// Template rendering engine
///
/// Wraps minijinja with custom filters. Strict engines reject undefined
/// variables; lenient engines render them as empty and let attribute
/// access on them chain.
#[derive(Clone)]
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Engine with strict undefined handling
    pub fn new() -> Self {
        Self::with_behavior(UndefinedBehavior::Strict)
    }

    /// Engine where missing values render empty (reports over skipped steps)
    pub fn lenient() -> Self {
        Self::with_behavior(UndefinedBehavior::Chainable)
    }

    fn with_behavior(behavior: UndefinedBehavior) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(behavior);
        env.set_trim_blocks(true);
        filters::register_filters(&mut env);
        Self { env }
    }

    /// Render a template string with the given context
    pub fn render(&self, template: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
        self.env
            .render_str(template, ctx.to_value())
            .map_err(|e| convert_minijinja_error(e, ctx))
    }

    /// Render a template and return the result trimmed
    pub fn render_trimmed(
        &self,
        template: &str,
        ctx: &TemplateContext,
    ) -> Result<String, TemplateError> {
        self.render(template, ctx).map(|s| s.trim().to_string())
    }

    /// Check if a template is syntactically valid
    pub fn validate(&self, template: &str) -> Result<(), TemplateError> {
        let mut env = self.env.clone();
        env.add_template_owned("__validate__".to_string(), template.to_string())
            .map_err(|e| TemplateError::syntax(e.to_string(), e.line().unwrap_or(0)))?;
        Ok(())
    }

    pub(crate) fn environment(&self) -> &Environment<'static> {
        &self.env
    }
}

/// Convert a minijinja error to our TemplateError type
pub(crate) fn convert_minijinja_error(err: minijinja::Error, ctx: &TemplateContext) -> TemplateError {
    let line = err.line().unwrap_or(0);

    match err.kind() {
        minijinja::ErrorKind::UndefinedError => {
            let name = extract_var_from_error(&err);
            TemplateError::undefined_variable(name, line, &ctx.known_variables())
        }
        minijinja::ErrorKind::SyntaxError => TemplateError::syntax(err.to_string(), line),
        _ => TemplateError::Internal(err),
    }
}

/// Pull the offending expression out of the error's source span
fn extract_var_from_error(err: &minijinja::Error) -> String {
    if let (Some(source), Some(range)) = (err.template_source(), err.range()) {
        if let Some(span) = source.get(range) {
            return span.trim().to_string();
        }
    }
    "unknown".to_string()
}
