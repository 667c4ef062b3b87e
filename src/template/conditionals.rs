//! Expression evaluation for step conditions
//!
//! Conditions are Jinja expressions over the workflow context, e.g.
//! `analyze.success and prioritize.items | length > 0`. Missing keys are
//! falsy instead of errors, so a condition over a skipped step is false.

use super::context::TemplateContext;
use super::engine::TemplateEngine;
use super::errors::TemplateError;

/// Evaluate a conditional expression against a context
pub fn evaluate_condition(expr: &str, ctx: &TemplateContext) -> Result<bool, TemplateError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Ok(true);
    }

    let engine = TemplateEngine::lenient();
    let compiled = engine
        .environment()
        .compile_expression_owned(expr.to_string())
        .map_err(|e| TemplateError::expression(format!("invalid expression syntax: {}", e)))?;

    let value = compiled
        .eval(ctx.to_value())
        .map_err(|e| TemplateError::expression(e.to_string()))?;

    Ok(value.is_true())
}

/// Check if a step should run given its optional condition
pub fn should_execute_step(
    condition: Option<&str>,
    ctx: &TemplateContext,
) -> Result<bool, TemplateError> {
    match condition {
        None => Ok(true),
        Some(cond) => evaluate_condition(cond, ctx),
    }
}
