//! Template engine for task-mux
//!
//! Provides Jinja2-compatible templating for worker instructions, report
//! steps and step conditions.
//!
//! - Variable substitution: `{{ analyze.summary }}`, `{{ repo }}`
//! - Filters: `json`, `lines`, `bullets`, `clip`, `strftime`
//! - Conditions: `analyze.success and not approve.rejected`
//!
//! ```ignore
//! use task_mux::template::{TemplateEngine, TemplateContext};
//!
//! let engine = TemplateEngine::new();
//! let mut ctx = TemplateContext::new();
//! ctx.insert("repo", serde_json::json!("acme/widgets"));
//!
//! let prompt = engine.render("Review {{ repo }}", &ctx)?;
//! ```

mod conditionals;
mod context;
mod engine;
mod errors;
mod filters;

pub use conditionals::{evaluate_condition, should_execute_step};
pub use context::TemplateContext;
pub use engine::TemplateEngine;
pub use errors::TemplateError;
