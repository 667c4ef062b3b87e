//! CLI support for the taskmux binary
//!
//! This module provides:
//! - Command implementations (run-task, run-workflow, validate, config)
//! - Output handlers (console, JSON lines, quiet)
//!
//! # Example
//!
//! ```ignore
//! use task_mux::cli::{commands, output};
//!
//! let handler = output::create_handler(output::OutputMode::Console, false);
//! let code = commands::run_task(&engine, spec, &shutdown, &*handler).await?;
//! ```

pub mod commands;
pub mod output;

pub use commands::{
    ApprovalMode, parse_context, run_task, run_workflow, show_config, validate_template,
};
pub use output::{OutputHandler, OutputMode, create_handler};
