//! CLI command implementations

use super::output::OutputHandler;
use crate::config::{EngineConfig, WorkflowSettings, load_template, load_template_file};
use crate::engine::{Engine, EngineEvent};
use crate::shutdown::{CancellationToken, with_cancellation};
use crate::store::{TaskId, TaskSpec};
use crate::workflow::{StartOptions, WorkflowEvent, WorkflowId};
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::io::{self, BufRead, Write};
use std::path::Path;

/// How the CLI answers approval gates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ApprovalMode {
    /// Ask on the terminal
    #[default]
    Prompt,
    /// Approve every gate
    Approve,
    /// Reject every gate
    Reject,
}

/// Parse `key=value` arguments into a context map
///
/// Values that parse as JSON keep their type; anything else is a string.
pub fn parse_context(args: &[String]) -> Result<Map<String, Value>> {
    let mut context = Map::new();
    for arg in args {
        let (key, raw) = arg
            .split_once('=')
            .with_context(|| format!("context argument '{}' is not key=value", arg))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        context.insert(key.trim().to_string(), value);
    }
    Ok(context)
}

fn concerns_task(event: &EngineEvent, id: TaskId) -> bool {
    match event {
        EngineEvent::Pool(event) => event.task_id() == Some(id),
        EngineEvent::Progress(event) => event.subject_id() == id.to_string(),
        EngineEvent::Workflow(_) => false,
    }
}

fn concerns_workflow(event: &EngineEvent, id: WorkflowId) -> bool {
    match event {
        EngineEvent::Workflow(event) => event.workflow_id() == id,
        EngineEvent::Progress(event) => event.subject_id() == id.to_string(),
        // Step tasks are not linked to their workflow in pool events
        EngineEvent::Pool(_) => true,
    }
}

/// Submit one task and follow it to a terminal status
pub async fn run_task(
    engine: &Engine,
    spec: TaskSpec,
    shutdown: &CancellationToken,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let mut events = engine.subscribe();
    let id = engine.submit(spec).await;
    handler.info(&format!("Submitted task {}", id));

    let wait = engine.wait_task(id);
    tokio::pin!(wait);
    let mut cancelling = false;

    loop {
        tokio::select! {
            finished = &mut wait => {
                finished?;
                break;
            }
            received = events.recv() => {
                if let Ok(event) = received {
                    if concerns_task(&event, id) {
                        handler.event(&event);
                    }
                }
            }
            _ = shutdown.cancelled(), if !cancelling => {
                cancelling = true;
                handler.info("Cancelling task...");
                engine.cancel_task(id).await;
            }
        }
    }

    while let Ok(event) = events.try_recv() {
        if concerns_task(&event, id) {
            handler.event(&event);
        }
    }

    let report = engine
        .get_status(&id.to_string())
        .await
        .with_context(|| format!("task {} disappeared", id))?;
    handler.result(&report);
    Ok(if report.status == "completed" { 0 } else { 1 })
}

/// Ask the operator for a decision on stdin
async fn prompt_decision(step: String, shutdown: &CancellationToken) -> Option<bool> {
    let ask = tokio::task::spawn_blocking(move || {
        eprint!("Approve step '{}'? [y/N] ", step);
        let _ = io::stderr().flush();
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).ok()?;
        Some(matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
    });

    with_cancellation(shutdown, ask)
        .await
        .and_then(|answer| answer.ok().flatten())
}

/// Start a workflow and follow it, answering approval gates per `approvals`
pub async fn run_workflow(
    engine: &Engine,
    template_id: &str,
    context: Map<String, Value>,
    approvals: ApprovalMode,
    shutdown: &CancellationToken,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let mut events = engine.subscribe();
    let id = engine
        .start_workflow(template_id, StartOptions::with_context(context))
        .await?;

    let wait = engine.wait_workflow(id);
    tokio::pin!(wait);
    let mut cancelling = false;

    loop {
        tokio::select! {
            finished = &mut wait => {
                finished?;
                break;
            }
            received = events.recv() => {
                let Ok(event) = received else { continue };
                if !concerns_workflow(&event, id) {
                    continue;
                }
                handler.event(&event);

                if let EngineEvent::Workflow(WorkflowEvent::ApprovalRequested { step, .. }) = event {
                    let decision = match approvals {
                        ApprovalMode::Approve => Some(true),
                        ApprovalMode::Reject => Some(false),
                        ApprovalMode::Prompt => prompt_decision(step, shutdown).await,
                    };
                    match decision {
                        Some(approved) => {
                            engine.respond_to_approval(id, approved, None).await?;
                        }
                        None if !cancelling => {
                            cancelling = true;
                            let _ = engine.cancel_workflow(id).await;
                        }
                        None => {}
                    }
                }
            }
            _ = shutdown.cancelled(), if !cancelling => {
                cancelling = true;
                handler.info("Cancelling workflow...");
                let _ = engine.cancel_workflow(id).await;
            }
        }
    }

    while let Ok(event) = events.try_recv() {
        if concerns_workflow(&event, id) {
            handler.event(&event);
        }
    }

    let report = engine
        .get_status(&id.to_string())
        .await
        .with_context(|| format!("workflow {} disappeared", id))?;
    handler.result(&report);
    Ok(if report.status == "completed" { 0 } else { 1 })
}

/// Validate a template given by id or file path
pub fn validate_template(
    target: &str,
    project_dir: Option<&Path>,
    settings: &WorkflowSettings,
    handler: &dyn OutputHandler,
) -> i32 {
    let path = Path::new(target);
    let loaded = if path.is_file() {
        load_template_file(path)
    } else {
        load_template(target, project_dir, settings)
    };

    let template = match loaded {
        Ok(template) => template,
        Err(e) => {
            handler.info(&format!("✗ Failed to load workflow template: {:#}", e));
            return 1;
        }
    };

    match template.validate() {
        Ok(()) => {
            handler.info(&format!(
                "✓ Workflow '{}' is valid ({} steps)",
                template.id,
                template.steps.len()
            ));
            0
        }
        Err(errors) => {
            handler.info(&format!(
                "✗ Workflow '{}' has {} error(s):",
                template.id,
                errors.len()
            ));
            for err in &errors {
                handler.info(&format!("  - {}", err));
            }
            1
        }
    }
}

/// Print the effective configuration as TOML
pub fn show_config(config: &EngineConfig) -> Result<i32> {
    let rendered = toml::to_string_pretty(config).context("serializing configuration")?;
    println!("{}", rendered);
    Ok(0)
}
