//! Output handlers for CLI commands
//!
//! Supports console (pretty), JSON lines, and quiet output modes.

use crate::engine::{EngineEvent, StatusReport};
use crate::pool::PoolEvent;
use crate::progress::ProgressEvent;
use crate::workflow::WorkflowEvent;
use serde::Serialize;
use std::time::Duration;

/// Output mode for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputMode {
    #[default]
    Console,
    Json,
    Quiet,
}

/// Output handler trait
pub trait OutputHandler: Send + Sync {
    /// Report an engine event
    fn event(&self, event: &EngineEvent);

    /// Informational line
    fn info(&self, message: &str);

    /// Write the final status
    fn result(&self, report: &StatusReport);
}

/// Human-readable output on stderr, result on stdout
pub struct ConsoleHandler {
    debug: bool,
}

impl ConsoleHandler {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    fn format_duration(ms: u64) -> String {
        if ms < 1000 {
            format!("{}ms", ms)
        } else {
            format!("{:.1}s", ms as f64 / 1000.0)
        }
    }

    fn format_eta(eta: Option<Duration>) -> String {
        match eta {
            Some(eta) => format!(", eta {}", Self::format_duration(eta.as_millis() as u64)),
            None => String::new(),
        }
    }

    fn pool_line(&self, event: &PoolEvent) -> Option<String> {
        let line = match event {
            PoolEvent::TaskStarted { task_id, slot, attempt } => {
                format!("task {} started on slot {} (attempt {})", task_id, slot, attempt)
            }
            PoolEvent::TaskCompleted { task_id, duration_ms, .. } => {
                format!("✓ task {} completed ({})", task_id, Self::format_duration(*duration_ms))
            }
            PoolEvent::TaskRetrying { task_id, retries_remaining, delay_ms, error, .. } => format!(
                "task {} failed ({}), retrying in {} ({} left)",
                task_id,
                error,
                Self::format_duration(*delay_ms),
                retries_remaining
            ),
            PoolEvent::TaskFailed { task_id, error } => format!("✗ task {} failed: {}", task_id, error),
            PoolEvent::TaskCancelled { task_id } => format!("task {} cancelled", task_id),
            PoolEvent::SlotRestarted { slot, restarts } => {
                format!("slot {} restarted ({} restarts)", slot, restarts)
            }
            PoolEvent::SlotRetired { slot, reason } => format!("slot {} retired: {}", slot, reason),
            PoolEvent::Degraded { capacity } => format!("pool degraded to {} slots", capacity),
            PoolEvent::Scaled { .. } if !self.debug => return None,
            PoolEvent::Scaled { from, to } => format!("pool scaled {} -> {}", from, to),
        };
        Some(line)
    }

    fn workflow_line(event: &WorkflowEvent) -> String {
        match event {
            WorkflowEvent::Started { template_id, .. } => format!("Running workflow '{}'", template_id),
            WorkflowEvent::StepStarted { step, .. } => format!("  {}...", step),
            WorkflowEvent::StepCompleted { step, .. } => format!("  ✓ {}", step),
            WorkflowEvent::StepSkipped { step, reason, .. } => format!("  - {} skipped ({})", step, reason),
            WorkflowEvent::StepFailed { step, error, .. } => format!("  ✗ {}: {}", step, error),
            WorkflowEvent::ApprovalRequested { step, message, .. } => match message {
                Some(message) => format!("Approval required for '{}': {}", step, message),
                None => format!("Approval required for '{}'", step),
            },
            WorkflowEvent::ApprovalResolved { step, approved, .. } => {
                let verdict = if *approved { "approved" } else { "rejected" };
                format!("  '{}' {}", step, verdict)
            }
            WorkflowEvent::Completed { .. } => "✓ Workflow completed".to_string(),
            WorkflowEvent::Failed { error, .. } => format!("✗ Workflow failed: {}", error),
            WorkflowEvent::Cancelled { .. } => "Workflow cancelled".to_string(),
        }
    }
}

impl OutputHandler for ConsoleHandler {
    fn event(&self, event: &EngineEvent) {
        let line = match event {
            EngineEvent::Pool(event) => self.pool_line(event),
            EngineEvent::Workflow(event) => Some(Self::workflow_line(event)),
            EngineEvent::Progress(ProgressEvent::Updated {
                subject_id,
                overall,
                stage,
                message,
            }) if self.debug => Some(format!(
                "[debug] {} {:.0}% {}{}",
                subject_id,
                overall,
                stage.as_deref().unwrap_or(""),
                message.as_deref().map(|m| format!(" - {}", m)).unwrap_or_default()
            )),
            EngineEvent::Progress(_) => None,
        };
        if let Some(line) = line {
            eprintln!("{}", line);
        }
    }

    fn info(&self, message: &str) {
        eprintln!("{}", message);
    }

    fn result(&self, report: &StatusReport) {
        eprintln!(
            "{} {}: {} ({:.0}%{})",
            if report.status == "completed" { "✓" } else { "✗" },
            report.id,
            report.status,
            report.progress,
            Self::format_eta(report.eta)
        );
        if let Some(error) = &report.error {
            eprintln!("Error: {}", error);
            if let Some(diagnostics) = &error.diagnostics {
                eprintln!("{}", diagnostics);
            }
        }
        if let Some(result) = &report.result {
            match result.get("summary").or_else(|| result.get("report")) {
                Some(serde_json::Value::String(text)) => println!("{}", text),
                _ => println!("{}", serde_json::to_string_pretty(result).unwrap_or_default()),
            }
        }
    }
}

/// One JSON document per line on stdout
pub struct JsonHandler {
    pretty: bool,
}

impl JsonHandler {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    fn print_json<T: Serialize>(&self, value: &T) {
        let json = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };

        if let Ok(s) = json {
            println!("{}", s);
        }
    }
}

impl OutputHandler for JsonHandler {
    fn event(&self, event: &EngineEvent) {
        self.print_json(event);
    }

    fn info(&self, message: &str) {
        #[derive(Serialize)]
        struct Info<'a> {
            info: &'a str,
        }

        self.print_json(&Info { info: message });
    }

    fn result(&self, report: &StatusReport) {
        self.print_json(report);
    }
}

/// Prints only the final status line
pub struct QuietHandler;

impl OutputHandler for QuietHandler {
    fn event(&self, _event: &EngineEvent) {}

    fn info(&self, _message: &str) {}

    fn result(&self, report: &StatusReport) {
        println!("{} {}", report.id, report.status);
    }
}

/// Create an output handler based on mode
pub fn create_handler(mode: OutputMode, debug: bool) -> Box<dyn OutputHandler> {
    match mode {
        OutputMode::Console => Box::new(ConsoleHandler::new(debug)),
        OutputMode::Json => Box::new(JsonHandler::new(false)),
        OutputMode::Quiet => Box::new(QuietHandler),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineFailure, ErrorKind};
    use crate::store::TaskId;

    #[test]
    fn test_console_format_duration() {
        assert_eq!(ConsoleHandler::format_duration(500), "500ms");
        assert_eq!(ConsoleHandler::format_duration(1000), "1.0s");
        assert_eq!(ConsoleHandler::format_duration(2500), "2.5s");
    }

    #[test]
    fn test_console_eta() {
        assert_eq!(ConsoleHandler::format_eta(None), "");
        assert_eq!(
            ConsoleHandler::format_eta(Some(Duration::from_millis(1500))),
            ", eta 1.5s"
        );
    }

    #[test]
    fn test_console_pool_lines() {
        let console = ConsoleHandler::new(false);
        let task_id = TaskId::new();
        let line = console
            .pool_line(&PoolEvent::TaskFailed {
                task_id,
                error: EngineFailure::new(ErrorKind::Timeout, "timeout after 5s"),
            })
            .unwrap();
        assert!(line.contains("timeout after 5s"));
        assert!(console.pool_line(&PoolEvent::Scaled { from: 1, to: 2 }).is_none());
        assert!(ConsoleHandler::new(true)
            .pool_line(&PoolEvent::Scaled { from: 1, to: 2 })
            .is_some());
    }

    #[test]
    fn test_create_handler() {
        let _ = create_handler(OutputMode::Console, false);
        let _ = create_handler(OutputMode::Json, false);
        let _ = create_handler(OutputMode::Quiet, false);
    }
}
