//! External worker process configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How to launch the external process that performs a task
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Command to execute
    #[serde(default = "default_command")]
    pub command: String,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Additional environment variables for the command
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_command() -> String {
    "claude".into()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: vec!["-p".into()],
            env: HashMap::new(),
        }
    }
}

impl WorkerConfig {
    /// Run the worker through `sh -c` (used by tests and ad-hoc scripts)
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: HashMap::new(),
        }
    }

    /// Human-readable command line for logs
    pub fn display_command(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal() {
        let config: WorkerConfig = toml::from_str(r#"command = "codex""#).unwrap();
        assert_eq!(config.command, "codex");
        assert!(config.args.is_empty());
        assert!(config.env.is_empty());
    }

    #[test]
    fn test_deserialize_full() {
        let config: WorkerConfig = toml::from_str(
            r#"
            command = "claude"
            args = ["-p", "--output-format", "text"]

            [env]
            CLAUDE_CONFIG_DIR = "/tmp/claude"
        "#,
        )
        .unwrap();
        assert_eq!(config.args.len(), 3);
        assert_eq!(config.env["CLAUDE_CONFIG_DIR"], "/tmp/claude");
    }

    #[test]
    fn test_shell_worker() {
        let config = WorkerConfig::shell("cat");
        assert_eq!(config.display_command(), "sh -c cat");
    }

    #[test]
    fn test_reject_unknown_fields() {
        let result: Result<WorkerConfig, _> = toml::from_str(
            r#"
            command = "claude"
            unknown_field = "value"
        "#,
        );
        assert!(result.is_err());
    }
}
