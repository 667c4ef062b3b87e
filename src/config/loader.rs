//! Configuration loading with multi-layer merge

use super::{
    DeliveryConfig, PoolConfig, ProgressConfig, RunnerConfig, StoreConfig, WorkerConfig,
    WorkflowSettings, WorkflowTemplate,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level task-mux configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub runner: RunnerConfig,

    /// Default external worker
    pub worker: WorkerConfig,

    /// Per task-type worker overrides
    pub workers: HashMap<String, WorkerConfig>,

    pub progress: ProgressConfig,
    pub workflow: WorkflowSettings,
    pub delivery: DeliveryConfig,
    pub store: StoreConfig,
}

impl EngineConfig {
    /// Load configuration from the standard hierarchy
    ///
    /// Load order (later overrides earlier):
    /// 1. Built-in defaults
    /// 2. ~/.config/task-mux/config.toml
    /// 3. .task-mux/config.toml (project)
    pub fn load(project_dir: Option<&Path>) -> Result<Self> {
        let mut layers = Vec::new();

        if let Some(user_config_path) = Self::user_config_path() {
            if user_config_path.exists() {
                layers.push(user_config_path);
            }
        }

        let project_config_path = project_dir
            .map(|p| p.join(".task-mux/config.toml"))
            .unwrap_or_else(|| PathBuf::from(".task-mux/config.toml"));
        if project_config_path.exists() {
            layers.push(project_config_path);
        }

        Self::load_layers(&layers)
    }

    /// Merge the given files in order and build the configuration
    pub fn load_layers(paths: &[PathBuf]) -> Result<Self> {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        for path in paths {
            let layer = read_toml(path)?;
            merge_values(&mut merged, layer);
        }

        let mut config: Self = merged
            .try_into()
            .context("building configuration from merged layers")?;
        config.expand_paths();
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_file(path: &Path) -> Result<Self> {
        Self::load_layers(&[path.to_path_buf()])
    }

    /// Get the user config path (~/.config/task-mux/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("task-mux/config.toml"))
    }

    /// Worker configuration for a task type, falling back to the default worker
    pub fn worker_for(&self, task_type: Option<&str>) -> &WorkerConfig {
        task_type
            .and_then(|t| self.workers.get(t))
            .unwrap_or(&self.worker)
    }

    /// Sanity checks that serde cannot express
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.pool.size == 0 {
            errors.push("pool.size must be at least 1".to_string());
        }
        if self.pool.backoff_multiplier < 1.0 {
            errors.push("pool.backoff_multiplier must be >= 1.0".to_string());
        }
        if self.progress.sample_window < 2 {
            errors.push("progress.sample_window must be at least 2".to_string());
        }
        if self.progress.retain_finished == 0 {
            errors.push("progress.retain_finished must be at least 1".to_string());
        }
        if self.progress.default_stages.iter().any(|s| s.weight < 0.0) {
            errors.push("progress.default_stages weights must be non-negative".to_string());
        }
        if self.worker.command.trim().is_empty() {
            errors.push("worker.command must not be empty".to_string());
        }
        for (name, worker) in &self.workers {
            if worker.command.trim().is_empty() {
                errors.push(format!("workers.{}.command must not be empty", name));
            }
        }
        if self.delivery.max_attempts == 0 {
            errors.push("delivery.max_attempts must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn expand_paths(&mut self) {
        self.runner.workspace_root = expand_path(&self.runner.workspace_root);
        if let Some(dir) = self.workflow.templates_dir.as_mut() {
            *dir = expand_path(dir);
        }
        if let Some(path) = self.store.journal_path.as_mut() {
            *path = expand_path(path);
        }
    }
}

fn read_toml(path: &Path) -> Result<toml::Value> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: toml::Value =
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    Ok(value)
}

/// Recursively merge `overlay` into `base`; tables merge, everything else replaces
fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}

/// Load a workflow template from the standard hierarchy
///
/// Search order (first match wins):
/// 1. .task-mux/workflows/{id}.toml (project)
/// 2. the configured templates_dir
/// 3. ~/.config/task-mux/workflows/{id}.toml (user)
pub fn load_template(
    id: &str,
    project_dir: Option<&Path>,
    settings: &WorkflowSettings,
) -> Result<WorkflowTemplate> {
    let filename = format!("{}.toml", id);

    let project_path = project_dir
        .map(|p| p.join(".task-mux/workflows").join(&filename))
        .unwrap_or_else(|| PathBuf::from(".task-mux/workflows").join(&filename));
    if project_path.exists() {
        return load_template_file(&project_path);
    }

    if let Some(dir) = &settings.templates_dir {
        let configured_path = dir.join(&filename);
        if configured_path.exists() {
            return load_template_file(&configured_path);
        }
    }

    if let Some(user_dir) = dirs::config_dir() {
        let user_path = user_dir.join("task-mux/workflows").join(&filename);
        if user_path.exists() {
            return load_template_file(&user_path);
        }
    }

    anyhow::bail!("workflow template '{}' not found", id)
}

/// Load and structurally validate a template file
///
/// Cycles are left to the engine, which reports them as a deadlock at run time.
pub fn load_template_file(path: &Path) -> Result<WorkflowTemplate> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut template: WorkflowTemplate =
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;

    if template.id.is_empty() {
        if let Some(stem) = path.file_stem() {
            template.id = stem.to_string_lossy().into_owned();
        }
    }

    template.validate_structure().map_err(|errors| {
        anyhow::anyhow!("workflow validation failed:\n  {}", errors.join("\n  "))
    })?;

    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut file = std::fs::File::create(path).unwrap();
        writeln!(file, "{}", contents).unwrap();
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.pool.size, 4);
        assert!(config.workers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_file() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");
        write_file(
            &config_path,
            r#"
            [pool]
            size = 2
            retry_placement = "head"

            [worker]
            command = "codex"
            args = ["exec"]

            [workers.review]
            command = "claude"
        "#,
        );

        let config = EngineConfig::load_file(&config_path).unwrap();
        assert_eq!(config.pool.size, 2);
        assert_eq!(config.worker.command, "codex");
        assert_eq!(config.worker_for(Some("review")).command, "claude");
        assert_eq!(config.worker_for(Some("other")).command, "codex");
        assert_eq!(config.worker_for(None).command, "codex");
    }

    #[test]
    fn test_layers_deep_merge() {
        let dir = TempDir::new().unwrap();
        let user = dir.path().join("user.toml");
        let project = dir.path().join("project.toml");
        write_file(
            &user,
            r#"
            [pool]
            size = 8
            max_restarts = 5

            [runner]
            default_timeout_ms = 1000
        "#,
        );
        write_file(
            &project,
            r#"
            [pool]
            size = 2
        "#,
        );

        let config = EngineConfig::load_layers(&[user, project]).unwrap();
        // Project wins for the key it sets
        assert_eq!(config.pool.size, 2);
        // User keys in the same table survive
        assert_eq!(config.pool.max_restarts, 5);
        assert_eq!(config.runner.default_timeout_ms, 1000);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        write_file(&path, "[pool]\nbogus = true");
        assert!(EngineConfig::load_file(&path).is_err());
    }

    #[test]
    fn test_validate_reports_errors() {
        let mut config = EngineConfig::default();
        config.pool.size = 0;
        config.progress.sample_window = 1;
        config.progress.retain_finished = 0;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_tilde_expansion() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        write_file(&path, "[store]\njournal_path = \"~/journal.db\"");
        let config = EngineConfig::load_file(&path).unwrap();
        let journal = config.store.journal_path.unwrap();
        assert!(!journal.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_load_template_project_first() {
        let dir = TempDir::new().unwrap();
        let configured = dir.path().join("templates");
        write_file(
            &dir.path().join(".task-mux/workflows/triage.toml"),
            r#"
            id = "triage"
            description = "project"

            [[steps]]
            id = "a"
            type = "approval"
        "#,
        );
        write_file(
            &configured.join("triage.toml"),
            r#"
            id = "triage"
            description = "configured"

            [[steps]]
            id = "a"
            type = "approval"
        "#,
        );

        let settings = WorkflowSettings {
            templates_dir: Some(configured),
            ..Default::default()
        };
        let template = load_template("triage", Some(dir.path()), &settings).unwrap();
        assert_eq!(template.description, "project");
    }

    #[test]
    fn test_load_template_from_configured_dir() {
        let dir = TempDir::new().unwrap();
        let configured = dir.path().join("templates");
        write_file(
            &configured.join("nightly.toml"),
            r#"
            [[steps]]
            id = "collect"
            type = "aggregate"
        "#,
        );

        let settings = WorkflowSettings {
            templates_dir: Some(configured),
            ..Default::default()
        };
        let template = load_template("nightly", Some(dir.path()), &settings).unwrap();
        assert_eq!(template.id, "nightly");
        assert_eq!(template.steps.len(), 1);
    }

    #[test]
    fn test_load_template_missing() {
        let dir = TempDir::new().unwrap();
        let result = load_template(
            "definitely-not-a-template",
            Some(dir.path()),
            &WorkflowSettings::default(),
        );
        assert!(result.is_err());
    }
}
