//! Per-attempt workspace directories
//!
//! A workspace is created under `runner.workspace_root`, populated from the
//! task payload and removed when dropped.

use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::JobError;
use crate::store::TaskId;

/// Scoped workspace directory for one task attempt
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    keep: bool,
}

impl Workspace {
    /// Create an empty workspace for a task attempt
    pub async fn create(root: &Path, task_id: TaskId, attempt: u32, keep: bool) -> Result<Self, JobError> {
        let path = root.join(format!("{}-{}", task_id, attempt));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| JobError::workspace(format!("clearing {}: {}", path.display(), e)))?;
        }
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| JobError::workspace(format!("creating {}: {}", path.display(), e)))?;
        Ok(Self { path, keep })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Materialise `files`, `template_dir` and `repository` from a task payload
    pub async fn materialize(&self, payload: &Map<String, Value>) -> Result<(), JobError> {
        if let Some(dir) = payload.get("template_dir") {
            let source = dir
                .as_str()
                .ok_or_else(|| JobError::workspace("template_dir must be a string"))?;
            self.copy_template(Path::new(source)).await?;
        }

        if let Some(repo) = payload.get("repository") {
            self.clone_repository(repo).await?;
        }

        if let Some(files) = payload.get("files") {
            let files = files
                .as_object()
                .ok_or_else(|| JobError::workspace("files must be a table of path to content"))?;
            for (relative, content) in files {
                self.write_file(relative, content).await?;
            }
        }

        Ok(())
    }

    async fn write_file(&self, relative: &str, content: &Value) -> Result<(), JobError> {
        let target = self.resolve(relative)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| JobError::workspace(format!("creating {}: {}", parent.display(), e)))?;
        }
        let text = match content {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other)
                .map_err(|e| JobError::workspace(format!("encoding {}: {}", relative, e)))?,
        };
        tokio::fs::write(&target, text)
            .await
            .map_err(|e| JobError::workspace(format!("writing {}: {}", target.display(), e)))
    }

    async fn copy_template(&self, source: &Path) -> Result<(), JobError> {
        let source = PathBuf::from(shellexpand::tilde(&source.to_string_lossy()).as_ref());
        let dest = self.path.clone();
        tokio::task::spawn_blocking(move || copy_dir(&source, &dest))
            .await
            .map_err(|e| JobError::workspace(format!("template copy aborted: {}", e)))?
    }

    async fn clone_repository(&self, repo: &Value) -> Result<(), JobError> {
        let (url, branch, dir) = match repo {
            Value::String(url) => (url.as_str(), None, "repo"),
            Value::Object(map) => (
                map.get("url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| JobError::workspace("repository.url is required"))?,
                map.get("branch").and_then(Value::as_str),
                map.get("dir").and_then(Value::as_str).unwrap_or("repo"),
            ),
            _ => return Err(JobError::workspace("repository must be a URL or a table")),
        };
        let target = self.resolve(dir)?;

        let mut cmd = Command::new("git");
        cmd.arg("clone").arg("--depth").arg("1");
        if let Some(branch) = branch {
            cmd.arg("--branch").arg(branch);
        }
        cmd.arg(url)
            .arg(&target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(url, target = %target.display(), "cloning repository");
        let output = cmd
            .output()
            .await
            .map_err(|e| JobError::workspace(format!("failed to run git: {}", e)))?;
        if !output.status.success() {
            return Err(JobError::workspace(format!(
                "git clone {} failed: {}",
                url,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Join a relative path, refusing anything that escapes the workspace
    fn resolve(&self, relative: &str) -> Result<PathBuf, JobError> {
        let path = Path::new(relative);
        let escapes = path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if relative.is_empty() || escapes {
            return Err(JobError::workspace(format!(
                "path '{}' escapes the workspace",
                relative
            )));
        }
        Ok(self.path.join(path))
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.keep {
            tracing::debug!(path = %self.path.display(), "keeping workspace");
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove workspace");
            }
        }
    }
}

fn copy_dir(source: &Path, dest: &Path) -> Result<(), JobError> {
    let entries = std::fs::read_dir(source)
        .map_err(|e| JobError::workspace(format!("reading {}: {}", source.display(), e)))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| JobError::workspace(format!("reading {}: {}", source.display(), e)))?;
        let target = dest.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| JobError::workspace(format!("inspecting {}: {}", entry.path().display(), e)))?;
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| JobError::workspace(format!("creating {}: {}", target.display(), e)))?;
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)
                .map_err(|e| JobError::workspace(format!("copying {}: {}", entry.path().display(), e)))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_materialize_files() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::create(root.path(), TaskId::new(), 1, false)
            .await
            .unwrap();
        let payload = json!({
            "files": {
                "src/main.rs": "fn main() {}",
                "data.json": {"a": 1}
            }
        });
        ws.materialize(payload.as_object().unwrap()).await.unwrap();

        let main = std::fs::read_to_string(ws.path().join("src/main.rs")).unwrap();
        assert_eq!(main, "fn main() {}");
        let data: Value =
            serde_json::from_str(&std::fs::read_to_string(ws.path().join("data.json")).unwrap())
                .unwrap();
        assert_eq!(data, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::create(root.path(), TaskId::new(), 1, false)
            .await
            .unwrap();

        for bad in ["../outside.txt", "/etc/passwd", "a/../../b"] {
            let payload = json!({ "files": { bad: "x" } });
            let err = ws.materialize(payload.as_object().unwrap()).await.unwrap_err();
            assert!(matches!(err, JobError::Workspace(_)), "{bad} accepted");
        }
        assert!(!root.path().join("outside.txt").exists());
    }

    #[tokio::test]
    async fn test_copies_template_dir() {
        let template = TempDir::new().unwrap();
        std::fs::create_dir_all(template.path().join("nested")).unwrap();
        std::fs::write(template.path().join("README.md"), "hello").unwrap();
        std::fs::write(template.path().join("nested/config.toml"), "x = 1").unwrap();

        let root = TempDir::new().unwrap();
        let ws = Workspace::create(root.path(), TaskId::new(), 1, false)
            .await
            .unwrap();
        let payload = json!({ "template_dir": template.path().to_string_lossy() });
        ws.materialize(payload.as_object().unwrap()).await.unwrap();

        assert!(ws.path().join("README.md").exists());
        assert!(ws.path().join("nested/config.toml").exists());
    }

    #[tokio::test]
    async fn test_missing_template_dir_is_workspace_error() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::create(root.path(), TaskId::new(), 1, false)
            .await
            .unwrap();
        let payload = json!({ "template_dir": "/definitely/not/here" });
        let err = ws.materialize(payload.as_object().unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::WorkspaceError);
    }

    #[tokio::test]
    async fn test_removed_on_drop_unless_kept() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::create(root.path(), TaskId::new(), 1, false)
            .await
            .unwrap();
        let path = ws.path().to_path_buf();
        assert!(path.exists());
        drop(ws);
        assert!(!path.exists());

        let kept = Workspace::create(root.path(), TaskId::new(), 1, true)
            .await
            .unwrap();
        let path = kept.path().to_path_buf();
        drop(kept);
        assert!(path.exists());
    }
}
