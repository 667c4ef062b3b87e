//! Process-backed task executor

use super::markers::{self, Marker};
use super::{InstructionBuilder, JobError, TaskExecutor, Workspace};
use crate::config::{EngineConfig, RunnerConfig, WorkerConfig};
use crate::process::{TailBuffer, exit_status_code, kill_and_reap, terminating_signal};
use crate::progress::{ProgressTracker, ProgressUpdate};
use crate::shutdown::CancellationToken;
use crate::store::{Task, TaskResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

/// How the streaming phase of an attempt ended
enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs tasks as external worker processes
pub struct JobRunner {
    config: RunnerConfig,
    default_worker: WorkerConfig,
    workers: HashMap<String, WorkerConfig>,
    tracker: Arc<ProgressTracker>,
    instructions: InstructionBuilder,
}

impl JobRunner {
    pub fn new(config: RunnerConfig, worker: WorkerConfig, tracker: Arc<ProgressTracker>) -> Self {
        let instructions = InstructionBuilder::new(config.instruction_template.clone());
        Self {
            config,
            default_worker: worker,
            workers: HashMap::new(),
            tracker,
            instructions,
        }
    }

    pub fn from_config(config: &EngineConfig, tracker: Arc<ProgressTracker>) -> Self {
        let mut runner = Self::new(config.runner.clone(), config.worker.clone(), tracker);
        runner.workers = config.workers.clone();
        runner
    }

    /// Use a dedicated worker command for one task type
    pub fn with_worker(mut self, task_type: impl Into<String>, worker: WorkerConfig) -> Self {
        self.workers.insert(task_type.into(), worker);
        self
    }

    fn worker_for(&self, task_type: &str) -> &WorkerConfig {
        self.workers.get(task_type).unwrap_or(&self.default_worker)
    }

    fn build_command(&self, worker: &WorkerConfig, task: &Task, workspace: &Workspace) -> Command {
        let mut cmd = Command::new(&worker.command);
        cmd.args(&worker.args)
            .envs(&worker.env)
            .env("TASK_MUX_TASK_ID", task.id.to_string())
            .env("TASK_MUX_ATTEMPT", task.attempts.to_string())
            .env("TASK_MUX_WORKSPACE", workspace.path())
            .current_dir(workspace.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn report_marker(&self, subject: &str, marker: Marker) {
        let update = match marker {
            Marker::Stage(name) => ProgressUpdate::enter_stage(name),
            Marker::Progress(value) => ProgressUpdate::percent(value),
        };
        if let Err(e) = self.tracker.update(subject, update).await {
            tracing::debug!(task_id = subject, error = %e, "ignoring progress marker");
        }
    }

    /// Stream output until the worker exits, times out, or is cancelled
    async fn stream(
        &self,
        child: &mut Child,
        task: &Task,
        timeout: Duration,
        cancel: &CancellationToken,
        stdout_buf: &mut TailBuffer,
        stderr_buf: &mut TailBuffer,
    ) -> Result<Outcome, JobError> {
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(JobError::execution(None, "worker stdio not captured", ""));
        };
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let subject = task.id.to_string();

        let read_all = async {
            let mut stdout_done = false;
            let mut stderr_done = false;
            while !(stdout_done && stderr_done) {
                tokio::select! {
                    biased;
                    line = stdout_reader.next_line(), if !stdout_done => match line {
                        Ok(Some(line)) => {
                            if let Some(marker) = markers::parse_marker(&line) {
                                self.report_marker(&subject, marker).await;
                            }
                            stdout_buf.push(line);
                        }
                        Ok(None) => stdout_done = true,
                        Err(e) => {
                            tracing::warn!(task_id = %task.id, error = %e, "stdout read error");
                            stdout_done = true;
                        }
                    },
                    line = stderr_reader.next_line(), if !stderr_done => match line {
                        Ok(Some(line)) => stderr_buf.push(line),
                        Ok(None) => stderr_done = true,
                        Err(e) => {
                            tracing::warn!(task_id = %task.id, error = %e, "stderr read error");
                            stderr_done = true;
                        }
                    },
                }
            }
            child.wait().await
        };

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, read_all) => match result {
                Ok(status) => Outcome::Exited(status),
                Err(_) => Outcome::TimedOut,
            },
            _ = cancel.cancelled() => Outcome::Cancelled,
        };
        Ok(outcome)
    }

    fn build_result(stdout: &TailBuffer, elapsed: Duration) -> TaskResult {
        let output = stdout.text();
        TaskResult {
            summary: markers::summarize(stdout.lines()).unwrap_or_else(|| "completed".into()),
            artifacts: markers::extract_artifacts(stdout.lines()),
            structured: markers::extract_json(&output),
            output,
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}

#[async_trait]
impl TaskExecutor for JobRunner {
    async fn execute(&self, task: &Task, cancel: CancellationToken) -> Result<TaskResult, JobError> {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let start = Instant::now();
        let timeout = task
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.default_timeout());

        // Dropped on every return path below, removing the directory
        let workspace = Workspace::create(
            &self.config.workspace_root,
            task.id,
            task.attempts,
            self.config.keep_workspaces,
        )
        .await?;
        workspace.materialize(&task.payload).await?;

        let instruction = self.instructions.build(task)?;
        let worker = self.worker_for(&task.task_type);

        tracing::info!(
            task_id = %task.id,
            attempt = task.attempts,
            command = %worker.display_command(),
            workspace = %workspace.path().display(),
            timeout_ms = timeout.as_millis() as u64,
            "starting worker"
        );

        let mut child = self
            .build_command(worker, task, &workspace)
            .spawn()
            .map_err(|e| {
                JobError::execution(
                    None,
                    format!("failed to spawn '{}': {}", worker.command, e),
                    "",
                )
            })?;

        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                // Workers that never read stdin close the pipe early
                if let Err(e) = stdin.write_all(instruction.as_bytes()).await {
                    tracing::debug!(error = %e, "worker did not consume the instruction");
                }
                let _ = stdin.shutdown().await;
            })
        });

        let mut stdout_buf = TailBuffer::new(self.config.max_output_bytes);
        let mut stderr_buf = TailBuffer::new(self.config.max_output_bytes);

        let outcome = self
            .stream(&mut child, task, timeout, &cancel, &mut stdout_buf, &mut stderr_buf)
            .await;

        if let Some(writer) = writer {
            writer.abort();
        }

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                kill_and_reap(&mut child).await;
                return Err(e);
            }
        };

        let elapsed = start.elapsed();
        if stdout_buf.dropped() > 0 {
            tracing::debug!(task_id = %task.id, dropped = stdout_buf.dropped(), "worker output truncated");
        }

        match outcome {
            Outcome::Exited(Ok(status)) if status.success() => {
                tracing::info!(task_id = %task.id, elapsed_ms = elapsed.as_millis() as u64, "worker finished");
                Ok(Self::build_result(&stdout_buf, elapsed))
            }
            Outcome::Exited(Ok(status)) => {
                if let Some(signal) = terminating_signal(&status) {
                    tracing::warn!(task_id = %task.id, signal, "worker killed by signal");
                    return Err(JobError::Crashed {
                        signal,
                        stderr: stderr_buf.text(),
                    });
                }
                let exit_code = exit_status_code(&status);
                let message = stderr_buf
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .cloned()
                    .unwrap_or_else(|| format!("exit status {}", status));
                tracing::warn!(task_id = %task.id, ?exit_code, "worker failed");
                Err(JobError::execution(exit_code, message, stderr_buf.text()))
            }
            Outcome::Exited(Err(e)) => Err(JobError::execution(
                None,
                format!("failed to wait for worker: {}", e),
                stderr_buf.text(),
            )),
            Outcome::TimedOut => {
                kill_and_reap(&mut child).await;
                tracing::warn!(task_id = %task.id, timeout_ms = timeout.as_millis() as u64, "worker timed out");
                Err(JobError::Timeout {
                    elapsed,
                    partial_output: (!stdout_buf.is_empty()).then(|| stdout_buf.text()),
                })
            }
            Outcome::Cancelled => {
                kill_and_reap(&mut child).await;
                tracing::info!(task_id = %task.id, "worker cancelled");
                Err(JobError::Cancelled)
            }
        }
    }
}
