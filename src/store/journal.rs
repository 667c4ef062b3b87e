//! SQLite journal of task transitions for crash recovery

use super::task::{Task, TaskStatus};
use rusqlite::Connection;
use std::path::Path;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// Initialize the journal schema
fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            task_type TEXT NOT NULL,
            priority INTEGER NOT NULL,
            status TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            data TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS idx_tasks_submitted ON tasks(submitted_at);
        "#,
    )
}

/// Durable record of every task the store has seen
pub(crate) struct Journal {
    conn: Connection,
}

impl Journal {
    pub(crate) fn open(path: &Path) -> Result<Self, super::StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| super::StoreError::Journal {
                    message: format!("creating {}: {}", parent.display(), e),
                })?;
            }
        }
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub(crate) fn in_memory() -> Result<Self, super::StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Insert or replace the task's current state
    pub(crate) fn record(&self, task: &Task) -> Result<(), super::StoreError> {
        let data = serde_json::to_string(task)?;
        self.conn.execute(
            "INSERT INTO tasks (id, task_type, priority, status, submitted_at, updated_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at,
                data = excluded.data",
            (
                task.id.to_string(),
                &task.task_type,
                task.priority,
                task.status.as_str(),
                task.submitted_at.to_rfc3339(),
                chrono::Utc::now().to_rfc3339(),
                data,
            ),
        )?;
        Ok(())
    }

    /// Tasks that had not reached a terminal status, oldest first
    pub(crate) fn unfinished(&self) -> Result<Vec<Task>, super::StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT data FROM tasks
             WHERE status IN (?1, ?2, ?3)
             ORDER BY submitted_at ASC",
        )?;

        let rows = stmt
            .query_map(
                (
                    TaskStatus::Pending.as_str(),
                    TaskStatus::Running.as_str(),
                    TaskStatus::Retrying.as_str(),
                ),
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut tasks = Vec::with_capacity(rows.len());
        for data in rows {
            tasks.push(serde_json::from_str(&data)?);
        }
        Ok(tasks)
    }

    #[cfg(test)]
    pub(crate) fn count_by_status(&self, status: TaskStatus) -> Result<usize, super::StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

/// Records snapshots on a dedicated thread, in the order they were sent
///
/// Dropping the writer waits until every queued snapshot is written.
pub(crate) struct JournalWriter {
    sender: Option<mpsc::UnboundedSender<Task>>,
    thread: Option<JoinHandle<()>>,
}

impl JournalWriter {
    pub(crate) fn spawn(journal: Journal) -> Result<Self, super::StoreError> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let thread = std::thread::Builder::new()
            .name("task-journal".into())
            .spawn(move || {
                while let Some(task) = receiver.blocking_recv() {
                    if let Err(e) = journal.record(&task) {
                        tracing::warn!(task_id = %task.id, error = %e, "failed to journal task");
                    }
                }
            })
            .map_err(|e| super::StoreError::Journal {
                message: format!("starting journal writer: {}", e),
            })?;

        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
        })
    }

    pub(crate) fn record(&self, task: Task) {
        if let Some(sender) = &self.sender {
            if sender.send(task).is_err() {
                tracing::warn!("journal writer stopped, snapshot dropped");
            }
        }
    }
}

impl Drop for JournalWriter {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain the backlog and exit
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("journal writer panicked");
            }
        }
    }
}
