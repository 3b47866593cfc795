use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use weft_core::error::Result;
use weft_core::types::{AttemptRecord, ClassifiedError, FailedTask};

use crate::sqlite::{self, db_err, fmt_ts, parse_ts};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS failed_tasks (
        task_id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        workflow_id TEXT,
        category TEXT NOT NULL,
        error_json TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        history_json TEXT NOT NULL DEFAULT '[]',
        failed_at TEXT NOT NULL,
        can_retry INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_failed_agent ON failed_tasks(agent_id);";

/// Durable store of tasks that could not be completed.
pub struct DeadLetterQueue {
    conn: Mutex<Connection>,
}

impl DeadLetterQueue {
    /// Open or create the dead-letter database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = sqlite::open(path, SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory queue (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(sqlite::open_in_memory(SCHEMA)?),
        })
    }

    /// Record a failed task. `can_retry` is taken from the classification.
    pub fn add_failed_task(
        &self,
        task_id: &str,
        agent_id: &str,
        error: &ClassifiedError,
        attempts: u32,
        workflow_id: Option<&str>,
    ) -> Result<FailedTask> {
        self.add_failed_task_with_history(task_id, agent_id, error, attempts, workflow_id, Vec::new())
    }

    /// Like [`add_failed_task`](Self::add_failed_task), keeping the per-attempt history.
    ///
    /// Re-adding an existing `task_id` replaces the earlier entry.
    pub fn add_failed_task_with_history(
        &self,
        task_id: &str,
        agent_id: &str,
        error: &ClassifiedError,
        attempts: u32,
        workflow_id: Option<&str>,
        history: Vec<AttemptRecord>,
    ) -> Result<FailedTask> {
        let task = FailedTask {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            workflow_id: workflow_id.map(String::from),
            error: error.clone(),
            attempts,
            history,
            failed_at: Utc::now(),
            can_retry: error.retryable,
        };

        let error_json = serde_json::to_string(&task.error)?;
        let history_json = serde_json::to_string(&task.history)?;

        let conn = sqlite::lock(&self.conn)?;
        let existed: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM failed_tasks WHERE task_id = ?1)",
                params![task_id],
                |row| row.get(0),
            )
            .map_err(db_err("Failed to query dead-letter queue"))?;
        if existed {
            warn!(task_id, "Replacing existing dead-letter entry");
        }

        conn.execute(
            "INSERT OR REPLACE INTO failed_tasks
             (task_id, agent_id, workflow_id, category, error_json, attempts, history_json, failed_at, can_retry)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                task.task_id,
                task.agent_id,
                task.workflow_id,
                task.error.category.as_str(),
                error_json,
                task.attempts,
                history_json,
                fmt_ts(&task.failed_at),
                task.can_retry,
            ],
        )
        .map_err(db_err("Failed to add dead-letter entry"))?;

        info!(
            task_id,
            agent_id,
            category = %task.error.category,
            attempts,
            can_retry = task.can_retry,
            "Task moved to dead-letter queue"
        );
        Ok(task)
    }

    /// Failed tasks, newest first, optionally filtered.
    pub fn get_failed_tasks(
        &self,
        agent_id: Option<&str>,
        can_retry: Option<bool>,
        limit: Option<usize>,
    ) -> Result<Vec<FailedTask>> {
        let conn = sqlite::lock(&self.conn)?;
        let mut stmt = conn
            .prepare(
                "SELECT task_id, agent_id, workflow_id, error_json, attempts, history_json, failed_at, can_retry
                 FROM failed_tasks
                 WHERE (?1 IS NULL OR agent_id = ?1)
                   AND (?2 IS NULL OR can_retry = ?2)
                 ORDER BY failed_at DESC, rowid DESC
                 LIMIT ?3",
            )
            .map_err(db_err("Failed to prepare query"))?;

        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt
            .query_map(params![agent_id, can_retry, limit], read_task_row)
            .map_err(db_err("Failed to query dead-letter queue"))?;

        let mut tasks = Vec::new();
        for row in rows {
            let (task, error_json, history_json) = row.map_err(db_err("Failed to read dead-letter row"))?;
            tasks.push(hydrate(task, &error_json, &history_json)?);
        }
        Ok(tasks)
    }

    pub fn get_failed_task(&self, task_id: &str) -> Result<Option<FailedTask>> {
        let conn = sqlite::lock(&self.conn)?;
        let row = conn
            .query_row(
                "SELECT task_id, agent_id, workflow_id, error_json, attempts, history_json, failed_at, can_retry
                 FROM failed_tasks WHERE task_id = ?1",
                params![task_id],
                read_task_row,
            )
            .optional()
            .map_err(db_err("Failed to read dead-letter entry"))?;

        match row {
            Some((task, error_json, history_json)) => Ok(Some(hydrate(task, &error_json, &history_json)?)),
            None => Ok(None),
        }
    }

    /// Remove a task. Returns false if it was not present.
    pub fn remove_task(&self, task_id: &str) -> Result<bool> {
        let conn = sqlite::lock(&self.conn)?;
        let removed = conn
            .execute("DELETE FROM failed_tasks WHERE task_id = ?1", params![task_id])
            .map_err(db_err("Failed to remove dead-letter entry"))?;
        if removed > 0 {
            info!(task_id, "Task removed from dead-letter queue");
        }
        Ok(removed > 0)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = sqlite::lock(&self.conn)?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM failed_tasks", [], |row| row.get(0))
            .map_err(db_err("Failed to count dead-letter entries"))?;
        Ok(n as usize)
    }
}

type TaskRow = (FailedTask, String, String);

fn read_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    let failed_at: String = row.get(6)?;
    let task = FailedTask {
        task_id: row.get(0)?,
        agent_id: row.get(1)?,
        workflow_id: row.get(2)?,
        error: ClassifiedError {
            category: weft_core::types::ErrorCategory::Unknown,
            retryable: false,
            retry_after_secs: 0.0,
            message: String::new(),
        },
        attempts: row.get(4)?,
        history: Vec::new(),
        failed_at: parse_ts(&failed_at),
        can_retry: row.get(7)?,
    };
    Ok((task, row.get(3)?, row.get(5)?))
}

fn hydrate(mut task: FailedTask, error_json: &str, history_json: &str) -> Result<FailedTask> {
    task.error = serde_json::from_str(error_json)?;
    task.history = serde_json::from_str(history_json)?;
    Ok(task)
}
