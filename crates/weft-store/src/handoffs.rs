use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use weft_core::error::{Result, WeftError};
use weft_core::types::{HandoffRecord, HandoffStats, HandoffStatus};

use crate::sqlite::{self, db_err, fmt_ts};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS handoffs (
        handoff_id TEXT PRIMARY KEY,
        execution_id TEXT NOT NULL,
        workflow_id TEXT NOT NULL,
        step_id TEXT NOT NULL,
        from_agent TEXT NOT NULL,
        to_agent TEXT NOT NULL,
        to_step TEXT,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        record_json TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_handoffs_execution ON handoffs(execution_id);
    CREATE INDEX IF NOT EXISTS idx_handoffs_status ON handoffs(status);";

/// Persistent registry of handoff records.
///
/// The `status` column is authoritative; the stored JSON carries the rest
/// of the record and is patched with the current status on read.
pub struct HandoffRegistry {
    conn: Mutex<Connection>,
}

impl HandoffRegistry {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = sqlite::open(path, SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(sqlite::open_in_memory(SCHEMA)?),
        })
    }

    /// Store a handoff under the given execution and workflow.
    pub fn register_handoff(
        &self,
        record: &HandoffRecord,
        execution_id: &str,
        workflow_id: &str,
    ) -> Result<()> {
        let mut record = record.clone();
        record.execution_id = execution_id.to_string();
        record.workflow_id = workflow_id.to_string();
        let record_json = serde_json::to_string(&record)?;
        let now = fmt_ts(&chrono::Utc::now());

        let conn = sqlite::lock(&self.conn)?;
        conn.execute(
            "INSERT INTO handoffs
             (handoff_id, execution_id, workflow_id, step_id, from_agent, to_agent, to_step,
              kind, status, created_at, updated_at, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.handoff_id,
                execution_id,
                workflow_id,
                record.step_id,
                record.from_agent,
                record.to_agent,
                record.to_step,
                record.kind.as_str(),
                record.status.as_str(),
                fmt_ts(&record.timestamp),
                now,
                record_json,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                WeftError::Database(format!("Handoff {} already registered", record.handoff_id))
            }
            other => WeftError::Database(format!("Failed to register handoff: {}", other)),
        })?;

        info!(
            handoff_id = %record.handoff_id,
            execution_id,
            from = %record.from_agent,
            to = %record.to_agent,
            kind = %record.kind,
            "Handoff registered"
        );
        Ok(())
    }

    pub fn get_handoff(&self, handoff_id: &str) -> Result<Option<HandoffRecord>> {
        let conn = sqlite::lock(&self.conn)?;
        let row = conn
            .query_row(
                "SELECT record_json, status FROM handoffs WHERE handoff_id = ?1",
                params![handoff_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(db_err("Failed to load handoff"))?;

        row.map(|(json, status)| hydrate(&json, &status)).transpose()
    }

    /// Handoffs in creation order, optionally filtered by execution and status.
    pub fn get_handoffs(
        &self,
        execution_id: Option<&str>,
        status: Option<HandoffStatus>,
    ) -> Result<Vec<HandoffRecord>> {
        let conn = sqlite::lock(&self.conn)?;
        let mut stmt = conn
            .prepare(
                "SELECT record_json, status FROM handoffs
                 WHERE (?1 IS NULL OR execution_id = ?1)
                   AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at, rowid",
            )
            .map_err(db_err("Failed to prepare query"))?;

        let rows = stmt
            .query_map(params![execution_id, status.map(|s| s.as_str())], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err("Failed to query handoffs"))?;

        let mut records = Vec::new();
        for row in rows {
            let (json, status) = row.map_err(db_err("Failed to read handoff"))?;
            records.push(hydrate(&json, &status)?);
        }
        Ok(records)
    }

    /// Set the status of a handoff.
    ///
    /// Unknown status strings are an error; an unknown id returns `Ok(false)`.
    pub fn update_handoff_status(&self, handoff_id: &str, status: &str) -> Result<bool> {
        let status: HandoffStatus = status.parse()?;
        let conn = sqlite::lock(&self.conn)?;
        let updated = conn
            .execute(
                "UPDATE handoffs SET status = ?1, updated_at = ?2 WHERE handoff_id = ?3",
                params![status.as_str(), fmt_ts(&chrono::Utc::now()), handoff_id],
            )
            .map_err(db_err("Failed to update handoff status"))?;

        if updated > 0 {
            debug!(handoff_id, status = %status, "Handoff status updated");
        }
        Ok(updated > 0)
    }

    /// Counts by status, over all handoffs or those of one execution.
    pub fn get_handoff_stats(&self, execution_id: Option<&str>) -> Result<HandoffStats> {
        let conn = sqlite::lock(&self.conn)?;
        let mut stmt = conn
            .prepare(
                "SELECT status, COUNT(*) FROM handoffs
                 WHERE (?1 IS NULL OR execution_id = ?1)
                 GROUP BY status",
            )
            .map_err(db_err("Failed to prepare query"))?;

        let rows = stmt
            .query_map(params![execution_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(db_err("Failed to compute handoff stats"))?;

        let mut stats = HandoffStats::default();
        for row in rows {
            let (status, count) = row.map_err(db_err("Failed to read handoff stats"))?;
            stats.total += count as usize;
            stats.by_status.insert(status, count as usize);
        }
        Ok(stats)
    }
}

fn hydrate(json: &str, status: &str) -> Result<HandoffRecord> {
    let mut record: HandoffRecord = serde_json::from_str(json)?;
    record.status = status.parse()?;
    Ok(record)
}
