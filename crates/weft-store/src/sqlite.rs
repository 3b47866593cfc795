use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use weft_core::error::{Result, WeftError};

/// Open (or create) a database file and apply `schema`.
pub(crate) fn open(path: &Path, schema: &str) -> Result<Connection> {
    // Create parent directories
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| WeftError::Database(format!("Failed to create db directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
        WeftError::Database(format!("Failed to open {}: {}", path.display(), e))
    })?;

    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
        .map_err(|e| WeftError::Database(e.to_string()))?;

    conn.execute_batch(schema)
        .map_err(|e| WeftError::Database(format!("Failed to initialize schema: {}", e)))?;

    Ok(conn)
}

/// Open an in-memory database with `schema` (for testing).
pub(crate) fn open_in_memory(schema: &str) -> Result<Connection> {
    let conn = Connection::open_in_memory().map_err(|e| WeftError::Database(e.to_string()))?;
    conn.execute_batch(schema)
        .map_err(|e| WeftError::Database(format!("Failed to initialize schema: {}", e)))?;
    Ok(conn)
}

pub(crate) fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|e| WeftError::Database(e.to_string()))
}

pub(crate) fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> WeftError + '_ {
    move |e| WeftError::Database(format!("{}: {}", context, e))
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
