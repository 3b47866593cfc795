use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use weft_core::error::{Result, WeftError};
use weft_core::types::{AgentState, StateData, StateScope, StateSummary};

use crate::sqlite::{self, db_err, fmt_ts, parse_ts};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS state_heads (
        state_id TEXT PRIMARY KEY,
        scope TEXT NOT NULL,
        version INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS state_versions (
        state_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        scope TEXT NOT NULL,
        data_json TEXT NOT NULL,
        checksum TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (state_id, version)
    );

    CREATE TABLE IF NOT EXISTS state_backups (
        state_id TEXT PRIMARY KEY,
        version INTEGER NOT NULL,
        data_json TEXT NOT NULL,
        checksum TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_heads_scope
        ON state_heads(scope, updated_at);";

/// Options for a single save.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    /// Copy the current stored value into the backup slot before overwriting.
    pub backup: bool,
}

impl SaveOptions {
    pub fn with_backup() -> Self {
        Self { backup: true }
    }
}

/// Versioned state storage with optimistic concurrency.
///
/// Every version ever saved is kept in `state_versions`; `state_heads`
/// points at the latest one. Advancing the head is a compare-and-swap on
/// the stored version, so two writers holding the same version can never
/// both succeed.
pub struct StateRepository {
    conn: Mutex<Connection>,
}

impl StateRepository {
    /// Open or create the state database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = sqlite::open(path, SCHEMA)?;
        debug!(path = %path.display(), "State repository opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory repository (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(sqlite::open_in_memory(SCHEMA)?),
        })
    }

    /// Save `state`, which must carry the version it was read at (0 for a
    /// new state). On success `state.version`, `checksum` and `updated_at`
    /// are updated in place.
    pub fn save_state(&self, state: &mut AgentState, options: SaveOptions) -> Result<String> {
        let data_json = serde_json::to_string(&state.data)?;
        let checksum = compute_checksum(&data_json);
        let scope = state.scope().as_str();
        let now = Utc::now();
        let now_str = fmt_ts(&now);
        let expected = state.version;

        let mut conn = sqlite::lock(&self.conn)?;
        let tx = conn
            .transaction()
            .map_err(db_err("Failed to begin transaction"))?;

        let stored: Option<i64> = tx
            .query_row(
                "SELECT version FROM state_heads WHERE state_id = ?1",
                params![state.state_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Failed to read state head"))?;

        let new_version = match stored {
            None => {
                if expected != 0 {
                    return Err(conflict(&state.state_id, expected, 0));
                }
                let inserted = tx
                    .execute(
                        "INSERT INTO state_heads (state_id, scope, version, updated_at)
                         VALUES (?1, ?2, 1, ?3)
                         ON CONFLICT(state_id) DO NOTHING",
                        params![state.state_id, scope, now_str],
                    )
                    .map_err(db_err("Failed to create state head"))?;
                if inserted != 1 {
                    return Err(conflict(&state.state_id, expected, 1));
                }
                1
            }
            Some(actual) => {
                let actual = actual as u64;
                if actual != expected {
                    return Err(conflict(&state.state_id, expected, actual));
                }

                if options.backup {
                    tx.execute(
                        "INSERT OR REPLACE INTO state_backups (state_id, version, data_json, checksum, created_at)
                         SELECT state_id, version, data_json, checksum, ?3
                         FROM state_versions WHERE state_id = ?1 AND version = ?2",
                        params![state.state_id, actual as i64, now_str],
                    )
                    .map_err(db_err("Failed to write backup"))?;
                }

                let swapped = tx
                    .execute(
                        "UPDATE state_heads SET version = ?1, scope = ?2, updated_at = ?3
                         WHERE state_id = ?4 AND version = ?5",
                        params![
                            (expected + 1) as i64,
                            scope,
                            now_str,
                            state.state_id,
                            expected as i64
                        ],
                    )
                    .map_err(db_err("Failed to advance state head"))?;
                if swapped != 1 {
                    return Err(conflict(&state.state_id, expected, actual));
                }
                expected + 1
            }
        };

        tx.execute(
            "INSERT INTO state_versions (state_id, version, scope, data_json, checksum, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                state.state_id,
                new_version as i64,
                scope,
                data_json,
                checksum,
                now_str
            ],
        )
        .map_err(db_err("Failed to write state version"))?;

        tx.commit().map_err(db_err("Failed to commit state"))?;

        state.version = new_version;
        state.checksum = checksum;
        state.updated_at = now;

        debug!(state_id = %state.state_id, version = new_version, "State saved");
        Ok(state.state_id.clone())
    }

    /// Load the latest state, or the exact snapshot for `version`.
    ///
    /// A checksum mismatch is logged but does not block the read.
    pub fn load_state(&self, state_id: &str, version: Option<u64>) -> Result<Option<AgentState>> {
        let conn = sqlite::lock(&self.conn)?;

        let row = match version {
            Some(v) => conn
                .query_row(
                    "SELECT version, data_json, checksum, updated_at
                     FROM state_versions WHERE state_id = ?1 AND version = ?2",
                    params![state_id, v as i64],
                    read_version_row,
                )
                .optional(),
            None => conn
                .query_row(
                    "SELECT v.version, v.data_json, v.checksum, v.updated_at
                     FROM state_versions v
                     JOIN state_heads h ON h.state_id = v.state_id AND h.version = v.version
                     WHERE v.state_id = ?1",
                    params![state_id],
                    read_version_row,
                )
                .optional(),
        }
        .map_err(db_err("Failed to load state"))?;

        let Some((version, data_json, checksum, updated_at)) = row else {
            return Ok(None);
        };

        let actual = compute_checksum(&data_json);
        if actual != checksum {
            warn!(
                state_id,
                version,
                stored = %checksum,
                computed = %actual,
                "State checksum mismatch, data may be corrupted"
            );
        }

        let data: StateData = serde_json::from_str(&data_json)?;
        Ok(Some(AgentState {
            state_id: state_id.to_string(),
            version,
            updated_at: parse_ts(&updated_at),
            checksum,
            data,
        }))
    }

    /// Recompute the checksum of a stored version. `None` if it does not exist.
    pub fn verify_state(&self, state_id: &str, version: u64) -> Result<Option<bool>> {
        let conn = sqlite::lock(&self.conn)?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT data_json, checksum FROM state_versions WHERE state_id = ?1 AND version = ?2",
                params![state_id, version as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err("Failed to read state"))?;
        Ok(row.map(|(data, checksum)| compute_checksum(&data) == checksum))
    }

    /// Metadata of the latest version, without deserializing the payload.
    pub fn load_state_summary(&self, state_id: &str) -> Result<Option<StateSummary>> {
        let conn = sqlite::lock(&self.conn)?;
        conn.query_row(
            "SELECT h.state_id, h.scope, h.version, h.updated_at, v.checksum, LENGTH(v.data_json),
                    EXISTS(SELECT 1 FROM state_backups b WHERE b.state_id = h.state_id)
             FROM state_heads h
             JOIN state_versions v ON v.state_id = h.state_id AND v.version = h.version
             WHERE h.state_id = ?1",
            params![state_id],
            read_summary_row,
        )
        .optional()
        .map_err(db_err("Failed to load state summary"))
    }

    /// Summaries of all stored states, most recently updated first.
    pub fn list_states(&self, scope: Option<StateScope>) -> Result<Vec<StateSummary>> {
        let conn = sqlite::lock(&self.conn)?;
        let mut stmt = conn
            .prepare(
                "SELECT h.state_id, h.scope, h.version, h.updated_at, v.checksum, LENGTH(v.data_json),
                        EXISTS(SELECT 1 FROM state_backups b WHERE b.state_id = h.state_id)
                 FROM state_heads h
                 JOIN state_versions v ON v.state_id = h.state_id AND v.version = h.version
                 WHERE (?1 IS NULL OR h.scope = ?1)
                 ORDER BY h.updated_at DESC, h.state_id",
            )
            .map_err(db_err("Failed to prepare query"))?;

        let rows = stmt
            .query_map(params![scope.map(|s| s.as_str())], read_summary_row)
            .map_err(db_err("Failed to list states"))?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row.map_err(db_err("Failed to read state summary"))?);
        }
        Ok(summaries)
    }

    /// Every stored version number for `state_id`, ascending.
    pub fn list_versions(&self, state_id: &str) -> Result<Vec<u64>> {
        let conn = sqlite::lock(&self.conn)?;
        let mut stmt = conn
            .prepare("SELECT version FROM state_versions WHERE state_id = ?1 ORDER BY version")
            .map_err(db_err("Failed to prepare query"))?;
        let rows = stmt
            .query_map(params![state_id], |row| row.get::<_, i64>(0))
            .map_err(db_err("Failed to list versions"))?;

        let mut versions = Vec::new();
        for row in rows {
            versions.push(row.map_err(db_err("Failed to read version"))? as u64);
        }
        Ok(versions)
    }

    /// Delete a state with its history and backup. Returns false if it did not exist.
    pub fn delete_state(&self, state_id: &str) -> Result<bool> {
        let mut conn = sqlite::lock(&self.conn)?;
        let tx = conn
            .transaction()
            .map_err(db_err("Failed to begin transaction"))?;
        let deleted = tx
            .execute("DELETE FROM state_heads WHERE state_id = ?1", params![state_id])
            .map_err(db_err("Failed to delete state"))?;
        tx.execute("DELETE FROM state_versions WHERE state_id = ?1", params![state_id])
            .map_err(db_err("Failed to delete state history"))?;
        tx.execute("DELETE FROM state_backups WHERE state_id = ?1", params![state_id])
            .map_err(db_err("Failed to delete state backup"))?;
        tx.commit().map_err(db_err("Failed to commit delete"))?;

        if deleted > 0 {
            info!(state_id, "State deleted");
        }
        Ok(deleted > 0)
    }

    /// Revert `state_id` to its most recent backup.
    ///
    /// The backup's data is written as a new head version, so history stays
    /// monotonic. Returns `None` when there is no backup.
    pub fn restore_state(&self, state_id: &str) -> Result<Option<AgentState>> {
        let (head, backup_version, data_json) = {
            let conn = sqlite::lock(&self.conn)?;
            let backup: Option<(i64, String)> = conn
                .query_row(
                    "SELECT version, data_json FROM state_backups WHERE state_id = ?1",
                    params![state_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(db_err("Failed to read backup"))?;
            let Some((backup_version, data_json)) = backup else {
                return Ok(None);
            };
            let head: i64 = conn
                .query_row(
                    "SELECT version FROM state_heads WHERE state_id = ?1",
                    params![state_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err("Failed to read state head"))?
                .unwrap_or(0);
            (head as u64, backup_version as u64, data_json)
        };

        let data: StateData = serde_json::from_str(&data_json)?;
        let mut state = AgentState::new(state_id, data);
        state.version = head;
        self.save_state(&mut state, SaveOptions::default())?;

        info!(
            state_id,
            restored_from = backup_version,
            new_version = state.version,
            "State restored from backup"
        );
        Ok(Some(state))
    }
}

fn conflict(state_id: &str, expected: u64, actual: u64) -> WeftError {
    WeftError::VersionConflict {
        state_id: state_id.to_string(),
        expected,
        actual,
    }
}

fn compute_checksum(data: &str) -> String {
    format!("{:x}", Sha256::digest(data.as_bytes()))
}

fn read_version_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(u64, String, String, String)> {
    Ok((
        row.get::<_, i64>(0)? as u64,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
    ))
}

fn read_summary_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateSummary> {
    let scope: String = row.get(1)?;
    let updated_at: String = row.get(3)?;
    Ok(StateSummary {
        state_id: row.get(0)?,
        scope: scope.parse().unwrap_or(StateScope::Workflow),
        version: row.get::<_, i64>(2)? as u64,
        updated_at: parse_ts(&updated_at),
        checksum: row.get(4)?,
        size_bytes: row.get::<_, i64>(5)? as u64,
        has_backup: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use weft_core::types::ExecutionSnapshot;

    fn temp_repo() -> StateRepository {
        let dir = std::env::temp_dir().join(format!("weft_state_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        StateRepository::open(&dir.join("state.db")).unwrap()
    }

    fn agent_state(id: &str, step: &str) -> AgentState {
        AgentState::new(
            id,
            StateData::Execution(ExecutionSnapshot {
                agent_id: "researcher".into(),
                execution_id: Some("exec-1".into()),
                step_id: Some(step.into()),
                context: serde_json::json!({ "step": step }),
            }),
        )
    }

    fn step_of(state: &AgentState) -> String {
        match &state.data {
            StateData::Execution(snap) => snap.step_id.clone().unwrap(),
            StateData::Workflow(_) => panic!("expected execution snapshot"),
        }
    }

    #[test]
    fn test_versions_increment_and_history_is_exact() {
        let repo = temp_repo();
        let mut state = agent_state("agent:researcher", "s0");

        for i in 1..=5u64 {
            if let StateData::Execution(snap) = &mut state.data {
                snap.step_id = Some(format!("s{}", i));
            }
            repo.save_state(&mut state, SaveOptions::default()).unwrap();
            assert_eq!(state.version, i);
        }

        for k in 1..=5u64 {
            let loaded = repo.load_state("agent:researcher", Some(k)).unwrap().unwrap();
            assert_eq!(loaded.version, k);
            assert_eq!(step_of(&loaded), format!("s{}", k));
        }

        let latest = repo.load_state("agent:researcher", None).unwrap().unwrap();
        assert_eq!(latest.version, 5);
        assert_eq!(repo.list_versions("agent:researcher").unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_stale_save_is_rejected_and_leaves_state_unchanged() {
        let repo = StateRepository::in_memory().unwrap();
        let mut state = agent_state("agent:a", "s1");
        repo.save_state(&mut state, SaveOptions::default()).unwrap();

        let mut first = repo.load_state("agent:a", None).unwrap().unwrap();
        let mut second = repo.load_state("agent:a", None).unwrap().unwrap();

        if let StateData::Execution(snap) = &mut first.data {
            snap.step_id = Some("first".into());
        }
        if let StateData::Execution(snap) = &mut second.data {
            snap.step_id = Some("second".into());
        }

        repo.save_state(&mut first, SaveOptions::default()).unwrap();
        assert_eq!(first.version, 2);

        let err = repo.save_state(&mut second, SaveOptions::default()).unwrap_err();
        match err {
            WeftError::VersionConflict { expected, actual, .. } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected version conflict, got {other}"),
        }
        assert_eq!(second.version, 1);

        let stored = repo.load_state("agent:a", None).unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(step_of(&stored), "first");
    }

    #[test]
    fn test_new_state_must_start_at_zero() {
        let repo = StateRepository::in_memory().unwrap();
        let mut state = agent_state("agent:new", "s1");
        state.version = 3;
        let err = repo.save_state(&mut state, SaveOptions::default()).unwrap_err();
        assert!(err.is_version_conflict());
        assert!(repo.load_state("agent:new", None).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_savers_only_one_wins() {
        let repo = Arc::new(temp_repo());
        let mut seed = agent_state("agent:shared", "seed");
        repo.save_state(&mut seed, SaveOptions::default()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let repo = Arc::clone(&repo);
                let mut state = seed.clone();
                std::thread::spawn(move || {
                    if let StateData::Execution(snap) = &mut state.data {
                        snap.step_id = Some(format!("writer-{}", i));
                    }
                    repo.save_state(&mut state, SaveOptions::default()).is_ok()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(repo.load_state("agent:shared", None).unwrap().unwrap().version, 2);
    }

    #[test]
    fn test_checksum_mismatch_is_logged_not_fatal() {
        let repo = StateRepository::in_memory().unwrap();
        let mut state = agent_state("agent:c", "s1");
        repo.save_state(&mut state, SaveOptions::default()).unwrap();
        assert_eq!(repo.verify_state("agent:c", 1).unwrap(), Some(true));

        {
            let conn = repo.conn.lock().unwrap();
            conn.execute(
                "UPDATE state_versions SET checksum = 'deadbeef' WHERE state_id = 'agent:c'",
                [],
            )
            .unwrap();
        }

        assert_eq!(repo.verify_state("agent:c", 1).unwrap(), Some(false));
        let loaded = repo.load_state("agent:c", None).unwrap();
        assert!(loaded.is_some());
        assert_eq!(repo.verify_state("agent:c", 9).unwrap(), None);
    }

    #[test]
    fn test_summary_list_and_delete() {
        let repo = StateRepository::in_memory().unwrap();
        let mut a = agent_state("agent:a", "s1");
        repo.save_state(&mut a, SaveOptions::default()).unwrap();

        let summary = repo.load_state_summary("agent:a").unwrap().unwrap();
        assert_eq!(summary.version, 1);
        assert_eq!(summary.scope, StateScope::Agent);
        assert_eq!(summary.checksum, a.checksum);
        assert!(summary.size_bytes > 0);
        assert!(!summary.has_backup);

        assert_eq!(repo.list_states(None).unwrap().len(), 1);
        assert_eq!(repo.list_states(Some(StateScope::Agent)).unwrap().len(), 1);
        assert!(repo.list_states(Some(StateScope::Workflow)).unwrap().is_empty());

        assert!(repo.delete_state("agent:a").unwrap());
        assert!(!repo.delete_state("agent:a").unwrap());
        assert!(repo.load_state("agent:a", None).unwrap().is_none());
        assert!(repo.load_state_summary("agent:a").unwrap().is_none());
    }

    #[test]
    fn test_backup_and_restore() {
        let repo = StateRepository::in_memory().unwrap();
        let mut state = agent_state("agent:b", "good");
        repo.save_state(&mut state, SaveOptions::default()).unwrap();

        // No backup yet
        assert!(repo.restore_state("agent:b").unwrap().is_none());

        if let StateData::Execution(snap) = &mut state.data {
            snap.step_id = Some("bad".into());
        }
        repo.save_state(&mut state, SaveOptions::with_backup()).unwrap();
        assert_eq!(state.version, 2);
        assert!(repo.load_state_summary("agent:b").unwrap().unwrap().has_backup);

        let restored = repo.restore_state("agent:b").unwrap().unwrap();
        assert_eq!(restored.version, 3);
        assert_eq!(step_of(&restored), "good");

        let latest = repo.load_state("agent:b", None).unwrap().unwrap();
        assert_eq!(latest.version, 3);
        assert_eq!(step_of(&latest), "good");
        // History is preserved
        let v2 = repo.load_state("agent:b", Some(2)).unwrap().unwrap();
        assert_eq!(step_of(&v2), "bad");
    }
}
