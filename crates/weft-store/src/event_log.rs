//! Append-only execution event log.
//!
//! Events are persisted before they are broadcast, so a subscriber never
//! sees an event that a later query could miss. The table refuses updates
//! and deletes at the storage level.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use weft_core::error::Result;
use weft_core::event::EventBus;
use weft_core::types::{EventType, ExecutionStatus, StepStatus, WorkflowEvent};

use crate::sqlite::{self, db_err, fmt_ts, parse_ts};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS events (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id TEXT NOT NULL UNIQUE,
        event_type TEXT NOT NULL,
        correlation_id TEXT NOT NULL,
        workflow_id TEXT,
        step_id TEXT,
        agent_id TEXT,
        timestamp TEXT NOT NULL,
        status TEXT NOT NULL,
        payload_json TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_events_correlation ON events(correlation_id, seq);
    CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);

    CREATE TRIGGER IF NOT EXISTS events_no_update
    BEFORE UPDATE ON events
    BEGIN
        SELECT RAISE(ABORT, 'events are append-only');
    END;

    CREATE TRIGGER IF NOT EXISTS events_no_delete
    BEFORE DELETE ON events
    BEGIN
        SELECT RAISE(ABORT, 'events are append-only');
    END;";

/// Filters for [`EventLog::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub correlation_id: Option<String>,
    pub event_type: Option<EventType>,
    pub agent_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn for_correlation(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Default::default()
        }
    }
}

/// Final state of one step as reconstructed from events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReplay {
    pub step_id: String,
    pub status: StepStatus,
    /// Number of `step_started` events seen for this step.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Result of folding an execution's events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub correlation_id: String,
    pub workflow_id: Option<String>,
    /// Last workflow-level status seen; `None` if no workflow event exists.
    pub status: Option<ExecutionStatus>,
    /// Steps in the order they first appeared.
    pub steps: Vec<StepReplay>,
    pub event_count: usize,
}

pub struct EventLog {
    conn: Mutex<Connection>,
    bus: Option<Arc<EventBus>>,
}

impl EventLog {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = sqlite::open(path, SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            bus: None,
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(sqlite::open_in_memory(SCHEMA)?),
            bus: None,
        })
    }

    /// Broadcast every appended event on `bus`.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn bus(&self) -> Option<&Arc<EventBus>> {
        self.bus.as_ref()
    }

    /// Persist `event`, assigning its sequence number and timestamp.
    ///
    /// Appends are serialized, so sequence order and timestamp order agree.
    pub fn append(&self, mut event: WorkflowEvent) -> Result<WorkflowEvent> {
        let payload_json = serde_json::to_string(&event.payload)?;
        {
            let conn = sqlite::lock(&self.conn)?;
            event.timestamp = Utc::now();
            conn.execute(
                "INSERT INTO events
                 (event_id, event_type, correlation_id, workflow_id, step_id, agent_id, timestamp, status, payload_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.event_id,
                    event.event_type.as_str(),
                    event.correlation_id,
                    event.workflow_id,
                    event.step_id,
                    event.agent_id,
                    fmt_ts(&event.timestamp),
                    event.status.as_str(),
                    payload_json,
                ],
            )
            .map_err(db_err("Failed to append event"))?;
            event.seq = conn.last_insert_rowid() as u64;
        }

        trace!(
            seq = event.seq,
            event_type = %event.event_type,
            correlation_id = %event.correlation_id,
            "Event appended"
        );

        if let Some(bus) = &self.bus {
            bus.publish(event.clone());
        }
        Ok(event)
    }

    /// Events matching `query`, in append order.
    pub fn query(&self, query: &EventQuery) -> Result<Vec<WorkflowEvent>> {
        let conn = sqlite::lock(&self.conn)?;
        let mut stmt = conn
            .prepare(
                "SELECT seq, event_id, event_type, correlation_id, workflow_id, step_id, agent_id,
                        timestamp, status, payload_json
                 FROM events
                 WHERE (?1 IS NULL OR correlation_id = ?1)
                   AND (?2 IS NULL OR event_type = ?2)
                   AND (?3 IS NULL OR agent_id = ?3)
                   AND (?4 IS NULL OR timestamp >= ?4)
                   AND (?5 IS NULL OR timestamp <= ?5)
                 ORDER BY seq
                 LIMIT ?6",
            )
            .map_err(db_err("Failed to prepare query"))?;

        let rows = stmt
            .query_map(
                params![
                    query.correlation_id,
                    query.event_type.map(|t| t.as_str()),
                    query.agent_id,
                    query.since.as_ref().map(fmt_ts),
                    query.until.as_ref().map(fmt_ts),
                    query.limit.map(|l| l as i64).unwrap_or(-1),
                ],
                |row| {
                    Ok(RawEvent {
                        seq: row.get(0)?,
                        event_id: row.get(1)?,
                        event_type: row.get(2)?,
                        correlation_id: row.get(3)?,
                        workflow_id: row.get(4)?,
                        step_id: row.get(5)?,
                        agent_id: row.get(6)?,
                        timestamp: row.get(7)?,
                        status: row.get(8)?,
                        payload_json: row.get(9)?,
                    })
                },
            )
            .map_err(db_err("Failed to query events"))?;

        let mut events = Vec::new();
        for row in rows {
            let raw = row.map_err(db_err("Failed to read event"))?;
            events.push(raw.into_event()?);
        }
        Ok(events)
    }

    /// Every event of one execution, in append order.
    pub fn events_for(&self, correlation_id: &str) -> Result<Vec<WorkflowEvent>> {
        self.query(&EventQuery::for_correlation(correlation_id))
    }

    /// Reconstruct per-step outcomes and the workflow status from the log.
    pub fn replay(&self, correlation_id: &str) -> Result<ReplaySummary> {
        let events = self.events_for(correlation_id)?;
        debug!(correlation_id, events = events.len(), "Replaying events");
        Ok(fold_events(correlation_id, &events))
    }

    pub fn count(&self) -> Result<usize> {
        let conn = sqlite::lock(&self.conn)?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .map_err(db_err("Failed to count events"))?;
        Ok(n as usize)
    }
}

struct RawEvent {
    seq: i64,
    event_id: String,
    event_type: String,
    correlation_id: String,
    workflow_id: Option<String>,
    step_id: Option<String>,
    agent_id: Option<String>,
    timestamp: String,
    status: String,
    payload_json: String,
}

impl RawEvent {
    fn into_event(self) -> Result<WorkflowEvent> {
        Ok(WorkflowEvent {
            seq: self.seq as u64,
            event_id: self.event_id,
            event_type: self.event_type.parse()?,
            correlation_id: self.correlation_id,
            workflow_id: self.workflow_id,
            step_id: self.step_id,
            agent_id: self.agent_id,
            timestamp: parse_ts(&self.timestamp),
            status: self.status.parse()?,
            payload: serde_json::from_str(&self.payload_json)?,
        })
    }
}

/// Fold events (in append order) into a replay summary.
pub fn fold_events(correlation_id: &str, events: &[WorkflowEvent]) -> ReplaySummary {
    let mut summary = ReplaySummary {
        correlation_id: correlation_id.to_string(),
        workflow_id: None,
        status: None,
        steps: Vec::new(),
        event_count: events.len(),
    };
    let mut index: HashMap<String, usize> = HashMap::new();

    for event in events {
        if summary.workflow_id.is_none() {
            summary.workflow_id = event.workflow_id.clone();
        }

        let workflow_status = match event.event_type {
            EventType::WorkflowStarted | EventType::WorkflowResumed => Some(ExecutionStatus::Running),
            EventType::WorkflowCompleted => Some(ExecutionStatus::Completed),
            EventType::WorkflowFailed => Some(ExecutionStatus::Failed),
            EventType::WorkflowCancelled => Some(ExecutionStatus::Cancelled),
            EventType::WorkflowPaused => Some(ExecutionStatus::Paused),
            _ => None,
        };
        if workflow_status.is_some() {
            summary.status = workflow_status;
            // A step awaiting approval goes back to pending until resumed
            if event.event_type == EventType::WorkflowPaused {
                let open = event.step_id.as_deref().and_then(|id| index.get(id));
                if let Some(&pos) = open {
                    if summary.steps[pos].status == StepStatus::Running {
                        summary.steps[pos].status = StepStatus::Pending;
                    }
                }
            }
            continue;
        }

        let Some(step_id) = event.step_id.as_deref() else {
            continue;
        };
        if !matches!(
            event.event_type,
            EventType::StepStarted | EventType::StepCompleted | EventType::StepFailed
        ) {
            continue;
        }

        let pos = *index.entry(step_id.to_string()).or_insert_with(|| {
            summary.steps.push(StepReplay {
                step_id: step_id.to_string(),
                status: StepStatus::Pending,
                attempts: 0,
                last_error: None,
                duration_ms: None,
            });
            summary.steps.len() - 1
        });
        let step = &mut summary.steps[pos];

        match event.event_type {
            EventType::StepStarted => {
                step.status = StepStatus::Running;
                step.attempts += 1;
            }
            EventType::StepCompleted => {
                step.status = StepStatus::Completed;
                step.duration_ms = event.payload.get("duration_ms").and_then(|v| v.as_u64());
            }
            EventType::StepFailed => {
                step.status = StepStatus::Failed;
                step.duration_ms = event.payload.get("duration_ms").and_then(|v| v.as_u64());
                step.last_error = event
                    .payload
                    .get("error")
                    .and_then(|v| v.as_str())
                    .map(String::from);
            }
            _ => {}
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::types::EventStatus;

    fn step_event(kind: EventType, corr: &str, step: &str) -> WorkflowEvent {
        let status = match kind {
            EventType::StepStarted => EventStatus::Started,
            EventType::StepCompleted => EventStatus::Success,
            _ => EventStatus::Failure,
        };
        WorkflowEvent::new(kind, corr)
            .with_workflow("wf")
            .with_step(step)
            .with_status(status)
    }

    #[test]
    fn test_append_assigns_increasing_seq() {
        let log = EventLog::in_memory().unwrap();
        let a = log.append(WorkflowEvent::new(EventType::WorkflowStarted, "e1")).unwrap();
        let b = log.append(WorkflowEvent::new(EventType::StepStarted, "e1")).unwrap();
        assert!(b.seq > a.seq);
        assert!(b.timestamp >= a.timestamp);
        assert_eq!(log.count().unwrap(), 2);
    }

    #[test]
    fn test_events_cannot_be_modified() {
        let log = EventLog::in_memory().unwrap();
        log.append(WorkflowEvent::new(EventType::WorkflowStarted, "e1")).unwrap();
        let conn = log.conn.lock().unwrap();
        assert!(conn.execute("UPDATE events SET status = 'info'", []).is_err());
        assert!(conn.execute("DELETE FROM events", []).is_err());
    }

    #[test]
    fn test_query_filters() {
        let log = EventLog::in_memory().unwrap();
        log.append(step_event(EventType::StepStarted, "e1", "a").with_agent(Some("researcher")))
            .unwrap();
        log.append(step_event(EventType::StepCompleted, "e1", "a").with_agent(Some("researcher")))
            .unwrap();
        log.append(step_event(EventType::StepStarted, "e2", "b").with_agent(Some("writer")))
            .unwrap();

        assert_eq!(log.events_for("e1").unwrap().len(), 2);
        let started = log
            .query(&EventQuery {
                event_type: Some(EventType::StepStarted),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(started.len(), 2);

        let writer = log
            .query(&EventQuery {
                agent_id: Some("writer".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(writer.len(), 1);
        assert_eq!(writer[0].correlation_id, "e2");

        let limited = log
            .query(&EventQuery {
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].event_type, EventType::StepStarted);

        let future = log
            .query(&EventQuery {
                since: Some(Utc::now() + chrono::Duration::hours(1)),
                ..Default::default()
            })
            .unwrap();
        assert!(future.is_empty());
    }

    #[test]
    fn test_payload_round_trips() {
        let log = EventLog::in_memory().unwrap();
        log.append(
            WorkflowEvent::new(EventType::StepFailed, "e1")
                .with_step("a")
                .with_payload(serde_json::json!({ "error": "boom", "duration_ms": 12 })),
        )
        .unwrap();
        let events = log.events_for("e1").unwrap();
        assert_eq!(events[0].payload["error"], "boom");
    }

    #[test]
    fn test_replay_reconstructs_outcomes() {
        let log = EventLog::in_memory().unwrap();
        log.append(WorkflowEvent::new(EventType::WorkflowStarted, "e1").with_workflow("wf"))
            .unwrap();
        log.append(step_event(EventType::StepStarted, "e1", "a")).unwrap();
        log.append(
            step_event(EventType::StepCompleted, "e1", "a")
                .with_payload(serde_json::json!({ "duration_ms": 40 })),
        )
        .unwrap();
        log.append(step_event(EventType::StepStarted, "e1", "b")).unwrap();
        log.append(
            step_event(EventType::StepFailed, "e1", "b")
                .with_payload(serde_json::json!({ "error": "agent crashed" })),
        )
        .unwrap();
        log.append(WorkflowEvent::new(EventType::WorkflowFailed, "e1")).unwrap();

        let summary = log.replay("e1").unwrap();
        assert_eq!(summary.workflow_id.as_deref(), Some("wf"));
        assert_eq!(summary.status, Some(ExecutionStatus::Failed));
        assert_eq!(summary.event_count, 6);
        assert_eq!(summary.steps.len(), 2);
        assert_eq!(summary.steps[0].step_id, "a");
        assert_eq!(summary.steps[0].status, StepStatus::Completed);
        assert_eq!(summary.steps[0].duration_ms, Some(40));
        assert_eq!(summary.steps[1].status, StepStatus::Failed);
        assert_eq!(summary.steps[1].last_error.as_deref(), Some("agent crashed"));
    }

    #[test]
    fn test_replay_of_paused_step_is_pending() {
        let events = vec![
            WorkflowEvent::new(EventType::WorkflowStarted, "e1").with_workflow("wf"),
            step_event(EventType::StepStarted, "e1", "draft"),
            step_event(EventType::StepCompleted, "e1", "draft"),
            step_event(EventType::StepStarted, "e1", "approve"),
            WorkflowEvent::new(EventType::WorkflowPaused, "e1").with_step("approve"),
        ];
        let summary = fold_events("e1", &events);
        assert_eq!(summary.status, Some(ExecutionStatus::Paused));
        assert_eq!(summary.steps[0].status, StepStatus::Completed);
        assert_eq!(summary.steps[1].step_id, "approve");
        assert_eq!(summary.steps[1].status, StepStatus::Pending);

        let mut resumed = events;
        resumed.push(WorkflowEvent::new(EventType::WorkflowResumed, "e1"));
        resumed.push(step_event(EventType::StepStarted, "e1", "approve"));
        resumed.push(step_event(EventType::StepCompleted, "e1", "approve"));
        resumed.push(WorkflowEvent::new(EventType::WorkflowCompleted, "e1"));
        let summary = fold_events("e1", &resumed);
        assert_eq!(summary.status, Some(ExecutionStatus::Completed));
        assert_eq!(summary.steps[1].status, StepStatus::Completed);
        assert_eq!(summary.steps[1].attempts, 2);
    }

    #[test]
    fn test_replay_of_unknown_correlation_is_empty() {
        let log = EventLog::in_memory().unwrap();
        let summary = log.replay("nope").unwrap();
        assert_eq!(summary.event_count, 0);
        assert!(summary.status.is_none());
        assert!(summary.steps.is_empty());
    }

    #[tokio::test]
    async fn test_append_broadcasts_after_persist() {
        let bus = Arc::new(EventBus::new(16));
        let log = EventLog::in_memory().unwrap().with_bus(bus.clone());
        let mut rx = bus.subscribe();

        let appended = log.append(WorkflowEvent::new(EventType::WorkflowStarted, "e1")).unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.seq, appended.seq);
        assert_eq!(log.events_for("e1").unwrap().len(), 1);
    }
}
