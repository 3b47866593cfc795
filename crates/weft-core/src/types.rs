use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::{HandoffKind, StepKind, WorkflowDefinition, WorkflowStep};
use crate::error::{Result, WeftError};

/// Unique execution identifier, also used as the event correlation id.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Execution ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Allowed edges of the execution state machine.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step or phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime record of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: String,
    pub kind: StepKind,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl StepExecution {
    pub fn new(step: &WorkflowStep) -> Self {
        Self {
            step_id: step.id.clone(),
            kind: step.kind,
            agent_id: step.agent_id().map(String::from),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            output: serde_json::Value::Null,
            error: None,
            retry_count: 0,
        }
    }

    pub fn start(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.error = None;
    }

    pub fn complete(&mut self, output: serde_json::Value) {
        self.status = StepStatus::Completed;
        self.output = output;
        self.finish();
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.finish();
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64);
    }

    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// Runtime record of one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseExecution {
    pub phase_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub steps: Vec<StepExecution>,
}

impl PhaseExecution {
    pub fn start(&mut self) {
        self.status = StepStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn finish(&mut self, status: StepStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64);
    }
}

/// One run of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub workflow_version: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub input: serde_json::Value,
    pub phases: Vec<PhaseExecution>,
    #[serde(default)]
    pub current_phase_id: Option<String>,
    #[serde(default)]
    pub current_step_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkflowExecution {
    /// Create a pending execution mirroring the definition's structure.
    pub fn new(definition: &WorkflowDefinition, input: serde_json::Value) -> Self {
        let phases = definition
            .phases
            .iter()
            .map(|phase| PhaseExecution {
                phase_id: phase.id.clone(),
                status: StepStatus::Pending,
                started_at: None,
                completed_at: None,
                duration_ms: None,
                steps: phase.steps.iter().map(StepExecution::new).collect(),
            })
            .collect();

        Self {
            execution_id: ExecutionId::new(),
            workflow_id: definition.id.clone(),
            workflow_version: definition.version().to_string(),
            status: ExecutionStatus::Pending,
            input,
            phases,
            current_phase_id: None,
            current_step_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Move to `next`, rejecting edges the state machine does not allow.
    pub fn transition_to(&mut self, next: ExecutionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(WeftError::InvalidStatus(format!(
                "execution {} cannot move from {} to {}",
                self.execution_id, self.status, next
            )));
        }
        let now = Utc::now();
        if next == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    pub fn state_id(&self) -> String {
        format!("workflow:{}", self.execution_id)
    }

    pub fn step(&self, step_id: &str) -> Option<&StepExecution> {
        self.phases
            .iter()
            .flat_map(|p| p.steps.iter())
            .find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepExecution> {
        self.phases
            .iter_mut()
            .flat_map(|p| p.steps.iter_mut())
            .find(|s| s.step_id == step_id)
    }

    pub fn phase_mut(&mut self, phase_id: &str) -> Option<&mut PhaseExecution> {
        self.phases.iter_mut().find(|p| p.phase_id == phase_id)
    }

    /// Outputs of every step that has finished, keyed by step id.
    pub fn step_outputs(&self) -> Vec<(&str, &StepExecution)> {
        self.phases
            .iter()
            .flat_map(|p| p.steps.iter())
            .filter(|s| matches!(s.status, StepStatus::Completed | StepStatus::Failed))
            .map(|s| (s.step_id.as_str(), s))
            .collect()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(s), Some(e)) => Some((e - s).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

// ── Persisted state ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateScope {
    Agent,
    Workflow,
}

impl StateScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateScope::Agent => "agent",
            StateScope::Workflow => "workflow",
        }
    }
}

impl std::str::FromStr for StateScope {
    type Err = WeftError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "agent" => Ok(StateScope::Agent),
            "workflow" => Ok(StateScope::Workflow),
            other => Err(WeftError::InvalidStatus(format!("unknown state scope '{}'", other))),
        }
    }
}

/// Agent-scoped execution snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub agent_id: String,
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateData {
    Execution(ExecutionSnapshot),
    Workflow(WorkflowExecution),
}

impl StateData {
    pub fn scope(&self) -> StateScope {
        match self {
            StateData::Execution(_) => StateScope::Agent,
            StateData::Workflow(_) => StateScope::Workflow,
        }
    }
}

/// A versioned, checksummed state snapshot.
///
/// `version` is the version this value was read at (0 for a state that has
/// never been saved). A successful save bumps it by exactly one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub state_id: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub checksum: String,
    pub data: StateData,
}

impl AgentState {
    pub fn new(state_id: impl Into<String>, data: StateData) -> Self {
        Self {
            state_id: state_id.into(),
            version: 0,
            updated_at: Utc::now(),
            checksum: String::new(),
            data,
        }
    }

    /// Wrap a workflow execution under its canonical state id.
    pub fn for_execution(execution: &WorkflowExecution) -> Self {
        Self::new(execution.state_id(), StateData::Workflow(execution.clone()))
    }

    pub fn scope(&self) -> StateScope {
        self.data.scope()
    }

    pub fn execution(&self) -> Option<&WorkflowExecution> {
        match &self.data {
            StateData::Workflow(exec) => Some(exec),
            StateData::Execution(_) => None,
        }
    }
}

/// Metadata about a stored state, without its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSummary {
    pub state_id: String,
    pub scope: StateScope,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub checksum: String,
    pub size_bytes: u64,
    pub has_backup: bool,
}

// ── Handoffs ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Pending,
    Accepted,
    InProgress,
    Complete,
    Rejected,
    Failed,
}

impl HandoffStatus {
    pub const ALL: [HandoffStatus; 6] = [
        HandoffStatus::Pending,
        HandoffStatus::Accepted,
        HandoffStatus::InProgress,
        HandoffStatus::Complete,
        HandoffStatus::Rejected,
        HandoffStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffStatus::Pending => "pending",
            HandoffStatus::Accepted => "accepted",
            HandoffStatus::InProgress => "in_progress",
            HandoffStatus::Complete => "complete",
            HandoffStatus::Rejected => "rejected",
            HandoffStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for HandoffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HandoffStatus {
    type Err = WeftError;

    fn from_str(s: &str) -> Result<Self> {
        HandoffStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| WeftError::InvalidStatus(format!("unknown handoff status '{}'", s)))
    }
}

/// Structured transfer of work from one agent/step to the next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub handoff_id: String,
    pub from_agent: String,
    pub to_agent: String,
    /// Set when the handoff target named a step rather than an agent.
    #[serde(default)]
    pub to_step: Option<String>,
    pub execution_id: String,
    pub workflow_id: String,
    pub step_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: HandoffKind,
    pub status: HandoffStatus,
    pub work_summary: String,
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandoffStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
}

// ── Errors & dead letters ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Timeout,
    RateLimit,
    Network,
    UserError,
    Permanent,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::RateLimit => "RATE_LIMIT",
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::UserError => "USER_ERROR",
            ErrorCategory::Permanent => "PERMANENT",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = WeftError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TIMEOUT" => Ok(ErrorCategory::Timeout),
            "RATE_LIMIT" => Ok(ErrorCategory::RateLimit),
            "NETWORK" => Ok(ErrorCategory::Network),
            "USER_ERROR" => Ok(ErrorCategory::UserError),
            "PERMANENT" => Ok(ErrorCategory::Permanent),
            "UNKNOWN" => Ok(ErrorCategory::Unknown),
            other => Err(WeftError::InvalidStatus(format!("unknown error category '{}'", other))),
        }
    }
}

/// A failure mapped onto the error taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub retryable: bool,
    /// Suggested minimum wait before retrying, in seconds.
    pub retry_after_secs: f64,
    pub message: String,
}

/// One failed attempt inside a retry sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub category: ErrorCategory,
    pub error: String,
    /// Backoff slept after this attempt, if another attempt followed.
    #[serde(default)]
    pub delay_secs: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// A task that exhausted its retries or failed permanently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTask {
    pub task_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub workflow_id: Option<String>,
    pub error: ClassifiedError,
    pub attempts: u32,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
    pub failed_at: DateTime<Utc>,
    pub can_retry: bool,
}

// ── Events ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    WorkflowPaused,
    WorkflowResumed,
    PhaseStarted,
    PhaseCompleted,
    PhaseFailed,
    StepStarted,
    StepCompleted,
    StepFailed,
    HandoffCreated,
    TaskDeadLettered,
}

impl EventType {
    pub const ALL: [EventType; 14] = [
        EventType::WorkflowStarted,
        EventType::WorkflowCompleted,
        EventType::WorkflowFailed,
        EventType::WorkflowCancelled,
        EventType::WorkflowPaused,
        EventType::WorkflowResumed,
        EventType::PhaseStarted,
        EventType::PhaseCompleted,
        EventType::PhaseFailed,
        EventType::StepStarted,
        EventType::StepCompleted,
        EventType::StepFailed,
        EventType::HandoffCreated,
        EventType::TaskDeadLettered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WorkflowStarted => "workflow_started",
            EventType::WorkflowCompleted => "workflow_completed",
            EventType::WorkflowFailed => "workflow_failed",
            EventType::WorkflowCancelled => "workflow_cancelled",
            EventType::WorkflowPaused => "workflow_paused",
            EventType::WorkflowResumed => "workflow_resumed",
            EventType::PhaseStarted => "phase_started",
            EventType::PhaseCompleted => "phase_completed",
            EventType::PhaseFailed => "phase_failed",
            EventType::StepStarted => "step_started",
            EventType::StepCompleted => "step_completed",
            EventType::StepFailed => "step_failed",
            EventType::HandoffCreated => "handoff_created",
            EventType::TaskDeadLettered => "task_dead_lettered",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = WeftError;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| WeftError::InvalidStatus(format!("unknown event type '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Success,
    Failure,
    Info,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Started => "started",
            EventStatus::Success => "success",
            EventStatus::Failure => "failure",
            EventStatus::Info => "info",
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = WeftError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "started" => Ok(EventStatus::Started),
            "success" => Ok(EventStatus::Success),
            "failure" => Ok(EventStatus::Failure),
            "info" => Ok(EventStatus::Info),
            other => Err(WeftError::InvalidStatus(format!("unknown event status '{}'", other))),
        }
    }
}

/// An append-only execution event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Position in the log; assigned on append (0 before).
    #[serde(default)]
    pub seq: u64,
    pub event_id: String,
    pub event_type: EventType,
    /// Groups the events of one execution.
    pub correlation_id: String,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: EventStatus,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WorkflowEvent {
    pub fn new(event_type: EventType, correlation_id: impl Into<String>) -> Self {
        Self {
            seq: 0,
            event_id: Uuid::new_v4().to_string(),
            event_type,
            correlation_id: correlation_id.into(),
            workflow_id: None,
            step_id: None,
            agent_id: None,
            timestamp: Utc::now(),
            status: EventStatus::Info,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: Option<&str>) -> Self {
        self.agent_id = agent_id.map(String::from);
        self
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
