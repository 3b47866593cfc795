pub mod command;
pub mod script;
pub mod step;
pub mod workflow;

pub use command::CommandAgentExecutor;
pub use script::ProcessScriptRunner;
pub use step::{StepExecutor, StepOutcome};
pub use workflow::WorkflowExecutor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use weft_core::audit::{AuditLogger, TracingAuditLogger};
use weft_core::config::{ExecutorConfig, RetryConfig, WeftConfig};
use weft_core::definition::{WorkflowDefinition, WorkflowStep};
use weft_core::error::Result;
use weft_core::traits::{AgentDiscovery, AgentExecutor, ApprovalGate, ScriptRunner};
use weft_core::types::WorkflowEvent;
use weft_core::EventBus;
use weft_store::{DeadLetterQueue, EventLog, HandoffRegistry, StateRepository};

use crate::circuit_breaker::CircuitBreakerRegistry;

/// Everything the executors talk to, shared by `Arc`.
pub struct Services {
    pub agents: Arc<dyn AgentExecutor>,
    pub discovery: Arc<dyn AgentDiscovery>,
    pub scripts: Arc<dyn ScriptRunner>,
    pub approvals: Option<Arc<dyn ApprovalGate>>,
    pub state: Arc<StateRepository>,
    pub dead_letters: Arc<DeadLetterQueue>,
    pub handoffs: Arc<HandoffRegistry>,
    pub events: Arc<EventLog>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub audit: Arc<dyn AuditLogger>,
    pub retry: RetryConfig,
    pub executor: ExecutorConfig,
}

impl Services {
    /// Open the SQLite stores under the configured data directory.
    pub fn open(
        config: &WeftConfig,
        agents: Arc<dyn AgentExecutor>,
        discovery: Arc<dyn AgentDiscovery>,
    ) -> Result<Self> {
        let dir = config.data_dir();
        std::fs::create_dir_all(&dir)?;
        debug!(data_dir = %dir.display(), "Opening stores");

        let bus = Arc::new(EventBus::new(config.event_log.broadcast_capacity));
        Ok(Self {
            agents,
            discovery,
            scripts: Arc::new(ProcessScriptRunner::new(
                config.executor.script_interpreter.clone(),
            )),
            approvals: None,
            state: Arc::new(StateRepository::open(&dir.join("state.db"))?),
            dead_letters: Arc::new(DeadLetterQueue::open(&dir.join("dead_letter.db"))?),
            handoffs: Arc::new(HandoffRegistry::open(&dir.join("handoffs.db"))?),
            events: Arc::new(EventLog::open(&dir.join("events.db"))?.with_bus(bus)),
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            audit: Arc::new(TracingAuditLogger),
            retry: config.retry.clone(),
            executor: config.executor.clone(),
        })
    }

    /// Same wiring as [`open`](Self::open) with in-memory stores.
    pub fn in_memory(
        config: &WeftConfig,
        agents: Arc<dyn AgentExecutor>,
        discovery: Arc<dyn AgentDiscovery>,
    ) -> Result<Self> {
        let bus = Arc::new(EventBus::new(config.event_log.broadcast_capacity));
        Ok(Self {
            agents,
            discovery,
            scripts: Arc::new(ProcessScriptRunner::new(
                config.executor.script_interpreter.clone(),
            )),
            approvals: None,
            state: Arc::new(StateRepository::in_memory()?),
            dead_letters: Arc::new(DeadLetterQueue::in_memory()?),
            handoffs: Arc::new(HandoffRegistry::in_memory()?),
            events: Arc::new(EventLog::in_memory()?.with_bus(bus)),
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            audit: Arc::new(TracingAuditLogger),
            retry: config.retry.clone(),
            executor: config.executor.clone(),
        })
    }

    pub fn with_scripts(mut self, scripts: Arc<dyn ScriptRunner>) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<dyn ApprovalGate>) -> Self {
        self.approvals = Some(approvals);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Append an event. A failed append is logged, never returned.
    pub fn emit(&self, event: WorkflowEvent) {
        let event_type = event.event_type;
        if let Err(e) = self.events.append(event) {
            warn!(event_type = %event_type, error = %e, "Failed to append event");
        }
    }
}

/// Cooperative control over a running execution.
///
/// Both signals are observed before each step is dispatched; a step that is
/// already running finishes first.
#[derive(Debug, Clone, Default)]
pub struct ExecutionControl {
    cancel: CancellationToken,
    pause: Arc<AtomicBool>,
}

impl ExecutionControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    /// Consume a pending pause request.
    pub(crate) fn take_pause(&self) -> bool {
        self.pause.swap(false, Ordering::SeqCst)
    }
}

/// Retry and timeout settings resolved for one definition.
#[derive(Debug, Clone)]
pub struct StepPolicy {
    pub retry: RetryConfig,
    pub default_timeout_secs: u64,
}

impl StepPolicy {
    /// Definition overrides layered on the global config.
    pub fn for_definition(
        definition: &WorkflowDefinition,
        retry: &RetryConfig,
        executor: &ExecutorConfig,
    ) -> Self {
        let policy = &definition.error_handling;
        Self {
            retry: policy
                .retry
                .as_ref()
                .map(|r| r.apply_to(retry))
                .unwrap_or_else(|| retry.clone()),
            default_timeout_secs: policy
                .step_timeout_secs
                .unwrap_or(executor.step_timeout_secs),
        }
    }

    /// Step override, else the definition/config default.
    pub fn timeout_secs(&self, step: &WorkflowStep) -> u64 {
        step.timeout_secs.unwrap_or(self.default_timeout_secs)
    }

    pub fn timeout(&self, step: &WorkflowStep) -> Duration {
        Duration::from_secs(self.timeout_secs(step))
    }
}
